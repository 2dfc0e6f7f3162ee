use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Request(#[from] RequestFailure),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// A terminal request outcome that maps onto the error body returned to the
/// caller: a stable `code`, an HTTP status, and a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RequestFailure {
    pub code: FailureCode,
    pub message: String,
}

impl RequestFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// The OpenAI-style error body. `extra` lets the caller attach routing
    /// context (`requestedProvider`, `usedModel`, `responseText`, ...).
    pub fn to_body(&self, extra: &[(&str, serde_json::Value)]) -> serde_json::Value {
        let mut error = serde_json::Map::new();
        error.insert("message".to_string(), self.message.clone().into());
        error.insert("type".to_string(), self.code.error_type().into());
        error.insert("param".to_string(), serde_json::Value::Null);
        error.insert("code".to_string(), self.code.as_str().into());
        for (key, value) in extra {
            if !value.is_null() {
                error.insert((*key).to_string(), value.clone());
            }
        }
        serde_json::json!({ "error": error })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCode {
    AuthMissing,
    AuthMalformed,
    AuthInvalid,
    InvalidRequest,
    UnsupportedModel,
    ModelProviderPrefixRequired,
    ProviderUnsupported,
    CustomProviderNotFound,
    ModelDeactivated,
    JsonOutputUnsupported,
    ReasoningUnsupported,
    StreamingUnsupported,
    MaxTokensExceedsMaxOutput,
    NoProviderKey,
    NoProviderEnv,
    CustomInCreditsMode,
    InsufficientCredits,
    NoAvailableProvider,
    UpstreamHttpError { status: u16 },
    UpstreamTransportError,
    ClientCanceled,
    ProjectNotFound,
    Internal,
}

impl FailureCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::AuthMissing | Self::AuthMalformed | Self::AuthInvalid => 401,
            Self::InsufficientCredits => 402,
            Self::ModelDeactivated => 410,
            Self::UpstreamHttpError { .. }
            | Self::UpstreamTransportError
            | Self::ProjectNotFound
            | Self::Internal => 500,
            _ => 400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::AuthMalformed => "auth_malformed",
            Self::AuthInvalid => "auth_invalid",
            Self::InvalidRequest => "invalid_request",
            Self::UnsupportedModel => "unsupported_model",
            Self::ModelProviderPrefixRequired => "model_provider_prefix_required",
            Self::ProviderUnsupported => "provider_unsupported",
            Self::CustomProviderNotFound => "custom_provider_not_found",
            Self::ModelDeactivated => "model_deactivated",
            Self::JsonOutputUnsupported => "json_output_unsupported",
            Self::ReasoningUnsupported => "reasoning_unsupported",
            Self::StreamingUnsupported => "streaming_unsupported",
            Self::MaxTokensExceedsMaxOutput => "max_tokens_exceeds_max_output",
            Self::NoProviderKey => "no_provider_key",
            Self::NoProviderEnv => "no_provider_env",
            Self::CustomInCreditsMode => "custom_in_credits_mode",
            Self::InsufficientCredits => "insufficient_credits",
            Self::NoAvailableProvider => "no_available_provider",
            Self::UpstreamHttpError { .. } => "upstream_http_error",
            Self::UpstreamTransportError => "upstream_transport_error",
            Self::ClientCanceled => "request_canceled",
            Self::ProjectNotFound => "project_not_found",
            Self::Internal => "internal_error",
        }
    }

    /// The `type` field of the OpenAI-style error body. Upstream 5xx keeps
    /// its own tag so callers can tell provider outages from gateway faults.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::UpstreamHttpError { status } if *status >= 500 => "upstream_error",
            Self::UpstreamHttpError { .. } => "gateway_error",
            Self::UpstreamTransportError => "upstream_error",
            Self::AuthMissing | Self::AuthMalformed | Self::AuthInvalid => "authentication_error",
            _ => "invalid_request_error",
        }
    }
}
