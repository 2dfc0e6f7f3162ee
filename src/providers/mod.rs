//! Per-family request translation and unary response normalization.
//!
//! Four dialects cover every upstream: openai-shaped (most providers),
//! anthropic, google, and mistral (openai-shaped plus a fenced-JSON
//! unwrap on unary content).

pub mod anthropic;
pub mod google;
pub mod mistral;
pub mod openai_compatible;

use serde_json::Value;

use crate::catalog::{AuthScheme, Family};
use crate::error::Result;
use crate::router::Route;
use crate::types::{ChatCompletionRequest, NormalizedResponse};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// An upstream-ready request: final URL (auth query applied), JSON body,
/// and auth/extra headers. `Content-Type: application/json` comes from the
/// HTTP client's JSON encoder.
#[derive(Clone, Debug)]
pub struct TranslatedRequest {
    pub url: String,
    pub body: Value,
    pub headers: Vec<(&'static str, String)>,
}

pub fn translate_request(route: &Route, request: &ChatCompletionRequest) -> TranslatedRequest {
    let body = match route.family {
        Family::OpenAi | Family::Mistral => openai_compatible::translate(route, request),
        Family::Anthropic => anthropic::translate(route, request),
        Family::Google => google::translate(route, request),
    };

    let mut url = route.endpoint.clone();
    let mut headers = Vec::new();
    match route.auth {
        AuthScheme::Bearer => {
            headers.push(("authorization", format!("Bearer {}", route.token)));
        }
        AuthScheme::ApiKeyHeader => {
            headers.push(("x-api-key", route.token.clone()));
        }
        AuthScheme::QueryParam => {
            let separator = if url.contains('?') { '&' } else { '?' };
            url = format!("{url}{separator}key={}", route.token);
        }
    }
    if route.family == Family::Anthropic {
        headers.push(("anthropic-version", ANTHROPIC_VERSION.to_string()));
    }

    TranslatedRequest { url, body, headers }
}

pub fn parse_unary(family: Family, body: &[u8]) -> Result<NormalizedResponse> {
    match family {
        Family::OpenAi => openai_compatible::parse_unary(body),
        Family::Mistral => {
            let mut response = openai_compatible::parse_unary(body)?;
            response.content = mistral::unwrap_json_fence(&response.content);
            Ok(response)
        }
        Family::Anthropic => anthropic::parse_unary(body),
        Family::Google => google::parse_unary(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::types::ChatMessage;

    fn route(provider: &str, model: &str) -> Route {
        let catalog = Catalog::builtin();
        let def = catalog.find_provider(provider).expect("provider");
        Route {
            model_id: None,
            provider_id: provider.to_string(),
            provider_model: model.to_string(),
            endpoint: def.chat_url(None, model, false),
            auth: def.auth,
            family: def.family,
            cancellation: def.cancellation,
            token: "sk-test".to_string(),
            provider_key_id: None,
            mapping: None,
            requested_provider: None,
        }
    }

    fn request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::user("hi")],
            stream: false,
            temperature: None,
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            response_format: None,
            tools: None,
            tool_choice: None,
            reasoning_effort: None,
        }
    }

    #[test]
    fn bearer_providers_get_an_authorization_header() {
        let translated = translate_request(&route("openai", "gpt-4o-mini"), &request("gpt-4o-mini"));
        assert!(translated
            .headers
            .iter()
            .any(|(name, value)| *name == "authorization" && value == "Bearer sk-test"));
    }

    #[test]
    fn anthropic_gets_api_key_and_version_headers() {
        let translated =
            translate_request(&route("anthropic", "claude-opus-4-0"), &request("claude-opus-4-0"));
        assert!(translated
            .headers
            .iter()
            .any(|(name, value)| *name == "x-api-key" && value == "sk-test"));
        assert!(translated
            .headers
            .iter()
            .any(|(name, _)| *name == "anthropic-version"));
    }

    #[test]
    fn google_ai_studio_auth_rides_the_query_string() {
        let translated = translate_request(
            &route("google-ai-studio", "gemini-2.5-flash"),
            &request("gemini-2.5-flash"),
        );
        assert!(translated.url.ends_with("?key=sk-test"));
        assert!(translated.headers.is_empty());
    }
}
