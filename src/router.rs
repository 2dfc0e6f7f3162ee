//! Resolution of a user-supplied model string to a concrete upstream
//! (provider, model, endpoint, credential) under the project billing mode.

use crate::catalog::{
    AuthScheme, Catalog, Family, ModelDef, ProviderMapping, INTERNAL_PROVIDER,
};
use crate::config::ProviderEnv;
use crate::credentials::{self, available_providers, ResolvedCredential};
use crate::error::{FailureCode, RequestFailure};
use crate::store::{BillingMode, Organization, ProviderKey};
use crate::types::ChatCompletionRequest;

#[derive(Clone, Debug)]
pub struct Route {
    /// Canonical catalog id; `None` for custom upstreams.
    pub model_id: Option<String>,
    pub provider_id: String,
    pub provider_model: String,
    pub endpoint: String,
    pub auth: AuthScheme,
    pub family: Family,
    pub cancellation: bool,
    pub token: String,
    pub provider_key_id: Option<String>,
    /// Pricing/capability data; absent for custom upstreams.
    pub mapping: Option<ProviderMapping>,
    /// Provider explicitly named in the request, for logging.
    pub requested_provider: Option<String>,
}

pub fn resolve(
    catalog: &Catalog,
    mode: BillingMode,
    organization: &Organization,
    keys: &[ProviderKey],
    env: &ProviderEnv,
    request: &ChatCompletionRequest,
    now_ms: u64,
) -> Result<Route, RequestFailure> {
    let model = request.model.trim();

    let selection = match model {
        "" => {
            return Err(RequestFailure::new(
                FailureCode::InvalidRequest,
                "model must not be empty",
            ))
        }
        "auto" => select_auto(catalog, mode, keys, env, now_ms)?,
        "custom" => return resolve_custom_route(mode, keys, "custom", "custom", None),
        _ if model.contains('/') => {
            let (prefix, suffix) = model.split_once('/').unwrap_or((model, ""));
            if suffix.is_empty() {
                return Err(RequestFailure::new(
                    FailureCode::InvalidRequest,
                    format!("Model {model} is missing a model name after the provider prefix"),
                ));
            }
            if prefix.is_empty() {
                return Err(RequestFailure::new(
                    FailureCode::ProviderUnsupported,
                    format!("Model {model} has an empty provider prefix"),
                ));
            }
            if catalog.find_provider(prefix).is_some() {
                select_prefixed(catalog, prefix, suffix)?
            } else {
                return resolve_custom_route(mode, keys, prefix, suffix, Some(prefix));
            }
        }
        _ => match catalog.lookup_model(model) {
            Some(definition) => select_bare(catalog, definition, mode, keys, env, None)?,
            None => {
                if catalog.lookup_model_by_provider_model_name(model).is_some() {
                    return Err(RequestFailure::new(
                        FailureCode::ModelProviderPrefixRequired,
                        format!(
                            "Model {model} is provider-specific; request it as provider/{model}"
                        ),
                    ));
                }
                return Err(RequestFailure::new(
                    FailureCode::UnsupportedModel,
                    format!("Model {model} is not supported"),
                ));
            }
        },
    };

    finish_catalog_route(catalog, selection, mode, organization, keys, env, request, now_ms)
}

struct Selection<'a> {
    definition: &'a ModelDef,
    mapping: &'a ProviderMapping,
    requested_provider: Option<String>,
}

fn select_auto<'a>(
    catalog: &'a Catalog,
    mode: BillingMode,
    keys: &[ProviderKey],
    env: &ProviderEnv,
    now_ms: u64,
) -> Result<Selection<'a>, RequestFailure> {
    let available = available_providers(catalog, mode, keys, env);
    for definition in catalog.models() {
        if catalog.is_deprecated(definition.id, now_ms)
            || catalog.is_deactivated(definition.id, now_ms)
        {
            continue;
        }
        let Some(mapping) = definition.mappings.iter().find(|mapping| {
            available
                .iter()
                .any(|provider| provider.id == mapping.provider_id)
        }) else {
            continue;
        };
        return Ok(Selection {
            definition,
            mapping,
            requested_provider: None,
        });
    }
    Err(RequestFailure::new(
        FailureCode::NoAvailableProvider,
        "No provider is available for automatic model selection",
    ))
}

fn select_prefixed<'a>(
    catalog: &'a Catalog,
    provider_id: &str,
    model_name: &str,
) -> Result<Selection<'a>, RequestFailure> {
    for definition in catalog.models() {
        for mapping in &definition.mappings {
            if mapping.provider_id == provider_id
                && (definition.id == model_name || mapping.provider_model == model_name)
            {
                return Ok(Selection {
                    definition,
                    mapping,
                    requested_provider: Some(provider_id.to_string()),
                });
            }
        }
    }
    Err(RequestFailure::new(
        FailureCode::UnsupportedModel,
        format!("Model {model_name} is not supported by provider {provider_id}"),
    ))
}

fn select_bare<'a>(
    catalog: &'a Catalog,
    definition: &'a ModelDef,
    mode: BillingMode,
    keys: &[ProviderKey],
    env: &ProviderEnv,
    requested_provider: Option<String>,
) -> Result<Selection<'a>, RequestFailure> {
    if definition.mappings.len() == 1 {
        return Ok(Selection {
            definition,
            mapping: &definition.mappings[0],
            requested_provider,
        });
    }

    let available = available_providers(catalog, mode, keys, env);
    let candidates: Vec<&ProviderMapping> = definition
        .mappings
        .iter()
        .filter(|mapping| {
            available
                .iter()
                .any(|provider| provider.id == mapping.provider_id)
        })
        .collect();
    if candidates.is_empty() {
        return Err(RequestFailure::new(
            FailureCode::NoAvailableProvider,
            format!("No configured provider can serve model {}", definition.id),
        ));
    }

    // Cheapest by flat input+output price; stable min keeps declared order
    // on ties.
    let mapping = candidates
        .into_iter()
        .min_by_key(|mapping| mapping.price.input.saturating_add(mapping.price.output))
        .unwrap_or(&definition.mappings[0]);

    Ok(Selection {
        definition,
        mapping,
        requested_provider,
    })
}

#[allow(clippy::too_many_arguments)]
fn finish_catalog_route(
    catalog: &Catalog,
    selection: Selection<'_>,
    mode: BillingMode,
    organization: &Organization,
    keys: &[ProviderKey],
    env: &ProviderEnv,
    request: &ChatCompletionRequest,
    now_ms: u64,
) -> Result<Route, RequestFailure> {
    let Selection {
        definition,
        mapping,
        requested_provider,
    } = selection;

    if catalog.is_deactivated(definition.id, now_ms) {
        return Err(RequestFailure::new(
            FailureCode::ModelDeactivated,
            format!("Model {} has been deactivated", definition.id),
        ));
    }
    apply_capability_gates(catalog, definition, mapping, request)?;

    let provider = catalog
        .find_provider(mapping.provider_id)
        .ok_or_else(|| {
            RequestFailure::new(
                FailureCode::ProviderUnsupported,
                format!("Provider {} is not configured", mapping.provider_id),
            )
        })?;

    let credential = credentials::resolve(mode, organization, provider, keys, env)?;
    let endpoint = provider.chat_url(
        credential.base_url.as_deref(),
        mapping.provider_model,
        request.stream,
    );

    Ok(Route {
        model_id: Some(definition.id.to_string()),
        provider_id: provider.id.to_string(),
        provider_model: mapping.provider_model.to_string(),
        endpoint,
        auth: provider.auth,
        family: provider.family,
        cancellation: provider.cancellation,
        token: credential.token,
        provider_key_id: credential.provider_key_id,
        mapping: Some(mapping.clone()),
        requested_provider,
    })
}

fn apply_capability_gates(
    catalog: &Catalog,
    definition: &ModelDef,
    mapping: &ProviderMapping,
    request: &ChatCompletionRequest,
) -> Result<(), RequestFailure> {
    if request.wants_json_object() && !definition.json_output {
        return Err(RequestFailure::new(
            FailureCode::JsonOutputUnsupported,
            format!("Model {} does not support JSON output mode", definition.id),
        ));
    }
    if request.reasoning_effort.is_some() && !catalog.reasoning_supported(definition.id) {
        return Err(RequestFailure::new(
            FailureCode::ReasoningUnsupported,
            format!("Model {} does not support reasoning effort", definition.id),
        ));
    }
    if request.stream && !mapping.streaming {
        return Err(RequestFailure::new(
            FailureCode::StreamingUnsupported,
            format!(
                "Model {} does not support streaming on provider {}",
                definition.id, mapping.provider_id
            ),
        ));
    }
    if let Some(max_tokens) = request.max_tokens {
        if max_tokens > mapping.max_output {
            return Err(RequestFailure::new(
                FailureCode::MaxTokensExceedsMaxOutput,
                format!(
                    "max_tokens {} exceeds the model limit of {}",
                    max_tokens, mapping.max_output
                ),
            ));
        }
    }
    Ok(())
}

fn resolve_custom_route(
    mode: BillingMode,
    keys: &[ProviderKey],
    custom_name: &str,
    model_name: &str,
    requested_provider: Option<&str>,
) -> Result<Route, RequestFailure> {
    let credential: ResolvedCredential = credentials::resolve_custom(mode, keys, custom_name)?;
    let base_url = credential.base_url.clone().ok_or_else(|| {
        RequestFailure::new(
            FailureCode::CustomProviderNotFound,
            format!("Custom provider {custom_name} has no endpoint configured"),
        )
    })?;
    let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));

    Ok(Route {
        model_id: None,
        provider_id: INTERNAL_PROVIDER.to_string(),
        provider_model: model_name.to_string(),
        endpoint,
        auth: AuthScheme::Bearer,
        family: Family::OpenAi,
        cancellation: true,
        token: credential.token,
        provider_key_id: credential.provider_key_id,
        mapping: None,
        requested_provider: requested_provider.map(str::to_string),
    })
}
