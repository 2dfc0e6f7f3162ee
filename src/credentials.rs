//! Credential resolution under the project billing mode.

use crate::catalog::{Catalog, ProviderDef, INTERNAL_PROVIDER};
use crate::config::ProviderEnv;
use crate::error::{FailureCode, RequestFailure};
use crate::store::{BillingMode, KeyStatus, Organization, ProviderKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    Stored,
    Env,
}

#[derive(Clone, Debug)]
pub struct ResolvedCredential {
    pub token: String,
    pub provider_key_id: Option<String>,
    pub base_url: Option<String>,
    pub source: CredentialSource,
}

fn active_key<'a>(keys: &'a [ProviderKey], provider_id: &str, custom: bool) -> Option<&'a ProviderKey> {
    keys.iter()
        .find(|key| key.provider_id == provider_id && key.custom == custom && key.status == KeyStatus::Active)
}

fn stored_credential(key: &ProviderKey) -> ResolvedCredential {
    ResolvedCredential {
        token: key.token.clone(),
        provider_key_id: Some(key.id.clone()),
        base_url: key.base_url.clone(),
        source: CredentialSource::Stored,
    }
}

/// Resolve the upstream credential for a named custom provider. Custom
/// providers only ever have stored definitions, so `credits` mode cannot
/// serve them at all.
pub fn resolve_custom(
    mode: BillingMode,
    keys: &[ProviderKey],
    custom_name: &str,
) -> Result<ResolvedCredential, RequestFailure> {
    if mode == BillingMode::Credits {
        return Err(RequestFailure::new(
            FailureCode::CustomInCreditsMode,
            "Custom providers are not available in credits billing mode",
        ));
    }
    let Some(key) = active_key(keys, custom_name, true) else {
        return Err(RequestFailure::new(
            FailureCode::CustomProviderNotFound,
            format!("No custom provider named {custom_name} is configured for this organization"),
        ));
    };
    Ok(stored_credential(key))
}

/// Resolve the upstream credential for a catalog provider under the
/// project's billing mode. Env-credential paths additionally require a
/// positive credit balance.
pub fn resolve(
    mode: BillingMode,
    organization: &Organization,
    provider: &ProviderDef,
    keys: &[ProviderKey],
    env: &ProviderEnv,
) -> Result<ResolvedCredential, RequestFailure> {
    let stored = active_key(keys, provider.id, false);

    match mode {
        BillingMode::ApiKeys => stored.map(stored_credential).ok_or_else(|| {
            RequestFailure::new(
                FailureCode::NoProviderKey,
                format!(
                    "No API key configured for provider {} in this organization",
                    provider.id
                ),
            )
        }),
        BillingMode::Credits => env_credential(organization, provider, env),
        BillingMode::Hybrid => match stored {
            Some(key) => Ok(stored_credential(key)),
            None => env_credential(organization, provider, env),
        },
    }
}

fn env_credential(
    organization: &Organization,
    provider: &ProviderDef,
    env: &ProviderEnv,
) -> Result<ResolvedCredential, RequestFailure> {
    let token = provider
        .env_var
        .and_then(|name| env.get(name))
        .ok_or_else(|| {
            RequestFailure::new(
                FailureCode::NoProviderEnv,
                format!("No platform credential configured for provider {}", provider.id),
            )
        })?;
    if organization.credits_micros <= 0 {
        return Err(RequestFailure::new(
            FailureCode::InsufficientCredits,
            "Organization has no remaining credits",
        ));
    }
    // OPENAI_API_KEY pairs with OPENAI_BASE_URL, and so on per provider.
    let base_url = provider
        .env_var
        .map(|name| name.replace("_API_KEY", "_BASE_URL"))
        .and_then(|name| env.get(&name))
        .map(str::to_string);
    Ok(ResolvedCredential {
        token: token.to_string(),
        provider_key_id: None,
        base_url,
        source: CredentialSource::Env,
    })
}

/// Providers the router may consider for this project: stored-key providers
/// in `api-keys` mode, env-credentialed providers (minus the internal
/// meta-provider) in `credits` mode, the union in `hybrid`.
pub fn available_providers<'a>(
    catalog: &'a Catalog,
    mode: BillingMode,
    keys: &[ProviderKey],
    env: &ProviderEnv,
) -> Vec<&'a ProviderDef> {
    catalog
        .providers()
        .iter()
        .filter(|provider| provider.id != INTERNAL_PROVIDER)
        .filter(|provider| {
            let has_stored = active_key(keys, provider.id, false).is_some();
            let has_env = provider.env_var.and_then(|name| env.get(name)).is_some();
            match mode {
                BillingMode::ApiKeys => has_stored,
                BillingMode::Credits => has_env,
                BillingMode::Hybrid => has_stored || has_env,
            }
        })
        .collect()
}
