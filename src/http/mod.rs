//! HTTP ingress: the OpenAI-compatible chat endpoint plus model listing
//! and liveness.

pub mod chat;

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use tokio::sync::Mutex;

use crate::cache::ResponseCache;
use crate::catalog::Catalog;
use crate::config::{ProviderEnv, RuntimeConfig};
use crate::observability::Observability;
use crate::store::{Datastore, LogQueue};
use crate::types::now_epoch_millis;

#[derive(Clone)]
pub struct GatewayState {
    inner: Arc<StateInner>,
}

pub struct StateInner {
    pub catalog: Catalog,
    pub store: Arc<dyn Datastore>,
    pub queue: Arc<dyn LogQueue>,
    pub cache: Mutex<ResponseCache>,
    pub http: reqwest::Client,
    pub env: ProviderEnv,
    pub config: RuntimeConfig,
    pub observability: Observability,
}

impl GatewayState {
    pub fn new(
        catalog: Catalog,
        store: Arc<dyn Datastore>,
        queue: Arc<dyn LogQueue>,
        env: ProviderEnv,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(StateInner {
                catalog,
                store,
                queue,
                cache: Mutex::new(ResponseCache::default()),
                http: reqwest::Client::new(),
                env,
                config,
                observability: Observability::default(),
            }),
        }
    }
}

impl std::ops::Deref for GatewayState {
    type Target = StateInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub fn router(state: GatewayState) -> axum::Router {
    axum::Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(list_models))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn list_models(State(state): State<GatewayState>) -> impl IntoResponse {
    let now = now_epoch_millis();
    let data: Vec<serde_json::Value> = state
        .catalog
        .models()
        .iter()
        .filter(|model| !state.catalog.is_deactivated(model.id, now))
        .map(|model| {
            serde_json::json!({
                "id": model.id,
                "object": "model",
                "owned_by": model
                    .mappings
                    .first()
                    .map(|mapping| mapping.provider_id)
                    .unwrap_or_default(),
                "deprecated": state.catalog.is_deprecated(model.id, now),
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data }))
}

async fn healthz(State(state): State<GatewayState>) -> impl IntoResponse {
    let depths = state.queue.depths().await.unwrap_or_default();
    Json(serde_json::json!({
        "status": "ok",
        "observability": state.observability.snapshot(),
        "queue": depths,
    }))
}
