use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use relay_llm::catalog::Catalog;
use relay_llm::config::{Environment, ProviderEnv, RuntimeConfig};
use relay_llm::memory_store::{MemoryQueue, MemoryStore};
use relay_llm::store::{
    ApiKey, BillingMode, BillingPlan, KeyStatus, Organization, Project, ProviderKey,
    RetentionLevel,
};
use relay_llm::worker::LogWorker;
use relay_llm::GatewayState;

const API_TOKEN: &str = "rk-live-test";
const STARTING_CREDITS: i64 = 10_000_000;

struct TestGateway {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    app: axum::Router,
}

impl TestGateway {
    async fn drain_logs(&self) -> Vec<relay_llm::store::LogRecord> {
        let worker = LogWorker::new(
            self.store.clone(),
            self.queue.clone(),
            RuntimeConfig::new(Environment::Development),
        );
        for _ in 0..4 {
            worker.process_one_batch().await.expect("worker batch");
        }
        self.store.logs().await
    }
}

async fn gateway(
    mode: BillingMode,
    provider_keys: Vec<ProviderKey>,
    env: ProviderEnv,
    cache_ttl_seconds: u64,
) -> TestGateway {
    let store = Arc::new(MemoryStore::new());
    store
        .add_organization(Organization {
            id: "org-1".to_string(),
            credits_micros: STARTING_CREDITS,
            auto_topup: false,
            topup_threshold_micros: 0,
            topup_amount_micros: 0,
            default_payment_method: None,
            plan: BillingPlan::Pro,
            processor_customer_id: None,
            retention: RetentionLevel::All,
        })
        .await;
    store
        .add_project(Project {
            id: "proj-1".to_string(),
            organization_id: "org-1".to_string(),
            mode,
            cache_ttl_seconds,
        })
        .await;
    store
        .add_api_key(ApiKey {
            id: "key-1".to_string(),
            token: API_TOKEN.to_string(),
            project_id: "proj-1".to_string(),
            status: KeyStatus::Active,
        })
        .await;
    for key in provider_keys {
        store.add_provider_key(key).await;
    }

    let queue = Arc::new(MemoryQueue::new());
    let state = GatewayState::new(
        Catalog::builtin(),
        store.clone(),
        queue.clone(),
        env,
        RuntimeConfig::new(Environment::Development),
    );
    let app = relay_llm::http_router(state);
    TestGateway { store, queue, app }
}

fn stored_key(provider: &str, base_url: &str) -> ProviderKey {
    ProviderKey {
        id: format!("pk-{provider}"),
        organization_id: "org-1".to_string(),
        provider_id: provider.to_string(),
        token: format!("sk-{provider}"),
        base_url: Some(base_url.to_string()),
        status: KeyStatus::Active,
        custom: false,
    }
}

fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {API_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn openai_completion_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 1000, "completion_tokens": 100, "total_tokens": 1100 }
    })
}

#[tokio::test]
async fn unknown_model_is_rejected_and_still_logged() {
    let gateway = gateway(BillingMode::ApiKeys, Vec::new(), ProviderEnv::default(), 0).await;

    let response = gateway
        .app
        .clone()
        .oneshot(chat_request(&json!({
            "model": "mythical-1",
            "messages": [{ "role": "user", "content": "hi" }]
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = read_json(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .expect("message")
        .contains("not supported"));
    assert_eq!(body["error"]["code"], "unsupported_model");

    let logs = gateway.drain_logs().await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].finish_reason.is_none());
    assert_eq!(logs[0].requested_model, "mythical-1");
}

#[tokio::test]
async fn provider_prefix_dispatches_to_anthropic() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/messages")
            .header("x-api-key", "sk-anthropic")
            .header("anthropic-version", "2023-06-01");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "id": "msg_1",
                "content": [{ "type": "text", "text": "Hello from Claude" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 12, "output_tokens": 5 }
            }));
    });

    let gateway = gateway(
        BillingMode::ApiKeys,
        vec![stored_key("anthropic", &upstream.base_url())],
        ProviderEnv::default(),
        0,
    )
    .await;

    let response = gateway
        .app
        .clone()
        .oneshot(chat_request(&json!({
            "model": "anthropic/claude-opus-4-0",
            "messages": [{ "role": "user", "content": "hi" }],
            "stream": false
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_some());

    let body = read_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello from Claude");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 12);
    mock.assert();

    let logs = gateway.drain_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].used_provider.as_deref(), Some("anthropic"));
    assert_eq!(logs[0].requested_provider.as_deref(), Some("anthropic"));
    assert_eq!(logs[0].finish_reason.as_deref(), Some("stop"));
    assert!(!logs[0].estimated_cost);
}

#[tokio::test]
async fn auto_routing_in_credits_mode_uses_the_env_provider() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/chat/completions")
            .header("authorization", "Bearer sk-env-openai");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(openai_completion_body("hello"));
    });

    let env = ProviderEnv::from_vars([
        ("OPENAI_API_KEY".to_string(), "sk-env-openai".to_string()),
        ("OPENAI_BASE_URL".to_string(), upstream.base_url()),
    ]);
    let gateway = gateway(BillingMode::Credits, Vec::new(), env, 0).await;

    let response = gateway
        .app
        .clone()
        .oneshot(chat_request(&json!({
            "model": "auto",
            "messages": [{ "role": "user", "content": "hello" }]
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    mock.assert();

    let logs = gateway.drain_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].used_provider.as_deref(), Some("openai"));
    assert_eq!(logs[0].used_model.as_deref(), Some("gpt-4o-mini"));
}

#[tokio::test]
async fn json_mode_on_unsupporting_model_is_rejected() {
    let gateway = gateway(
        BillingMode::ApiKeys,
        vec![stored_key("xai", "http://127.0.0.1:1")],
        ProviderEnv::default(),
        0,
    )
    .await;

    let response = gateway
        .app
        .clone()
        .oneshot(chat_request(&json!({
            "model": "xai/grok-2",
            "messages": [{ "role": "user", "content": "hi" }],
            "response_format": { "type": "json_object" }
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], "json_output_unsupported");
}

#[tokio::test]
async fn cached_fingerprint_never_dispatches_upstream_again() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(openai_completion_body("cached answer"));
    });

    let gateway = gateway(
        BillingMode::ApiKeys,
        vec![stored_key("openai", &upstream.base_url())],
        ProviderEnv::default(),
        300,
    )
    .await;

    let request_body = json!({
        "model": "gpt-4o-mini",
        "messages": [{ "role": "user", "content": "what is cached?" }],
        "temperature": 0
    });

    let first = gateway
        .app
        .clone()
        .oneshot(chat_request(&request_body))
        .await
        .expect("first");
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = read_json(first).await;

    let second = gateway
        .app
        .clone()
        .oneshot(chat_request(&request_body))
        .await
        .expect("second");
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = read_json(second).await;

    mock.assert_hits(1);
    assert_eq!(
        first_body["choices"][0]["message"]["content"],
        second_body["choices"][0]["message"]["content"]
    );

    let logs = gateway.drain_logs().await;
    assert_eq!(logs.len(), 2);
    let cached_rows = logs.iter().filter(|log| log.cached).count();
    assert_eq!(cached_rows, 1);
    let cached = logs.iter().find(|log| log.cached).expect("cached row");
    assert_eq!(cached.total_cost_micros, 0);
    assert_eq!(cached.duration_ms, 0);
}

#[tokio::test]
async fn billable_request_debits_credits_exactly_once() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(openai_completion_body("hello"));
    });

    let env = ProviderEnv::from_vars([
        ("OPENAI_API_KEY".to_string(), "sk-env-openai".to_string()),
        ("OPENAI_BASE_URL".to_string(), upstream.base_url()),
    ]);
    let gateway = gateway(BillingMode::Credits, Vec::new(), env, 0).await;

    let response = gateway
        .app
        .clone()
        .oneshot(chat_request(&json!({
            "model": "gpt-4o-mini",
            "messages": [{ "role": "user", "content": "hello" }]
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let logs = gateway.drain_logs().await;
    assert_eq!(logs.len(), 1);
    // 1000 prompt tokens at $0.15/M plus 100 completion tokens at $0.60/M.
    assert_eq!(logs[0].total_cost_micros, 150 + 60);
    assert_eq!(
        gateway.store.credits("org-1").await,
        Some(STARTING_CREDITS - 210)
    );

    // A second worker pass must not debit again.
    gateway.drain_logs().await;
    assert_eq!(
        gateway.store.credits("org-1").await,
        Some(STARTING_CREDITS - 210)
    );
}

#[tokio::test]
async fn upstream_5xx_maps_to_upstream_error() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(503).body("upstream melting");
    });

    let gateway = gateway(
        BillingMode::ApiKeys,
        vec![stored_key("openai", &upstream.base_url())],
        ProviderEnv::default(),
        0,
    )
    .await;

    let response = gateway
        .app
        .clone()
        .oneshot(chat_request(&json!({
            "model": "gpt-4o-mini",
            "messages": [{ "role": "user", "content": "hi" }]
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = read_json(response).await;
    assert_eq!(body["error"]["type"], "upstream_error");
    assert_eq!(body["error"]["responseText"], "upstream melting");

    let logs = gateway.drain_logs().await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].has_error);
    assert_eq!(logs[0].finish_reason.as_deref(), Some("upstream_error"));
}

#[tokio::test]
async fn missing_and_unknown_bearer_tokens_get_401() {
    let gateway = gateway(BillingMode::ApiKeys, Vec::new(), ProviderEnv::default(), 0).await;
    let body = json!({
        "model": "gpt-4o-mini",
        "messages": [{ "role": "user", "content": "hi" }]
    });

    let no_auth = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = gateway.app.clone().oneshot(no_auth).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong_token = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer rk-unknown")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    let response = gateway
        .app
        .clone()
        .oneshot(wrong_token)
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Unauthenticated requests have no org to log against.
    assert!(gateway.drain_logs().await.is_empty());
}

#[tokio::test]
async fn max_tokens_over_mapping_limit_is_rejected() {
    let gateway = gateway(
        BillingMode::ApiKeys,
        vec![stored_key("openai", "http://127.0.0.1:1")],
        ProviderEnv::default(),
        0,
    )
    .await;

    let response = gateway
        .app
        .clone()
        .oneshot(chat_request(&json!({
            "model": "gpt-4o-mini",
            "messages": [{ "role": "user", "content": "hi" }],
            "max_tokens": 16_385
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], "max_tokens_exceeds_max_output");
}

#[tokio::test]
async fn deactivated_model_returns_410() {
    let gateway = gateway(
        BillingMode::ApiKeys,
        vec![stored_key("anthropic", "http://127.0.0.1:1")],
        ProviderEnv::default(),
        0,
    )
    .await;

    let response = gateway
        .app
        .clone()
        .oneshot(chat_request(&json!({
            "model": "anthropic/claude-2.1",
            "messages": [{ "role": "user", "content": "hi" }]
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn custom_headers_are_captured_into_the_log() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(openai_completion_body("ok"));
    });

    let gateway = gateway(
        BillingMode::ApiKeys,
        vec![stored_key("openai", &upstream.base_url())],
        ProviderEnv::default(),
        0,
    )
    .await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {API_TOKEN}"))
        .header("content-type", "application/json")
        .header("x-request-id", "req-fixed-1")
        .header("x-llmgateway-team", "search")
        .header("X-LLMGateway-Run", "nightly")
        .body(Body::from(
            json!({
                "model": "gpt-4o-mini",
                "messages": [{ "role": "user", "content": "hi" }]
            })
            .to_string(),
        ))
        .expect("request");

    let response = gateway.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok()),
        Some("req-fixed-1")
    );

    let logs = gateway.drain_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].request_id, "req-fixed-1");
    assert_eq!(
        logs[0].custom_headers.get("team").map(String::as_str),
        Some("search")
    );
    assert_eq!(
        logs[0].custom_headers.get("run").map(String::as_str),
        Some("nightly")
    );
}

#[tokio::test]
async fn model_listing_and_health_endpoints_respond() {
    let gateway = gateway(BillingMode::ApiKeys, Vec::new(), ProviderEnv::default(), 0).await;

    let models = gateway
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/models")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(models.status(), StatusCode::OK);
    let body = read_json(models).await;
    let ids: Vec<&str> = body["data"]
        .as_array()
        .expect("data")
        .iter()
        .filter_map(|model| model["id"].as_str())
        .collect();
    assert!(ids.contains(&"gpt-4o-mini"));
    // Deactivated models are not listed.
    assert!(!ids.contains(&"claude-2.1"));

    let health = gateway
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/healthz")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(health.status(), StatusCode::OK);
    let body = read_json(health).await;
    assert_eq!(body["status"], "ok");
}
