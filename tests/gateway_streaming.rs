use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use httpmock::prelude::*;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use relay_llm::catalog::Catalog;
use relay_llm::config::{Environment, ProviderEnv, RuntimeConfig};
use relay_llm::memory_store::{MemoryQueue, MemoryStore};
use relay_llm::store::{
    ApiKey, BillingMode, BillingPlan, KeyStatus, LogRecord, Organization, Project, ProviderKey,
    RetentionLevel,
};
use relay_llm::worker::LogWorker;
use relay_llm::GatewayState;

const API_TOKEN: &str = "rk-live-test";

struct TestGateway {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    app: axum::Router,
}

impl TestGateway {
    async fn wait_for_log(&self) -> LogRecord {
        let worker = LogWorker::new(
            self.store.clone(),
            self.queue.clone(),
            RuntimeConfig::new(Environment::Development),
        );
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            worker.process_one_batch().await.expect("worker batch");
            let logs = self.store.logs().await;
            if let Some(log) = logs.into_iter().next() {
                return log;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("no log row arrived in time");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn gateway(provider_keys: Vec<ProviderKey>) -> TestGateway {
    let store = Arc::new(MemoryStore::new());
    store
        .add_organization(Organization {
            id: "org-1".to_string(),
            credits_micros: 10_000_000,
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
            mode: BillingMode::ApiKeys,
            cache_ttl_seconds: 0,
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
        ProviderEnv::default(),
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

fn stream_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {API_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

/// Read the whole SSE body and split it into (event, data) frames.
async fn collect_frames(response: axum::response::Response) -> Vec<(Option<String>, String)> {
    let mut stream = response.into_body().into_data_stream();
    let mut raw = Vec::new();
    while let Some(chunk) = stream.next().await {
        raw.extend_from_slice(&chunk.expect("body chunk"));
    }
    let text = String::from_utf8(raw).expect("utf8 body");

    let mut frames = Vec::new();
    for block in text.split("\n\n").filter(|block| !block.is_empty()) {
        let mut event = None;
        let mut data = String::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                event = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("data: ") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest);
            }
        }
        frames.push((event, data));
    }
    frames
}

#[tokio::test]
async fn openai_stream_normalizes_chunks_and_terminates_with_done() {
    let upstream = MockServer::start();
    let sse_body = concat!(
        "data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
        "data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
        "data: [DONE]\n\n",
    );
    upstream.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(sse_body);
    });

    let gateway = gateway(vec![stored_key("openai", &upstream.base_url())]).await;
    let response = gateway
        .app
        .clone()
        .oneshot(stream_request(&json!({
            "model": "openai/gpt-4o-mini",
            "messages": [{ "role": "user", "content": "hi" }],
            "stream": true
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );

    let frames = collect_frames(response).await;
    let (last_event, last_data) = frames.last().expect("frames");
    assert_eq!(last_event.as_deref(), Some("done"));
    assert_eq!(last_data, "[DONE]");

    let mut content = String::new();
    for (event, data) in &frames {
        if event.is_some() {
            continue;
        }
        let chunk: Value = serde_json::from_str(data).expect("chunk json");
        assert_eq!(chunk["object"], "chat.completion.chunk");
        if let Some(delta) = chunk["choices"][0].get("delta") {
            assert_eq!(delta["role"], "assistant");
            if let Some(text) = delta["content"].as_str() {
                content.push_str(text);
            }
        }
    }
    assert_eq!(content, "Hello");

    let log = gateway.wait_for_log().await;
    assert!(log.streamed);
    assert_eq!(log.content.as_deref(), Some("Hello"));
    assert_eq!(log.prompt_tokens, Some(5));
    assert_eq!(log.completion_tokens, Some(2));
    assert!(!log.estimated_cost);
    assert_eq!(log.finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn google_stream_synthesizes_missing_completion_tokens() {
    let upstream = MockServer::start();
    // Raw concatenated JSON objects, no SSE framing; prompt tokens are
    // reported but completion tokens never are.
    let body = concat!(
        "[{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"one \"}]}}],",
        "\"usageMetadata\":{\"promptTokenCount\":6}},",
        "{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"two \"}]}}],",
        "\"usageMetadata\":{\"promptTokenCount\":6}},",
        "{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"three\"}]},",
        "\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":6}}]"
    );
    upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1beta/models/gemini-2.5-flash:streamGenerateContent")
            .query_param("key", "sk-google-ai-studio");
        then.status(200)
            .header("content-type", "application/json")
            .body(body);
    });

    let gateway = gateway(vec![stored_key("google-ai-studio", &upstream.base_url())]).await;
    let response = gateway
        .app
        .clone()
        .oneshot(stream_request(&json!({
            "model": "google-ai-studio/gemini-2.5-flash",
            "messages": [{ "role": "user", "content": "count to three" }],
            "stream": true
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let frames = collect_frames(response).await;
    let (last_event, last_data) = frames.last().expect("frames");
    assert_eq!(last_event.as_deref(), Some("done"));
    assert_eq!(last_data, "[DONE]");

    // The synthetic usage chunk right before [DONE] carries imputed
    // completion tokens.
    let (_, usage_data) = &frames[frames.len() - 2];
    let usage_chunk: Value = serde_json::from_str(usage_data).expect("usage chunk");
    assert_eq!(usage_chunk["usage"]["prompt_tokens"], 6);
    assert!(
        usage_chunk["usage"]["completion_tokens"]
            .as_u64()
            .expect("completion tokens")
            > 0
    );

    let log = gateway.wait_for_log().await;
    assert!(log.estimated_cost);
    assert_eq!(log.prompt_tokens, Some(6));
    assert!(log.completion_tokens.expect("imputed") > 0);
    assert_eq!(log.content.as_deref(), Some("one two three"));
}

#[tokio::test]
async fn client_disconnect_cancels_a_cancellation_safe_stream() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200)
            .header("content-type", "text/event-stream")
            .delay(Duration::from_millis(300))
            .body("event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":9}}}\n\n");
    });

    let gateway = gateway(vec![stored_key("anthropic", &upstream.base_url())]).await;
    let response = gateway
        .app
        .clone()
        .oneshot(stream_request(&json!({
            "model": "anthropic/claude-sonnet-4-0",
            "messages": [{ "role": "user", "content": "tell me a long story" }],
            "stream": true
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    // Hang up before the upstream has produced anything.
    drop(response);

    let log = gateway.wait_for_log().await;
    assert!(log.canceled);
    assert_eq!(log.finish_reason.as_deref(), Some("canceled"));
    assert!(log.streamed);
}

#[tokio::test]
async fn upstream_stream_failure_emits_error_then_done() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/chat/completions");
        then.status(529).body("overloaded");
    });

    let gateway = gateway(vec![stored_key("openai", &upstream.base_url())]).await;
    let response = gateway
        .app
        .clone()
        .oneshot(stream_request(&json!({
            "model": "openai/gpt-4o-mini",
            "messages": [{ "role": "user", "content": "hi" }],
            "stream": true
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let frames = collect_frames(response).await;
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].0.as_deref(), Some("error"));
    let error: Value = serde_json::from_str(&frames[0].1).expect("error body");
    assert_eq!(error["error"]["type"], "upstream_error");
    assert_eq!(frames[1].0.as_deref(), Some("done"));
    assert_eq!(frames[1].1, "[DONE]");

    let log = gateway.wait_for_log().await;
    assert!(log.has_error);
    assert_eq!(log.finish_reason.as_deref(), Some("upstream_error"));
}

#[tokio::test]
async fn streaming_to_a_non_streaming_mapping_is_rejected_up_front() {
    let gateway = gateway(vec![stored_key("openai", "http://127.0.0.1:1")]).await;

    let response = gateway
        .app
        .clone()
        .oneshot(stream_request(&json!({
            "model": "openai/o1",
            "messages": [{ "role": "user", "content": "hi" }],
            "stream": true
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["error"]["code"], "streaming_unsupported");

    // No upstream call happened, but the attempt is still logged.
    let log = gateway.wait_for_log().await;
    assert!(log.streamed);
    assert!(log.finish_reason.is_none());
}
