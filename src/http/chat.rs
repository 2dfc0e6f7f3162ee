//! The chat-completion pipeline: auth, routing, cache, upstream dispatch,
//! normalization, and the log handoff. Every authenticated request ends
//! with exactly one enqueued log row, whatever the outcome.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache;
use crate::costing;
use crate::error::{FailureCode, RequestFailure};
use crate::providers::{self, TranslatedRequest};
use crate::router::{self, Route};
use crate::store::{ApiKey, LogRecord, Organization, Project, ProviderKey};
use crate::streaming::{self, ChunkContext, StreamSummary};
use crate::types::{
    now_epoch_millis, now_epoch_seconds, random_slug, ChatCompletionRequest, FinishReason,
};

use super::GatewayState;

pub async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.observability.record_request();
    let request_id = extract_request_id(&headers);
    let custom_headers = extract_custom_headers(&headers);

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let failure = RequestFailure::new(
                FailureCode::InvalidRequest,
                format!("invalid request body: {err}"),
            );
            return failure_response(&failure, &request_id, &[]);
        }
    };
    if request.messages.is_empty() {
        let failure =
            RequestFailure::new(FailureCode::InvalidRequest, "messages must not be empty");
        return failure_response(&failure, &request_id, &[]);
    }

    let auth = match authenticate(&state, &headers).await {
        Ok(auth) => auth,
        Err(failure) => return failure_response(&failure, &request_id, &[]),
    };

    let mut log = base_log(&request_id, &auth, &request, custom_headers);

    let route = match router::resolve(
        &state.catalog,
        auth.project.mode,
        &auth.organization,
        &auth.provider_keys,
        &state.env,
        &request,
        now_epoch_millis(),
    ) {
        Ok(route) => route,
        Err(failure) => {
            log.error_details = Some(failure.message.clone());
            enqueue_log(&state, log).await;
            return failure_response(
                &failure,
                &request_id,
                &[("requestedModel", request.model.clone().into())],
            );
        }
    };
    log.requested_provider = route.requested_provider.clone();
    log.used_provider = Some(route.provider_id.clone());
    log.used_model = Some(route.provider_model.clone());

    let cache_key = (!request.stream && auth.project.cache_ttl_seconds > 0)
        .then(|| cache::fingerprint(&request));
    if let Some(key) = cache_key.as_deref() {
        let hit = state.cache.lock().await.get(key, now_epoch_seconds());
        if let Some(hit) = hit {
            state.observability.record_cache_hit();
            log.cached = true;
            log.finish_reason = hit["choices"][0]["finish_reason"]
                .as_str()
                .map(str::to_string);
            log.response_size = hit.to_string().len() as u64;
            enqueue_log(&state, log).await;
            return json_response(StatusCode::OK, &hit, &request_id);
        }
    }

    let translated = providers::translate_request(&route, &request);

    if request.stream {
        dispatch_stream(state, route, translated, request, log, request_id)
    } else {
        dispatch_unary(
            state,
            route,
            translated,
            request,
            log,
            request_id,
            cache_key,
            auth.project.cache_ttl_seconds,
        )
        .await
    }
}

struct AuthContext {
    api_key: ApiKey,
    project: Project,
    organization: Organization,
    provider_keys: Vec<ProviderKey>,
}

async fn authenticate(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<AuthContext, RequestFailure> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| {
            RequestFailure::new(FailureCode::AuthMissing, "missing Authorization header")
        })?;
    let header = header.to_str().map_err(|_| {
        RequestFailure::new(FailureCode::AuthMalformed, "malformed Authorization header")
    })?;
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            RequestFailure::new(
                FailureCode::AuthMalformed,
                "Authorization header must be a bearer token",
            )
        })?;

    let api_key = state
        .store
        .api_key_by_token(token)
        .await
        .map_err(internal_failure)?
        .ok_or_else(|| RequestFailure::new(FailureCode::AuthInvalid, "unknown API key"))?;
    if api_key.status != crate::store::KeyStatus::Active {
        return Err(RequestFailure::new(
            FailureCode::AuthInvalid,
            "API key is disabled",
        ));
    }

    let project = state
        .store
        .project(&api_key.project_id)
        .await
        .map_err(internal_failure)?
        .ok_or_else(|| {
            RequestFailure::new(FailureCode::ProjectNotFound, "project not found for API key")
        })?;
    let organization = state
        .store
        .organization(&project.organization_id)
        .await
        .map_err(internal_failure)?
        .ok_or_else(|| {
            RequestFailure::new(FailureCode::ProjectNotFound, "organization not found")
        })?;
    let provider_keys = state
        .store
        .provider_keys(&organization.id)
        .await
        .map_err(internal_failure)?;

    Ok(AuthContext {
        api_key,
        project,
        organization,
        provider_keys,
    })
}

fn internal_failure(err: crate::store::StoreError) -> RequestFailure {
    tracing::error!(error = %err, "store error during request handling");
    RequestFailure::new(FailureCode::Internal, "internal error")
}

fn base_log(
    request_id: &str,
    auth: &AuthContext,
    request: &ChatCompletionRequest,
    custom_headers: BTreeMap<String, String>,
) -> LogRecord {
    LogRecord {
        request_id: request_id.to_string(),
        organization_id: auth.organization.id.clone(),
        project_id: auth.project.id.clone(),
        api_key_id: auth.api_key.id.clone(),
        mode: Some(auth.project.mode),
        requested_model: request.model.clone(),
        streamed: request.stream,
        messages: serde_json::to_value(&request.messages).ok(),
        custom_headers,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        top_p: request.top_p,
        frequency_penalty: request.frequency_penalty,
        presence_penalty: request.presence_penalty,
        response_format: request
            .response_format
            .as_ref()
            .map(|format| format.kind.clone()),
        reasoning_effort: request
            .reasoning_effort
            .map(|effort| effort.as_str().to_string()),
        created_at_ms: now_epoch_millis(),
        ..LogRecord::default()
    }
}

async fn enqueue_log(state: &GatewayState, log: LogRecord) {
    match serde_json::to_string(&log) {
        Ok(payload) => {
            if let Err(err) = state.queue.enqueue(payload).await {
                tracing::error!(error = %err, request_id = %log.request_id, "failed to enqueue log");
            } else {
                state.observability.record_log_enqueued();
            }
        }
        Err(err) => {
            tracing::error!(error = %err, request_id = %log.request_id, "failed to serialize log")
        }
    }
}

fn fill_usage_and_cost(log: &mut LogRecord, route: &Route, summary: &StreamSummary, imputed: bool) {
    log.prompt_tokens = summary.usage.prompt_tokens;
    log.completion_tokens = summary.usage.completion_tokens;
    log.reasoning_tokens = summary.usage.reasoning_tokens;
    log.cached_tokens = summary.usage.cached_tokens;
    log.estimated_cost = imputed;
    if let Some(mapping) = route.mapping.as_ref() {
        let cost = costing::compute(mapping, &summary.usage, imputed);
        log.input_cost_micros = cost.input_cost;
        log.output_cost_micros = cost.output_cost;
        log.cached_input_cost_micros = cost.cached_input_cost;
        log.request_cost_micros = cost.request_cost;
        log.total_cost_micros = cost.total_cost;
    }
}

fn upstream_failure(status: u16) -> RequestFailure {
    RequestFailure::new(
        FailureCode::UpstreamHttpError { status },
        format!("upstream returned status {status}"),
    )
}

fn upstream_finish_reason(status: u16) -> FinishReason {
    if status >= 500 {
        FinishReason::UpstreamError
    } else {
        FinishReason::GatewayError
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_unary(
    state: GatewayState,
    route: Route,
    translated: TranslatedRequest,
    request: ChatCompletionRequest,
    mut log: LogRecord,
    request_id: String,
    cache_key: Option<String>,
    cache_ttl_seconds: u64,
) -> Response {
    // The work runs on its own task so the log is enqueued exactly once
    // even if the client goes away mid-request.
    let handle = tokio::spawn(async move {
        let started = Instant::now();
        state.observability.record_upstream_call();

        let mut builder = state.http.post(&translated.url).json(&translated.body);
        for (name, value) in &translated.headers {
            builder = builder.header(*name, value);
        }

        let upstream = match builder.send().await {
            Ok(upstream) => upstream,
            Err(err) => {
                state.observability.record_upstream_error();
                let failure = RequestFailure::new(
                    FailureCode::UpstreamTransportError,
                    format!("upstream request failed: {err}"),
                );
                log.has_error = true;
                log.error_details = Some(err.to_string());
                log.finish_reason = Some(FinishReason::UpstreamError.as_str().to_string());
                log.duration_ms = started.elapsed().as_millis() as u64;
                enqueue_log(&state, log).await;
                return failure_response(
                    &failure,
                    &request_id,
                    &[
                        ("usedProvider", route.provider_id.clone().into()),
                        ("usedModel", route.provider_model.clone().into()),
                    ],
                );
            }
        };

        let status = upstream.status();
        let bytes = upstream.bytes().await.unwrap_or_default();

        if !status.is_success() {
            state.observability.record_upstream_error();
            let text = String::from_utf8_lossy(&bytes).to_string();
            let failure = upstream_failure(status.as_u16());
            log.has_error = true;
            log.error_details = Some(truncate(&text, 4_096));
            log.finish_reason =
                Some(upstream_finish_reason(status.as_u16()).as_str().to_string());
            log.duration_ms = started.elapsed().as_millis() as u64;
            enqueue_log(&state, log).await;
            return failure_response(
                &failure,
                &request_id,
                &[
                    ("usedProvider", route.provider_id.clone().into()),
                    ("usedModel", route.provider_model.clone().into()),
                    ("responseText", truncate(&text, 4_096).into()),
                ],
            );
        }

        let normalized = match providers::parse_unary(route.family, &bytes) {
            Ok(normalized) => normalized,
            Err(err) => {
                state.observability.record_upstream_error();
                let failure = RequestFailure::new(
                    FailureCode::UpstreamTransportError,
                    format!("could not parse upstream response: {err}"),
                );
                log.has_error = true;
                log.error_details = Some(err.to_string());
                log.finish_reason = Some(FinishReason::UpstreamError.as_str().to_string());
                log.duration_ms = started.elapsed().as_millis() as u64;
                enqueue_log(&state, log).await;
                return failure_response(&failure, &request_id, &[]);
            }
        };

        let mut summary = StreamSummary {
            content: normalized.content.clone(),
            reasoning: normalized.reasoning_content.clone().unwrap_or_default(),
            tool_calls: normalized.tool_calls.clone(),
            usage: normalized.usage,
            finish_reason: normalized.finish_reason.clone(),
        };
        let imputed =
            streaming::finalize_usage(&mut summary.usage, &request.messages, &summary.content);

        let id = normalized
            .upstream_id
            .clone()
            .unwrap_or_else(|| format!("chatcmpl-{}", random_slug()));
        let created = normalized.upstream_created.unwrap_or_else(now_epoch_seconds);
        let mut response_body = normalized.to_chat_completion(&id, created, &request.model);
        response_body["usage"] = summary.usage.to_openai();

        if let Some(key) = cache_key {
            state.cache.lock().await.insert(
                key,
                response_body.clone(),
                cache_ttl_seconds,
                now_epoch_seconds(),
            );
        }

        let finish = summary.finish_reason.clone().unwrap_or(FinishReason::Stop);
        fill_usage_and_cost(&mut log, &route, &summary, imputed);
        log.finish_reason = Some(finish.as_str().to_string());
        log.content = Some(summary.content.clone());
        if !summary.tool_calls.is_empty() {
            log.tool_calls = serde_json::to_value(
                summary
                    .tool_calls
                    .iter()
                    .enumerate()
                    .map(|(index, call)| call.to_openai(index))
                    .collect::<Vec<Value>>(),
            )
            .ok();
        }
        log.response_size = response_body.to_string().len() as u64;
        log.duration_ms = started.elapsed().as_millis() as u64;
        enqueue_log(&state, log).await;

        json_response(StatusCode::OK, &response_body, &request_id)
    });

    match handle.await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "unary dispatch task failed");
            let failure = RequestFailure::new(FailureCode::Internal, "internal error");
            failure_response(&failure, "", &[])
        }
    }
}

fn dispatch_stream(
    state: GatewayState,
    route: Route,
    translated: TranslatedRequest,
    request: ChatCompletionRequest,
    log: LogRecord,
    request_id: String,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(run_stream(state, route, translated, request, log, tx));

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|bytes| (Ok::<_, Infallible>(bytes), rx))
    });

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        "content-type",
        axum::http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        "cache-control",
        axum::http::HeaderValue::from_static("no-cache"),
    );
    if let Ok(value) = request_id.parse() {
        headers.insert("x-request-id", value);
    }
    response
}

async fn send_bytes(tx: &mpsc::Sender<Bytes>, payload: String) -> bool {
    tx.send(Bytes::from(payload)).await.is_ok()
}

async fn run_stream(
    state: GatewayState,
    route: Route,
    translated: TranslatedRequest,
    request: ChatCompletionRequest,
    mut log: LogRecord,
    tx: mpsc::Sender<Bytes>,
) {
    let started = Instant::now();
    state.observability.record_upstream_call();

    let mut builder = state.http.post(&translated.url).json(&translated.body);
    for (name, value) in &translated.headers {
        builder = builder.header(*name, value);
    }
    if route.family != crate::catalog::Family::Google {
        builder = builder.header("accept", "text/event-stream");
    }

    let upstream = match builder.send().await {
        Ok(upstream) => upstream,
        Err(err) => {
            state.observability.record_upstream_error();
            let failure = RequestFailure::new(
                FailureCode::UpstreamTransportError,
                format!("upstream request failed: {err}"),
            );
            let body = failure.to_body(&[("usedProvider", route.provider_id.clone().into())]);
            send_bytes(&tx, crate::sse::encode_event(Some("error"), &body.to_string())).await;
            send_bytes(&tx, crate::sse::encode_event(Some("done"), "[DONE]")).await;
            log.has_error = true;
            log.error_details = Some(err.to_string());
            log.finish_reason = Some(FinishReason::UpstreamError.as_str().to_string());
            log.duration_ms = started.elapsed().as_millis() as u64;
            enqueue_log(&state, log).await;
            return;
        }
    };

    let status = upstream.status();
    if !status.is_success() {
        state.observability.record_upstream_error();
        let text = upstream.text().await.unwrap_or_default();
        let failure = upstream_failure(status.as_u16());
        let body = failure.to_body(&[
            ("usedProvider", route.provider_id.clone().into()),
            ("usedModel", route.provider_model.clone().into()),
            ("responseText", truncate(&text, 4_096).into()),
        ]);
        send_bytes(&tx, crate::sse::encode_event(Some("error"), &body.to_string())).await;
        send_bytes(&tx, crate::sse::encode_event(Some("done"), "[DONE]")).await;
        log.has_error = true;
        log.error_details = Some(truncate(&text, 4_096));
        log.finish_reason = Some(upstream_finish_reason(status.as_u16()).as_str().to_string());
        log.duration_ms = started.elapsed().as_millis() as u64;
        enqueue_log(&state, log).await;
        return;
    }

    let ctx = ChunkContext {
        id: format!("chatcmpl-{}", random_slug()),
        created: now_epoch_seconds(),
        model: request.model.clone(),
    };
    let mut parser = streaming::parser_for(route.family, ctx.clone(), state.config.stream_buffer_cap);

    let mut bytes_stream = upstream.bytes_stream().boxed();
    let mut client_gone = false;
    let mut canceled = false;
    let mut transport_error: Option<String> = None;
    let mut sent_bytes: u64 = 0;

    'outer: loop {
        tokio::select! {
            _ = tx.closed(), if !client_gone => {
                client_gone = true;
                // Cancellation-safe providers get aborted by dropping the
                // upstream body; everyone else runs to completion and the
                // log still records the full response.
                if route.cancellation {
                    canceled = true;
                    state.observability.record_stream_cancellation();
                    break 'outer;
                }
            }
            next = bytes_stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        for value in parser.feed(&chunk) {
                            if client_gone {
                                continue;
                            }
                            let payload = crate::sse::encode_event(None, &value.to_string());
                            let len = payload.len() as u64;
                            if send_bytes(&tx, payload).await {
                                sent_bytes = sent_bytes.saturating_add(len);
                            } else {
                                client_gone = true;
                                if route.cancellation {
                                    canceled = true;
                                    state.observability.record_stream_cancellation();
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        transport_error = Some(err.to_string());
                        break 'outer;
                    }
                    None => break 'outer,
                }
            }
        }
    }
    drop(bytes_stream);

    let mut summary = parser.summary();
    let imputed =
        streaming::finalize_usage(&mut summary.usage, &request.messages, &summary.content);

    if canceled {
        // Best effort: the socket is usually gone already.
        send_bytes(
            &tx,
            crate::sse::encode_event(
                Some("canceled"),
                "{\"message\":\"request canceled by client\"}",
            ),
        )
        .await;
        send_bytes(&tx, crate::sse::encode_event(Some("done"), "[DONE]")).await;
        log.canceled = true;
        log.finish_reason = Some(FinishReason::Canceled.as_str().to_string());
    } else if let Some(err) = transport_error {
        state.observability.record_upstream_error();
        let failure = RequestFailure::new(
            FailureCode::UpstreamTransportError,
            format!("upstream stream failed: {err}"),
        );
        if !client_gone {
            let body = failure.to_body(&[("usedProvider", route.provider_id.clone().into())]);
            send_bytes(&tx, crate::sse::encode_event(Some("error"), &body.to_string())).await;
            send_bytes(&tx, crate::sse::encode_event(Some("done"), "[DONE]")).await;
        }
        log.has_error = true;
        log.error_details = Some(err);
        log.finish_reason = Some(FinishReason::UpstreamError.as_str().to_string());
    } else {
        if !client_gone && imputed {
            let chunk = streaming::usage_chunk(&ctx, &summary.usage);
            let payload = crate::sse::encode_event(None, &chunk.to_string());
            sent_bytes = sent_bytes.saturating_add(payload.len() as u64);
            send_bytes(&tx, payload).await;
        }
        if !client_gone {
            let done = crate::sse::encode_event(Some("done"), "[DONE]");
            sent_bytes = sent_bytes.saturating_add(done.len() as u64);
            send_bytes(&tx, done).await;
        }
        let finish = summary.finish_reason.clone().unwrap_or(FinishReason::Stop);
        log.finish_reason = Some(finish.as_str().to_string());
    }

    fill_usage_and_cost(&mut log, &route, &summary, imputed);
    log.content = Some(summary.content.clone());
    if !summary.tool_calls.is_empty() {
        log.tool_calls = serde_json::to_value(
            summary
                .tool_calls
                .iter()
                .enumerate()
                .map(|(index, call)| call.to_openai(index))
                .collect::<Vec<Value>>(),
        )
        .ok();
    }
    log.response_size = sent_bytes;
    log.duration_ms = started.elapsed().as_millis() as u64;
    enqueue_log(&state, log).await;
}

fn extract_request_id(headers: &HeaderMap) -> String {
    let supplied = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| {
            !value.is_empty()
                && value.len() <= 128
                && value
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });
    match supplied {
        Some(value) => value.to_string(),
        None => random_slug(),
    }
}

fn extract_custom_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        let Some(suffix) = name
            .to_ascii_lowercase()
            .strip_prefix("x-llmgateway-")
            .map(str::to_string)
        else {
            continue;
        };
        if suffix.is_empty() {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.insert(suffix, value.to_string());
    }
    out
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

pub(crate) fn failure_response(
    failure: &RequestFailure,
    request_id: &str,
    extra: &[(&str, Value)],
) -> Response {
    let body = failure.to_body(extra);
    let status =
        StatusCode::from_u16(failure.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &body, request_id)
}

fn json_response(status: StatusCode, body: &Value, request_id: &str) -> Response {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        "content-type",
        axum::http::HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = request_id.parse() {
        headers.insert("x-request-id", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_sanitized_or_regenerated() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "req-abc_123".parse().expect("value"));
        assert_eq!(extract_request_id(&headers), "req-abc_123");

        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "has spaces".parse().expect("value"));
        let generated = extract_request_id(&headers);
        assert_eq!(generated.len(), 40);

        let generated = extract_request_id(&HeaderMap::new());
        assert_eq!(generated.len(), 40);
    }

    #[test]
    fn custom_headers_are_collected_lowercased() {
        let mut headers = HeaderMap::new();
        headers.insert("X-LLMGateway-Trace", "abc".parse().expect("value"));
        headers.insert("x-llmgateway-team", "infra".parse().expect("value"));
        headers.insert("x-other", "ignored".parse().expect("value"));
        let custom = extract_custom_headers(&headers);
        assert_eq!(custom.len(), 2);
        assert_eq!(custom.get("trace").map(String::as_str), Some("abc"));
        assert_eq!(custom.get("team").map(String::as_str), Some("infra"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        let text = "héllo";
        let cut = truncate(text, 2);
        assert!(text.starts_with(&cut));
    }
}
