use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Clone, Debug, Default, Serialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub upstream_calls: u64,
    pub upstream_errors: u64,
    pub stream_cancellations: u64,
    pub logs_enqueued: u64,
}

#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_errors: AtomicU64,
    stream_cancellations: AtomicU64,
    logs_enqueued: AtomicU64,
}

impl Observability {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_call(&self) {
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_cancellation(&self) {
        self.stream_cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_log_enqueued(&self) {
        self.logs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            stream_cancellations: self.stream_cancellations.load(Ordering::Relaxed),
            logs_enqueued: self.logs_enqueued.load(Ordering::Relaxed),
        }
    }
}
