//! Persisted-state records and the interfaces the gateway consumes them
//! through. Schemas belong to the backing store; only the semantics here
//! are load-bearing.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payment processor error: {0}")]
    Payment(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingMode {
    #[serde(rename = "api-keys")]
    ApiKeys,
    #[serde(rename = "credits")]
    Credits,
    #[serde(rename = "hybrid")]
    Hybrid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionLevel {
    All,
    /// Strip message bodies and completion content before persisting.
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPlan {
    Free,
    Pro,
    Enterprise,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub organization_id: String,
    pub mode: BillingMode,
    /// 0 disables response caching for this project.
    #[serde(default)]
    pub cache_ttl_seconds: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    /// Signed micro-USD; balances may go negative.
    pub credits_micros: i64,
    #[serde(default)]
    pub auto_topup: bool,
    #[serde(default)]
    pub topup_threshold_micros: i64,
    #[serde(default)]
    pub topup_amount_micros: i64,
    #[serde(default)]
    pub default_payment_method: Option<String>,
    pub plan: BillingPlan,
    #[serde(default)]
    pub processor_customer_id: Option<String>,
    pub retention: RetentionLevel,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub token: String,
    pub project_id: String,
    pub status: KeyStatus,
}

/// A stored upstream credential. For custom providers `provider_id` is the
/// org-chosen name and `base_url` is required.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderKey {
    pub id: String,
    pub organization_id: String,
    pub provider_id: String,
    pub token: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub status: KeyStatus,
    #[serde(default)]
    pub custom: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopupTransaction {
    pub id: String,
    pub organization_id: String,
    pub status: TransactionStatus,
    #[serde(default)]
    pub payment_intent_id: Option<String>,
    pub base_amount_micros: i64,
    pub fee_micros: i64,
    pub total_amount_micros: i64,
    pub created_at_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// One row per completed, failed, or canceled request. Created once,
/// enqueued, persisted, then immutable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogRecord {
    pub request_id: String,
    pub organization_id: String,
    pub project_id: String,
    pub api_key_id: String,
    pub mode: Option<BillingMode>,
    pub requested_model: String,
    #[serde(default)]
    pub requested_provider: Option<String>,
    #[serde(default)]
    pub used_model: Option<String>,
    #[serde(default)]
    pub used_provider: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub reasoning_tokens: Option<u32>,
    #[serde(default)]
    pub cached_tokens: Option<u32>,
    #[serde(default)]
    pub input_cost_micros: u64,
    #[serde(default)]
    pub output_cost_micros: u64,
    #[serde(default)]
    pub cached_input_cost_micros: u64,
    #[serde(default)]
    pub request_cost_micros: u64,
    #[serde(default)]
    pub total_cost_micros: u64,
    #[serde(default)]
    pub estimated_cost: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub response_size: u64,
    #[serde(default)]
    pub streamed: bool,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub has_error: bool,
    #[serde(default)]
    pub error_details: Option<String>,
    /// Request messages; stripped under `RetentionLevel::None`.
    #[serde(default)]
    pub messages: Option<Value>,
    /// Completion content; stripped under `RetentionLevel::None`.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Value>,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    pub created_at_ms: u64,
}

impl LogRecord {
    /// Whether this row should debit organization credits.
    pub fn billable(&self) -> bool {
        !self.cached && self.mode.is_some_and(|mode| mode != BillingMode::ApiKeys)
    }

    pub fn apply_retention(&mut self, retention: RetentionLevel) {
        if retention == RetentionLevel::None {
            self.messages = None;
            self.content = None;
        }
    }
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn api_key_by_token(&self, token: &str) -> StoreResult<Option<ApiKey>>;
    async fn project(&self, id: &str) -> StoreResult<Option<Project>>;
    async fn organization(&self, id: &str) -> StoreResult<Option<Organization>>;
    /// Active stored keys for an org, custom definitions included.
    async fn provider_keys(&self, organization_id: &str) -> StoreResult<Vec<ProviderKey>>;

    /// Insert a log row; returns false when `request_id` already exists
    /// (recovered duplicates are dropped, not re-inserted).
    async fn insert_log(&self, log: &LogRecord) -> StoreResult<bool>;
    /// Atomic `credits = credits - amount`; never read-modify-write.
    async fn debit_credits(&self, organization_id: &str, amount_micros: i64) -> StoreResult<()>;
    async fn credit_credits(&self, organization_id: &str, amount_micros: i64) -> StoreResult<()>;

    async fn organizations_for_topup(&self) -> StoreResult<Vec<Organization>>;
    async fn latest_topup(&self, organization_id: &str) -> StoreResult<Option<TopupTransaction>>;
    async fn insert_topup(&self, transaction: &TopupTransaction) -> StoreResult<()>;
    async fn set_topup_status(
        &self,
        id: &str,
        status: TransactionStatus,
        payment_intent_id: Option<&str>,
        error: Option<&str>,
    ) -> StoreResult<()>;

    /// Conditional-insert advisory lock; a holder older than `stale_after`
    /// is preempted.
    async fn try_acquire_lock(
        &self,
        key: &str,
        stale_after: Duration,
        now_ms: u64,
    ) -> StoreResult<bool>;
    async fn release_lock(&self, key: &str) -> StoreResult<()>;
}

#[derive(Clone, Debug)]
pub struct QueueMessage {
    pub id: i64,
    pub payload: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct QueueDepths {
    pub main: u64,
    pub processing: u64,
}

/// Durable main/processing queue pair feeding the log worker.
#[async_trait]
pub trait LogQueue: Send + Sync {
    async fn enqueue(&self, payload: String) -> StoreResult<()>;
    /// Atomically move up to `max` messages main -> processing.
    async fn claim(&self, max: usize) -> StoreResult<Vec<QueueMessage>>;
    /// Drop acknowledged messages from processing.
    async fn acknowledge(&self, ids: &[i64]) -> StoreResult<()>;
    /// Return a claimed batch to main after a persist failure.
    async fn recover(&self, ids: &[i64]) -> StoreResult<()>;
    /// Startup crash recovery: everything in processing goes back to main.
    async fn recover_all(&self) -> StoreResult<u64>;
    async fn depths(&self) -> StoreResult<QueueDepths>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentIntentStatus {
    Succeeded,
    RequiresAction,
    Failed,
}

#[derive(Clone, Debug)]
pub struct PaymentIntent {
    pub id: String,
    pub status: PaymentIntentStatus,
}

#[derive(Clone, Debug)]
pub struct PaymentMethod {
    pub id: String,
    pub card_country: Option<String>,
}

/// The payment processor SDK surface the topup loop needs; everything else
/// about the processor is out of scope.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn retrieve_payment_method(&self, id: &str) -> StoreResult<PaymentMethod>;
    /// Off-session, confirmed immediately.
    async fn create_payment_intent(
        &self,
        customer_id: &str,
        payment_method: &str,
        amount_micros: i64,
    ) -> StoreResult<PaymentIntent>;
}
