//! In-memory store and queue, used in development and by the test suite.
//! Semantics mirror the sqlite implementations.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::{
    ApiKey, Datastore, LogQueue, LogRecord, Organization, Project, ProviderKey, QueueDepths,
    QueueMessage, StoreResult, TopupTransaction, TransactionStatus,
};

#[derive(Default)]
struct MemoryState {
    api_keys: Vec<ApiKey>,
    projects: Vec<Project>,
    organizations: Vec<Organization>,
    provider_keys: Vec<ProviderKey>,
    logs: Vec<LogRecord>,
    topups: Vec<TopupTransaction>,
    locks: HashMap<String, u64>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_api_key(&self, key: ApiKey) {
        self.state.lock().await.api_keys.push(key);
    }

    pub async fn add_project(&self, project: Project) {
        self.state.lock().await.projects.push(project);
    }

    pub async fn add_organization(&self, organization: Organization) {
        self.state.lock().await.organizations.push(organization);
    }

    pub async fn add_provider_key(&self, key: ProviderKey) {
        self.state.lock().await.provider_keys.push(key);
    }

    pub async fn logs(&self) -> Vec<LogRecord> {
        self.state.lock().await.logs.clone()
    }

    pub async fn topups(&self) -> Vec<TopupTransaction> {
        self.state.lock().await.topups.clone()
    }

    pub async fn credits(&self, organization_id: &str) -> Option<i64> {
        self.state
            .lock()
            .await
            .organizations
            .iter()
            .find(|org| org.id == organization_id)
            .map(|org| org.credits_micros)
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn api_key_by_token(&self, token: &str) -> StoreResult<Option<ApiKey>> {
        let state = self.state.lock().await;
        Ok(state
            .api_keys
            .iter()
            .find(|key| key.token == token)
            .cloned())
    }

    async fn project(&self, id: &str) -> StoreResult<Option<Project>> {
        let state = self.state.lock().await;
        Ok(state.projects.iter().find(|project| project.id == id).cloned())
    }

    async fn organization(&self, id: &str) -> StoreResult<Option<Organization>> {
        let state = self.state.lock().await;
        Ok(state
            .organizations
            .iter()
            .find(|org| org.id == id)
            .cloned())
    }

    async fn provider_keys(&self, organization_id: &str) -> StoreResult<Vec<ProviderKey>> {
        let state = self.state.lock().await;
        Ok(state
            .provider_keys
            .iter()
            .filter(|key| key.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn insert_log(&self, log: &LogRecord) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state
            .logs
            .iter()
            .any(|existing| existing.request_id == log.request_id)
        {
            return Ok(false);
        }
        state.logs.push(log.clone());
        Ok(true)
    }

    async fn debit_credits(&self, organization_id: &str, amount_micros: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(org) = state
            .organizations
            .iter_mut()
            .find(|org| org.id == organization_id)
        {
            org.credits_micros = org.credits_micros.saturating_sub(amount_micros);
        }
        Ok(())
    }

    async fn credit_credits(&self, organization_id: &str, amount_micros: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(org) = state
            .organizations
            .iter_mut()
            .find(|org| org.id == organization_id)
        {
            org.credits_micros = org.credits_micros.saturating_add(amount_micros);
        }
        Ok(())
    }

    async fn organizations_for_topup(&self) -> StoreResult<Vec<Organization>> {
        let state = self.state.lock().await;
        Ok(state
            .organizations
            .iter()
            .filter(|org| org.auto_topup && org.credits_micros < org.topup_threshold_micros)
            .cloned()
            .collect())
    }

    async fn latest_topup(&self, organization_id: &str) -> StoreResult<Option<TopupTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .topups
            .iter()
            .filter(|tx| tx.organization_id == organization_id)
            .max_by_key(|tx| tx.created_at_ms)
            .cloned())
    }

    async fn insert_topup(&self, transaction: &TopupTransaction) -> StoreResult<()> {
        self.state.lock().await.topups.push(transaction.clone());
        Ok(())
    }

    async fn set_topup_status(
        &self,
        id: &str,
        status: TransactionStatus,
        payment_intent_id: Option<&str>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.topups.iter_mut().find(|tx| tx.id == id) {
            tx.status = status;
            if let Some(intent) = payment_intent_id {
                tx.payment_intent_id = Some(intent.to_string());
            }
            if let Some(error) = error {
                tx.error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        stale_after: Duration,
        now_ms: u64,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.locks.get(key) {
            Some(held_at) => {
                let stale = now_ms.saturating_sub(*held_at) >= stale_after.as_millis() as u64;
                if !stale {
                    return Ok(false);
                }
                state.locks.insert(key.to_string(), now_ms);
                Ok(true)
            }
            None => {
                state.locks.insert(key.to_string(), now_ms);
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, key: &str) -> StoreResult<()> {
        self.state.lock().await.locks.remove(key);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryQueueState {
    next_id: i64,
    main: Vec<QueueMessage>,
    processing: Vec<QueueMessage>,
}

#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogQueue for MemoryQueue {
    async fn enqueue(&self, payload: String) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.main.push(QueueMessage { id, payload });
        Ok(())
    }

    async fn claim(&self, max: usize) -> StoreResult<Vec<QueueMessage>> {
        let mut state = self.state.lock().await;
        let take = max.min(state.main.len());
        let claimed: Vec<QueueMessage> = state.main.drain(..take).collect();
        state.processing.extend(claimed.iter().cloned());
        Ok(claimed)
    }

    async fn acknowledge(&self, ids: &[i64]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.processing.retain(|message| !ids.contains(&message.id));
        Ok(())
    }

    async fn recover(&self, ids: &[i64]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let mut recovered: Vec<QueueMessage> = Vec::new();
        state.processing.retain(|message| {
            if ids.contains(&message.id) {
                recovered.push(message.clone());
                false
            } else {
                true
            }
        });
        // Recovered messages go to the front so retries keep arrival order.
        recovered.extend(state.main.drain(..));
        state.main = recovered;
        Ok(())
    }

    async fn recover_all(&self) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let count = state.processing.len() as u64;
        let mut recovered: Vec<QueueMessage> = state.processing.drain(..).collect();
        recovered.extend(state.main.drain(..));
        state.main = recovered;
        Ok(count)
    }

    async fn depths(&self) -> StoreResult<QueueDepths> {
        let state = self.state.lock().await;
        Ok(QueueDepths {
            main: state.main.len() as u64,
            processing: state.processing.len() as u64,
        })
    }
}
