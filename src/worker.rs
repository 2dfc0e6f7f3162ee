//! The background accounting loop: claim queued log rows, persist them,
//! debit organization credits, and kick the auto-topup pass on its
//! cadence. The request path never waits on any of this.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::store::{
    Datastore, LogQueue, LogRecord, PaymentProcessor, QueueMessage, RetentionLevel, StoreResult,
};
use crate::topup::{self, FeeCalculator, StandardFees};
use crate::types::now_epoch_millis;

pub struct LogWorker {
    store: Arc<dyn Datastore>,
    queue: Arc<dyn LogQueue>,
    processor: Option<Arc<dyn PaymentProcessor>>,
    fees: Arc<dyn FeeCalculator>,
    config: RuntimeConfig,
}

pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
    grace: Duration,
}

impl WorkerHandle {
    /// Signal the loop and wait up to the grace period for it to drain.
    pub async fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        if tokio::time::timeout(self.grace, self.join).await.is_err() {
            tracing::warn!("log worker did not stop within the grace period");
        }
    }
}

impl LogWorker {
    pub fn new(store: Arc<dyn Datastore>, queue: Arc<dyn LogQueue>, config: RuntimeConfig) -> Self {
        Self {
            store,
            queue,
            processor: None,
            fees: Arc::new(StandardFees),
            config,
        }
    }

    /// Without a processor the topup cadence is skipped entirely.
    pub fn with_payment_processor(mut self, processor: Arc<dyn PaymentProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_fee_calculator(mut self, fees: Arc<dyn FeeCalculator>) -> Self {
        self.fees = fees;
        self
    }

    pub fn spawn(self) -> WorkerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let grace = self.config.stop_grace();
        let stop_flag = stop.clone();
        let join = tokio::spawn(async move {
            self.run(stop_flag).await;
        });
        WorkerHandle { stop, join, grace }
    }

    async fn run(&self, stop: Arc<AtomicBool>) {
        // Crash recovery: anything left in processing belongs to a dead
        // worker and goes back to the main queue.
        match self.queue.recover_all().await {
            Ok(recovered) if recovered > 0 => {
                tracing::info!(recovered, "recovered in-flight queue messages at startup");
            }
            Err(err) => tracing::error!(error = %err, "queue recovery failed at startup"),
            _ => {}
        }

        let topup_every = self.config.topup_every();
        let stats_every = self.config.stats_every();
        let mut iteration: u64 = 0;

        while !stop.load(Ordering::SeqCst) {
            iteration = iteration.wrapping_add(1);

            if let Err(err) = self.process_one_batch().await {
                tracing::error!(error = %err, "log batch processing failed");
            }

            if iteration % topup_every == 0 {
                if let Some(processor) = self.processor.as_ref() {
                    match topup::run_topup_pass(
                        self.store.as_ref(),
                        processor.as_ref(),
                        self.fees.as_ref(),
                        now_epoch_millis(),
                    )
                    .await
                    {
                        Ok(attempts) if attempts > 0 => {
                            tracing::info!(attempts, "auto-topup pass created payment intents");
                        }
                        Err(err) => tracing::error!(error = %err, "auto-topup pass failed"),
                        _ => {}
                    }
                }
            }

            if iteration % stats_every == 0 {
                match self.queue.depths().await {
                    Ok(depths) => tracing::info!(
                        main = depths.main,
                        processing = depths.processing,
                        "queue depth"
                    ),
                    Err(err) => tracing::error!(error = %err, "queue depth read failed"),
                }
            }

            tokio::time::sleep(self.config.worker_tick()).await;
        }
    }

    /// Claim up to one batch and persist it. A persistence failure sends
    /// the whole batch back to the main queue; the loop carries on.
    pub async fn process_one_batch(&self) -> StoreResult<()> {
        let batch = self.queue.claim(self.config.claim_batch_size).await?;
        if batch.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = batch.iter().map(|message| message.id).collect();

        match self.persist_batch(&batch).await {
            Ok(()) => self.queue.acknowledge(&ids).await,
            Err(err) => {
                tracing::error!(error = %err, batch = ids.len(), "persist failed; recovering batch");
                self.queue.recover(&ids).await?;
                Ok(())
            }
        }
    }

    async fn persist_batch(&self, batch: &[QueueMessage]) -> StoreResult<()> {
        let mut debits: BTreeMap<String, u64> = BTreeMap::new();

        for message in batch {
            // An unparseable message is discarded alone; it must not
            // poison the batch.
            let mut log: LogRecord = match serde_json::from_str(&message.payload) {
                Ok(log) => log,
                Err(err) => {
                    tracing::error!(
                        queue_id = message.id,
                        error = %err,
                        "discarding invalid queue message"
                    );
                    continue;
                }
            };

            let retention = self
                .store
                .organization(&log.organization_id)
                .await?
                .map(|organization| organization.retention)
                .unwrap_or(RetentionLevel::All);
            log.apply_retention(retention);

            let inserted = self.store.insert_log(&log).await?;
            if inserted && log.billable() && log.total_cost_micros > 0 {
                let entry = debits.entry(log.organization_id.clone()).or_insert(0);
                *entry = entry.saturating_add(log.total_cost_micros);
            }
        }

        // One conditional update per org; debits are commutative sums.
        for (organization_id, amount) in debits {
            self.store
                .debit_credits(&organization_id, amount as i64)
                .await?;
        }
        Ok(())
    }
}
