//! Auto-topup: charge the stored payment method of organizations whose
//! balance fell under their threshold, at most once per hour per org,
//! serialized across processes by a table-backed lock.

use std::time::Duration;

use crate::store::{
    BillingPlan, Datastore, Organization, PaymentIntentStatus, PaymentProcessor, StoreResult,
    TopupTransaction, TransactionStatus,
};
use crate::types::random_slug;

pub const TOPUP_LOCK_KEY: &str = "auto_topup_check";
const LOCK_LEASE: Duration = Duration::from_secs(600);
const RECENT_WINDOW_MS: u64 = 3_600_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub base_amount_micros: i64,
    pub total_fees_micros: i64,
    pub total_amount_micros: i64,
}

/// Fee computation is owned by billing; the loop only needs the split.
pub trait FeeCalculator: Send + Sync {
    fn fees_for(
        &self,
        plan: BillingPlan,
        card_country: Option<&str>,
        base_amount_micros: i64,
    ) -> FeeBreakdown;
}

/// Card processing fees: 2.9% + $0.30, plus 1.5% for non-US cards.
/// Enterprise plans absorb fees into their invoice instead.
#[derive(Debug, Default)]
pub struct StandardFees;

impl FeeCalculator for StandardFees {
    fn fees_for(
        &self,
        plan: BillingPlan,
        card_country: Option<&str>,
        base_amount_micros: i64,
    ) -> FeeBreakdown {
        if plan == BillingPlan::Enterprise {
            return FeeBreakdown {
                base_amount_micros,
                total_fees_micros: 0,
                total_amount_micros: base_amount_micros,
            };
        }
        let mut rate_millis: i64 = 29;
        if card_country.is_some_and(|country| !country.eq_ignore_ascii_case("US")) {
            rate_millis += 15;
        }
        let percentage = base_amount_micros.saturating_mul(rate_millis) / 1_000;
        let total_fees_micros = percentage.saturating_add(300_000);
        FeeBreakdown {
            base_amount_micros,
            total_fees_micros,
            total_amount_micros: base_amount_micros.saturating_add(total_fees_micros),
        }
    }
}

/// One full pass: lock, select, charge, release. Returns the number of
/// payment intents created.
pub async fn run_topup_pass(
    store: &dyn Datastore,
    processor: &dyn PaymentProcessor,
    fees: &dyn FeeCalculator,
    now_ms: u64,
) -> StoreResult<u32> {
    if !store.try_acquire_lock(TOPUP_LOCK_KEY, LOCK_LEASE, now_ms).await? {
        return Ok(0);
    }
    let result = pass_locked(store, processor, fees, now_ms).await;
    if let Err(err) = store.release_lock(TOPUP_LOCK_KEY).await {
        tracing::error!(error = %err, "failed to release topup lock");
    }
    result
}

async fn pass_locked(
    store: &dyn Datastore,
    processor: &dyn PaymentProcessor,
    fees: &dyn FeeCalculator,
    now_ms: u64,
) -> StoreResult<u32> {
    let mut attempts = 0u32;
    for organization in store.organizations_for_topup().await? {
        match attempt_topup(store, processor, fees, &organization, now_ms).await {
            Ok(true) => attempts += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::error!(
                    organization = %organization.id,
                    error = %err,
                    "auto-topup attempt failed"
                );
            }
        }
    }
    Ok(attempts)
}

async fn attempt_topup(
    store: &dyn Datastore,
    processor: &dyn PaymentProcessor,
    fees: &dyn FeeCalculator,
    organization: &Organization,
    now_ms: u64,
) -> StoreResult<bool> {
    // At most one attempt per hour, whatever the last one's outcome.
    if let Some(last) = store.latest_topup(&organization.id).await? {
        if now_ms.saturating_sub(last.created_at_ms) < RECENT_WINDOW_MS {
            return Ok(false);
        }
    }
    let Some(payment_method) = organization.default_payment_method.as_deref() else {
        tracing::warn!(
            organization = %organization.id,
            "auto-topup enabled but no default payment method"
        );
        return Ok(false);
    };
    let Some(customer_id) = organization.processor_customer_id.as_deref() else {
        tracing::warn!(
            organization = %organization.id,
            "auto-topup enabled but no processor customer"
        );
        return Ok(false);
    };
    if organization.topup_amount_micros <= 0 {
        return Ok(false);
    }

    let card_country = match processor.retrieve_payment_method(payment_method).await {
        Ok(method) => method.card_country,
        Err(err) => {
            tracing::warn!(
                organization = %organization.id,
                error = %err,
                "could not retrieve payment method"
            );
            return Ok(false);
        }
    };

    let breakdown = fees.fees_for(
        organization.plan,
        card_country.as_deref(),
        organization.topup_amount_micros,
    );
    let transaction = TopupTransaction {
        id: format!("txn-{}", random_slug()),
        organization_id: organization.id.clone(),
        status: TransactionStatus::Pending,
        payment_intent_id: None,
        base_amount_micros: breakdown.base_amount_micros,
        fee_micros: breakdown.total_fees_micros,
        total_amount_micros: breakdown.total_amount_micros,
        created_at_ms: now_ms,
        error: None,
    };
    store.insert_topup(&transaction).await?;

    match processor
        .create_payment_intent(customer_id, payment_method, breakdown.total_amount_micros)
        .await
    {
        Ok(intent) => match intent.status {
            // The webhook flips the row to succeeded and credits the org.
            PaymentIntentStatus::Succeeded | PaymentIntentStatus::RequiresAction => {
                store
                    .set_topup_status(
                        &transaction.id,
                        TransactionStatus::Pending,
                        Some(&intent.id),
                        None,
                    )
                    .await?;
            }
            PaymentIntentStatus::Failed => {
                store
                    .set_topup_status(
                        &transaction.id,
                        TransactionStatus::Failed,
                        Some(&intent.id),
                        Some("payment intent was not confirmed"),
                    )
                    .await?;
            }
        },
        Err(err) => {
            store
                .set_topup_status(
                    &transaction.id,
                    TransactionStatus::Failed,
                    None,
                    Some(&err.to_string()),
                )
                .await?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::store::{PaymentIntent, PaymentMethod, RetentionLevel, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeProcessor {
        intents_created: AtomicU32,
        status: PaymentIntentStatus,
        fail: bool,
    }

    impl FakeProcessor {
        fn succeeding() -> Self {
            Self {
                intents_created: AtomicU32::new(0),
                status: PaymentIntentStatus::Succeeded,
                fail: false,
            }
        }

        fn erroring() -> Self {
            Self {
                intents_created: AtomicU32::new(0),
                status: PaymentIntentStatus::Succeeded,
                fail: true,
            }
        }
    }

    #[async_trait]
    impl PaymentProcessor for FakeProcessor {
        async fn retrieve_payment_method(&self, id: &str) -> crate::store::StoreResult<PaymentMethod> {
            Ok(PaymentMethod {
                id: id.to_string(),
                card_country: Some("NO".to_string()),
            })
        }

        async fn create_payment_intent(
            &self,
            _customer_id: &str,
            _payment_method: &str,
            _amount_micros: i64,
        ) -> crate::store::StoreResult<PaymentIntent> {
            if self.fail {
                return Err(StoreError::Payment("card declined".to_string()));
            }
            self.intents_created.fetch_add(1, Ordering::SeqCst);
            Ok(PaymentIntent {
                id: "pi_123".to_string(),
                status: self.status,
            })
        }
    }

    fn low_balance_org(id: &str) -> Organization {
        Organization {
            id: id.to_string(),
            credits_micros: 100_000,
            auto_topup: true,
            topup_threshold_micros: 5_000_000,
            topup_amount_micros: 20_000_000,
            default_payment_method: Some("pm_1".to_string()),
            plan: BillingPlan::Pro,
            processor_customer_id: Some("cus_1".to_string()),
            retention: RetentionLevel::All,
        }
    }

    #[test]
    fn standard_fees_split_domestic_and_international() {
        let fees = StandardFees;
        let domestic = fees.fees_for(BillingPlan::Pro, Some("US"), 10_000_000);
        assert_eq!(domestic.total_fees_micros, 290_000 + 300_000);
        assert_eq!(domestic.total_amount_micros, 10_590_000);

        let international = fees.fees_for(BillingPlan::Pro, Some("NO"), 10_000_000);
        assert_eq!(international.total_fees_micros, 440_000 + 300_000);

        let enterprise = fees.fees_for(BillingPlan::Enterprise, Some("NO"), 10_000_000);
        assert_eq!(enterprise.total_fees_micros, 0);
    }

    #[tokio::test]
    async fn pass_creates_a_pending_transaction_with_intent_id() {
        let store = MemoryStore::new();
        store.add_organization(low_balance_org("org-1")).await;
        let processor = FakeProcessor::succeeding();

        let attempts = run_topup_pass(&store, &processor, &StandardFees, 10_000_000)
            .await
            .expect("pass");
        assert_eq!(attempts, 1);

        let topups = store.topups().await;
        assert_eq!(topups.len(), 1);
        assert_eq!(topups[0].status, TransactionStatus::Pending);
        assert_eq!(topups[0].payment_intent_id.as_deref(), Some("pi_123"));
        assert_eq!(topups[0].base_amount_micros, 20_000_000);
        assert!(topups[0].total_amount_micros > 20_000_000);
    }

    #[tokio::test]
    async fn recent_transactions_suppress_new_attempts() {
        let store = MemoryStore::new();
        store.add_organization(low_balance_org("org-1")).await;
        let processor = FakeProcessor::succeeding();

        let first = run_topup_pass(&store, &processor, &StandardFees, 10_000_000)
            .await
            .expect("pass");
        assert_eq!(first, 1);

        // Thirty minutes later: skipped.
        let second = run_topup_pass(&store, &processor, &StandardFees, 10_000_000 + 1_800_000)
            .await
            .expect("pass");
        assert_eq!(second, 0);
        assert_eq!(store.topups().await.len(), 1);

        // Past the hour: a fresh attempt goes out.
        let third = run_topup_pass(&store, &processor, &StandardFees, 10_000_000 + 3_700_000)
            .await
            .expect("pass");
        assert_eq!(third, 1);
        assert_eq!(store.topups().await.len(), 2);
    }

    #[tokio::test]
    async fn processor_errors_mark_the_transaction_failed() {
        let store = MemoryStore::new();
        store.add_organization(low_balance_org("org-1")).await;
        let processor = FakeProcessor::erroring();

        run_topup_pass(&store, &processor, &StandardFees, 10_000_000)
            .await
            .expect("pass");
        let topups = store.topups().await;
        assert_eq!(topups.len(), 1);
        assert_eq!(topups[0].status, TransactionStatus::Failed);
        assert!(topups[0]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("card declined")));
    }

    #[tokio::test]
    async fn missing_payment_method_skips_without_a_row() {
        let store = MemoryStore::new();
        let mut org = low_balance_org("org-1");
        org.default_payment_method = None;
        store.add_organization(org).await;
        let processor = FakeProcessor::succeeding();

        let attempts = run_topup_pass(&store, &processor, &StandardFees, 10_000_000)
            .await
            .expect("pass");
        assert_eq!(attempts, 0);
        assert!(store.topups().await.is_empty());
    }

    #[tokio::test]
    async fn held_lock_blocks_the_pass() {
        let store = MemoryStore::new();
        store.add_organization(low_balance_org("org-1")).await;
        let processor = FakeProcessor::succeeding();

        assert!(store
            .try_acquire_lock(TOPUP_LOCK_KEY, LOCK_LEASE, 10_000_000)
            .await
            .expect("acquire"));
        let attempts = run_topup_pass(&store, &processor, &StandardFees, 10_000_100)
            .await
            .expect("pass");
        assert_eq!(attempts, 0);
        assert!(store.topups().await.is_empty());

        // A stale holder is preempted and the pass proceeds.
        let attempts = run_topup_pass(&store, &processor, &StandardFees, 10_000_000 + 600_000)
            .await
            .expect("pass");
        assert_eq!(attempts, 1);
    }
}
