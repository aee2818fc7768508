// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing Reconciliation
//!
//! End-to-end scenarios through `WebhookHandler::handle_event` against the
//! in-memory ledger:
//! - Duplicate and concurrent deliveries
//! - Payments, installments and delayed settlement
//! - Refunds and disputes, including reordering
//! - Subscription lifecycle and Connect status
//! - Failure handling (claim release, side-effect isolation)

#[cfg(test)]
mod harness {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use uuid::Uuid;

    use crate::email::{EmailConfig, ReceiptMailer};
    use crate::error::{BillingError, BillingResult};
    use crate::events::WebhookEnvelope;
    use crate::models::{
        ConnectStatus, InstallmentStatus, Invoice, InvoiceInstallment, InvoiceStatus, Organisation,
        SubscriptionStatus,
    };
    use crate::notifications::{
        MemoryNotificationSink, NotificationSink, PaymentNotification, SideEffects,
    };
    use crate::plans::{PlanCatalog, SeatLimits};
    use crate::signature::{SignatureVerifier, DEFAULT_TOLERANCE_SECS};
    use crate::store::MemoryLedgerStore;
    use crate::webhooks::{WebhookHandler, WebhookOutcome};

    pub const CREATED_AT: i64 = 1_760_000_000;

    pub struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn publish(&self, _notification: &PaymentNotification) -> BillingResult<()> {
            Err(BillingError::Database("notification feed offline".to_string()))
        }
    }

    pub struct Harness {
        pub store: Arc<MemoryLedgerStore>,
        pub sink: Arc<MemoryNotificationSink>,
        pub handler: Arc<WebhookHandler>,
    }

    impl Harness {
        pub fn new() -> Self {
            let sink = Arc::new(MemoryNotificationSink::new());
            Self::with_sink(sink.clone(), sink)
        }

        pub fn with_failing_notifications() -> Self {
            Self::with_sink(Arc::new(FailingSink), Arc::new(MemoryNotificationSink::new()))
        }

        fn with_sink(
            effects_sink: Arc<dyn NotificationSink>,
            sink: Arc<MemoryNotificationSink>,
        ) -> Self {
            let store = Arc::new(MemoryLedgerStore::new());
            let catalog = PlanCatalog::default()
                .with_price("price_studio_monthly", "studio")
                .with_price("price_academy_annual", "academy");
            let handler = WebhookHandler::new(
                SignatureVerifier::new("whsec_edge_cases", DEFAULT_TOLERANCE_SECS),
                store.clone(),
                Arc::new(catalog),
                SideEffects::new(
                    effects_sink,
                    Arc::new(ReceiptMailer::new(EmailConfig::disabled())),
                ),
            );
            Self {
                store,
                sink,
                handler: Arc::new(handler),
            }
        }

        pub async fn deliver(
            &self,
            event_id: &str,
            event_type: &str,
            object: Value,
        ) -> BillingResult<WebhookOutcome> {
            self.handler
                .handle_event(envelope(event_id, event_type, object))
                .await
        }

        pub async fn seed_invoice(&self, total_minor: i64) -> Invoice {
            let invoice = Invoice {
                id: Uuid::new_v4(),
                org_id: Uuid::new_v4(),
                invoice_number: "LL-2042".to_string(),
                currency: "gbp".to_string(),
                total_minor,
                paid_minor: 0,
                status: InvoiceStatus::Sent,
                payer_email: Some("parent@example.com".to_string()),
                paid_at: None,
            };
            self.store.insert_invoice(invoice.clone()).await;
            invoice
        }

        pub async fn seed_installments(&self, invoice_id: Uuid, amounts: &[i64]) -> Vec<Uuid> {
            let mut ids = Vec::new();
            for (n, amount) in amounts.iter().enumerate() {
                let installment = InvoiceInstallment {
                    id: Uuid::new_v4(),
                    invoice_id,
                    installment_number: n as i32 + 1,
                    amount_minor: *amount,
                    status: InstallmentStatus::Pending,
                    external_payment_ref: None,
                    paid_at: None,
                };
                ids.push(installment.id);
                self.store.insert_installment(installment).await;
            }
            ids
        }

        pub async fn seed_organisation(&self) -> Organisation {
            let organisation = Organisation {
                id: Uuid::new_v4(),
                subscription_plan: "trial".to_string(),
                subscription_status: SubscriptionStatus::Trialing,
                trial_ends_at: None,
                external_subscription_ref: None,
                limits: SeatLimits::new(50, 5),
                past_due_since: None,
                cancels_at: None,
                connect_account_ref: None,
                connect_status: ConnectStatus::Pending,
            };
            self.store.insert_organisation(organisation.clone()).await;
            organisation
        }

        pub async fn invoice(&self, id: Uuid) -> Invoice {
            use crate::store::LedgerStore;
            self.store.invoice(id).await.unwrap().unwrap()
        }

        pub async fn organisation(&self, id: Uuid) -> Organisation {
            use crate::store::LedgerStore;
            self.store.organisation(id).await.unwrap().unwrap()
        }

        /// Wait until `count` notifications are published, then let any
        /// stragglers land so over-publishing is visible.
        pub async fn notifications(&self, count: usize) -> Vec<PaymentNotification> {
            for _ in 0..100 {
                if self.sink.published().await.len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.sink.published().await
        }
    }

    pub fn envelope(event_id: &str, event_type: &str, object: Value) -> WebhookEnvelope {
        serde_json::from_value(json!({
            "id": event_id,
            "type": event_type,
            "created": CREATED_AT,
            "data": { "object": object }
        }))
        .unwrap()
    }

    pub fn payment_intent(reference: &str, invoice_id: Uuid, amount: i64) -> Value {
        json!({
            "id": reference,
            "amount": amount,
            "amount_received": amount,
            "payment_method_types": ["card"],
            "metadata": { "invoice_id": invoice_id.to_string() }
        })
    }

    pub fn debit_intent(reference: &str, invoice_id: Uuid, amount: i64) -> Value {
        json!({
            "id": reference,
            "amount": amount,
            "payment_method_types": ["bacs_debit"],
            "metadata": { "invoice_id": invoice_id.to_string() }
        })
    }

    pub fn refund(reference: &str, payment_ref: Option<&str>, amount: i64, status: &str) -> Value {
        json!({
            "id": reference,
            "amount": amount,
            "status": status,
            "payment_intent": payment_ref
        })
    }

    pub fn subscription(reference: &str, org_id: Uuid, status: &str, price: &str) -> Value {
        json!({
            "id": reference,
            "status": status,
            "items": { "data": [ { "price": { "id": price } } ] },
            "metadata": { "org_id": org_id.to_string() }
        })
    }
}

#[cfg(test)]
mod deduplication_tests {
    use super::harness::*;
    use crate::error::BillingError;
    use crate::models::{InvoiceStatus, PaymentStatus};
    use crate::webhooks::WebhookOutcome;

    // =========================================================================
    // Two payments, each delivered twice: two rows, full total, paid
    // =========================================================================
    #[tokio::test]
    async fn test_double_delivery_of_two_payments() {
        let h = Harness::new();
        let inv = h.seed_invoice(10_000).await;

        let a = payment_intent("pi_a", inv.id, 5_000);
        let b = payment_intent("pi_b", inv.id, 5_000);

        assert_eq!(
            h.deliver("evt_a", "payment_intent.succeeded", a.clone()).await.unwrap(),
            WebhookOutcome::Processed
        );
        assert_eq!(
            h.deliver("evt_a", "payment_intent.succeeded", a).await.unwrap(),
            WebhookOutcome::Duplicate
        );
        assert_eq!(
            h.deliver("evt_b", "payment_intent.succeeded", b.clone()).await.unwrap(),
            WebhookOutcome::Processed
        );
        assert_eq!(
            h.deliver("evt_b", "payment_intent.succeeded", b).await.unwrap(),
            WebhookOutcome::Duplicate
        );

        let payments = h.store.payments_for_invoice(inv.id).await;
        assert_eq!(payments.len(), 2);
        assert!(payments.iter().all(|p| p.status == PaymentStatus::Succeeded));

        let updated = h.invoice(inv.id).await;
        assert_eq!(updated.paid_minor, 10_000);
        assert_eq!(updated.status, InvoiceStatus::Paid);
        assert!(updated.paid_at.is_some());

        assert_eq!(h.notifications(2).await.len(), 2);
    }

    // =========================================================================
    // Same payment reported by two different events (checkout + intent)
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_and_intent_converge_on_one_payment() {
        let h = Harness::new();
        let inv = h.seed_invoice(8_000).await;

        let session = serde_json::json!({
            "id": "cs_1",
            "mode": "payment",
            "payment_status": "paid",
            "payment_intent": "pi_same",
            "amount_total": 8_000,
            "payment_method_types": ["card"],
            "metadata": { "invoice_id": inv.id.to_string() }
        });
        h.deliver("evt_cs", "checkout.session.completed", session).await.unwrap();
        h.deliver("evt_pi", "payment_intent.succeeded", payment_intent("pi_same", inv.id, 8_000))
            .await
            .unwrap();

        assert_eq!(h.store.payments_for_invoice(inv.id).await.len(), 1);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 8_000);
        // Only the first event applied the payment
        assert_eq!(h.notifications(1).await.len(), 1);
    }

    // =========================================================================
    // Concurrent deliveries of one event id: exactly one is processed
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_deliveries() {
        let h = Harness::new();
        let inv = h.seed_invoice(5_000).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handler = h.handler.clone();
            let object = payment_intent("pi_race", inv.id, 5_000);
            tasks.push(tokio::spawn(async move {
                handler
                    .handle_event(envelope("evt_race", "payment_intent.succeeded", object))
                    .await
                    .unwrap()
            }));
        }

        let mut processed = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                WebhookOutcome::Processed => processed += 1,
                WebhookOutcome::Duplicate => duplicates += 1,
                WebhookOutcome::Ignored => panic!("payment event ignored"),
            }
        }

        assert_eq!(processed, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(h.store.payments_for_invoice(inv.id).await.len(), 1);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 5_000);
    }

    // =========================================================================
    // Concurrent distinct payments for one invoice all count
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_payments_sum_correctly() {
        let h = Harness::new();
        let inv = h.seed_invoice(10_000).await;

        let mut tasks = Vec::new();
        for i in 0..4 {
            let handler = h.handler.clone();
            let object = payment_intent(&format!("pi_{}", i), inv.id, 2_500);
            tasks.push(tokio::spawn(async move {
                handler
                    .handle_event(envelope(
                        &format!("evt_{}", i),
                        "payment_intent.succeeded",
                        object,
                    ))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let updated = h.invoice(inv.id).await;
        assert_eq!(updated.paid_minor, 10_000);
        assert_eq!(updated.status, InvoiceStatus::Paid);
    }

    // =========================================================================
    // Store failure releases the claim so redelivery is processed
    // =========================================================================
    #[tokio::test]
    async fn test_handler_failure_releases_claim() {
        let h = Harness::new();
        let inv = h.seed_invoice(5_000).await;
        let object = payment_intent("pi_flaky", inv.id, 5_000);

        h.store.set_unavailable(true);
        let err = h
            .deliver("evt_flaky", "payment_intent.succeeded", object.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));
        assert!(err.is_retryable());
        assert!(h.store.processed_events().await.is_empty());

        h.store.set_unavailable(false);
        let outcome = h
            .deliver("evt_flaky", "payment_intent.succeeded", object)
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 5_000);
        assert_eq!(h.store.processed_events().await.len(), 1);
    }

    // =========================================================================
    // Payment without invoice metadata is acknowledged and ignored
    // =========================================================================
    #[tokio::test]
    async fn test_payment_without_invoice_is_ignored() {
        let h = Harness::new();
        let object = serde_json::json!({ "id": "pi_platform", "amount": 2_900, "metadata": {} });

        let outcome = h
            .deliver("evt_platform", "payment_intent.succeeded", object)
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(h.store.processed_events().await.len(), 1);
    }
}

#[cfg(test)]
mod installment_tests {
    use super::harness::*;
    use crate::models::InstallmentStatus;
    use serde_json::json;

    // =========================================================================
    // Targeted installment payment marks only that installment
    // =========================================================================
    #[tokio::test]
    async fn test_targeted_installment() {
        let h = Harness::new();
        let inv = h.seed_invoice(9_000).await;
        let ids = h.seed_installments(inv.id, &[3_000, 3_000, 3_000]).await;

        let object = json!({
            "id": "pi_inst",
            "amount": 3_000,
            "metadata": { "invoice_id": inv.id.to_string(), "installment_id": ids[1].to_string() }
        });
        h.deliver("evt_inst", "payment_intent.succeeded", object).await.unwrap();

        let installments = h.store.installments(inv.id).await;
        assert_eq!(installments[0].status, InstallmentStatus::Pending);
        assert_eq!(installments[1].status, InstallmentStatus::Paid);
        assert_eq!(installments[1].external_payment_ref.as_deref(), Some("pi_inst"));
        assert_eq!(installments[2].status, InstallmentStatus::Pending);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 3_000);
    }

    // =========================================================================
    // Settle-remaining wins over a targeted installment
    // =========================================================================
    #[tokio::test]
    async fn test_pay_remaining_takes_precedence() {
        let h = Harness::new();
        let inv = h.seed_invoice(9_000).await;
        let ids = h.seed_installments(inv.id, &[3_000, 3_000, 3_000]).await;

        let object = json!({
            "id": "pi_rest",
            "amount": 9_000,
            "metadata": {
                "invoice_id": inv.id.to_string(),
                "installment_id": ids[0].to_string(),
                "pay_remaining": "true"
            }
        });
        h.deliver("evt_rest", "payment_intent.succeeded", object).await.unwrap();

        let installments = h.store.installments(inv.id).await;
        assert!(installments.iter().all(|i| i.status == InstallmentStatus::Paid));
        assert_eq!(h.invoice(inv.id).await.status, crate::models::InvoiceStatus::Paid);
    }

    // =========================================================================
    // Replayed payment re-asserts installment marks without a new payment
    // =========================================================================
    #[tokio::test]
    async fn test_replay_converges_installments() {
        let h = Harness::new();
        let inv = h.seed_invoice(6_000).await;

        // Payment lands before the installment rows exist
        let first = payment_intent("pi_early", inv.id, 6_000);
        h.deliver("evt_early_1", "payment_intent.succeeded", first).await.unwrap();
        h.seed_installments(inv.id, &[3_000, 3_000]).await;

        let replay = json!({
            "id": "pi_early",
            "amount": 6_000,
            "metadata": { "invoice_id": inv.id.to_string(), "pay_remaining": "true" }
        });
        h.deliver("evt_early_2", "payment_intent.succeeded", replay).await.unwrap();

        assert_eq!(h.store.payments_for_invoice(inv.id).await.len(), 1);
        assert!(h
            .store
            .installments(inv.id)
            .await
            .iter()
            .all(|i| i.status == InstallmentStatus::Paid));
        assert_eq!(h.notifications(1).await.len(), 1);
    }
}

#[cfg(test)]
mod settlement_tests {
    use super::harness::*;
    use crate::models::{InvoiceStatus, PaymentStatus};

    // =========================================================================
    // Processing then succeeded: one row, counted only once settled
    // =========================================================================
    #[tokio::test]
    async fn test_processing_then_succeeded() {
        let h = Harness::new();
        let inv = h.seed_invoice(12_000).await;

        h.deliver("evt_proc", "payment_intent.processing", debit_intent("pi_dd", inv.id, 12_000))
            .await
            .unwrap();

        let payments = h.store.payments_for_invoice(inv.id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Processing);
        assert_eq!(payments[0].method, "bacs_debit");
        assert_eq!(h.invoice(inv.id).await.paid_minor, 0);
        assert_eq!(h.invoice(inv.id).await.status, InvoiceStatus::Sent);

        h.deliver("evt_done", "payment_intent.succeeded", debit_intent("pi_dd", inv.id, 12_000))
            .await
            .unwrap();

        let payments = h.store.payments_for_invoice(inv.id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Succeeded);
        assert!(payments[0].paid_at.is_some());

        let updated = h.invoice(inv.id).await;
        assert_eq!(updated.paid_minor, 12_000);
        assert_eq!(updated.status, InvoiceStatus::Paid);
        assert_eq!(h.notifications(1).await.len(), 1);
    }

    // =========================================================================
    // Late processing notice does not downgrade a settled payment
    // =========================================================================
    #[tokio::test]
    async fn test_late_processing_is_a_no_op() {
        let h = Harness::new();
        let inv = h.seed_invoice(4_000).await;

        h.deliver("evt_ok", "payment_intent.succeeded", debit_intent("pi_late", inv.id, 4_000))
            .await
            .unwrap();
        h.deliver("evt_late", "payment_intent.processing", debit_intent("pi_late", inv.id, 4_000))
            .await
            .unwrap();

        let payments = h.store.payments_for_invoice(inv.id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Succeeded);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 4_000);
    }

    // =========================================================================
    // Failed settlement never counts
    // =========================================================================
    #[tokio::test]
    async fn test_processing_then_failed() {
        let h = Harness::new();
        let inv = h.seed_invoice(4_000).await;

        h.deliver("evt_p", "payment_intent.processing", debit_intent("pi_f", inv.id, 4_000))
            .await
            .unwrap();
        h.deliver("evt_f", "payment_intent.payment_failed", debit_intent("pi_f", inv.id, 4_000))
            .await
            .unwrap();

        let payments = h.store.payments_for_invoice(inv.id).await;
        assert_eq!(payments[0].status, PaymentStatus::Failed);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 0);
    }

    // =========================================================================
    // Failure that overtakes the processing notice still wins
    // =========================================================================
    #[tokio::test]
    async fn test_failed_before_processing() {
        let h = Harness::new();
        let inv = h.seed_invoice(4_000).await;

        h.deliver("evt_f", "payment_intent.payment_failed", debit_intent("pi_o", inv.id, 4_000))
            .await
            .unwrap();
        h.deliver("evt_p", "payment_intent.processing", debit_intent("pi_o", inv.id, 4_000))
            .await
            .unwrap();

        let payments = h.store.payments_for_invoice(inv.id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Failed);
    }

    // =========================================================================
    // Failure after success is ignored
    // =========================================================================
    #[tokio::test]
    async fn test_failure_never_overrides_success() {
        let h = Harness::new();
        let inv = h.seed_invoice(4_000).await;

        h.deliver("evt_s", "payment_intent.succeeded", payment_intent("pi_s", inv.id, 4_000))
            .await
            .unwrap();
        h.deliver("evt_f", "payment_intent.payment_failed", payment_intent("pi_s", inv.id, 4_000))
            .await
            .unwrap();

        let payments = h.store.payments_for_invoice(inv.id).await;
        assert_eq!(payments[0].status, PaymentStatus::Succeeded);
        assert_eq!(h.invoice(inv.id).await.status, InvoiceStatus::Paid);
    }
}

#[cfg(test)]
mod refund_tests {
    use super::harness::*;
    use crate::models::{InvoiceStatus, RefundStatus};
    use crate::store::LedgerStore;
    use crate::webhooks::WebhookOutcome;
    use serde_json::json;

    async fn paid_invoice(h: &Harness) -> crate::models::Invoice {
        let inv = h.seed_invoice(10_000).await;
        h.deliver("evt_pay_a", "payment_intent.succeeded", payment_intent("pi_a", inv.id, 5_000))
            .await
            .unwrap();
        h.deliver("evt_pay_b", "payment_intent.succeeded", payment_intent("pi_b", inv.id, 5_000))
            .await
            .unwrap();
        assert_eq!(h.invoice(inv.id).await.status, InvoiceStatus::Paid);
        inv
    }

    // =========================================================================
    // Refund drops a paid invoice below total and reverts status
    // =========================================================================
    #[tokio::test]
    async fn test_refund_reverts_paid_invoice() {
        let h = Harness::new();
        let inv = paid_invoice(&h).await;

        h.deliver("evt_re", "refund.updated", refund("re_1", Some("pi_a"), 3_000, "succeeded"))
            .await
            .unwrap();

        let updated = h.invoice(inv.id).await;
        assert_eq!(updated.paid_minor, 7_000);
        assert_eq!(updated.status, InvoiceStatus::Sent);
        assert_eq!(updated.paid_at, None);
    }

    // =========================================================================
    // Pending refund from the app is resolved by the provider event
    // =========================================================================
    #[tokio::test]
    async fn test_pending_refund_succeeds() {
        let h = Harness::new();
        let inv = paid_invoice(&h).await;
        h.store
            .insert_pending_refund(None, inv.id, 2_000, "re_app")
            .await;

        // Pending rows do not count
        assert_eq!(h.invoice(inv.id).await.paid_minor, 10_000);

        h.deliver("evt_re_app", "refund.updated", refund("re_app", Some("pi_b"), 2_000, "succeeded"))
            .await
            .unwrap();

        let refunds = h.store.refunds_for_invoice(inv.id).await;
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].status, RefundStatus::Succeeded);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 8_000);
    }

    // =========================================================================
    // Failed refund resolves the pending row without touching the invoice
    // =========================================================================
    #[tokio::test]
    async fn test_failed_refund() {
        let h = Harness::new();
        let inv = paid_invoice(&h).await;
        h.store
            .insert_pending_refund(None, inv.id, 2_000, "re_bounce")
            .await;

        h.deliver("evt_re_f", "refund.updated", refund("re_bounce", None, 2_000, "failed"))
            .await
            .unwrap();

        let refunds = h.store.refunds_for_invoice(inv.id).await;
        assert_eq!(refunds[0].status, RefundStatus::Failed);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 10_000);
        assert_eq!(h.invoice(inv.id).await.status, InvoiceStatus::Paid);
    }

    // =========================================================================
    // charge.refunded carries several refunds; replays do not double count
    // =========================================================================
    #[tokio::test]
    async fn test_charge_refunded_list_is_idempotent() {
        let h = Harness::new();
        let inv = paid_invoice(&h).await;

        let charge = json!({
            "id": "ch_a",
            "payment_intent": "pi_a",
            "refunds": { "data": [
                { "id": "re_x", "amount": 1_000, "status": "succeeded" },
                { "id": "re_y", "amount": 500, "status": "succeeded" }
            ]}
        });
        h.deliver("evt_ch_1", "charge.refunded", charge.clone()).await.unwrap();
        h.deliver("evt_ch_2", "charge.refunded", charge).await.unwrap();

        assert_eq!(h.store.refunds_for_invoice(inv.id).await.len(), 2);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 8_500);
    }

    // =========================================================================
    // Refund and payment in either order reach the same final state
    // =========================================================================
    #[tokio::test]
    async fn test_refund_payment_reordering_commutes() {
        let in_order = Harness::new();
        let a = in_order.seed_invoice(10_000).await;
        in_order
            .deliver("evt_p", "payment_intent.succeeded", payment_intent("pi_r", a.id, 10_000))
            .await
            .unwrap();
        let mut early = refund("re_r", Some("pi_r"), 3_000, "succeeded");
        early["metadata"] = json!({ "invoice_id": a.id.to_string() });
        in_order.deliver("evt_r", "refund.updated", early).await.unwrap();

        let reordered = Harness::new();
        let b = reordered.seed_invoice(10_000).await;
        let mut early = refund("re_r", Some("pi_r"), 3_000, "succeeded");
        early["metadata"] = json!({ "invoice_id": b.id.to_string() });
        reordered.deliver("evt_r", "refund.updated", early).await.unwrap();
        // Transient negative figure until the payment lands
        assert_eq!(reordered.invoice(b.id).await.paid_minor, -3_000);
        reordered
            .deliver("evt_p", "payment_intent.succeeded", payment_intent("pi_r", b.id, 10_000))
            .await
            .unwrap();

        let x = in_order.invoice(a.id).await;
        let y = reordered.invoice(b.id).await;
        assert_eq!(x.paid_minor, 7_000);
        assert_eq!((x.paid_minor, x.status), (y.paid_minor, y.status));
        assert_eq!(y.status, InvoiceStatus::Sent);
    }

    // =========================================================================
    // Refund of a charge outside the invoice ledger is acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_refund_of_platform_charge_is_acknowledged() {
        let h = Harness::new();
        h.deliver(
            "evt_platform",
            "payment_intent.succeeded",
            json!({ "id": "pi_sub", "amount": 2_900, "metadata": {} }),
        )
        .await
        .unwrap();

        let charge = json!({
            "id": "ch_sub",
            "payment_intent": "pi_sub",
            "refunds": { "data": [
                { "id": "re_sub", "amount": 2_900, "status": "succeeded" }
            ]}
        });
        let first = h
            .deliver("evt_sub_refund", "charge.refunded", charge.clone())
            .await
            .unwrap();
        let second = h
            .deliver("evt_sub_refund", "charge.refunded", charge)
            .await
            .unwrap();
        assert_eq!(first, WebhookOutcome::Processed);
        assert_eq!(second, WebhookOutcome::Duplicate);

        assert!(h.store.refund_by_reference("re_sub").await.unwrap().is_none());
        assert_eq!(h.store.processed_events().await.len(), 2);
    }

    // =========================================================================
    // Refund routed by invoice metadata lands before its payment
    // =========================================================================
    #[tokio::test]
    async fn test_routed_refund_before_payment() {
        let h = Harness::new();
        let inv = h.seed_invoice(10_000).await;
        let mut early = refund("re_wait", Some("pi_wait"), 1_000, "succeeded");
        early["metadata"] = json!({ "invoice_id": inv.id.to_string() });

        h.deliver("evt_wait", "refund.updated", early).await.unwrap();
        h.deliver("evt_pay", "payment_intent.succeeded", payment_intent("pi_wait", inv.id, 10_000))
            .await
            .unwrap();

        let refunds = h.store.refunds_for_invoice(inv.id).await;
        assert_eq!(refunds.len(), 1);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 9_000);
    }
}

#[cfg(test)]
mod dispute_tests {
    use super::harness::*;
    use crate::error::BillingError;
    use crate::models::{DisputeStatus, InvoiceStatus};
    use serde_json::json;

    fn dispute(status: &str) -> serde_json::Value {
        json!({
            "id": "dp_1",
            "amount": 5_000,
            "status": status,
            "payment_intent": "pi_disputed",
            "reason": "fraudulent",
            "evidence_details": { "due_by": 1_761_000_000 }
        })
    }

    // =========================================================================
    // Lost dispute counts against the invoice
    // =========================================================================
    #[tokio::test]
    async fn test_lost_dispute_reduces_paid() {
        let h = Harness::new();
        let inv = h.seed_invoice(5_000).await;
        h.deliver("evt_pay", "payment_intent.succeeded", payment_intent("pi_disputed", inv.id, 5_000))
            .await
            .unwrap();

        h.deliver("evt_d1", "charge.dispute.created", dispute("needs_response"))
            .await
            .unwrap();
        // An open dispute does not change the balance
        assert_eq!(h.invoice(inv.id).await.status, InvoiceStatus::Paid);

        h.deliver("evt_d2", "charge.dispute.closed", dispute("lost"))
            .await
            .unwrap();

        let updated = h.invoice(inv.id).await;
        assert_eq!(updated.paid_minor, 0);
        assert_eq!(updated.status, InvoiceStatus::Sent);
        assert_eq!(
            h.store.dispute("dp_1").await.map(|d| d.status),
            Some(DisputeStatus::Lost)
        );
    }

    // =========================================================================
    // Close that overtakes the create still lands; late create is a no-op
    // =========================================================================
    #[tokio::test]
    async fn test_close_before_create() {
        let h = Harness::new();
        let inv = h.seed_invoice(5_000).await;
        h.deliver("evt_pay", "payment_intent.succeeded", payment_intent("pi_disputed", inv.id, 5_000))
            .await
            .unwrap();

        h.deliver("evt_close", "charge.dispute.closed", dispute("won"))
            .await
            .unwrap();
        h.deliver("evt_create", "charge.dispute.created", dispute("needs_response"))
            .await
            .unwrap();

        let stored = h.store.dispute("dp_1").await.unwrap();
        assert_eq!(stored.status, DisputeStatus::Won);
        assert_eq!(stored.invoice_id, inv.id);
        assert_eq!(h.invoice(inv.id).await.paid_minor, 5_000);
    }

    // =========================================================================
    // Dispute for an unrecorded invoice payment is retried until it lands
    // =========================================================================
    #[tokio::test]
    async fn test_routed_dispute_before_payment_is_retryable() {
        let h = Harness::new();
        let inv = h.seed_invoice(5_000).await;
        let mut early = dispute("needs_response");
        early["metadata"] = json!({ "invoice_id": inv.id.to_string() });

        let err = h
            .deliver("evt_d", "charge.dispute.created", early.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentNotYetRecorded(_)));
        assert!(err.is_retryable());
        assert!(h.store.processed_events().await.is_empty());

        h.deliver("evt_pay", "payment_intent.succeeded", payment_intent("pi_disputed", inv.id, 5_000))
            .await
            .unwrap();
        h.deliver("evt_d", "charge.dispute.created", early).await.unwrap();
        assert_eq!(h.store.dispute("dp_1").await.map(|d| d.invoice_id), Some(inv.id));
    }

    // =========================================================================
    // Dispute on a charge outside the invoice ledger is acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_unrouted_dispute_is_acknowledged() {
        let h = Harness::new();
        h.deliver("evt_d", "charge.dispute.created", dispute("needs_response"))
            .await
            .unwrap();

        assert!(h.store.dispute("dp_1").await.is_none());
        assert_eq!(h.store.processed_events().await.len(), 1);
    }

    // =========================================================================
    // A dispute moving out of `lost` restores the invoice
    // =========================================================================
    #[tokio::test]
    async fn test_dispute_leaving_lost_recomputes() {
        let h = Harness::new();
        let inv = h.seed_invoice(5_000).await;
        h.deliver("evt_pay", "payment_intent.succeeded", payment_intent("pi_disputed", inv.id, 5_000))
            .await
            .unwrap();

        h.deliver("evt_lost", "charge.dispute.closed", dispute("lost"))
            .await
            .unwrap();
        assert_eq!(h.invoice(inv.id).await.paid_minor, 0);

        h.deliver("evt_won", "charge.dispute.updated", dispute("won"))
            .await
            .unwrap();

        let restored = h.invoice(inv.id).await;
        assert_eq!(restored.paid_minor, 5_000);
        assert_eq!(restored.status, InvoiceStatus::Paid);
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::harness::*;
    use crate::models::{ConnectStatus, SubscriptionStatus};
    use crate::plans::{SeatLimits, CANCELLED_LIMITS};
    use serde_json::json;

    // =========================================================================
    // created(active) -> payment_failed -> updated(active) ends active
    // =========================================================================
    #[tokio::test]
    async fn test_recovery_sequence_ends_active() {
        let h = Harness::new();
        let org = h.seed_organisation().await;

        h.deliver(
            "evt_s1",
            "customer.subscription.created",
            subscription("sub_1", org.id, "active", "price_studio_monthly"),
        )
        .await
        .unwrap();
        let after_create = h.organisation(org.id).await;
        assert_eq!(after_create.subscription_status, SubscriptionStatus::Active);
        assert_eq!(after_create.limits, SeatLimits::new(300, 10));

        h.deliver(
            "evt_s2",
            "invoice.payment_failed",
            json!({ "id": "in_1", "subscription": "sub_1" }),
        )
        .await
        .unwrap();
        let after_failure = h.organisation(org.id).await;
        assert_eq!(after_failure.subscription_status, SubscriptionStatus::PastDue);
        assert!(after_failure.past_due_since.is_some());

        h.deliver(
            "evt_s3",
            "customer.subscription.updated",
            subscription("sub_1", org.id, "active", "price_studio_monthly"),
        )
        .await
        .unwrap();
        let recovered = h.organisation(org.id).await;
        assert_eq!(recovered.subscription_status, SubscriptionStatus::Active);
        assert_eq!(recovered.past_due_since, None);
    }

    // =========================================================================
    // invoice.paid recovers a past-due organisation
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_paid_clears_past_due() {
        let h = Harness::new();
        let org = h.seed_organisation().await;
        h.deliver(
            "evt_1",
            "customer.subscription.created",
            subscription("sub_1", org.id, "active", "price_studio_monthly"),
        )
        .await
        .unwrap();
        h.deliver("evt_2", "invoice.payment_failed", json!({ "id": "in_1", "subscription": "sub_1" }))
            .await
            .unwrap();
        h.deliver("evt_3", "invoice.paid", json!({ "id": "in_2", "subscription": { "id": "sub_1" } }))
            .await
            .unwrap();

        let org = h.organisation(org.id).await;
        assert_eq!(org.subscription_status, SubscriptionStatus::Active);
        assert_eq!(org.past_due_since, None);
    }

    // =========================================================================
    // Deletion clamps limits; stale updates for the same subscription are ignored
    // =========================================================================
    #[tokio::test]
    async fn test_cancellation_is_terminal_for_subscription() {
        let h = Harness::new();
        let org = h.seed_organisation().await;
        let active = subscription("sub_1", org.id, "active", "price_academy_annual");

        h.deliver("evt_1", "customer.subscription.created", active.clone())
            .await
            .unwrap();
        h.deliver("evt_2", "customer.subscription.deleted", subscription("sub_1", org.id, "canceled", "price_academy_annual"))
            .await
            .unwrap();
        h.deliver("evt_3", "customer.subscription.updated", active)
            .await
            .unwrap();

        let cancelled = h.organisation(org.id).await;
        assert_eq!(cancelled.subscription_status, SubscriptionStatus::Cancelled);
        assert_eq!(cancelled.limits, CANCELLED_LIMITS);

        // A new subscription re-activates the organisation
        h.deliver(
            "evt_4",
            "customer.subscription.created",
            subscription("sub_2", org.id, "active", "price_studio_monthly"),
        )
        .await
        .unwrap();
        let reactivated = h.organisation(org.id).await;
        assert_eq!(reactivated.subscription_status, SubscriptionStatus::Active);
        assert_eq!(reactivated.external_subscription_ref.as_deref(), Some("sub_2"));
        assert_eq!(reactivated.limits, SeatLimits::new(300, 10));
    }

    // =========================================================================
    // Deleting a replaced subscription leaves the current one alone
    // =========================================================================
    #[tokio::test]
    async fn test_delete_of_old_subscription_is_ignored() {
        let h = Harness::new();
        let org = h.seed_organisation().await;
        h.deliver(
            "evt_1",
            "customer.subscription.created",
            subscription("sub_new", org.id, "active", "price_studio_monthly"),
        )
        .await
        .unwrap();
        h.deliver(
            "evt_2",
            "customer.subscription.deleted",
            subscription("sub_old", org.id, "canceled", "price_studio_monthly"),
        )
        .await
        .unwrap();

        assert_eq!(
            h.organisation(org.id).await.subscription_status,
            SubscriptionStatus::Active
        );
    }

    // =========================================================================
    // Late update for a replaced subscription leaves the current one alone
    // =========================================================================
    #[tokio::test]
    async fn test_update_of_replaced_subscription_is_ignored() {
        let h = Harness::new();
        let org = h.seed_organisation().await;
        h.deliver(
            "evt_1",
            "customer.subscription.created",
            subscription("sub_new", org.id, "active", "price_academy_annual"),
        )
        .await
        .unwrap();
        h.deliver(
            "evt_2",
            "customer.subscription.updated",
            subscription("sub_old", org.id, "past_due", "price_studio_monthly"),
        )
        .await
        .unwrap();

        let current = h.organisation(org.id).await;
        assert_eq!(current.external_subscription_ref.as_deref(), Some("sub_new"));
        assert_eq!(current.subscription_status, SubscriptionStatus::Active);
        assert_eq!(current.subscription_plan, "academy");
        assert_eq!(current.past_due_since, None);

        // The live subscription's invoices still find the organisation
        h.deliver("evt_3", "invoice.payment_failed", json!({ "id": "in_9", "subscription": "sub_new" }))
            .await
            .unwrap();
        assert_eq!(
            h.organisation(org.id).await.subscription_status,
            SubscriptionStatus::PastDue
        );
    }

    // =========================================================================
    // Pause and resume
    // =========================================================================
    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = Harness::new();
        let org = h.seed_organisation().await;
        let sub = subscription("sub_1", org.id, "active", "price_studio_monthly");

        h.deliver("evt_1", "customer.subscription.paused", sub.clone())
            .await
            .unwrap();
        assert_eq!(
            h.organisation(org.id).await.subscription_status,
            SubscriptionStatus::Paused
        );

        h.deliver("evt_2", "customer.subscription.resumed", sub)
            .await
            .unwrap();
        assert_eq!(
            h.organisation(org.id).await.subscription_status,
            SubscriptionStatus::Active
        );
    }

    // =========================================================================
    // Unknown organisation is acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_organisation_is_acknowledged() {
        let h = Harness::new();
        let outcome = h
            .deliver(
                "evt_1",
                "customer.subscription.updated",
                subscription("sub_ghost", uuid::Uuid::new_v4(), "active", "price_studio_monthly"),
            )
            .await;
        assert!(outcome.is_ok());
    }

    // =========================================================================
    // Connect account onboarding
    // =========================================================================
    #[tokio::test]
    async fn test_connect_account_status() {
        let h = Harness::new();
        let org = h.seed_organisation().await;

        h.deliver(
            "evt_acct_1",
            "account.updated",
            json!({
                "id": "acct_1",
                "details_submitted": true,
                "charges_enabled": false,
                "payouts_enabled": false,
                "metadata": { "org_id": org.id.to_string() }
            }),
        )
        .await
        .unwrap();
        let org_after = h.organisation(org.id).await;
        assert_eq!(org_after.connect_status, ConnectStatus::Restricted);
        assert_eq!(org_after.connect_account_ref.as_deref(), Some("acct_1"));

        // Later updates find the organisation by account alone
        h.deliver(
            "evt_acct_2",
            "account.updated",
            json!({ "id": "acct_1", "details_submitted": true, "charges_enabled": true, "payouts_enabled": true }),
        )
        .await
        .unwrap();
        assert_eq!(h.organisation(org.id).await.connect_status, ConnectStatus::Active);
    }
}

#[cfg(test)]
mod side_effect_tests {
    use super::harness::*;
    use crate::models::InvoiceStatus;
    use crate::webhooks::WebhookOutcome;

    // =========================================================================
    // Failing notification feed does not fail the payment event
    // =========================================================================
    #[tokio::test]
    async fn test_side_effect_failure_is_isolated() {
        let h = Harness::with_failing_notifications();
        let inv = h.seed_invoice(5_000).await;

        let outcome = h
            .deliver("evt_pay", "payment_intent.succeeded", payment_intent("pi_ok", inv.id, 5_000))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let updated = h.invoice(inv.id).await;
        assert_eq!(updated.status, InvoiceStatus::Paid);
        assert_eq!(h.store.processed_events().await.len(), 1);
    }

    // =========================================================================
    // Notification carries the payment and organisation
    // =========================================================================
    #[tokio::test]
    async fn test_notification_contents() {
        let h = Harness::new();
        let inv = h.seed_invoice(5_000).await;
        h.deliver("evt_pay", "payment_intent.succeeded", payment_intent("pi_n", inv.id, 5_000))
            .await
            .unwrap();

        let published = h.notifications(1).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].org_id, inv.org_id);
        assert_eq!(published[0].invoice_id, inv.id);
        assert_eq!(published[0].amount_minor, 5_000);
    }
}
