//! Financial state store
//!
//! The relational tables are the single source of truth. Handlers talk to
//! them through [`LedgerStore`] so the same reconciliation code runs against
//! Postgres in production and against [`MemoryLedgerStore`] in tests.
//!
//! Every insert that could be replayed is unique-constrained and reports
//! whether it created a row. Invoice figures are only written by
//! [`LedgerStore::recompute_invoice`].

mod memory;
mod postgres;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    ConnectStatus, Dispute, DisputeStatus, Invoice, NewDispute, NewPayment, NewRefund,
    Organisation, Payment, PaymentInsert, PaymentStatus, Refund, RefundStatus, SubscriptionState,
};

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ============ Deduplication ledger ============

    /// Claim `event_id`. Returns false when it was already recorded.
    async fn record_event_if_new(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;

    /// Drop a claim so the next delivery of `event_id` is processed again
    async fn release_event(&self, event_id: &str) -> BillingResult<()>;

    // ============ Organisations ============

    async fn organisation(&self, org_id: Uuid) -> BillingResult<Option<Organisation>>;

    async fn organisation_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Organisation>>;

    async fn organisation_by_connect_account(
        &self,
        account_ref: &str,
    ) -> BillingResult<Option<Organisation>>;

    /// Write all subscription fields of an organisation as one unit
    async fn save_subscription_state(
        &self,
        org_id: Uuid,
        state: &SubscriptionState,
    ) -> BillingResult<()>;

    async fn update_connect_status(
        &self,
        org_id: Uuid,
        account_ref: &str,
        status: ConnectStatus,
    ) -> BillingResult<()>;

    // ============ Invoices ============

    async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;

    /// Re-sum the invoice's payments, refunds and lost disputes and rewrite
    /// `paid_minor`, `status` and `paid_at`. Returns the updated invoice.
    async fn recompute_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice>;

    /// Mark one open installment of `invoice_id` paid. Returns false when it
    /// was already paid or does not belong to the invoice.
    async fn mark_installment_paid(
        &self,
        invoice_id: Uuid,
        installment_id: Uuid,
        payment_ref: &str,
        paid_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Mark every open installment of `invoice_id` paid. Returns how many changed.
    async fn settle_open_installments(
        &self,
        invoice_id: Uuid,
        payment_ref: &str,
        paid_at: OffsetDateTime,
    ) -> BillingResult<u64>;

    // ============ Payments ============

    async fn payment_by_reference(&self, provider_reference: &str)
        -> BillingResult<Option<Payment>>;

    /// Insert unless a payment with the same provider reference exists
    async fn insert_payment_if_absent(&self, payment: NewPayment) -> BillingResult<PaymentInsert>;

    /// Move a payment from `from` to `to`. Returns None when the row is not
    /// in `from` (already transitioned, or missing).
    async fn transition_payment(
        &self,
        provider_reference: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        paid_at: Option<OffsetDateTime>,
    ) -> BillingResult<Option<Payment>>;

    // ============ Refunds ============

    /// Resolve a `pending` refund to `status`. Returns None when no pending
    /// row has this reference.
    async fn settle_pending_refund(
        &self,
        external_refund_ref: &str,
        status: RefundStatus,
    ) -> BillingResult<Option<Refund>>;

    async fn refund_by_reference(&self, external_refund_ref: &str)
        -> BillingResult<Option<Refund>>;

    /// Insert unless a refund with the same external reference exists
    async fn insert_refund_if_absent(&self, refund: NewRefund) -> BillingResult<bool>;

    // ============ Disputes ============

    /// Insert unless a dispute with the same external reference exists
    async fn insert_dispute_if_absent(&self, dispute: NewDispute) -> BillingResult<bool>;

    /// Update status (and the evidence deadline when given). Returns None
    /// for an unknown dispute.
    async fn update_dispute_status(
        &self,
        external_dispute_ref: &str,
        status: DisputeStatus,
        evidence_due_by: Option<OffsetDateTime>,
    ) -> BillingResult<Option<Dispute>>;
}
