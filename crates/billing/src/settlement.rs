//! Delayed settlement
//!
//! Debit-style methods confirm up front and settle days later. A processing
//! notice records the payment without counting it toward the invoice; the
//! later succeeded notice goes through [`crate::payments::PaymentReconciler`],
//! which moves the same row to `succeeded` and recomputes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::events::{EventContext, PaymentNotice};
use crate::models::{NewPayment, PaymentInsert, PaymentStatus};
use crate::payments::routed_invoice;
use crate::store::LedgerStore;
use crate::webhooks::EventHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementEvent {
    Processing(PaymentNotice),
    Failed(PaymentNotice),
}

pub struct SettlementHandler {
    store: Arc<dyn LedgerStore>,
}

impl SettlementHandler {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    async fn processing(&self, ctx: &EventContext, notice: PaymentNotice) -> BillingResult<()> {
        let Some(invoice) = routed_invoice(self.store.as_ref(), ctx, &notice).await? else {
            return Ok(());
        };

        let insert = self
            .store
            .insert_payment_if_absent(NewPayment {
                invoice_id: invoice.id,
                amount_minor: notice.amount_minor,
                method: notice.method,
                provider_reference: notice.provider_reference,
                status: PaymentStatus::Processing,
                paid_at: None,
            })
            .await?;

        match insert {
            PaymentInsert::Inserted(payment) => tracing::info!(
                event_id = %ctx.event_id,
                invoice_id = %payment.invoice_id,
                provider_reference = %payment.provider_reference,
                method = %payment.method,
                amount_minor = payment.amount_minor,
                "Payment processing, awaiting settlement"
            ),
            // Already processing, or a later state arrived first
            PaymentInsert::Existing(payment) => tracing::info!(
                event_id = %ctx.event_id,
                provider_reference = %payment.provider_reference,
                status = %payment.status,
                "Processing notice for known payment, nothing to do"
            ),
        }

        Ok(())
    }

    async fn failed(&self, ctx: &EventContext, notice: PaymentNotice) -> BillingResult<()> {
        let failed = self
            .store
            .transition_payment(
                &notice.provider_reference,
                PaymentStatus::Processing,
                PaymentStatus::Failed,
                None,
            )
            .await?;

        if let Some(payment) = failed {
            tracing::warn!(
                event_id = %ctx.event_id,
                invoice_id = %payment.invoice_id,
                provider_reference = %payment.provider_reference,
                "Delayed payment failed to settle"
            );
            return Ok(());
        }

        if self
            .store
            .payment_by_reference(&notice.provider_reference)
            .await?
            .is_some()
        {
            // Succeeded or already failed; a failure never overrides success
            return Ok(());
        }

        // Failure overtook the processing notice. Record it so the late
        // processing notice finds an existing row and stays a no-op.
        let Some(invoice) = routed_invoice(self.store.as_ref(), ctx, &notice).await? else {
            return Ok(());
        };
        self.store
            .insert_payment_if_absent(NewPayment {
                invoice_id: invoice.id,
                amount_minor: notice.amount_minor,
                method: notice.method,
                provider_reference: notice.provider_reference.clone(),
                status: PaymentStatus::Failed,
                paid_at: None,
            })
            .await?;

        tracing::warn!(
            event_id = %ctx.event_id,
            invoice_id = %invoice.id,
            provider_reference = %notice.provider_reference,
            "Payment failed before it was recorded as processing"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler<SettlementEvent> for SettlementHandler {
    async fn handle(&self, ctx: &EventContext, event: SettlementEvent) -> BillingResult<()> {
        match event {
            SettlementEvent::Processing(notice) => self.processing(ctx, notice).await,
            SettlementEvent::Failed(notice) => self.failed(ctx, notice).await,
        }
    }
}
