//! Refund reconciliation
//!
//! Refunds issued from the app are stored as `pending` and resolved by the
//! provider's refund events. Refunds issued from the provider dashboard have
//! no pending row and are inserted as `succeeded` when their event arrives.
//! Either way the invoice is then recomputed, which may revert a `paid`
//! invoice. A dashboard refund that names neither a recorded payment nor a
//! teaching invoice belongs to some other charge and is acknowledged.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::{EventContext, ProviderRefundStatus, RefundNotice};
use crate::models::{NewRefund, RefundStatus};
use crate::store::LedgerStore;
use crate::webhooks::EventHandler;

pub struct RefundHandler {
    store: Arc<dyn LedgerStore>,
}

impl RefundHandler {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Make the refund `succeeded` and return the invoice it belongs to, if any
    async fn apply_succeeded(
        &self,
        ctx: &EventContext,
        notice: &RefundNotice,
    ) -> BillingResult<Option<Uuid>> {
        if let Some(refund) = self
            .store
            .settle_pending_refund(&notice.external_refund_ref, RefundStatus::Succeeded)
            .await?
        {
            tracing::info!(
                event_id = %ctx.event_id,
                refund_ref = %refund.external_refund_ref,
                invoice_id = %refund.invoice_id,
                amount_minor = refund.amount_minor,
                "Pending refund succeeded"
            );
            return Ok(Some(refund.invoice_id));
        }

        if let Some(existing) = self
            .store
            .refund_by_reference(&notice.external_refund_ref)
            .await?
        {
            if existing.status != RefundStatus::Succeeded {
                tracing::warn!(
                    event_id = %ctx.event_id,
                    refund_ref = %existing.external_refund_ref,
                    status = %existing.status,
                    "Refund reported succeeded after it was recorded as failed"
                );
            }
            return Ok(Some(existing.invoice_id));
        }

        // Dashboard refund: link to the payment, or to the invoice named in metadata
        let payment = match notice.payment_reference.as_deref() {
            Some(reference) => self.store.payment_by_reference(reference).await?,
            None => None,
        };
        let (payment_id, invoice_id) = match (payment, notice.invoice_id) {
            (Some(payment), _) => (Some(payment.id), payment.invoice_id),
            (None, Some(invoice_id)) => (None, invoice_id),
            (None, None) => {
                tracing::info!(
                    event_id = %ctx.event_id,
                    refund_ref = %notice.external_refund_ref,
                    payment_ref = ?notice.payment_reference,
                    "Refund is not for a teaching invoice payment, ignoring"
                );
                return Ok(None);
            }
        };

        let inserted = self
            .store
            .insert_refund_if_absent(NewRefund {
                payment_id,
                invoice_id,
                amount_minor: notice.amount_minor,
                status: RefundStatus::Succeeded,
                external_refund_ref: notice.external_refund_ref.clone(),
            })
            .await?;

        if inserted {
            tracing::info!(
                event_id = %ctx.event_id,
                refund_ref = %notice.external_refund_ref,
                invoice_id = %invoice_id,
                amount_minor = notice.amount_minor,
                "Recorded refund issued outside the app"
            );
        }
        Ok(Some(invoice_id))
    }
}

#[async_trait]
impl EventHandler<RefundNotice> for RefundHandler {
    async fn handle(&self, ctx: &EventContext, notice: RefundNotice) -> BillingResult<()> {
        match notice.status {
            ProviderRefundStatus::Succeeded => {
                let Some(invoice_id) = self.apply_succeeded(ctx, &notice).await? else {
                    return Ok(());
                };
                let updated = self.store.recompute_invoice(invoice_id).await?;
                tracing::info!(
                    event_id = %ctx.event_id,
                    invoice_id = %updated.id,
                    paid_minor = updated.paid_minor,
                    status = %updated.status,
                    "Invoice recomputed after refund"
                );
            }
            ProviderRefundStatus::Failed | ProviderRefundStatus::Canceled => {
                // TODO: reverse a refund that fails after succeeding; needs a
                // succeeded -> failed transition in the store.
                if let Some(refund) = self
                    .store
                    .settle_pending_refund(&notice.external_refund_ref, RefundStatus::Failed)
                    .await?
                {
                    tracing::warn!(
                        event_id = %ctx.event_id,
                        refund_ref = %refund.external_refund_ref,
                        invoice_id = %refund.invoice_id,
                        "Refund failed"
                    );
                }
            }
            ProviderRefundStatus::Pending | ProviderRefundStatus::RequiresAction => {
                tracing::debug!(
                    event_id = %ctx.event_id,
                    refund_ref = %notice.external_refund_ref,
                    "Refund still in flight"
                );
            }
        }
        Ok(())
    }
}
