//! Invoice payment reconciliation
//!
//! Applies a succeeded payment to its teaching invoice: one payment row per
//! provider reference, installment marks, then a recompute of the invoice
//! from every payment, refund and dispute on record.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BillingError, BillingResult};
use crate::events::{EventContext, PaymentNotice};
use crate::models::{Invoice, NewPayment, Payment, PaymentInsert, PaymentStatus};
use crate::notifications::SideEffects;
use crate::store::LedgerStore;
use crate::webhooks::EventHandler;

/// Load the invoice a payment notice routes to. None means acknowledge and
/// ignore: the payment is not for a teaching invoice, or the invoice is gone.
pub(crate) async fn routed_invoice(
    store: &dyn LedgerStore,
    ctx: &EventContext,
    notice: &PaymentNotice,
) -> BillingResult<Option<Invoice>> {
    let Some(invoice_id) = notice.invoice_id else {
        tracing::info!(
            event_id = %ctx.event_id,
            provider_reference = %notice.provider_reference,
            "Payment has no invoice metadata, ignoring"
        );
        return Ok(None);
    };

    let invoice = store.invoice(invoice_id).await?;
    if invoice.is_none() {
        tracing::error!(
            event_id = %ctx.event_id,
            invoice_id = %invoice_id,
            provider_reference = %notice.provider_reference,
            amount_minor = notice.amount_minor,
            "Payment references an unknown invoice"
        );
    }
    Ok(invoice)
}

pub struct PaymentReconciler {
    store: Arc<dyn LedgerStore>,
    side_effects: SideEffects,
}

impl PaymentReconciler {
    pub fn new(store: Arc<dyn LedgerStore>, side_effects: SideEffects) -> Self {
        Self {
            store,
            side_effects,
        }
    }

    /// Insert the payment as succeeded, or move an existing processing or
    /// failed row to succeeded. Returns the row and whether this call applied it.
    async fn record_success(
        &self,
        ctx: &EventContext,
        invoice: &Invoice,
        notice: &PaymentNotice,
    ) -> BillingResult<(Payment, bool)> {
        let insert = self
            .store
            .insert_payment_if_absent(NewPayment {
                invoice_id: invoice.id,
                amount_minor: notice.amount_minor,
                method: notice.method.clone(),
                provider_reference: notice.provider_reference.clone(),
                status: PaymentStatus::Succeeded,
                paid_at: Some(ctx.occurred_at),
            })
            .await?;

        let existing = match insert {
            PaymentInsert::Inserted(payment) => return Ok((payment, true)),
            PaymentInsert::Existing(payment) if payment.status == PaymentStatus::Succeeded => {
                tracing::info!(
                    event_id = %ctx.event_id,
                    provider_reference = %payment.provider_reference,
                    "Payment already recorded as succeeded"
                );
                return Ok((payment, false));
            }
            PaymentInsert::Existing(payment) => payment,
        };

        let transitioned = self
            .store
            .transition_payment(
                &existing.provider_reference,
                existing.status,
                PaymentStatus::Succeeded,
                Some(ctx.occurred_at),
            )
            .await?;

        match transitioned {
            Some(payment) => {
                tracing::info!(
                    event_id = %ctx.event_id,
                    provider_reference = %payment.provider_reference,
                    from = %existing.status,
                    "Payment settled"
                );
                Ok((payment, true))
            }
            // Another delivery moved it first
            None => {
                let current = self
                    .store
                    .payment_by_reference(&existing.provider_reference)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Internal(format!(
                            "payment {} disappeared during settlement",
                            existing.provider_reference
                        ))
                    })?;
                Ok((current, false))
            }
        }
    }

    async fn mark_installments(
        &self,
        ctx: &EventContext,
        payment: &Payment,
        notice: &PaymentNotice,
    ) -> BillingResult<()> {
        // Settling the remaining balance takes precedence over a targeted installment
        if notice.pay_remaining {
            let settled = self
                .store
                .settle_open_installments(
                    payment.invoice_id,
                    &payment.provider_reference,
                    ctx.occurred_at,
                )
                .await?;
            if settled > 0 {
                tracing::info!(
                    invoice_id = %payment.invoice_id,
                    installments = settled,
                    "Settled remaining installments"
                );
            }
        } else if let Some(installment_id) = notice.installment_id {
            let marked = self
                .store
                .mark_installment_paid(
                    payment.invoice_id,
                    installment_id,
                    &payment.provider_reference,
                    ctx.occurred_at,
                )
                .await?;
            if marked {
                tracing::info!(
                    invoice_id = %payment.invoice_id,
                    installment_id = %installment_id,
                    "Installment marked paid"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<PaymentNotice> for PaymentReconciler {
    async fn handle(&self, ctx: &EventContext, notice: PaymentNotice) -> BillingResult<()> {
        let Some(invoice) = routed_invoice(self.store.as_ref(), ctx, &notice).await? else {
            return Ok(());
        };

        let (payment, newly_applied) = self.record_success(ctx, &invoice, &notice).await?;

        // Re-asserted on replays so a partially failed earlier attempt converges
        self.mark_installments(ctx, &payment, &notice).await?;

        let updated = self.store.recompute_invoice(payment.invoice_id).await?;

        tracing::info!(
            event_id = %ctx.event_id,
            invoice_id = %updated.id,
            provider_reference = %payment.provider_reference,
            amount_minor = payment.amount_minor,
            paid_minor = updated.paid_minor,
            status = %updated.status,
            newly_applied,
            "Invoice payment reconciled"
        );

        if newly_applied {
            drop(self.side_effects.payment_recorded(&updated, &payment));
        }

        Ok(())
    }
}
