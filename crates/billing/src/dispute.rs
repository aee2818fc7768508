//! Chargeback disputes
//!
//! Disputes are keyed by the provider's dispute id. Updates for a dispute we
//! have not seen insert it, so a close that overtakes the create still lands.
//! A dispute closed as `lost` counts against the invoice, so every status
//! change re-derives the invoice figures.
//!
//! A dispute whose payment is not recorded is retried only when its metadata
//! routes it to a teaching invoice. Disputes on other charges (such as the
//! organisation's own subscription) are acknowledged.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{DisputeNotice, DisputePhase, EventContext};
use crate::models::{DisputeStatus, NewDispute};
use crate::store::LedgerStore;
use crate::webhooks::EventHandler;

pub struct DisputeHandler {
    store: Arc<dyn LedgerStore>,
}

impl DisputeHandler {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Insert the dispute against its payment. Returns the invoice id when a
    /// row was created.
    async fn insert(
        &self,
        ctx: &EventContext,
        notice: &DisputeNotice,
    ) -> BillingResult<Option<Uuid>> {
        let Some(reference) = notice.payment_reference.as_deref() else {
            tracing::warn!(
                event_id = %ctx.event_id,
                dispute_ref = %notice.external_dispute_ref,
                "Dispute has no payment reference, ignoring"
            );
            return Ok(None);
        };

        let Some(payment) = self.store.payment_by_reference(reference).await? else {
            if notice.invoice_id.is_some() {
                return Err(BillingError::PaymentNotYetRecorded(reference.to_string()));
            }
            tracing::info!(
                event_id = %ctx.event_id,
                dispute_ref = %notice.external_dispute_ref,
                payment_ref = %reference,
                "Dispute is not for a teaching invoice payment, ignoring"
            );
            return Ok(None);
        };

        let inserted = self
            .store
            .insert_dispute_if_absent(NewDispute {
                external_dispute_ref: notice.external_dispute_ref.clone(),
                payment_id: payment.id,
                invoice_id: payment.invoice_id,
                amount_minor: notice.amount_minor,
                status: notice.status,
                reason: notice.reason.clone(),
                evidence_due_by: notice.evidence_due_by,
            })
            .await?;

        if !inserted {
            return Ok(None);
        }

        tracing::warn!(
            event_id = %ctx.event_id,
            dispute_ref = %notice.external_dispute_ref,
            invoice_id = %payment.invoice_id,
            amount_minor = notice.amount_minor,
            reason = ?notice.reason,
            evidence_due_by = ?notice.evidence_due_by,
            "Payment disputed"
        );
        Ok(Some(payment.invoice_id))
    }
}

#[async_trait]
impl EventHandler<DisputeNotice> for DisputeHandler {
    async fn handle(&self, ctx: &EventContext, notice: DisputeNotice) -> BillingResult<()> {
        let updated = match notice.phase {
            // A late create must not roll back a status set by a later update
            DisputePhase::Created => None,
            DisputePhase::Updated | DisputePhase::Closed => {
                self.store
                    .update_dispute_status(
                        &notice.external_dispute_ref,
                        notice.status,
                        notice.evidence_due_by,
                    )
                    .await?
            }
        };

        // An update may move a dispute into or out of `lost`
        let (invoice_id, recompute) = match updated {
            Some(dispute) => {
                tracing::info!(
                    event_id = %ctx.event_id,
                    dispute_ref = %dispute.external_dispute_ref,
                    status = %dispute.status,
                    "Dispute status updated"
                );
                (dispute.invoice_id, true)
            }
            None => match self.insert(ctx, &notice).await? {
                Some(invoice_id) => (invoice_id, notice.status == DisputeStatus::Lost),
                None => return Ok(()),
            },
        };

        if !recompute {
            return Ok(());
        }

        let invoice = self.store.recompute_invoice(invoice_id).await?;
        if notice.status == DisputeStatus::Lost {
            tracing::warn!(
                event_id = %ctx.event_id,
                invoice_id = %invoice.id,
                paid_minor = invoice.paid_minor,
                status = %invoice.status,
                "Dispute lost, invoice recomputed"
            );
        } else {
            tracing::info!(
                event_id = %ctx.event_id,
                invoice_id = %invoice.id,
                paid_minor = invoice.paid_minor,
                status = %invoice.status,
                "Invoice recomputed after dispute update"
            );
        }

        Ok(())
    }
}
