//! In-memory ledger store for tests and local development
//!
//! One mutex guards the whole ledger, so each operation is atomic the way a
//! single statement (or the recompute transaction) is in Postgres. Unique
//! keys are the map keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::LedgerStore;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    ConnectStatus, Dispute, DisputeStatus, InstallmentStatus, Invoice, InvoiceInstallment,
    NewDispute, NewPayment, NewRefund, Organisation, Payment, PaymentInsert, PaymentStatus,
    ProcessedEvent, Refund, RefundStatus, SubscriptionState,
};
use crate::recompute::{derive_invoice_figures, LedgerTotals};

#[derive(Debug, Default)]
struct Ledger {
    events: HashMap<String, ProcessedEvent>,
    organisations: HashMap<Uuid, Organisation>,
    invoices: HashMap<Uuid, Invoice>,
    installments: HashMap<Uuid, InvoiceInstallment>,
    /// Keyed by provider reference
    payments: HashMap<String, Payment>,
    /// Keyed by external refund reference
    refunds: HashMap<String, Refund>,
    /// Keyed by external dispute reference
    disputes: HashMap<String, Dispute>,
}

impl Ledger {
    fn totals(&self, invoice_id: Uuid) -> LedgerTotals {
        LedgerTotals {
            succeeded_payments: self
                .payments
                .values()
                .filter(|p| p.invoice_id == invoice_id && p.status == PaymentStatus::Succeeded)
                .map(|p| p.amount_minor)
                .sum(),
            succeeded_refunds: self
                .refunds
                .values()
                .filter(|r| r.invoice_id == invoice_id && r.status == RefundStatus::Succeeded)
                .map(|r| r.amount_minor)
                .sum(),
            lost_disputes: self
                .disputes
                .values()
                .filter(|d| d.invoice_id == invoice_id && d.status == DisputeStatus::Lost)
                .map(|d| d.amount_minor)
                .sum(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    ledger: Mutex<Ledger>,
    unavailable: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every financial write fail with a database error, as if the
    /// connection dropped. The dedup ledger keeps working.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Mirrors the `amount_minor >= 0` table constraints
    fn check_amount(table: &str, amount_minor: i64) -> BillingResult<()> {
        if amount_minor < 0 {
            return Err(BillingError::Database(format!(
                "check constraint violation: {}.amount_minor = {}",
                table, amount_minor
            )));
        }
        Ok(())
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Database("store unavailable".to_string()));
        }
        Ok(())
    }

    // ============ Seeding ============

    pub async fn insert_organisation(&self, organisation: Organisation) {
        self.ledger
            .lock()
            .await
            .organisations
            .insert(organisation.id, organisation);
    }

    pub async fn insert_invoice(&self, invoice: Invoice) {
        self.ledger.lock().await.invoices.insert(invoice.id, invoice);
    }

    pub async fn insert_installment(&self, installment: InvoiceInstallment) {
        self.ledger
            .lock()
            .await
            .installments
            .insert(installment.id, installment);
    }

    /// Seed a refund issued from the app and awaiting provider confirmation
    pub async fn insert_pending_refund(
        &self,
        payment_id: Option<Uuid>,
        invoice_id: Uuid,
        amount_minor: i64,
        external_refund_ref: &str,
    ) -> Refund {
        let refund = Refund {
            id: Uuid::new_v4(),
            payment_id,
            invoice_id,
            amount_minor,
            status: RefundStatus::Pending,
            external_refund_ref: external_refund_ref.to_string(),
        };
        self.ledger
            .lock()
            .await
            .refunds
            .insert(refund.external_refund_ref.clone(), refund.clone());
        refund
    }

    // ============ Inspection ============

    pub async fn payments_for_invoice(&self, invoice_id: Uuid) -> Vec<Payment> {
        let ledger = self.ledger.lock().await;
        let mut payments: Vec<Payment> = ledger
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| a.provider_reference.cmp(&b.provider_reference));
        payments
    }

    pub async fn refunds_for_invoice(&self, invoice_id: Uuid) -> Vec<Refund> {
        let ledger = self.ledger.lock().await;
        let mut refunds: Vec<Refund> = ledger
            .refunds
            .values()
            .filter(|r| r.invoice_id == invoice_id)
            .cloned()
            .collect();
        refunds.sort_by(|a, b| a.external_refund_ref.cmp(&b.external_refund_ref));
        refunds
    }

    pub async fn dispute(&self, external_dispute_ref: &str) -> Option<Dispute> {
        self.ledger
            .lock()
            .await
            .disputes
            .get(external_dispute_ref)
            .cloned()
    }

    /// Installments of an invoice ordered by number
    pub async fn installments(&self, invoice_id: Uuid) -> Vec<InvoiceInstallment> {
        let ledger = self.ledger.lock().await;
        let mut installments: Vec<InvoiceInstallment> = ledger
            .installments
            .values()
            .filter(|i| i.invoice_id == invoice_id)
            .cloned()
            .collect();
        installments.sort_by_key(|i| i.installment_number);
        installments
    }

    pub async fn processed_events(&self) -> Vec<ProcessedEvent> {
        let ledger = self.ledger.lock().await;
        let mut events: Vec<ProcessedEvent> = ledger.events.values().cloned().collect();
        events.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        events
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn record_event_if_new(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let mut ledger = self.ledger.lock().await;
        if ledger.events.contains_key(event_id) {
            return Ok(false);
        }
        ledger.events.insert(
            event_id.to_string(),
            ProcessedEvent {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                received_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(true)
    }

    async fn release_event(&self, event_id: &str) -> BillingResult<()> {
        self.ledger.lock().await.events.remove(event_id);
        Ok(())
    }

    async fn organisation(&self, org_id: Uuid) -> BillingResult<Option<Organisation>> {
        Ok(self.ledger.lock().await.organisations.get(&org_id).cloned())
    }

    async fn organisation_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Organisation>> {
        Ok(self
            .ledger
            .lock()
            .await
            .organisations
            .values()
            .find(|o| o.external_subscription_ref.as_deref() == Some(subscription_ref))
            .cloned())
    }

    async fn organisation_by_connect_account(
        &self,
        account_ref: &str,
    ) -> BillingResult<Option<Organisation>> {
        Ok(self
            .ledger
            .lock()
            .await
            .organisations
            .values()
            .find(|o| o.connect_account_ref.as_deref() == Some(account_ref))
            .cloned())
    }

    async fn save_subscription_state(
        &self,
        org_id: Uuid,
        state: &SubscriptionState,
    ) -> BillingResult<()> {
        self.check_available()?;
        let mut ledger = self.ledger.lock().await;

        if let Some(reference) = state.external_subscription_ref.as_deref() {
            let taken = ledger.organisations.values().any(|o| {
                o.id != org_id && o.external_subscription_ref.as_deref() == Some(reference)
            });
            if taken {
                return Err(BillingError::Database(format!(
                    "duplicate key: external_subscription_ref {}",
                    reference
                )));
            }
        }

        let organisation = ledger
            .organisations
            .get_mut(&org_id)
            .ok_or_else(|| BillingError::NotFound(format!("organisation {}", org_id)))?;
        organisation.apply_subscription_state(state.clone());
        Ok(())
    }

    async fn update_connect_status(
        &self,
        org_id: Uuid,
        account_ref: &str,
        status: ConnectStatus,
    ) -> BillingResult<()> {
        self.check_available()?;
        let mut ledger = self.ledger.lock().await;
        if let Some(organisation) = ledger.organisations.get_mut(&org_id) {
            organisation.connect_account_ref = Some(account_ref.to_string());
            organisation.connect_status = status;
        }
        Ok(())
    }

    async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.ledger.lock().await.invoices.get(&invoice_id).cloned())
    }

    async fn recompute_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.check_available()?;
        let mut ledger = self.ledger.lock().await;
        let totals = ledger.totals(invoice_id);

        let invoice = ledger
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice_id)))?;
        derive_invoice_figures(invoice, &totals, OffsetDateTime::now_utc()).apply_to(invoice);
        Ok(invoice.clone())
    }

    async fn mark_installment_paid(
        &self,
        invoice_id: Uuid,
        installment_id: Uuid,
        payment_ref: &str,
        paid_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        self.check_available()?;
        let mut ledger = self.ledger.lock().await;
        match ledger.installments.get_mut(&installment_id) {
            Some(installment)
                if installment.invoice_id == invoice_id && installment.status.is_open() =>
            {
                installment.status = InstallmentStatus::Paid;
                installment.external_payment_ref = Some(payment_ref.to_string());
                installment.paid_at = Some(paid_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn settle_open_installments(
        &self,
        invoice_id: Uuid,
        payment_ref: &str,
        paid_at: OffsetDateTime,
    ) -> BillingResult<u64> {
        self.check_available()?;
        let mut ledger = self.ledger.lock().await;
        let mut settled = 0;
        for installment in ledger
            .installments
            .values_mut()
            .filter(|i| i.invoice_id == invoice_id && i.status.is_open())
        {
            installment.status = InstallmentStatus::Paid;
            installment.external_payment_ref = Some(payment_ref.to_string());
            installment.paid_at = Some(paid_at);
            settled += 1;
        }
        Ok(settled)
    }

    async fn payment_by_reference(
        &self,
        provider_reference: &str,
    ) -> BillingResult<Option<Payment>> {
        Ok(self
            .ledger
            .lock()
            .await
            .payments
            .get(provider_reference)
            .cloned())
    }

    async fn insert_payment_if_absent(&self, payment: NewPayment) -> BillingResult<PaymentInsert> {
        self.check_available()?;
        Self::check_amount("payments", payment.amount_minor)?;
        let mut ledger = self.ledger.lock().await;

        if let Some(existing) = ledger.payments.get(&payment.provider_reference) {
            return Ok(PaymentInsert::Existing(existing.clone()));
        }
        if !ledger.invoices.contains_key(&payment.invoice_id) {
            return Err(BillingError::Database(format!(
                "foreign key violation: invoice {} does not exist",
                payment.invoice_id
            )));
        }

        let row = Payment {
            id: Uuid::new_v4(),
            invoice_id: payment.invoice_id,
            amount_minor: payment.amount_minor,
            method: payment.method,
            provider_reference: payment.provider_reference,
            status: payment.status,
            paid_at: payment.paid_at,
        };
        ledger
            .payments
            .insert(row.provider_reference.clone(), row.clone());
        Ok(PaymentInsert::Inserted(row))
    }

    async fn transition_payment(
        &self,
        provider_reference: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        paid_at: Option<OffsetDateTime>,
    ) -> BillingResult<Option<Payment>> {
        self.check_available()?;
        let mut ledger = self.ledger.lock().await;
        match ledger.payments.get_mut(provider_reference) {
            Some(payment) if payment.status == from => {
                payment.status = to;
                payment.paid_at = paid_at.or(payment.paid_at);
                Ok(Some(payment.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn settle_pending_refund(
        &self,
        external_refund_ref: &str,
        status: RefundStatus,
    ) -> BillingResult<Option<Refund>> {
        self.check_available()?;
        let mut ledger = self.ledger.lock().await;
        match ledger.refunds.get_mut(external_refund_ref) {
            Some(refund) if refund.status == RefundStatus::Pending => {
                refund.status = status;
                Ok(Some(refund.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn refund_by_reference(
        &self,
        external_refund_ref: &str,
    ) -> BillingResult<Option<Refund>> {
        Ok(self
            .ledger
            .lock()
            .await
            .refunds
            .get(external_refund_ref)
            .cloned())
    }

    async fn insert_refund_if_absent(&self, refund: NewRefund) -> BillingResult<bool> {
        self.check_available()?;
        Self::check_amount("refunds", refund.amount_minor)?;
        let mut ledger = self.ledger.lock().await;
        if ledger.refunds.contains_key(&refund.external_refund_ref) {
            return Ok(false);
        }
        ledger.refunds.insert(
            refund.external_refund_ref.clone(),
            Refund {
                id: Uuid::new_v4(),
                payment_id: refund.payment_id,
                invoice_id: refund.invoice_id,
                amount_minor: refund.amount_minor,
                status: refund.status,
                external_refund_ref: refund.external_refund_ref,
            },
        );
        Ok(true)
    }

    async fn insert_dispute_if_absent(&self, dispute: NewDispute) -> BillingResult<bool> {
        self.check_available()?;
        Self::check_amount("disputes", dispute.amount_minor)?;
        let mut ledger = self.ledger.lock().await;
        if ledger.disputes.contains_key(&dispute.external_dispute_ref) {
            return Ok(false);
        }
        ledger.disputes.insert(
            dispute.external_dispute_ref.clone(),
            Dispute {
                id: Uuid::new_v4(),
                external_dispute_ref: dispute.external_dispute_ref,
                payment_id: dispute.payment_id,
                invoice_id: dispute.invoice_id,
                amount_minor: dispute.amount_minor,
                status: dispute.status,
                reason: dispute.reason,
                evidence_due_by: dispute.evidence_due_by,
            },
        );
        Ok(true)
    }

    async fn update_dispute_status(
        &self,
        external_dispute_ref: &str,
        status: DisputeStatus,
        evidence_due_by: Option<OffsetDateTime>,
    ) -> BillingResult<Option<Dispute>> {
        self.check_available()?;
        let mut ledger = self.ledger.lock().await;
        Ok(ledger.disputes.get_mut(external_dispute_ref).map(|dispute| {
            dispute.status = status;
            dispute.evidence_due_by = evidence_due_by.or(dispute.evidence_due_by);
            dispute.clone()
        }))
    }
}
