//! Postgres-backed ledger store

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::LedgerStore;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    ConnectStatus, Dispute, DisputeRow, DisputeStatus, InstallmentStatus, Invoice, InvoiceRow,
    NewDispute, NewPayment, NewRefund, Organisation, OrganisationRow, Payment, PaymentInsert,
    PaymentRow, PaymentStatus, Refund, RefundRow, RefundStatus, SubscriptionState,
};
use crate::recompute::{derive_invoice_figures, LedgerTotals};

macro_rules! organisation_select {
    ($filter:literal) => {
        concat!(
            "SELECT id, subscription_plan, subscription_status, trial_ends_at, ",
            "external_subscription_ref, max_students, max_teachers, past_due_since, ",
            "cancels_at, connect_account_ref, connect_status FROM organisations WHERE ",
            $filter
        )
    };
}

macro_rules! invoice_select {
    ($filter:literal) => {
        concat!(
            "SELECT id, org_id, invoice_number, currency, total_minor, paid_minor, status, ",
            "payer_email, paid_at FROM invoices WHERE ",
            $filter
        )
    };
}

macro_rules! payment_select {
    ($filter:literal) => {
        concat!(
            "SELECT id, invoice_id, amount_minor, method, provider_reference, status, paid_at ",
            "FROM payments WHERE ",
            $filter
        )
    };
}

macro_rules! payment_returning {
    ($statement:literal) => {
        concat!(
            $statement,
            " RETURNING id, invoice_id, amount_minor, method, provider_reference, status, paid_at"
        )
    };
}

macro_rules! refund_returning {
    ($statement:literal) => {
        concat!(
            $statement,
            " RETURNING id, payment_id, invoice_id, amount_minor, status, external_refund_ref"
        )
    };
}

fn seat_column(value: u32) -> BillingResult<i32> {
    i32::try_from(value)
        .map_err(|_| BillingError::Internal(format!("seat limit {} exceeds column range", value)))
}

/// Ledger store over the tables created by the shared migrations
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_organisation_where(
        &self,
        query: &'static str,
        key: &str,
    ) -> BillingResult<Option<Organisation>> {
        let row: Option<OrganisationRow> = sqlx::query_as(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Organisation::try_from).transpose()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn record_event_if_new(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        // The primary key makes the claim atomic across concurrent deliveries
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_webhook_events (event_id, event_type, received_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        Ok(claimed.is_some())
    }

    async fn release_event(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM processed_webhook_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn organisation(&self, org_id: Uuid) -> BillingResult<Option<Organisation>> {
        let row: Option<OrganisationRow> = sqlx::query_as(organisation_select!("id = $1"))
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Organisation::try_from).transpose()
    }

    async fn organisation_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Organisation>> {
        self.fetch_organisation_where(
            organisation_select!("external_subscription_ref = $1"),
            subscription_ref,
        )
        .await
    }

    async fn organisation_by_connect_account(
        &self,
        account_ref: &str,
    ) -> BillingResult<Option<Organisation>> {
        self.fetch_organisation_where(organisation_select!("connect_account_ref = $1"), account_ref)
            .await
    }

    async fn save_subscription_state(
        &self,
        org_id: Uuid,
        state: &SubscriptionState,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE organisations
            SET subscription_plan = $2,
                subscription_status = $3,
                trial_ends_at = $4,
                external_subscription_ref = $5,
                max_students = $6,
                max_teachers = $7,
                past_due_since = $8,
                cancels_at = $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .bind(&state.plan)
        .bind(state.status.as_str())
        .bind(state.trial_ends_at)
        .bind(&state.external_subscription_ref)
        .bind(seat_column(state.limits.max_students)?)
        .bind(seat_column(state.limits.max_teachers)?)
        .bind(state.past_due_since)
        .bind(state.cancels_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("organisation {}", org_id)));
        }
        Ok(())
    }

    async fn update_connect_status(
        &self,
        org_id: Uuid,
        account_ref: &str,
        status: ConnectStatus,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE organisations
            SET connect_account_ref = $2, connect_status = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(org_id)
        .bind(account_ref)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(invoice_select!("id = $1"))
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Invoice::try_from).transpose()
    }

    async fn recompute_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let mut tx = self.pool.begin().await?;

        // Row lock serialises concurrent recomputes of the same invoice
        let row: Option<InvoiceRow> = sqlx::query_as(invoice_select!("id = $1 FOR UPDATE"))
            .bind(invoice_id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut invoice = match row {
            Some(row) => Invoice::try_from(row)?,
            None => return Err(BillingError::NotFound(format!("invoice {}", invoice_id))),
        };

        let (succeeded_payments, succeeded_refunds, lost_disputes): (i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    (SELECT COALESCE(SUM(amount_minor), 0)::BIGINT FROM payments
                      WHERE invoice_id = $1 AND status = 'succeeded'),
                    (SELECT COALESCE(SUM(amount_minor), 0)::BIGINT FROM refunds
                      WHERE invoice_id = $1 AND status = 'succeeded'),
                    (SELECT COALESCE(SUM(amount_minor), 0)::BIGINT FROM disputes
                      WHERE invoice_id = $1 AND status = 'lost')
                "#,
            )
            .bind(invoice_id)
            .fetch_one(&mut *tx)
            .await?;

        let totals = LedgerTotals {
            succeeded_payments,
            succeeded_refunds,
            lost_disputes,
        };
        let figures = derive_invoice_figures(&invoice, &totals, OffsetDateTime::now_utc());

        sqlx::query(
            r#"
            UPDATE invoices
            SET paid_minor = $2, status = $3, paid_at = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .bind(figures.paid_minor)
        .bind(figures.status.as_str())
        .bind(figures.paid_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        figures.apply_to(&mut invoice);
        Ok(invoice)
    }

    async fn mark_installment_paid(
        &self,
        invoice_id: Uuid,
        installment_id: Uuid,
        payment_ref: &str,
        paid_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE invoice_installments
            SET status = $3, external_payment_ref = $4, paid_at = $5
            WHERE id = $2 AND invoice_id = $1 AND status IN ('pending', 'overdue')
            "#,
        )
        .bind(invoice_id)
        .bind(installment_id)
        .bind(InstallmentStatus::Paid.as_str())
        .bind(payment_ref)
        .bind(paid_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn settle_open_installments(
        &self,
        invoice_id: Uuid,
        payment_ref: &str,
        paid_at: OffsetDateTime,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE invoice_installments
            SET status = $2, external_payment_ref = $3, paid_at = $4
            WHERE invoice_id = $1 AND status IN ('pending', 'overdue')
            "#,
        )
        .bind(invoice_id)
        .bind(InstallmentStatus::Paid.as_str())
        .bind(payment_ref)
        .bind(paid_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn payment_by_reference(
        &self,
        provider_reference: &str,
    ) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(payment_select!("provider_reference = $1"))
            .bind(provider_reference)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn insert_payment_if_absent(&self, payment: NewPayment) -> BillingResult<PaymentInsert> {
        let inserted: Option<PaymentRow> = sqlx::query_as(payment_returning!(
            r#"
            INSERT INTO payments
                (id, invoice_id, amount_minor, method, provider_reference, status, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (provider_reference) DO NOTHING
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(payment.invoice_id)
        .bind(payment.amount_minor)
        .bind(&payment.method)
        .bind(&payment.provider_reference)
        .bind(payment.status.as_str())
        .bind(payment.paid_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(PaymentInsert::Inserted(Payment::try_from(row)?));
        }

        match self.payment_by_reference(&payment.provider_reference).await? {
            Some(existing) => Ok(PaymentInsert::Existing(existing)),
            None => Err(BillingError::Internal(format!(
                "payment {} conflicted but could not be read back",
                payment.provider_reference
            ))),
        }
    }

    async fn transition_payment(
        &self,
        provider_reference: &str,
        from: PaymentStatus,
        to: PaymentStatus,
        paid_at: Option<OffsetDateTime>,
    ) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(payment_returning!(
            r#"
            UPDATE payments
            SET status = $3, paid_at = COALESCE($4, paid_at), updated_at = NOW()
            WHERE provider_reference = $1 AND status = $2
            "#
        ))
        .bind(provider_reference)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(paid_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn settle_pending_refund(
        &self,
        external_refund_ref: &str,
        status: RefundStatus,
    ) -> BillingResult<Option<Refund>> {
        let row: Option<RefundRow> = sqlx::query_as(refund_returning!(
            r#"
            UPDATE refunds
            SET status = $2, updated_at = NOW()
            WHERE external_refund_ref = $1 AND status = 'pending'
            "#
        ))
        .bind(external_refund_ref)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Refund::try_from).transpose()
    }

    async fn refund_by_reference(
        &self,
        external_refund_ref: &str,
    ) -> BillingResult<Option<Refund>> {
        let row: Option<RefundRow> = sqlx::query_as(
            r#"
            SELECT id, payment_id, invoice_id, amount_minor, status, external_refund_ref
            FROM refunds
            WHERE external_refund_ref = $1
            "#,
        )
        .bind(external_refund_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Refund::try_from).transpose()
    }

    async fn insert_refund_if_absent(&self, refund: NewRefund) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO refunds
                (id, payment_id, invoice_id, amount_minor, status, external_refund_ref)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (external_refund_ref) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(refund.payment_id)
        .bind(refund.invoice_id)
        .bind(refund.amount_minor)
        .bind(refund.status.as_str())
        .bind(&refund.external_refund_ref)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_dispute_if_absent(&self, dispute: NewDispute) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO disputes
                (id, external_dispute_ref, payment_id, invoice_id, amount_minor, status,
                 reason, evidence_due_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (external_dispute_ref) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&dispute.external_dispute_ref)
        .bind(dispute.payment_id)
        .bind(dispute.invoice_id)
        .bind(dispute.amount_minor)
        .bind(dispute.status.as_str())
        .bind(&dispute.reason)
        .bind(dispute.evidence_due_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_dispute_status(
        &self,
        external_dispute_ref: &str,
        status: DisputeStatus,
        evidence_due_by: Option<OffsetDateTime>,
    ) -> BillingResult<Option<Dispute>> {
        let row: Option<DisputeRow> = sqlx::query_as(
            r#"
            UPDATE disputes
            SET status = $2,
                evidence_due_by = COALESCE($3, evidence_due_by),
                updated_at = NOW()
            WHERE external_dispute_ref = $1
            RETURNING id, external_dispute_ref, payment_id, invoice_id, amount_minor, status,
                      reason, evidence_due_by
            "#,
        )
        .bind(external_dispute_ref)
        .bind(status.as_str())
        .bind(evidence_due_by)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Dispute::try_from).transpose()
    }
}
