//! Typed records for the billing tables
//!
//! Each table has a raw `sqlx::FromRow` row type mirroring the columns and a
//! typed record built from it with `TryFrom`. Unknown status strings and
//! negative amounts are rejected instead of flowing into the handlers.

use std::fmt;
use std::str::FromStr;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::SeatLimits;

/// Declares a status enum stored as TEXT, with `as_str`, `Display` and `FromStr`.
macro_rules! text_status {
    ($(#[$meta:meta])* $name:ident, $table:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BillingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BillingError::malformed(
                        $table,
                        format!("unknown {} '{}'", stringify!($name), other),
                    )),
                }
            }
        }
    };
}

text_status!(
    /// Organisation subscription state
    SubscriptionStatus, "organisations" {
        Trialing => "trialing",
        Active => "active",
        PastDue => "past_due",
        Cancelled => "cancelled",
        Paused => "paused",
    }
);

text_status!(
    /// Payment-provider Connect onboarding state
    ConnectStatus, "organisations" {
        Pending => "pending",
        Restricted => "restricted",
        Active => "active",
    }
);

text_status!(
    InvoiceStatus, "invoices" {
        Draft => "draft",
        Sent => "sent",
        Overdue => "overdue",
        Paid => "paid",
        Void => "void",
    }
);

text_status!(
    InstallmentStatus, "invoice_installments" {
        Pending => "pending",
        Overdue => "overdue",
        Paid => "paid",
    }
);

text_status!(
    PaymentStatus, "payments" {
        Processing => "processing",
        Succeeded => "succeeded",
        Failed => "failed",
    }
);

text_status!(
    RefundStatus, "refunds" {
        Pending => "pending",
        Succeeded => "succeeded",
        Failed => "failed",
    }
);

text_status!(
    DisputeStatus, "disputes" {
        WarningNeedsResponse => "warning_needs_response",
        WarningUnderReview => "warning_under_review",
        WarningClosed => "warning_closed",
        NeedsResponse => "needs_response",
        UnderReview => "under_review",
        Won => "won",
        Lost => "lost",
    }
);

impl InstallmentStatus {
    /// Installments that a "settle remaining balance" payment closes out
    pub fn is_open(&self) -> bool {
        matches!(self, InstallmentStatus::Pending | InstallmentStatus::Overdue)
    }
}

fn non_negative(table: &'static str, column: &str, value: i64) -> BillingResult<i64> {
    if value < 0 {
        return Err(BillingError::malformed(
            table,
            format!("{} is negative ({})", column, value),
        ));
    }
    Ok(value)
}

fn seat_count(column: &str, value: i32) -> BillingResult<u32> {
    u32::try_from(value).map_err(|_| {
        BillingError::malformed("organisations", format!("{} is negative ({})", column, value))
    })
}

// ============ Processed events ============

/// Dedup ledger entry. Created once per inbound event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub received_at: OffsetDateTime,
}

// ============ Organisations ============

/// Subscription fields of an organisation, written as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub plan: String,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub external_subscription_ref: Option<String>,
    pub limits: SeatLimits,
    pub past_due_since: Option<OffsetDateTime>,
    pub cancels_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organisation {
    pub id: Uuid,
    pub subscription_plan: String,
    pub subscription_status: SubscriptionStatus,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub external_subscription_ref: Option<String>,
    pub limits: SeatLimits,
    pub past_due_since: Option<OffsetDateTime>,
    pub cancels_at: Option<OffsetDateTime>,
    pub connect_account_ref: Option<String>,
    pub connect_status: ConnectStatus,
}

impl Organisation {
    pub fn subscription_state(&self) -> SubscriptionState {
        SubscriptionState {
            plan: self.subscription_plan.clone(),
            status: self.subscription_status,
            trial_ends_at: self.trial_ends_at,
            external_subscription_ref: self.external_subscription_ref.clone(),
            limits: self.limits,
            past_due_since: self.past_due_since,
            cancels_at: self.cancels_at,
        }
    }

    pub fn apply_subscription_state(&mut self, state: SubscriptionState) {
        self.subscription_plan = state.plan;
        self.subscription_status = state.status;
        self.trial_ends_at = state.trial_ends_at;
        self.external_subscription_ref = state.external_subscription_ref;
        self.limits = state.limits;
        self.past_due_since = state.past_due_since;
        self.cancels_at = state.cancels_at;
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OrganisationRow {
    pub id: Uuid,
    pub subscription_plan: String,
    pub subscription_status: String,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub external_subscription_ref: Option<String>,
    pub max_students: i32,
    pub max_teachers: i32,
    pub past_due_since: Option<OffsetDateTime>,
    pub cancels_at: Option<OffsetDateTime>,
    pub connect_account_ref: Option<String>,
    pub connect_status: String,
}

impl TryFrom<OrganisationRow> for Organisation {
    type Error = BillingError;

    fn try_from(row: OrganisationRow) -> BillingResult<Self> {
        Ok(Self {
            id: row.id,
            subscription_plan: row.subscription_plan,
            subscription_status: row.subscription_status.parse()?,
            trial_ends_at: row.trial_ends_at,
            external_subscription_ref: row.external_subscription_ref,
            limits: SeatLimits {
                max_students: seat_count("max_students", row.max_students)?,
                max_teachers: seat_count("max_teachers", row.max_teachers)?,
            },
            past_due_since: row.past_due_since,
            cancels_at: row.cancels_at,
            connect_account_ref: row.connect_account_ref,
            connect_status: row.connect_status.parse()?,
        })
    }
}

// ============ Invoices ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub id: Uuid,
    pub org_id: Uuid,
    pub invoice_number: String,
    pub currency: String,
    pub total_minor: i64,
    /// Derived: succeeded payments minus succeeded refunds and lost disputes
    pub paid_minor: i64,
    pub status: InvoiceStatus,
    pub payer_email: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct InvoiceRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub invoice_number: String,
    pub currency: String,
    pub total_minor: i64,
    pub paid_minor: i64,
    pub status: String,
    pub payer_email: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> BillingResult<Self> {
        Ok(Self {
            id: row.id,
            org_id: row.org_id,
            invoice_number: row.invoice_number,
            currency: row.currency,
            total_minor: non_negative("invoices", "total_minor", row.total_minor)?,
            paid_minor: row.paid_minor,
            status: row.status.parse()?,
            payer_email: row.payer_email,
            paid_at: row.paid_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceInstallment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub installment_number: i32,
    pub amount_minor: i64,
    pub status: InstallmentStatus,
    pub external_payment_ref: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
}

// ============ Payments ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub amount_minor: i64,
    pub method: String,
    /// Globally unique provider id (payment intent). Primary idempotency guard.
    pub provider_reference: String,
    pub status: PaymentStatus,
    pub paid_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub invoice_id: Uuid,
    pub amount_minor: i64,
    pub method: String,
    pub provider_reference: String,
    pub status: PaymentStatus,
    pub paid_at: Option<OffsetDateTime>,
}

/// Result of a unique-constrained payment insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentInsert {
    Inserted(Payment),
    /// A row with the same provider reference already existed
    Existing(Payment),
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PaymentRow {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub amount_minor: i64,
    pub method: String,
    pub provider_reference: String,
    pub status: String,
    pub paid_at: Option<OffsetDateTime>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> BillingResult<Self> {
        if row.provider_reference.is_empty() {
            return Err(BillingError::malformed("payments", "empty provider_reference"));
        }
        Ok(Self {
            id: row.id,
            invoice_id: row.invoice_id,
            amount_minor: non_negative("payments", "amount_minor", row.amount_minor)?,
            method: row.method,
            provider_reference: row.provider_reference,
            status: row.status.parse()?,
            paid_at: row.paid_at,
        })
    }
}

// ============ Refunds ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    pub id: Uuid,
    /// None when the refund landed before its payment was recorded
    pub payment_id: Option<Uuid>,
    pub invoice_id: Uuid,
    pub amount_minor: i64,
    pub status: RefundStatus,
    pub external_refund_ref: String,
}

#[derive(Debug, Clone)]
pub struct NewRefund {
    pub payment_id: Option<Uuid>,
    pub invoice_id: Uuid,
    pub amount_minor: i64,
    pub status: RefundStatus,
    pub external_refund_ref: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RefundRow {
    pub id: Uuid,
    pub payment_id: Option<Uuid>,
    pub invoice_id: Uuid,
    pub amount_minor: i64,
    pub status: String,
    pub external_refund_ref: String,
}

impl TryFrom<RefundRow> for Refund {
    type Error = BillingError;

    fn try_from(row: RefundRow) -> BillingResult<Self> {
        Ok(Self {
            id: row.id,
            payment_id: row.payment_id,
            invoice_id: row.invoice_id,
            amount_minor: non_negative("refunds", "amount_minor", row.amount_minor)?,
            status: row.status.parse()?,
            external_refund_ref: row.external_refund_ref,
        })
    }
}

// ============ Disputes ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispute {
    pub id: Uuid,
    pub external_dispute_ref: String,
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub amount_minor: i64,
    pub status: DisputeStatus,
    pub reason: Option<String>,
    pub evidence_due_by: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewDispute {
    pub external_dispute_ref: String,
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub amount_minor: i64,
    pub status: DisputeStatus,
    pub reason: Option<String>,
    pub evidence_due_by: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DisputeRow {
    pub id: Uuid,
    pub external_dispute_ref: String,
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub amount_minor: i64,
    pub status: String,
    pub reason: Option<String>,
    pub evidence_due_by: Option<OffsetDateTime>,
}

impl TryFrom<DisputeRow> for Dispute {
    type Error = BillingError;

    fn try_from(row: DisputeRow) -> BillingResult<Self> {
        Ok(Self {
            id: row.id,
            external_dispute_ref: row.external_dispute_ref,
            payment_id: row.payment_id,
            invoice_id: row.invoice_id,
            amount_minor: non_negative("disputes", "amount_minor", row.amount_minor)?,
            status: row.status.parse()?,
            reason: row.reason,
            evidence_due_by: row.evidence_due_by,
        })
    }
}
