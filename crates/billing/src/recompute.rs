//! Invoice figures derived from the ledger rows
//!
//! `paid_minor` and `status` are never adjusted in place. Every mutating event
//! re-sums the invoice's payments, refunds and disputes and rewrites the
//! derived columns with [`derive_invoice_figures`]. The result depends only on
//! which rows exist, not on the order they arrived in.

use time::OffsetDateTime;

use crate::models::{Invoice, InvoiceStatus};

/// Sums over the source rows of one invoice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    /// Payments in `succeeded` state
    pub succeeded_payments: i64,
    /// Refunds in `succeeded` state
    pub succeeded_refunds: i64,
    /// Disputes closed as `lost`
    pub lost_disputes: i64,
}

impl LedgerTotals {
    /// Net amount collected. Not clamped: a refund recorded ahead of its
    /// payment yields a negative figure until the payment lands.
    pub fn paid_minor(&self) -> i64 {
        self.succeeded_payments - self.succeeded_refunds - self.lost_disputes
    }
}

/// New values for an invoice's derived columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoiceFigures {
    pub paid_minor: i64,
    pub status: InvoiceStatus,
    pub paid_at: Option<OffsetDateTime>,
}

impl InvoiceFigures {
    pub fn apply_to(&self, invoice: &mut Invoice) {
        invoice.paid_minor = self.paid_minor;
        invoice.status = self.status;
        invoice.paid_at = self.paid_at;
    }
}

/// Whether `paid_minor` covers the invoice total
pub fn is_fully_paid(paid_minor: i64, total_minor: i64) -> bool {
    paid_minor >= total_minor
}

/// Derive `paid_minor`, `status` and `paid_at` for `invoice` from `totals`.
///
/// Draft and void invoices keep their status. A paid invoice that falls below
/// its total reverts to `sent`; other statuses move to `paid` once covered.
pub fn derive_invoice_figures(
    invoice: &Invoice,
    totals: &LedgerTotals,
    now: OffsetDateTime,
) -> InvoiceFigures {
    let paid_minor = totals.paid_minor();
    let covered = is_fully_paid(paid_minor, invoice.total_minor);

    let (status, paid_at) = match invoice.status {
        InvoiceStatus::Draft | InvoiceStatus::Void => (invoice.status, invoice.paid_at),
        InvoiceStatus::Paid if covered => (InvoiceStatus::Paid, invoice.paid_at.or(Some(now))),
        InvoiceStatus::Paid => (InvoiceStatus::Sent, None),
        _ if covered => (InvoiceStatus::Paid, Some(now)),
        other => (other, invoice.paid_at),
    };

    InvoiceFigures {
        paid_minor,
        status,
        paid_at,
    }
}
