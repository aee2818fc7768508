// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries row context for malformed data
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! LessonLoop Billing Module
//!
//! Reconciles payment-provider webhooks into the billing ledger.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw body with a replay window
//! - **Deduplication**: Every event id is processed at most once
//! - **Subscriptions**: Organisation plan, status and seat limits follow the provider
//! - **Invoice Payments**: Payments and installments applied to teaching invoices
//! - **Delayed Settlement**: Debit payments recorded as processing until they settle
//! - **Refunds & Disputes**: Reduce paid-to-date and revert paid invoices
//! - **Connect**: Onboarding status of organisations' connected accounts
//! - **Side Effects**: Payment feed notifications and receipt e-mails
//! - **Invariants**: Read-only consistency checks for the worker
//!
//! Invoice `paid_minor` and `status` are always recomputed from the full set
//! of payment, refund and dispute rows, never adjusted in place.

pub mod connect;
pub mod dispute;
pub mod email;
pub mod error;
pub mod events;
pub mod invariants;
pub mod models;
pub mod notifications;
pub mod payments;
pub mod plans;
pub mod recompute;
pub mod refund;
pub mod settlement;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Email
pub use email::{EmailConfig, PaymentReceipt, ReceiptMailer, ReceiptSender};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventContext, EventKind, ProviderEvent, WebhookEnvelope};

// Invariants
pub use invariants::{
    DriftedInvoice, InvariantCheckSummary, InvariantChecker, InvariantViolation,
    ViolationSeverity,
};

// Models
pub use models::{
    ConnectStatus, Dispute, DisputeStatus, InstallmentStatus, Invoice, InvoiceInstallment,
    InvoiceStatus, Organisation, Payment, PaymentStatus, ProcessedEvent, Refund, RefundStatus,
    SubscriptionState, SubscriptionStatus,
};

// Notifications
pub use notifications::{
    MemoryNotificationSink, NotificationSink, PaymentNotification, PgNotificationSink,
    SideEffects,
};

// Plans
pub use plans::{Plan, PlanCatalog, SeatLimits, CANCELLED_LIMITS};

// Signature
pub use signature::{SignatureVerifier, DEFAULT_TOLERANCE_SECS};

// Store
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};

// Webhooks
pub use webhooks::{EventHandler, WebhookHandler, WebhookOutcome};
