//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Malformed {table} row: {reason}")]
    MalformedRow { table: &'static str, reason: String },

    /// A refund or dispute referenced a payment that has not landed yet.
    /// Redelivery by the provider resolves it.
    #[error("Payment {0} has not been recorded yet")]
    PaymentNotYetRecorded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Email delivery failed: {0}")]
    Email(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the provider should redeliver the event that produced this error.
    ///
    /// Signature and payload problems are permanent: the same bytes will fail
    /// the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BillingError::WebhookSignatureInvalid | BillingError::InvalidPayload(_)
        )
    }

    pub(crate) fn malformed(table: &'static str, reason: impl Into<String>) -> Self {
        BillingError::MalformedRow {
            table,
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Email(err.to_string())
    }
}
