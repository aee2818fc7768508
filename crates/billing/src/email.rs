//! Payment receipt e-mails via the Resend API
//!
//! Receipts are a side effect of a newly recorded payment. Delivery failures
//! are reported to the caller, which logs and drops them.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_BASE: &str = "https://api.resend.com";
const DEFAULT_FROM: &str = "LessonLoop Billing <billing@lessonloop.app>";

/// Total delivery attempts, including the first
const MAX_ATTEMPTS: usize = 3;

/// A receipt for one recorded payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub to: String,
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub amount_minor: i64,
    pub currency: String,
}

impl PaymentReceipt {
    pub fn subject(&self) -> String {
        format!("Payment received for invoice {}", self.invoice_number)
    }

    pub fn html(&self) -> String {
        format!(
            "<p>Thank you. We have received your payment of <strong>{}</strong> \
             towards invoice {}.</p>",
            format_amount(self.amount_minor, &self.currency),
            self.invoice_number
        )
    }
}

/// Render a minor-unit amount for humans, e.g. `5000, "gbp"` as `£50.00`
pub fn format_amount(amount_minor: i64, currency: &str) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let major = amount_minor.unsigned_abs() / 100;
    let minor = amount_minor.unsigned_abs() % 100;
    match currency.to_ascii_lowercase().as_str() {
        "gbp" => format!("{}£{}.{:02}", sign, major, minor),
        "eur" => format!("{}€{}.{:02}", sign, major, minor),
        "usd" => format!("{}${}.{:02}", sign, major, minor),
        other => format!("{}{}.{:02} {}", sign, major, minor, other.to_uppercase()),
    }
}

/// Sends receipts for recorded payments
#[async_trait]
pub trait ReceiptSender: Send + Sync {
    async fn send_payment_receipt(&self, receipt: &PaymentReceipt) -> BillingResult<()>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key. None disables receipts.
    pub api_key: Option<String>,
    pub from: String,
    pub api_base: String,
}

impl EmailConfig {
    /// Reads `RESEND_API_KEY`, `BILLING_EMAIL_FROM` and `RESEND_API_BASE`
    pub fn from_env() -> Self {
        let api_key = std::env::var("RESEND_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        Self {
            api_key,
            from: std::env::var("BILLING_EMAIL_FROM").unwrap_or_else(|_| DEFAULT_FROM.to_string()),
            api_base: std::env::var("RESEND_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            api_key: None,
            from: DEFAULT_FROM.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    html: String,
}

/// Resend-backed receipt sender
#[derive(Clone)]
pub struct ReceiptMailer {
    client: reqwest::Client,
    config: EmailConfig,
}

impl ReceiptMailer {
    pub fn new(config: EmailConfig) -> Self {
        if config.api_key.is_none() {
            tracing::info!("RESEND_API_KEY not set, payment receipts are disabled");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client, config }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn post_once(&self, api_key: &str, body: &ResendEmail<'_>) -> BillingResult<()> {
        let response = self
            .client
            .post(format!("{}/emails", self.config.api_base.trim_end_matches('/')))
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BillingError::Email(format!("Resend returned {}: {}", status, text)));
        }
        Ok(())
    }
}

#[async_trait]
impl ReceiptSender for ReceiptMailer {
    async fn send_payment_receipt(&self, receipt: &PaymentReceipt) -> BillingResult<()> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::debug!(invoice_id = %receipt.invoice_id, "Receipts disabled, skipping");
            return Ok(());
        };

        let body = ResendEmail {
            from: &self.config.from,
            to: [receipt.to.as_str()],
            subject: receipt.subject(),
            html: receipt.html(),
        };

        let strategy = ExponentialBackoff::from_millis(10)
            .factor(10)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(MAX_ATTEMPTS - 1);

        Retry::spawn(strategy, || self.post_once(api_key, &body)).await?;

        tracing::info!(
            invoice_id = %receipt.invoice_id,
            org_id = %receipt.org_id,
            "Payment receipt sent"
        );
        Ok(())
    }
}
