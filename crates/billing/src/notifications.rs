//! Post-commit side effects of a recorded payment
//!
//! Runs after the financial write has committed. Nothing here may fail the
//! event: errors are logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::email::{PaymentReceipt, ReceiptMailer, ReceiptSender};
use crate::error::BillingResult;
use crate::models::{Invoice, Payment};

/// Row in the real-time payment feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotification {
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub payment_id: Uuid,
    pub amount_minor: i64,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, notification: &PaymentNotification) -> BillingResult<()>;
}

/// Appends to `payment_notifications`
#[derive(Clone)]
pub struct PgNotificationSink {
    pool: PgPool,
}

impl PgNotificationSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgNotificationSink {
    async fn publish(&self, notification: &PaymentNotification) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_notifications (id, org_id, invoice_id, payment_id, amount_minor)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification.org_id)
        .bind(notification.invoice_id)
        .bind(notification.payment_id)
        .bind(notification.amount_minor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Collects notifications in memory
#[derive(Debug, Default)]
pub struct MemoryNotificationSink {
    published: Mutex<Vec<PaymentNotification>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<PaymentNotification> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn publish(&self, notification: &PaymentNotification) -> BillingResult<()> {
        self.published.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Fire-and-forget dispatcher for payment side effects
#[derive(Clone)]
pub struct SideEffects {
    notifications: Arc<dyn NotificationSink>,
    receipts: Arc<dyn ReceiptSender>,
}

impl SideEffects {
    pub fn new(notifications: Arc<dyn NotificationSink>, receipts: Arc<dyn ReceiptSender>) -> Self {
        Self {
            notifications,
            receipts,
        }
    }

    /// Postgres feed plus Resend receipts configured from the environment
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(
            Arc::new(PgNotificationSink::new(pool)),
            Arc::new(ReceiptMailer::from_env()),
        )
    }

    /// Spawn the side effects for a newly recorded payment.
    ///
    /// The returned handle only exists so tests can wait for completion;
    /// callers on the request path drop it.
    pub fn payment_recorded(&self, invoice: &Invoice, payment: &Payment) -> JoinHandle<()> {
        let notifications = Arc::clone(&self.notifications);
        let receipts = Arc::clone(&self.receipts);

        let notification = PaymentNotification {
            org_id: invoice.org_id,
            invoice_id: invoice.id,
            payment_id: payment.id,
            amount_minor: payment.amount_minor,
        };
        let receipt = invoice.payer_email.as_ref().map(|to| PaymentReceipt {
            to: to.clone(),
            org_id: invoice.org_id,
            invoice_id: invoice.id,
            invoice_number: invoice.invoice_number.clone(),
            amount_minor: payment.amount_minor,
            currency: invoice.currency.clone(),
        });

        tokio::spawn(async move {
            if let Err(e) = notifications.publish(&notification).await {
                tracing::error!(
                    error = %e,
                    invoice_id = %notification.invoice_id,
                    payment_id = %notification.payment_id,
                    "Failed to publish payment notification"
                );
            }

            if let Some(receipt) = receipt {
                if let Err(e) = receipts.send_payment_receipt(&receipt).await {
                    tracing::error!(
                        error = %e,
                        invoice_id = %receipt.invoice_id,
                        "Failed to send payment receipt"
                    );
                }
            }
        })
    }
}
