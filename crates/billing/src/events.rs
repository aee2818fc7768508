//! Provider event model
//!
//! Inbound payloads are a JSON envelope `{id, type, created, data: {object}}`.
//! The `type` string resolves to a closed [`EventKind`]; each kind decodes its
//! `data.object` into the typed payload its handler consumes. Unknown kinds are
//! not errors: the provider adds new kinds over time and they must be
//! acknowledged without a handler.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{ConnectStatus, DisputeStatus};

/// Metadata keys the checkout flow attaches to invoice payments
pub const META_INVOICE_ID: &str = "invoice_id";
pub const META_INSTALLMENT_ID: &str = "installment_id";
pub const META_PAY_REMAINING: &str = "pay_remaining";
pub const META_ORG_ID: &str = "org_id";
pub const META_PLAN: &str = "plan";

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

type Metadata = HashMap<String, String>;

// ============ Envelope ============

/// Outer webhook envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeData {
    pub object: serde_json::Value,
}

impl WebhookEnvelope {
    pub fn parse(payload: &[u8]) -> BillingResult<Self> {
        let envelope: WebhookEnvelope = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook envelope");
            BillingError::InvalidPayload("malformed JSON envelope".to_string())
        })?;

        if envelope.id.is_empty() || envelope.event_type.is_empty() {
            return Err(BillingError::InvalidPayload(
                "envelope is missing id or type".to_string(),
            ));
        }

        Ok(envelope)
    }

    /// When the provider says the event happened; falls back to now
    pub fn occurred_at(&self) -> OffsetDateTime {
        self.created
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or_else(OffsetDateTime::now_utc)
    }
}

/// Identity of the event being processed, passed to every handler
#[derive(Debug, Clone)]
pub struct EventContext {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: OffsetDateTime,
}

impl EventContext {
    pub fn from_envelope(envelope: &WebhookEnvelope) -> Self {
        Self {
            event_id: envelope.id.clone(),
            event_type: envelope.event_type.clone(),
            occurred_at: envelope.occurred_at(),
        }
    }
}

// ============ Event kinds ============

/// Every event kind the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionResumed,
    SubscriptionPaused,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentFailed,
    CheckoutSessionCompleted,
    CheckoutSessionAsyncPaymentSucceeded,
    CheckoutSessionAsyncPaymentFailed,
    PaymentIntentSucceeded,
    PaymentIntentProcessing,
    PaymentIntentPaymentFailed,
    ChargeRefunded,
    RefundUpdated,
    ChargeRefundUpdated,
    DisputeCreated,
    DisputeUpdated,
    DisputeClosed,
    AccountUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 20] = [
        EventKind::SubscriptionCreated,
        EventKind::SubscriptionUpdated,
        EventKind::SubscriptionResumed,
        EventKind::SubscriptionPaused,
        EventKind::SubscriptionDeleted,
        EventKind::InvoicePaid,
        EventKind::InvoicePaymentFailed,
        EventKind::CheckoutSessionCompleted,
        EventKind::CheckoutSessionAsyncPaymentSucceeded,
        EventKind::CheckoutSessionAsyncPaymentFailed,
        EventKind::PaymentIntentSucceeded,
        EventKind::PaymentIntentProcessing,
        EventKind::PaymentIntentPaymentFailed,
        EventKind::ChargeRefunded,
        EventKind::RefundUpdated,
        EventKind::ChargeRefundUpdated,
        EventKind::DisputeCreated,
        EventKind::DisputeUpdated,
        EventKind::DisputeClosed,
        EventKind::AccountUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SubscriptionCreated => "customer.subscription.created",
            EventKind::SubscriptionUpdated => "customer.subscription.updated",
            EventKind::SubscriptionResumed => "customer.subscription.resumed",
            EventKind::SubscriptionPaused => "customer.subscription.paused",
            EventKind::SubscriptionDeleted => "customer.subscription.deleted",
            EventKind::InvoicePaid => "invoice.paid",
            EventKind::InvoicePaymentFailed => "invoice.payment_failed",
            EventKind::CheckoutSessionCompleted => "checkout.session.completed",
            EventKind::CheckoutSessionAsyncPaymentSucceeded => {
                "checkout.session.async_payment_succeeded"
            }
            EventKind::CheckoutSessionAsyncPaymentFailed => "checkout.session.async_payment_failed",
            EventKind::PaymentIntentSucceeded => "payment_intent.succeeded",
            EventKind::PaymentIntentProcessing => "payment_intent.processing",
            EventKind::PaymentIntentPaymentFailed => "payment_intent.payment_failed",
            EventKind::ChargeRefunded => "charge.refunded",
            EventKind::RefundUpdated => "refund.updated",
            EventKind::ChargeRefundUpdated => "charge.refund.updated",
            EventKind::DisputeCreated => "charge.dispute.created",
            EventKind::DisputeUpdated => "charge.dispute.updated",
            EventKind::DisputeClosed => "charge.dispute.closed",
            EventKind::AccountUpdated => "account.updated",
        }
    }

    pub fn from_type(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == event_type)
    }
}

// ============ Provider objects ============

/// A reference the provider may send either as a bare id or as an expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListObject<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for ListObject<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceObject {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<PriceObject>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: ListObject<SubscriptionItem>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

impl SubscriptionObject {
    /// Price of the base plan item
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .iter()
            .find_map(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    /// Period end, reported on the subscription or (newer API versions) on its items
    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end.or_else(|| {
            self.items
                .data
                .iter()
                .find_map(|item| item.current_period_end)
        })
    }

    pub fn org_id(&self) -> BillingResult<Option<Uuid>> {
        metadata_uuid(&self.metadata, META_ORG_ID)
    }
}

/// Platform invoice for an organisation's own subscription
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionInvoiceObject {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<Expandable>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_received: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub payment_method_types: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<Expandable>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub payment_method_types: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundObject {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    pub status: String,
    #[serde(default)]
    pub payment_intent: Option<Expandable>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<Expandable>,
    #[serde(default)]
    pub refunds: Option<ListObject<RefundObject>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvidenceDetails {
    #[serde(default)]
    pub due_by: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisputeObject {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    pub status: String,
    #[serde(default)]
    pub payment_intent: Option<Expandable>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub evidence_details: Option<EvidenceDetails>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountObject {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

// ============ Handler payloads ============

#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A new subscription; may replace the organisation's current one
    Created(SubscriptionObject),
    /// updated / resumed: sync status from the provider object
    Synced(SubscriptionObject),
    Paused(SubscriptionObject),
    Deleted(SubscriptionObject),
    PaymentFailed(SubscriptionInvoiceObject),
    PaymentSucceeded(SubscriptionInvoiceObject),
}

/// A payment against a teaching invoice, from a payment intent or checkout session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotice {
    pub provider_reference: String,
    pub amount_minor: i64,
    pub method: String,
    /// None when the payment is not for a teaching invoice
    pub invoice_id: Option<Uuid>,
    pub installment_id: Option<Uuid>,
    /// Settle every open installment on the invoice
    pub pay_remaining: bool,
}

/// Provider-side refund state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRefundStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
    RequiresAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundNotice {
    pub external_refund_ref: String,
    pub amount_minor: i64,
    pub status: ProviderRefundStatus,
    pub payment_reference: Option<String>,
    pub invoice_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputePhase {
    Created,
    Updated,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeNotice {
    pub phase: DisputePhase,
    pub external_dispute_ref: String,
    pub amount_minor: i64,
    pub status: DisputeStatus,
    pub payment_reference: Option<String>,
    /// Teaching invoice named in the dispute's metadata
    pub invoice_id: Option<Uuid>,
    pub reason: Option<String>,
    pub evidence_due_by: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountNotice {
    pub account_ref: String,
    pub org_id: Option<Uuid>,
    pub status: ConnectStatus,
}

/// A verified event decoded for exactly one handler
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Subscription(SubscriptionEvent),
    PaymentSucceeded(PaymentNotice),
    PaymentProcessing(PaymentNotice),
    PaymentFailed(PaymentNotice),
    Refunds(Vec<RefundNotice>),
    Dispute(DisputeNotice),
    Account(AccountNotice),
    /// Known kind whose object is outside this engine (e.g. subscription checkouts)
    NotApplicable(&'static str),
}

fn decode<T: for<'de> Deserialize<'de>>(kind: EventKind, object: serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(object).map_err(|e| {
        BillingError::InvalidPayload(format!("{} object: {}", kind.as_str(), e))
    })
}

fn metadata_uuid(metadata: &Metadata, key: &str) -> BillingResult<Option<Uuid>> {
    match metadata.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(value) => Uuid::parse_str(value)
            .map(Some)
            .map_err(|_| BillingError::InvalidPayload(format!("metadata.{} is not a UUID", key))),
        None => Ok(None),
    }
}

fn metadata_flag(metadata: &Metadata, key: &str) -> bool {
    metadata
        .get(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

fn non_negative(what: &str, amount_minor: i64) -> BillingResult<()> {
    if amount_minor < 0 {
        return Err(BillingError::InvalidPayload(format!(
            "negative {} amount {}",
            what, amount_minor
        )));
    }
    Ok(())
}

pub(crate) fn unix_time(secs: Option<i64>) -> BillingResult<Option<OffsetDateTime>> {
    secs.map(|ts| {
        OffsetDateTime::from_unix_timestamp(ts)
            .map_err(|_| BillingError::InvalidPayload(format!("timestamp {} out of range", ts)))
    })
    .transpose()
}

/// Pick the method a payment settled with from the advertised types.
/// A processing notice implies an asynchronous (debit) method.
fn resolve_method(types: &[String], delayed: bool) -> String {
    match types {
        [] => "card".to_string(),
        [only] => only.clone(),
        many if delayed => many
            .iter()
            .find(|t| t.as_str() != "card")
            .cloned()
            .unwrap_or_else(|| "card".to_string()),
        many => many
            .iter()
            .find(|t| t.as_str() == "card")
            .cloned()
            .unwrap_or_else(|| many[0].clone()),
    }
}

impl PaymentNotice {
    fn from_payment_intent(pi: PaymentIntentObject, delayed: bool) -> BillingResult<Self> {
        Ok(Self {
            amount_minor: pi.amount_received.filter(|a| *a > 0).unwrap_or(pi.amount),
            method: resolve_method(&pi.payment_method_types, delayed),
            invoice_id: metadata_uuid(&pi.metadata, META_INVOICE_ID)?,
            installment_id: metadata_uuid(&pi.metadata, META_INSTALLMENT_ID)?,
            pay_remaining: metadata_flag(&pi.metadata, META_PAY_REMAINING),
            provider_reference: pi.id,
        })
    }

    fn from_checkout_session(cs: CheckoutSessionObject, delayed: bool) -> BillingResult<Self> {
        // The payment intent id is shared with payment_intent.* events for the
        // same payment, so both converge on one payment row.
        let provider_reference = match cs.payment_intent.as_ref() {
            Some(pi) => pi.id().to_string(),
            None => {
                tracing::warn!(
                    session = %cs.id,
                    "Checkout session has no payment intent, keying payment by session id"
                );
                cs.id.clone()
            }
        };

        Ok(Self {
            provider_reference,
            amount_minor: cs.amount_total.unwrap_or(0),
            method: resolve_method(&cs.payment_method_types, delayed),
            invoice_id: metadata_uuid(&cs.metadata, META_INVOICE_ID)?,
            installment_id: metadata_uuid(&cs.metadata, META_INSTALLMENT_ID)?,
            pay_remaining: metadata_flag(&cs.metadata, META_PAY_REMAINING),
        })
    }
}

impl RefundNotice {
    fn from_refund(refund: RefundObject, fallback_payment: Option<&str>) -> BillingResult<Self> {
        let status = match refund.status.as_str() {
            "pending" => ProviderRefundStatus::Pending,
            "succeeded" => ProviderRefundStatus::Succeeded,
            "failed" => ProviderRefundStatus::Failed,
            "canceled" => ProviderRefundStatus::Canceled,
            "requires_action" => ProviderRefundStatus::RequiresAction,
            other => {
                return Err(BillingError::InvalidPayload(format!(
                    "unknown refund status '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            amount_minor: refund.amount,
            status,
            payment_reference: refund
                .payment_intent
                .as_ref()
                .map(|pi| pi.id().to_string())
                .or_else(|| fallback_payment.map(str::to_string)),
            invoice_id: metadata_uuid(&refund.metadata, META_INVOICE_ID)?,
            external_refund_ref: refund.id,
        })
    }
}

impl ProviderEvent {
    /// Decode `data.object` for a known kind
    pub fn decode(kind: EventKind, object: serde_json::Value) -> BillingResult<Self> {
        use EventKind::*;

        let event = match kind {
            SubscriptionCreated | SubscriptionUpdated | SubscriptionResumed
            | SubscriptionPaused | SubscriptionDeleted => {
                let subscription: SubscriptionObject = decode(kind, object)?;
                subscription.org_id()?;
                unix_time(subscription.cancel_at)?;
                unix_time(subscription.period_end())?;
                unix_time(subscription.trial_end)?;
                ProviderEvent::Subscription(match kind {
                    SubscriptionCreated => SubscriptionEvent::Created(subscription),
                    SubscriptionPaused => SubscriptionEvent::Paused(subscription),
                    SubscriptionDeleted => SubscriptionEvent::Deleted(subscription),
                    _ => SubscriptionEvent::Synced(subscription),
                })
            }
            InvoicePaid => ProviderEvent::Subscription(SubscriptionEvent::PaymentSucceeded(
                decode(kind, object)?,
            )),
            InvoicePaymentFailed => ProviderEvent::Subscription(SubscriptionEvent::PaymentFailed(
                decode(kind, object)?,
            )),

            PaymentIntentSucceeded => ProviderEvent::PaymentSucceeded(
                PaymentNotice::from_payment_intent(decode(kind, object)?, false)?,
            ),
            PaymentIntentProcessing => ProviderEvent::PaymentProcessing(
                PaymentNotice::from_payment_intent(decode(kind, object)?, true)?,
            ),
            PaymentIntentPaymentFailed => ProviderEvent::PaymentFailed(
                PaymentNotice::from_payment_intent(decode(kind, object)?, true)?,
            ),

            CheckoutSessionCompleted => {
                let session: CheckoutSessionObject = decode(kind, object)?;
                if session.mode.as_deref().is_some_and(|mode| mode != "payment") {
                    return Ok(ProviderEvent::NotApplicable("checkout is not a one-off payment"));
                }
                match session.payment_status.as_deref() {
                    Some("paid") => ProviderEvent::PaymentSucceeded(
                        PaymentNotice::from_checkout_session(session, false)?,
                    ),
                    Some("unpaid") => ProviderEvent::PaymentProcessing(
                        PaymentNotice::from_checkout_session(session, true)?,
                    ),
                    _ => ProviderEvent::NotApplicable("checkout completed without a payment"),
                }
            }
            CheckoutSessionAsyncPaymentSucceeded => ProviderEvent::PaymentSucceeded(
                PaymentNotice::from_checkout_session(decode(kind, object)?, true)?,
            ),
            CheckoutSessionAsyncPaymentFailed => ProviderEvent::PaymentFailed(
                PaymentNotice::from_checkout_session(decode(kind, object)?, true)?,
            ),

            ChargeRefunded => {
                let charge: ChargeObject = decode(kind, object)?;
                let payment_ref = charge.payment_intent.as_ref().map(|pi| pi.id().to_string());
                let charge_invoice = metadata_uuid(&charge.metadata, META_INVOICE_ID)?;
                let refunds = charge
                    .refunds
                    .map(|list| list.data)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|refund| {
                        let mut notice = RefundNotice::from_refund(refund, payment_ref.as_deref())?;
                        notice.invoice_id = notice.invoice_id.or(charge_invoice);
                        Ok(notice)
                    })
                    .collect::<BillingResult<Vec<_>>>()?;
                ProviderEvent::Refunds(refunds)
            }
            RefundUpdated | ChargeRefundUpdated => ProviderEvent::Refunds(vec![
                RefundNotice::from_refund(decode(kind, object)?, None)?,
            ]),

            DisputeCreated | DisputeUpdated | DisputeClosed => {
                let dispute: DisputeObject = decode(kind, object)?;
                let phase = match kind {
                    DisputeCreated => DisputePhase::Created,
                    DisputeUpdated => DisputePhase::Updated,
                    _ => DisputePhase::Closed,
                };
                let status: DisputeStatus = dispute.status.parse().map_err(|_| {
                    BillingError::InvalidPayload(format!(
                        "unknown dispute status '{}'",
                        dispute.status
                    ))
                })?;
                ProviderEvent::Dispute(DisputeNotice {
                    phase,
                    amount_minor: dispute.amount,
                    status,
                    payment_reference: dispute.payment_intent.as_ref().map(|pi| pi.id().to_string()),
                    invoice_id: metadata_uuid(&dispute.metadata, META_INVOICE_ID)?,
                    reason: dispute.reason.filter(|r| !r.is_empty()),
                    evidence_due_by: unix_time(
                        dispute.evidence_details.and_then(|details| details.due_by),
                    )?,
                    external_dispute_ref: dispute.id,
                })
            }

            AccountUpdated => {
                let account: AccountObject = decode(kind, object)?;
                let status = if account.charges_enabled && account.payouts_enabled {
                    ConnectStatus::Active
                } else if account.details_submitted {
                    ConnectStatus::Restricted
                } else {
                    ConnectStatus::Pending
                };
                ProviderEvent::Account(AccountNotice {
                    org_id: metadata_uuid(&account.metadata, META_ORG_ID)?,
                    account_ref: account.id,
                    status,
                })
            }
        };

        match &event {
            ProviderEvent::PaymentSucceeded(notice)
            | ProviderEvent::PaymentProcessing(notice)
            | ProviderEvent::PaymentFailed(notice) => {
                non_negative("payment", notice.amount_minor)?
            }
            ProviderEvent::Refunds(notices) => {
                for notice in notices {
                    non_negative("refund", notice.amount_minor)?;
                }
            }
            ProviderEvent::Dispute(notice) => non_negative("dispute", notice.amount_minor)?,
            ProviderEvent::Subscription(_)
            | ProviderEvent::Account(_)
            | ProviderEvent::NotApplicable(_) => {}
        }

        Ok(event)
    }
}
