//! Webhook ingress and dispatch
//!
//! Pipeline for one delivery:
//!
//! 1. verify the signature over the raw body (rejected deliveries are never recorded)
//! 2. parse the envelope and decode the object for known kinds
//! 3. claim the event id in the dedup ledger; a lost claim means duplicate
//! 4. route to exactly one handler
//!
//! If the handler fails the claim is released before the error is returned,
//! so the provider's redelivery runs the (idempotent) handler again.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connect::ConnectHandler;
use crate::dispute::DisputeHandler;
use crate::error::BillingResult;
use crate::events::{EventContext, EventKind, ProviderEvent, WebhookEnvelope};
use crate::notifications::SideEffects;
use crate::payments::PaymentReconciler;
use crate::plans::PlanCatalog;
use crate::refund::RefundHandler;
use crate::settlement::{SettlementEvent, SettlementHandler};
use crate::signature::SignatureVerifier;
use crate::store::LedgerStore;
use crate::subscriptions::SubscriptionLifecycle;

/// A handler for one decoded event payload
#[async_trait]
pub trait EventHandler<E: Send + 'static>: Send + Sync {
    async fn handle(&self, ctx: &EventContext, event: E) -> BillingResult<()>;
}

/// How an accepted delivery was handled. Every variant is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Event id already in the ledger
    Duplicate,
    /// Unknown kind, or a known kind outside this engine
    Ignored,
}

pub struct WebhookHandler {
    verifier: SignatureVerifier,
    store: Arc<dyn LedgerStore>,
    subscriptions: SubscriptionLifecycle,
    payments: PaymentReconciler,
    settlement: SettlementHandler,
    refunds: RefundHandler,
    disputes: DisputeHandler,
    connect: ConnectHandler,
}

impl WebhookHandler {
    pub fn new(
        verifier: SignatureVerifier,
        store: Arc<dyn LedgerStore>,
        catalog: Arc<PlanCatalog>,
        side_effects: SideEffects,
    ) -> Self {
        Self {
            verifier,
            subscriptions: SubscriptionLifecycle::new(store.clone(), catalog),
            payments: PaymentReconciler::new(store.clone(), side_effects),
            settlement: SettlementHandler::new(store.clone()),
            refunds: RefundHandler::new(store.clone()),
            disputes: DisputeHandler::new(store.clone()),
            connect: ConnectHandler::new(store.clone()),
            store,
        }
    }

    /// Verify the signature and parse the envelope
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEnvelope> {
        self.verifier.verify(payload, signature)?;
        WebhookEnvelope::parse(payload)
    }

    /// Verify and handle one raw delivery
    pub async fn process(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        let envelope = self.verify_event(payload, signature)?;
        self.handle_event(envelope).await
    }

    /// Deduplicate and dispatch a verified event
    pub async fn handle_event(&self, envelope: WebhookEnvelope) -> BillingResult<WebhookOutcome> {
        let ctx = EventContext::from_envelope(&envelope);

        // Decode before claiming so a malformed object is never recorded
        let event = EventKind::from_type(&envelope.event_type)
            .map(|kind| ProviderEvent::decode(kind, envelope.data.object))
            .transpose()?;

        if !self
            .store
            .record_event_if_new(&ctx.event_id, &ctx.event_type)
            .await?
        {
            tracing::info!(
                event_id = %ctx.event_id,
                event_type = %ctx.event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let Some(event) = event else {
            tracing::info!(
                event_id = %ctx.event_id,
                event_type = %ctx.event_type,
                "Unhandled webhook event type"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        tracing::info!(
            event_id = %ctx.event_id,
            event_type = %ctx.event_type,
            "Processing webhook event"
        );

        match self.dispatch(&ctx, event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!(
                    event_id = %ctx.event_id,
                    event_type = %ctx.event_type,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Webhook handler failed, releasing event claim"
                );
                if let Err(release_err) = self.store.release_event(&ctx.event_id).await {
                    tracing::error!(
                        event_id = %ctx.event_id,
                        error = %release_err,
                        "Failed to release event claim; redelivery will be treated as duplicate"
                    );
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, ctx: &EventContext, event: ProviderEvent) -> BillingResult<WebhookOutcome> {
        match event {
            ProviderEvent::Subscription(event) => self.subscriptions.handle(ctx, event).await?,
            ProviderEvent::PaymentSucceeded(notice) => self.payments.handle(ctx, notice).await?,
            ProviderEvent::PaymentProcessing(notice) => {
                self.settlement
                    .handle(ctx, SettlementEvent::Processing(notice))
                    .await?
            }
            ProviderEvent::PaymentFailed(notice) => {
                self.settlement
                    .handle(ctx, SettlementEvent::Failed(notice))
                    .await?
            }
            ProviderEvent::Refunds(notices) => {
                if notices.is_empty() {
                    tracing::info!(event_id = %ctx.event_id, "Refund event carried no refunds");
                }
                for notice in notices {
                    self.refunds.handle(ctx, notice).await?;
                }
            }
            ProviderEvent::Dispute(notice) => self.disputes.handle(ctx, notice).await?,
            ProviderEvent::Account(notice) => self.connect.handle(ctx, notice).await?,
            ProviderEvent::NotApplicable(reason) => {
                tracing::info!(
                    event_id = %ctx.event_id,
                    event_type = %ctx.event_type,
                    reason,
                    "Webhook event not applicable"
                );
                return Ok(WebhookOutcome::Ignored);
            }
        }
        Ok(WebhookOutcome::Processed)
    }
}
