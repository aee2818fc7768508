//! Organisation subscription lifecycle
//!
//! State machine for an organisation's own platform subscription:
//!
//! ```text
//! trialing --active--> active --payment failed--> past_due --paid--> active
//! any --paused--> paused --resumed--> (provider status)
//! any --deleted--> cancelled   (seat limits clamped to the cancelled floor)
//! ```
//!
//! Created, updated and resumed events carry the full provider subscription
//! and are synced wholesale. Seat limits always follow the plan. Only a
//! created event may swap the organisation onto a different live
//! subscription; late events for a replaced one are ignored.

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::events::{
    unix_time, EventContext, SubscriptionEvent, SubscriptionInvoiceObject, SubscriptionObject,
    META_PLAN,
};
use crate::models::{Organisation, SubscriptionState, SubscriptionStatus};
use crate::plans::PlanCatalog;
use crate::store::LedgerStore;
use crate::webhooks::EventHandler;

/// Provider subscription status to ours. None keeps the current status
/// (`incomplete`: the first payment has not been attempted yet).
pub fn map_provider_status(status: &str) -> Option<SubscriptionStatus> {
    match status {
        "trialing" => Some(SubscriptionStatus::Trialing),
        "active" => Some(SubscriptionStatus::Active),
        "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
        "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Cancelled),
        "paused" => Some(SubscriptionStatus::Paused),
        "incomplete" => None,
        other => {
            tracing::warn!(status = %other, "Unknown provider subscription status");
            None
        }
    }
}

fn past_due_since(
    current: &SubscriptionState,
    next_status: SubscriptionStatus,
    occurred_at: OffsetDateTime,
) -> Option<OffsetDateTime> {
    match next_status {
        SubscriptionStatus::PastDue => current
            .past_due_since
            .filter(|_| current.status == SubscriptionStatus::PastDue)
            .or(Some(occurred_at)),
        _ => None,
    }
}

/// Compute the organisation's subscription fields from a provider subscription.
///
/// `forced` overrides the provider status (used for pause events, whose
/// object may still read `active`).
pub fn synced_state(
    current: &SubscriptionState,
    subscription: &SubscriptionObject,
    catalog: &PlanCatalog,
    occurred_at: OffsetDateTime,
    forced: Option<SubscriptionStatus>,
) -> BillingResult<SubscriptionState> {
    let status = forced
        .or_else(|| map_provider_status(&subscription.status))
        .unwrap_or(current.status);

    if status == SubscriptionStatus::Cancelled {
        return Ok(cancelled_state(current, &subscription.id, catalog));
    }

    let plan = subscription
        .price_id()
        .and_then(|price| catalog.plan_for_price(price))
        .or_else(|| {
            subscription
                .metadata
                .get(META_PLAN)
                .and_then(|plan_id| catalog.plan(plan_id))
        })
        .or_else(|| catalog.plan(&current.plan));

    let (plan_id, limits) = match plan {
        Some(plan) => (plan.id.clone(), plan.limits),
        None => (current.plan.clone(), current.limits),
    };

    let cancels_at = match unix_time(subscription.cancel_at)? {
        Some(at) => Some(at),
        None if subscription.cancel_at_period_end => unix_time(subscription.period_end())?,
        None => None,
    };

    Ok(SubscriptionState {
        plan: plan_id,
        status,
        trial_ends_at: unix_time(subscription.trial_end)?.or(current.trial_ends_at),
        external_subscription_ref: Some(subscription.id.clone()),
        limits,
        past_due_since: past_due_since(current, status, occurred_at),
        cancels_at,
    })
}

/// Terminal cancellation: plan kept for reporting, limits clamped
pub fn cancelled_state(
    current: &SubscriptionState,
    subscription_ref: &str,
    catalog: &PlanCatalog,
) -> SubscriptionState {
    SubscriptionState {
        plan: current.plan.clone(),
        status: SubscriptionStatus::Cancelled,
        trial_ends_at: current.trial_ends_at,
        external_subscription_ref: Some(subscription_ref.to_string()),
        limits: catalog.cancelled_limits(),
        past_due_since: None,
        cancels_at: None,
    }
}

pub struct SubscriptionLifecycle {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PlanCatalog>,
}

impl SubscriptionLifecycle {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: Arc<PlanCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Organisation named in metadata, else the one holding the subscription
    async fn resolve_organisation(
        &self,
        subscription: &SubscriptionObject,
    ) -> BillingResult<Option<Organisation>> {
        if let Some(org_id) = subscription.org_id()? {
            if let Some(organisation) = self.store.organisation(org_id).await? {
                return Ok(Some(organisation));
            }
        }
        self.store
            .organisation_by_subscription_ref(&subscription.id)
            .await
    }

    async fn save(
        &self,
        ctx: &EventContext,
        organisation: &Organisation,
        next: SubscriptionState,
    ) -> BillingResult<()> {
        let previous = organisation.subscription_state();
        if previous == next {
            tracing::debug!(
                event_id = %ctx.event_id,
                org_id = %organisation.id,
                "Subscription state unchanged"
            );
            return Ok(());
        }

        self.store
            .save_subscription_state(organisation.id, &next)
            .await?;

        tracing::info!(
            event_id = %ctx.event_id,
            org_id = %organisation.id,
            from = %previous.status,
            to = %next.status,
            plan = %next.plan,
            max_students = next.limits.max_students,
            max_teachers = next.limits.max_teachers,
            "Subscription state updated"
        );
        Ok(())
    }

    async fn sync(
        &self,
        ctx: &EventContext,
        subscription: SubscriptionObject,
        forced: Option<SubscriptionStatus>,
        may_replace: bool,
    ) -> BillingResult<()> {
        let Some(organisation) = self.resolve_organisation(&subscription).await? else {
            tracing::warn!(
                event_id = %ctx.event_id,
                subscription_ref = %subscription.id,
                "No organisation for subscription, ignoring"
            );
            return Ok(());
        };

        // Cancellation is terminal for a subscription; stale updates must not revive it
        if organisation.subscription_status == SubscriptionStatus::Cancelled
            && organisation.external_subscription_ref.as_deref() == Some(subscription.id.as_str())
        {
            tracing::info!(
                event_id = %ctx.event_id,
                org_id = %organisation.id,
                subscription_ref = %subscription.id,
                "Ignoring event for cancelled subscription"
            );
            return Ok(());
        }

        if let Some(current_ref) = organisation.external_subscription_ref.as_deref() {
            if current_ref != subscription.id
                && organisation.subscription_status != SubscriptionStatus::Cancelled
                && !may_replace
            {
                tracing::info!(
                    event_id = %ctx.event_id,
                    org_id = %organisation.id,
                    subscription_ref = %subscription.id,
                    current_ref = %current_ref,
                    "Ignoring event for replaced subscription"
                );
                return Ok(());
            }
        }

        let next = synced_state(
            &organisation.subscription_state(),
            &subscription,
            &self.catalog,
            ctx.occurred_at,
            forced,
        )?;
        self.save(ctx, &organisation, next).await
    }

    async fn cancel(&self, ctx: &EventContext, subscription: SubscriptionObject) -> BillingResult<()> {
        let Some(organisation) = self.resolve_organisation(&subscription).await? else {
            tracing::warn!(
                event_id = %ctx.event_id,
                subscription_ref = %subscription.id,
                "No organisation for deleted subscription, ignoring"
            );
            return Ok(());
        };

        if let Some(current_ref) = organisation.external_subscription_ref.as_deref() {
            if current_ref != subscription.id {
                tracing::info!(
                    event_id = %ctx.event_id,
                    org_id = %organisation.id,
                    deleted_ref = %subscription.id,
                    current_ref = %current_ref,
                    "Deleted subscription was replaced, keeping current one"
                );
                return Ok(());
            }
        }

        let next = cancelled_state(
            &organisation.subscription_state(),
            &subscription.id,
            &self.catalog,
        );
        self.save(ctx, &organisation, next).await
    }

    async fn invoice_organisation(
        &self,
        ctx: &EventContext,
        invoice: &SubscriptionInvoiceObject,
    ) -> BillingResult<Option<Organisation>> {
        let Some(subscription) = invoice.subscription.as_ref() else {
            tracing::debug!(
                event_id = %ctx.event_id,
                invoice = %invoice.id,
                "Provider invoice is not for a subscription, ignoring"
            );
            return Ok(None);
        };

        let organisation = self
            .store
            .organisation_by_subscription_ref(subscription.id())
            .await?;
        if organisation.is_none() {
            tracing::warn!(
                event_id = %ctx.event_id,
                subscription_ref = %subscription.id(),
                "No organisation for subscription invoice, ignoring"
            );
        }
        Ok(organisation)
    }

    async fn payment_failed(
        &self,
        ctx: &EventContext,
        invoice: SubscriptionInvoiceObject,
    ) -> BillingResult<()> {
        let Some(organisation) = self.invoice_organisation(ctx, &invoice).await? else {
            return Ok(());
        };

        let current = organisation.subscription_state();
        if !matches!(
            current.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ) {
            return Ok(());
        }

        let since = past_due_since(&current, SubscriptionStatus::PastDue, ctx.occurred_at);
        let next = SubscriptionState {
            status: SubscriptionStatus::PastDue,
            past_due_since: since,
            ..current
        };
        self.save(ctx, &organisation, next).await
    }

    async fn payment_recovered(
        &self,
        ctx: &EventContext,
        invoice: SubscriptionInvoiceObject,
    ) -> BillingResult<()> {
        let Some(organisation) = self.invoice_organisation(ctx, &invoice).await? else {
            return Ok(());
        };

        let current = organisation.subscription_state();
        if current.status != SubscriptionStatus::PastDue {
            return Ok(());
        }

        let next = SubscriptionState {
            status: SubscriptionStatus::Active,
            past_due_since: None,
            ..current
        };
        self.save(ctx, &organisation, next).await
    }
}

#[async_trait]
impl EventHandler<SubscriptionEvent> for SubscriptionLifecycle {
    async fn handle(&self, ctx: &EventContext, event: SubscriptionEvent) -> BillingResult<()> {
        match event {
            SubscriptionEvent::Created(subscription) => {
                self.sync(ctx, subscription, None, true).await
            }
            SubscriptionEvent::Synced(subscription) => {
                self.sync(ctx, subscription, None, false).await
            }
            SubscriptionEvent::Paused(subscription) => {
                self.sync(ctx, subscription, Some(SubscriptionStatus::Paused), false)
                    .await
            }
            SubscriptionEvent::Deleted(subscription) => self.cancel(ctx, subscription).await,
            SubscriptionEvent::PaymentFailed(invoice) => self.payment_failed(ctx, invoice).await,
            SubscriptionEvent::PaymentSucceeded(invoice) => {
                self.payment_recovered(ctx, invoice).await
            }
        }
    }
}
