//! Connect account onboarding status

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::events::{AccountNotice, EventContext};
use crate::store::LedgerStore;
use crate::webhooks::EventHandler;

pub struct ConnectHandler {
    store: Arc<dyn LedgerStore>,
}

impl ConnectHandler {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler<AccountNotice> for ConnectHandler {
    async fn handle(&self, ctx: &EventContext, notice: AccountNotice) -> BillingResult<()> {
        let mut organisation = self
            .store
            .organisation_by_connect_account(&notice.account_ref)
            .await?;
        if organisation.is_none() {
            if let Some(org_id) = notice.org_id {
                organisation = self.store.organisation(org_id).await?;
            }
        }

        let Some(organisation) = organisation else {
            tracing::warn!(
                event_id = %ctx.event_id,
                account_ref = %notice.account_ref,
                "No organisation for connected account"
            );
            return Ok(());
        };

        if organisation.connect_status == notice.status
            && organisation.connect_account_ref.as_deref() == Some(notice.account_ref.as_str())
        {
            return Ok(());
        }

        self.store
            .update_connect_status(organisation.id, &notice.account_ref, notice.status)
            .await?;

        tracing::info!(
            event_id = %ctx.event_id,
            org_id = %organisation.id,
            account_ref = %notice.account_ref,
            from = %organisation.connect_status,
            to = %notice.status,
            "Connect account status updated"
        );
        Ok(())
    }
}
