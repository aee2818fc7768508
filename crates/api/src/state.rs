//! Application state

use std::sync::Arc;

use lessonloop_billing::WebhookHandler;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<WebhookHandler>,
}

impl AppState {
    pub fn new(webhooks: WebhookHandler) -> Self {
        Self {
            webhooks: Arc::new(webhooks),
        }
    }
}
