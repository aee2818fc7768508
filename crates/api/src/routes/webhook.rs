//! Payment-provider webhook endpoint

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Verify, deduplicate and reconcile one delivery.
///
/// Duplicates and ignored kinds are acknowledged like processed events. A
/// 500 asks the provider to redeliver.
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
    else {
        tracing::warn!("Webhook rejected: missing signature header");
        return Err(ApiError::BadRequest(format!("Missing {} header", SIGNATURE_HEADER)));
    };

    let outcome = state.webhooks.process(&body, signature).await?;
    tracing::debug!(?outcome, bytes = body.len(), "Webhook acknowledged");

    Ok(Json(json!({ "received": true })))
}
