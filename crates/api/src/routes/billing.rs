//! Checkout, subscription and Stripe webhook endpoints

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Extension, Json,
};
use serde_json::{json, Value};
use thinkink_billing::{
    BillingService, CancelResponse, CheckoutResponse, OneTimeCheckoutRequest,
    SubscriptionCheckoutRequest, SubscriptionInfo,
};

use super::auth::json_body;
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

fn billing(state: &AppState) -> ApiResult<&Arc<BillingService>> {
    state
        .billing
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("Billing is not configured".to_string()))
}

pub async fn create_subscription_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<SubscriptionCheckoutRequest>, JsonRejection>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = billing(&state)?;
    let req = json_body(payload)?;
    let response = billing
        .checkout
        .create_subscription_checkout(user.user_id, req)
        .await?;
    Ok(Json(response))
}

pub async fn create_one_time_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    payload: Result<Json<OneTimeCheckoutRequest>, JsonRejection>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = billing(&state)?;
    let req = json_body(payload)?;
    let response = billing
        .checkout
        .create_one_time_checkout(user.user_id, req)
        .await?;
    Ok(Json(response))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionInfo>> {
    let billing = billing(&state)?;
    Ok(Json(billing.subscriptions.get_subscription(user.user_id).await?))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<CancelResponse>> {
    let billing = billing(&state)?;
    Ok(Json(billing.subscriptions.cancel_subscription(user.user_id).await?))
}

/// Raw body and signature header in; `{"received": true}` out for every verified event
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let billing = billing(&state)?;

    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request without Stripe-Signature header");
            ApiError::BadRequest("Missing Stripe-Signature header".to_string())
        })?;

    let outcome = billing.webhooks.process(&body, signature).await?;
    tracing::debug!(outcome = ?outcome, "Webhook processed");

    Ok(Json(json!({ "received": true })))
}
