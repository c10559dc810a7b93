//! HTTP routes

pub mod auth;
pub mod billing;
pub mod health;
pub mod users;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/check", get(auth::check))
        .route("/user/{id}", get(users::get_user))
        .route("/user/{id}/update", put(users::update_user))
        .route(
            "/payment/checkout/subscription",
            post(billing::create_subscription_checkout),
        )
        .route("/payment/checkout/one-time", post(billing::create_one_time_checkout))
        .route("/payment/subscription", get(billing::get_subscription))
        .route("/payment/subscription/cancel", post(billing::cancel_subscription))
        .route_layer(from_fn_with_state(state.auth_state(), require_auth));

    Router::new()
        .route("/health", get(health::health))
        .route("/signup", post(auth::signup))
        .route("/signin", post(auth::signin))
        .route("/forgot-password", post(auth::forgot_password))
        .route("/reset-password", post(auth::reset_password))
        // Public: authenticated by signature, not bearer token
        .route("/stripe/webhook", post(billing::stripe_webhook))
        .merge(protected)
        .with_state(state)
}
