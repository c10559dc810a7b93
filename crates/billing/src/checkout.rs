//! Checkout Session Factory
//!
//! Builds hosted checkout sessions for subscriptions and one-time purchases. Every session
//! carries the local user id in its metadata so the webhook reconciler can find the account
//! again; subscription sessions also carry the requested plan.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::customer::{CustomerResolver, META_USER_ID};
use crate::error::{BillingError, BillingResult};
use crate::provider::{CheckoutLineItem, CheckoutMode, CheckoutRequest, DynPaymentProvider};
use crate::store::DynBillingStore;

/// Metadata key carrying the requested plan on subscription checkouts
pub const META_PLAN_ID: &str = "plan_id";

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionCheckoutRequest {
    pub plan_id: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OneTimeCheckoutRequest {
    /// Amount in minor currency units (cents)
    pub amount: i64,
    pub currency: String,
    pub product_name: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub url: String,
}

fn require(field: &str, value: &str) -> BillingResult<()> {
    if value.trim().is_empty() {
        return Err(BillingError::InvalidInput(format!("{field} is required")));
    }
    Ok(())
}

fn require_url(field: &str, value: &str) -> BillingResult<()> {
    require(field, value)?;
    if !(value.starts_with("https://") || value.starts_with("http://")) {
        return Err(BillingError::InvalidInput(format!(
            "{field} must be an absolute http(s) URL"
        )));
    }
    Ok(())
}

impl SubscriptionCheckoutRequest {
    pub fn validate(&self) -> BillingResult<()> {
        require("plan_id", &self.plan_id)?;
        require_url("success_url", &self.success_url)?;
        require_url("cancel_url", &self.cancel_url)
    }
}

impl OneTimeCheckoutRequest {
    pub fn validate(&self) -> BillingResult<()> {
        if self.amount <= 0 {
            return Err(BillingError::InvalidInput(
                "amount must be a positive number of minor units".to_string(),
            ));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::InvalidInput(
                "currency must be a three-letter ISO code".to_string(),
            ));
        }
        require("product_name", &self.product_name)?;
        require_url("success_url", &self.success_url)?;
        require_url("cancel_url", &self.cancel_url)
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    provider: DynPaymentProvider,
    customers: CustomerResolver,
}

impl CheckoutService {
    pub fn new(provider: DynPaymentProvider, store: DynBillingStore) -> Self {
        let customers = CustomerResolver::new(provider.clone(), store);
        Self {
            provider,
            customers,
        }
    }

    /// Create a subscription checkout for a recurring price
    pub async fn create_subscription_checkout(
        &self,
        user_id: i64,
        request: SubscriptionCheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        request.validate()?;
        let customer_id = self.customers.resolve_for_user(user_id).await?;

        let mut metadata = HashMap::new();
        metadata.insert(META_USER_ID.to_string(), user_id.to_string());
        metadata.insert(META_PLAN_ID.to_string(), request.plan_id.clone());

        let session = self
            .provider
            .create_checkout_session(CheckoutRequest {
                customer_id,
                mode: CheckoutMode::Subscription,
                line_item: CheckoutLineItem::Price {
                    price_id: request.plan_id.clone(),
                },
                success_url: request.success_url,
                cancel_url: request.cancel_url,
                metadata,
            })
            .await
            .map_err(into_session_error)?;

        tracing::info!(
            user_id = user_id,
            plan_id = %request.plan_id,
            session_id = %session.id,
            "Created subscription checkout session"
        );

        Ok(CheckoutResponse {
            session_id: session.id,
            url: session.url,
        })
    }

    /// Create a one-time payment checkout.
    ///
    /// Nothing is recorded locally for these; the completed-checkout webhook only logs them.
    pub async fn create_one_time_checkout(
        &self,
        user_id: i64,
        request: OneTimeCheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        request.validate()?;
        let customer_id = self.customers.resolve_for_user(user_id).await?;

        let mut metadata = HashMap::new();
        metadata.insert(META_USER_ID.to_string(), user_id.to_string());

        let session = self
            .provider
            .create_checkout_session(CheckoutRequest {
                customer_id,
                mode: CheckoutMode::Payment,
                line_item: CheckoutLineItem::Custom {
                    amount: request.amount,
                    currency: request.currency.to_ascii_lowercase(),
                    product_name: request.product_name.clone(),
                },
                success_url: request.success_url,
                cancel_url: request.cancel_url,
                metadata,
            })
            .await
            .map_err(into_session_error)?;

        tracing::info!(
            user_id = user_id,
            amount = request.amount,
            currency = %request.currency,
            session_id = %session.id,
            "Created one-time checkout session"
        );

        Ok(CheckoutResponse {
            session_id: session.id,
            url: session.url,
        })
    }
}

/// Any failure after the customer is resolved is a session failure
fn into_session_error(err: BillingError) -> BillingError {
    match err {
        BillingError::CheckoutSession(_) | BillingError::InvalidInput(_) => err,
        other => BillingError::CheckoutSession(other.to_string()),
    }
}
