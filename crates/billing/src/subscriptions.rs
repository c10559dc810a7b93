//! Subscription management: cancel and read
//!
//! Reads go to Stripe first and fall back to the local projection when Stripe is
//! unreachable. Cancels never fall back.

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::provider::DynPaymentProvider;
use crate::record::{BillingUser, SubscriptionData, SubscriptionStatus};
use crate::store::DynBillingStore;

pub const CANCEL_AT_PERIOD_END_MESSAGE: &str =
    "Subscription will be canceled at the end of the current billing period";

/// Current subscription as reported to the account owner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub has_subscription: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Only known from a live read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_at_period_end: Option<bool>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub current_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanceledSubscription {
    pub id: String,
    pub status: String,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelResponse {
    pub message: String,
    pub subscription: CanceledSubscription,
}

#[derive(Clone)]
pub struct SubscriptionService {
    provider: DynPaymentProvider,
    store: DynBillingStore,
}

impl SubscriptionService {
    pub fn new(provider: DynPaymentProvider, store: DynBillingStore) -> Self {
        Self { provider, store }
    }

    async fn load_user(&self, user_id: i64) -> BillingResult<BillingUser> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or(BillingError::UserNotFound(user_id))
    }

    /// Cancel at period end and write the provider's answer back to the record
    pub async fn cancel_subscription(&self, user_id: i64) -> BillingResult<CancelResponse> {
        let user = self.load_user(user_id).await?;
        let Some(subscription_id) = user.record.subscription_id.clone() else {
            return Err(BillingError::NoActiveSubscription);
        };

        let subscription = self
            .provider
            .cancel_subscription_at_period_end(&subscription_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = user_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to cancel subscription"
                );
                e
            })?;

        let plan_id = subscription
            .plan_id
            .clone()
            .or_else(|| user.record.current_plan_id.clone())
            .unwrap_or_default();

        let data = SubscriptionData::new(
            &subscription.id,
            &plan_id,
            SubscriptionStatus::from_provider(&subscription.status),
            subscription.current_period_end,
        );
        self.store.set_subscription_data(user_id, &data).await?;

        tracing::info!(
            user_id = user_id,
            subscription_id = %subscription.id,
            period_end = ?subscription.current_period_end,
            "Subscription set to cancel at period end"
        );

        Ok(CancelResponse {
            message: CANCEL_AT_PERIOD_END_MESSAGE.to_string(),
            subscription: CanceledSubscription {
                id: subscription.id,
                status: subscription.status,
                cancel_at_period_end: subscription.cancel_at_period_end,
                current_period_end: subscription.current_period_end,
            },
        })
    }

    /// Live read with local fallback
    pub async fn get_subscription(&self, user_id: i64) -> BillingResult<SubscriptionInfo> {
        let user = self.load_user(user_id).await?;
        let record = user.record;

        let Some(subscription_id) = record.subscription_id.clone() else {
            return Ok(SubscriptionInfo::default());
        };

        match self.provider.retrieve_subscription(&subscription_id).await {
            Ok(live) => {
                let status = SubscriptionStatus::from_provider(&live.status);
                Ok(SubscriptionInfo {
                    has_subscription: status.is_subscribed(),
                    subscription_id: Some(live.id),
                    plan_id: live.plan_id.or(record.current_plan_id),
                    status: Some(live.status),
                    cancel_at_period_end: Some(live.cancel_at_period_end),
                    current_period_end: live.current_period_end,
                })
            }
            Err(e) => {
                tracing::warn!(
                    user_id = user_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Stripe unavailable, serving local subscription state"
                );
                Ok(SubscriptionInfo {
                    has_subscription: record.subscription_status.is_subscribed(),
                    subscription_id: Some(subscription_id),
                    plan_id: record.current_plan_id,
                    status: Some(record.subscription_status.as_str().to_string()),
                    cancel_at_period_end: None,
                    current_period_end: record.subscription_period_end,
                })
            }
        }
    }
}
