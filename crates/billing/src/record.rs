//! Billing Record: the local projection of a user's payment identity and subscription
//!
//! Request handlers never mutate these fields directly. All writes go through the two
//! store primitives, [`CustomerData`] and [`SubscriptionData`], which are absolute sets.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Local subscription status. Provider statuses are folded onto this set at the boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    None,
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Parse a value previously written by [`SubscriptionStatus::as_str`].
    /// Unknown or missing column values read back as `None`.
    pub fn from_db(value: Option<&str>) -> Self {
        match value {
            Some("active") => SubscriptionStatus::Active,
            Some("trialing") => SubscriptionStatus::Trialing,
            Some("past_due") => SubscriptionStatus::PastDue,
            Some("canceled") => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::None,
        }
    }

    /// Fold a raw Stripe subscription status onto the local set.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" | "unpaid" | "incomplete" | "paused" => SubscriptionStatus::PastDue,
            "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
            other => {
                tracing::warn!(
                    provider_status = %other,
                    "Unrecognised Stripe subscription status, treating as past_due"
                );
                SubscriptionStatus::PastDue
            }
        }
    }

    /// Statuses that grant access to subscriber features
    pub fn is_subscribed(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }

    /// Statuses for which a period end is meaningful
    pub fn carries_period_end(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing projection stored alongside a user account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BillingRecord {
    pub external_customer_id: Option<String>,
    pub default_payment_method_id: Option<String>,
    pub current_plan_id: Option<String>,
    pub subscription_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub subscription_period_end: Option<OffsetDateTime>,
}

impl BillingRecord {
    pub fn has_subscription_id(&self) -> bool {
        self.subscription_id.is_some()
    }

    /// Apply a full subscription replace. The four fields always move together.
    pub fn apply_subscription(&mut self, data: &SubscriptionData) {
        self.subscription_id = data.subscription_id.clone();
        self.current_plan_id = data.plan_id.clone();
        self.subscription_status = data.status;
        self.subscription_period_end = data.period_end;
    }

    /// Apply a customer-data upsert.
    ///
    /// The customer id is write-once: a differing id never replaces an existing one.
    /// Returns the customer id held after the write.
    pub fn apply_customer(&mut self, data: &CustomerData) -> String {
        let stored = self
            .external_customer_id
            .get_or_insert_with(|| data.customer_id.clone())
            .clone();
        match &data.payment_method {
            PaymentMethodIntent::Keep => {}
            PaymentMethodIntent::Set(pm) => self.default_payment_method_id = Some(pm.clone()),
            PaymentMethodIntent::Clear => self.default_payment_method_id = None,
        }
        stored
    }
}

/// Profile fields used to build the provider customer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerProfile {
    pub name: String,
    pub email: String,
    pub mobile: Option<String>,
    pub country_code: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
}

/// A user account as seen by the billing core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingUser {
    pub id: i64,
    pub profile: CustomerProfile,
    pub record: BillingRecord,
}

/// What the caller wants done with the default payment method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentMethodIntent {
    /// Leave whatever is stored
    Keep,
    Set(String),
    Clear,
}

/// Argument of the `set_customer_data` primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerData {
    pub customer_id: String,
    pub payment_method: PaymentMethodIntent,
}

impl CustomerData {
    pub fn customer_only(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            payment_method: PaymentMethodIntent::Keep,
        }
    }

    /// An empty payment method id means "no opinion", never "clear".
    pub fn with_payment_method(customer_id: impl Into<String>, payment_method_id: &str) -> Self {
        let payment_method = if payment_method_id.is_empty() {
            PaymentMethodIntent::Keep
        } else {
            PaymentMethodIntent::Set(payment_method_id.to_string())
        };
        Self {
            customer_id: customer_id.into(),
            payment_method,
        }
    }
}

/// Argument of the `set_subscription_data` primitive: all four fields, replaced together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionData {
    pub subscription_id: Option<String>,
    pub plan_id: Option<String>,
    pub status: SubscriptionStatus,
    pub period_end: Option<OffsetDateTime>,
}

impl SubscriptionData {
    /// Empty strings become absent values and the period end is dropped for
    /// statuses that do not carry one.
    pub fn new(
        subscription_id: &str,
        plan_id: &str,
        status: SubscriptionStatus,
        period_end: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            subscription_id: non_empty(subscription_id),
            plan_id: non_empty(plan_id),
            status,
            period_end: period_end.filter(|_| status.carries_period_end()),
        }
    }

    /// The explicit full clear written when a subscription is deleted
    pub fn cleared() -> Self {
        Self::new("", "", SubscriptionStatus::Canceled, None)
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Convert a provider unix timestamp, treating 0 and out-of-range values as absent.
pub fn timestamp_to_datetime(ts: i64) -> Option<OffsetDateTime> {
    if ts <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(ts).ok()
}
