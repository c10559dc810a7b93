//! Payment provider seam
//!
//! Everything the billing core asks of Stripe goes through [`PaymentProvider`]. Provider
//! objects are translated into the plain structs below before they leave the implementation,
//! so nothing past this boundary holds an SDK type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Postal address sent with a new customer. Built only when every required part is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerAddress {
    pub line1: String,
    pub city: String,
    pub country: String,
    pub postal_code: Option<String>,
}

/// Parameters for creating a provider customer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerParams {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub address: Option<CustomerAddress>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    Subscription,
    Payment,
}

impl CheckoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutMode::Subscription => "subscription",
            CheckoutMode::Payment => "payment",
        }
    }
}

/// The single line item of a checkout session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutLineItem {
    /// A recurring price configured in the provider dashboard
    Price { price_id: String },
    /// An ad-hoc amount, in minor currency units
    Custom {
        amount: i64,
        currency: String,
        product_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub mode: CheckoutMode,
    pub line_item: CheckoutLineItem,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

/// A created, provider-hosted checkout page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Provider subscription state, flattened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    /// Raw provider status string (e.g. "active", "incomplete_expired")
    pub status: String,
    /// Price of the first line item, if it carries one
    pub plan_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a customer and return its id
    async fn create_customer(&self, params: CustomerParams) -> BillingResult<String>;

    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutSession>;

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// Flag the subscription to end at its current period end and return the updated state
    async fn cancel_subscription_at_period_end(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription>;

    /// The customer's invoice-settings default payment method, if one is set
    async fn default_payment_method(&self, customer_id: &str) -> BillingResult<Option<String>>;
}

pub type DynPaymentProvider = Arc<dyn PaymentProvider>;

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use crate::error::BillingError;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::Mutex;

    /// A call the mock received, in order
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ProviderCall {
        CreateCustomer(CustomerParams),
        CreateCheckoutSession(CheckoutRequest),
        RetrieveSubscription(String),
        CancelSubscriptionAtPeriodEnd(String),
        DefaultPaymentMethod(String),
    }

    #[derive(Default)]
    struct Failures {
        create_customer: AtomicBool,
        create_checkout_session: AtomicBool,
        retrieve_subscription: AtomicBool,
        cancel_subscription: AtomicBool,
        default_payment_method: AtomicBool,
    }

    #[derive(Default)]
    struct MockState {
        customer_counter: AtomicU64,
        session_counter: AtomicU64,
        failures: Failures,
        calls: Mutex<Vec<ProviderCall>>,
        subscriptions: Mutex<HashMap<String, ProviderSubscription>>,
        payment_methods: Mutex<HashMap<String, String>>,
    }

    /// Scripted payment provider. Records every call and fails on demand.
    #[derive(Default, Clone)]
    pub struct MockPaymentProvider {
        state: Arc<MockState>,
    }

    fn unavailable(operation: &str) -> BillingError {
        BillingError::StripeApi(format!("{operation}: connection refused"))
    }

    impl MockPaymentProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the provider return this subscription from retrieve and cancel calls
        pub async fn put_subscription(&self, subscription: ProviderSubscription) {
            self.state
                .subscriptions
                .lock()
                .await
                .insert(subscription.id.clone(), subscription);
        }

        pub async fn set_default_payment_method(&self, customer_id: &str, pm: &str) {
            self.state
                .payment_methods
                .lock()
                .await
                .insert(customer_id.to_string(), pm.to_string());
        }

        pub fn fail_create_customer(&self, fail: bool) {
            self.state.failures.create_customer.store(fail, Ordering::SeqCst);
        }

        pub fn fail_create_checkout_session(&self, fail: bool) {
            self.state
                .failures
                .create_checkout_session
                .store(fail, Ordering::SeqCst);
        }

        pub fn fail_retrieve_subscription(&self, fail: bool) {
            self.state
                .failures
                .retrieve_subscription
                .store(fail, Ordering::SeqCst);
        }

        pub fn fail_cancel_subscription(&self, fail: bool) {
            self.state.failures.cancel_subscription.store(fail, Ordering::SeqCst);
        }

        pub fn fail_default_payment_method(&self, fail: bool) {
            self.state
                .failures
                .default_payment_method
                .store(fail, Ordering::SeqCst);
        }

        /// Simulate a full outage
        pub fn fail_all(&self, fail: bool) {
            self.fail_create_customer(fail);
            self.fail_create_checkout_session(fail);
            self.fail_retrieve_subscription(fail);
            self.fail_cancel_subscription(fail);
            self.fail_default_payment_method(fail);
        }

        pub async fn calls(&self) -> Vec<ProviderCall> {
            self.state.calls.lock().await.clone()
        }

        pub async fn call_count(&self) -> usize {
            self.state.calls.lock().await.len()
        }

        async fn record(&self, call: ProviderCall) {
            self.state.calls.lock().await.push(call);
        }
    }

    #[async_trait]
    impl PaymentProvider for MockPaymentProvider {
        async fn create_customer(&self, params: CustomerParams) -> BillingResult<String> {
            self.record(ProviderCall::CreateCustomer(params)).await;
            if self.state.failures.create_customer.load(Ordering::SeqCst) {
                return Err(unavailable("create_customer"));
            }
            let n = self.state.customer_counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("cus_mock_{n}"))
        }

        async fn create_checkout_session(
            &self,
            request: CheckoutRequest,
        ) -> BillingResult<CheckoutSession> {
            self.record(ProviderCall::CreateCheckoutSession(request)).await;
            if self
                .state
                .failures
                .create_checkout_session
                .load(Ordering::SeqCst)
            {
                return Err(BillingError::CheckoutSession(
                    "create_checkout_session: connection refused".to_string(),
                ));
            }
            let n = self.state.session_counter.fetch_add(1, Ordering::SeqCst);
            let id = format!("cs_mock_{n}");
            Ok(CheckoutSession {
                url: format!("https://checkout.stripe.com/c/pay/{id}"),
                id,
            })
        }

        async fn retrieve_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<ProviderSubscription> {
            self.record(ProviderCall::RetrieveSubscription(subscription_id.to_string()))
                .await;
            if self.state.failures.retrieve_subscription.load(Ordering::SeqCst) {
                return Err(unavailable("retrieve_subscription"));
            }
            self.state
                .subscriptions
                .lock()
                .await
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| {
                    BillingError::StripeApi(format!("No such subscription: '{subscription_id}'"))
                })
        }

        async fn cancel_subscription_at_period_end(
            &self,
            subscription_id: &str,
        ) -> BillingResult<ProviderSubscription> {
            self.record(ProviderCall::CancelSubscriptionAtPeriodEnd(
                subscription_id.to_string(),
            ))
            .await;
            if self.state.failures.cancel_subscription.load(Ordering::SeqCst) {
                return Err(unavailable("cancel_subscription_at_period_end"));
            }
            let mut subscriptions = self.state.subscriptions.lock().await;
            let subscription = subscriptions.get_mut(subscription_id).ok_or_else(|| {
                BillingError::StripeApi(format!("No such subscription: '{subscription_id}'"))
            })?;
            subscription.cancel_at_period_end = true;
            Ok(subscription.clone())
        }

        async fn default_payment_method(
            &self,
            customer_id: &str,
        ) -> BillingResult<Option<String>> {
            self.record(ProviderCall::DefaultPaymentMethod(customer_id.to_string()))
                .await;
            if self.state.failures.default_payment_method.load(Ordering::SeqCst) {
                return Err(unavailable("default_payment_method"));
            }
            Ok(self
                .state
                .payment_methods
                .lock()
                .await
                .get(customer_id)
                .cloned())
        }
    }
}
