//! Stripe client wrapper and the live [`PaymentProvider`] implementation

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCustomer, Currency, Customer, CustomerId, Subscription, SubscriptionId,
    UpdateSubscription,
};

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    CheckoutLineItem, CheckoutMode, CheckoutRequest, CheckoutSession, CustomerParams,
    PaymentProvider, ProviderSubscription,
};
use crate::record::timestamp_to_datetime;

/// Default tolerance for webhook timestamps, in seconds
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Stripe configuration
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Maximum age of a signed webhook before it is refused
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    /// Load from `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET` and
    /// `STRIPE_WEBHOOK_TOLERANCE_SECS`
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let webhook_tolerance_secs = match std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.parse::<i64>().map_err(|_| {
                BillingError::Config(format!("STRIPE_WEBHOOK_TOLERANCE_SECS is not a number: {raw}"))
            })?,
            Err(_) => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        let config = Self {
            secret_key,
            webhook_secret,
            webhook_tolerance_secs,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.secret_key.is_empty() {
            return Err(BillingError::Config("Stripe secret key is empty".to_string()));
        }
        if self.webhook_secret.is_empty() {
            return Err(BillingError::Config("Stripe webhook secret is empty".to_string()));
        }
        if self.webhook_tolerance_secs <= 0 {
            return Err(BillingError::Config(
                "Webhook tolerance must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_test_mode(&self) -> bool {
        self.secret_key.starts_with("sk_test_") || self.secret_key.starts_with("rk_test_")
    }
}

// Keys stay out of logs
impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("test_mode", &self.is_test_mode())
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .finish_non_exhaustive()
    }
}

/// Thin wrapper over the SDK client that keeps the config alongside it
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse()
        .map_err(|_| BillingError::InvalidInput(format!("Invalid customer ID: {id}")))
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse()
        .map_err(|_| BillingError::InvalidInput(format!("Invalid subscription ID: {id}")))
}

/// ISO currency code ("usd", "EUR") to the SDK enum
fn parse_currency(code: &str) -> BillingResult<Currency> {
    serde_json::from_value(serde_json::Value::String(code.to_ascii_lowercase()))
        .map_err(|_| BillingError::InvalidInput(format!("Unsupported currency: {code}")))
}

/// Flatten an SDK subscription into [`ProviderSubscription`]
fn map_subscription(sub: Subscription) -> ProviderSubscription {
    let customer_id = match &sub.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    };

    let plan_id = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    ProviderSubscription {
        id: sub.id.to_string(),
        customer_id,
        status: sub.status.as_str().to_string(),
        plan_id,
        current_period_end: timestamp_to_datetime(sub.current_period_end),
        cancel_at_period_end: sub.cancel_at_period_end,
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_customer(&self, params: CustomerParams) -> BillingResult<String> {
        let mut create = CreateCustomer::new();
        create.name = Some(&params.name);
        create.email = Some(&params.email);
        if let Some(ref phone) = params.phone {
            create.phone = Some(phone);
        }
        if let Some(ref address) = params.address {
            create.address = Some(stripe::Address {
                line1: Some(address.line1.clone()),
                city: Some(address.city.clone()),
                country: Some(address.country.clone()),
                postal_code: address.postal_code.clone(),
                ..Default::default()
            });
        }
        if !params.metadata.is_empty() {
            create.metadata = Some(params.metadata.clone());
        }

        let customer = Customer::create(&self.inner, create).await?;
        Ok(customer.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutSession> {
        let customer_id = parse_customer_id(&request.customer_id)?;

        let line_item = match &request.line_item {
            CheckoutLineItem::Price { price_id } => CreateCheckoutSessionLineItems {
                price: Some(price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            },
            CheckoutLineItem::Custom {
                amount,
                currency,
                product_name,
            } => CreateCheckoutSessionLineItems {
                price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                    currency: parse_currency(currency)?,
                    product: None,
                    product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                        description: None,
                        images: None,
                        metadata: None,
                        name: product_name.clone(),
                        tax_code: None,
                    }),
                    recurring: None,
                    tax_behavior: None,
                    unit_amount: Some(*amount),
                    unit_amount_decimal: None,
                }),
                quantity: Some(1),
                ..Default::default()
            },
        };

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.mode = Some(match request.mode {
            CheckoutMode::Subscription => CheckoutSessionMode::Subscription,
            CheckoutMode::Payment => CheckoutSessionMode::Payment,
        });
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.line_items = Some(vec![line_item]);
        params.metadata = Some(
            request
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        );

        let session = stripe::CheckoutSession::create(&self.inner, params)
            .await
            .map_err(|e| BillingError::CheckoutSession(e.to_string()))?;

        let url = session.url.ok_or_else(|| {
            BillingError::CheckoutSession("Checkout session URL missing".to_string())
        })?;

        Ok(CheckoutSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(&self.inner, &sub_id, &[]).await?;
        Ok(map_subscription(subscription))
    }

    async fn cancel_subscription_at_period_end(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);

        let subscription = Subscription::update(&self.inner, &sub_id, params).await?;
        Ok(map_subscription(subscription))
    }

    async fn default_payment_method(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let customer_id = parse_customer_id(customer_id)?;
        let customer = Customer::retrieve(&self.inner, &customer_id, &[]).await?;

        Ok(customer
            .invoice_settings
            .and_then(|settings| settings.default_payment_method)
            .map(|pm| pm.id().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_abcdefghijklmnop".to_string(),
            webhook_secret: "whsec_test".to_string(),
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.webhook_secret = String::new();
        assert!(matches!(bad.validate(), Err(BillingError::Config(_))));

        let mut bad = config();
        bad.webhook_tolerance_secs = 0;
        assert!(matches!(bad.validate(), Err(BillingError::Config(_))));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("sk_test_abcdefghijklmnop"));
        assert!(!rendered.contains("whsec_test"));
        assert!(rendered.contains("test_mode: true"));
    }

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("usd").unwrap(), Currency::USD);
        assert_eq!(parse_currency("EUR").unwrap(), Currency::EUR);
        assert!(matches!(
            parse_currency("not-a-currency"),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_parse_ids() {
        assert!(parse_customer_id("cus_123").is_ok());
        assert!(parse_customer_id("sub_123").is_err());
        assert!(parse_subscription_id("sub_123").is_ok());
    }
}
