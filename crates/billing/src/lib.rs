// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries provider error text
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ThinkInk Billing Module
//!
//! Keeps each account's local billing projection consistent with Stripe.
//!
//! ## Features
//!
//! - **Customer Identity**: Lazily create one Stripe customer per account
//! - **Checkout**: Hosted checkout for subscriptions and one-time purchases
//! - **Webhooks**: Verify, decode and reconcile Stripe events into the Billing Record
//! - **Subscriptions**: Cancel at period end; live reads with local fallback
//! - **Invariants**: Runnable consistency checks over the Billing Record

pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod invariants;
pub mod provider;
pub mod record;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{
    CheckoutResponse, CheckoutService, OneTimeCheckoutRequest, SubscriptionCheckoutRequest,
};

// Client
pub use client::{StripeClient, StripeConfig};

// Customer
pub use customer::CustomerResolver;

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    check_record, check_records, InvariantCheckSummary, InvariantChecker, InvariantViolation,
    ViolationSeverity,
};

// Provider
pub use provider::{DynPaymentProvider, PaymentProvider, ProviderSubscription};

// Record
pub use record::{
    BillingRecord, BillingUser, CustomerData, CustomerProfile, PaymentMethodIntent,
    SubscriptionData, SubscriptionStatus,
};

// Store
pub use store::{BillingStore, DynBillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{CancelResponse, SubscriptionInfo, SubscriptionService};

// Webhooks
pub use webhooks::{
    NoOpReason, ProviderEvent, SignatureVerifier, VerifiedPayload, WebhookEvent, WebhookHandler,
    WebhookOutcome,
};

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;

/// How often the background invariant sweep runs
pub const INVARIANT_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub checkout: CheckoutService,
    pub customer: CustomerResolver,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub store: DynBillingStore,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let verifier =
            SignatureVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance_secs);
        let stripe: DynPaymentProvider = Arc::new(StripeClient::new(config));
        let store: DynBillingStore = Arc::new(PgBillingStore::new(pool));
        Self::with_parts(stripe, store, verifier)
    }

    /// Assemble from explicit parts (any provider, any store)
    pub fn with_parts(
        provider: DynPaymentProvider,
        store: DynBillingStore,
        verifier: SignatureVerifier,
    ) -> Self {
        Self {
            checkout: CheckoutService::new(provider.clone(), store.clone()),
            customer: CustomerResolver::new(provider.clone(), store.clone()),
            subscriptions: SubscriptionService::new(provider.clone(), store.clone()),
            webhooks: WebhookHandler::new(provider, store.clone(), verifier),
            store,
        }
    }

    /// Run the invariant checks over the backing store and log the outcome
    pub async fn check_invariants(&self) -> BillingResult<InvariantCheckSummary> {
        let summary = self.store.check_invariants().await?;
        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Billing invariants hold");
        } else {
            for violation in &summary.violations {
                tracing::warn!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    user_ids = ?violation.user_ids,
                    "{}",
                    violation.description
                );
            }
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant violations found"
            );
        }
        Ok(summary)
    }
}

/// Check billing invariants now and then on every `every` tick
pub fn spawn_invariant_checks(billing: Arc<BillingService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = billing.check_invariants().await {
                tracing::error!(error = %e, "Failed to run billing invariant checks");
            }
        }
    })
}
