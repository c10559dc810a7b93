//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Request rejected before any provider call
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("User not found: {0}")]
    UserNotFound(i64),

    /// The payer could not be identified with the provider
    #[error("Failed to create Stripe customer: {0}")]
    CustomerCreation(String),

    /// Customer resolved, but the provider refused or failed to open a session
    #[error("Failed to create checkout session: {0}")]
    CheckoutSession(String),

    #[error("No active subscription found")]
    NoActiveSubscription,

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidWebhookPayload(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Billing configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether the caller sent something malformed (as opposed to a server-side failure)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::InvalidInput(_)
                | BillingError::NoActiveSubscription
                | BillingError::WebhookSignatureInvalid
                | BillingError::InvalidWebhookPayload(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(BillingError::InvalidInput("plan_id".into()).is_client_error());
        assert!(BillingError::NoActiveSubscription.is_client_error());
        assert!(BillingError::WebhookSignatureInvalid.is_client_error());
        assert!(BillingError::InvalidWebhookPayload("eof".into()).is_client_error());

        assert!(!BillingError::CustomerCreation("timeout".into()).is_client_error());
        assert!(!BillingError::CheckoutSession("timeout".into()).is_client_error());
        assert!(!BillingError::StripeApi("503".into()).is_client_error());
        assert!(!BillingError::Database("closed".into()).is_client_error());
        assert!(!BillingError::UserNotFound(7).is_client_error());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            BillingError::NoActiveSubscription.to_string(),
            "No active subscription found"
        );
        assert_eq!(BillingError::UserNotFound(42).to_string(), "User not found: 42");
    }
}
