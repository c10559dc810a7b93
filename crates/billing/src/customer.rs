//! Customer Identity Resolver: maps a local user to a Stripe customer, creating one lazily

use std::collections::HashMap;

use crate::error::{BillingError, BillingResult};
use crate::provider::{CustomerAddress, CustomerParams, DynPaymentProvider};
use crate::record::{BillingUser, CustomerData, CustomerProfile};
use crate::store::DynBillingStore;

/// Metadata key carrying the local user id on provider objects
pub const META_USER_ID: &str = "user_id";

#[derive(Clone)]
pub struct CustomerResolver {
    provider: DynPaymentProvider,
    store: DynBillingStore,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Build customer parameters from a profile.
///
/// Phone needs both country code and number. The address is sent whole or not at all:
/// street, city and country are all required.
pub fn customer_params(user_id: i64, profile: &CustomerProfile) -> CustomerParams {
    let phone = match (present(&profile.country_code), present(&profile.mobile)) {
        (Some(code), Some(mobile)) => Some(format!("{code}{mobile}")),
        _ => None,
    };

    let address = match (
        present(&profile.address),
        present(&profile.city),
        present(&profile.country),
    ) {
        (Some(line1), Some(city), Some(country)) => Some(CustomerAddress {
            line1: line1.to_string(),
            city: city.to_string(),
            country: country.to_string(),
            postal_code: present(&profile.postal_code).map(str::to_string),
        }),
        _ => None,
    };

    let mut metadata = HashMap::new();
    metadata.insert(META_USER_ID.to_string(), user_id.to_string());

    CustomerParams {
        name: profile.name.clone(),
        email: profile.email.clone(),
        phone,
        address,
        metadata,
    }
}

impl CustomerResolver {
    pub fn new(provider: DynPaymentProvider, store: DynBillingStore) -> Self {
        Self { provider, store }
    }

    /// Return the user's Stripe customer id, creating and persisting one if needed.
    ///
    /// Nothing is written when customer creation fails.
    pub async fn resolve(&self, user: &BillingUser) -> BillingResult<String> {
        if let Some(existing) = &user.record.external_customer_id {
            return Ok(existing.clone());
        }

        let params = customer_params(user.id, &user.profile);
        let customer_id = self.provider.create_customer(params).await.map_err(|e| {
            tracing::error!(user_id = user.id, error = %e, "Failed to create Stripe customer");
            BillingError::CustomerCreation(e.to_string())
        })?;

        // A concurrent request may have stored its own customer first; that one wins
        let stored = self
            .store
            .set_customer_data(user.id, &CustomerData::customer_only(&customer_id))
            .await?;

        if stored == customer_id {
            tracing::info!(
                user_id = user.id,
                customer_id = %customer_id,
                "Created Stripe customer"
            );
        } else {
            tracing::warn!(
                user_id = user.id,
                created_customer_id = %customer_id,
                customer_id = %stored,
                "Stripe customer created concurrently; using the stored one"
            );
        }

        Ok(stored)
    }

    /// Load the user and resolve their customer id
    pub async fn resolve_for_user(&self, user_id: i64) -> BillingResult<String> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(BillingError::UserNotFound(user_id))?;
        self.resolve(&user).await
    }
}
