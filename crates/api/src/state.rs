//! Application state

use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::PgPool;
use thinkink_billing::BillingService;

use crate::{
    accounts::{DynAccountStore, PgAccountStore},
    auth::{AuthState, DynRevocationList, JwtManager, PgRevocationList},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub revocations: DynRevocationList,
    pub accounts: DynAccountStore,
    /// None when billing is disabled or Stripe is not configured; billing routes answer 503
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);

        let billing = if config.enable_billing {
            match BillingService::from_env(pool.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Stripe billing not configured");
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self {
            jwt_manager,
            revocations: Arc::new(PgRevocationList::new(pool.clone())),
            accounts: Arc::new(PgAccountStore::new(pool)),
            billing,
            config,
        }
    }

    /// Assemble from explicit parts
    pub fn with_parts(
        config: Config,
        revocations: DynRevocationList,
        accounts: DynAccountStore,
        billing: Option<Arc<BillingService>>,
    ) -> Self {
        Self {
            jwt_manager: JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours),
            revocations,
            accounts,
            billing,
            config,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            revocations: self.revocations.clone(),
        }
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth_state()
    }
}
