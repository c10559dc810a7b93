//! Subscription State Store
//!
//! The two write primitives every billing path goes through. Each is a single-row
//! statement, so a reader never sees a mix of old and new subscription fields.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::invariants::{check_record, InvariantCheckSummary, InvariantChecker};
use crate::record::{
    BillingRecord, BillingUser, CustomerData, CustomerProfile, PaymentMethodIntent,
    SubscriptionData, SubscriptionStatus,
};

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_user(&self, user_id: i64) -> BillingResult<Option<BillingUser>>;

    /// Look up the account owning a Stripe customer id
    async fn find_user_by_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<BillingUser>>;

    /// Idempotent upsert of customer id and default payment method.
    /// An existing customer id is never replaced; the id actually stored is returned.
    async fn set_customer_data(
        &self,
        user_id: i64,
        data: &CustomerData,
    ) -> BillingResult<String>;

    /// Replace all four subscription fields together
    async fn set_subscription_data(
        &self,
        user_id: i64,
        data: &SubscriptionData,
    ) -> BillingResult<()>;

    /// Run the billing invariant checks over every stored record
    async fn check_invariants(&self) -> BillingResult<InvariantCheckSummary>;
}

pub type DynBillingStore = Arc<dyn BillingStore>;

#[derive(Debug, sqlx::FromRow)]
struct UserBillingRow {
    id: i64,
    name: String,
    email: String,
    mobile: Option<String>,
    country_code: Option<String>,
    address: Option<String>,
    city: Option<String>,
    country: Option<String>,
    postal_code: Option<String>,
    stripe_customer_id: Option<String>,
    default_payment_method_id: Option<String>,
    current_plan_id: Option<String>,
    subscription_id: Option<String>,
    subscription_status: String,
    subscription_period_end: Option<OffsetDateTime>,
}

impl From<UserBillingRow> for BillingUser {
    fn from(row: UserBillingRow) -> Self {
        BillingUser {
            id: row.id,
            profile: CustomerProfile {
                name: row.name,
                email: row.email,
                mobile: row.mobile,
                country_code: row.country_code,
                address: row.address,
                city: row.city,
                country: row.country,
                postal_code: row.postal_code,
            },
            record: BillingRecord {
                external_customer_id: row.stripe_customer_id,
                default_payment_method_id: row.default_payment_method_id,
                current_plan_id: row.current_plan_id,
                subscription_id: row.subscription_id,
                subscription_status: SubscriptionStatus::from_db(Some(&row.subscription_status)),
                subscription_period_end: row.subscription_period_end,
            },
        }
    }
}

const USER_BILLING_COLUMNS: &str = r#"
    id, name, email, mobile, country_code, address, city, country, postal_code,
    stripe_customer_id, default_payment_method_id, current_plan_id,
    subscription_id, subscription_status, subscription_period_end
"#;

/// Postgres-backed store over the `users` table
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn warn_on_violations(user_id: i64, record: &BillingRecord) {
        for violation in check_record(user_id, record) {
            tracing::warn!(
                user_id = user_id,
                invariant = %violation.invariant,
                severity = %violation.severity,
                "Billing record write left an invariant violation: {}",
                violation.description
            );
        }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_user(&self, user_id: i64) -> BillingResult<Option<BillingUser>> {
        let row: Option<UserBillingRow> = sqlx::query_as(&format!(
            "SELECT {USER_BILLING_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BillingUser::from))
    }

    async fn find_user_by_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<BillingUser>> {
        let row: Option<UserBillingRow> = sqlx::query_as(&format!(
            "SELECT {USER_BILLING_COLUMNS} FROM users WHERE stripe_customer_id = $1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BillingUser::from))
    }

    async fn set_customer_data(
        &self,
        user_id: i64,
        data: &CustomerData,
    ) -> BillingResult<String> {
        let (touch_pm, pm_value) = match &data.payment_method {
            PaymentMethodIntent::Keep => (false, None),
            PaymentMethodIntent::Set(pm) => (true, Some(pm.as_str())),
            PaymentMethodIntent::Clear => (true, None),
        };

        let stored: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            UPDATE users
            SET stripe_customer_id = COALESCE(stripe_customer_id, $2),
                default_payment_method_id = CASE WHEN $3 THEN $4 ELSE default_payment_method_id END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING stripe_customer_id
            "#,
        )
        .bind(user_id)
        .bind(&data.customer_id)
        .bind(touch_pm)
        .bind(pm_value)
        .fetch_optional(&self.pool)
        .await?;

        let Some((stored_customer_id,)) = stored else {
            return Err(BillingError::UserNotFound(user_id));
        };
        // COALESCE with a non-null argument always leaves a value
        let stored_customer_id = stored_customer_id.unwrap_or_else(|| data.customer_id.clone());

        if stored_customer_id != data.customer_id {
            tracing::warn!(
                user_id = user_id,
                requested_customer_id = %data.customer_id,
                stored_customer_id = %stored_customer_id,
                "Kept existing Stripe customer id"
            );
        }

        Ok(stored_customer_id)
    }

    async fn set_subscription_data(
        &self,
        user_id: i64,
        data: &SubscriptionData,
    ) -> BillingResult<()> {
        let row: Option<UserBillingRow> = sqlx::query_as(&format!(
            r#"
            UPDATE users
            SET subscription_id = $2,
                current_plan_id = $3,
                subscription_status = $4,
                subscription_period_end = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {USER_BILLING_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(data.subscription_id.as_deref())
        .bind(data.plan_id.as_deref())
        .bind(data.status.as_str())
        .bind(data.period_end)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(BillingError::UserNotFound(user_id));
        };

        let user = BillingUser::from(row);
        Self::warn_on_violations(user_id, &user.record);

        tracing::debug!(
            user_id = user_id,
            subscription_id = ?data.subscription_id,
            status = %data.status,
            "Subscription data written"
        );
        Ok(())
    }

    async fn check_invariants(&self) -> BillingResult<InvariantCheckSummary> {
        InvariantChecker::new(self.pool.clone()).run_all_checks().await
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    /// In-memory billing store for tests.
    ///
    /// Wraps data in Arc for cheap cloning; clones share state.
    #[derive(Default, Clone)]
    pub struct InMemoryBillingStore {
        inner: Arc<InMemoryBillingStoreInner>,
    }

    #[derive(Default)]
    struct InMemoryBillingStoreInner {
        users: RwLock<HashMap<i64, BillingUser>>,
        customer_writes: AtomicUsize,
        subscription_writes: AtomicUsize,
    }

    impl InMemoryBillingStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a user with the given profile and an empty billing record
        pub async fn insert_user(&self, user_id: i64, name: &str, email: &str) {
            self.insert(BillingUser {
                id: user_id,
                profile: CustomerProfile {
                    name: name.to_string(),
                    email: email.to_string(),
                    ..Default::default()
                },
                record: BillingRecord::default(),
            })
            .await;
        }

        pub async fn insert(&self, user: BillingUser) {
            self.inner.users.write().await.insert(user.id, user);
        }

        pub async fn record(&self, user_id: i64) -> Option<BillingRecord> {
            self.inner
                .users
                .read()
                .await
                .get(&user_id)
                .map(|u| u.record.clone())
        }

        /// Number of `set_customer_data` + `set_subscription_data` calls that hit a user
        pub fn write_count(&self) -> usize {
            self.inner.customer_writes.load(Ordering::SeqCst)
                + self.inner.subscription_writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BillingStore for InMemoryBillingStore {
        async fn get_user(&self, user_id: i64) -> BillingResult<Option<BillingUser>> {
            Ok(self.inner.users.read().await.get(&user_id).cloned())
        }

        async fn find_user_by_customer_id(
            &self,
            customer_id: &str,
        ) -> BillingResult<Option<BillingUser>> {
            Ok(self
                .inner
                .users
                .read()
                .await
                .values()
                .find(|u| u.record.external_customer_id.as_deref() == Some(customer_id))
                .cloned())
        }

        async fn set_customer_data(
            &self,
            user_id: i64,
            data: &CustomerData,
        ) -> BillingResult<String> {
            let mut users = self.inner.users.write().await;
            let user = users
                .get_mut(&user_id)
                .ok_or(BillingError::UserNotFound(user_id))?;
            let stored = user.record.apply_customer(data);
            self.inner.customer_writes.fetch_add(1, Ordering::SeqCst);
            Ok(stored)
        }

        async fn set_subscription_data(
            &self,
            user_id: i64,
            data: &SubscriptionData,
        ) -> BillingResult<()> {
            let mut users = self.inner.users.write().await;
            let user = users
                .get_mut(&user_id)
                .ok_or(BillingError::UserNotFound(user_id))?;
            user.record.apply_subscription(data);
            self.inner.subscription_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn check_invariants(&self) -> BillingResult<InvariantCheckSummary> {
            let users = self.inner.users.read().await;
            Ok(crate::invariants::check_records(
                users.values().map(|u| (u.id, &u.record)),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::InMemoryBillingStore;
    use super::*;
    use crate::record::timestamp_to_datetime;

    #[tokio::test]
    async fn test_in_memory_lookup_by_customer() {
        let store = InMemoryBillingStore::new();
        store.insert_user(1, "Ada", "ada@example.com").await;
        store.insert_user(2, "Bob", "bob@example.com").await;

        store
            .set_customer_data(2, &CustomerData::customer_only("cus_bob"))
            .await
            .unwrap();

        let found = store.find_user_by_customer_id("cus_bob").await.unwrap();
        assert_eq!(found.map(|u| u.id), Some(2));
        assert!(store.find_user_by_customer_id("cus_nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_customer_write_returns_the_kept_id() {
        let store = InMemoryBillingStore::new();
        store.insert_user(1, "Ada", "ada@example.com").await;

        let first = store
            .set_customer_data(1, &CustomerData::customer_only("cus_first"))
            .await
            .unwrap();
        let second = store
            .set_customer_data(1, &CustomerData::customer_only("cus_second"))
            .await
            .unwrap();

        assert_eq!(first, "cus_first");
        assert_eq!(second, "cus_first");
        assert_eq!(
            store.record(1).await.unwrap().external_customer_id.as_deref(),
            Some("cus_first")
        );
    }

    #[tokio::test]
    async fn test_unknown_user_write_fails() {
        let store = InMemoryBillingStore::new();
        let err = store
            .set_subscription_data(99, &SubscriptionData::cleared())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::UserNotFound(99)));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_write_replaces_all_fields() {
        let store = InMemoryBillingStore::new();
        store.insert_user(1, "Ada", "ada@example.com").await;
        store
            .set_customer_data(1, &CustomerData::customer_only("cus_1"))
            .await
            .unwrap();

        let end = timestamp_to_datetime(1_900_000_000);
        store
            .set_subscription_data(
                1,
                &SubscriptionData::new("sub_1", "price_a", SubscriptionStatus::Active, end),
            )
            .await
            .unwrap();
        store
            .set_subscription_data(
                1,
                &SubscriptionData::new("sub_2", "", SubscriptionStatus::Trialing, None),
            )
            .await
            .unwrap();

        let record = store.record(1).await.unwrap();
        assert_eq!(record.subscription_id.as_deref(), Some("sub_2"));
        assert_eq!(record.current_plan_id, None);
        assert_eq!(record.subscription_status, SubscriptionStatus::Trialing);
        assert_eq!(record.subscription_period_end, None);
    }

    #[tokio::test]
    async fn test_concurrent_subscription_writes_are_never_torn() {
        let store = InMemoryBillingStore::new();
        store.insert_user(1, "Ada", "ada@example.com").await;

        let a = SubscriptionData::new(
            "sub_a",
            "price_a",
            SubscriptionStatus::Active,
            timestamp_to_datetime(1_900_000_000),
        );
        let b = SubscriptionData::new("sub_b", "price_b", SubscriptionStatus::PastDue, None);

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let data = if i % 2 == 0 { a.clone() } else { b.clone() };
            handles.push(tokio::spawn(async move {
                store.set_subscription_data(1, &data).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = store.record(1).await.unwrap();
        let written = SubscriptionData {
            subscription_id: record.subscription_id.clone(),
            plan_id: record.current_plan_id.clone(),
            status: record.subscription_status,
            period_end: record.subscription_period_end,
        };
        assert!(written == a || written == b);
    }
}
