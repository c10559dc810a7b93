//! Account registration, profile and credential storage
//!
//! Accounts own the billing projection columns, but this module never writes them; new
//! accounts start with every billing field empty and `subscription_status = 'none'`.
//! Profile fields written here are the ones billing sends when it creates a customer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};

use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountCredentials {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub password_hash: String,
}

impl AccountCredentials {
    pub fn account(&self) -> Account {
        Account {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

fn iso_date<S: Serializer>(date: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error> {
    match date {
        Some(date) => serializer.serialize_some(&date.to_string()),
        None => serializer.serialize_none(),
    }
}

/// The account as its owner sees it; never carries the password hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserProfile {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(serialize_with = "iso_date")]
    pub date_of_birth: Option<Date>,
    pub mobile: Option<String>,
    pub country_code: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
}

/// Profile fields to overwrite; `None` leaves the stored value alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub mobile: Option<String>,
    pub country_code: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
}

impl ProfileUpdate {
    pub fn apply(&self, profile: &mut UserProfile) {
        if let Some(name) = &self.name {
            profile.name = name.clone();
        }
        let optional = [
            (&self.mobile, &mut profile.mobile),
            (&self.country_code, &mut profile.country_code),
            (&self.address, &mut profile.address),
            (&self.city, &mut profile.city),
            (&self.country, &mut profile.country),
            (&self.postal_code, &mut profile.postal_code),
        ];
        for (update, field) in optional {
            if let Some(value) = update {
                *field = Some(value.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub date_of_birth: Option<Date>,
    pub mobile: Option<String>,
    pub country_code: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails with `Conflict` when the email is taken
    async fn create(&self, account: NewAccount) -> ApiResult<Account>;

    async fn find_by_email(&self, email: &str) -> ApiResult<Option<AccountCredentials>>;

    async fn find_by_id(&self, id: i64) -> ApiResult<Option<Account>>;

    async fn record_login(&self, id: i64) -> ApiResult<()>;

    async fn find_profile(&self, id: i64) -> ApiResult<Option<UserProfile>>;

    /// Apply `update` and return the resulting profile, or `None` for an unknown account
    async fn update_profile(
        &self,
        id: i64,
        update: &ProfileUpdate,
    ) -> ApiResult<Option<UserProfile>>;

    async fn set_password(&self, id: i64, password_hash: &str) -> ApiResult<()>;

    async fn create_password_reset(
        &self,
        user_id: i64,
        token_digest: &str,
        expires_at: OffsetDateTime,
    ) -> ApiResult<()>;

    /// Mark an unused, unexpired reset token as used and return its owner.
    /// A token can be consumed at most once.
    async fn consume_password_reset(&self, token_digest: &str) -> ApiResult<Option<i64>>;
}

pub type DynAccountStore = Arc<dyn AccountStore>;

fn email_taken() -> ApiError {
    ApiError::Conflict("email already exists".to_string())
}

fn user_not_found() -> ApiError {
    ApiError::NotFound("User not found".to_string())
}

const PROFILE_COLUMNS: &str = r#"
    id, name, email, date_of_birth, mobile, country_code, address, city, country, postal_code
"#;

#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn create(&self, account: NewAccount) -> ApiResult<Account> {
        let result = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO users (
                name, email, password_hash, date_of_birth,
                mobile, country_code, address, city, country, postal_code
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, name, email
            "#,
        )
        .bind(&account.name)
        .bind(&account.email)
        .bind(&account.password_hash)
        .bind(account.date_of_birth)
        .bind(&account.mobile)
        .bind(&account.country_code)
        .bind(&account.address)
        .bind(&account.city)
        .bind(&account.country)
        .bind(&account.postal_code)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(created) => Ok(created),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(email_taken()),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_email(&self, email: &str) -> ApiResult<Option<AccountCredentials>> {
        let row = sqlx::query_as::<_, AccountCredentials>(
            "SELECT id, name, email, password_hash FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_by_id(&self, id: i64) -> ApiResult<Option<Account>> {
        let row = sqlx::query_as::<_, Account>("SELECT id, name, email FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn record_login(&self, id: i64) -> ApiResult<()> {
        sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_profile(&self, id: i64) -> ApiResult<Option<UserProfile>> {
        let row = sqlx::query_as::<_, UserProfile>(&format!(
            "SELECT {PROFILE_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_profile(
        &self,
        id: i64,
        update: &ProfileUpdate,
    ) -> ApiResult<Option<UserProfile>> {
        let row = sqlx::query_as::<_, UserProfile>(&format!(
            r#"
            UPDATE users
            SET name = COALESCE($2, name),
                mobile = COALESCE($3, mobile),
                country_code = COALESCE($4, country_code),
                address = COALESCE($5, address),
                city = COALESCE($6, city),
                country = COALESCE($7, country),
                postal_code = COALESCE($8, postal_code),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.name.as_deref())
        .bind(update.mobile.as_deref())
        .bind(update.country_code.as_deref())
        .bind(update.address.as_deref())
        .bind(update.city.as_deref())
        .bind(update.country.as_deref())
        .bind(update.postal_code.as_deref())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_password(&self, id: i64, password_hash: &str) -> ApiResult<()> {
        let result =
            sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(password_hash)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(user_not_found());
        }
        Ok(())
    }

    async fn create_password_reset(
        &self,
        user_id: i64,
        token_digest: &str,
        expires_at: OffsetDateTime,
    ) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO password_resets (user_id, token_digest, expires_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user_id)
        .bind(token_digest)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_password_reset(&self, token_digest: &str) -> ApiResult<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE password_resets
            SET used = TRUE
            WHERE token_digest = $1 AND NOT used AND expires_at > NOW()
            RETURNING user_id
            "#,
        )
        .bind(token_digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(user_id,)| user_id))
    }
}
