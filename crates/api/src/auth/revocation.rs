//! Revoked token tracking
//!
//! Tokens presented at logout (or replaced on refresh) are recorded with their expiry and
//! rejected by the auth middleware until they would have expired anyway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::ApiResult;

/// How often expired entries are purged
pub const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[async_trait]
pub trait RevocationList: Send + Sync {
    /// Record a token as revoked until `expires_at`
    async fn revoke(&self, token: &str, expires_at: OffsetDateTime) -> ApiResult<()>;

    async fn is_revoked(&self, token: &str) -> ApiResult<bool>;

    /// Drop entries whose tokens have expired. Returns how many were removed.
    async fn purge_expired(&self) -> ApiResult<u64>;
}

pub type DynRevocationList = Arc<dyn RevocationList>;

#[derive(Clone)]
pub struct PgRevocationList {
    pool: PgPool,
}

impl PgRevocationList {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RevocationList for PgRevocationList {
    async fn revoke(&self, token: &str, expires_at: OffsetDateTime) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO revoked_tokens (token, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (token) DO NOTHING
            "#,
        )
        .bind(token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_revoked(&self, token: &str) -> ApiResult<bool> {
        let result: Option<(bool,)> =
            sqlx::query_as("SELECT TRUE FROM revoked_tokens WHERE token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    async fn purge_expired(&self) -> ApiResult<u64> {
        let rows_affected = sqlx::query("DELETE FROM revoked_tokens WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected)
    }
}

/// Process-local revocation list
#[derive(Default, Clone)]
pub struct InMemoryRevocationList {
    tokens: Arc<RwLock<HashMap<String, OffsetDateTime>>>,
}

impl InMemoryRevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

#[async_trait]
impl RevocationList for InMemoryRevocationList {
    async fn revoke(&self, token: &str, expires_at: OffsetDateTime) -> ApiResult<()> {
        self.tokens
            .write()
            .await
            .entry(token.to_string())
            .or_insert(expires_at);
        Ok(())
    }

    async fn is_revoked(&self, token: &str) -> ApiResult<bool> {
        Ok(self.tokens.read().await.contains_key(token))
    }

    async fn purge_expired(&self) -> ApiResult<u64> {
        let now = OffsetDateTime::now_utc();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, expires_at| *expires_at > now);
        Ok((before - tokens.len()) as u64)
    }
}

/// Purge expired entries on a fixed interval for the life of the process
pub fn spawn_purge_task(list: DynRevocationList, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match list.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed = removed, "Purged expired revoked tokens"),
                Err(e) => tracing::error!(error = %e, "Failed to purge revoked tokens"),
            }
        }
    })
}
