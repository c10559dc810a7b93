//! Billing Invariants Module
//!
//! Runnable consistency checks for the Billing Record. [`check_record`] validates a single
//! record in memory; [`InvariantChecker`] runs the same rules as SQL over every account and
//! is safe to run after a webhook replay.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::record::{BillingRecord, SubscriptionStatus};

pub const SUBSCRIPTION_ID_MATCHES_STATUS: &str = "subscription_id_matches_status";
pub const PERIOD_END_ONLY_WHEN_LIVE: &str = "period_end_only_when_live";
pub const SUBSCRIPTION_HAS_CUSTOMER: &str = "subscription_has_customer";

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Accounts affected
    pub user_ids: Vec<i64>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Access may be granted or withheld incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

/// Check one record against the data-model invariants.
///
/// A cleared subscription (canceled, no id) is valid: only the live statuses require an id,
/// and `none` forbids one.
pub fn check_record(user_id: i64, record: &BillingRecord) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let status = record.subscription_status;

    let id_mismatch = match status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue => {
            record.subscription_id.is_none()
        }
        SubscriptionStatus::None => record.subscription_id.is_some(),
        SubscriptionStatus::Canceled => false,
    };
    if id_mismatch {
        violations.push(InvariantViolation {
            invariant: SUBSCRIPTION_ID_MATCHES_STATUS.to_string(),
            user_ids: vec![user_id],
            description: format!(
                "Status '{}' is inconsistent with subscription id {:?}",
                status, record.subscription_id
            ),
            context: serde_json::json!({
                "status": status.as_str(),
                "subscription_id": record.subscription_id,
            }),
            severity: ViolationSeverity::Critical,
        });
    }

    if record.subscription_period_end.is_some() && !status.carries_period_end() {
        violations.push(InvariantViolation {
            invariant: PERIOD_END_ONLY_WHEN_LIVE.to_string(),
            user_ids: vec![user_id],
            description: format!("Status '{}' carries a period end", status),
            context: serde_json::json!({
                "status": status.as_str(),
                "period_end": record.subscription_period_end,
            }),
            severity: ViolationSeverity::Medium,
        });
    }

    if record.subscription_id.is_some() && record.external_customer_id.is_none() {
        violations.push(InvariantViolation {
            invariant: SUBSCRIPTION_HAS_CUSTOMER.to_string(),
            user_ids: vec![user_id],
            description: "Subscription recorded without a Stripe customer".to_string(),
            context: serde_json::json!({
                "subscription_id": record.subscription_id,
            }),
            severity: ViolationSeverity::High,
        });
    }

    violations
}

/// Run every check over records already in memory
pub fn check_records<'a>(
    records: impl IntoIterator<Item = (i64, &'a BillingRecord)>,
) -> InvariantCheckSummary {
    let violations = records
        .into_iter()
        .flat_map(|(user_id, record)| check_record(user_id, record))
        .collect();
    InvariantCheckSummary::from_violations(InvariantChecker::available_checks().len(), violations)
}

#[derive(Debug, sqlx::FromRow)]
struct StatusMismatchRow {
    id: i64,
    subscription_status: String,
    subscription_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePeriodEndRow {
    id: i64,
    subscription_status: String,
    subscription_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingCustomerRow {
    id: i64,
    subscription_id: Option<String>,
}

/// Service for running billing invariant checks over the users table
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_subscription_id_matches_status().await?);
        violations.extend(self.check_period_end_only_when_live().await?);
        violations.extend(self.check_subscription_has_customer().await?);

        Ok(InvariantCheckSummary::from_violations(
            Self::available_checks().len(),
            violations,
        ))
    }

    async fn check_subscription_id_matches_status(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusMismatchRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_status, subscription_id
            FROM users
            WHERE (subscription_status IN ('active', 'trialing', 'past_due') AND subscription_id IS NULL)
               OR (subscription_status = 'none' AND subscription_id IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: SUBSCRIPTION_ID_MATCHES_STATUS.to_string(),
                user_ids: vec![row.id],
                description: format!(
                    "Status '{}' is inconsistent with subscription id {:?}",
                    row.subscription_status, row.subscription_id
                ),
                context: serde_json::json!({
                    "status": row.subscription_status,
                    "subscription_id": row.subscription_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_period_end_only_when_live(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePeriodEndRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_status, subscription_period_end
            FROM users
            WHERE subscription_period_end IS NOT NULL
              AND subscription_status NOT IN ('active', 'trialing', 'past_due')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: PERIOD_END_ONLY_WHEN_LIVE.to_string(),
                user_ids: vec![row.id],
                description: format!("Status '{}' carries a period end", row.subscription_status),
                context: serde_json::json!({
                    "status": row.subscription_status,
                    "period_end": row.subscription_period_end,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_subscription_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCustomerRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id
            FROM users
            WHERE subscription_id IS NOT NULL
              AND stripe_customer_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: SUBSCRIPTION_HAS_CUSTOMER.to_string(),
                user_ids: vec![row.id],
                description: "Subscription recorded without a Stripe customer".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            SUBSCRIPTION_ID_MATCHES_STATUS => self.check_subscription_id_matches_status().await,
            PERIOD_END_ONLY_WHEN_LIVE => self.check_period_end_only_when_live().await,
            SUBSCRIPTION_HAS_CUSTOMER => self.check_subscription_has_customer().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            SUBSCRIPTION_ID_MATCHES_STATUS,
            PERIOD_END_ONLY_WHEN_LIVE,
            SUBSCRIPTION_HAS_CUSTOMER,
        ]
    }
}
