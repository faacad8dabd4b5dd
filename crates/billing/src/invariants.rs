//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the billing system.
//! These invariants can be run after any mutation or webhook replay to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - users may have wrong access right now
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
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
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for failure-counter violations
#[derive(Debug, sqlx::FromRow)]
struct StaleFailureCountRow {
    user_id: Uuid,
    failed_payment_count: i32,
    status: String,
}

/// Row type for cancelled-without-period-end violations
#[derive(Debug, sqlx::FromRow)]
struct CancelledNoPeriodEndRow {
    user_id: Uuid,
    status: String,
}

/// Row type for unknown-tier violations
#[derive(Debug, sqlx::FromRow)]
struct UnknownTierRow {
    user_id: Uuid,
    tier: String,
}

/// Row type for stale-mirror violations
#[derive(Debug, sqlx::FromRow)]
struct StaleMirrorRow {
    user_id: Uuid,
    current_period_end: Option<OffsetDateTime>,
}

/// Row type for stuck webhook events
#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    external_event_id: String,
    event_type: String,
    received_at: OffsetDateTime,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_failure_count_reset_on_active().await?);
        violations.extend(self.check_cancelled_has_period_end().await?);
        violations.extend(self.check_mirror_tier_in_catalog().await?);
        violations.extend(self.check_active_mirror_not_expired().await?);
        violations.extend(self.check_no_stuck_events().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: the failure counter resets only on a successful payment,
    /// and a successful payment flips the mirror back to active. An active
    /// row with a nonzero counter means a success event was applied without
    /// its reset, or the reset was lost.
    async fn check_failure_count_reset_on_active(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleFailureCountRow> = sqlx::query_as(
            r#"
            SELECT user_id, failed_payment_count, status
            FROM subscriptions
            WHERE status = 'active' AND failed_payment_count > 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "failure_count_reset_on_active".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Active subscription still carries failed_payment_count={}",
                    row.failed_payment_count
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "failed_payment_count": row.failed_payment_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 2: a cancelled mirror row needs a period end so we know
    /// when access was (or will be) revoked.
    async fn check_cancelled_has_period_end(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CancelledNoPeriodEndRow> = sqlx::query_as(
            r#"
            SELECT user_id, status
            FROM subscriptions
            WHERE (status = 'cancelled' OR cancel_at_period_end)
              AND current_period_end IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_has_period_end".to_string(),
                user_ids: vec![row.user_id],
                description: "Cancelled subscription has no period_end date".to_string(),
                context: serde_json::json!({ "status": row.status }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: every mirror tier has an active catalog definition.
    /// An unknown tier silently resolves to the starter default, which may
    /// grant the wrong limits.
    async fn check_mirror_tier_in_catalog(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnknownTierRow> = sqlx::query_as(
            r#"
            SELECT s.user_id, s.tier
            FROM subscriptions s
            WHERE s.tier NOT IN (SELECT tier FROM plans WHERE is_active)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "mirror_tier_in_catalog".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Subscription tier '{}' has no active plan", row.tier),
                context: serde_json::json!({ "tier": row.tier }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: an active mirror row whose period ended over a day ago
    /// means renewal webhooks stopped arriving.
    async fn check_active_mirror_not_expired(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleMirrorRow> = sqlx::query_as(
            r#"
            SELECT user_id, current_period_end
            FROM subscriptions
            WHERE status = 'active'
              AND NOT cancel_at_period_end
              AND current_period_end < NOW() - INTERVAL '1 day'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_mirror_not_expired".to_string(),
                user_ids: vec![row.user_id],
                description: "Active subscription's period ended over a day ago".to_string(),
                context: serde_json::json!({
                    "current_period_end": row.current_period_end.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: unprocessed webhook events older than an hour. The
    /// provider should have redelivered by then; a stuck event usually means
    /// a handler keeps failing.
    async fn check_no_stuck_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT external_event_id, event_type, received_at
            FROM billing_events
            WHERE processed = FALSE
              AND received_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_events".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event '{}' ({}) unprocessed since {}",
                    row.external_event_id, row.event_type, row.received_at
                ),
                context: serde_json::json!({
                    "external_event_id": row.external_event_id,
                    "event_type": row.event_type,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "failure_count_reset_on_active" => self.check_failure_count_reset_on_active().await,
            "cancelled_has_period_end" => self.check_cancelled_has_period_end().await,
            "mirror_tier_in_catalog" => self.check_mirror_tier_in_catalog().await,
            "active_mirror_not_expired" => self.check_active_mirror_not_expired().await,
            "no_stuck_events" => self.check_no_stuck_events().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "failure_count_reset_on_active",
            "cancelled_has_period_end",
            "mirror_tier_in_catalog",
            "active_mirror_not_expired",
            "no_stuck_events",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"failure_count_reset_on_active"));
        assert!(checks.contains(&"no_stuck_events"));
    }
}
