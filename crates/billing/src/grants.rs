//! Manual grants
//!
//! Out-of-band entitlement overrides (comps, trials, support remediation).
//! Grants are a separate entity from the subscription mirror precisely so
//! that human intervention never races against automated webhook sync: the
//! synchronizer never touches this table, and an active grant outranks
//! whatever the mirror says.

use echodeck_shared::types::SubscriptionTier;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// An administrator-issued entitlement override for one user.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ManualGrant {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub custom_daily_limit: Option<i64>,
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub granted_by: Uuid,
    pub created_at: OffsetDateTime,
}

impl ManualGrant {
    /// Whether the grant currently applies: active and not yet expired.
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        self.is_active && self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// Administrative lifecycle for manual grants.
#[derive(Clone)]
pub struct ManualGrantService {
    pool: PgPool,
}

impl ManualGrantService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or replace the grant for a user (one grant per user).
    pub async fn create_grant(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        custom_daily_limit: Option<i64>,
        expires_at: Option<OffsetDateTime>,
        granted_by: Uuid,
    ) -> BillingResult<ManualGrant> {
        let grant: ManualGrant = sqlx::query_as(
            r#"
            INSERT INTO manual_grants
                (user_id, tier, custom_daily_limit, expires_at, is_active, granted_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, $5, NOW(), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                tier = EXCLUDED.tier,
                custom_daily_limit = EXCLUDED.custom_daily_limit,
                expires_at = EXCLUDED.expires_at,
                is_active = TRUE,
                granted_by = EXCLUDED.granted_by,
                updated_at = NOW()
            RETURNING user_id, tier, custom_daily_limit, expires_at, is_active, granted_by, created_at
            "#,
        )
        .bind(user_id)
        .bind(tier)
        .bind(custom_daily_limit)
        .bind(expires_at)
        .bind(granted_by)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            tier = %tier,
            granted_by = %granted_by,
            "Manual grant created"
        );

        Ok(grant)
    }

    /// Deactivate a user's grant. Revocation keeps the row for audit.
    pub async fn revoke_grant(&self, user_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE manual_grants SET is_active = FALSE, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let revoked = result.rows_affected() > 0;
        if revoked {
            tracing::info!(user_id = %user_id, "Manual grant revoked");
        }
        Ok(revoked)
    }

    /// Fetch a user's grant row, active or not.
    pub async fn get_grant(&self, user_id: Uuid) -> BillingResult<Option<ManualGrant>> {
        let grant: Option<ManualGrant> = sqlx::query_as(
            r#"
            SELECT user_id, tier, custom_daily_limit, expires_at, is_active, granted_by, created_at
            FROM manual_grants
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn grant(is_active: bool, expires_at: Option<OffsetDateTime>) -> ManualGrant {
        ManualGrant {
            user_id: Uuid::new_v4(),
            tier: SubscriptionTier::Agency,
            custom_daily_limit: None,
            expires_at,
            is_active,
            granted_by: Uuid::new_v4(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn active_grant_without_expiry_is_live() {
        let now = OffsetDateTime::now_utc();
        assert!(grant(true, None).is_live(now));
    }

    #[test]
    fn expired_grant_is_not_live() {
        let now = OffsetDateTime::now_utc();
        assert!(!grant(true, Some(now - Duration::minutes(1))).is_live(now));
        assert!(grant(true, Some(now + Duration::minutes(1))).is_live(now));
    }

    #[test]
    fn revoked_grant_is_not_live() {
        let now = OffsetDateTime::now_utc();
        assert!(!grant(false, Some(now + Duration::days(30))).is_live(now));
    }
}
