//! Entitlement resolution
//!
//! Answers "what plan, limits and feature flags apply to this user right
//! now?" by checking authority sources in strict priority order: admin role,
//! manual grant, subscription mirror (active or cancelled-but-unexpired),
//! live provider query, free default.
//!
//! ## Design Principles
//!
//! 1. **Single source of truth**: `EntitlementService::resolve()` is THE
//!    function that determines access
//! 2. **Deterministic**: the cascade over local state is a pure function of
//!    `RawEntitlementData`, the catalog and the clock
//! 3. **Debuggable**: every entitlement carries the source that produced it
//! 4. **Read-only**: the resolver never writes; the webhook synchronizer is
//!    the mirror's only writer

use std::collections::HashMap;

use echodeck_shared::types::{LimitPeriod, SubscriptionTier, UNLIMITED_DAILY_LIMIT};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::catalog::{PlanCatalog, PlanDefinition};
use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::grants::ManualGrant;
use crate::usage::UsageMeter;

/// Which authority source produced an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    AdminRole,
    ManualGrant,
    SubscriptionMirror,
    LiveProvider,
    Default,
}

impl std::fmt::Display for EntitlementSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdminRole => write!(f, "admin_role"),
            Self::ManualGrant => write!(f, "manual_grant"),
            Self::SubscriptionMirror => write!(f, "subscription_mirror"),
            Self::LiveProvider => write!(f, "live_provider"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// The resolved set of limits and features applicable to a user at the
/// moment of a request. Computed fresh on every call, never cached, because
/// `period_used` must reflect the latest ledger state.
#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    pub tier: SubscriptionTier,
    pub daily_limit: i64,
    pub limit_period: LimitPeriod,
    pub period_used: i64,
    pub has_watermark: bool,
    pub has_editor: bool,
    pub has_history: bool,
    pub is_admin: bool,
    pub cancel_at_period_end: bool,
    pub subscription_end: Option<OffsetDateTime>,
    pub status: String,
    pub failed_payment_count: i32,
    pub source: EntitlementSource,
    pub computed_at: OffsetDateTime,
}

impl Entitlement {
    /// Units still available in the current period.
    pub fn remaining(&self) -> i64 {
        self.daily_limit.saturating_sub(self.period_used)
    }

    /// Whether consuming `units` more would stay within the limit.
    pub fn allows(&self, units: i64) -> bool {
        self.remaining() >= units
    }
}

/// Subscription mirror row as the resolver reads it.
#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub user_id: Uuid,
    pub tier: String,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub external_price_id: Option<String>,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub failed_payment_count: i32,
    pub last_payment_failure_at: Option<OffsetDateTime>,
}

/// Everything the local cascade needs, loaded in one query.
#[derive(Debug, Clone, Default)]
pub struct RawEntitlementData {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub is_admin: bool,
    pub grant: Option<ManualGrant>,
    pub subscription: Option<SubscriptionRow>,
}

/// Intermediate result of the cascade, before usage is attached.
#[derive(Debug, Clone)]
pub(crate) struct Resolution {
    pub plan: PlanDefinition,
    pub daily_limit: i64,
    pub source: EntitlementSource,
    pub is_admin: bool,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub subscription_end: Option<OffsetDateTime>,
    pub failed_payment_count: i32,
}

impl Resolution {
    fn from_plan(plan: PlanDefinition, source: EntitlementSource) -> Self {
        Self {
            daily_limit: plan.daily_limit,
            plan,
            source,
            is_admin: false,
            status: "active".to_string(),
            cancel_at_period_end: false,
            subscription_end: None,
            failed_payment_count: 0,
        }
    }

    pub(crate) fn free(catalog: &PlanCatalog) -> Self {
        Self::from_plan(catalog.free(), EntitlementSource::Default)
    }

    pub(crate) fn into_entitlement(self, period_used: i64, now: OffsetDateTime) -> Entitlement {
        Entitlement {
            tier: self.plan.tier,
            daily_limit: self.daily_limit,
            limit_period: self.plan.limit_period,
            period_used,
            has_watermark: self.plan.has_watermark,
            has_editor: self.plan.has_editor,
            has_history: self.plan.has_history,
            is_admin: self.is_admin,
            cancel_at_period_end: self.cancel_at_period_end,
            subscription_end: self.subscription_end,
            status: self.status,
            failed_payment_count: self.failed_payment_count,
            source: self.source,
            computed_at: now,
        }
    }
}

/// The local cascade: admin role, then manual grant, then subscription
/// mirror. First match wins; `None` means the caller may try the live
/// provider query before defaulting to free.
pub(crate) fn resolve_local(
    raw: &RawEntitlementData,
    catalog: &PlanCatalog,
    now: OffsetDateTime,
) -> Option<Resolution> {
    resolve_admin(raw)
        .or_else(|| resolve_manual_grant(raw, catalog, now))
        .or_else(|| resolve_subscription_mirror(raw, catalog, now))
}

/// Step 1: operational staff are never blocked by billing edge cases.
fn resolve_admin(raw: &RawEntitlementData) -> Option<Resolution> {
    if !raw.is_admin {
        return None;
    }

    let plan = PlanDefinition {
        tier: SubscriptionTier::Agency,
        daily_limit: UNLIMITED_DAILY_LIMIT,
        limit_period: LimitPeriod::Daily,
        has_watermark: false,
        has_editor: true,
        has_history: true,
        external_price_ids: HashMap::new(),
    };

    let mut resolution = Resolution::from_plan(plan, EntitlementSource::AdminRole);
    resolution.is_admin = true;
    Some(resolution)
}

/// Step 2: an active, unexpired grant outranks the mirror, including any
/// contradictory cancelled or past-due billing state. A human decision
/// outranks automated sync state.
fn resolve_manual_grant(
    raw: &RawEntitlementData,
    catalog: &PlanCatalog,
    now: OffsetDateTime,
) -> Option<Resolution> {
    let grant = raw.grant.as_ref()?;
    if !grant.is_live(now) {
        return None;
    }

    let plan = catalog.plan_for_tier(grant.tier);
    let mut resolution = Resolution::from_plan(plan, EntitlementSource::ManualGrant);
    if let Some(limit) = grant.custom_daily_limit {
        resolution.daily_limit = limit;
    }
    Some(resolution)
}

/// Steps 3 and 4: an active subscription, or a cancelled-but-unexpired one
/// (`cancel_at_period_end` set with the period end still in the future).
/// The user keeps paid features until the period truly ends.
fn resolve_subscription_mirror(
    raw: &RawEntitlementData,
    catalog: &PlanCatalog,
    now: OffsetDateTime,
) -> Option<Resolution> {
    let sub = raw.subscription.as_ref()?;
    let period_end = sub.current_period_end?;
    if period_end <= now {
        return None;
    }

    let usable = sub.status == "active" || sub.cancel_at_period_end;
    if !usable {
        return None;
    }

    let plan = catalog.resolve(sub.external_price_id.as_deref(), sub.tier.parse().ok());
    let mut resolution = Resolution::from_plan(plan, EntitlementSource::SubscriptionMirror);
    resolution.status = sub.status.clone();
    resolution.cancel_at_period_end = sub.cancel_at_period_end;
    resolution.subscription_end = Some(period_end);
    resolution.failed_payment_count = sub.failed_payment_count;
    Some(resolution)
}

/// The read path of the billing subsystem.
#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    stripe: StripeClient,
    usage: UsageMeter,
    catalog_override: Option<PlanCatalog>,
}

impl EntitlementService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let usage = UsageMeter::new(pool.clone());
        Self {
            pool,
            stripe,
            usage,
            catalog_override: None,
        }
    }

    /// Pin the catalog to a fixed snapshot instead of loading it per call.
    pub fn with_catalog(mut self, catalog: PlanCatalog) -> Self {
        self.catalog_override = Some(catalog);
        self
    }

    /// Resolve the entitlement for a user.
    ///
    /// Local lookups (steps 1-4) surface infrastructure failures as
    /// retryable errors; silently falling through to a lower-privilege tier
    /// on a database outage would downgrade paying users. Only the live
    /// provider query (step 5) is allowed to absorb failure, because with no
    /// local record an unreachable provider is indistinguishable from
    /// "never subscribed".
    pub async fn resolve(&self, user_id: Uuid) -> BillingResult<Entitlement> {
        let now = OffsetDateTime::now_utc();
        let raw = self.load_raw(user_id).await?;
        let catalog = self.catalog().await?;

        let resolution = match resolve_local(&raw, &catalog, now) {
            Some(resolution) => resolution,
            None => match self.resolve_live(&raw, &catalog).await {
                Ok(Some(resolution)) => resolution,
                Ok(None) => Resolution::free(&catalog),
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "live provider fallback failed, defaulting to free plan"
                    );
                    Resolution::free(&catalog)
                }
            },
        };

        // Two-phase on purpose: usage is summed against the *resolved*
        // plan's accounting window, since tiers may use different windows.
        let period_used = self
            .usage
            .usage_for_period(user_id, resolution.plan.limit_period)
            .await?;

        tracing::debug!(
            user_id = %user_id,
            tier = %resolution.plan.tier,
            source = %resolution.source,
            period_used = period_used,
            "Entitlement resolved"
        );

        Ok(resolution.into_entitlement(period_used, now))
    }

    async fn catalog(&self) -> BillingResult<PlanCatalog> {
        match &self.catalog_override {
            Some(catalog) => Ok(catalog.clone()),
            None => PlanCatalog::load(&self.pool).await,
        }
    }

    /// Load admin flag, grant and mirror row in one query.
    async fn load_raw(&self, user_id: Uuid) -> BillingResult<RawEntitlementData> {
        let raw: Option<RawEntitlementData> = sqlx::query_as(
            r#"
            SELECT
                u.id AS user_id,
                u.email,
                EXISTS(
                    SELECT 1 FROM user_roles r
                    WHERE r.user_id = u.id AND r.role = 'admin'
                ) AS is_admin,
                g.user_id AS grant_user_id,
                g.tier AS grant_tier,
                g.custom_daily_limit AS grant_custom_daily_limit,
                g.expires_at AS grant_expires_at,
                g.is_active AS grant_is_active,
                g.granted_by AS grant_granted_by,
                g.created_at AS grant_created_at,
                s.user_id AS sub_user_id,
                s.tier AS sub_tier,
                s.external_subscription_id,
                s.external_customer_id,
                s.external_price_id,
                s.status AS sub_status,
                s.current_period_start,
                s.current_period_end,
                s.cancel_at_period_end,
                s.failed_payment_count,
                s.last_payment_failure_at
            FROM users u
            LEFT JOIN manual_grants g ON g.user_id = u.id
            LEFT JOIN subscriptions s ON s.user_id = u.id
            WHERE u.id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        // A user the local store has never seen resolves through the live
        // fallback (no email, so straight to free). Absence of data is not
        // an error on the read path.
        Ok(raw.unwrap_or(RawEntitlementData {
            user_id,
            ..RawEntitlementData::default()
        }))
    }

    /// Step 5: query the provider directly. Only reached when no usable
    /// local state exists. Never writes the mirror - write-back is the
    /// synchronizer's exclusive job, and a read-path write would race
    /// against concurrent webhook processing.
    async fn resolve_live(
        &self,
        raw: &RawEntitlementData,
        catalog: &PlanCatalog,
    ) -> BillingResult<Option<Resolution>> {
        let email = match raw.email.as_deref() {
            Some(email) => email,
            None => return Ok(None),
        };

        let strategy = || ExponentialBackoff::from_millis(200).map(jitter).take(2);

        let customer =
            Retry::spawn(strategy(), || self.stripe.find_customer_by_email(email)).await?;
        let customer = match customer {
            Some(customer) => customer,
            None => return Ok(None),
        };

        let subscriptions = Retry::spawn(strategy(), || {
            self.stripe.list_active_subscriptions(customer.id.clone())
        })
        .await?;
        let subscription = match subscriptions.into_iter().next() {
            Some(subscription) => subscription,
            None => return Ok(None),
        };

        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        let plan = catalog.resolve(price_id.as_deref(), None);
        let mut resolution = Resolution::from_plan(plan, EntitlementSource::LiveProvider);
        resolution.cancel_at_period_end = subscription.cancel_at_period_end;
        resolution.subscription_end =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_end).ok();

        tracing::info!(
            user_id = %raw.user_id,
            subscription_id = %subscription.id,
            "Entitlement resolved via live provider query (mirror not yet synced)"
        );

        Ok(Some(resolution))
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RawEntitlementData {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let grant = match row.try_get::<Option<Uuid>, _>("grant_user_id")? {
            Some(grant_user_id) => Some(ManualGrant {
                user_id: grant_user_id,
                tier: row.try_get("grant_tier")?,
                custom_daily_limit: row.try_get("grant_custom_daily_limit")?,
                expires_at: row.try_get("grant_expires_at")?,
                is_active: row.try_get("grant_is_active")?,
                granted_by: row.try_get("grant_granted_by")?,
                created_at: row.try_get("grant_created_at")?,
            }),
            None => None,
        };

        let subscription = match row.try_get::<Option<Uuid>, _>("sub_user_id")? {
            Some(sub_user_id) => Some(SubscriptionRow {
                user_id: sub_user_id,
                tier: row.try_get("sub_tier")?,
                external_subscription_id: row.try_get("external_subscription_id")?,
                external_customer_id: row.try_get("external_customer_id")?,
                external_price_id: row.try_get("external_price_id")?,
                status: row.try_get("sub_status")?,
                current_period_start: row.try_get("current_period_start")?,
                current_period_end: row.try_get("current_period_end")?,
                cancel_at_period_end: row.try_get("cancel_at_period_end")?,
                failed_payment_count: row.try_get("failed_payment_count")?,
                last_payment_failure_at: row.try_get("last_payment_failure_at")?,
            }),
            None => None,
        };

        Ok(Self {
            user_id: row.try_get("user_id")?,
            email: row.try_get("email")?,
            is_admin: row.try_get("is_admin")?,
            grant,
            subscription,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_raw_resolves_to_nothing_locally() {
        let catalog = PlanCatalog::builtin();
        let raw = RawEntitlementData::default();
        assert!(resolve_local(&raw, &catalog, OffsetDateTime::now_utc()).is_none());
    }

    #[test]
    fn admin_gets_unlimited_regardless_of_other_state() {
        let catalog = PlanCatalog::builtin();
        let raw = RawEntitlementData {
            is_admin: true,
            ..RawEntitlementData::default()
        };

        let resolution = resolve_local(&raw, &catalog, OffsetDateTime::now_utc())
            .expect("admin must resolve");
        assert!(resolution.is_admin);
        assert_eq!(resolution.daily_limit, UNLIMITED_DAILY_LIMIT);
        assert_eq!(resolution.source, EntitlementSource::AdminRole);
        assert!(!resolution.plan.has_watermark);
    }

    #[test]
    fn entitlement_remaining_saturates() {
        let catalog = PlanCatalog::builtin();
        let entitlement =
            Resolution::free(&catalog).into_entitlement(5, OffsetDateTime::now_utc());
        // Free plan allows 1/day; 5 already used.
        assert_eq!(entitlement.remaining(), 0);
        assert!(!entitlement.allows(1));
    }
}
