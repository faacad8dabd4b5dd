//! Plan catalog
//!
//! Read-only view of the `plans` table. The catalog is an injected snapshot
//! rather than process-wide state so the resolver and the synchronizer can be
//! tested against deterministic definitions, and so an empty or unreachable
//! table degrades to the built-in defaults instead of failing requests.

use std::collections::HashMap;

use echodeck_shared::types::{LimitPeriod, SubscriptionTier};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::BillingResult;

/// A single plan definition: limits, feature flags and the per-currency
/// Stripe price ids that map provider state back to a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub tier: SubscriptionTier,
    pub daily_limit: i64,
    pub limit_period: LimitPeriod,
    pub has_watermark: bool,
    pub has_editor: bool,
    pub has_history: bool,
    /// currency code -> Stripe price id
    pub external_price_ids: HashMap<String, String>,
}

impl PlanDefinition {
    /// Free tier: 1 carousel per day, watermarked, no editor or history.
    pub fn free() -> Self {
        Self {
            tier: SubscriptionTier::Free,
            daily_limit: 1,
            limit_period: LimitPeriod::Daily,
            has_watermark: true,
            has_editor: false,
            has_history: false,
            external_price_ids: HashMap::new(),
        }
    }

    /// Starter tier: 10 per day, no watermark, editor unlocked.
    pub fn starter() -> Self {
        Self {
            tier: SubscriptionTier::Starter,
            daily_limit: 10,
            limit_period: LimitPeriod::Daily,
            has_watermark: false,
            has_editor: true,
            has_history: false,
            external_price_ids: HashMap::new(),
        }
    }

    /// Creator tier: 30 per day, full feature set.
    pub fn creator() -> Self {
        Self {
            tier: SubscriptionTier::Creator,
            daily_limit: 30,
            limit_period: LimitPeriod::Daily,
            has_watermark: false,
            has_editor: true,
            has_history: true,
            external_price_ids: HashMap::new(),
        }
    }

    /// Agency tier: 300 per month, full feature set.
    pub fn agency() -> Self {
        Self {
            tier: SubscriptionTier::Agency,
            daily_limit: 300,
            limit_period: LimitPeriod::Monthly,
            has_watermark: false,
            has_editor: true,
            has_history: true,
            external_price_ids: HashMap::new(),
        }
    }

    /// Whether any of this plan's per-currency price ids matches `price_id`.
    pub fn matches_price(&self, price_id: &str) -> bool {
        self.external_price_ids.values().any(|id| id == price_id)
    }
}

/// In-memory snapshot of the plan catalog.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<PlanDefinition>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<PlanDefinition>) -> Self {
        Self { plans }
    }

    /// The built-in catalog, used by tests and as the fallback while the
    /// `plans` table is empty.
    pub fn builtin() -> Self {
        Self::new(vec![
            PlanDefinition::free(),
            PlanDefinition::starter(),
            PlanDefinition::creator(),
            PlanDefinition::agency(),
        ])
    }

    /// Load the active plan definitions from the database.
    pub async fn load(pool: &PgPool) -> BillingResult<Self> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT tier, daily_limit, limit_period, has_watermark, has_editor,
                   has_history, external_price_ids
            FROM plans
            WHERE is_active
            "#,
        )
        .fetch_all(pool)
        .await?;

        if rows.is_empty() {
            tracing::warn!("plans table is empty, falling back to built-in catalog");
            return Ok(Self::builtin());
        }

        Ok(Self::new(rows.into_iter().map(PlanRow::into_definition).collect()))
    }

    /// Resolve a plan definition.
    ///
    /// Lookup order: price-id match against any currency entry, then exact
    /// tier match, then the hard-coded starter default. Never errors; billing
    /// correctness favors under-granting over crashing, so an unresolved
    /// lookup yields a low-privilege default rather than failing the request.
    pub fn resolve(
        &self,
        price_id: Option<&str>,
        tier: Option<SubscriptionTier>,
    ) -> PlanDefinition {
        if let Some(price_id) = price_id {
            if let Some(plan) = self.plans.iter().find(|p| p.matches_price(price_id)) {
                return plan.clone();
            }
        }

        if let Some(tier) = tier {
            if let Some(plan) = self.plans.iter().find(|p| p.tier == tier) {
                return plan.clone();
            }
        }

        tracing::warn!(
            price_id = ?price_id,
            tier = ?tier,
            "plan lookup unresolved, defaulting to starter"
        );
        PlanDefinition::starter()
    }

    /// Resolve by tier alone.
    pub fn plan_for_tier(&self, tier: SubscriptionTier) -> PlanDefinition {
        self.resolve(None, Some(tier))
    }

    /// The free plan definition.
    pub fn free(&self) -> PlanDefinition {
        self.plan_for_tier(SubscriptionTier::Free)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    tier: SubscriptionTier,
    daily_limit: i64,
    limit_period: LimitPeriod,
    has_watermark: bool,
    has_editor: bool,
    has_history: bool,
    external_price_ids: Json<HashMap<String, String>>,
}

impl PlanRow {
    fn into_definition(self) -> PlanDefinition {
        PlanDefinition {
            tier: self.tier,
            daily_limit: self.daily_limit,
            limit_period: self.limit_period,
            has_watermark: self.has_watermark,
            has_editor: self.has_editor,
            has_history: self.has_history,
            external_price_ids: self.external_price_ids.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with_prices() -> PlanCatalog {
        let mut creator = PlanDefinition::creator();
        creator
            .external_price_ids
            .insert("eur".to_string(), "price_creator_eur".to_string());
        creator
            .external_price_ids
            .insert("usd".to_string(), "price_creator_usd".to_string());

        let mut starter = PlanDefinition::starter();
        starter
            .external_price_ids
            .insert("eur".to_string(), "price_starter_eur".to_string());

        PlanCatalog::new(vec![PlanDefinition::free(), starter, creator, PlanDefinition::agency()])
    }

    #[test]
    fn resolves_by_price_id_in_any_currency() {
        let catalog = catalog_with_prices();

        let by_eur = catalog.resolve(Some("price_creator_eur"), None);
        let by_usd = catalog.resolve(Some("price_creator_usd"), None);
        assert_eq!(by_eur.tier, SubscriptionTier::Creator);
        assert_eq!(by_usd.tier, SubscriptionTier::Creator);
    }

    #[test]
    fn price_id_wins_over_tier_hint() {
        let catalog = catalog_with_prices();

        // A stale tier column must not override what the provider charges.
        let plan = catalog.resolve(Some("price_creator_eur"), Some(SubscriptionTier::Free));
        assert_eq!(plan.tier, SubscriptionTier::Creator);
    }

    #[test]
    fn falls_back_to_tier_when_price_unknown() {
        let catalog = catalog_with_prices();

        let plan = catalog.resolve(Some("price_gone"), Some(SubscriptionTier::Agency));
        assert_eq!(plan.tier, SubscriptionTier::Agency);
    }

    #[test]
    fn unresolved_lookup_defaults_to_starter() {
        let catalog = catalog_with_prices();

        let plan = catalog.resolve(Some("price_gone"), None);
        assert_eq!(plan.tier, SubscriptionTier::Starter);

        let plan = catalog.resolve(None, None);
        assert_eq!(plan.tier, SubscriptionTier::Starter);
    }

    #[test]
    fn builtin_catalog_covers_all_tiers() {
        let catalog = PlanCatalog::builtin();
        for tier in [
            SubscriptionTier::Free,
            SubscriptionTier::Starter,
            SubscriptionTier::Creator,
            SubscriptionTier::Agency,
        ] {
            assert_eq!(catalog.plan_for_tier(tier).tier, tier);
        }
        assert_eq!(catalog.free().daily_limit, 1);
    }
}
