// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! EchoDeck Billing Module
//!
//! Entitlement resolution and billing-state reconciliation against Stripe.
//!
//! ## Features
//!
//! - **Entitlement Resolver**: what plan, limits and feature flags apply to
//!   a user right now, across five authority sources
//! - **Usage Accounting**: consumption against a rolling daily/weekly/monthly
//!   period from the append-only usage ledger
//! - **Webhooks**: idempotent ingestion of Stripe events into the local
//!   subscription mirror, with suspension and notification side effects
//! - **Manual Grants**: administrator overrides that outrank automated sync
//! - **Plan Catalog**: the four-tier plan table with price-id resolution

pub mod catalog;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod grants;
pub mod invariants;
pub mod notify;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{PlanCatalog, PlanDefinition};

// Client
pub use client::{StripeClient, StripeConfig};

// Entitlement
pub use entitlement::{
    Entitlement, EntitlementService, EntitlementSource, RawEntitlementData, SubscriptionRow,
};

// Error
pub use error::{BillingError, BillingResult};

// Grants
pub use grants::{ManualGrant, ManualGrantService};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notify::{NotificationService, PaymentFailureSeverity};

// Usage
pub use usage::{period_start, UsageMeter};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub entitlements: EntitlementService,
    pub grants: ManualGrantService,
    pub invariants: InvariantChecker,
    pub notifications: NotificationService,
    pub usage: UsageMeter,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            entitlements: EntitlementService::new(stripe.clone(), pool.clone()),
            grants: ManualGrantService::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            notifications: NotificationService::new(pool.clone()),
            usage: UsageMeter::new(pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool),
        }
    }
}
