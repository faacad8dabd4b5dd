//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use echodeck_billing::BillingService;

use crate::auth::JwtManager;
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    /// Build the state. A missing Stripe credential fails here, at startup,
    /// rather than degrading every user to the free tier at first use.
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let jwt_manager = JwtManager::new(&config.jwt_secret);

        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Stripe billing service initialized");

        Ok(Self {
            pool,
            config,
            jwt_manager,
            billing: Arc::new(billing),
        })
    }
}
