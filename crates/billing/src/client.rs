//! Stripe client wrapper
//!
//! Holds the API credentials and the handful of provider calls this
//! subsystem is allowed to make: customer lookup by email, active
//! subscription listing (live fallback on the read path) and subscription
//! retrieval (checkout completion on the write path).

use stripe::{
    Customer, CustomerId, ListCustomers, ListSubscriptions, Subscription, SubscriptionId,
    SubscriptionStatusFilter,
};

use crate::error::{BillingError, BillingResult};

/// Stripe configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl StripeConfig {
    /// Load from `STRIPE_SECRET_KEY` / `STRIPE_WEBHOOK_SECRET`.
    ///
    /// Missing credentials are a configuration error, never a silent
    /// degrade: a deployment without a webhook secret would accept forged
    /// billing events.
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY is not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET is not set".to_string()))?;

        if secret_key.is_empty() {
            return Err(BillingError::Config("STRIPE_SECRET_KEY is empty".to_string()));
        }
        if webhook_secret.is_empty() {
            return Err(BillingError::Config(
                "STRIPE_WEBHOOK_SECRET is empty".to_string(),
            ));
        }

        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// Thin wrapper around the async-stripe client.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Find the Stripe customer for an account email, if any.
    pub async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<Customer>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);

        let customers = Customer::list(&self.client, &params).await?;
        Ok(customers.data.into_iter().next())
    }

    /// List the customer's active subscriptions.
    pub async fn list_active_subscriptions(
        &self,
        customer: CustomerId,
    ) -> BillingResult<Vec<Subscription>> {
        let mut params = ListSubscriptions::new();
        params.customer = Some(customer);
        params.status = Some(SubscriptionStatusFilter::Active);

        let subscriptions = Subscription::list(&self.client, &params).await?;
        Ok(subscriptions.data)
    }

    /// Retrieve a single subscription by id.
    pub async fn retrieve_subscription(
        &self,
        id: &SubscriptionId,
    ) -> BillingResult<Subscription> {
        Ok(Subscription::retrieve(&self.client, id, &[]).await?)
    }
}
