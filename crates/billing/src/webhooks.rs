//! Stripe webhook handling
//!
//! The synchronizer: ingests signed asynchronous provider events, updates
//! the local subscription mirror idempotently, and drives the
//! suspension/notification side effects from the failure counter.
//!
//! Delivery is at-least-once and unordered. Every handler therefore applies
//! absolute field values from the event payload (never deltas), keyed on the
//! external subscription id in a single statement, so that out-of-order
//! delivery converges to the payload of whichever event was applied last.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{
    CheckoutSession, Event, EventObject, EventType, Invoice, Subscription, SubscriptionStatus,
};
use time::OffsetDateTime;
use uuid::Uuid;

use echodeck_shared::types::SubscriptionTier;

use crate::catalog::PlanCatalog;
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::notify::{days_remaining, NotificationService};

type HmacSha256 = Hmac<Sha256>;

/// Seconds of clock skew tolerated on the signature timestamp.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Map a provider subscription status onto the mirror's three-state model.
pub(crate) fn mirror_status(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => "active",
        SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid => "past_due",
        SubscriptionStatus::Canceled
        | SubscriptionStatus::Incomplete
        | SubscriptionStatus::IncompleteExpired
        | SubscriptionStatus::Paused => "cancelled",
    }
}

/// Absolute mirror fields derived from one provider subscription payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubscriptionPatch {
    pub tier: SubscriptionTier,
    pub external_subscription_id: String,
    pub external_price_id: Option<String>,
    pub status: &'static str,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionPatch {
    pub(crate) fn from_provider(subscription: &Subscription, catalog: &PlanCatalog) -> Self {
        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        let tier = catalog.resolve(price_id.as_deref(), None).tier;

        Self {
            tier,
            external_subscription_id: subscription.id.to_string(),
            external_price_id: price_id,
            status: mirror_status(subscription.status),
            current_period_start: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_start,
            )
            .ok(),
            current_period_end: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_end,
            )
            .ok(),
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }
}

/// Verify the provider signature header over the raw payload.
///
/// Header format: `t=<unix>,v1=<hex hmac>`. The HMAC is computed over
/// `"{t}.{payload}"` with the webhook secret (the `whsec_` prefix carries
/// the key). Mismatch or a stale timestamp rejects the request; there is no
/// silent drop.
pub(crate) fn verify_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0].trim() {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;
    if v1_signature.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    notifications: NotificationService,
    catalog_override: Option<PlanCatalog>,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let notifications = NotificationService::new(pool.clone());
        Self {
            stripe,
            pool,
            notifications,
            catalog_override: None,
        }
    }

    /// Pin the catalog to a fixed snapshot instead of loading it per event.
    pub fn with_catalog(mut self, catalog: PlanCatalog) -> Self {
        self.catalog_override = Some(catalog);
        self
    }

    /// Authenticate and parse an inbound event. Must be called before any
    /// state mutation; a bad signature rejects the request outright.
    pub fn verify_event(&self, payload: &str, signature_header: &str) -> BillingResult<Event> {
        verify_signature(
            payload,
            signature_header,
            &self.stripe.config().webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Webhook payload failed to parse after signature check");
            BillingError::InvalidPayload(e.to_string())
        })
    }

    /// Handle a verified event.
    ///
    /// Idempotency is an atomic insert-if-absent on the provider-issued
    /// event id: the claim and the dedup check are the same statement, so
    /// two concurrent deliveries of one id cannot both process it. An event
    /// that previously failed (row present, `processed = false`) is
    /// re-claimed, because the provider redelivers un-acknowledged events
    /// and handlers are safe to re-run.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let payload = serde_json::to_value(&event)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_events (id, external_event_id, event_type, payload, processed, received_at)
            VALUES ($1, $2, $3, $4, FALSE, NOW())
            ON CONFLICT (external_event_id) DO UPDATE SET
                received_at = NOW()
            WHERE billing_events.processed = FALSE
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event_id)
        .bind(&event_type)
        .bind(&payload)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, already processed"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing webhook event"
        );

        let result = self.process_event(&event).await;

        match &result {
            Ok(()) => {
                sqlx::query(
                    "UPDATE billing_events SET processed = TRUE, error_message = NULL WHERE external_event_id = $1",
                )
                .bind(&event_id)
                .execute(&self.pool)
                .await?;
            }
            Err(e) => {
                // Leave processed = FALSE so the provider's redelivery gets
                // another attempt.
                if let Err(update_err) = sqlx::query(
                    "UPDATE billing_events SET error_message = $2 WHERE external_event_id = $1",
                )
                .bind(&event_id)
                .bind(e.to_string())
                .execute(&self.pool)
                .await
                {
                    tracing::error!(
                        event_id = %event_id,
                        error = %update_err,
                        "Failed to record webhook processing error"
                    );
                }
            }
        }

        result
    }

    async fn process_event(&self, event: &Event) -> BillingResult<()> {
        let event_owned = event.clone();

        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event_owned).await?;
            }
            EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_updated(event_owned).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event_owned).await?;
            }
            EventType::InvoicePaymentFailed => {
                self.handle_payment_failed(event_owned).await?;
            }
            EventType::InvoicePaid => {
                self.handle_payment_succeeded(event_owned).await?;
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled event type - no handler configured"
                );
            }
        }

        Ok(())
    }

    /// First successful checkout: create or replace the user's mirror row.
    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let session = extract_checkout_session(event)?;

        let subscription_id = match session.subscription.as_ref() {
            Some(subscription) => subscription.id(),
            None => {
                tracing::info!("Checkout session without subscription, nothing to sync");
                return Ok(());
            }
        };

        let email = session
            .customer_details
            .as_ref()
            .and_then(|details| details.email.clone())
            .or_else(|| session.customer_email.clone())
            .ok_or_else(|| {
                BillingError::InvalidPayload("checkout session carries no customer email".into())
            })?;

        let user: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE LOWER(email) = LOWER($1)")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await?;
        let (user_id,) = user.ok_or_else(|| BillingError::UserNotFound(email.clone()))?;

        // The session payload has no period data; fetch the subscription it
        // created.
        let subscription = self.stripe.retrieve_subscription(&subscription_id).await?;
        let customer_id = subscription.customer.id().to_string();

        let catalog = self.catalog().await?;
        let patch = SubscriptionPatch::from_provider(&subscription, &catalog);

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, tier, external_subscription_id, external_customer_id,
                external_price_id, status, current_period_start, current_period_end,
                cancel_at_period_end, failed_payment_count, last_payment_failure_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, NULL, NOW(), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                tier = EXCLUDED.tier,
                external_subscription_id = EXCLUDED.external_subscription_id,
                external_customer_id = EXCLUDED.external_customer_id,
                external_price_id = EXCLUDED.external_price_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                failed_payment_count = 0,
                last_payment_failure_at = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(patch.tier)
        .bind(&patch.external_subscription_id)
        .bind(&customer_id)
        .bind(&patch.external_price_id)
        .bind(patch.status)
        .bind(patch.current_period_start)
        .bind(patch.current_period_end)
        .bind(patch.cancel_at_period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %patch.external_subscription_id,
            tier = %patch.tier,
            "Checkout completed, subscription mirror created"
        );

        Ok(())
    }

    /// Apply absolute fields from an updated subscription. The prior value
    /// of `cancel_at_period_end` is read in the same statement (self-join on
    /// the pre-update snapshot) so the false-to-true flip that triggers the
    /// cancellation notice is detected without a second round trip.
    async fn handle_subscription_updated(&self, event: Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;
        let catalog = self.catalog().await?;
        let patch = SubscriptionPatch::from_provider(&subscription, &catalog);

        let updated: Option<(Uuid, bool)> = sqlx::query_as(
            r#"
            UPDATE subscriptions s
            SET tier = $2,
                external_price_id = $3,
                status = $4,
                current_period_start = $5,
                current_period_end = $6,
                cancel_at_period_end = $7,
                updated_at = NOW()
            FROM subscriptions prev
            WHERE s.id = prev.id AND s.external_subscription_id = $1
            RETURNING s.user_id, prev.cancel_at_period_end
            "#,
        )
        .bind(&patch.external_subscription_id)
        .bind(patch.tier)
        .bind(&patch.external_price_id)
        .bind(patch.status)
        .bind(patch.current_period_start)
        .bind(patch.current_period_end)
        .bind(patch.cancel_at_period_end)
        .fetch_optional(&self.pool)
        .await?;

        let Some((user_id, was_cancelling)) = updated else {
            tracing::warn!(
                subscription_id = %patch.external_subscription_id,
                "Subscription update for unknown mirror row, skipping"
            );
            return Ok(());
        };

        if !was_cancelling && patch.cancel_at_period_end {
            let days = patch
                .current_period_end
                .map(|end| days_remaining(end, OffsetDateTime::now_utc()))
                .unwrap_or(0);
            if let Err(e) = self
                .notifications
                .notify_subscription_cancelled(user_id, days)
                .await
            {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to record cancellation notification");
            }
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %patch.external_subscription_id,
            status = %patch.status,
            cancel_at_period_end = patch.cancel_at_period_end,
            "Subscription mirror updated"
        );

        Ok(())
    }

    /// The subscription is gone at the provider: downgrade the mirror to the
    /// free plan's fields.
    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;
        let subscription_id = subscription.id.to_string();

        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET tier = 'free',
                status = 'cancelled',
                external_price_id = NULL,
                cancel_at_period_end = FALSE,
                failed_payment_count = 0,
                last_payment_failure_at = NULL,
                updated_at = NOW()
            WHERE external_subscription_id = $1
            RETURNING user_id
            "#,
        )
        .bind(&subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some((user_id,)) => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    "Subscription deleted, mirror downgraded to free"
                );
            }
            None => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    "Subscription deletion for unknown mirror row, skipping"
                );
            }
        }

        Ok(())
    }

    /// Payment failure: suspend to past_due, bump the failure counter, and
    /// emit the escalating notice. Counter and status move in one statement.
    async fn handle_payment_failed(&self, event: Event) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;

        let subscription_id = match invoice.subscription.as_ref() {
            Some(subscription) => subscription.id().to_string(),
            None => {
                tracing::info!("Payment failure for non-subscription invoice, ignoring");
                return Ok(());
            }
        };

        let updated: Option<(Uuid, i32)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'past_due',
                failed_payment_count = failed_payment_count + 1,
                last_payment_failure_at = NOW(),
                updated_at = NOW()
            WHERE external_subscription_id = $1
            RETURNING user_id, failed_payment_count
            "#,
        )
        .bind(&subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((user_id, failure_count)) = updated else {
            tracing::warn!(
                subscription_id = %subscription_id,
                "Payment failure for unknown mirror row, skipping"
            );
            return Ok(());
        };

        tracing::warn!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            failure_count = failure_count,
            "Payment failed, subscription past due"
        );

        if let Err(e) = self
            .notifications
            .notify_payment_failed(user_id, failure_count)
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to record payment-failure notification");
        }

        Ok(())
    }

    /// Successful payment: restore to active and reset the failure counter.
    async fn handle_payment_succeeded(&self, event: Event) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;

        let subscription_id = match invoice.subscription.as_ref() {
            Some(subscription) => subscription.id().to_string(),
            None => {
                tracing::info!("Payment for non-subscription invoice, ignoring");
                return Ok(());
            }
        };

        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = 'active',
                failed_payment_count = 0,
                last_payment_failure_at = NULL,
                updated_at = NOW()
            WHERE external_subscription_id = $1
            RETURNING user_id
            "#,
        )
        .bind(&subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some((user_id,)) => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    "Payment succeeded, subscription active"
                );
            }
            None => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    "Payment for unknown mirror row, nothing to reset"
                );
            }
        }

        Ok(())
    }

    async fn catalog(&self) -> BillingResult<PlanCatalog> {
        match &self.catalog_override {
            Some(catalog) => Ok(catalog.clone()),
            None => PlanCatalog::load(&self.pool).await,
        }
    }
}

fn extract_subscription(event: Event) -> BillingResult<Subscription> {
    match event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::InvalidPayload(
            "expected subscription object".into(),
        )),
    }
}

fn extract_invoice(event: Event) -> BillingResult<Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::InvalidPayload("expected invoice object".into())),
    }
}

fn extract_checkout_session(event: Event) -> BillingResult<CheckoutSession> {
    match event.data.object {
        EventObject::CheckoutSession(session) => Ok(session),
        _ => Err(BillingError::InvalidPayload(
            "expected checkout session object".into(),
        )),
    }
}
