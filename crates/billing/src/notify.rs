//! Notification sink
//!
//! Fire-and-forget in-app notifications driven by the synchronizer's state
//! transitions. Delivery is another system's job; this module only records
//! `(type, titles, messages, action_url)` rows. A failed insert is logged by
//! the caller and never rolls back the billing state transition.

use std::collections::HashMap;

use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Escalation level for payment-failure notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentFailureSeverity {
    /// Fewer than three consecutive failures.
    Warning,
    /// Third failure and beyond.
    FinalWarning,
}

impl PaymentFailureSeverity {
    pub fn for_count(failure_count: i32) -> Self {
        if failure_count >= 3 {
            Self::FinalWarning
        } else {
            Self::Warning
        }
    }
}

/// Whole days until `period_end`, floored at zero.
pub fn days_remaining(period_end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    (period_end - now).whole_days().max(0)
}

/// Writes notification rows for the UI to surface.
#[derive(Clone)]
pub struct NotificationService {
    pool: PgPool,
}

impl NotificationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a notification for a user. Titles and messages are keyed by
    /// locale.
    pub async fn create_notification(
        &self,
        user_id: Uuid,
        notification_type: &str,
        titles: HashMap<String, String>,
        messages: HashMap<String, String>,
        action_url: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, notification_type, titles, messages, action_url, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(notification_type)
        .bind(Json(titles))
        .bind(Json(messages))
        .bind(action_url)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Cancellation notice with the number of paid days the user keeps.
    pub async fn notify_subscription_cancelled(
        &self,
        user_id: Uuid,
        days_remaining: i64,
    ) -> BillingResult<()> {
        let titles = localized(
            "Subscription cancelled",
            "Abo gekündigt",
        );
        let messages = localized(
            &format!(
                "Your subscription has been cancelled. You keep full access for {} more day(s).",
                days_remaining
            ),
            &format!(
                "Dein Abo wurde gekündigt. Du behältst noch {} Tag(e) vollen Zugriff.",
                days_remaining
            ),
        );

        self.create_notification(
            user_id,
            "subscription_cancelled",
            titles,
            messages,
            Some("/settings/billing"),
        )
        .await
    }

    /// Escalating payment-failure notice: warning below three failures,
    /// final warning at three and beyond.
    pub async fn notify_payment_failed(
        &self,
        user_id: Uuid,
        failure_count: i32,
    ) -> BillingResult<()> {
        let (notification_type, titles, messages) =
            match PaymentFailureSeverity::for_count(failure_count) {
                PaymentFailureSeverity::Warning => (
                    "payment_failed",
                    localized("Payment failed", "Zahlung fehlgeschlagen"),
                    localized(
                        "We could not charge your payment method. Please update it to keep your plan.",
                        "Wir konnten deine Zahlungsmethode nicht belasten. Bitte aktualisiere sie, um deinen Plan zu behalten.",
                    ),
                ),
                PaymentFailureSeverity::FinalWarning => (
                    "payment_failed_final",
                    localized("Final notice: payment failed", "Letzte Mahnung: Zahlung fehlgeschlagen"),
                    localized(
                        "Your payment has failed repeatedly. Your plan will be suspended until payment succeeds.",
                        "Deine Zahlung ist mehrfach fehlgeschlagen. Dein Plan wird ausgesetzt, bis die Zahlung erfolgreich ist.",
                    ),
                ),
            };

        self.create_notification(
            user_id,
            notification_type,
            titles,
            messages,
            Some("/settings/billing"),
        )
        .await
    }
}

fn localized(en: &str, de: &str) -> HashMap<String, String> {
    HashMap::from([
        ("en".to_string(), en.to_string()),
        ("de".to_string(), de.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn escalation_threshold_is_three_failures() {
        assert_eq!(
            PaymentFailureSeverity::for_count(1),
            PaymentFailureSeverity::Warning
        );
        assert_eq!(
            PaymentFailureSeverity::for_count(2),
            PaymentFailureSeverity::Warning
        );
        assert_eq!(
            PaymentFailureSeverity::for_count(3),
            PaymentFailureSeverity::FinalWarning
        );
        assert_eq!(
            PaymentFailureSeverity::for_count(7),
            PaymentFailureSeverity::FinalWarning
        );
    }

    #[test]
    fn days_remaining_floors_at_zero() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(days_remaining(now + Duration::days(3), now), 3);
        assert_eq!(days_remaining(now + Duration::hours(12), now), 0);
        assert_eq!(days_remaining(now - Duration::days(2), now), 0);
    }
}
