//! Usage accounting
//!
//! Consumption against a rolling period, computed from the append-only
//! `usage_records` ledger (one row per user per day, monotonically
//! incremented). The period-start computation is a pure function so the
//! boundary behavior is testable with fixed dates.

use echodeck_shared::types::LimitPeriod;
use sqlx::PgPool;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

/// First day of the rolling window for `period`, given today's date.
///
/// Weekly windows start on the most recent Monday; a Sunday is treated as the
/// end of the week (offset `-6`), matching a 0=Sunday weekday index with
/// offset `dow == 0 ? -6 : 1 - dow`. Dates are UTC.
pub fn period_start(period: LimitPeriod, today: Date) -> Date {
    match period {
        LimitPeriod::Daily => today,
        LimitPeriod::Weekly => {
            let dow = i64::from(today.weekday().number_days_from_sunday());
            let offset = if dow == 0 { -6 } else { 1 - dow };
            today.checked_add(Duration::days(offset)).unwrap_or(today)
        }
        LimitPeriod::Monthly => today.replace_day(1).unwrap_or(today),
    }
}

/// Read/write access to the usage ledger.
#[derive(Clone)]
pub struct UsageMeter {
    pool: PgPool,
}

impl UsageMeter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Total units consumed in `[period_start, today]` inclusive.
    ///
    /// No side effects; safe to call repeatedly. O(period length) rows.
    pub async fn usage_for_period(&self, user_id: Uuid, period: LimitPeriod) -> BillingResult<i64> {
        let today = OffsetDateTime::now_utc().date();
        let start = period_start(period, today);

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(units_consumed), 0)::BIGINT
            FROM usage_records
            WHERE user_id = $1 AND usage_date >= $2 AND usage_date <= $3
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(today)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    /// Increment today's counter by `units` and return the new daily total.
    ///
    /// The ledger is increment-only; the upsert keeps concurrent consumers
    /// row-atomic without a read-modify-write.
    pub async fn record_usage(&self, user_id: Uuid, units: i64) -> BillingResult<i64> {
        let today = OffsetDateTime::now_utc().date();

        let (total,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO usage_records (user_id, usage_date, units_consumed, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id, usage_date) DO UPDATE SET
                units_consumed = usage_records.units_consumed + EXCLUDED.units_consumed,
                updated_at = NOW()
            RETURNING units_consumed
            "#,
        )
        .bind(user_id)
        .bind(today)
        .bind(units)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn daily_period_starts_today() {
        let today = date!(2025 - 06 - 18);
        assert_eq!(period_start(LimitPeriod::Daily, today), today);
    }

    #[test]
    fn weekly_period_on_monday_restarts_the_window() {
        // 2025-06-16 is a Monday.
        let monday = date!(2025 - 06 - 16);
        assert_eq!(period_start(LimitPeriod::Weekly, monday), monday);
    }

    #[test]
    fn weekly_period_on_sunday_spans_the_full_prior_week() {
        // 2025-06-22 is a Sunday; the window starts the previous Monday.
        let sunday = date!(2025 - 06 - 22);
        assert_eq!(period_start(LimitPeriod::Weekly, sunday), date!(2025 - 06 - 16));
    }

    #[test]
    fn weekly_period_midweek_reaches_back_to_monday() {
        // Thursday.
        let thursday = date!(2025 - 06 - 19);
        assert_eq!(period_start(LimitPeriod::Weekly, thursday), date!(2025 - 06 - 16));
    }

    #[test]
    fn monthly_period_starts_on_the_first() {
        let today = date!(2025 - 06 - 18);
        assert_eq!(period_start(LimitPeriod::Monthly, today), date!(2025 - 06 - 01));

        let first = date!(2025 - 06 - 01);
        assert_eq!(period_start(LimitPeriod::Monthly, first), first);
    }

    #[test]
    fn weekly_period_crosses_month_boundary() {
        // 2025-07-02 is a Wednesday; the window starts Monday 2025-06-30.
        let wednesday = date!(2025 - 07 - 02);
        assert_eq!(period_start(LimitPeriod::Weekly, wednesday), date!(2025 - 06 - 30));
    }
}
