//! Gated consumption hook
//!
//! The write path every gated action goes through: resolve the entitlement,
//! hard-block when the period's limit is spent, otherwise increment the
//! ledger. A resolver failure blocks the action (503); display surfaces may
//! assume free-and-degraded, write actions may not.

use axum::extract::{Extension, State};
use axum::Json;
use serde::Deserialize;

use echodeck_billing::Entitlement;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::routes::entitlement::resolver_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    /// Units to consume; defaults to 1.
    pub units: Option<i64>,
}

pub async fn consume_usage(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<ConsumeRequest>,
) -> Result<Json<Entitlement>, ApiError> {
    let units = request.units.unwrap_or(1);
    if units < 1 {
        return Err(ApiError::BadRequest("units must be at least 1".to_string()));
    }

    let mut entitlement = state
        .billing
        .entitlements
        .resolve(user.id)
        .await
        .map_err(resolver_error)?;

    if !entitlement.allows(units) {
        tracing::info!(
            user_id = %user.id,
            tier = %entitlement.tier,
            period_used = entitlement.period_used,
            daily_limit = entitlement.daily_limit,
            "Usage limit reached"
        );
        return Err(ApiError::LimitExceeded);
    }

    state
        .billing
        .usage
        .record_usage(user.id, units)
        .await
        .map_err(resolver_error)?;

    entitlement.period_used += units;
    Ok(Json(entitlement))
}
