//! Administrative manual-grant management
//!
//! Grants are the out-of-band override path (comps, trials, support
//! remediation) and are only ever touched by administrators; webhook sync
//! never writes this table.

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use echodeck_billing::{InvariantCheckSummary, ManualGrant};
use echodeck_shared::types::SubscriptionTier;

use crate::auth::{has_role, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateGrantRequest {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub custom_daily_limit: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

pub async fn create_grant(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Json(request): Json<CreateGrantRequest>,
) -> Result<Json<ManualGrant>, ApiError> {
    ensure_admin(&state, &caller).await?;

    let grant = state
        .billing
        .grants
        .create_grant(
            request.user_id,
            request.tier,
            request.custom_daily_limit,
            request.expires_at,
            caller.id,
        )
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(grant))
}

pub async fn get_grant(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ManualGrant>, ApiError> {
    ensure_admin(&state, &caller).await?;

    let grant = state
        .billing
        .grants
        .get_grant(user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("no grant for user {}", user_id)))?;

    Ok(Json(grant))
}

pub async fn revoke_grant(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    ensure_admin(&state, &caller).await?;

    let revoked = state
        .billing
        .grants
        .revoke_grant(user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if !revoked {
        return Err(ApiError::NotFound(format!("no grant for user {}", user_id)));
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Run the billing consistency checks, typically after a webhook replay or
/// a support incident.
pub async fn run_invariant_checks(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthUser>,
) -> Result<Json<InvariantCheckSummary>, ApiError> {
    ensure_admin(&state, &caller).await?;

    let summary = state
        .billing
        .invariants
        .run_all_checks()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            "Billing invariant violations found"
        );
    }

    Ok(Json(summary))
}

async fn ensure_admin(state: &AppState, caller: &AuthUser) -> Result<(), ApiError> {
    let is_admin = has_role(&state.pool, caller.id, "admin")
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    if !is_admin {
        tracing::warn!(user_id = %caller.id, "Non-admin attempted grant management");
        return Err(ApiError::Forbidden);
    }
    Ok(())
}
