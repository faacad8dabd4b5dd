//! Entitlement read path

use axum::extract::{Extension, State};
use axum::Json;

use echodeck_billing::{BillingError, Entitlement};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// What can the caller do right now?
///
/// Resolved fresh per request; never cached, because the usage count must
/// reflect the latest ledger state.
pub async fn get_entitlement(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Entitlement>, ApiError> {
    let entitlement = state
        .billing
        .entitlements
        .resolve(user.id)
        .await
        .map_err(resolver_error)?;

    Ok(Json(entitlement))
}

/// Map resolver failures for the read path: infrastructure failures are
/// retryable, never absorbed into a lower-privilege tier.
pub(crate) fn resolver_error(e: BillingError) -> ApiError {
    match e {
        BillingError::Database(detail) => {
            tracing::error!(error = %detail, "Entitlement resolution hit the local store");
            ApiError::Unavailable
        }
        other => ApiError::Internal(other.to_string()),
    }
}
