//! Route registration

pub mod admin;
pub mod billing;
pub mod entitlement;
pub mod usage;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/api/entitlement", get(entitlement::get_entitlement))
        .route("/api/usage/consume", post(usage::consume_usage))
        .route("/api/admin/grants", post(admin::create_grant))
        .route(
            "/api/admin/grants/{user_id}",
            get(admin::get_grant).delete(admin::revoke_grant),
        )
        .route("/api/admin/invariants", get(admin::run_invariant_checks))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        // Webhook ingress authenticates via signature, not bearer token.
        .route("/api/billing/webhook", post(billing::webhook))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| {
            origin
                .parse()
                .map_err(|_| tracing::warn!(origin = %origin, "Invalid CORS origin, skipping"))
                .ok()
        })
        .collect();

    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}
