//! API route modules.
//!
//! Organizes routes by resource type.

pub mod auth;
pub mod health;
pub mod media;
pub mod streams;

use axum::Router;

use crate::api::middleware::require_api_key;
use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(streams::router())
        .merge(media::router())
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(protected)
        .merge(auth::router())
        .merge(health::router())
        .with_state(state)
}
