//! Routes module for the notification dispatch API
//!
//! - Notification creation, lookup, listing, status updates and cancellation
//! - Preference management
//! - Health and metrics endpoints

use crate::handlers::{
    health_handler, metrics_handler, notifications_handler, preferences_handler, AppState,
};

use axum::{
    routing::{get, put},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

/// Build the main router for the API process
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .merge(create_api_router())
        .merge(create_health_router())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new())
                .layer(TimeoutLayer::new(request_timeout))
                .into_inner(),
        )
}

/// Create API routes for REST endpoints
fn create_api_router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/notifications",
            get(notifications_handler::list_notifications)
                .post(notifications_handler::create_notification),
        )
        .route(
            "/api/v1/notifications/:id",
            get(notifications_handler::get_notification)
                .delete(notifications_handler::cancel_notification),
        )
        .route(
            "/api/v1/notifications/:id/status",
            put(notifications_handler::update_notification_status),
        )
        .route(
            "/api/v1/users/:user_id/preferences/:channel",
            put(preferences_handler::update_preference),
        )
}

/// Create health and metrics routes
fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
}
