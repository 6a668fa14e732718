//! Request handlers for the notification dispatch API
//!
//! - Notification creation, lookup, listing, status updates and cancellation
//! - Preference management
//! - Health and metrics handlers

use crate::dispatch::{CreateNotificationRequest, DispatchService};
use crate::error::{NotificationError, Result};
use crate::metrics::MetricsRecorder;
use crate::store::NotificationStore;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub dispatch: Arc<DispatchService>,
    pub store: Arc<dyn NotificationStore>,
    pub metrics: Arc<dyn MetricsRecorder>,
}

impl AppState {
    pub fn new(
        dispatch: Arc<DispatchService>,
        store: Arc<dyn NotificationStore>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            dispatch,
            store,
            metrics,
        }
    }
}

pub mod notifications_handler {
    use super::*;
    use crate::store::NotificationFilter;
    use axum::extract::{Path, Query};
    use dispatch_shared::{NotificationStatus, StatusUpdate};

    #[derive(Debug, Serialize, Deserialize)]
    pub struct CreateNotificationResponse {
        pub id: Uuid,
        pub status: NotificationStatus,
        pub message: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct NotificationQuery {
        pub user_id: Option<String>,
        pub status: Option<String>,
        pub limit: Option<i64>,
        pub offset: Option<i64>,
    }

    #[derive(Debug, Deserialize)]
    pub struct UpdateStatusRequest {
        pub status: String,
        #[serde(default)]
        pub external_id: Option<String>,
        #[serde(default)]
        pub error_message: Option<String>,
    }

    /// Create a new notification
    pub async fn create_notification(
        State(state): State<AppState>,
        payload: std::result::Result<Json<CreateNotificationRequest>, JsonRejection>,
    ) -> Result<impl IntoResponse> {
        let Json(request) = payload?;
        info!(
            "Creating {} notification for user: {}",
            request.channel, request.user_id
        );

        match state.dispatch.create(request).await {
            Ok(notification) => Ok((
                StatusCode::CREATED,
                Json(CreateNotificationResponse {
                    id: notification.id,
                    status: notification.status,
                    message: "Notification created successfully".to_string(),
                }),
            )),
            Err(e) => {
                error!("Failed to create notification: {}", e);
                Err(e)
            }
        }
    }

    /// Get a notification by ID
    pub async fn get_notification(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<impl IntoResponse> {
        let notification = state.dispatch.get(&id).await?;
        Ok(Json(notification))
    }

    /// List a user's notifications, newest first
    pub async fn list_notifications(
        State(state): State<AppState>,
        Query(query): Query<NotificationQuery>,
    ) -> Result<impl IntoResponse> {
        let user_id = query
            .user_id
            .filter(|u| !u.is_empty())
            .ok_or_else(|| NotificationError::validation("user_id", "is required"))?;

        let mut filter = NotificationFilter::for_user(user_id);
        filter.status = query.status.as_deref().map(str::parse).transpose()?;
        if let Some(limit) = query.limit {
            filter.limit = limit;
        }
        if let Some(offset) = query.offset {
            filter.offset = offset;
        }

        let notifications = state.dispatch.list_for_user(filter).await?;
        info!("Retrieved {} notifications", notifications.len());
        Ok(Json(notifications))
    }

    /// Overwrite a notification's status (administrative or provider webhook)
    pub async fn update_notification_status(
        State(state): State<AppState>,
        Path(id): Path<String>,
        payload: std::result::Result<Json<UpdateStatusRequest>, JsonRejection>,
    ) -> Result<impl IntoResponse> {
        let Json(request) = payload?;
        let update = StatusUpdate {
            status: request.status.parse()?,
            external_id: request.external_id,
            error_message: request.error_message,
        };
        info!("Updating notification {} to {}", id, update.status);

        state.dispatch.update_status(&id, update).await?;
        Ok(Json(serde_json::json!({ "success": true })))
    }

    /// Cancel a notification
    pub async fn cancel_notification(
        State(state): State<AppState>,
        Path(id): Path<String>,
    ) -> Result<impl IntoResponse> {
        info!("Cancelling notification: {}", id);

        match state.dispatch.cancel(&id).await {
            Ok(_) => Ok(StatusCode::NO_CONTENT),
            Err(e) => {
                error!("Failed to cancel notification {}: {}", id, e);
                Err(e)
            }
        }
    }
}

pub mod preferences_handler {
    use super::*;
    use axum::extract::Path;
    use dispatch_shared::{Channel, Frequency, Preference};

    #[derive(Debug, Deserialize)]
    pub struct UpdatePreferenceRequest {
        pub enabled: bool,
        #[serde(default)]
        pub frequency: Option<String>,
    }

    /// Create or replace a user's preference for one channel
    pub async fn update_preference(
        State(state): State<AppState>,
        Path((user_id, channel)): Path<(String, String)>,
        payload: std::result::Result<Json<UpdatePreferenceRequest>, JsonRejection>,
    ) -> Result<impl IntoResponse> {
        let Json(request) = payload?;
        let channel: Channel = channel.parse()?;
        let frequency: Frequency = request
            .frequency
            .as_deref()
            .map(str::parse)
            .transpose()?
            .unwrap_or_default();

        let preference = Preference {
            user_id,
            channel,
            enabled: request.enabled,
            frequency,
        };
        state.dispatch.preferences().update(&preference).await?;

        Ok(Json(preference))
    }
}

/// Health check handler
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store_healthy = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            error!("Store health check failed: {}", e);
            false
        }
    };

    let status = if store_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "service": "notification-dispatch",
        "version": env!("CARGO_PKG_VERSION"),
        "status": if store_healthy { "healthy" } else { "unhealthy" },
        "timestamp": chrono::Utc::now(),
        "components": {
            "store": { "status": if store_healthy { "healthy" } else { "unhealthy" } }
        }
    });

    (status, Json(body))
}

/// Prometheus text exposition
pub async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let body = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
