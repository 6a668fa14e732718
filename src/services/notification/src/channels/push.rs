//! Push notification channel implementation using the FCM HTTP v1 API

use crate::channels::ChannelProvider;
use crate::config::PushConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use dispatch_shared::{Channel, DeliveryOutcome, Notification};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Deserialize)]
struct FcmSendResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct FcmErrorResponse {
    error: FcmError,
}

#[derive(Debug, Deserialize)]
struct FcmError {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Push notification channel for sending FCM messages
#[derive(Clone)]
pub struct PushChannel {
    client: reqwest::Client,
    send_url: String,
    access_token: String,
}

impl PushChannel {
    /// Create a new push channel with the given configuration
    pub fn new(config: &PushConfig) -> Result<Self> {
        info!("Initializing push channel");

        if config.project_id.is_empty() {
            return Err(NotificationError::config("FCM project id is required"));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| NotificationError::config(format!("Failed to build HTTP client: {}", e)))?;

        let send_url = format!(
            "{}/v1/projects/{}/messages:send",
            config.base_url.trim_end_matches('/'),
            config.project_id
        );

        info!("Push channel initialized successfully");

        Ok(Self {
            client,
            send_url,
            access_token: config.access_token.clone(),
        })
    }

    /// Build the FCM v1 message body
    fn build_payload(&self, notification: &Notification) -> Value {
        let mut data: HashMap<String, String> = notification.metadata.clone();
        data.insert("notification_id".to_string(), notification.id.to_string());
        data.insert("user_id".to_string(), notification.user_id.clone());

        let title = notification.subject.clone().unwrap_or_default();

        json!({
            "message": {
                "token": notification.recipient,
                "notification": {
                    "title": title,
                    "body": notification.body,
                },
                "data": data,
                "android": {
                    "priority": "high",
                    "notification": {
                        "notification_priority": "PRIORITY_HIGH"
                    }
                },
                "apns": {
                    "headers": {
                        "apns-priority": "10"
                    },
                    "payload": {
                        "aps": {
                            "alert": {
                                "title": title,
                                "body": notification.body,
                            },
                            "sound": "default"
                        }
                    }
                }
            }
        })
    }

    async fn deliver(&self, notification: &Notification) -> std::result::Result<String, String> {
        let response = self
            .client
            .post(&self.send_url)
            .bearer_auth(&self.access_token)
            .json(&self.build_payload(notification))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            let body: FcmSendResponse = response
                .json()
                .await
                .map_err(|e| format!("Failed to parse FCM response: {}", e))?;
            return Ok(body.name);
        }

        match response.json::<FcmErrorResponse>().await {
            Ok(body) => Err(match body.error.status {
                Some(code) => format!("{}: {}", code, body.error.message),
                None => body.error.message,
            }),
            Err(_) => Err(format!("FCM request failed with status {}", status)),
        }
    }
}

#[async_trait]
impl ChannelProvider for PushChannel {
    fn channel_type(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, notification: &Notification) -> DeliveryOutcome {
        info!("Sending push notification: {}", notification.id);

        match self.deliver(notification).await {
            Ok(name) => {
                info!(
                    "Successfully sent push notification {} (FCM response: {})",
                    notification.id, name
                );
                DeliveryOutcome::sent(notification.id, Some(name))
            }
            Err(message) => {
                error!(
                    "Failed to send push notification {}: {}",
                    notification.id, message
                );
                DeliveryOutcome::failed(notification.id, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dispatch_shared::{NotificationStatus, Priority};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(base_url: &str) -> PushConfig {
        PushConfig {
            enabled: true,
            base_url: base_url.to_string(),
            project_id: "demo-project".to_string(),
            access_token: "token-abc".to_string(),
            timeout_seconds: 5,
        }
    }

    fn create_test_notification() -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            channel: Channel::Push,
            recipient: "device-token".to_string(),
            subject: Some("Hello".to_string()),
            body: "World".to_string(),
            priority: Priority::Medium,
            status: NotificationStatus::Pending,
            external_id: None,
            error_message: None,
            retry_count: 0,
            scheduled_at: None,
            sent_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
            metadata: HashMap::from([("order_id".to_string(), "42".to_string())]),
        }
    }

    #[test]
    fn test_payload_shape() {
        let channel = PushChannel::new(&create_test_config("http://localhost")).unwrap();
        let notification = create_test_notification();

        let payload = channel.build_payload(&notification);
        let message = &payload["message"];

        assert_eq!(message["token"], "device-token");
        assert_eq!(message["notification"]["title"], "Hello");
        assert_eq!(message["data"]["order_id"], "42");
        assert_eq!(message["data"]["notification_id"], notification.id.to_string());
        assert_eq!(message["data"]["user_id"], "u1");
        assert_eq!(message["android"]["priority"], "high");
        assert_eq!(message["apns"]["headers"]["apns-priority"], "10");
        assert_eq!(message["apns"]["payload"]["aps"]["sound"], "default");
    }

    #[tokio::test]
    async fn test_successful_send_returns_message_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/demo-project/messages:send"))
            .and(header("authorization", "Bearer token-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"name": "projects/demo-project/messages/0:1"}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let channel = PushChannel::new(&create_test_config(&server.uri())).unwrap();
        let notification = create_test_notification();

        let outcome = channel.send(&notification).await;
        assert_eq!(
            outcome,
            DeliveryOutcome::sent(
                notification.id,
                Some("projects/demo-project/messages/0:1".to_string())
            )
        );
    }

    #[tokio::test]
    async fn test_rejected_send_uses_fcm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": {
                    "code": 404,
                    "message": "Requested entity was not found.",
                    "status": "NOT_FOUND"
                }
            })))
            .mount(&server)
            .await;

        let channel = PushChannel::new(&create_test_config(&server.uri())).unwrap();
        let outcome = channel.send(&create_test_notification()).await;

        assert!(outcome.is_failed());
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("NOT_FOUND: Requested entity was not found.")
        );
    }
}
