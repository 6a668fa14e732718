//! SMS notification channel implementation using the Twilio REST API

use crate::channels::ChannelProvider;
use crate::config::SmsConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use dispatch_shared::{Channel, DeliveryOutcome, Notification};
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

const UNKNOWN_TWILIO_ERROR: &str = "Unknown Twilio error";

/// Subset of the Twilio message resource we care about
#[derive(Debug, Default, Deserialize)]
struct TwilioResponse {
    sid: Option<String>,
    error_message: Option<String>,
    /// Present on REST error bodies instead of `error_message`
    message: Option<String>,
}

/// SMS channel for sending notifications via Twilio
#[derive(Clone)]
pub struct SmsChannel {
    client: reqwest::Client,
    messages_url: String,
    account_sid: String,
    auth_token: String,
    from_phone: String,
}

impl SmsChannel {
    /// Create a new SMS channel with the given configuration
    pub fn new(config: &SmsConfig) -> Result<Self> {
        info!("Initializing SMS channel");

        if config.account_sid.is_empty() {
            return Err(NotificationError::config("Twilio account SID is required"));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| NotificationError::config(format!("Failed to build HTTP client: {}", e)))?;

        let messages_url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            config.base_url.trim_end_matches('/'),
            config.account_sid
        );

        info!("SMS channel initialized successfully");

        Ok(Self {
            client,
            messages_url,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_phone: config.from_phone.clone(),
        })
    }

    async fn deliver(&self, notification: &Notification) -> std::result::Result<String, String> {
        let form = [
            ("To", notification.recipient.as_str()),
            ("From", self.from_phone.as_str()),
            ("Body", notification.body.as_str()),
        ];

        let response = self
            .client
            .post(&self.messages_url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        let body: TwilioResponse = response
            .json()
            .await
            .map_err(|_| "Failed to parse Twilio response".to_string())?;

        if status.is_success() {
            Ok(body.sid.unwrap_or_default())
        } else {
            Err(body
                .error_message
                .or(body.message)
                .unwrap_or_else(|| UNKNOWN_TWILIO_ERROR.to_string()))
        }
    }
}

#[async_trait]
impl ChannelProvider for SmsChannel {
    fn channel_type(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, notification: &Notification) -> DeliveryOutcome {
        info!(
            "Sending SMS notification {} to {}",
            notification.id, notification.recipient
        );

        match self.deliver(notification).await {
            Ok(sid) => {
                info!(
                    "Successfully sent SMS notification {} (Twilio SID: {})",
                    notification.id, sid
                );
                let external_id = Some(sid).filter(|s| !s.is_empty());
                DeliveryOutcome::sent(notification.id, external_id)
            }
            Err(message) => {
                error!("SMS notification {} failed: {}", notification.id, message);
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
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(base_url: &str) -> SmsConfig {
        SmsConfig {
            enabled: true,
            base_url: base_url.to_string(),
            account_sid: "AC123".to_string(),
            auth_token: "secret".to_string(),
            from_phone: "+15550000000".to_string(),
            timeout_seconds: 5,
        }
    }

    fn create_test_notification() -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            channel: Channel::Sms,
            recipient: "+15551234567".to_string(),
            subject: None,
            body: "Your code is 1234".to_string(),
            priority: Priority::High,
            status: NotificationStatus::Pending,
            external_id: None,
            error_message: None,
            retry_count: 0,
            scheduled_at: None,
            sent_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_successful_send_returns_sid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("To=%2B15551234567"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"sid": "SM1", "status": "queued"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let channel = SmsChannel::new(&create_test_config(&server.uri())).unwrap();
        let notification = create_test_notification();

        let outcome = channel.send(&notification).await;
        assert_eq!(
            outcome,
            DeliveryOutcome::sent(notification.id, Some("SM1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_rejected_send_uses_twilio_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": 21211,
                "message": "The 'To' number is not a valid phone number.",
                "status": 400
            })))
            .mount(&server)
            .await;

        let channel = SmsChannel::new(&create_test_config(&server.uri())).unwrap();
        let outcome = channel.send(&create_test_notification()).await;

        assert!(outcome.is_failed());
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("The 'To' number is not a valid phone number.")
        );
    }

    #[tokio::test]
    async fn test_rejected_send_without_diagnostics_uses_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({})))
            .mount(&server)
            .await;

        let channel = SmsChannel::new(&create_test_config(&server.uri())).unwrap();
        let outcome = channel.send(&create_test_notification()).await;

        assert_eq!(outcome.error_message.as_deref(), Some(UNKNOWN_TWILIO_ERROR));
    }

    #[test]
    fn test_missing_account_sid_is_config_error() {
        let mut config = create_test_config("http://localhost");
        config.account_sid.clear();
        assert!(matches!(
            SmsChannel::new(&config),
            Err(NotificationError::Config { .. })
        ));
    }
}
