//! Email notification channel implementation using SMTP

use crate::channels::ChannelProvider;
use crate::config::EmailConfig;
use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use dispatch_shared::{Channel, DeliveryOutcome, Notification};
use lettre::{
    message::header::{ContentType, Header, HeaderName, HeaderValue},
    message::Mailbox,
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// `X-Notification-ID` header carried on every outgoing message
#[derive(Debug, Clone, PartialEq)]
struct NotificationIdHeader(String);

impl Header for NotificationIdHeader {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Notification-ID")
    }

    fn parse(s: &str) -> std::result::Result<Self, BoxError> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// `X-User-ID` header carried on every outgoing message
#[derive(Debug, Clone, PartialEq)]
struct UserIdHeader(String);

impl Header for UserIdHeader {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-User-ID")
    }

    fn parse(s: &str) -> std::result::Result<Self, BoxError> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Email channel for sending notifications via SMTP
#[derive(Clone)]
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_mailbox: Mailbox,
}

impl EmailChannel {
    /// Create a new email channel with the given configuration
    pub fn new(config: &EmailConfig) -> Result<Self> {
        info!("Initializing email channel");

        let from_mailbox = format!("{} <{}>", config.from_name, config.from_email)
            .parse::<Mailbox>()
            .map_err(|e| NotificationError::config(format!("Invalid from email address: {}", e)))?;

        let mut transport_builder = if config.smtp_use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host).map_err(|e| {
                NotificationError::config(format!("Failed to create SMTP relay: {}", e))
            })?
        } else if config.smtp_use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host).map_err(
                |e| NotificationError::config(format!("Failed to create STARTTLS relay: {}", e)),
            )?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };

        transport_builder = transport_builder.port(config.smtp_port);

        if !config.smtp_username.is_empty() && !config.smtp_password.is_empty() {
            let creds =
                Credentials::new(config.smtp_username.clone(), config.smtp_password.clone());
            transport_builder = transport_builder.credentials(creds);
        }

        transport_builder =
            transport_builder.pool_config(PoolConfig::new().max_size(10).min_idle(1));

        transport_builder =
            transport_builder.timeout(Some(Duration::from_secs(config.timeout_seconds)));

        let transport = transport_builder.build();

        info!("Email channel initialized successfully");

        Ok(Self {
            transport,
            from_mailbox,
        })
    }

    /// Build an email message from a notification
    fn build_message(&self, notification: &Notification) -> Result<Message> {
        let to_mailbox = notification.recipient.parse::<Mailbox>()?;

        let mut message_builder = Message::builder()
            .from(self.from_mailbox.clone())
            .to(to_mailbox)
            .header(NotificationIdHeader(notification.id.to_string()))
            .header(UserIdHeader(notification.user_id.clone()));

        if let Some(ref subject) = notification.subject {
            message_builder = message_builder.subject(subject);
        }

        let content_type = if looks_like_html(&notification.body) {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };

        let message = message_builder
            .header(content_type)
            .body(notification.body.clone())?;

        Ok(message)
    }

    async fn deliver(&self, notification: &Notification) -> Result<Option<String>> {
        let message = self.build_message(notification)?;
        let response = self.transport.send(message).await?;
        Ok(parse_queued_id(response.message()))
    }
}

#[async_trait]
impl ChannelProvider for EmailChannel {
    fn channel_type(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, notification: &Notification) -> DeliveryOutcome {
        info!("Sending email notification: {}", notification.id);

        match self.deliver(notification).await {
            Ok(external_id) => {
                info!(
                    "Email sent successfully: {} to {}",
                    notification.id, notification.recipient
                );
                DeliveryOutcome::sent(notification.id, external_id)
            }
            Err(e) => {
                error!("Failed to send email {}: {}", notification.id, e);
                DeliveryOutcome::failed(notification.id, e.to_string())
            }
        }
    }
}

fn looks_like_html(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("<html") || lower.contains("<p>") || lower.contains("<br")
}

/// Extracts the queue id from an SMTP reply such as `2.0.0 Ok: queued as 4F2C1`
fn parse_queued_id<'a>(lines: impl Iterator<Item = &'a str>) -> Option<String> {
    const MARKER: &str = "queued as ";

    for line in lines {
        let lower = line.to_ascii_lowercase();
        if let Some(pos) = lower.find(MARKER) {
            let id = line[pos + MARKER.len()..]
                .split_whitespace()
                .next()
                .map(|s| s.trim_matches(|c: char| c == '<' || c == '>'))
                .filter(|s| !s.is_empty());
            if let Some(id) = id {
                return Some(id.to_string());
            }
        }
    }

    None
}
