//! Notification channels module
//!
//! Provider adapters for each delivery medium and the registry that routes a
//! notification to the adapter for its channel:
//! - Email channel (SMTP)
//! - SMS channel (Twilio REST API)
//! - Push notification channel (FCM HTTP v1)

use async_trait::async_trait;
use dispatch_shared::{Channel, DeliveryOutcome, Notification};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::error::Result;

pub mod email;
pub mod push;
pub mod sms;

pub use email::EmailChannel;
pub use push::PushChannel;
pub use sms::SmsChannel;

/// Trait that all provider adapters implement.
///
/// `send` makes a single attempt and classifies the result. Provider and
/// transport failures come back as a `failed` outcome, never as an error.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// The channel this adapter serves
    fn channel_type(&self) -> Channel;

    /// Send a notification through this channel
    async fn send(&self, notification: &Notification) -> DeliveryOutcome;
}

/// Maps a channel to the adapter that serves it.
///
/// Built once at startup and only read afterwards.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    providers: HashMap<Channel, Arc<dyn ChannelProvider>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same channel
    pub fn register(&mut self, provider: Arc<dyn ChannelProvider>) {
        let channel = provider.channel_type();
        if self.providers.insert(channel, provider).is_some() {
            warn!("Replaced provider registered for channel {}", channel);
        } else {
            info!("Registered provider for channel {}", channel);
        }
    }

    /// Send through the adapter registered for the notification's channel
    pub async fn route(&self, notification: &Notification) -> DeliveryOutcome {
        match self.providers.get(&notification.channel) {
            Some(provider) => provider.send(notification).await,
            None => DeliveryOutcome::failed(
                notification.id,
                format!("unsupported channel type: {}", notification.channel),
            ),
        }
    }

    pub fn supports(&self, channel: Channel) -> bool {
        self.providers.contains_key(&channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.providers.keys().copied().collect();
        channels.sort_by_key(|c| c.as_str());
        channels
    }
}

/// Build a registry holding the adapters for `channels` that are enabled in
/// configuration
pub fn build_registry(config: &NotificationConfig, channels: &[Channel]) -> Result<ChannelRegistry> {
    let mut registry = ChannelRegistry::new();

    for &channel in channels {
        if !config.is_channel_enabled(channel) {
            warn!("Channel {} is disabled; notifications will fail as unsupported", channel);
            continue;
        }

        let provider: Arc<dyn ChannelProvider> = match channel {
            Channel::Email => Arc::new(EmailChannel::new(&config.email)?),
            Channel::Sms => Arc::new(SmsChannel::new(&config.sms)?),
            Channel::Push => Arc::new(PushChannel::new(&config.push)?),
        };
        registry.register(provider);
    }

    Ok(registry)
}
