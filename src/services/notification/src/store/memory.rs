//! In-memory store for tests and single-process development

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dispatch_shared::{Channel, Notification, Preference, StatusUpdate};
use std::sync::Arc;
use uuid::Uuid;

use super::{stored_timestamp, NotificationFilter, NotificationStore, PreferenceStore};
use crate::error::{NotificationError, Result};

#[derive(Clone, Default)]
pub struct InMemoryStore {
    notifications: Arc<DashMap<Uuid, Notification>>,
    preferences: Arc<DashMap<(String, Channel), Preference>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.len()
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn insert(&self, notification: &Notification) -> Result<()> {
        match self.notifications.entry(notification.id) {
            Entry::Occupied(_) => Err(NotificationError::conflict(format!(
                "notification {} already exists",
                notification.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(notification.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.notifications.get(&id).map(|n| n.value().clone()))
    }

    async fn list(&self, filter: &NotificationFilter) -> Result<Vec<Notification>> {
        let mut matches: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|n| n.user_id == filter.user_id)
            .filter(|n| filter.status.map_or(true, |s| n.status == s))
            .map(|n| n.value().clone())
            .collect();

        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matches
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn update_status(&self, id: Uuid, update: &StatusUpdate) -> Result<Option<Notification>> {
        Ok(self.notifications.get_mut(&id).map(|mut n| {
            n.apply_status(update, stored_timestamp(Utc::now()));
            n.clone()
        }))
    }
}

#[async_trait]
impl PreferenceStore for InMemoryStore {
    async fn get_preference(&self, user_id: &str, channel: Channel) -> Result<Option<Preference>> {
        Ok(self
            .preferences
            .get(&(user_id.to_string(), channel))
            .map(|p| p.value().clone()))
    }

    async fn upsert_preference(&self, preference: &Preference) -> Result<()> {
        self.preferences.insert(
            (preference.user_id.clone(), preference.channel),
            preference.clone(),
        );
        Ok(())
    }
}
