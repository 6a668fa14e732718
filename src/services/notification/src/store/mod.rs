//! Persistence for notifications and preferences
//!
//! Status writes are plain overwrites keyed by id: the last writer wins.
//! `sent_at` and `delivered_at` are stamped once and kept.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use dispatch_shared::{Channel, Notification, NotificationStatus, Preference, StatusUpdate};
use uuid::Uuid;

use crate::error::Result;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;

/// Truncate to the microsecond precision of `TIMESTAMPTZ`, so a record reads
/// back the same from every backend
pub fn stored_timestamp(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

/// Query for a user's notifications, newest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationFilter {
    pub user_id: String,
    pub status: Option<NotificationStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl NotificationFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            status: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }

    /// Clamp paging values into the supported range
    pub fn normalized(mut self) -> Self {
        self.limit = self.limit.clamp(1, MAX_PAGE_SIZE);
        self.offset = self.offset.max(0);
        self
    }
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a new record; fails if the id already exists
    async fn insert(&self, notification: &Notification) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>>;

    async fn list(&self, filter: &NotificationFilter) -> Result<Vec<Notification>>;

    /// Overwrite status, external id and error message.
    ///
    /// Returns the updated record, or `None` when the id is unknown.
    async fn update_status(&self, id: Uuid, update: &StatusUpdate) -> Result<Option<Notification>>;

    /// Round-trip to the backing database
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_preference(&self, user_id: &str, channel: Channel) -> Result<Option<Preference>>;

    /// Insert or replace the single record for `(user_id, channel)`
    async fn upsert_preference(&self, preference: &Preference) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_normalization() {
        let mut filter = NotificationFilter::for_user("u1");
        filter.limit = 10_000;
        filter.offset = -3;

        let filter = filter.normalized();
        assert_eq!(filter.limit, MAX_PAGE_SIZE);
        assert_eq!(filter.offset, 0);

        let mut filter = NotificationFilter::for_user("u1");
        filter.limit = 0;
        assert_eq!(filter.normalized().limit, 1);
    }
}
