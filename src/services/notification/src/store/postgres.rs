//! PostgreSQL-backed notification and preference store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_shared::{Channel, Notification, Preference, Priority, StatusUpdate};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{NotificationFilter, NotificationStore, PreferenceStore};
use crate::config::DatabaseConfig;
use crate::error::{NotificationError, Result};

/// Schema bootstrap. Notification ids are generated by the service, so no
/// server-side UUID function is needed. `TIMESTAMPTZ` keeps microseconds;
/// timestamps are truncated to that precision before they are written.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS user_preferences (
        user_id VARCHAR(255) NOT NULL,
        channel VARCHAR(50) NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT true,
        frequency VARCHAR(50) NOT NULL DEFAULT 'immediate',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (user_id, channel)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        user_id VARCHAR(255) NOT NULL,
        channel VARCHAR(50) NOT NULL,
        recipient VARCHAR(500) NOT NULL,
        subject VARCHAR(255),
        body TEXT NOT NULL,
        priority SMALLINT NOT NULL DEFAULT 2,
        status VARCHAR(50) NOT NULL DEFAULT 'pending',
        external_id VARCHAR(255),
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        scheduled_at TIMESTAMPTZ,
        sent_at TIMESTAMPTZ,
        delivered_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_notifications_user_id ON notifications(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_status ON notifications(status)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_channel ON notifications(channel)",
    "CREATE INDEX IF NOT EXISTS idx_notifications_created_at ON notifications(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_user_preferences_user_id ON user_preferences(user_id)",
];

const NOTIFICATION_COLUMNS: &str = "id, user_id, channel, recipient, subject, body, priority, \
     status, external_id, error_message, retry_count, scheduled_at, sent_at, delivered_at, \
     created_at, updated_at, metadata";

/// Database record structure
#[derive(Debug, sqlx::FromRow)]
struct NotificationRecord {
    id: Uuid,
    user_id: String,
    channel: String,
    recipient: String,
    subject: Option<String>,
    body: String,
    priority: i16,
    status: String,
    external_id: Option<String>,
    error_message: Option<String>,
    retry_count: i32,
    scheduled_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    metadata: Json<HashMap<String, String>>,
}

impl TryFrom<NotificationRecord> for Notification {
    type Error = NotificationError;

    fn try_from(record: NotificationRecord) -> Result<Self> {
        let priority = u8::try_from(record.priority)
            .map_err(|_| NotificationError::database(format!("bad priority {}", record.priority)))
            .and_then(|p| {
                Priority::try_from(p).map_err(|e| NotificationError::database(e.to_string()))
            })?;

        Ok(Notification {
            id: record.id,
            user_id: record.user_id,
            channel: record
                .channel
                .parse()
                .map_err(|e: dispatch_shared::ParseEnumError| NotificationError::database(e.to_string()))?,
            recipient: record.recipient,
            subject: record.subject,
            body: record.body,
            priority,
            status: record
                .status
                .parse()
                .map_err(|e: dispatch_shared::ParseEnumError| NotificationError::database(e.to_string()))?,
            external_id: record.external_id,
            error_message: record.error_message,
            retry_count: record.retry_count,
            scheduled_at: record.scheduled_at,
            sent_at: record.sent_at,
            delivered_at: record.delivered_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
            metadata: record.metadata.0,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PreferenceRecord {
    user_id: String,
    channel: String,
    enabled: bool,
    frequency: String,
}

impl TryFrom<PreferenceRecord> for Preference {
    type Error = NotificationError;

    fn try_from(record: PreferenceRecord) -> Result<Self> {
        Ok(Preference {
            user_id: record.user_id,
            channel: record
                .channel
                .parse()
                .map_err(|e: dispatch_shared::ParseEnumError| NotificationError::database(e.to_string()))?,
            enabled: record.enabled,
            frequency: record
                .frequency
                .parse()
                .map_err(|e: dispatch_shared::ParseEnumError| NotificationError::database(e.to_string()))?,
        })
    }
}

/// Store backed by a shared `PgPool`
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a pool and verify it with a round-trip
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_pool_size)
            .min_connections(config.min_pool_size)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.postgres_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        info!("PostgreSQL connection pool created successfully");

        let store = Self { pool };
        if config.run_migrations {
            store.migrate().await?;
        }
        Ok(store)
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Notification schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PostgresStore {
    async fn insert(&self, n: &Notification) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (
                id, user_id, channel, recipient, subject, body, priority, status,
                external_id, error_message, retry_count, scheduled_at, sent_at, delivered_at,
                created_at, updated_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(n.id)
        .bind(&n.user_id)
        .bind(n.channel.as_str())
        .bind(&n.recipient)
        .bind(&n.subject)
        .bind(&n.body)
        .bind(i16::from(n.priority.code()))
        .bind(n.status.as_str())
        .bind(&n.external_id)
        .bind(&n.error_message)
        .bind(n.retry_count)
        .bind(n.scheduled_at)
        .bind(n.sent_at)
        .bind(n.delivered_at)
        .bind(n.created_at)
        .bind(n.updated_at)
        .bind(Json(&n.metadata))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                NotificationError::conflict(format!("notification {} already exists", n.id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        let query = format!("SELECT {} FROM notifications WHERE id = $1", NOTIFICATION_COLUMNS);
        let record = sqlx::query_as::<_, NotificationRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        record.map(Notification::try_from).transpose()
    }

    async fn list(&self, filter: &NotificationFilter) -> Result<Vec<Notification>> {
        let query = format!(
            "SELECT {} FROM notifications \
             WHERE user_id = $1 AND ($2::VARCHAR IS NULL OR status = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4",
            NOTIFICATION_COLUMNS
        );
        let records = sqlx::query_as::<_, NotificationRecord>(&query)
            .bind(&filter.user_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;

        records.into_iter().map(Notification::try_from).collect()
    }

    async fn update_status(&self, id: Uuid, update: &StatusUpdate) -> Result<Option<Notification>> {
        let query = format!(
            "UPDATE notifications SET \
                 status = $2, \
                 external_id = $3, \
                 error_message = $4, \
                 sent_at = CASE WHEN $2 = 'sent' THEN COALESCE(sent_at, NOW()) ELSE sent_at END, \
                 delivered_at = CASE WHEN $2 = 'delivered' THEN COALESCE(delivered_at, NOW()) ELSE delivered_at END, \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {}",
            NOTIFICATION_COLUMNS
        );
        let record = sqlx::query_as::<_, NotificationRecord>(&query)
            .bind(id)
            .bind(update.status.as_str())
            .bind(&update.external_id)
            .bind(&update.error_message)
            .fetch_optional(&self.pool)
            .await?;

        record.map(Notification::try_from).transpose()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for PostgresStore {
    async fn get_preference(&self, user_id: &str, channel: Channel) -> Result<Option<Preference>> {
        let record = sqlx::query_as::<_, PreferenceRecord>(
            "SELECT user_id, channel, enabled, frequency FROM user_preferences \
             WHERE user_id = $1 AND channel = $2",
        )
        .bind(user_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;

        record.map(Preference::try_from).transpose()
    }

    async fn upsert_preference(&self, preference: &Preference) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_preferences (user_id, channel, enabled, frequency)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, channel)
            DO UPDATE SET enabled = EXCLUDED.enabled,
                          frequency = EXCLUDED.frequency,
                          updated_at = NOW()
            "#,
        )
        .bind(&preference.user_id)
        .bind(preference.channel.as_str())
        .bind(preference.enabled)
        .bind(preference.frequency.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_shared::{Frequency, NotificationStatus};
    use pretty_assertions::assert_eq;

    fn record() -> NotificationRecord {
        let now = Utc::now();
        NotificationRecord {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            channel: "sms".to_string(),
            recipient: "+15551234567".to_string(),
            subject: None,
            body: "hi".to_string(),
            priority: 1,
            status: "sent".to_string(),
            external_id: Some("SM1".to_string()),
            error_message: None,
            retry_count: 0,
            scheduled_at: None,
            sent_at: Some(now),
            delivered_at: None,
            created_at: now,
            updated_at: now,
            metadata: Json(HashMap::from([("k".to_string(), "v".to_string())])),
        }
    }

    #[test]
    fn test_record_conversion() {
        let n = Notification::try_from(record()).unwrap();
        assert_eq!(n.channel, Channel::Sms);
        assert_eq!(n.status, NotificationStatus::Sent);
        assert_eq!(n.priority, Priority::High);
        assert_eq!(n.metadata.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_record_conversion_rejects_unknown_values() {
        let mut bad = record();
        bad.status = "bounced".to_string();
        assert_eq!(
            Notification::try_from(bad).unwrap_err().error_code(),
            "DATABASE_ERROR"
        );

        let mut bad = record();
        bad.priority = -1;
        assert!(Notification::try_from(bad).is_err());
    }

    #[test]
    fn test_preference_record_conversion() {
        let pref = Preference::try_from(PreferenceRecord {
            user_id: "u1".to_string(),
            channel: "push".to_string(),
            enabled: false,
            frequency: "hourly".to_string(),
        })
        .unwrap();
        assert_eq!(pref.frequency, Frequency::Hourly);
        assert!(!pref.enabled);
    }

    #[test]
    fn test_schema_covers_both_tables() {
        assert!(SCHEMA.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS notifications")));
        assert!(SCHEMA.iter().any(|s| s.contains("PRIMARY KEY (user_id, channel)")));
        assert!(!SCHEMA.iter().any(|s| s.contains("gen_random_uuid")));
    }
}
