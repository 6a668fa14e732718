//! Per-user, per-channel delivery preferences
//!
//! [`PreferenceGate::resolve`] reads through a cache keyed
//! `user_preferences:<user>:<channel>`. A cache hit is returned as is. On a
//! miss the store is consulted; a stored row is cached for the configured TTL,
//! while the implicit default (enabled, immediate) is neither persisted nor
//! cached. Cache failures never fail a lookup.

use async_trait::async_trait;
use dashmap::DashMap;
use dispatch_shared::{Channel, Preference};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{CacheBackend, NotificationConfig};
use crate::error::{NotificationError, Result};
use crate::store::PreferenceStore;

/// Cache key for one user's preference on one channel
pub fn cache_key(user_id: &str, channel: Channel) -> String {
    format!("user_preferences:{}:{}", user_id, channel)
}

#[async_trait]
pub trait PreferenceCache: Send + Sync {
    async fn get(&self, user_id: &str, channel: Channel) -> Result<Option<Preference>>;

    async fn put(&self, preference: &Preference, ttl: Duration) -> Result<()>;

    async fn invalidate(&self, user_id: &str, channel: Channel) -> Result<()>;
}

/// Redis-backed preference cache storing JSON values with `SET ... EX`
#[derive(Clone)]
pub struct RedisPreferenceCache {
    connection: ConnectionManager,
}

impl RedisPreferenceCache {
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        info!("Connecting preference cache to Redis at {}", url);

        let client = Client::open(url)?;
        let connection = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| NotificationError::service_unavailable("redis"))??;

        Ok(Self { connection })
    }
}

#[async_trait]
impl PreferenceCache for RedisPreferenceCache {
    async fn get(&self, user_id: &str, channel: Channel) -> Result<Option<Preference>> {
        let mut conn = self.connection.clone();
        let cached: Option<String> = conn.get(cache_key(user_id, channel)).await?;

        match cached {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, preference: &Preference, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(cache_key(&preference.user_id, preference.channel))
            .arg(serde_json::to_string(preference)?)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, user_id: &str, channel: Channel) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.del(cache_key(user_id, channel)).await?;
        Ok(())
    }
}

/// Process-local cache that honours the TTL on read
#[derive(Clone, Default)]
pub struct InMemoryPreferenceCache {
    entries: Arc<DashMap<String, (Preference, Instant)>>,
}

impl InMemoryPreferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PreferenceCache for InMemoryPreferenceCache {
    async fn get(&self, user_id: &str, channel: Channel) -> Result<Option<Preference>> {
        let key = cache_key(user_id, channel);
        let hit = match self.entries.get(&key) {
            Some(entry) if entry.1 > Instant::now() => Some(entry.0.clone()),
            Some(_) => None,
            None => return Ok(None),
        };

        if hit.is_none() {
            self.entries.remove(&key);
        }
        Ok(hit)
    }

    async fn put(&self, preference: &Preference, ttl: Duration) -> Result<()> {
        self.entries.insert(
            cache_key(&preference.user_id, preference.channel),
            (preference.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn invalidate(&self, user_id: &str, channel: Channel) -> Result<()> {
        self.entries.remove(&cache_key(user_id, channel));
        Ok(())
    }
}

/// Build the cache selected by configuration
pub async fn build_cache(config: &NotificationConfig) -> Result<Arc<dyn PreferenceCache>> {
    match config.preferences.cache_backend {
        CacheBackend::Redis => Ok(Arc::new(
            RedisPreferenceCache::connect(
                &config.redis.url,
                Duration::from_secs(config.redis.connection_timeout_seconds),
            )
            .await?,
        )),
        CacheBackend::Memory => Ok(Arc::new(InMemoryPreferenceCache::new())),
    }
}

/// Decides whether a user accepts notifications on a channel
#[derive(Clone)]
pub struct PreferenceGate {
    store: Arc<dyn PreferenceStore>,
    cache: Arc<dyn PreferenceCache>,
    ttl: Duration,
}

impl PreferenceGate {
    pub fn new(
        store: Arc<dyn PreferenceStore>,
        cache: Arc<dyn PreferenceCache>,
        ttl: Duration,
    ) -> Self {
        Self { store, cache, ttl }
    }

    /// Resolve the effective preference for `(user_id, channel)`
    pub async fn resolve(&self, user_id: &str, channel: Channel) -> Result<Preference> {
        match self.cache.get(user_id, channel).await {
            Ok(Some(preference)) => {
                debug!(user_id, %channel, "Preference cache hit");
                return Ok(preference);
            }
            Ok(None) => {}
            Err(e) => warn!(user_id, %channel, "Preference cache read failed: {}", e),
        }

        let Some(preference) = self.store.get_preference(user_id, channel).await? else {
            return Ok(Preference::default_for(user_id, channel));
        };

        if let Err(e) = self.cache.put(&preference, self.ttl).await {
            warn!(user_id, %channel, "Preference cache write failed: {}", e);
        }

        Ok(preference)
    }

    /// Store a preference and drop any cached copy
    pub async fn update(&self, preference: &Preference) -> Result<()> {
        self.store.upsert_preference(preference).await?;

        if let Err(e) = self
            .cache
            .invalidate(&preference.user_id, preference.channel)
            .await
        {
            warn!(
                user_id = %preference.user_id,
                channel = %preference.channel,
                "Preference cache invalidation failed: {}", e
            );
        }

        info!(
            user_id = %preference.user_id,
            channel = %preference.channel,
            enabled = preference.enabled,
            "Preference updated"
        );
        Ok(())
    }
}
