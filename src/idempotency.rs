use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::warn;

/// Guards against replayed webhook/capture events. Backed by Redis when a
/// URL is configured, otherwise by a per-process map (good enough for a
/// single instance; replays across restarts then rely on the providers'
/// at-least-once windows being short).
#[derive(Clone)]
pub struct IdempotencyStore {
    redis_client: Option<redis::Client>,
    fallback: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl IdempotencyStore {
    pub fn new(redis_url: Option<String>) -> Self {
        let redis_client = redis_url.and_then(|url| {
            redis::Client::open(url)
                .map_err(|e| warn!("redis unavailable, using in-memory idempotency: {e}"))
                .ok()
        });
        Self {
            redis_client,
            fallback: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn is_processed(&self, event_id: &str) -> bool {
        if let Some(client) = &self.redis_client {
            if let Ok(mut con) = client.get_multiplexed_async_connection().await {
                let exists: bool = con
                    .exists(format!("event:{event_id}"))
                    .await
                    .unwrap_or(false);
                return exists;
            }
        }
        self.fallback.read().await.contains_key(event_id)
    }

    /// Called only after delivery succeeds, so a failed delivery leaves the
    /// event eligible for the provider's retry.
    pub async fn mark_processed(&self, event_id: &str) {
        if let Some(client) = &self.redis_client {
            if let Ok(mut con) = client.get_multiplexed_async_connection().await {
                // 24h expiry, comfortably past the providers' retry windows.
                let outcome: Result<(), _> = con
                    .set_ex(format!("event:{event_id}"), Utc::now().to_rfc3339(), 86_400)
                    .await;
                if let Err(e) = outcome {
                    warn!("failed to persist idempotency key for {event_id}: {e}");
                }
                return;
            }
        }
        let mut fallback = self.fallback.write().await;
        // The fallback has no TTL machinery, so stale entries are swept on
        // insert to keep a Redis-less instance from growing without bound.
        let cutoff = Utc::now() - chrono::Duration::seconds(FALLBACK_TTL_SECS);
        fallback.retain(|_, processed_at| *processed_at > cutoff);
        fallback.insert(event_id.to_string(), Utc::now());
    }
}

const FALLBACK_TTL_SECS: i64 = 86_400;

#[cfg(test)]
impl IdempotencyStore {
    async fn backdate(&self, event_id: &str, age_secs: i64) {
        if let Some(processed_at) = self.fallback.write().await.get_mut(event_id) {
            *processed_at = Utc::now() - chrono::Duration::seconds(age_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unseen_events_are_not_processed() {
        let store = IdempotencyStore::new(None);
        assert!(!store.is_processed("evt_1").await);
    }

    #[tokio::test]
    async fn marked_events_stay_marked() {
        let store = IdempotencyStore::new(None);
        store.mark_processed("evt_1").await;
        assert!(store.is_processed("evt_1").await);
        assert!(!store.is_processed("evt_2").await);
    }

    #[tokio::test]
    async fn fallback_sweeps_entries_older_than_the_ttl() {
        let store = IdempotencyStore::new(None);
        store.mark_processed("evt_old").await;
        store.backdate("evt_old", FALLBACK_TTL_SECS + 3600).await;

        store.mark_processed("evt_new").await;
        assert!(!store.is_processed("evt_old").await);
        assert!(store.is_processed("evt_new").await);
    }
}
