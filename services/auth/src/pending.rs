//! Correlation state for logins waiting on a provider callback

use crate::Broker;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One in-flight login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuth {
    pub broker: Broker,
    pub user_id: String,
    /// Whether the finished session should be written durably
    pub remember: bool,
    pub created_at: DateTime<Utc>,
}

/// In-flight logins keyed by correlation token
pub struct PendingAuthRegistry {
    entries: RwLock<FxHashMap<String, PendingAuth>>,
    ttl: Duration,
}

impl PendingAuthRegistry {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            ttl,
        }
    }

    fn is_stale(&self, entry: &PendingAuth, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(entry.created_at);
        age.to_std().map_or(false, |age| age >= self.ttl)
    }

    /// Record a login awaiting its callback
    ///
    /// Abandoned contexts are dropped on the way in, so the registry stays
    /// bounded by the logins started within one ttl.
    pub async fn issue(&self, correlation: &str, broker: Broker, user_id: &str, remember: bool) {
        let now = Utc::now();
        let entry = PendingAuth {
            broker,
            user_id: user_id.to_string(),
            remember,
            created_at: now,
        };
        let mut entries = self.entries.write().await;
        entries.retain(|_, pending| !self.is_stale(pending, now));
        entries.insert(correlation.to_string(), entry);
        debug!("Pending {} login issued for {}", broker, user_id);
    }

    /// Consume the context for a callback
    ///
    /// The entry is removed whether or not it is usable; `None` means the
    /// correlation is unknown, belongs to another broker, or was abandoned.
    pub async fn take(&self, broker: Broker, correlation: &str) -> Option<PendingAuth> {
        let entry = self.entries.write().await.remove(correlation)?;
        if entry.broker != broker {
            debug!(
                "Correlation for {} presented to {} callback",
                entry.broker, broker
            );
            return None;
        }
        if self.is_stale(&entry, Utc::now()) {
            info!("Pending {} login for {} was abandoned", broker, entry.user_id);
            return None;
        }
        Some(entry)
    }

    /// Drop a context without completing it
    pub async fn discard(&self, correlation: &str) {
        self.entries.write().await.remove(correlation);
    }

    /// Remove every context older than the ttl
    pub async fn reclaim_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !self.is_stale(entry, now));
        let reclaimed = before - entries.len();
        if reclaimed > 0 {
            info!("Reclaimed {} abandoned logins", reclaimed);
        }
        reclaimed
    }

    /// Number of in-flight logins
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Forget every in-flight login
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
