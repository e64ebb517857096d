//! Bounded per-host connection cache with expire-after-access.

use std::sync::Arc;
use std::time::Duration;

use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::debug;

use super::AgentConnection;

/// Connections keyed by host name.
///
/// Entries unused for `expire_after_access` expire. When full, the least
/// recently used entry makes room. Every connection leaving the cache is
/// closed by the eviction listener.
pub struct ChannelCache<T: AgentConnection + 'static> {
    entries: Cache<String, Arc<T>>,
}

impl<T: AgentConnection + 'static> ChannelCache<T> {
    /// An empty cache holding at most `capacity` connections.
    #[must_use]
    pub fn new(capacity: usize, expire_after_access: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(u64::try_from(capacity.max(1)).unwrap_or(u64::MAX))
            .time_to_idle(expire_after_access)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(|host: Arc<String>, connection: Arc<T>, cause: RemovalCause| {
                debug!(host = %host, ?cause, "closing agent connection");
                connection.close();
            })
            .build();
        Self { entries }
    }

    /// Cached connection for `host`, refreshing its access time.
    pub fn get(&self, host: &str) -> Option<Arc<T>> {
        let connection = self.entries.get(host);
        if connection.is_none() {
            self.entries.run_pending_tasks();
        }
        connection
    }

    /// Cache `connection` for `host`. If another connection for the host was
    /// cached in the meantime, that one wins and `connection` is closed.
    pub fn insert(&self, host: &str, connection: T) -> Arc<T> {
        let candidate = Arc::new(connection);
        let entry = self
            .entries
            .entry(host.to_string())
            .or_insert_with(|| Arc::clone(&candidate));
        if !entry.is_fresh() {
            candidate.close();
        }
        self.entries.run_pending_tasks();
        entry.into_value()
    }

    /// Drop and close the connection for `host`.
    pub fn remove(&self, host: &str) {
        self.entries.invalidate(host);
    }

    /// Close and drop every connection.
    pub fn clear(&self) {
        let hosts: Vec<Arc<String>> = self.entries.iter().map(|(host, _)| host).collect();
        for host in hosts {
            self.entries.invalidate(host.as_str());
        }
        self.entries.run_pending_tasks();
    }

    /// Number of cached connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        usize::try_from(self.entries.entry_count()).unwrap_or(usize::MAX)
    }

    /// True if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
