//! Per-command response cache with a freshness window.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

struct CacheEntry {
    value: serde_json::Value,
    fetched_at: Instant,
}

pub struct ResponseCache {
    default_ttl: Duration,
    overrides: std::collections::HashMap<String, Duration>,
    entries: DashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        ResponseCache {
            default_ttl,
            overrides: Default::default(),
            entries: DashMap::new(),
        }
    }

    pub fn with_override(mut self, command: impl Into<String>, ttl: Duration) -> Self {
        self.overrides.insert(command.into(), ttl);
        self
    }

    pub fn ttl(&self, command: &str) -> Duration {
        self.overrides.get(command).copied().unwrap_or(self.default_ttl)
    }

    /// Cached response for `command` if still inside its window.
    pub fn get(&self, command: &str) -> Option<serde_json::Value> {
        let ttl = self.ttl(command);
        let entry = self.entries.get(command)?;
        if entry.fetched_at.elapsed() < ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn put(&self, command: &str, value: serde_json::Value) {
        self.entries.insert(
            command.to_string(),
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, command: &str) {
        self.entries.remove(command);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
