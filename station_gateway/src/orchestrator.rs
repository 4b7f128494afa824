//! Owns the tag registry and the set of running channels, and rebuilds both
//! from configuration on reload.

use crate::channel::{Channel, ChannelStatus, ChangeCallback};
use crate::config::settings::Settings;
use crate::drivers::factory::create_driver;
use crate::error::{GatewayError, GatewayResult};
use crate::tags::engine::TagEngine;
use crate::tags::structures::{TagChangeEvent, TagSnapshot, ValueVariant};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};

const CHANGE_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Applied,
    /// Another reload was already running; this one was dropped.
    Skipped,
}

pub struct CommunicationOrchestrator {
    engine: TagEngine,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    reload_lock: Mutex<()>,
    changes: broadcast::Sender<TagChangeEvent>,
    feed: RwLock<Option<mpsc::Sender<TagChangeEvent>>>,
}

impl CommunicationOrchestrator {
    pub fn new() -> Arc<Self> {
        Self::with_engine(TagEngine::new())
    }

    pub fn with_engine(engine: TagEngine) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Arc::new(CommunicationOrchestrator {
            engine,
            channels: RwLock::new(HashMap::new()),
            reload_lock: Mutex::new(()),
            changes,
            feed: RwLock::new(None),
        })
    }

    pub fn engine(&self) -> &TagEngine {
        &self.engine
    }

    /// Best-effort stream of tag change events from every channel. Slow
    /// receivers lag and miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<TagChangeEvent> {
        self.changes.subscribe()
    }

    /// Lossless change stream for trigger routing. Channels built by the next
    /// reload wait on this feed when it is full, so no event is dropped.
    /// Replaces any previous feed.
    pub fn change_feed(&self, capacity: usize) -> mpsc::Receiver<TagChangeEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.feed.write().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        rx
    }

    fn change_callback(&self) -> ChangeCallback {
        let changes = self.changes.clone();
        Arc::new(move |event: TagChangeEvent| {
            // no receivers is fine
            let _ = changes.send(event);
        })
    }

    fn snapshot_channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Stop everything and rebuild channels and tags from `settings`.
    ///
    /// Non-reentrant: a reload arriving while another is in progress is
    /// skipped rather than queued.
    pub async fn reload(&self, settings: &Settings) -> GatewayResult<ReloadOutcome> {
        let Ok(_guard) = self.reload_lock.try_lock() else {
            warn!("Reload already in progress, skipping");
            return Ok(ReloadOutcome::Skipped);
        };

        // Build drivers first so a bad channel config leaves the running set intact.
        let feed = self.feed.read().unwrap_or_else(|p| p.into_inner()).clone();
        let mut built = HashMap::new();
        for config in &settings.channels {
            let driver = create_driver(config)?;
            built.insert(
                config.name.clone(),
                Channel::with_feed(
                    config.clone(),
                    driver,
                    self.engine.clone(),
                    self.change_callback(),
                    feed.clone(),
                ),
            );
        }

        for channel in self.snapshot_channels() {
            channel.stop().await;
        }
        self.channels
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.engine.clear();

        for tag_config in &settings.tags {
            if !built.contains_key(&tag_config.driver_code) {
                warn!(
                    tag = %tag_config.name,
                    channel = %tag_config.driver_code,
                    "Tag references an unknown channel and will stay Bad"
                );
            }
            self.engine.register_tag(tag_config.to_tag());
        }

        for channel in built.values() {
            channel.start();
        }
        info!(
            channels = built.len(),
            tags = self.engine.len(),
            "Configuration applied"
        );
        *self.channels.write().unwrap_or_else(|p| p.into_inner()) = built;
        Ok(ReloadOutcome::Applied)
    }

    /// Current snapshot; unknown names read as Bad/null.
    pub fn get_tag_value(&self, name: &str) -> TagSnapshot {
        self.engine.get(name)
    }

    pub async fn write_tag(&self, name: &str, value: &ValueVariant) -> GatewayResult<()> {
        let tag = self
            .engine
            .get_tag_details(name)
            .ok_or_else(|| GatewayError::NotFound(format!("tag '{}'", name)))?;
        let channel = self
            .channels
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&tag.driver_code)
            .cloned();
        let Some(channel) = channel else {
            error!(
                tag = %name,
                channel = %tag.driver_code,
                "Write to tag whose channel does not exist"
            );
            return Err(GatewayError::Configuration(format!(
                "tag '{}' maps to unknown channel '{}'",
                name, tag.driver_code
            )));
        };
        channel.write(name, value).await
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    pub async fn channel_statuses(&self) -> Vec<ChannelStatus> {
        let mut statuses = Vec::new();
        for channel in self.snapshot_channels() {
            statuses.push(channel.status().await);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stop every channel. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _guard = self.reload_lock.lock().await;
        for channel in self.snapshot_channels() {
            channel.stop().await;
        }
        info!("Communication orchestrator stopped");
    }
}
