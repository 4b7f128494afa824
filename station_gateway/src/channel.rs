//! A channel binds one driver instance to the tags that name it and polls
//! them on a fixed cycle.

use crate::config::settings::ChannelConfig;
use crate::drivers::traits::DeviceDriver;
use crate::error::{GatewayError, GatewayResult};
use crate::tags::engine::TagEngine;
use crate::tags::structures::{Tag, TagChangeEvent, TagSnapshot, ValueVariant};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Invoked for every tag whose value or quality changed on a poll.
pub type ChangeCallback = Arc<dyn Fn(TagChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub driver: &'static str,
    pub running: bool,
    pub connected: bool,
    pub tag_count: usize,
}

/// Reconnect bookkeeping, owned by the poll task.
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    fn ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    /// Record a failed connect; returns the delay before the next attempt.
    fn failed(&mut self, now: Instant, base: Duration, max: Duration) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let factor = 1u32.checked_shl(self.failures - 1).unwrap_or(u32::MAX);
        let delay = base.saturating_mul(factor).min(max);
        self.retry_at = Some(now + delay);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }
}

pub struct Channel {
    config: ChannelConfig,
    driver: Arc<dyn DeviceDriver>,
    engine: TagEngine,
    on_change: ChangeCallback,
    /// Lossless copy of every change; a full feed holds up the poll tick.
    feed: Option<mpsc::Sender<TagChangeEvent>>,
    /// One poll tick or one write at a time against the driver.
    io_gate: tokio::sync::Mutex<()>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub fn new(
        config: ChannelConfig,
        driver: Arc<dyn DeviceDriver>,
        engine: TagEngine,
        on_change: ChangeCallback,
    ) -> Arc<Self> {
        Self::with_feed(config, driver, engine, on_change, None)
    }

    /// Like [`Channel::new`], additionally delivering every change to `feed`.
    pub fn with_feed(
        config: ChannelConfig,
        driver: Arc<dyn DeviceDriver>,
        engine: TagEngine,
        on_change: ChangeCallback,
        feed: Option<mpsc::Sender<TagChangeEvent>>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Channel {
            config,
            driver,
            engine,
            on_change,
            feed,
            io_gate: tokio::sync::Mutex::new(()),
            running: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the poll loop. Ticks run strictly one after another.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(channel = %self.config.name, "Channel already running");
            return;
        }
        let _ = self.shutdown_tx.send(false);
        let channel = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let period = Duration::from_millis(channel.config.poll_interval_ms.max(1));
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut backoff = Backoff::default();
            info!(
                channel = %channel.config.name,
                driver = channel.driver.kind(),
                interval_ms = channel.config.poll_interval_ms,
                "Polling started"
            );
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => channel.poll_once(&mut backoff).await,
                }
            }
            debug!(channel = %channel.config.name, "Polling stopped");
        });
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Stop polling and close the driver session. A tick in progress
    /// completes first.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(channel = %self.config.name, "Poll task ended abnormally: {}", e);
            }
        }
        let _gate = self.io_gate.lock().await;
        if let Err(e) = self.driver.disconnect().await {
            warn!(channel = %self.config.name, error = %e, "Driver disconnect failed");
        }
        info!(channel = %self.config.name, "Channel stopped");
    }

    /// Run one poll cycle immediately, outside the timer.
    pub async fn poll_now(&self) {
        let mut backoff = Backoff::default();
        self.poll_once(&mut backoff).await;
    }

    async fn poll_once(&self, backoff: &mut Backoff) {
        let tags = self.engine.tags_for_driver(&self.config.name);
        let _gate = self.io_gate.lock().await;

        if !self.driver.is_connected().await {
            let now = Instant::now();
            if !backoff.ready(now) {
                return;
            }
            match self.driver.connect().await {
                Ok(()) => {
                    if backoff.failures > 0 {
                        info!(channel = %self.config.name, attempts = backoff.failures, "Reconnected");
                    }
                    backoff.reset();
                }
                Err(e) => {
                    let delay = backoff.failed(
                        now,
                        Duration::from_millis(self.config.poll_interval_ms.max(1)),
                        Duration::from_millis(self.config.reconnect_backoff_max_ms.max(1)),
                    );
                    warn!(
                        channel = %self.config.name,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connect failed"
                    );
                    self.mark_bad(&tags).await;
                    return;
                }
            }
        }

        if tags.is_empty() {
            return;
        }

        match self.driver.read_many(&tags).await {
            Ok(mut results) => {
                let mut good = 0usize;
                for tag in &tags {
                    match results.remove(&tag.name).flatten() {
                        Some(value) => {
                            good += 1;
                            self.apply(&tag.name, TagSnapshot::good(value)).await;
                        }
                        None => self.apply_bad(&tag.name).await,
                    }
                }
                debug!(channel = %self.config.name, total = tags.len(), good, "Poll complete");
            }
            Err(e) => {
                warn!(channel = %self.config.name, error = %e, "Read failed");
                if e.is_connection_loss() {
                    if let Err(e) = self.driver.disconnect().await {
                        debug!(channel = %self.config.name, error = %e, "Disconnect after read failure failed");
                    }
                }
                self.mark_bad(&tags).await;
            }
        }
    }

    async fn mark_bad(&self, tags: &[Tag]) {
        for tag in tags {
            self.apply_bad(&tag.name).await;
        }
    }

    async fn apply_bad(&self, name: &str) {
        let last_good = self.engine.read_tag(name).map(|s| s.timestamp).unwrap_or(0);
        self.apply(name, TagSnapshot::bad(last_good)).await;
    }

    /// Store the snapshot and notify when value or quality moved.
    async fn apply(&self, name: &str, snapshot: TagSnapshot) {
        let Some(previous) = self.engine.update_snapshot(name, snapshot.clone()) else {
            return;
        };
        if previous.value == snapshot.value && previous.quality == snapshot.quality {
            return;
        }
        let event = TagChangeEvent {
            tag: name.to_string(),
            snapshot,
        };
        match &self.feed {
            Some(feed) => {
                (self.on_change)(event.clone());
                if feed.send(event).await.is_err() {
                    debug!(channel = %self.config.name, tag = %name, "Change feed closed");
                }
            }
            None => (self.on_change)(event),
        }
    }

    /// Write one tag through the driver, serialized with poll ticks.
    pub async fn write(&self, tag_name: &str, value: &ValueVariant) -> GatewayResult<()> {
        let tag = self
            .engine
            .get_tag_details(tag_name)
            .filter(|t| t.driver_code == self.config.name)
            .ok_or_else(|| GatewayError::NotFound(format!("tag '{}'", tag_name)))?;
        let _gate = self.io_gate.lock().await;
        if !self.driver.is_connected().await {
            self.driver.connect().await?;
        }
        let result = self.driver.write_one(&tag, value).await;
        match &result {
            Ok(()) => info!(channel = %self.config.name, tag = %tag_name, "Tag written"),
            Err(e) => {
                warn!(channel = %self.config.name, tag = %tag_name, error = %e, "Write failed");
                if e.is_connection_loss() {
                    let _ = self.driver.disconnect().await;
                }
            }
        }
        result
    }

    pub async fn status(&self) -> ChannelStatus {
        ChannelStatus {
            name: self.config.name.clone(),
            driver: self.driver.kind(),
            running: self.is_running(),
            connected: self.driver.is_connected().await,
            tag_count: self.engine.tags_for_driver(&self.config.name).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::default();
        let now = Instant::now();
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        assert_eq!(backoff.failed(now, base, max), Duration::from_millis(100));
        assert_eq!(backoff.failed(now, base, max), Duration::from_millis(200));
        assert_eq!(backoff.failed(now, base, max), Duration::from_millis(400));
        assert_eq!(backoff.failed(now, base, max), Duration::from_millis(500));
        assert!(!backoff.ready(now));
        assert!(backoff.ready(now + max));
        backoff.reset();
        assert!(backoff.ready(now));
    }
}
