//! Trigger dispatcher: debounce, two bounded priority queues with different
//! overflow policies, and per-message fan-out to subscribers.
//!
//! The High queue applies backpressure to enqueuers; the Normal queue sheds
//! its oldest pending message instead. Each queue has its own consumer task,
//! so ordering is FIFO within a queue and unspecified across queues.

use crate::config::settings::DispatcherSettings;
use crate::dispatch::message::{StationTriggerMessage, TriggerPriority, TriggerSource};
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::error::Error;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub type SubscriberResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Business-process consumer of dispatched triggers.
#[async_trait]
pub trait TriggerSubscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn on_trigger(&self, message: &StationTriggerMessage) -> SubscriberResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted(Uuid),
    Debounced,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub accepted: u64,
    pub debounced: u64,
    pub evicted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub high_pending: usize,
    pub normal_pending: usize,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    debounced: AtomicU64,
    evicted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Bounded FIFO that evicts its oldest entry when full.
struct DropOldestQueue {
    items: Mutex<VecDeque<StationTriggerMessage>>,
    capacity: usize,
    notify: Notify,
}

impl DropOldestQueue {
    fn new(capacity: usize) -> Self {
        DropOldestQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Returns the evicted message, if any.
    fn push(&self, message: StationTriggerMessage) -> Option<StationTriggerMessage> {
        let evicted = {
            let mut items = self.items.lock().unwrap_or_else(|p| p.into_inner());
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(message);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    fn try_pop(&self) -> Option<StationTriggerMessage> {
        self.items
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }

    async fn pop(&self) -> StationTriggerMessage {
        loop {
            if let Some(message) = self.try_pop() {
                return message;
            }
            self.notify.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

pub struct TriggerDispatcher {
    settings: DispatcherSettings,
    high_tx: mpsc::Sender<StationTriggerMessage>,
    high_rx: Mutex<Option<mpsc::Receiver<StationTriggerMessage>>>,
    normal: DropOldestQueue,
    debounce: DashMap<String, Instant>,
    subscribers: RwLock<Vec<(u64, Arc<dyn TriggerSubscriber>)>>,
    next_subscriber_id: AtomicU64,
    counters: Counters,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TriggerDispatcher {
    pub fn new(settings: DispatcherSettings) -> Arc<Self> {
        let (high_tx, high_rx) = mpsc::channel(settings.high_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(TriggerDispatcher {
            normal: DropOldestQueue::new(settings.normal_capacity.max(1)),
            settings,
            high_tx,
            high_rx: Mutex::new(Some(high_rx)),
            debounce: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            counters: Counters::default(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register a subscriber; it receives every message broadcast from now on.
    pub fn subscribe(&self, subscriber: Arc<dyn TriggerSubscriber>) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        info!(subscriber = subscriber.name(), id, "Trigger subscriber registered");
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, subscriber));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        before != subscribers.len()
    }

    /// Accept a trigger unless its debounce key fired within the window.
    ///
    /// High priority waits for queue space; Normal priority never waits and
    /// may evict the oldest pending Normal message.
    pub async fn enqueue(
        &self,
        station_id: &str,
        source: TriggerSource,
        payload: impl Into<String>,
        priority: TriggerPriority,
        debounce_key: Option<&str>,
    ) -> GatewayResult<EnqueueOutcome> {
        if *self.shutdown_tx.borrow() {
            return Err(GatewayError::Shutdown("trigger dispatcher"));
        }
        if let Some(key) = debounce_key {
            if !self.debounce_accept(key) {
                self.counters.debounced.fetch_add(1, Ordering::Relaxed);
                debug!(station = station_id, key, "Trigger suppressed by debounce");
                return Ok(EnqueueOutcome::Debounced);
            }
        }

        let message = StationTriggerMessage::new(station_id, source, payload, priority);
        let trace_id = message.trace_id;
        match priority {
            TriggerPriority::High => {
                self.high_tx
                    .send(message)
                    .await
                    .map_err(|_| GatewayError::Shutdown("trigger dispatcher"))?;
            }
            TriggerPriority::Normal => {
                if let Some(dropped) = self.normal.push(message) {
                    self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        trace_id = %dropped.trace_id,
                        station = %dropped.station_id,
                        "Normal trigger queue full, oldest message evicted"
                    );
                }
            }
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        debug!(%trace_id, station = station_id, ?priority, "Trigger enqueued");
        Ok(EnqueueOutcome::Accepted(trace_id))
    }

    fn debounce_accept(&self, key: &str) -> bool {
        let window = Duration::from_millis(self.settings.debounce_window_ms);
        let now = Instant::now();
        let accepted = match self.debounce.entry(key.to_string()) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < window {
                    false
                } else {
                    last.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };
        if accepted && self.debounce.len() > self.settings.debounce_max_keys {
            self.prune_debounce(now, window);
        }
        accepted
    }

    /// Keep the debounce map bounded: expired keys go first, then the oldest.
    fn prune_debounce(&self, now: Instant, window: Duration) {
        self.debounce
            .retain(|_, last| now.duration_since(*last) < window);
        let max = self.settings.debounce_max_keys;
        if self.debounce.len() > max {
            let mut entries: Vec<(String, Instant)> = self
                .debounce
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect();
            entries.sort_by_key(|(_, at)| *at);
            let excess = entries.len() - max;
            for (key, _) in entries.into_iter().take(excess) {
                self.debounce.remove(&key);
            }
        }
    }

    pub fn debounce_len(&self) -> usize {
        self.debounce.len()
    }

    /// Spawn the two consumer loops. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(mut high_rx) = self
            .high_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        else {
            warn!("Trigger dispatcher already started");
            return;
        };

        let high = {
            let dispatcher = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        message = high_rx.recv() => match message {
                            Some(message) => dispatcher.broadcast(message).await,
                            None => break,
                        },
                    }
                }
                debug!("High priority consumer stopped");
            })
        };

        let normal = {
            let dispatcher = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        message = dispatcher.normal.pop() => dispatcher.broadcast(message).await,
                    }
                }
                debug!("Normal priority consumer stopped");
            })
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(high);
        tasks.push(normal);
        info!(
            high_capacity = self.settings.high_capacity,
            normal_capacity = self.settings.normal_capacity,
            "Trigger dispatcher started"
        );
    }

    /// Stop both consumers. A message already being broadcast finishes first.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Trigger consumer task ended abnormally: {}", e);
            }
        }
        info!("Trigger dispatcher stopped");
    }

    async fn broadcast(&self, message: StationTriggerMessage) {
        let subscribers: Vec<Arc<dyn TriggerSubscriber>> = self
            .subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        let span = info_span!(
            "trigger",
            trace_id = %message.trace_id,
            station = %message.station_id,
            source = %message.source,
        );
        async {
            for subscriber in subscribers {
                let outcome = AssertUnwindSafe(subscriber.on_trigger(&message))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {
                        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(subscriber = subscriber.name(), "Trigger subscriber failed: {}", e);
                    }
                    Err(_) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(subscriber = subscriber.name(), "Trigger subscriber panicked");
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            debounced: self.counters.debounced.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            high_pending: self.settings.high_capacity.max(1) - self.high_tx.capacity(),
            normal_pending: self.normal.len(),
        }
    }
}
