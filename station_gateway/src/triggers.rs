//! Routes tag change events into the trigger dispatcher according to the
//! per-tag trigger rules from configuration.

use crate::config::settings::TriggerRule;
use crate::dispatch::dispatcher::{EnqueueOutcome, SubscriberResult, TriggerDispatcher, TriggerSubscriber};
use crate::dispatch::message::StationTriggerMessage;
use crate::tags::structures::TagChangeEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct TriggerRouter {
    dispatcher: Arc<TriggerDispatcher>,
    rules: HashMap<String, TriggerRule>,
    /// Truthiness last seen per tag, for rising-edge rules.
    armed: RwLock<HashMap<String, bool>>,
}

impl TriggerRouter {
    pub fn new(dispatcher: Arc<TriggerDispatcher>, rules: HashMap<String, TriggerRule>) -> Arc<Self> {
        Arc::new(TriggerRouter {
            dispatcher,
            rules,
            armed: RwLock::new(HashMap::new()),
        })
    }

    /// Handle one change event. Returns the dispatcher outcome when a
    /// trigger was raised.
    pub async fn route(&self, event: &TagChangeEvent) -> Option<EnqueueOutcome> {
        let rule = self.rules.get(&event.tag)?;
        if !event.snapshot.is_good() {
            return None;
        }

        let truthy = event.snapshot.value.is_truthy();
        if rule.on_rising_edge {
            let was = self
                .armed
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(event.tag.clone(), truthy)
                .unwrap_or(false);
            if !truthy || was {
                return None;
            }
        }

        let payload = event.snapshot.value.as_text();
        match self
            .dispatcher
            .enqueue(
                &rule.station,
                rule.source,
                payload,
                rule.priority,
                rule.debounce_key.as_deref(),
            )
            .await
        {
            Ok(outcome) => {
                debug!(tag = %event.tag, station = %rule.station, ?outcome, "Trigger routed");
                Some(outcome)
            }
            Err(e) => {
                warn!(tag = %event.tag, station = %rule.station, error = %e, "Trigger dropped");
                None
            }
        }
    }

    /// Consume a change feed until every sender is gone. While a High
    /// enqueue waits for room, the feed fills and holds up the channels.
    pub fn spawn(self: &Arc<Self>, mut changes: mpsc::Receiver<TagChangeEvent>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = changes.recv().await {
                router.route(&event).await;
            }
            info!("Trigger router stopped");
        })
    }
}

/// Subscriber that records every delivered trigger in the log.
pub struct LogSubscriber;

#[async_trait]
impl TriggerSubscriber for LogSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_trigger(&self, message: &StationTriggerMessage) -> SubscriberResult {
        info!(
            station = %message.station_id,
            priority = ?message.priority,
            payload = %message.payload,
            "Station trigger"
        );
        Ok(())
    }
}
