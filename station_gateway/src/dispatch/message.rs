use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Selects the dispatcher queue a trigger is routed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPriority {
    #[default]
    Normal,
    /// Never dropped; enqueuers wait for space instead.
    High,
}

/// What raised the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Plc,
    Scanner,
    Manual,
    System,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerSource::Plc => "plc",
            TriggerSource::Scanner => "scanner",
            TriggerSource::Manual => "manual",
            TriggerSource::System => "system",
        };
        f.write_str(s)
    }
}

/// A station trigger accepted past debounce. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationTriggerMessage {
    pub trace_id: Uuid,
    pub station_id: String,
    pub source: TriggerSource,
    pub payload: String,
    pub priority: TriggerPriority,
    pub timestamp: DateTime<Utc>,
}

impl StationTriggerMessage {
    pub fn new(
        station_id: impl Into<String>,
        source: TriggerSource,
        payload: impl Into<String>,
        priority: TriggerPriority,
    ) -> Self {
        StationTriggerMessage {
            trace_id: Uuid::new_v4(),
            station_id: station_id.into(),
            source,
            payload: payload.into(),
            priority,
            timestamp: Utc::now(),
        }
    }
}
