use crate::drivers::coerce_value;
use crate::drivers::traits::{DeviceDriver, DriverResult, ReadResults};
use crate::error::GatewayError;
use crate::tags::structures::{DataType, Tag, ValueVariant};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimulationSettings {
    /// Unwritten numeric tags count up by one on every read.
    #[serde(default)]
    pub ramp: bool,
    /// Every read fails as if the device dropped the session.
    #[serde(default)]
    pub fail_reads: bool,
    #[serde(default)]
    pub fail_connect: bool,
    /// Initial values keyed by tag name.
    #[serde(default)]
    pub initial: HashMap<String, serde_json::Value>,
}

/// In-memory device used for commissioning and tests.
pub struct SimulationDriver {
    settings: SimulationSettings,
    connected: AtomicBool,
    written: Mutex<HashMap<String, ValueVariant>>,
    ramps: Mutex<HashMap<String, i64>>,
}

impl SimulationDriver {
    pub fn new(settings: SimulationSettings) -> Self {
        let written = settings
            .initial
            .iter()
            .map(|(k, v)| (k.clone(), ValueVariant::from(v.clone())))
            .collect();
        SimulationDriver {
            settings,
            connected: AtomicBool::new(false),
            written: Mutex::new(written),
            ramps: Mutex::new(HashMap::new()),
        }
    }

    /// Set a value as if the device changed it.
    pub fn set_value(&self, tag: &str, value: ValueVariant) {
        self.written
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(tag.to_string(), value);
    }

    fn default_for(&self, tag: &Tag) -> ValueVariant {
        let scalar = match tag.data_type {
            DataType::Boolean => ValueVariant::Bool(false),
            DataType::String => ValueVariant::String(String::new()),
            DataType::Float | DataType::Double => ValueVariant::Float(0.0),
            DataType::Int16 | DataType::Int32 | DataType::Int64 => ValueVariant::Int(0),
            _ => ValueVariant::UInt(0),
        };
        if tag.is_array() {
            ValueVariant::Array(vec![scalar; tag.array_length])
        } else {
            scalar
        }
    }

    fn ramp(&self, tag: &Tag) -> Option<ValueVariant> {
        if !self.settings.ramp || !tag.data_type.is_numeric() || tag.is_array() {
            return None;
        }
        let mut ramps = self.ramps.lock().unwrap_or_else(|p| p.into_inner());
        let counter = ramps.entry(tag.name.clone()).or_insert(0);
        *counter += 1;
        let value = ValueVariant::Int(*counter);
        coerce_value(tag, &value).ok()
    }
}

#[async_trait]
impl DeviceDriver for SimulationDriver {
    fn kind(&self) -> &'static str {
        "simulation"
    }

    async fn connect(&self) -> DriverResult<()> {
        if self.settings.fail_connect {
            return Err(GatewayError::Connection(
                "simulated device refused connection".to_string(),
            ));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Simulation driver connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_many(&self, tags: &[Tag]) -> DriverResult<ReadResults> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("not connected".to_string()));
        }
        if self.settings.fail_reads {
            return Err(GatewayError::Connection("simulated read failure".to_string()));
        }
        let written = self.written.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut results = HashMap::with_capacity(tags.len());
        for tag in tags {
            let value = match written.get(&tag.name) {
                Some(v) => Some(v.clone()),
                None => Some(self.ramp(tag).unwrap_or_else(|| self.default_for(tag))),
            };
            results.insert(tag.name.clone(), value);
        }
        debug!(count = results.len(), "Simulation read");
        Ok(results)
    }

    async fn write_one(&self, tag: &Tag, value: &ValueVariant) -> DriverResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("not connected".to_string()));
        }
        let value = coerce_value(tag, value)?;
        self.set_value(&tag.name, value);
        Ok(())
    }
}
