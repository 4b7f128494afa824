//! Siemens S7 driver with adaptive batch reads.

pub mod address;
pub mod batch;
pub mod client;
pub mod codec;

use crate::drivers::coerce_value;
use crate::drivers::s7::address::S7Item;
use crate::drivers::s7::batch::{plan_runs, ReadRun, DEFAULT_GAP_THRESHOLD};
use crate::drivers::s7::client::{IsoTcpClient, IsoTcpOptions, S7Transport};
use crate::drivers::s7::codec::{decode_item, decode_scalar, encode_item};
use crate::drivers::traits::{DeviceDriver, DriverResult, ReadResults};
use crate::error::GatewayError;
use crate::tags::structures::{DataType, Tag, ValueVariant};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

fn default_port() -> u16 {
    102
}
fn default_slot() -> u8 {
    1
}
fn default_pdu() -> u16 {
    480
}
fn default_timeout_ms() -> u64 {
    3000
}
fn default_gap() -> u32 {
    DEFAULT_GAP_THRESHOLD
}

#[derive(Debug, Clone, Deserialize)]
pub struct S7Settings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub rack: u8,
    #[serde(default = "default_slot")]
    pub slot: u8,
    #[serde(default = "default_pdu")]
    pub pdu_size: u16,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Largest hole in bytes bridged when merging batched tags.
    #[serde(default = "default_gap")]
    pub batch_gap_bytes: u32,
}

impl S7Settings {
    pub fn new(host: impl Into<String>) -> Self {
        S7Settings {
            host: host.into(),
            port: default_port(),
            rack: 0,
            slot: default_slot(),
            pdu_size: default_pdu(),
            connect_timeout_ms: default_timeout_ms(),
            io_timeout_ms: default_timeout_ms(),
            batch_gap_bytes: default_gap(),
        }
    }

    fn iso_options(&self) -> IsoTcpOptions {
        IsoTcpOptions {
            host: self.host.clone(),
            port: self.port,
            rack: self.rack,
            slot: self.slot,
            pdu_size: self.pdu_size,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }
}

pub struct S7Driver {
    settings: S7Settings,
    transport: Mutex<Box<dyn S7Transport>>,
}

impl S7Driver {
    pub fn new(settings: S7Settings) -> Self {
        let client = IsoTcpClient::new(settings.iso_options());
        Self::with_transport(settings, Box::new(client))
    }

    pub fn with_transport(settings: S7Settings, transport: Box<dyn S7Transport>) -> Self {
        S7Driver {
            settings,
            transport: Mutex::new(transport),
        }
    }

    async fn read_run(
        transport: &mut dyn S7Transport,
        run: &ReadRun,
        results: &mut ReadResults,
    ) {
        match transport.read_area(run.area, run.db, run.start, run.len()).await {
            Ok(buf) => {
                for (name, decoded) in run.decode(&buf) {
                    let value = decoded
                        .map_err(|e| warn!(tag = %name, error = %e, "S7 decode failed"))
                        .ok();
                    results.insert(name, value);
                }
            }
            Err(e) => {
                let e = GatewayError::Batch(format!(
                    "{} DB{} [{}, {}): {}",
                    run.area,
                    run.db,
                    run.start,
                    run.end,
                    e
                ));
                if !transport.is_connected() {
                    warn!(error = %e, "Session lost during batch read");
                    for item in &run.items {
                        results.insert(item.name.clone(), None);
                    }
                    return;
                }
                warn!(error = %e, "Falling back to individual reads");
                for item in &run.items {
                    let value = Self::read_single(transport, item).await;
                    results.insert(item.name.clone(), value);
                }
            }
        }
    }

    /// Read one item on its own. Failures resolve to `None` (Bad quality).
    async fn read_single(transport: &mut dyn S7Transport, item: &S7Item) -> Option<ValueVariant> {
        let address = item.address;
        let result = if item.is_array() {
            let size = item.data_type.byte_size();
            let mut values = Vec::with_capacity(item.array_length);
            let mut failed = None;
            for i in 0..item.array_length {
                let at = address.byte_offset + (i * size) as u32;
                match transport.read_area(address.area, address.db, at, size).await {
                    Ok(buf) => match decode_scalar(item.data_type, &buf, 0) {
                        Ok(v) => values.push(v),
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    },
                    Err(e) => {
                        failed = Some(e.to_string());
                        break;
                    }
                }
            }
            match failed {
                Some(e) => Err(e),
                None => Ok(ValueVariant::Array(values)),
            }
        } else {
            match transport
                .read_area(address.area, address.db, address.byte_offset, item.byte_len())
                .await
            {
                Ok(buf) => decode_item(item, &buf, 0),
                Err(e) => Err(e.to_string()),
            }
        };
        result
            .map_err(|e| warn!(tag = %item.name, address = %address, error = %e, "S7 read failed"))
            .ok()
    }
}

#[async_trait]
impl DeviceDriver for S7Driver {
    fn kind(&self) -> &'static str {
        "siemens_s7"
    }

    async fn connect(&self) -> DriverResult<()> {
        self.transport.lock().await.connect().await
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.transport.lock().await.disconnect().await;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    async fn read_many(&self, tags: &[Tag]) -> DriverResult<ReadResults> {
        let mut transport = self.transport.lock().await;
        if !transport.is_connected() {
            return Err(GatewayError::Connection("S7 session not established".to_string()));
        }

        let mut results: ReadResults = HashMap::with_capacity(tags.len());
        let mut batched = Vec::new();
        let mut single = Vec::new();
        for tag in tags {
            match S7Item::resolve(tag) {
                Ok(item) if item.batch_group.is_some() => batched.push(item),
                Ok(item) => single.push(item),
                Err(e) => {
                    warn!(tag = %tag.name, error = %e, "Unresolvable S7 tag");
                    results.insert(tag.name.clone(), None);
                }
            }
        }

        let runs = plan_runs(&batched, self.settings.batch_gap_bytes);
        debug!(batched = batched.len(), runs = runs.len(), single = single.len(), "S7 read plan");
        for run in &runs {
            Self::read_run(&mut **transport, run, &mut results).await;
        }
        for item in &single {
            let value = Self::read_single(&mut **transport, item).await;
            results.insert(item.name.clone(), value);
        }

        if !transport.is_connected() {
            return Err(GatewayError::Connection("S7 session lost during read".to_string()));
        }
        Ok(results)
    }

    async fn write_one(&self, tag: &Tag, value: &ValueVariant) -> DriverResult<()> {
        let item = S7Item::resolve(tag)?;
        let value = coerce_value(tag, value)?;
        let mut transport = self.transport.lock().await;
        if !transport.is_connected() {
            return Err(GatewayError::Connection("S7 session not established".to_string()));
        }
        let address = item.address;
        match item.data_type {
            DataType::Boolean => {
                let bit = value
                    .as_bool()
                    .ok_or_else(|| GatewayError::InvalidValue(format!("{:?} is not a boolean", value)))?;
                transport
                    .write_bit(address.area, address.db, address.byte_offset, address.bit_offset, bit)
                    .await
            }
            _ => {
                let bytes = encode_item(&item, &value).map_err(GatewayError::InvalidValue)?;
                transport
                    .write_area(address.area, address.db, address.byte_offset, &bytes)
                    .await
            }
        }
    }
}
