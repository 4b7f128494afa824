//! Modbus-TCP driver on top of `tokio-modbus`.
//!
//! Tag addresses are register numbers: a plain `"100"` is the 0-based
//! offset, while 5/6-digit references (`"40101"`, `"300001"`) carry the
//! table in their leading digit and map to `number - base - 1`. The
//! `station_id` and `function_code` attributes default to the channel's unit
//! id and to the function code implied by the reference (3 otherwise).

use crate::drivers::coerce_value;
use crate::drivers::s7::codec::{decode_scalar, encode_scalar};
use crate::drivers::traits::{DeviceDriver, DriverResult, ReadResults};
use crate::error::GatewayError;
use crate::tags::structures::{DataType, Tag, ValueVariant};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_modbus::ExceptionCode;
use tracing::{debug, info, warn};

fn default_port() -> u16 {
    502
}
fn default_timeout_ms() -> u64 {
    3000
}
fn default_unit_id() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub io_timeout_ms: u64,
}

/// Register location of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusPoint {
    pub station_id: u8,
    pub function_code: u8,
    pub offset: u16,
}

impl ModbusPoint {
    pub fn resolve(tag: &Tag, default_station: u8) -> DriverResult<Self> {
        let config_err = |e: String| GatewayError::Configuration(format!("tag '{}': {}", tag.name, e));
        let (offset, implied_fc) = parse_reference(&tag.address).map_err(config_err)?;
        let station_id = tag
            .parsed_attribute::<u8>("station_id")
            .map_err(config_err)?
            .unwrap_or(default_station);
        let function_code = tag
            .parsed_attribute::<u8>("function_code")
            .map_err(config_err)?
            .or(implied_fc)
            .unwrap_or(3);
        Ok(ModbusPoint {
            station_id,
            function_code,
            offset,
        })
    }
}

/// Parse a register address into its 0-based offset and, for 5/6-digit
/// references, the function code implied by the leading digit.
pub fn parse_reference(raw: &str) -> Result<(u16, Option<u8>), String> {
    let text = raw.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid Modbus address '{}'", raw));
    }
    let number: u32 = text.parse().map_err(|_| format!("invalid Modbus address '{}'", raw))?;
    let implied = match (text.len(), text.as_bytes()[0]) {
        (5 | 6, b'0') => Some(1),
        (5 | 6, b'1') => Some(2),
        (5 | 6, b'3') => Some(4),
        (5 | 6, b'4') => Some(3),
        _ => None,
    };
    let offset = match implied {
        Some(_) => {
            let base = 10u32.pow(text.len() as u32 - 1);
            let table = number / base;
            let index = number - table * base;
            if index == 0 {
                return Err(format!("Modbus reference '{}' has no register 0", raw));
            }
            index - 1
        }
        None => number,
    };
    let offset = u16::try_from(offset).map_err(|_| format!("Modbus address '{}' out of range", raw))?;
    Ok((offset, implied))
}

/// Registers occupied by one element of `data_type`.
fn element_words(data_type: DataType) -> usize {
    data_type.byte_size().div_ceil(2)
}

fn register_count(tag: &Tag) -> usize {
    match tag.data_type {
        DataType::String => tag.array_length.div_ceil(2).max(1),
        dt => element_words(dt) * tag.array_length.max(1),
    }
}

/// Decode registers with big-endian word order.
pub fn decode_registers(tag: &Tag, registers: &[u16]) -> Result<ValueVariant, String> {
    let bytes: Vec<u8> = registers.iter().flat_map(|r| r.to_be_bytes()).collect();
    match tag.data_type {
        DataType::String => {
            let text: String = bytes
                .iter()
                .take(tag.array_length)
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect();
            Ok(ValueVariant::String(text))
        }
        dt => {
            let stride = element_words(dt) * 2;
            // single-byte types sit in the low byte of their register
            let pad = stride - dt.byte_size();
            let decode_at = |i: usize| decode_scalar(dt, &bytes, i * stride + pad);
            if tag.is_array() {
                (0..tag.array_length)
                    .map(decode_at)
                    .collect::<Result<Vec<_>, _>>()
                    .map(ValueVariant::Array)
            } else {
                decode_at(0)
            }
        }
    }
}

/// Encode an already-coerced value into registers, big-endian word order.
pub fn encode_registers(tag: &Tag, value: &ValueVariant) -> Result<Vec<u16>, String> {
    let mut bytes = Vec::new();
    match (tag.data_type, value) {
        (DataType::String, v) => {
            let text = v.as_text();
            if text.len() > tag.array_length {
                return Err(format!(
                    "string of {} chars exceeds max length {}",
                    text.len(),
                    tag.array_length
                ));
            }
            bytes.extend_from_slice(text.as_bytes());
        }
        (dt, ValueVariant::Array(items)) => {
            for item in items {
                bytes.extend(encode_padded(dt, item)?);
            }
        }
        (dt, v) => bytes.extend(encode_padded(dt, v)?),
    }
    if bytes.len() % 2 == 1 {
        bytes.push(0);
    }
    Ok(bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn encode_padded(data_type: DataType, value: &ValueVariant) -> Result<Vec<u8>, String> {
    let mut raw = encode_scalar(data_type, value)?;
    if raw.len() % 2 == 1 {
        raw.insert(0, 0);
    }
    Ok(raw)
}

/// Run one Modbus request under the I/O timeout, mapping transport failures
/// to connection-class errors and exception responses to protocol errors.
async fn guarded<T, Fut>(io_timeout: Duration, op: &'static str, fut: Fut) -> DriverResult<T>
where
    Fut: Future<Output = Result<Result<T, ExceptionCode>, tokio_modbus::Error>>,
{
    match timeout(io_timeout, fut).await {
        Ok(Ok(Ok(v))) => Ok(v),
        Ok(Ok(Err(code))) => Err(GatewayError::Protocol {
            code: -1,
            message: format!("Modbus exception on {}: {:?}", op, code),
        }),
        Ok(Err(e)) => Err(GatewayError::Connection(format!("{}: {}", op, e))),
        Err(_) => Err(GatewayError::Timeout(format!(
            "{} after {} ms",
            op,
            io_timeout.as_millis()
        ))),
    }
}

pub struct ModbusDriver {
    settings: ModbusSettings,
    session: Mutex<Option<Context>>,
}

impl ModbusDriver {
    pub fn new(settings: ModbusSettings) -> Self {
        ModbusDriver {
            settings,
            session: Mutex::new(None),
        }
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.io_timeout_ms)
    }

    async fn read_tag(&self, ctx: &mut Context, tag: &Tag) -> DriverResult<ValueVariant> {
        let point = ModbusPoint::resolve(tag, self.settings.unit_id)?;
        ctx.set_slave(Slave(point.station_id));
        let t = self.io_timeout();
        match (point.function_code, tag.data_type) {
            (1 | 2, DataType::Boolean) => {
                let bits = if point.function_code == 1 {
                    guarded(t, "read_coils", ctx.read_coils(point.offset, 1)).await?
                } else {
                    guarded(t, "read_discrete_inputs", ctx.read_discrete_inputs(point.offset, 1)).await?
                };
                bits.first()
                    .copied()
                    .map(ValueVariant::Bool)
                    .ok_or_else(|| GatewayError::decode(&tag.name, "empty coil response"))
            }
            (3 | 4, dt) if dt != DataType::Boolean => {
                let count = u16::try_from(register_count(tag))
                    .map_err(|_| GatewayError::Configuration(format!("tag '{}' spans too many registers", tag.name)))?;
                let registers = if point.function_code == 3 {
                    guarded(t, "read_holding_registers", ctx.read_holding_registers(point.offset, count)).await?
                } else {
                    guarded(t, "read_input_registers", ctx.read_input_registers(point.offset, count)).await?
                };
                decode_registers(tag, &registers).map_err(|e| GatewayError::decode(&tag.name, e))
            }
            (fc, dt) => Err(GatewayError::NotSupported(format!(
                "reading {} with function code {}",
                dt, fc
            ))),
        }
    }

    async fn write_tag(&self, ctx: &mut Context, tag: &Tag, value: &ValueVariant) -> DriverResult<()> {
        let point = ModbusPoint::resolve(tag, self.settings.unit_id)?;
        ctx.set_slave(Slave(point.station_id));
        let t = self.io_timeout();
        match (point.function_code, tag.data_type) {
            (1, DataType::Boolean) if !tag.is_array() => {
                let bit = value
                    .as_bool()
                    .ok_or_else(|| GatewayError::InvalidValue(format!("{:?} is not a boolean", value)))?;
                guarded(t, "write_single_coil", ctx.write_single_coil(point.offset, bit)).await
            }
            (3, dt) if dt != DataType::Boolean => {
                let registers = encode_registers(tag, value).map_err(GatewayError::InvalidValue)?;
                match registers.as_slice() {
                    [single] => {
                        guarded(t, "write_single_register", ctx.write_single_register(point.offset, *single)).await
                    }
                    many => {
                        guarded(t, "write_multiple_registers", ctx.write_multiple_registers(point.offset, many)).await
                    }
                }
            }
            (fc, dt) => Err(GatewayError::NotSupported(format!(
                "writing {} with function code {}",
                dt, fc
            ))),
        }
    }
}

#[async_trait]
impl DeviceDriver for ModbusDriver {
    fn kind(&self) -> &'static str {
        "modbus_tcp"
    }

    async fn connect(&self) -> DriverResult<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }
        let addr: SocketAddr = format!("{}:{}", self.settings.host, self.settings.port)
            .parse()
            .map_err(|e| GatewayError::Configuration(format!("invalid Modbus address: {}", e)))?;
        let ctx = timeout(
            Duration::from_millis(self.settings.connect_timeout_ms),
            tcp::connect(addr),
        )
        .await
        .map_err(|_| GatewayError::Timeout(format!("connecting to {}", addr)))?
        .map_err(|e| GatewayError::Connection(format!("{}: {}", addr, e)))?;
        info!(address = %addr, "Modbus session established");
        *session = Some(ctx);
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.session.lock().await.take();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    async fn read_many(&self, tags: &[Tag]) -> DriverResult<ReadResults> {
        let mut session = self.session.lock().await;
        let ctx = session
            .as_mut()
            .ok_or_else(|| GatewayError::Connection("Modbus session not established".to_string()))?;

        let mut results = HashMap::with_capacity(tags.len());
        let mut lost = None;
        for tag in tags {
            match self.read_tag(ctx, tag).await {
                Ok(value) => {
                    results.insert(tag.name.clone(), Some(value));
                }
                Err(e) if e.is_connection_loss() => {
                    lost = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(tag = %tag.name, address = %tag.address, error = %e, "Modbus read failed");
                    results.insert(tag.name.clone(), None);
                }
            }
        }
        if let Some(e) = lost {
            *session = None;
            return Err(e);
        }
        debug!(count = results.len(), "Modbus read");
        Ok(results)
    }

    async fn write_one(&self, tag: &Tag, value: &ValueVariant) -> DriverResult<()> {
        let value = coerce_value(tag, value)?;
        let mut session = self.session.lock().await;
        let ctx = session
            .as_mut()
            .ok_or_else(|| GatewayError::Connection("Modbus session not established".to_string()))?;
        let result = self.write_tag(ctx, tag, &value).await;
        if matches!(&result, Err(e) if e.is_connection_loss()) {
            *session = None;
        }
        result
    }
}
