//! Driver for the WSDOM inkjet printer's length-prefixed JSON protocol.
//!
//! The device has no request ids, so one socket carries one exchange at a
//! time behind the session mutex. Polled commands are answered from a
//! per-command cache while fresh.

pub mod cache;
pub mod frame;

use crate::drivers::coerce_value;
use crate::drivers::inkjet::cache::ResponseCache;
use crate::drivers::inkjet::frame::{read_frame, write_frame, InkjetRequest, InkjetResponse};
use crate::drivers::traits::{DeviceDriver, DriverResult, ReadResults};
use crate::error::GatewayError;
use crate::tags::structures::{DataType, Tag, ValueVariant};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const CMD_STATUS: &str = "get_status";
pub const CMD_JOBS: &str = "get_job_list";
pub const CMD_FLASH: &str = "flash";
pub const CMD_UPDATE_JOB: &str = "update_job";
pub const CMD_PRINT_START: &str = "print_start";
pub const CMD_PRINT_STOP: &str = "print_stop";

fn default_timeout_ms() -> u64 {
    3000
}
fn default_refresh_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct InkjetSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Freshness window for cached polling commands.
    #[serde(default = "default_refresh_ms")]
    pub cache_refresh_ms: u64,
    /// Per-command windows overriding `cache_refresh_ms`.
    #[serde(default)]
    pub command_refresh_ms: HashMap<String, u64>,
}

impl InkjetSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        InkjetSettings {
            host: host.into(),
            port,
            connect_timeout_ms: default_timeout_ms(),
            io_timeout_ms: default_timeout_ms(),
            cache_refresh_ms: default_refresh_ms(),
            command_refresh_ms: HashMap::new(),
        }
    }
}

/// Read address: a polled command plus an optional JSON pointer into its
/// response data (`status/state` → command `get_status`, pointer `/state`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTarget {
    pub command: &'static str,
    pub pointer: Option<String>,
}

pub fn parse_read_address(address: &str) -> Result<ReadTarget, String> {
    let trimmed = address.trim().trim_start_matches('/');
    let (head, rest) = match trimmed.split_once('/') {
        Some((h, r)) => (h, Some(r)),
        None => (trimmed, None),
    };
    let command = match head.to_ascii_lowercase().as_str() {
        "status" => CMD_STATUS,
        "jobs" => CMD_JOBS,
        other => return Err(format!("'{}' is not a readable inkjet address", other)),
    };
    Ok(ReadTarget {
        command,
        pointer: rest.filter(|r| !r.is_empty()).map(|r| format!("/{}", r)),
    })
}

pub fn write_command(address: &str) -> Result<&'static str, String> {
    match address.trim().to_ascii_lowercase().as_str() {
        "flash" => Ok(CMD_FLASH),
        "job" => Ok(CMD_UPDATE_JOB),
        "print_start" => Ok(CMD_PRINT_START),
        "print_stop" => Ok(CMD_PRINT_STOP),
        other => Err(format!("'{}' is not a writable inkjet address", other)),
    }
}

/// Turn a written value into the request's `data`. Strings must hold JSON;
/// structured values are used as-is.
pub fn write_payload(command: &str, value: &ValueVariant) -> DriverResult<Option<serde_json::Value>> {
    let data = match value {
        ValueVariant::Null => None,
        ValueVariant::String(text) if text.trim().is_empty() => None,
        ValueVariant::String(text) => Some(serde_json::from_str::<serde_json::Value>(text).map_err(|e| {
            GatewayError::InvalidValue(format!("{} payload is not valid JSON: {}", command, e))
        })?),
        ValueVariant::Json(v) => Some(v.clone()),
        other => Some(serde_json::to_value(other)?),
    };
    if command == CMD_UPDATE_JOB && !matches!(data, Some(serde_json::Value::Object(_))) {
        return Err(GatewayError::InvalidValue(
            "job update requires a JSON object".to_string(),
        ));
    }
    Ok(data)
}

fn to_tag_value(tag: &Tag, json: serde_json::Value) -> Result<ValueVariant, String> {
    if json.is_null() {
        return Err("no value at address".to_string());
    }
    if tag.data_type == DataType::String {
        return Ok(ValueVariant::String(ValueVariant::Json(json).as_text()));
    }
    coerce_value(tag, &ValueVariant::from(json)).map_err(|e| e.to_string())
}

pub struct InkjetDriver {
    settings: InkjetSettings,
    session: Mutex<Option<TcpStream>>,
    cache: ResponseCache,
}

impl InkjetDriver {
    pub fn new(settings: InkjetSettings) -> Self {
        let mut cache = ResponseCache::new(Duration::from_millis(settings.cache_refresh_ms));
        for (command, ms) in &settings.command_refresh_ms {
            cache = cache.with_override(command.clone(), Duration::from_millis(*ms));
        }
        InkjetDriver {
            settings,
            session: Mutex::new(None),
            cache,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.settings.host, self.settings.port)
    }

    async fn open(&self, session: &mut Option<TcpStream>) -> DriverResult<()> {
        if session.is_some() {
            return Ok(());
        }
        let addr = self.address();
        let stream = timeout(
            Duration::from_millis(self.settings.connect_timeout_ms),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| GatewayError::Timeout(format!("connecting to {}", addr)))?
        .map_err(|e| GatewayError::Connection(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        info!(address = %addr, "Inkjet session established");
        *session = Some(stream);
        Ok(())
    }

    /// One request/response exchange. Any transport failure drops the socket
    /// so the next call reconnects.
    pub async fn execute(&self, request: InkjetRequest) -> DriverResult<serde_json::Value> {
        let mut session = self.session.lock().await;
        self.open(&mut session).await?;
        let io_timeout = Duration::from_millis(self.settings.io_timeout_ms);
        let command = request.command.clone();

        let exchange = async {
            let stream = session
                .as_mut()
                .ok_or_else(|| GatewayError::Connection("inkjet session not established".to_string()))?;
            write_frame(stream, &request).await?;
            let body = read_frame(stream).await?;
            let response: InkjetResponse = serde_json::from_slice(&body)
                .map_err(|e| GatewayError::Connection(format!("malformed response to {}: {}", command, e)))?;
            Ok::<_, GatewayError>(response)
        };
        let response = match timeout(io_timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                *session = None;
                return Err(e);
            }
            Err(_) => {
                *session = None;
                return Err(GatewayError::Timeout(format!(
                    "{} got no response within {} ms",
                    command,
                    io_timeout.as_millis()
                )));
            }
        };
        debug!(command = %command, code = response.code, "Inkjet exchange");
        response.into_result()
    }

    /// Response data for a polled command, served from cache while fresh.
    pub async fn query(&self, command: &str) -> DriverResult<serde_json::Value> {
        if let Some(hit) = self.cache.get(command) {
            return Ok(hit);
        }
        let data = self.execute(InkjetRequest::new(command)).await?;
        self.cache.put(command, data.clone());
        Ok(data)
    }
}

#[async_trait]
impl DeviceDriver for InkjetDriver {
    fn kind(&self) -> &'static str {
        "wsdom_inkjet"
    }

    async fn connect(&self) -> DriverResult<()> {
        let mut session = self.session.lock().await;
        self.open(&mut session).await
    }

    async fn disconnect(&self) -> DriverResult<()> {
        self.session.lock().await.take();
        self.cache.clear();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    async fn read_many(&self, tags: &[Tag]) -> DriverResult<ReadResults> {
        let mut results = HashMap::with_capacity(tags.len());
        let mut responses: HashMap<&'static str, Option<serde_json::Value>> = HashMap::new();
        for tag in tags {
            let target = match parse_read_address(&tag.address) {
                Ok(t) => t,
                Err(e) => {
                    warn!(tag = %tag.name, error = %e, "Unreadable inkjet tag");
                    results.insert(tag.name.clone(), None);
                    continue;
                }
            };
            if !responses.contains_key(target.command) {
                let data = match self.query(target.command).await {
                    Ok(data) => Some(data),
                    Err(e) if e.is_connection_loss() => return Err(e),
                    Err(e) => {
                        warn!(command = target.command, error = %e, "Inkjet query failed");
                        None
                    }
                };
                responses.insert(target.command, data);
            }
            let value = responses
                .get(target.command)
                .and_then(|d| d.as_ref())
                .and_then(|data| match &target.pointer {
                    Some(p) => data.pointer(p).cloned(),
                    None => Some(data.clone()),
                })
                .and_then(|json| {
                    to_tag_value(tag, json)
                        .map_err(|e| warn!(tag = %tag.name, error = %e, "Inkjet decode failed"))
                        .ok()
                });
            results.insert(tag.name.clone(), value);
        }
        Ok(results)
    }

    async fn write_one(&self, tag: &Tag, value: &ValueVariant) -> DriverResult<()> {
        let command = write_command(&tag.address).map_err(GatewayError::NotSupported)?;
        let mut request = InkjetRequest::new(command);
        if let Some(data) = write_payload(command, value)? {
            request = request.with_data(data);
        }
        self.execute(request).await?;
        self.cache.invalidate(CMD_STATUS);
        if command == CMD_UPDATE_JOB {
            self.cache.invalidate(CMD_JOBS);
        }
        Ok(())
    }
}
