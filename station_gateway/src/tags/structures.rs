use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Represents the quality of a tag's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Quality {
    Good,
    #[default]
    Bad,
}

/// Declared data type of a tag on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    Boolean,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    String,
}

impl DataType {
    /// Width of one element in device memory. Strings report the width of
    /// one character; the header is accounted for by the drivers.
    pub fn byte_size(&self) -> usize {
        match self {
            DataType::Boolean | DataType::Byte | DataType::String => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Double => 8,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::Boolean | DataType::String)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Boolean => "bool",
            DataType::Byte => "byte",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::String => "string",
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" | "bit" => Ok(DataType::Boolean),
            "byte" | "uint8" => Ok(DataType::Byte),
            "int16" | "short" | "int" => Ok(DataType::Int16),
            "uint16" | "ushort" | "word" => Ok(DataType::UInt16),
            "int32" | "dint" => Ok(DataType::Int32),
            "uint32" | "dword" => Ok(DataType::UInt32),
            "int64" | "lint" => Ok(DataType::Int64),
            "uint64" | "lword" => Ok(DataType::UInt64),
            "float" | "real" | "single" => Ok(DataType::Float),
            "double" | "lreal" => Ok(DataType::Double),
            "string" => Ok(DataType::String),
            other => Err(format!("unknown data type '{}'", other)),
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Possible data types for a tag's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum ValueVariant {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Array(Vec<ValueVariant>),
    Json(serde_json::Value),
}

impl ValueVariant {
    pub fn is_null(&self) -> bool {
        matches!(self, ValueVariant::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ValueVariant::Bool(b) => Some(*b),
            ValueVariant::Int(i) => Some(*i != 0),
            ValueVariant::UInt(u) => Some(*u != 0),
            ValueVariant::Float(f) => Some(*f != 0.0),
            ValueVariant::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Some(true),
                "false" | "0" | "off" => Some(false),
                _ => None,
            },
            ValueVariant::Json(v) => v.as_bool(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ValueVariant::Bool(b) => Some(*b as i64),
            ValueVariant::Int(i) => Some(*i),
            ValueVariant::UInt(u) => i64::try_from(*u).ok(),
            ValueVariant::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            ValueVariant::String(s) => s.trim().parse().ok(),
            ValueVariant::Json(v) => v.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ValueVariant::Bool(b) => Some(*b as u64),
            ValueVariant::Int(i) => u64::try_from(*i).ok(),
            ValueVariant::UInt(u) => Some(*u),
            ValueVariant::Float(f) if f.fract() == 0.0 && *f >= 0.0 => Some(*f as u64),
            ValueVariant::String(s) => s.trim().parse().ok(),
            ValueVariant::Json(v) => v.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ValueVariant::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ValueVariant::Int(i) => Some(*i as f64),
            ValueVariant::UInt(u) => Some(*u as f64),
            ValueVariant::Float(f) => Some(*f),
            ValueVariant::String(s) => s.trim().parse().ok(),
            ValueVariant::Json(v) => v.as_f64(),
            _ => None,
        }
    }

    /// Text rendering used for string tags and trigger payloads.
    pub fn as_text(&self) -> String {
        match self {
            ValueVariant::Null => String::new(),
            ValueVariant::Bool(b) => b.to_string(),
            ValueVariant::Int(i) => i.to_string(),
            ValueVariant::UInt(u) => u.to_string(),
            ValueVariant::Float(f) => f.to_string(),
            ValueVariant::String(s) => s.clone(),
            ValueVariant::Array(_) => serde_json::to_string(self).unwrap_or_default(),
            ValueVariant::Json(v) => match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            ValueVariant::Null => false,
            ValueVariant::String(s) => !s.is_empty() && self.as_bool() != Some(false),
            ValueVariant::Array(items) => !items.is_empty(),
            ValueVariant::Json(v) => !v.is_null() && v.as_bool() != Some(false),
            other => other.as_bool().unwrap_or(false),
        }
    }
}

impl From<serde_json::Value> for ValueVariant {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ValueVariant::Null,
            serde_json::Value::Bool(b) => ValueVariant::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ValueVariant::Int(i)
                } else if let Some(u) = n.as_u64() {
                    ValueVariant::UInt(u)
                } else {
                    ValueVariant::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => ValueVariant::String(s),
            serde_json::Value::Array(items) => {
                ValueVariant::Array(items.into_iter().map(ValueVariant::from).collect())
            }
            obj @ serde_json::Value::Object(_) => ValueVariant::Json(obj),
        }
    }
}

/// Value, quality and timestamp of a tag as last observed by its channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagSnapshot {
    pub value: ValueVariant,
    pub quality: Quality,
    /// Unix timestamp milliseconds of the last successful read, 0 if never read.
    pub timestamp: u64,
}

impl TagSnapshot {
    pub fn good(value: ValueVariant) -> Self {
        TagSnapshot {
            value,
            quality: Quality::Good,
            timestamp: now_millis(),
        }
    }

    /// Bad quality keeps the timestamp of the last good read.
    pub fn bad(last_good: u64) -> Self {
        TagSnapshot {
            value: ValueVariant::Null,
            quality: Quality::Bad,
            timestamp: last_good,
        }
    }

    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good
    }
}

impl Default for TagSnapshot {
    fn default() -> Self {
        TagSnapshot::bad(0)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Represents a single tag in the system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tag {
    /// Unique, stable identifier.
    pub name: String,
    /// Protocol-specific address for this tag on the source device.
    pub address: String,
    pub data_type: DataType,
    /// Element count for arrays, character count for strings.
    pub array_length: usize,
    /// Name of the channel owning this tag.
    pub driver_code: String,
    /// Protocol-specific extension attributes (S7 `db`, Modbus `station_id`, ...).
    pub attributes: HashMap<String, String>,
}

impl Tag {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        data_type: DataType,
        driver_code: impl Into<String>,
    ) -> Self {
        Tag {
            name: name.into(),
            address: address.into(),
            data_type,
            array_length: 1,
            driver_code: driver_code.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_array_length(mut self, len: usize) -> Self {
        self.array_length = len.max(1);
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// Parse an attribute, `None` when absent and an error when malformed.
    pub fn parsed_attribute<T: FromStr>(&self, key: &str) -> Result<Option<T>, String> {
        match self.attribute(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| format!("tag '{}': invalid attribute {}='{}'", self.name, key, raw)),
        }
    }

    pub fn is_array(&self) -> bool {
        self.array_length > 1 && self.data_type != DataType::String
    }
}

/// Notification published when a poll observes a new value or quality.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagChangeEvent {
    pub tag: String,
    pub snapshot: TagSnapshot,
}
