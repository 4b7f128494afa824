//! Siemens S7 addressing: area, DB number, byte and bit offset.

use crate::error::{GatewayError, GatewayResult};
use crate::tags::structures::{DataType, Tag};
use std::fmt;
use std::str::FromStr;

/// S7 memory areas with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum S7Area {
    Inputs,
    Outputs,
    Merker,
    DataBlock,
}

impl S7Area {
    pub fn code(&self) -> u8 {
        match self {
            S7Area::Inputs => 0x81,
            S7Area::Outputs => 0x82,
            S7Area::Merker => 0x83,
            S7Area::DataBlock => 0x84,
        }
    }
}

impl FromStr for S7Area {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "I" | "E" | "PE" | "INPUT" | "INPUTS" => Ok(S7Area::Inputs),
            "Q" | "A" | "PA" | "OUTPUT" | "OUTPUTS" => Ok(S7Area::Outputs),
            "M" | "MK" | "MERKER" | "FLAGS" => Ok(S7Area::Merker),
            "DB" | "DATABLOCK" => Ok(S7Area::DataBlock),
            other => Err(format!("unknown S7 area '{}'", other)),
        }
    }
}

impl fmt::Display for S7Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            S7Area::Inputs => "I",
            S7Area::Outputs => "Q",
            S7Area::Merker => "M",
            S7Area::DataBlock => "DB",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct S7Address {
    pub area: S7Area,
    /// DB number, 0 outside the DB area.
    pub db: u16,
    pub byte_offset: u32,
    pub bit_offset: u8,
}

impl fmt::Display for S7Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.area {
            S7Area::DataBlock => write!(f, "DB{}.{}.{}", self.db, self.byte_offset, self.bit_offset),
            area => write!(f, "{}{}.{}", area, self.byte_offset, self.bit_offset),
        }
    }
}

/// Parse `DB1.DBX0.3`, `DB1.DBW4`, `DB10.12`, `M10.2`, `MW20`, `IB0`, `Q0.1`.
pub fn parse_address(raw: &str) -> Result<S7Address, String> {
    let text = raw.trim().to_ascii_uppercase();
    let err = || format!("invalid S7 address '{}'", raw);

    let (area, db, rest) = if let Some(after_db) = text.strip_prefix("DB") {
        let (db_part, rest) = after_db.split_once('.').ok_or_else(err)?;
        let db: u16 = db_part.parse().map_err(|_| err())?;
        let rest = rest.strip_prefix("DB").unwrap_or(rest);
        (S7Area::DataBlock, db, rest.to_string())
    } else {
        let mut chars = text.chars();
        let area = match chars.next() {
            Some('I') | Some('E') => S7Area::Inputs,
            Some('Q') | Some('A') => S7Area::Outputs,
            Some('M') => S7Area::Merker,
            _ => return Err(err()),
        };
        (area, 0, chars.as_str().to_string())
    };

    // Optional width marker; the declared data type decides the width.
    let rest = rest
        .strip_prefix(|c: char| matches!(c, 'X' | 'B' | 'W' | 'D' | 'S'))
        .unwrap_or(rest.as_str());
    let (byte_part, bit_part) = match rest.split_once('.') {
        Some((b, bit)) => (b, Some(bit)),
        None => (rest, None),
    };
    let byte_offset: u32 = byte_part.parse().map_err(|_| err())?;
    let bit_offset: u8 = match bit_part {
        Some(bit) => bit.parse().map_err(|_| err())?,
        None => 0,
    };
    if bit_offset > 7 {
        return Err(err());
    }
    Ok(S7Address {
        area,
        db,
        byte_offset,
        bit_offset,
    })
}

/// First byte offset past the reach of the 24-bit S7 bit address.
pub const ADDRESS_LIMIT: u32 = 1 << 21;

/// A tag resolved to its S7 location.
#[derive(Debug, Clone, PartialEq)]
pub struct S7Item {
    pub name: String,
    pub address: S7Address,
    pub data_type: DataType,
    pub array_length: usize,
    pub batch_group: Option<String>,
}

impl S7Item {
    /// Resolve a tag: the address string first, then attribute overrides
    /// (`area`, `db`, `byte_offset`, `bit_offset`, `batch_group`).
    pub fn resolve(tag: &Tag) -> GatewayResult<Self> {
        let config_err = GatewayError::Configuration;
        let mut address = if tag.address.trim().is_empty() {
            S7Address {
                area: S7Area::DataBlock,
                db: 0,
                byte_offset: 0,
                bit_offset: 0,
            }
        } else {
            parse_address(&tag.address).map_err(|e| config_err(format!("tag '{}': {}", tag.name, e)))?
        };

        if let Some(area) = tag.parsed_attribute::<S7Area>("area").map_err(config_err)? {
            address.area = area;
        }
        if let Some(db) = tag.parsed_attribute::<u16>("db").map_err(config_err)? {
            address.db = db;
        }
        if let Some(offset) = tag.parsed_attribute::<u32>("byte_offset").map_err(config_err)? {
            address.byte_offset = offset;
        }
        if let Some(bit) = tag.parsed_attribute::<u8>("bit_offset").map_err(config_err)? {
            if bit > 7 {
                return Err(config_err(format!("tag '{}': bit_offset {} out of range", tag.name, bit)));
            }
            address.bit_offset = bit;
        }
        if address.area != S7Area::DataBlock {
            address.db = 0;
        } else if address.db == 0 {
            return Err(config_err(format!("tag '{}': missing DB number", tag.name)));
        }

        let item = S7Item {
            name: tag.name.clone(),
            address,
            data_type: tag.data_type,
            array_length: tag.array_length.max(1),
            batch_group: tag.attribute("batch_group").map(|s| s.to_string()),
        };
        let end = u64::from(item.start()) + item.byte_len() as u64;
        if end > u64::from(ADDRESS_LIMIT) {
            return Err(config_err(format!(
                "tag '{}': {} bytes at offset {} exceed the S7 address range",
                tag.name,
                item.byte_len(),
                item.start()
            )));
        }
        Ok(item)
    }

    pub fn start(&self) -> u32 {
        self.address.byte_offset
    }

    /// Bytes this item occupies in device memory.
    pub fn byte_len(&self) -> usize {
        match self.data_type {
            DataType::Boolean => 1,
            DataType::String => self.array_length.saturating_add(2),
            other => other.byte_size().saturating_mul(self.array_length),
        }
    }

    pub fn end(&self) -> u32 {
        self.start() + self.byte_len() as u32
    }

    pub fn is_array(&self) -> bool {
        self.array_length > 1 && !matches!(self.data_type, DataType::String | DataType::Boolean)
    }
}
