//! Big-endian S7 value decoding and encoding.

use crate::drivers::s7::address::S7Item;
use crate::tags::structures::{DataType, ValueVariant};

/// Decode `item` from `buf`, where `rel` is the item's offset inside `buf`.
pub fn decode_item(item: &S7Item, buf: &[u8], rel: usize) -> Result<ValueVariant, String> {
    match item.data_type {
        DataType::Boolean => decode_bit(buf, rel, item.address.bit_offset).map(ValueVariant::Bool),
        DataType::String => decode_string(buf, rel).map(ValueVariant::String),
        data_type if item.is_array() => {
            let size = data_type.byte_size();
            (0..item.array_length)
                .map(|i| decode_scalar(data_type, buf, rel + i * size))
                .collect::<Result<Vec<_>, _>>()
                .map(ValueVariant::Array)
        }
        data_type => decode_scalar(data_type, buf, rel),
    }
}

/// `(buf[byte] >> bit) & 1`.
pub fn decode_bit(buf: &[u8], byte: usize, bit: u8) -> Result<bool, String> {
    let b = buf
        .get(byte)
        .ok_or_else(|| format!("bit at byte {} beyond buffer of {} bytes", byte, buf.len()))?;
    Ok((b >> bit) & 1 == 1)
}

/// S7 STRING: max-length byte, actual-length byte, then ASCII characters.
/// The character count is bounded by what the buffer actually holds.
pub fn decode_string(buf: &[u8], rel: usize) -> Result<String, String> {
    if rel + 2 > buf.len() {
        return Err(format!(
            "string header at {} beyond buffer of {} bytes",
            rel,
            buf.len()
        ));
    }
    let actual = buf[rel + 1] as usize;
    let available = buf.len() - rel - 2;
    let count = actual.min(available);
    Ok(buf[rel + 2..rel + 2 + count]
        .iter()
        .map(|&b| b as char)
        .collect())
}

pub fn decode_scalar(data_type: DataType, buf: &[u8], rel: usize) -> Result<ValueVariant, String> {
    let size = data_type.byte_size();
    let bytes = buf.get(rel..rel + size).ok_or_else(|| {
        format!(
            "{} at {} needs {} bytes, buffer has {}",
            data_type,
            rel,
            size,
            buf.len()
        )
    })?;
    let value = match data_type {
        DataType::Byte => ValueVariant::UInt(bytes[0] as u64),
        DataType::Int16 => ValueVariant::Int(i16::from_be_bytes([bytes[0], bytes[1]]) as i64),
        DataType::UInt16 => ValueVariant::UInt(u16::from_be_bytes([bytes[0], bytes[1]]) as u64),
        DataType::Int32 => ValueVariant::Int(i32::from_be_bytes(array4(bytes)) as i64),
        DataType::UInt32 => ValueVariant::UInt(u32::from_be_bytes(array4(bytes)) as u64),
        DataType::Float => ValueVariant::Float(f32::from_be_bytes(array4(bytes)) as f64),
        DataType::Int64 => ValueVariant::Int(i64::from_be_bytes(array8(bytes))),
        DataType::UInt64 => ValueVariant::UInt(u64::from_be_bytes(array8(bytes))),
        DataType::Double => ValueVariant::Float(f64::from_be_bytes(array8(bytes))),
        DataType::Boolean => ValueVariant::Bool(bytes[0] & 1 == 1),
        DataType::String => return Err("string is not a scalar".to_string()),
    };
    Ok(value)
}

fn array4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

fn array8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Encode an already-coerced value for a byte-level write. Booleans are
/// written as single bits by the transport and never reach this function.
pub fn encode_item(item: &S7Item, value: &ValueVariant) -> Result<Vec<u8>, String> {
    match (item.data_type, value) {
        (DataType::String, v) => {
            let text = v.as_text();
            if !text.is_ascii() {
                return Err(format!("'{}' contains non-ASCII characters", text));
            }
            let max = item.array_length.min(u8::MAX as usize);
            let bytes = text.as_bytes();
            if bytes.len() > max {
                return Err(format!("string of {} chars exceeds max length {}", bytes.len(), max));
            }
            let mut out = Vec::with_capacity(2 + bytes.len());
            out.push(max as u8);
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
            Ok(out)
        }
        (data_type, ValueVariant::Array(items)) => {
            let mut out = Vec::with_capacity(items.len() * data_type.byte_size());
            for v in items {
                out.extend(encode_scalar(data_type, v)?);
            }
            Ok(out)
        }
        (data_type, v) => encode_scalar(data_type, v),
    }
}

pub fn encode_scalar(data_type: DataType, value: &ValueVariant) -> Result<Vec<u8>, String> {
    let missing = || format!("cannot encode {:?} as {}", value, data_type);
    let bytes = match data_type {
        DataType::Boolean => vec![value.as_bool().ok_or_else(missing)? as u8],
        DataType::Byte => vec![value.as_u64().ok_or_else(missing)? as u8],
        DataType::Int16 => (value.as_i64().ok_or_else(missing)? as i16).to_be_bytes().to_vec(),
        DataType::UInt16 => (value.as_u64().ok_or_else(missing)? as u16).to_be_bytes().to_vec(),
        DataType::Int32 => (value.as_i64().ok_or_else(missing)? as i32).to_be_bytes().to_vec(),
        DataType::UInt32 => (value.as_u64().ok_or_else(missing)? as u32).to_be_bytes().to_vec(),
        DataType::Int64 => value.as_i64().ok_or_else(missing)?.to_be_bytes().to_vec(),
        DataType::UInt64 => value.as_u64().ok_or_else(missing)?.to_be_bytes().to_vec(),
        DataType::Float => (value.as_f64().ok_or_else(missing)? as f32).to_be_bytes().to_vec(),
        DataType::Double => value.as_f64().ok_or_else(missing)?.to_be_bytes().to_vec(),
        DataType::String => return Err("string is not a scalar".to_string()),
    };
    Ok(bytes)
}
