pub mod factory;
pub mod inkjet;
pub mod modbus;
pub mod s7;
pub mod simulation;
pub mod traits;

use crate::error::{GatewayError, GatewayResult};
use crate::tags::structures::{DataType, Tag, ValueVariant};

/// Convert a caller-supplied value to the tag's declared type before a write.
pub fn coerce_value(tag: &Tag, value: &ValueVariant) -> GatewayResult<ValueVariant> {
    if tag.is_array() {
        let items = match value {
            ValueVariant::Array(items) => items,
            _ => {
                return Err(GatewayError::InvalidValue(format!(
                    "tag '{}' expects an array of {} elements",
                    tag.name, tag.array_length
                )))
            }
        };
        if items.len() > tag.array_length {
            return Err(GatewayError::InvalidValue(format!(
                "tag '{}' holds {} elements, got {}",
                tag.name,
                tag.array_length,
                items.len()
            )));
        }
        return items
            .iter()
            .map(|v| coerce_scalar(&tag.name, tag.data_type, v))
            .collect::<GatewayResult<Vec<_>>>()
            .map(ValueVariant::Array);
    }
    coerce_scalar(&tag.name, tag.data_type, value)
}

fn coerce_scalar(name: &str, data_type: DataType, value: &ValueVariant) -> GatewayResult<ValueVariant> {
    let invalid = || {
        GatewayError::InvalidValue(format!(
            "tag '{}': cannot convert {:?} to {}",
            name, value, data_type
        ))
    };
    let signed = |min: i64, max: i64| -> GatewayResult<ValueVariant> {
        let v = value.as_i64().ok_or_else(invalid)?;
        if v < min || v > max {
            return Err(invalid());
        }
        Ok(ValueVariant::Int(v))
    };
    let unsigned = |max: u64| -> GatewayResult<ValueVariant> {
        let v = value.as_u64().ok_or_else(invalid)?;
        if v > max {
            return Err(invalid());
        }
        Ok(ValueVariant::UInt(v))
    };

    match data_type {
        DataType::Boolean => value.as_bool().map(ValueVariant::Bool).ok_or_else(invalid),
        DataType::Byte => unsigned(u8::MAX as u64),
        DataType::Int16 => signed(i16::MIN as i64, i16::MAX as i64),
        DataType::UInt16 => unsigned(u16::MAX as u64),
        DataType::Int32 => signed(i32::MIN as i64, i32::MAX as i64),
        DataType::UInt32 => unsigned(u32::MAX as u64),
        DataType::Int64 => signed(i64::MIN, i64::MAX),
        DataType::UInt64 => unsigned(u64::MAX),
        DataType::Float | DataType::Double => {
            value.as_f64().map(ValueVariant::Float).ok_or_else(invalid)
        }
        DataType::String => match value {
            ValueVariant::Null | ValueVariant::Array(_) => Err(invalid()),
            other => Ok(ValueVariant::String(other.as_text())),
        },
    }
}
