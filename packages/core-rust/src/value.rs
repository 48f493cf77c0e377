//! Dynamic structured value used for call arguments and results.

use std::collections::BTreeMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::{
    FieldHeader, InputProtocol, ListHeader, MapHeader, OutputProtocol, TType, MAX_SKIP_DEPTH,
};

/// Fields of a struct keyed by field id.
pub type Fields = BTreeMap<i16, Value>;

/// A value of any wire type.
///
/// String-typed wire values are always read as [`Value::String`]; handlers
/// that produce raw bytes use [`Value::Binary`] on the write side.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    Struct(Fields),
    List {
        element_type: TType,
        items: Vec<Value>,
    },
    Set {
        element_type: TType,
        items: Vec<Value>,
    },
    Map {
        key_type: TType,
        value_type: TType,
        entries: Vec<(Value, Value)>,
    },
}

impl Value {
    /// Empty struct.
    #[must_use]
    pub fn empty_struct() -> Self {
        Self::Struct(Fields::new())
    }

    /// Wire type of this value.
    #[must_use]
    pub fn ttype(&self) -> TType {
        match self {
            Self::Bool(_) => TType::Bool,
            Self::Byte(_) => TType::Byte,
            Self::I16(_) => TType::I16,
            Self::I32(_) => TType::I32,
            Self::I64(_) => TType::I64,
            Self::Double(_) => TType::Double,
            Self::String(_) | Self::Binary(_) => TType::String,
            Self::Struct(_) => TType::Struct,
            Self::List { .. } => TType::List,
            Self::Set { .. } => TType::Set,
            Self::Map { .. } => TType::Map,
        }
    }

    /// Field `id` of a struct value.
    #[must_use]
    pub fn field(&self, id: i16) -> Option<&Value> {
        match self {
            Self::Struct(fields) => fields.get(&id),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Byte(v) => Some(i32::from(*v)),
            Self::I16(v) => Some(i32::from(*v)),
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            other => other.as_i32().map(i64::from),
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads one value of type `ttype`.
    ///
    /// # Errors
    ///
    /// Propagates protocol errors; `DepthLimit` for overly nested input.
    pub fn read(input: &mut dyn InputProtocol, ttype: TType) -> Result<Self> {
        read_depth(input, ttype, MAX_SKIP_DEPTH)
    }

    /// Reads a struct body into its fields.
    ///
    /// # Errors
    ///
    /// Propagates protocol errors.
    pub fn read_struct(input: &mut dyn InputProtocol) -> Result<Fields> {
        read_fields(input, MAX_SKIP_DEPTH)
    }

    /// Writes this value (no field header).
    ///
    /// # Errors
    ///
    /// Propagates protocol errors.
    pub fn write(&self, output: &mut dyn OutputProtocol) -> Result<()> {
        match self {
            Self::Bool(v) => output.write_bool(*v),
            Self::Byte(v) => output.write_byte(*v),
            Self::I16(v) => output.write_i16(*v),
            Self::I32(v) => output.write_i32(*v),
            Self::I64(v) => output.write_i64(*v),
            Self::Double(v) => output.write_double(*v),
            Self::String(v) => output.write_string(v),
            Self::Binary(v) => output.write_binary(v),
            Self::Struct(fields) => write_struct("", fields, output),
            Self::List {
                element_type,
                items,
            } => {
                output.write_list_begin(ListHeader {
                    element_type: *element_type,
                    size: items.len(),
                })?;
                items.iter().try_for_each(|item| item.write(output))?;
                output.write_list_end()
            }
            Self::Set {
                element_type,
                items,
            } => {
                output.write_set_begin(ListHeader {
                    element_type: *element_type,
                    size: items.len(),
                })?;
                items.iter().try_for_each(|item| item.write(output))?;
                output.write_set_end()
            }
            Self::Map {
                key_type,
                value_type,
                entries,
            } => {
                output.write_map_begin(MapHeader {
                    key_type: *key_type,
                    value_type: *value_type,
                    size: entries.len(),
                })?;
                for (key, value) in entries {
                    key.write(output)?;
                    value.write(output)?;
                }
                output.write_map_end()
            }
        }
    }
}

/// Writes `fields` as a struct named `name`.
///
/// # Errors
///
/// Propagates protocol errors.
pub fn write_struct(name: &str, fields: &Fields, output: &mut dyn OutputProtocol) -> Result<()> {
    output.write_struct_begin(name)?;
    for (id, value) in fields {
        output.write_field_begin("", FieldHeader::new(value.ttype(), *id))?;
        value.write(output)?;
        output.write_field_end()?;
    }
    output.write_field_stop()?;
    output.write_struct_end()
}

fn read_fields(input: &mut dyn InputProtocol, depth: usize) -> Result<Fields> {
    let mut fields = Fields::new();
    input.read_struct_begin()?;
    loop {
        let field = input.read_field_begin()?;
        if field.field_type == TType::Stop {
            break;
        }
        fields.insert(field.id, read_depth(input, field.field_type, depth - 1)?);
        input.read_field_end()?;
    }
    input.read_struct_end()?;
    Ok(fields)
}

fn read_items(
    input: &mut dyn InputProtocol,
    header: ListHeader,
    depth: usize,
) -> Result<Vec<Value>> {
    (0..header.size)
        .map(|_| read_depth(input, header.element_type, depth - 1))
        .collect()
}

fn read_depth(input: &mut dyn InputProtocol, ttype: TType, depth: usize) -> Result<Value> {
    if depth == 0 {
        return Err(ProtocolError::DepthLimit);
    }
    Ok(match ttype {
        TType::Bool => Value::Bool(input.read_bool()?),
        TType::Byte => Value::Byte(input.read_byte()?),
        TType::I16 => Value::I16(input.read_i16()?),
        TType::I32 => Value::I32(input.read_i32()?),
        TType::I64 => Value::I64(input.read_i64()?),
        TType::Double => Value::Double(input.read_double()?),
        TType::String => Value::String(input.read_string()?),
        TType::Struct => Value::Struct(read_fields(input, depth)?),
        TType::List => {
            let header = input.read_list_begin()?;
            let items = read_items(input, header, depth)?;
            input.read_list_end()?;
            Value::List {
                element_type: header.element_type,
                items,
            }
        }
        TType::Set => {
            let header = input.read_set_begin()?;
            let items = read_items(input, header, depth)?;
            input.read_set_end()?;
            Value::Set {
                element_type: header.element_type,
                items,
            }
        }
        TType::Map => {
            let header = input.read_map_begin()?;
            let entries = (0..header.size)
                .map(|_| {
                    let key = read_depth(input, header.key_type, depth - 1)?;
                    let value = read_depth(input, header.value_type, depth - 1)?;
                    Ok((key, value))
                })
                .collect::<Result<Vec<_>>>()?;
            input.read_map_end()?;
            Value::Map {
                key_type: header.key_type,
                value_type: header.value_type,
                entries,
            }
        }
        TType::Stop | TType::Void => {
            return Err(ProtocolError::InvalidData(format!(
                "{ttype:?} is not a value type"
            )))
        }
    })
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Fields> for Value {
    fn from(v: Fields) -> Self {
        Self::Struct(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolKind;
    use crate::transport::{ReadBuffer, TransportKind};

    fn sample() -> Value {
        let mut inner = Fields::new();
        inner.insert(1, Value::from("name"));
        inner.insert(3, Value::I64(-5));

        let mut fields = Fields::new();
        fields.insert(1, Value::Struct(inner));
        fields.insert(
            2,
            Value::List {
                element_type: TType::I32,
                items: vec![Value::I32(1), Value::I32(2)],
            },
        );
        fields.insert(
            4,
            Value::Map {
                key_type: TType::String,
                value_type: TType::Bool,
                entries: vec![(Value::from("a"), Value::Bool(true))],
            },
        );
        fields.insert(5, Value::Double(0.25));
        Value::Struct(fields)
    }

    #[test]
    fn nested_struct_round_trips_through_each_protocol() {
        let value = sample();
        for kind in [ProtocolKind::Binary, ProtocolKind::Json] {
            let mut out = TransportKind::Buffered.output_buffer();
            {
                let mut proto = kind.output(&mut out);
                value.write(proto.as_mut()).unwrap();
                proto.flush().unwrap();
            }
            let mut buf = ReadBuffer::new();
            buf.push(&out.take_flushed());
            let mut proto = kind.input(&mut buf);
            let decoded = Value::read(proto.as_mut(), TType::Struct).unwrap();
            assert_eq!(decoded, value, "{kind:?}");
        }
    }

    #[test]
    fn accessors() {
        let value = sample();
        assert_eq!(
            value.field(1).and_then(|v| v.field(1)).and_then(Value::as_str),
            Some("name")
        );
        assert_eq!(value.field(1).and_then(|v| v.field(3)).and_then(Value::as_i64), Some(-5));
        assert_eq!(Value::Byte(3).as_i32(), Some(3));
        assert!(value.field(9).is_none());
    }

    #[test]
    fn huge_declared_map_size_is_underrun_not_allocation() {
        let mut buf = ReadBuffer::new();
        // Struct field 1: map<i32, i32> claiming i32::MAX entries, none present.
        buf.push(&[13, 0, 1, 8, 8, 0x7f, 0xff, 0xff, 0xff]);
        let mut proto = ProtocolKind::Binary.input(&mut buf);
        assert_eq!(
            Value::read_struct(proto.as_mut()),
            Err(ProtocolError::Underrun)
        );
    }

    #[test]
    fn huge_declared_list_size_is_underrun() {
        let mut buf = ReadBuffer::new();
        buf.push(&[15, 0, 1, 8, 0x7f, 0xff, 0xff, 0xff, 0, 0, 0, 1]);
        let mut proto = ProtocolKind::Binary.input(&mut buf);
        assert_eq!(
            Value::read_struct(proto.as_mut()),
            Err(ProtocolError::Underrun)
        );
    }

    #[test]
    fn stop_is_not_a_value() {
        let mut buf = ReadBuffer::new();
        let mut proto = ProtocolKind::Binary.input(&mut buf);
        assert!(Value::read(proto.as_mut(), TType::Stop).is_err());
    }
}
