//! String-based JSON protocol.
//!
//! A message is one JSON array: `[1,"name",type,seq,{...}]`. Structs are
//! objects keyed by field id with a one-entry type wrapper
//! (`{"1":{"str":"x"}}`), lists and sets are `["i32",3,1,2,3]`, maps are
//! `["str","i32",2,{"a":1,"b":2}]` and binary values are base64 strings.
//! Map keys are always JSON strings, so numeric keys are quoted.

use std::collections::VecDeque;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use super::{
    FieldHeader, InputProtocol, ListHeader, MapHeader, MessageHeader, MessageType, OutputProtocol,
    TType,
};
use crate::error::{ProtocolError, Result};
use crate::transport::{ReadTransport, WriteTransport};

const VERSION: i64 = 1;

fn type_name(ttype: TType) -> Result<&'static str> {
    Ok(match ttype {
        TType::Bool => "tf",
        TType::Byte => "i8",
        TType::I16 => "i16",
        TType::I32 => "i32",
        TType::I64 => "i64",
        TType::Double => "dbl",
        TType::String => "str",
        TType::Struct => "rec",
        TType::Map => "map",
        TType::Set => "set",
        TType::List => "lst",
        TType::Stop | TType::Void => {
            return Err(ProtocolError::InvalidData(format!(
                "{ttype:?} has no JSON name"
            )))
        }
    })
}

fn type_from_name(name: &str) -> Result<TType> {
    Ok(match name {
        "tf" => TType::Bool,
        "i8" => TType::Byte,
        "i16" => TType::I16,
        "i32" => TType::I32,
        "i64" => TType::I64,
        "dbl" => TType::Double,
        "str" => TType::String,
        "rec" => TType::Struct,
        "map" => TType::Map,
        "set" => TType::Set,
        "lst" => TType::List,
        other => return Err(ProtocolError::InvalidData(format!("unknown type name {other:?}"))),
    })
}

fn invalid(what: &str) -> ProtocolError {
    ProtocolError::InvalidData(what.to_string())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum WriteContext {
    Array { count: usize },
    Object { count: usize },
}

/// Encoder for the JSON protocol.
#[derive(Debug)]
pub struct JsonOutputProtocol<T> {
    transport: T,
    contexts: Vec<WriteContext>,
}

impl<T: WriteTransport> JsonOutputProtocol<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            contexts: Vec::new(),
        }
    }

    /// Writes the separator for the next value; returns whether it is an object key.
    fn separate(&mut self) -> bool {
        match self.contexts.last_mut() {
            None => false,
            Some(WriteContext::Array { count }) => {
                if *count > 0 {
                    self.transport.write_all(b",");
                }
                *count += 1;
                false
            }
            Some(WriteContext::Object { count }) => {
                let key = *count % 2 == 0;
                if *count > 0 {
                    self.transport.write_all(if key { b"," } else { b":" });
                }
                *count += 1;
                key
            }
        }
    }

    fn write_number(&mut self, text: &str) {
        if self.separate() {
            self.transport.write_all(b"\"");
            self.transport.write_all(text.as_bytes());
            self.transport.write_all(b"\"");
        } else {
            self.transport.write_all(text.as_bytes());
        }
    }

    fn write_json_string(&mut self, value: &str) -> Result<()> {
        let quoted = serde_json::to_string(value).map_err(|e| invalid(&e.to_string()))?;
        self.separate();
        self.transport.write_all(quoted.as_bytes());
        Ok(())
    }

    fn open(&mut self, bracket: &[u8], context: WriteContext) {
        self.separate();
        self.transport.write_all(bracket);
        self.contexts.push(context);
    }

    fn close(&mut self, bracket: &[u8]) -> Result<()> {
        self.contexts
            .pop()
            .ok_or_else(|| invalid("unbalanced JSON close"))?;
        self.transport.write_all(bracket);
        Ok(())
    }

    fn open_array(&mut self) {
        self.open(b"[", WriteContext::Array { count: 0 });
    }

    fn open_object(&mut self) {
        self.open(b"{", WriteContext::Object { count: 0 });
    }
}

impl<T: WriteTransport> OutputProtocol for JsonOutputProtocol<T> {
    fn write_message_begin(&mut self, header: &MessageHeader) -> Result<()> {
        self.open_array();
        self.write_number(&VERSION.to_string());
        self.write_json_string(&header.name)?;
        self.write_number(&header.message_type.as_u8().to_string());
        self.write_number(&header.seq_id.to_string());
        Ok(())
    }

    fn write_message_end(&mut self) -> Result<()> {
        self.close(b"]")
    }

    fn write_struct_begin(&mut self, _name: &str) -> Result<()> {
        self.open_object();
        Ok(())
    }

    fn write_struct_end(&mut self) -> Result<()> {
        self.close(b"}")
    }

    fn write_field_begin(&mut self, _name: &str, header: FieldHeader) -> Result<()> {
        self.write_json_string(&header.id.to_string())?;
        self.open_object();
        self.write_json_string(type_name(header.field_type)?)
    }

    fn write_field_end(&mut self) -> Result<()> {
        self.close(b"}")
    }

    fn write_field_stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_list_begin(&mut self, header: ListHeader) -> Result<()> {
        self.open_array();
        self.write_json_string(type_name(header.element_type)?)?;
        self.write_number(&header.size.to_string());
        Ok(())
    }

    fn write_list_end(&mut self) -> Result<()> {
        self.close(b"]")
    }

    fn write_set_begin(&mut self, header: ListHeader) -> Result<()> {
        self.write_list_begin(header)
    }

    fn write_set_end(&mut self) -> Result<()> {
        self.close(b"]")
    }

    fn write_map_begin(&mut self, header: MapHeader) -> Result<()> {
        self.open_array();
        self.write_json_string(type_name(header.key_type)?)?;
        self.write_json_string(type_name(header.value_type)?)?;
        self.write_number(&header.size.to_string());
        self.open_object();
        Ok(())
    }

    fn write_map_end(&mut self) -> Result<()> {
        self.close(b"}")?;
        self.close(b"]")
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_number(if value { "1" } else { "0" });
        Ok(())
    }

    fn write_byte(&mut self, value: i8) -> Result<()> {
        self.write_number(&value.to_string());
        Ok(())
    }

    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_number(&value.to_string());
        Ok(())
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_number(&value.to_string());
        Ok(())
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_number(&value.to_string());
        Ok(())
    }

    fn write_double(&mut self, value: f64) -> Result<()> {
        if value.is_nan() {
            self.write_json_string("NaN")
        } else if value.is_infinite() {
            self.write_json_string(if value > 0.0 { "Infinity" } else { "-Infinity" })
        } else {
            let text = serde_json::to_string(&value).map_err(|e| invalid(&e.to_string()))?;
            self.write_number(&text);
            Ok(())
        }
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_json_string(value)
    }

    fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        self.write_json_string(&STANDARD.encode(value))
    }

    fn flush(&mut self) -> Result<()> {
        self.transport.flush()
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ReadScope {
    /// Message body, list/set elements, or alternating map keys and values.
    Sequence(VecDeque<Value>),
    /// Remaining fields of a struct.
    Struct(VecDeque<(FieldHeader, Value)>),
}

/// Decoder for the JSON protocol.
///
/// The whole message is parsed when its header is read; a message that is
/// not yet complete in the transport yields `Underrun` at that point.
#[derive(Debug)]
pub struct JsonInputProtocol<T> {
    transport: T,
    scopes: Vec<ReadScope>,
    pending: Option<Value>,
}

impl<T: ReadTransport> JsonInputProtocol<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            scopes: Vec::new(),
            pending: None,
        }
    }

    fn parse_document(&mut self) -> Result<Value> {
        let (value, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(self.transport.chunk()).into_iter::<Value>();
            let value = match stream.next() {
                None => return Err(ProtocolError::Underrun),
                Some(Err(e)) if e.is_eof() => return Err(ProtocolError::Underrun),
                Some(Err(e)) => return Err(invalid(&e.to_string())),
                Some(Ok(value)) => value,
            };
            (value, stream.byte_offset())
        };
        self.transport.advance(consumed);
        Ok(value)
    }

    fn next_value(&mut self) -> Result<Value> {
        if let Some(value) = self.pending.take() {
            return Ok(value);
        }
        match self.scopes.last_mut() {
            Some(ReadScope::Sequence(values)) => values
                .pop_front()
                .ok_or_else(|| invalid("unexpected end of sequence")),
            Some(ReadScope::Struct(_)) => Err(invalid("value read outside a field")),
            None => self.parse_document(),
        }
    }

    fn next_array(&mut self) -> Result<VecDeque<Value>> {
        match self.next_value()? {
            Value::Array(items) => Ok(items.into()),
            _ => Err(invalid("expected JSON array")),
        }
    }

    fn close_scope(&mut self) -> Result<()> {
        self.scopes
            .pop()
            .map(drop)
            .ok_or_else(|| invalid("unbalanced scope end"))
    }

    fn next_i64(&mut self) -> Result<i64> {
        as_i64(&self.next_value()?)
    }
}

fn as_i64(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| invalid("expected integer")),
        Value::String(s) => s.parse().map_err(|_| invalid("expected integer")),
        Value::Bool(b) => Ok(i64::from(*b)),
        _ => Err(invalid("expected integer")),
    }
}

fn as_str(value: &Value) -> Result<&str> {
    value.as_str().ok_or_else(|| invalid("expected string"))
}

fn as_size(value: &Value) -> Result<usize> {
    let raw = as_i64(value)?;
    usize::try_from(raw).map_err(|_| ProtocolError::NegativeSize(i32::try_from(raw).unwrap_or(i32::MIN)))
}

fn pop(items: &mut VecDeque<Value>) -> Result<Value> {
    items
        .pop_front()
        .ok_or_else(|| invalid("truncated JSON header"))
}

impl<T: ReadTransport> InputProtocol for JsonInputProtocol<T> {
    fn read_message_begin(&mut self) -> Result<MessageHeader> {
        let mut items = match self.parse_document()? {
            Value::Array(items) => VecDeque::from(items),
            _ => return Err(invalid("message must be a JSON array")),
        };

        let version = as_i64(&pop(&mut items)?)?;
        if version != VERSION {
            return Err(ProtocolError::BadVersion(
                u32::try_from(version).unwrap_or(u32::MAX),
            ));
        }
        let name = as_str(&pop(&mut items)?)?.to_string();
        let raw_type = u8::try_from(as_i64(&pop(&mut items)?)?)
            .map_err(|_| invalid("message type out of range"))?;
        let message_type = MessageType::from_u8(raw_type)?;
        let seq_id = i32::try_from(as_i64(&pop(&mut items)?)?)
            .map_err(|_| invalid("sequence id out of range"))?;

        self.scopes.clear();
        self.pending = None;
        self.scopes.push(ReadScope::Sequence(items));
        Ok(MessageHeader {
            name,
            message_type,
            seq_id,
        })
    }

    fn read_message_end(&mut self) -> Result<()> {
        self.close_scope()
    }

    fn read_struct_begin(&mut self) -> Result<()> {
        let Value::Object(map) = self.next_value()? else {
            return Err(invalid("struct must be a JSON object"));
        };
        let mut fields = VecDeque::with_capacity(map.len());
        for (key, wrapped) in map {
            let id: i16 = key.parse().map_err(|_| invalid("field id must be numeric"))?;
            let Value::Object(inner) = wrapped else {
                return Err(invalid("field value must be a typed object"));
            };
            let mut entries = inner.into_iter();
            let (Some((name, value)), None) = (entries.next(), entries.next()) else {
                return Err(invalid("field value must have exactly one type entry"));
            };
            fields.push_back((FieldHeader::new(type_from_name(&name)?, id), value));
        }
        self.scopes.push(ReadScope::Struct(fields));
        Ok(())
    }

    fn read_struct_end(&mut self) -> Result<()> {
        self.close_scope()
    }

    fn read_field_begin(&mut self) -> Result<FieldHeader> {
        let Some(ReadScope::Struct(fields)) = self.scopes.last_mut() else {
            return Err(invalid("field read outside a struct"));
        };
        match fields.pop_front() {
            Some((header, value)) => {
                self.pending = Some(value);
                Ok(header)
            }
            None => Ok(FieldHeader::stop()),
        }
    }

    fn read_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_list_begin(&mut self) -> Result<ListHeader> {
        let mut items = self.next_array()?;
        let element_type = type_from_name(as_str(&pop(&mut items)?)?)?;
        let size = as_size(&pop(&mut items)?)?;
        if size != items.len() {
            return Err(invalid("list size does not match element count"));
        }
        self.scopes.push(ReadScope::Sequence(items));
        Ok(ListHeader { element_type, size })
    }

    fn read_list_end(&mut self) -> Result<()> {
        self.close_scope()
    }

    fn read_set_begin(&mut self) -> Result<ListHeader> {
        self.read_list_begin()
    }

    fn read_set_end(&mut self) -> Result<()> {
        self.close_scope()
    }

    fn read_map_begin(&mut self) -> Result<MapHeader> {
        let mut items = self.next_array()?;
        let key_type = type_from_name(as_str(&pop(&mut items)?)?)?;
        let value_type = type_from_name(as_str(&pop(&mut items)?)?)?;
        let size = as_size(&pop(&mut items)?)?;
        let Value::Object(map) = pop(&mut items)? else {
            return Err(invalid("map entries must be a JSON object"));
        };
        if size != map.len() {
            return Err(invalid("map size does not match entry count"));
        }
        let mut flat = VecDeque::with_capacity(map.len() * 2);
        for (key, value) in map {
            flat.push_back(Value::String(key));
            flat.push_back(value);
        }
        self.scopes.push(ReadScope::Sequence(flat));
        Ok(MapHeader {
            key_type,
            value_type,
            size,
        })
    }

    fn read_map_end(&mut self) -> Result<()> {
        self.close_scope()
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.next_i64()? != 0)
    }

    fn read_byte(&mut self) -> Result<i8> {
        i8::try_from(self.next_i64()?).map_err(|_| invalid("byte out of range"))
    }

    fn read_i16(&mut self) -> Result<i16> {
        i16::try_from(self.next_i64()?).map_err(|_| invalid("i16 out of range"))
    }

    fn read_i32(&mut self) -> Result<i32> {
        i32::try_from(self.next_i64()?).map_err(|_| invalid("i32 out of range"))
    }

    fn read_i64(&mut self) -> Result<i64> {
        self.next_i64()
    }

    fn read_double(&mut self) -> Result<f64> {
        match self.next_value()? {
            Value::Number(n) => n.as_f64().ok_or_else(|| invalid("expected double")),
            Value::String(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => other.parse().map_err(|_| invalid("expected double")),
            },
            _ => Err(invalid("expected double")),
        }
    }

    fn read_string(&mut self) -> Result<String> {
        match self.next_value()? {
            Value::String(s) => Ok(s),
            _ => Err(invalid("expected string")),
        }
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let encoded = self.read_string()?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| invalid(&e.to_string()))
    }

    fn skip_string(&mut self) -> Result<()> {
        self.read_string().map(drop)
    }
}
