//! Structured-data protocol interfaces and the two wire encodings.
//!
//! Processors only ever see `dyn InputProtocol` / `dyn OutputProtocol`, so the
//! encoding is chosen per route at configuration time via [`ProtocolKind`].

pub mod binary;
pub mod json;

use serde::{Deserialize, Serialize};

pub use binary::{BinaryInputProtocol, BinaryOutputProtocol};
pub use json::{JsonInputProtocol, JsonOutputProtocol};

use crate::error::{ProtocolError, Result};
use crate::transport::{ReadTransport, WriteTransport};

/// Nesting bound applied by [`InputProtocol::skip`].
pub const MAX_SKIP_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Field and element type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TType {
    Stop,
    Void,
    Bool,
    Byte,
    Double,
    I16,
    I32,
    I64,
    String,
    Struct,
    Map,
    Set,
    List,
}

impl TType {
    /// Numeric wire identifier.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Stop => 0,
            Self::Void => 1,
            Self::Bool => 2,
            Self::Byte => 3,
            Self::Double => 4,
            Self::I16 => 6,
            Self::I32 => 8,
            Self::I64 => 10,
            Self::String => 11,
            Self::Struct => 12,
            Self::Map => 13,
            Self::Set => 14,
            Self::List => 15,
        }
    }

    /// Parses a numeric wire identifier.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidData` for unknown identifiers.
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => Self::Stop,
            1 => Self::Void,
            2 => Self::Bool,
            3 => Self::Byte,
            4 => Self::Double,
            6 => Self::I16,
            8 => Self::I32,
            10 => Self::I64,
            11 => Self::String,
            12 => Self::Struct,
            13 => Self::Map,
            14 => Self::Set,
            15 => Self::List,
            other => return Err(ProtocolError::InvalidData(format!("unknown type id {other}"))),
        })
    }
}

/// Kind of RPC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call,
    Reply,
    Exception,
    OneWay,
}

impl MessageType {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Call => 1,
            Self::Reply => 2,
            Self::Exception => 3,
            Self::OneWay => 4,
        }
    }

    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidData` for unknown message types.
    pub fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(Self::Call),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Exception),
            4 => Ok(Self::OneWay),
            other => Err(ProtocolError::InvalidData(format!(
                "unknown message type {other}"
            ))),
        }
    }

    /// Calls and one-way calls travel client to server.
    #[must_use]
    pub fn is_request(self) -> bool {
        matches!(self, Self::Call | Self::OneWay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub message_type: MessageType,
    pub seq_id: i32,
}

impl MessageHeader {
    #[must_use]
    pub fn new(name: impl Into<String>, message_type: MessageType, seq_id: i32) -> Self {
        Self {
            name: name.into(),
            message_type,
            seq_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHeader {
    pub field_type: TType,
    pub id: i16,
}

impl FieldHeader {
    #[must_use]
    pub fn new(field_type: TType, id: i16) -> Self {
        Self { field_type, id }
    }

    /// Marker ending a struct's field list.
    #[must_use]
    pub fn stop() -> Self {
        Self {
            field_type: TType::Stop,
            id: 0,
        }
    }
}

/// Header of a list or set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListHeader {
    pub element_type: TType,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapHeader {
    pub key_type: TType,
    pub value_type: TType,
    pub size: usize,
}

// ---------------------------------------------------------------------------
// Protocol traits
// ---------------------------------------------------------------------------

/// Decoding half of a structured-data protocol.
pub trait InputProtocol {
    fn read_message_begin(&mut self) -> Result<MessageHeader>;
    fn read_message_end(&mut self) -> Result<()>;
    fn read_struct_begin(&mut self) -> Result<()>;
    fn read_struct_end(&mut self) -> Result<()>;
    fn read_field_begin(&mut self) -> Result<FieldHeader>;
    fn read_field_end(&mut self) -> Result<()>;
    fn read_list_begin(&mut self) -> Result<ListHeader>;
    fn read_list_end(&mut self) -> Result<()>;
    fn read_set_begin(&mut self) -> Result<ListHeader>;
    fn read_set_end(&mut self) -> Result<()>;
    fn read_map_begin(&mut self) -> Result<MapHeader>;
    fn read_map_end(&mut self) -> Result<()>;
    fn read_bool(&mut self) -> Result<bool>;
    fn read_byte(&mut self) -> Result<i8>;
    fn read_i16(&mut self) -> Result<i16>;
    fn read_i32(&mut self) -> Result<i32>;
    fn read_i64(&mut self) -> Result<i64>;
    fn read_double(&mut self) -> Result<f64>;
    fn read_string(&mut self) -> Result<String>;
    fn read_binary(&mut self) -> Result<Vec<u8>>;

    /// Discards a string or binary value without interpreting its contents.
    ///
    /// # Errors
    ///
    /// Propagates read errors.
    fn skip_string(&mut self) -> Result<()> {
        self.read_binary().map(drop)
    }

    /// Reads and discards one value of type `ttype`.
    ///
    /// # Errors
    ///
    /// Propagates read errors; `DepthLimit` past [`MAX_SKIP_DEPTH`].
    fn skip(&mut self, ttype: TType) -> Result<()> {
        skip_depth(self, ttype, MAX_SKIP_DEPTH)
    }
}

fn skip_depth<P: InputProtocol + ?Sized>(p: &mut P, ttype: TType, depth: usize) -> Result<()> {
    if depth == 0 {
        return Err(ProtocolError::DepthLimit);
    }
    match ttype {
        TType::Bool => p.read_bool().map(drop),
        TType::Byte => p.read_byte().map(drop),
        TType::I16 => p.read_i16().map(drop),
        TType::I32 => p.read_i32().map(drop),
        TType::I64 => p.read_i64().map(drop),
        TType::Double => p.read_double().map(drop),
        TType::String => p.skip_string(),
        TType::Struct => {
            p.read_struct_begin()?;
            loop {
                let field = p.read_field_begin()?;
                if field.field_type == TType::Stop {
                    break;
                }
                skip_depth(p, field.field_type, depth - 1)?;
                p.read_field_end()?;
            }
            p.read_struct_end()
        }
        TType::List => {
            let header = p.read_list_begin()?;
            for _ in 0..header.size {
                skip_depth(p, header.element_type, depth - 1)?;
            }
            p.read_list_end()
        }
        TType::Set => {
            let header = p.read_set_begin()?;
            for _ in 0..header.size {
                skip_depth(p, header.element_type, depth - 1)?;
            }
            p.read_set_end()
        }
        TType::Map => {
            let header = p.read_map_begin()?;
            for _ in 0..header.size {
                skip_depth(p, header.key_type, depth - 1)?;
                skip_depth(p, header.value_type, depth - 1)?;
            }
            p.read_map_end()
        }
        TType::Stop | TType::Void => Err(ProtocolError::InvalidData(format!(
            "cannot skip {ttype:?}"
        ))),
    }
}

/// Encoding half of a structured-data protocol.
pub trait OutputProtocol {
    fn write_message_begin(&mut self, header: &MessageHeader) -> Result<()>;
    fn write_message_end(&mut self) -> Result<()>;
    fn write_struct_begin(&mut self, name: &str) -> Result<()>;
    fn write_struct_end(&mut self) -> Result<()>;
    fn write_field_begin(&mut self, name: &str, header: FieldHeader) -> Result<()>;
    fn write_field_end(&mut self) -> Result<()>;
    fn write_field_stop(&mut self) -> Result<()>;
    fn write_list_begin(&mut self, header: ListHeader) -> Result<()>;
    fn write_list_end(&mut self) -> Result<()>;
    fn write_set_begin(&mut self, header: ListHeader) -> Result<()>;
    fn write_set_end(&mut self) -> Result<()>;
    fn write_map_begin(&mut self, header: MapHeader) -> Result<()>;
    fn write_map_end(&mut self) -> Result<()>;
    fn write_bool(&mut self, value: bool) -> Result<()>;
    fn write_byte(&mut self, value: i8) -> Result<()>;
    fn write_i16(&mut self, value: i16) -> Result<()>;
    fn write_i32(&mut self, value: i32) -> Result<()>;
    fn write_i64(&mut self, value: i64) -> Result<()>;
    fn write_double(&mut self, value: f64) -> Result<()>;
    fn write_string(&mut self, value: &str) -> Result<()>;
    fn write_binary(&mut self, value: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

impl<P: OutputProtocol + ?Sized> OutputProtocol for Box<P> {
    fn write_message_begin(&mut self, header: &MessageHeader) -> Result<()> {
        (**self).write_message_begin(header)
    }
    fn write_message_end(&mut self) -> Result<()> {
        (**self).write_message_end()
    }
    fn write_struct_begin(&mut self, name: &str) -> Result<()> {
        (**self).write_struct_begin(name)
    }
    fn write_struct_end(&mut self) -> Result<()> {
        (**self).write_struct_end()
    }
    fn write_field_begin(&mut self, name: &str, header: FieldHeader) -> Result<()> {
        (**self).write_field_begin(name, header)
    }
    fn write_field_end(&mut self) -> Result<()> {
        (**self).write_field_end()
    }
    fn write_field_stop(&mut self) -> Result<()> {
        (**self).write_field_stop()
    }
    fn write_list_begin(&mut self, header: ListHeader) -> Result<()> {
        (**self).write_list_begin(header)
    }
    fn write_list_end(&mut self) -> Result<()> {
        (**self).write_list_end()
    }
    fn write_set_begin(&mut self, header: ListHeader) -> Result<()> {
        (**self).write_set_begin(header)
    }
    fn write_set_end(&mut self) -> Result<()> {
        (**self).write_set_end()
    }
    fn write_map_begin(&mut self, header: MapHeader) -> Result<()> {
        (**self).write_map_begin(header)
    }
    fn write_map_end(&mut self) -> Result<()> {
        (**self).write_map_end()
    }
    fn write_bool(&mut self, value: bool) -> Result<()> {
        (**self).write_bool(value)
    }
    fn write_byte(&mut self, value: i8) -> Result<()> {
        (**self).write_byte(value)
    }
    fn write_i16(&mut self, value: i16) -> Result<()> {
        (**self).write_i16(value)
    }
    fn write_i32(&mut self, value: i32) -> Result<()> {
        (**self).write_i32(value)
    }
    fn write_i64(&mut self, value: i64) -> Result<()> {
        (**self).write_i64(value)
    }
    fn write_double(&mut self, value: f64) -> Result<()> {
        (**self).write_double(value)
    }
    fn write_string(&mut self, value: &str) -> Result<()> {
        (**self).write_string(value)
    }
    fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        (**self).write_binary(value)
    }
    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

// ---------------------------------------------------------------------------
// ProtocolKind
// ---------------------------------------------------------------------------

/// Protocol selected for a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Compact big-endian binary encoding.
    #[default]
    Binary,
    /// String-based JSON encoding.
    Json,
}

impl ProtocolKind {
    /// Whether the encoding is string-based (sent in text frames).
    #[must_use]
    pub fn is_text(self) -> bool {
        matches!(self, Self::Json)
    }

    /// HTTP content type of a reply body.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Binary => "application/x-thrift",
            Self::Json => "application/vnd.apache.thrift.json",
        }
    }

    /// Builds an input protocol over `transport`.
    #[must_use]
    pub fn input<'a, T>(self, transport: T) -> Box<dyn InputProtocol + 'a>
    where
        T: ReadTransport + 'a,
    {
        match self {
            Self::Binary => Box::new(BinaryInputProtocol::new(transport)),
            Self::Json => Box::new(JsonInputProtocol::new(transport)),
        }
    }

    /// Builds an output protocol over `transport`.
    #[must_use]
    pub fn output<'a, T>(self, transport: T) -> Box<dyn OutputProtocol + 'a>
    where
        T: WriteTransport + 'a,
    {
        match self {
            Self::Binary => Box::new(BinaryOutputProtocol::new(transport)),
            Self::Json => Box::new(JsonOutputProtocol::new(transport)),
        }
    }
}
