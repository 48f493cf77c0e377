//! Standard exception envelope for protocol-level call failures.
//!
//! Wire shape (struct `TApplicationException`): field 1 is the optional
//! `message` string, field 2 the optional `i32` kind. Both are omitted when
//! empty/zero.

use crate::error::{ProtocolError, Result};
use crate::protocol::{FieldHeader, InputProtocol, MessageHeader, MessageType, OutputProtocol, TType};

const STRUCT_NAME: &str = "TApplicationException";
const MESSAGE_FIELD: i16 = 1;
const KIND_FIELD: i16 = 2;

/// Failure category carried in field 2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ApplicationExceptionKind {
    #[default]
    Unknown,
    UnknownMethod,
    InvalidMessageType,
    WrongMethodName,
    BadSequenceId,
    MissingResult,
    InternalError,
    ProtocolError,
    InvalidTransform,
    InvalidProtocol,
    UnsupportedClientType,
}

impl ApplicationExceptionKind {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::UnknownMethod => 1,
            Self::InvalidMessageType => 2,
            Self::WrongMethodName => 3,
            Self::BadSequenceId => 4,
            Self::MissingResult => 5,
            Self::InternalError => 6,
            Self::ProtocolError => 7,
            Self::InvalidTransform => 8,
            Self::InvalidProtocol => 9,
            Self::UnsupportedClientType => 10,
        }
    }

    /// Maps a wire value; anything unrecognised becomes `Unknown`.
    #[must_use]
    pub fn from_i32(raw: i32) -> Self {
        match raw {
            1 => Self::UnknownMethod,
            2 => Self::InvalidMessageType,
            3 => Self::WrongMethodName,
            4 => Self::BadSequenceId,
            5 => Self::MissingResult,
            6 => Self::InternalError,
            7 => Self::ProtocolError,
            8 => Self::InvalidTransform,
            9 => Self::InvalidProtocol,
            10 => Self::UnsupportedClientType,
            _ => Self::Unknown,
        }
    }
}

/// Protocol-level failure of a remote call.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ApplicationException {
    pub kind: ApplicationExceptionKind,
    pub message: String,
}

impl ApplicationException {
    #[must_use]
    pub fn new(kind: ApplicationExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Decodes the envelope struct, skipping unknown fields.
    ///
    /// # Errors
    ///
    /// Propagates protocol read errors (including `Underrun`).
    pub fn read(input: &mut dyn InputProtocol) -> Result<Self> {
        let mut exception = Self::default();
        input.read_struct_begin()?;
        loop {
            let field = input.read_field_begin()?;
            match (field.id, field.field_type) {
                (_, TType::Stop) => break,
                (MESSAGE_FIELD, TType::String) => exception.message = input.read_string()?,
                (KIND_FIELD, TType::I32) => {
                    exception.kind = ApplicationExceptionKind::from_i32(input.read_i32()?);
                }
                (_, other) => input.skip(other)?,
            }
            input.read_field_end()?;
        }
        input.read_struct_end()?;
        Ok(exception)
    }

    /// Encodes the envelope struct.
    ///
    /// # Errors
    ///
    /// Propagates protocol write errors.
    pub fn write(&self, output: &mut dyn OutputProtocol) -> Result<()> {
        output.write_struct_begin(STRUCT_NAME)?;
        if !self.message.is_empty() {
            output.write_field_begin("message", FieldHeader::new(TType::String, MESSAGE_FIELD))?;
            output.write_string(&self.message)?;
            output.write_field_end()?;
        }
        let kind = self.kind.as_i32();
        if kind != 0 {
            output.write_field_begin("type", FieldHeader::new(TType::I32, KIND_FIELD))?;
            output.write_i32(kind)?;
            output.write_field_end()?;
        }
        output.write_field_stop()?;
        output.write_struct_end()
    }

    /// Writes a complete EXCEPTION message answering `name`/`seq_id` and flushes.
    ///
    /// # Errors
    ///
    /// Propagates protocol write errors.
    pub fn write_reply(&self, output: &mut dyn OutputProtocol, name: &str, seq_id: i32) -> Result<()> {
        output.write_message_begin(&MessageHeader::new(name, MessageType::Exception, seq_id))?;
        self.write(output)?;
        output.write_message_end()?;
        output.flush()
    }
}

impl From<ProtocolError> for ApplicationException {
    fn from(err: ProtocolError) -> Self {
        Self::new(ApplicationExceptionKind::ProtocolError, err.to_string())
    }
}
