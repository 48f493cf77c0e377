//! Client-side service multiplexing over one shared transport.
//!
//! [`MultiplexedProtocol`] tags outgoing call and one-way message names with
//! `"<service>:"`; [`Multiplexer`] hands out per-service clients that all draw
//! sequence ids from one atomic counter.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::processor::SERVICE_SEPARATOR;
use crate::protocol::{
    FieldHeader, InputProtocol, ListHeader, MapHeader, MessageHeader, MessageType, OutputProtocol,
    ProtocolKind,
};
use crate::transport::SharedTransport;
use crate::value::{write_struct, Fields};

/// Protocol adapter prefixing request names with a service name.
#[derive(Debug)]
pub struct MultiplexedProtocol<P> {
    inner: P,
    service: String,
}

impl<P> MultiplexedProtocol<P> {
    pub fn new(inner: P, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: OutputProtocol> OutputProtocol for MultiplexedProtocol<P> {
    fn write_message_begin(&mut self, header: &MessageHeader) -> Result<()> {
        if header.message_type.is_request() {
            let name = format!("{}{SERVICE_SEPARATOR}{}", self.service, header.name);
            self.inner
                .write_message_begin(&MessageHeader::new(name, header.message_type, header.seq_id))
        } else {
            self.inner.write_message_begin(header)
        }
    }

    fn write_message_end(&mut self) -> Result<()> {
        self.inner.write_message_end()
    }
    fn write_struct_begin(&mut self, name: &str) -> Result<()> {
        self.inner.write_struct_begin(name)
    }
    fn write_struct_end(&mut self) -> Result<()> {
        self.inner.write_struct_end()
    }
    fn write_field_begin(&mut self, name: &str, header: FieldHeader) -> Result<()> {
        self.inner.write_field_begin(name, header)
    }
    fn write_field_end(&mut self) -> Result<()> {
        self.inner.write_field_end()
    }
    fn write_field_stop(&mut self) -> Result<()> {
        self.inner.write_field_stop()
    }
    fn write_list_begin(&mut self, header: ListHeader) -> Result<()> {
        self.inner.write_list_begin(header)
    }
    fn write_list_end(&mut self) -> Result<()> {
        self.inner.write_list_end()
    }
    fn write_set_begin(&mut self, header: ListHeader) -> Result<()> {
        self.inner.write_set_begin(header)
    }
    fn write_set_end(&mut self) -> Result<()> {
        self.inner.write_set_end()
    }
    fn write_map_begin(&mut self, header: MapHeader) -> Result<()> {
        self.inner.write_map_begin(header)
    }
    fn write_map_end(&mut self) -> Result<()> {
        self.inner.write_map_end()
    }
    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.inner.write_bool(value)
    }
    fn write_byte(&mut self, value: i8) -> Result<()> {
        self.inner.write_byte(value)
    }
    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.inner.write_i16(value)
    }
    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.inner.write_i32(value)
    }
    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.inner.write_i64(value)
    }
    fn write_double(&mut self, value: f64) -> Result<()> {
        self.inner.write_double(value)
    }
    fn write_string(&mut self, value: &str) -> Result<()> {
        self.inner.write_string(value)
    }
    fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        self.inner.write_binary(value)
    }
    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

impl<P: InputProtocol> InputProtocol for MultiplexedProtocol<P> {
    fn read_message_begin(&mut self) -> Result<MessageHeader> {
        self.inner.read_message_begin()
    }
    fn read_message_end(&mut self) -> Result<()> {
        self.inner.read_message_end()
    }
    fn read_struct_begin(&mut self) -> Result<()> {
        self.inner.read_struct_begin()
    }
    fn read_struct_end(&mut self) -> Result<()> {
        self.inner.read_struct_end()
    }
    fn read_field_begin(&mut self) -> Result<FieldHeader> {
        self.inner.read_field_begin()
    }
    fn read_field_end(&mut self) -> Result<()> {
        self.inner.read_field_end()
    }
    fn read_list_begin(&mut self) -> Result<ListHeader> {
        self.inner.read_list_begin()
    }
    fn read_list_end(&mut self) -> Result<()> {
        self.inner.read_list_end()
    }
    fn read_set_begin(&mut self) -> Result<ListHeader> {
        self.inner.read_set_begin()
    }
    fn read_set_end(&mut self) -> Result<()> {
        self.inner.read_set_end()
    }
    fn read_map_begin(&mut self) -> Result<MapHeader> {
        self.inner.read_map_begin()
    }
    fn read_map_end(&mut self) -> Result<()> {
        self.inner.read_map_end()
    }
    fn read_bool(&mut self) -> Result<bool> {
        self.inner.read_bool()
    }
    fn read_byte(&mut self) -> Result<i8> {
        self.inner.read_byte()
    }
    fn read_i16(&mut self) -> Result<i16> {
        self.inner.read_i16()
    }
    fn read_i32(&mut self) -> Result<i32> {
        self.inner.read_i32()
    }
    fn read_i64(&mut self) -> Result<i64> {
        self.inner.read_i64()
    }
    fn read_double(&mut self) -> Result<f64> {
        self.inner.read_double()
    }
    fn read_string(&mut self) -> Result<String> {
        self.inner.read_string()
    }
    fn read_binary(&mut self) -> Result<Vec<u8>> {
        self.inner.read_binary()
    }
    fn skip_string(&mut self) -> Result<()> {
        self.inner.skip_string()
    }
}

// ---------------------------------------------------------------------------
// Sequence ids
// ---------------------------------------------------------------------------

/// Shared, monotonically increasing sequence counter. Clones share the count.
///
/// Ids are always positive: once `i32::MAX` has been handed out the count
/// restarts at 1.
#[derive(Debug, Clone, Default)]
pub struct SequenceIds(Arc<AtomicI32>);

fn following(id: i32) -> i32 {
    id.checked_add(1).unwrap_or(1)
}

impl SequenceIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id; the first call yields 1.
    #[must_use]
    pub fn next(&self) -> i32 {
        let previous = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| Some(following(id)))
            .unwrap_or_else(|id| id);
        following(previous)
    }

    /// Last id handed out (0 before the first call).
    #[must_use]
    pub fn current(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Multiplexer
// ---------------------------------------------------------------------------

/// Everything a generated client needs to send calls for one service.
pub struct ClientChannel {
    output: MultiplexedProtocol<Box<dyn OutputProtocol + Send>>,
    sequence: SequenceIds,
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("service", &self.output.service)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl ClientChannel {
    #[must_use]
    pub fn service(&self) -> &str {
        self.output.service()
    }

    /// Next id from the multiplexer's shared counter.
    #[must_use]
    pub fn next_seq_id(&self) -> i32 {
        self.sequence.next()
    }

    /// The multiplexed output protocol, for hand-written message bodies.
    pub fn output(&mut self) -> &mut dyn OutputProtocol {
        &mut self.output
    }

    /// Writes and flushes a CALL to `method`; returns its sequence id.
    ///
    /// # Errors
    ///
    /// Propagates protocol write errors.
    pub fn call(&mut self, method: &str, args: &Fields) -> Result<i32> {
        self.send(method, MessageType::Call, args)
    }

    /// Writes and flushes a ONEWAY call to `method`; returns its sequence id.
    ///
    /// # Errors
    ///
    /// Propagates protocol write errors.
    pub fn oneway(&mut self, method: &str, args: &Fields) -> Result<i32> {
        self.send(method, MessageType::OneWay, args)
    }

    fn send(&mut self, method: &str, message_type: MessageType, args: &Fields) -> Result<i32> {
        let seq_id = self.next_seq_id();
        self.output
            .write_message_begin(&MessageHeader::new(method, message_type, seq_id))?;
        write_struct(&format!("{method}_args"), args, &mut self.output)?;
        self.output.write_message_end()?;
        self.output.flush()?;
        Ok(seq_id)
    }
}

/// Builds per-service clients sharing one transport and one sequence counter.
#[derive(Debug, Clone, Default)]
pub struct Multiplexer {
    sequence: SequenceIds,
}

impl Multiplexer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sequence_ids(&self) -> SequenceIds {
        self.sequence.clone()
    }

    /// Builds a client for `service` writing `protocol` messages to `transport`.
    pub fn create_client<C>(
        &self,
        service: &str,
        constructor: impl FnOnce(ClientChannel) -> C,
        transport: &SharedTransport,
        protocol: ProtocolKind,
    ) -> C {
        let inner: Box<dyn OutputProtocol + Send> = match protocol {
            ProtocolKind::Binary => Box::new(crate::protocol::BinaryOutputProtocol::new(transport.clone())),
            ProtocolKind::Json => Box::new(crate::protocol::JsonOutputProtocol::new(transport.clone())),
        };
        constructor(ClientChannel {
            output: MultiplexedProtocol::new(inner, service),
            sequence: self.sequence.clone(),
        })
    }
}
