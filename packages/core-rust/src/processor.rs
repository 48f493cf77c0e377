//! Processors: read one request message, invoke a handler, write the reply.
//!
//! [`ServiceProcessor`] binds a [`ServiceDefinition`] (the method table) to a
//! [`ServiceHandler`]; [`MultiplexedProcessor`] routes `"service:method"`
//! names to per-service processors.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::application_exception::{ApplicationException, ApplicationExceptionKind};
use crate::error::{Error, Result};
use crate::protocol::{
    FieldHeader, InputProtocol, ListHeader, MapHeader, MessageHeader, MessageType, OutputProtocol,
    TType,
};
use crate::value::{Fields, Value};

/// Separator between service and method in multiplexed message names.
pub const SERVICE_SEPARATOR: char = ':';

/// Reads one message from `input` and writes any reply to `output`.
///
/// An `Underrun` from the input must be returned untouched so the caller can
/// roll back and retry once more bytes arrive. A message whose arguments
/// cannot be decoded yields [`Error::Discarded`] after its exception reply
/// has been written.
pub trait Processor: Send + Sync {
    /// # Errors
    ///
    /// `Error::Protocol(ProtocolError::Underrun)` when the message is
    /// incomplete, `Error::Discarded` when its body was undecodable; any
    /// other error means the stream cannot continue.
    fn process(
        &self,
        input: &mut dyn InputProtocol,
        output: &mut dyn OutputProtocol,
    ) -> std::result::Result<(), Error>;
}

/// Consumes the rest of a message whose arguments will not be used.
fn discard_args(input: &mut dyn InputProtocol) -> Result<()> {
    input.skip(TType::Struct)?;
    input.read_message_end()
}

// ---------------------------------------------------------------------------
// Service definitions and handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    TwoWay,
    /// No reply is written; handler errors are logged and dropped.
    OneWay,
}

/// Method table of a service, independent of any handler.
#[derive(Debug, Clone, Default)]
pub struct ServiceDefinition {
    name: String,
    methods: HashMap<String, MethodKind>,
}

impl ServiceDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    #[must_use]
    pub fn two_way(mut self, method: impl Into<String>) -> Self {
        self.methods.insert(method.into(), MethodKind::TwoWay);
        self
    }

    #[must_use]
    pub fn one_way(mut self, method: impl Into<String>) -> Self {
        self.methods.insert(method.into(), MethodKind::OneWay);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn method_kind(&self, method: &str) -> Option<MethodKind> {
        self.methods.get(method).copied()
    }

    /// Builds a processor answering calls with `handler`.
    #[must_use]
    pub fn bind(self: &Arc<Self>, handler: Arc<dyn ServiceHandler>) -> ServiceProcessor {
        ServiceProcessor {
            definition: Arc::clone(self),
            handler,
        }
    }
}

/// Failure returned by a [`ServiceHandler`].
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Business exception, written as result field `id` of a normal reply.
    #[error("declared exception in field {id}")]
    Declared { id: i16, value: Value },
    /// Sent as an EXCEPTION message as-is.
    #[error(transparent)]
    Application(#[from] ApplicationException),
    /// Sent as an `INTERNAL_ERROR` exception.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Business logic behind a service.
pub trait ServiceHandler: Send + Sync {
    /// Handles `method` with its decoded argument struct. `Ok(None)` is a void result.
    ///
    /// # Errors
    ///
    /// See [`HandlerError`] for how each variant reaches the caller.
    fn call(&self, method: &str, args: Fields) -> std::result::Result<Option<Value>, HandlerError>;
}

impl<F> ServiceHandler for F
where
    F: Fn(&str, Fields) -> std::result::Result<Option<Value>, HandlerError> + Send + Sync,
{
    fn call(&self, method: &str, args: Fields) -> std::result::Result<Option<Value>, HandlerError> {
        self(method, args)
    }
}

// ---------------------------------------------------------------------------
// ServiceProcessor
// ---------------------------------------------------------------------------

/// A [`ServiceDefinition`] bound to its handler.
#[derive(Clone)]
pub struct ServiceProcessor {
    definition: Arc<ServiceDefinition>,
    handler: Arc<dyn ServiceHandler>,
}

impl std::fmt::Debug for ServiceProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProcessor")
            .field("service", &self.definition.name)
            .finish_non_exhaustive()
    }
}

impl ServiceProcessor {
    #[must_use]
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    fn write_result(
        output: &mut dyn OutputProtocol,
        header: &MessageHeader,
        field: Option<(i16, &Value)>,
    ) -> Result<()> {
        output.write_message_begin(&MessageHeader::new(
            header.name.as_str(),
            MessageType::Reply,
            header.seq_id,
        ))?;
        output.write_struct_begin(&format!("{}_result", header.name))?;
        if let Some((id, value)) = field {
            output.write_field_begin("", FieldHeader::new(value.ttype(), id))?;
            value.write(output)?;
            output.write_field_end()?;
        }
        output.write_field_stop()?;
        output.write_struct_end()?;
        output.write_message_end()?;
        output.flush()
    }
}

impl Processor for ServiceProcessor {
    fn process(
        &self,
        input: &mut dyn InputProtocol,
        output: &mut dyn OutputProtocol,
    ) -> std::result::Result<(), Error> {
        let header = input.read_message_begin()?;
        debug!(service = %self.definition.name, method = %header.name, seq_id = header.seq_id, "processing call");

        if !header.message_type.is_request() {
            discard_args(input)?;
            ApplicationException::new(
                ApplicationExceptionKind::InvalidMessageType,
                format!("unexpected {:?} message", header.message_type),
            )
            .write_reply(output, &header.name, header.seq_id)?;
            return Ok(());
        }

        let Some(kind) = self.definition.method_kind(&header.name) else {
            discard_args(input)?;
            ApplicationException::new(
                ApplicationExceptionKind::UnknownMethod,
                format!("Unknown function {}", header.name),
            )
            .write_reply(output, &header.name, header.seq_id)?;
            return Ok(());
        };

        let args = match Value::read_struct(input).and_then(|args| {
            input.read_message_end()?;
            Ok(args)
        }) {
            Ok(args) => args,
            Err(e) if e.is_underrun() => return Err(e.into()),
            Err(e) => {
                warn!(method = %header.name, error = %e, "malformed call arguments");
                if header.message_type == MessageType::Call {
                    ApplicationException::from(e.clone())
                        .write_reply(output, &header.name, header.seq_id)?;
                }
                return Err(Error::Discarded(e));
            }
        };

        let outcome = self.handler.call(&header.name, args);
        if kind == MethodKind::OneWay || header.message_type == MessageType::OneWay {
            if let Err(e) = outcome {
                warn!(method = %header.name, error = %e, "one-way handler failed");
            }
            return Ok(());
        }

        match outcome {
            Ok(result) => Self::write_result(output, &header, result.as_ref().map(|v| (0, v)))?,
            Err(HandlerError::Declared { id, value }) => {
                Self::write_result(output, &header, Some((id, &value)))?;
            }
            Err(HandlerError::Application(e)) => {
                e.write_reply(output, &header.name, header.seq_id)?;
            }
            Err(HandlerError::Internal(e)) => {
                warn!(method = %header.name, error = %e, "handler failed");
                ApplicationException::new(ApplicationExceptionKind::InternalError, e.to_string())
                    .write_reply(output, &header.name, header.seq_id)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MultiplexedProcessor
// ---------------------------------------------------------------------------

/// Routes `"service:method"` calls to the processor registered for `service`.
#[derive(Default, Clone)]
pub struct MultiplexedProcessor {
    services: HashMap<String, Arc<dyn Processor>>,
    default: Option<Arc<dyn Processor>>,
}

impl std::fmt::Debug for MultiplexedProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedProcessor")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

impl MultiplexedProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `processor` under `service`, replacing any previous one.
    pub fn register(&mut self, service: impl Into<String>, processor: Arc<dyn Processor>) {
        self.services.insert(service.into(), processor);
    }

    /// Processor for names without a service prefix.
    pub fn register_default(&mut self, processor: Arc<dyn Processor>) {
        self.default = Some(processor);
    }

    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        self.register(service, processor);
        self
    }

    fn reject(
        input: &mut dyn InputProtocol,
        output: &mut dyn OutputProtocol,
        header: &MessageHeader,
        kind: ApplicationExceptionKind,
        message: String,
    ) -> std::result::Result<(), Error> {
        discard_args(input)?;
        warn!(name = %header.name, %message, "multiplexed call rejected");
        ApplicationException::new(kind, message).write_reply(output, &header.name, header.seq_id)?;
        Ok(())
    }
}

impl Processor for MultiplexedProcessor {
    fn process(
        &self,
        input: &mut dyn InputProtocol,
        output: &mut dyn OutputProtocol,
    ) -> std::result::Result<(), Error> {
        let header = input.read_message_begin()?;
        if !header.message_type.is_request() {
            return Self::reject(
                input,
                output,
                &header,
                ApplicationExceptionKind::InvalidMessageType,
                format!("unexpected {:?} message", header.message_type),
            );
        }

        let Some((service, method)) = header.name.split_once(SERVICE_SEPARATOR) else {
            return match &self.default {
                Some(processor) => {
                    processor.process(&mut StoredMessage::new(input, header.clone()), output)
                }
                None => {
                    let message = format!(
                        "service name not found in message name {:?}; is the client multiplexed?",
                        header.name
                    );
                    Self::reject(input, output, &header, ApplicationExceptionKind::InvalidProtocol, message)
                }
            };
        };

        let Some(processor) = self.services.get(service) else {
            let message = format!("service name not found: {service}");
            return Self::reject(input, output, &header, ApplicationExceptionKind::UnknownMethod, message);
        };

        let stripped = MessageHeader::new(method, header.message_type, header.seq_id);
        processor.process(&mut StoredMessage::new(input, stripped), output)
    }
}

/// Input wrapper that replays an already-read message header.
struct StoredMessage<'a> {
    inner: &'a mut dyn InputProtocol,
    header: Option<MessageHeader>,
}

impl<'a> StoredMessage<'a> {
    fn new(inner: &'a mut dyn InputProtocol, header: MessageHeader) -> Self {
        Self {
            inner,
            header: Some(header),
        }
    }
}

impl InputProtocol for StoredMessage<'_> {
    fn read_message_begin(&mut self) -> Result<MessageHeader> {
        match self.header.take() {
            Some(header) => Ok(header),
            None => self.inner.read_message_begin(),
        }
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
