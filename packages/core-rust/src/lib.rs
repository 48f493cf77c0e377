//! rpcweb core: socket frame codec, structured-data protocols, transports,
//! application exceptions, processors, and client-side multiplexing.
//!
//! Nothing in this crate touches the network; the server crate feeds bytes in
//! and writes the emitted bytes out.

pub mod application_exception;
pub mod error;
pub mod frame;
pub mod multiplex;
pub mod processor;
pub mod protocol;
pub mod transport;
pub mod value;

pub use application_exception::{ApplicationException, ApplicationExceptionKind};
pub use error::{Error, ProtocolError};
pub use frame::{DecodedMessage, Frame, FrameCodec, FrameError, Opcode};
pub use multiplex::{ClientChannel, MultiplexedProtocol, Multiplexer, SequenceIds};
pub use processor::{
    HandlerError, MethodKind, MultiplexedProcessor, Processor, ServiceDefinition, ServiceHandler,
    ServiceProcessor,
};
pub use protocol::{InputProtocol, MessageHeader, MessageType, OutputProtocol, ProtocolKind, TType};
pub use transport::{OutputBuffer, ReadBuffer, SharedTransport, TransportKind};
pub use value::{Fields, Value};
