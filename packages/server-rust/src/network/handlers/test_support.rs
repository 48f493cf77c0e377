//! Fixtures shared by the handler tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rpcweb_core::protocol::{FieldHeader, MessageType};
use rpcweb_core::{
    Fields, HandlerError, MessageHeader, OutputProtocol, ProtocolKind, ReadBuffer,
    ServiceDefinition, TType, TransportKind, Value,
};

use super::AppState;
use crate::network::NetworkConfig;
use crate::service::{ServiceOptions, ServiceRecord, ServiceRegistry};

/// State with a `Calc.add` service on `/calc`, counting handler calls.
pub(crate) fn calc_state(
    calls: Arc<AtomicUsize>,
    protocol: ProtocolKind,
) -> (AppState, Arc<ServiceRecord>) {
    let definition = ServiceDefinition::new("Calc").two_way("add");
    let handler = move |_: &str, args: Fields| -> Result<Option<Value>, HandlerError> {
        calls.fetch_add(1, Ordering::SeqCst);
        let a = args.get(&1).and_then(Value::as_i32).unwrap_or_default();
        let b = args.get(&2).and_then(Value::as_i32).unwrap_or_default();
        Ok(Some(Value::I32(a + b)))
    };
    let services = ServiceRegistry::from_options([(
        "/calc",
        ServiceOptions::definition(definition, handler).with_protocol(protocol),
    )])
    .unwrap();
    let record = services.get("/calc").unwrap();
    (AppState::new(NetworkConfig::default(), services).unwrap(), record)
}

/// Encodes an `add(a, b)` call.
pub(crate) fn add_call(protocol: ProtocolKind, seq_id: i32, a: i32, b: i32) -> Vec<u8> {
    let mut out = TransportKind::Buffered.output_buffer();
    {
        let mut proto = protocol.output(&mut out);
        proto
            .write_message_begin(&MessageHeader::new("add", MessageType::Call, seq_id))
            .unwrap();
        let args = Fields::from([(1, Value::I32(a)), (2, Value::I32(b))]);
        rpcweb_core::value::write_struct("add_args", &args, proto.as_mut()).unwrap();
        proto.write_message_end().unwrap();
        proto.flush().unwrap();
    }
    out.take_flushed().to_vec()
}

/// Encodes a binary `add` call whose field 1 is a string holding invalid UTF-8.
pub(crate) fn malformed_add_call(seq_id: i32) -> Vec<u8> {
    let mut out = TransportKind::Buffered.output_buffer();
    {
        let mut proto = ProtocolKind::Binary.output(&mut out);
        proto
            .write_message_begin(&MessageHeader::new("add", MessageType::Call, seq_id))
            .unwrap();
        proto.write_struct_begin("add_args").unwrap();
        proto
            .write_field_begin("a", FieldHeader::new(TType::String, 1))
            .unwrap();
        proto.write_binary(&[0xff]).unwrap();
        proto.write_field_end().unwrap();
        proto.write_field_stop().unwrap();
        proto.write_struct_end().unwrap();
        proto.write_message_end().unwrap();
        proto.flush().unwrap();
    }
    out.take_flushed().to_vec()
}

/// Decodes an `add` reply and returns the sum.
pub(crate) fn read_sum(protocol: ProtocolKind, bytes: &[u8]) -> i32 {
    let mut buf = ReadBuffer::new();
    buf.push(bytes);
    let mut input = protocol.input(&mut buf);
    let header = input.read_message_begin().unwrap();
    assert_eq!(header.message_type, MessageType::Reply);
    let fields = Value::read_struct(input.as_mut()).unwrap();
    fields.get(&0).and_then(Value::as_i32).unwrap()
}
