//! End-to-end socket tests against a bound server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rpcweb_core::protocol::MessageType;
use rpcweb_core::value::write_struct;
use rpcweb_core::{
    Fields, HandlerError, MessageHeader, MultiplexedProcessor, Multiplexer, OutputProtocol,
    ProtocolKind, ReadBuffer, ServiceDefinition, SharedTransport, TransportKind, Value,
};
use rpcweb_server::{NetworkConfig, NetworkModule, ServiceOptions, ServiceRegistry};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

fn add(_: &str, args: Fields) -> Result<Option<Value>, HandlerError> {
    let a = args.get(&1).and_then(Value::as_i32).unwrap_or_default();
    let b = args.get(&2).and_then(Value::as_i32).unwrap_or_default();
    Ok(Some(Value::I32(a + b)))
}

fn registry() -> ServiceRegistry {
    let calc = Arc::new(ServiceDefinition::new("Calc").two_way("add"));
    let mux = MultiplexedProcessor::new().with_service("Calc", Arc::new(calc.bind(Arc::new(add))));
    ServiceRegistry::from_options([
        (
            "/calc",
            ServiceOptions::definition(ServiceDefinition::new("Calc").two_way("add"), add),
        ),
        (
            "/calc-json",
            ServiceOptions::definition(ServiceDefinition::new("Calc").two_way("add"), add)
                .with_protocol(ProtocolKind::Json),
        ),
        ("/mux", ServiceOptions::multiplexed(mux)),
    ])
    .unwrap()
}

struct TestServer {
    port: u16,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start_server() -> TestServer {
    let config = NetworkConfig {
        host: "127.0.0.1".to_string(),
        ..NetworkConfig::default()
    };
    let mut module = NetworkModule::new(config, registry()).unwrap();
    let port = module.start().await.unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(module.serve(async move {
        let _ = stopped.await;
    }));
    TestServer { port, stop, task }
}

fn add_call(protocol: ProtocolKind, a: i32, b: i32) -> Vec<u8> {
    let mut out = TransportKind::Buffered.output_buffer();
    {
        let mut proto = protocol.output(&mut out);
        proto
            .write_message_begin(&MessageHeader::new("add", MessageType::Call, 1))
            .unwrap();
        let args = Fields::from([(1, Value::I32(a)), (2, Value::I32(b))]);
        write_struct("add_args", &args, proto.as_mut()).unwrap();
        proto.write_message_end().unwrap();
        proto.flush().unwrap();
    }
    out.take_flushed().to_vec()
}

fn read_sum(protocol: ProtocolKind, bytes: &[u8]) -> i32 {
    let mut buf = ReadBuffer::new();
    buf.push(bytes);
    let mut input = protocol.input(&mut buf);
    let header = input.read_message_begin().unwrap();
    assert_eq!(header.message_type, MessageType::Reply);
    let fields = Value::read_struct(input.as_mut()).unwrap();
    fields.get(&0).and_then(Value::as_i32).unwrap()
}

#[tokio::test]
async fn binary_call_over_socket() {
    let server = start_server().await;
    let url = format!("ws://127.0.0.1:{}/calc", server.port);
    let (mut ws, response) = tokio_tungstenite::connect_async(url).await.unwrap();
    assert_eq!(response.status(), 101);

    ws.send(Message::binary(add_call(ProtocolKind::Binary, 40, 2)))
        .await
        .unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    let Message::Binary(payload) = reply else {
        panic!("expected a binary frame, got {reply:?}");
    };
    assert_eq!(read_sum(ProtocolKind::Binary, &payload), 42);

    ws.close(None).await.unwrap();
    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn json_route_replies_with_text_frames() {
    let server = start_server().await;
    let url = format!("ws://127.0.0.1:{}/calc-json", server.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let request = String::from_utf8(add_call(ProtocolKind::Json, 5, 6)).unwrap();
    ws.send(Message::text(request)).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = reply else {
        panic!("expected a text frame, got {reply:?}");
    };
    assert_eq!(read_sum(ProtocolKind::Json, text.as_bytes()), 11);

    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn multiplexed_client_reaches_named_service() {
    let server = start_server().await;
    let url = format!("ws://127.0.0.1:{}/mux", server.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let multiplexer = Multiplexer::new();
    let transport = SharedTransport::new(TransportKind::Buffered);
    let mut client = multiplexer.create_client(
        "Calc",
        |channel| channel,
        &transport,
        ProtocolKind::Binary,
    );
    let args = Fields::from([(1, Value::I32(3)), (2, Value::I32(4))]);
    let seq_id = client.call("add", &args).unwrap();

    ws.send(Message::binary(transport.take_flushed())).await.unwrap();
    let Message::Binary(payload) = ws.next().await.unwrap().unwrap() else {
        panic!("expected a binary frame");
    };

    let mut buf = ReadBuffer::new();
    buf.push(&payload);
    let mut input = ProtocolKind::Binary.input(&mut buf);
    let header = input.read_message_begin().unwrap();
    assert_eq!(header.name, "add");
    assert_eq!(header.seq_id, seq_id);
    let fields = Value::read_struct(input.as_mut()).unwrap();
    assert_eq!(fields.get(&0).and_then(Value::as_i32), Some(7));

    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_route_is_refused() {
    let server = start_server().await;
    let url = format!("ws://127.0.0.1:{}/nope", server.port);
    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        Err(e) => panic!("expected an HTTP 403, got {e:?}"),
        Ok((_, response)) => panic!("expected an HTTP 403, got {}", response.status()),
    }

    let _ = server.stop.send(());
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let server = start_server().await;
    let url = format!("ws://127.0.0.1:{}/calc", server.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let _ = server.stop.send(());
    let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap();
    assert!(matches!(message, Some(Ok(Message::Close(_)))));

    drop(ws);
    server.task.await.unwrap().unwrap();
}
