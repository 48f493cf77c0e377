//! Socket upgrade handshake and the per-connection message loop.
//!
//! After the 101 response the raw connection is read with [`FrameCodec`];
//! every decoded message is appended to the connection's [`ReadBuffer`] and
//! dispatched, and each reply goes back as one frame.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use hyper_util::rt::TokioIo;
use rpcweb_core::{Frame, FrameCodec, FrameError, ReadBuffer};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::AppState;
use crate::service::{dispatch_all, ServiceRecord};

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` token for a client key.
#[must_use]
pub fn accept_key(client_key: &[u8]) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key);
    sha.update(ACCEPT_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

/// Whether the request asks to switch protocols.
#[must_use]
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(UPGRADE)
}

/// Answers the handshake and spawns the connection loop on the upgraded
/// socket.
///
/// Unknown routes get 403; a non-websocket upgrade or a missing key gets 400.
pub async fn handle_upgrade(state: AppState, mut request: Request) -> Response {
    let route = request.uri().path().to_string();
    let Some(record) = state.services.get(&route) else {
        debug!(%route, "upgrade to unknown route");
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    };

    let headers = request.headers();
    let is_websocket = headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));
    let Some(key) = headers.get(SEC_WEBSOCKET_KEY).filter(|_| is_websocket) else {
        return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
    };
    let accept = accept_key(key.as_bytes());

    let on_upgrade = hyper::upgrade::on(&mut request);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => serve_connection(TokioIo::new(upgraded), route, record, state).await,
            Err(e) => warn!(%route, error = %e, "upgrade failed"),
        }
    });

    (
        StatusCode::SWITCHING_PROTOCOLS,
        [
            (UPGRADE, "websocket".to_string()),
            (CONNECTION, "Upgrade".to_string()),
            (SEC_WEBSOCKET_ACCEPT, accept),
        ],
    )
        .into_response()
}

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("send timed out")]
    Timeout,
}

async fn send<S>(
    framed: &mut Framed<S, FrameCodec>,
    frame: Frame,
    timeout: Duration,
) -> Result<(), SendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, framed.send(frame)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SendError::Timeout),
    }
}

/// Runs the message loop for one upgraded connection until the peer closes,
/// a framing or dispatch error occurs, or the server asks it to stop.
pub async fn serve_connection<S>(io: S, route: String, record: Arc<ServiceRecord>, state: AppState)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (handle, mut close_rx) = state.connections.register(&route);
    let _guard = state.shutdown.in_flight_guard();
    let mut shutdown_rx = state.shutdown.shutdown_receiver();
    let settings = &state.config.connection;
    let binary = !record.protocol.is_text();

    let mut framed = Framed::new(io, FrameCodec::new(settings.max_message_size));
    let mut buf = ReadBuffer::new();
    info!(id = handle.id.0, %route, "connection opened");

    let mut send_close = false;
    'conn: loop {
        tokio::select! {
            next = framed.next() => match next {
                Some(Ok(message)) => {
                    for ping in message.pings {
                        let pong = Frame::pong(ping);
                        if let Err(e) = send(&mut framed, pong, settings.send_timeout).await {
                            warn!(id = handle.id.0, error = %e, "failed to send pong");
                            break 'conn;
                        }
                    }
                    if !message.payload.is_empty() {
                        buf.push(&message.payload);
                        let replies = match dispatch_all(&mut buf, &record) {
                            Ok(replies) => replies,
                            Err(e) => {
                                warn!(id = handle.id.0, error = %e, "dispatch failed, closing");
                                break;
                            }
                        };
                        for reply in replies {
                            let frame = Frame::message(reply, binary);
                            if let Err(e) = send(&mut framed, frame, settings.send_timeout).await {
                                warn!(id = handle.id.0, error = %e, "failed to send reply");
                                break 'conn;
                            }
                        }
                    }
                    if message.close {
                        debug!(id = handle.id.0, "peer closed");
                        send_close = true;
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(id = handle.id.0, error = %e, "framing error, closing");
                    break;
                }
                None => break,
            },
            reason = close_rx.recv() => {
                debug!(id = handle.id.0, reason = reason.as_deref().unwrap_or_default(), "close requested");
                send_close = true;
                break;
            }
            _ = async { shutdown_rx.wait_for(|stop| *stop).await.is_ok() } => {
                send_close = true;
                break;
            }
        }
    }

    if send_close {
        if let Err(e) = send(&mut framed, Frame::close(), settings.send_timeout).await {
            debug!(id = handle.id.0, error = %e, "close frame not sent");
        }
    }
    state.connections.remove(handle.id);
    let open_ms = u64::try_from(handle.connected_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    info!(id = handle.id.0, %route, open_ms, "connection closed");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::HeaderValue;
    use bytes::{Bytes, BytesMut};
    use rpcweb_core::{
        ApplicationException, ApplicationExceptionKind, DecodedMessage, MessageType, Opcode,
        ProtocolKind,
    };
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::network::handlers::test_support::{
        add_call, calc_state, malformed_add_call, read_sum,
    };

    const KEY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    type Client = Framed<DuplexStream, FrameCodec>;

    fn masked(payload: &[u8], binary: bool) -> Frame {
        Frame {
            mask: Some(KEY),
            ..Frame::message(Bytes::copy_from_slice(payload), binary)
        }
    }

    fn open(protocol: ProtocolKind) -> (AppState, Arc<AtomicUsize>, Client, JoinHandle<()>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let (state, record) = calc_state(Arc::clone(&calls), protocol);
        let (client, server) = duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(
            server,
            "/calc".to_string(),
            record,
            state.clone(),
        ));
        (state, calls, Framed::new(client, FrameCodec::default()), task)
    }

    async fn recv(client: &mut Client) -> DecodedMessage {
        client.next().await.unwrap().unwrap()
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(!is_upgrade_request(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(!is_upgrade_request(&headers));
    }

    #[tokio::test]
    async fn unknown_route_is_forbidden() {
        let (state, _) = calc_state(Arc::new(AtomicUsize::new(0)), ProtocolKind::Binary);
        let request = Request::builder()
            .uri("/missing")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = handle_upgrade(state, request).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_key_is_a_bad_request() {
        let (state, _) = calc_state(Arc::new(AtomicUsize::new(0)), ProtocolKind::Binary);
        let request = Request::builder()
            .uri("/calc")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = handle_upgrade(state, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn binary_call_gets_binary_reply() {
        let (state, calls, mut client, task) = open(ProtocolKind::Binary);

        client
            .send(masked(&add_call(ProtocolKind::Binary, 1, 2, 3), true))
            .await
            .unwrap();
        let reply = recv(&mut client).await;
        assert!(reply.binary);
        assert_eq!(read_sum(ProtocolKind::Binary, &reply.payload), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.connections.count_on_route("/calc"), 1);

        client.send(Frame { mask: Some(KEY), ..Frame::close() }).await.unwrap();
        assert!(recv(&mut client).await.close);
        task.await.unwrap();
        assert_eq!(state.connections.count(), 0);
        assert_eq!(state.shutdown.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn json_reply_uses_text_frames() {
        let (_state, _calls, mut client, task) = open(ProtocolKind::Json);

        client
            .send(masked(&add_call(ProtocolKind::Json, 4, 40, 2), false))
            .await
            .unwrap();
        let reply = recv(&mut client).await;
        assert!(!reply.binary);
        assert_eq!(read_sum(ProtocolKind::Json, &reply.payload), 42);

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn message_split_across_frames_is_retried() {
        let (_state, calls, mut client, task) = open(ProtocolKind::Binary);

        let bytes = add_call(ProtocolKind::Binary, 1, 7, 8);
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        client.send(masked(head, true)).await.unwrap();
        client.send(masked(tail, true)).await.unwrap();

        let reply = recv(&mut client).await;
        assert_eq!(read_sum(ProtocolKind::Binary, &reply.payload), 15);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn valid_call_after_undecodable_one_is_answered() {
        let (_state, calls, mut client, task) = open(ProtocolKind::Binary);

        client.send(masked(&malformed_add_call(1), true)).await.unwrap();
        let reply = recv(&mut client).await;
        let mut buf = ReadBuffer::new();
        buf.push(&reply.payload);
        let mut input = ProtocolKind::Binary.input(&mut buf);
        let header = input.read_message_begin().unwrap();
        assert_eq!(header.message_type, MessageType::Exception);
        let exception = ApplicationException::read(input.as_mut()).unwrap();
        assert_eq!(exception.kind, ApplicationExceptionKind::ProtocolError);

        client
            .send(masked(&add_call(ProtocolKind::Binary, 2, 20, 22), true))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), recv(&mut client))
            .await
            .unwrap();
        assert_eq!(read_sum(ProtocolKind::Binary, &reply.payload), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (_state, _calls, mut client, task) = open(ProtocolKind::Binary);

        let ping = Frame {
            mask: Some(KEY),
            opcode: Opcode::Ping,
            ..Frame::message(Bytes::from_static(b"hb"), true)
        };
        client.send(ping).await.unwrap();

        let mut raw = client.into_inner();
        let mut pong = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), raw.read_exact(&mut pong))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pong, [0x8A, 0x02, b'h', b'b']);

        drop(raw);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn close_request_sends_close_frame() {
        let (state, _calls, mut client, task) = open(ProtocolKind::Binary);

        // Round trip first so the connection is registered.
        client
            .send(masked(&add_call(ProtocolKind::Binary, 1, 1, 1), true))
            .await
            .unwrap();
        recv(&mut client).await;

        for handle in state.connections.drain_all() {
            assert!(handle.request_close("server shutting down"));
        }
        assert!(recv(&mut client).await.close);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_signal_closes_connection() {
        let (state, _calls, mut client, task) = open(ProtocolKind::Binary);
        state.shutdown.trigger_shutdown();
        assert!(recv(&mut client).await.close);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn framing_error_terminates_connection() {
        let (state, calls, client, task) = open(ProtocolKind::Binary);
        let mut raw = client.into_inner();

        // Reserved bits set.
        let mut bad = BytesMut::from(&[0xf2u8, 0x80][..]);
        bad.extend_from_slice(&KEY);
        raw.write_all(&bad).await.unwrap();

        task.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.connections.count(), 0);
    }
}
