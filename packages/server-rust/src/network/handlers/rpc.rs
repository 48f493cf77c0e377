//! POST handler: streams the request body through the dispatch pipeline.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::BytesMut;
use futures_util::StreamExt;
use rpcweb_core::transport::ReadTransport;
use rpcweb_core::{ProtocolKind, ReadBuffer};
use tracing::{debug, warn};

use super::AppState;
use crate::service::{dispatch_all, ServiceRecord};

/// Dispatches every message in the body, replying with the concatenated
/// reply bytes.
///
/// Each body chunk triggers a dispatch pass, so a message split across
/// chunks is completed when its tail arrives. Bytes still buffered when the
/// body ends are a truncated message and answered with 400.
pub async fn handle_post(state: &AppState, record: &ServiceRecord, body: Body) -> Response {
    let _guard = state.shutdown.in_flight_guard();
    let mut chunks = body.into_data_stream();
    let mut buf = ReadBuffer::new();
    let mut reply = BytesMut::new();

    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "failed to read request body");
                return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
            }
        };
        buf.push(&chunk);
        match dispatch_all(&mut buf, record) {
            Ok(replies) => replies.iter().for_each(|r| reply.extend_from_slice(r)),
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    if has_leftover(&buf, record.protocol) {
        debug!(buffered = buf.len(), "request body ended mid-message");
        return (StatusCode::BAD_REQUEST, "incomplete message").into_response();
    }

    (
        [(header::CONTENT_TYPE, record.protocol.content_type())],
        reply.freeze(),
    )
        .into_response()
}

fn has_leftover(buf: &ReadBuffer, protocol: ProtocolKind) -> bool {
    let rest = buf.chunk();
    if protocol.is_text() {
        !rest.iter().all(u8::is_ascii_whitespace)
    } else {
        !rest.is_empty()
    }
}
