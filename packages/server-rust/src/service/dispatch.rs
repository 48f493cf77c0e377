//! Dispatch pipeline: buffered bytes in, flushed reply bytes out.
//!
//! Each message runs the route's processor over an input protocol reading
//! the connection's [`ReadBuffer`] and an output protocol writing a fresh
//! [`OutputBuffer`](rpcweb_core::OutputBuffer). A buffer underrun rolls the
//! read position back so the same bytes are decoded again once more arrive.

use bytes::Bytes;
use rpcweb_core::{Error, OutputBuffer, ReadBuffer, TransportKind};
use tracing::{debug, warn};

use super::registry::ServiceRecord;

/// Result of dispatching one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A whole message was consumed or dropped as undecodable; holds
    /// everything the processor flushed (empty for one-way calls).
    Reply(Bytes),
    /// Not enough bytes yet; the read position was rolled back.
    Incomplete,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The processor failed for a reason other than an underrun.
    #[error("processor failed: {0}")]
    Processor(#[source] Error),
    /// The processor returned without consuming any input.
    #[error("processor consumed no input")]
    NoProgress,
}

/// Whether the whole message has been read once its header is decoded.
///
/// JSON messages are parsed as one document and framed input is read a
/// frame at a time; only the binary protocol over a buffered transport
/// leaves the end of an undecodable message unknown.
fn message_is_delimited(record: &ServiceRecord) -> bool {
    record.transport == TransportKind::Framed || record.protocol.is_text()
}

fn run(buf: &mut ReadBuffer, record: &ServiceRecord, output: &mut OutputBuffer) -> Result<(), Error> {
    let transport = record.transport.open_input(buf)?;
    let mut input = record.protocol.input(transport);
    let mut out = record.protocol.output(output);
    record.processor.process(input.as_mut(), out.as_mut())
}

/// Dispatches the next message in `buf`.
///
/// # Errors
///
/// Returns [`DispatchError`] when the stream cannot continue; the read
/// position is rolled back and nothing is emitted.
pub fn dispatch_one(
    buf: &mut ReadBuffer,
    record: &ServiceRecord,
) -> Result<Dispatched, DispatchError> {
    let mut output = record.transport.output_buffer();
    match run(buf, record, &mut output) {
        Ok(()) if buf.position() == 0 => {
            buf.rollback_position();
            Err(DispatchError::NoProgress)
        }
        Ok(()) => {
            let consumed = buf.position();
            buf.commit_position();
            let reply = output.take_flushed();
            debug!(consumed, reply_len = reply.len(), "message dispatched");
            Ok(Dispatched::Reply(reply))
        }
        Err(Error::Discarded(e)) => {
            if !message_is_delimited(record) {
                buf.skip_remaining();
            }
            let dropped = buf.position();
            buf.commit_position();
            warn!(error = %e, dropped, "undecodable message dropped");
            Ok(Dispatched::Reply(output.take_flushed()))
        }
        Err(e) if e.is_underrun() => {
            buf.rollback_position();
            debug!(buffered = buf.len(), "incomplete message, awaiting more bytes");
            Ok(Dispatched::Incomplete)
        }
        Err(e) => {
            buf.rollback_position();
            warn!(error = %e, "dispatch failed");
            Err(DispatchError::Processor(e))
        }
    }
}

/// Dispatches every complete message in `buf`, returning the non-empty replies
/// in order. Stops at the first incomplete message.
///
/// # Errors
///
/// Propagates the first [`DispatchError`]; replies produced before it are lost.
pub fn dispatch_all(
    buf: &mut ReadBuffer,
    record: &ServiceRecord,
) -> Result<Vec<Bytes>, DispatchError> {
    let mut replies = Vec::new();
    while buf.remaining() > 0 {
        match dispatch_one(buf, record)? {
            Dispatched::Reply(reply) => {
                if !reply.is_empty() {
                    replies.push(reply);
                }
            }
            Dispatched::Incomplete => break,
        }
    }
    Ok(replies)
}
