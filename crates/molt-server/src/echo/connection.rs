//! Per-connection echo loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use molt_ecdysis::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::drain::DrainGuard;
use super::Inner;

const READ_CHUNK: usize = 4096;

/// Longest line buffered before it is answered in pieces.
pub(super) const MAX_LINE: usize = READ_CHUNK;

/// A live connection and the bytes read from it but not yet answered.
pub(super) struct Connection {
    pub id: String,
    pub stream: Stream,
    pub pending: Vec<u8>,
}

enum Exit {
    Closed(&'static str),
    HandedOff,
}

/// Serve one connection until the peer leaves, an I/O error occurs or the
/// token fires.
pub(super) async fn serve(
    inner: Arc<Inner>,
    conn: Connection,
    cancel: CancellationToken,
    _guard: DrainGuard,
) {
    let Connection {
        id,
        mut stream,
        mut pending,
    } = conn;

    let exit = run_loop(&inner, &mut stream, &mut pending, &cancel).await;

    match exit {
        Exit::HandedOff => {
            // The registered duplicate keeps the socket open for the next owner.
            inner.park(&id, pending);
            debug!(conn_id = %id, "Connection parked for hand-off");
        }
        Exit::Closed(reason) => {
            inner.close(&id);
            debug!(conn_id = %id, reason, "Connection closed");
        }
    }
}

async fn run_loop(
    inner: &Inner,
    stream: &mut Stream,
    pending: &mut Vec<u8>,
    cancel: &CancellationToken,
) -> Exit {
    let mut chunk = [0u8; READ_CHUNK];
    let mut scanned = 0;
    loop {
        while let Some(line) = take_line(pending, &mut scanned) {
            let reply = echo_reply(inner.generation, &line);
            match timeout(inner.write_timeout, stream.write_all(&reply)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Exit::Closed("write error"),
                Err(_) => return Exit::Closed("write timeout"),
            }
        }

        if cancel.is_cancelled() {
            if inner.transferring.load(Ordering::SeqCst) {
                return Exit::HandedOff;
            }
            return Exit::Closed("shutdown");
        }

        match timeout(inner.read_poll, stream.read(&mut chunk)).await {
            Err(_) => continue,
            Ok(Ok(0)) => return Exit::Closed("eof"),
            Ok(Ok(n)) => pending.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => return Exit::Closed("read error"),
        }
    }
}

/// Split the next line to answer off the front of `pending`.
///
/// A complete line comes back without its `\n` or `\r\n`. A line longer than
/// [`MAX_LINE`] comes back in `MAX_LINE` pieces, so the buffer stays bounded.
/// `scanned` counts the leading bytes already known to hold no newline.
fn take_line(pending: &mut Vec<u8>, scanned: &mut usize) -> Option<Vec<u8>> {
    let from = (*scanned).min(pending.len());
    if let Some(pos) = pending[from..].iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = pending.drain(..=from + pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        *scanned = 0;
        return Some(line);
    }
    if pending.len() >= MAX_LINE {
        let piece = pending.drain(..MAX_LINE).collect();
        *scanned = pending.len();
        return Some(piece);
    }
    *scanned = pending.len();
    None
}

fn echo_reply(generation: u32, line: &[u8]) -> Vec<u8> {
    let mut reply = format!("[{generation}]echo ").into_bytes();
    reply.extend_from_slice(line);
    reply.push(b'\n');
    reply
}
