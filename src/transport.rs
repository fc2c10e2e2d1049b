//! Byte-level transports beneath the RPC multiplexer.
//!
//! Two transports share one message shape: a line-oriented stream (stdio)
//! where every message is a single `\n`-terminated UTF-8 line holding one
//! JSON object, and a one-shot exchange (HTTP) where the request body is
//! the sole inbound message and the first outbound frame closes the
//! response.

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use futures::{AsyncRead, AsyncWrite, channel::oneshot};
use parking_lot::Mutex;
use serde::Serialize;

use crate::Error;

/// Serializes a message into a newline-terminated frame.
///
/// JSON escaping guarantees no literal `\n`/`\r` inside the payload; a
/// frame that would violate that surfaces as a transport-level failure
/// rather than corrupting the stream.
pub fn encode_frame(message: &impl Serialize) -> Result<Vec<u8>, Error> {
    let mut line = serde_json::to_vec(message).map_err(Error::into_internal_error)?;
    if line.iter().any(|b| *b == b'\n' || *b == b'\r') {
        return Err(Error::internal_error().with_data("frame contains embedded newline"));
    }
    line.push(b'\n');
    Ok(line)
}

// In-process byte pipe

struct PipeState {
    buffer: VecDeque<u8>,
    closed: bool,
    read_waker: Option<Waker>,
}

/// Creates an in-process unidirectional byte pipe.
///
/// The buffer is unbounded, so bytes written before any reader attaches
/// are retained and delivered once reading starts.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let state = Arc::new(Mutex::new(PipeState {
        buffer: VecDeque::new(),
        closed: false,
        read_waker: None,
    }));
    (
        PipeWriter {
            state: state.clone(),
        },
        PipeReader { state },
    )
}

pub struct PipeWriter {
    state: Arc<Mutex<PipeState>>,
}

pub struct PipeReader {
    state: Arc<Mutex<PipeState>>,
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        if state.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe closed",
            )));
        }
        state.buffer.extend(buf);
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        if !state.buffer.is_empty() {
            let n = buf.len().min(state.buffer.len());
            for slot in buf.iter_mut().take(n) {
                *slot = state.buffer.pop_front().expect("length checked");
            }
            return Poll::Ready(Ok(n));
        }
        if state.closed {
            return Poll::Ready(Ok(0));
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

// One-shot (HTTP) exchange

/// Builds the transport halves for a single HTTP exchange.
///
/// The body must hold exactly one JSON object; anything else is a framing
/// failure the caller maps to a 500 reply via [`HttpReply::failure`].
pub fn one_shot(body: impl Into<Vec<u8>>) -> Result<(OneShotReader, OneShotWriter, ReplyHandle), Error> {
    let body = body.into();
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| Error::internal_error().with_data(format!("invalid request body: {e}")))?;
    if !value.is_object() {
        return Err(Error::internal_error().with_data("request body must be a JSON object"));
    }
    let expects_response = value.get("id").is_some() && value.get("method").is_some();

    let mut line = body;
    line.push(b'\n');
    let (frame_tx, frame_rx) = oneshot::channel();
    let reader = OneShotReader { line: Some(line) };
    let writer = OneShotWriter {
        pending: Vec::new(),
        frame_tx: Some(frame_tx),
        complete: false,
    };
    let reply = ReplyHandle {
        frame_rx,
        expects_response,
    };
    Ok((reader, writer, reply))
}

/// Yields the request body as one line, then stays open without further
/// data so in-flight handlers can still write their response.
pub struct OneShotReader {
    line: Option<Vec<u8>>,
}

impl AsyncRead for OneShotReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.line.as_mut() {
            Some(line) if !line.is_empty() => {
                let n = buf.len().min(line.len());
                buf[..n].copy_from_slice(&line[..n]);
                line.drain(..n);
                Poll::Ready(Ok(n))
            }
            // Exhausted. Never signal EOF: the response may not have been
            // written yet, and the owning task is dropped with the exchange.
            _ => Poll::Pending,
        }
    }
}

/// Accepts exactly one outbound frame; any write past the first completed
/// frame fails loudly.
pub struct OneShotWriter {
    pending: Vec<u8>,
    frame_tx: Option<oneshot::Sender<Vec<u8>>>,
    complete: bool,
}

impl AsyncWrite for OneShotWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.complete {
            return Poll::Ready(Err(io::Error::other(
                "HTTP stream does not support multiple writes",
            )));
        }
        this.pending.extend_from_slice(buf);
        if let Some(newline) = this.pending.iter().position(|b| *b == b'\n') {
            if newline + 1 != this.pending.len() {
                return Poll::Ready(Err(io::Error::other(
                    "HTTP stream does not support multiple writes",
                )));
            }
            let frame = std::mem::take(&mut this.pending);
            this.complete = true;
            if let Some(tx) = this.frame_tx.take() {
                tx.send(frame).ok();
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.frame_tx.take();
        Poll::Ready(Ok(()))
    }
}

/// Resolves the exchange into an HTTP reply once the outcome is known.
pub struct ReplyHandle {
    frame_rx: oneshot::Receiver<Vec<u8>>,
    expects_response: bool,
}

impl ReplyHandle {
    /// Waits for the single outbound frame (for requests) or resolves
    /// immediately with "no content" (for notifications).
    pub async fn into_reply(self) -> HttpReply {
        if !self.expects_response {
            return HttpReply::no_content();
        }
        match self.frame_rx.await {
            Ok(mut frame) => {
                if frame.last() == Some(&b'\n') {
                    frame.pop();
                }
                HttpReply::ok(frame)
            }
            Err(_) => HttpReply::no_content(),
        }
    }
}

/// The materialized HTTP response for a one-shot exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl HttpReply {
    fn base_headers(content: bool) -> Vec<(&'static str, String)> {
        let mut headers = vec![("Access-Control-Allow-Origin", "*".to_string())];
        if content {
            headers.push(("Content-Type", "application/json".to_string()));
        }
        headers
    }

    pub fn ok(body: Vec<u8>) -> Self {
        HttpReply {
            status: 200,
            headers: Self::base_headers(true),
            body,
        }
    }

    pub fn no_content() -> Self {
        HttpReply {
            status: 204,
            headers: Self::base_headers(false),
            body: Vec::new(),
        }
    }

    /// A transport failure: a 500 carrying a JSON-RPC internal-error
    /// envelope describing what went wrong.
    pub fn failure(error: Error) -> Self {
        let envelope = serde_json::json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {
                "code": -32603,
                "message": "Internal error",
                "data": error.to_string(),
            },
        });
        HttpReply {
            status: 500,
            headers: Self::base_headers(true),
            body: serde_json::to_vec(&envelope).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn pipe_preserves_bytes_written_before_reading_starts() {
        let (mut writer, mut reader) = pipe();
        writer.write_all(b"buffered before attach\n").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"buffered before attach\n");
    }

    #[tokio::test]
    async fn pipe_reports_eof_after_writer_drops() {
        let (writer, mut reader) = pipe();
        drop(writer);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn one_shot_rejects_second_frame() {
        let (_reader, mut writer, reply) =
            one_shot(br#"{"jsonrpc":"2.0","id":1,"method":"x"}"#.to_vec()).unwrap();

        writer.write_all(b"{\"id\":1,\"result\":{}}\n").await.unwrap();
        let err = writer.write_all(b"{\"id\":2}\n").await.unwrap_err();
        assert!(
            err.to_string()
                .contains("HTTP stream does not support multiple writes")
        );

        let reply = reply.into_reply().await;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"{\"id\":1,\"result\":{}}".to_vec());
    }

    #[tokio::test]
    async fn one_shot_notification_resolves_no_content() {
        let (_reader, _writer, reply) =
            one_shot(br#"{"jsonrpc":"2.0","method":"session/cancel","params":{}}"#.to_vec())
                .unwrap();
        let reply = reply.into_reply().await;
        assert_eq!(reply.status, 204);
        assert!(reply.body.is_empty());
        assert!(
            reply
                .headers
                .iter()
                .any(|(k, v)| *k == "Access-Control-Allow-Origin" && v == "*")
        );
    }

    #[test]
    fn one_shot_rejects_non_object_bodies() {
        assert!(one_shot(b"[1,2,3]".to_vec()).is_err());
        assert!(one_shot(b"not json".to_vec()).is_err());
    }

    #[test]
    fn encode_frame_appends_newline() {
        let frame = encode_frame(&serde_json::json!({"a": "b\nc"})).unwrap();
        assert_eq!(frame, b"{\"a\":\"b\\nc\"}\n".to_vec());
    }
}
