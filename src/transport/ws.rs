//! WebSocket framing as a byte stream.
//!
//! The game protocol is byte-oriented; when a session runs over the secured
//! WebSocket transport, `WebSocketByteStream` flattens binary messages back
//! into an ordinary `AsyncRead + AsyncWrite` so the channel layer stays
//! transport-agnostic.

use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{RelayError, Result};

use super::AsyncStream;

/// Upper bound for one WebSocket message; game frames are tiny, so anything
/// near this is hostile or corrupt.
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

fn bounded_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_SIZE))
        .max_frame_size(Some(MAX_MESSAGE_SIZE))
}

/// Accept a WebSocket handshake on the local (server) side and wrap it.
pub async fn upgrade_websocket_server<S: AsyncStream + 'static>(
    stream: S,
) -> Result<WebSocketByteStream<S>> {
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(bounded_config()))
        .await
        .map_err(|e| RelayError::TransportUpgrade(format!("WebSocket accept failed: {}", e)))?;
    Ok(WebSocketByteStream::new(ws))
}

/// Perform a WebSocket client handshake against `host` over an already
/// established (typically TLS) stream and wrap it.
pub async fn upgrade_websocket_client<S: AsyncStream + 'static>(
    stream: S,
    host: &str,
) -> Result<WebSocketByteStream<S>> {
    let url = format!("wss://{}/", host);
    let (ws, _response) =
        tokio_tungstenite::client_async_with_config(url, stream, Some(bounded_config()))
            .await
            .map_err(|e| {
                RelayError::TransportUpgrade(format!("WebSocket client handshake failed: {}", e))
            })?;
    Ok(WebSocketByteStream::new(ws))
}

/// Byte-stream adapter over a WebSocket.
///
/// Reads surface the payload of binary messages, carrying any remainder
/// over to the next read; non-binary messages are skipped. Writes send one
/// binary message per write call and propagate backpressure as `Pending`.
pub struct WebSocketByteStream<S> {
    ws: Pin<Box<WebSocketStream<S>>>,
    read_buffer: Bytes,
    closed: bool,
}

impl<S: AsyncStream + 'static> WebSocketByteStream<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws: Box::pin(ws),
            read_buffer: Bytes::new(),
            closed: false,
        }
    }
}

impl<S: AsyncStream + 'static> AsyncRead for WebSocketByteStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buffer.is_empty() {
                let n = self.read_buffer.len().min(buf.remaining());
                buf.put_slice(&self.read_buffer[..n]);
                self.read_buffer = self.read_buffer.slice(n..);
                return Poll::Ready(Ok(()));
            }
            if self.closed {
                return Poll::Ready(Ok(()));
            }

            match Stream::poll_next(self.ws.as_mut(), cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buffer = data;
                    // Loop back to drain into buf
                }
                Poll::Ready(Some(Ok(Message::Close(_))) | Some(Err(_)) | None) => {
                    self.closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(_))) => {
                    // Ping/pong/text: nothing to surface, poll again
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncStream + 'static> AsyncWrite for WebSocketByteStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "WebSocket closed",
            )));
        }

        match Sink::poll_ready(self.ws.as_mut(), cx) {
            Poll::Ready(Ok(())) => {
                let message = Message::Binary(Bytes::copy_from_slice(buf));
                match Sink::start_send(self.ws.as_mut(), message) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::other(format!(
                        "WebSocket send error: {}",
                        e
                    )))),
                }
            }
            Poll::Ready(Err(e)) => {
                Poll::Ready(Err(io::Error::other(format!("WebSocket error: {}", e))))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Sink::poll_flush(self.ws.as_mut(), cx)
            .map_err(|e| io::Error::other(format!("WebSocket flush error: {}", e)))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.closed = true;
        Sink::poll_close(self.ws.as_mut(), cx)
            .map_err(|e| io::Error::other(format!("WebSocket close error: {}", e)))
    }
}
