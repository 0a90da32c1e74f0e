//! WebSocket transport.
//!
//! Dials `ws://` / `wss://` endpoints via `tokio-tungstenite`. A spawned
//! reader task maps the socket stream onto the ordered [`TransportEvent`]
//! sequence; binary, ping and pong frames are ignored.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt, stream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

use super::{EventStream, FrameSink, Transport, TransportEvent, TransportLink};

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Dialer for WebSocket endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Creates the transport.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn dial(&self, endpoint: &Url) -> Result<TransportLink> {
        let (ws_stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| Error::connection(format!("WebSocket connect failed: {e}")))?;

        debug!(endpoint = %endpoint, "WebSocket connection established");

        let (write, read) = ws_stream.split();
        let ready = Arc::new(AtomicBool::new(true));
        let events = spawn_reader(read, Arc::clone(&ready));

        Ok(TransportLink {
            sink: Box::new(WsSink {
                write,
                ready: Arc::clone(&ready),
            }),
            events,
            ready,
        })
    }
}

// ============================================================================
// WsSink
// ============================================================================

/// Write half of a WebSocket link.
struct WsSink {
    write: SplitSink<WsStream, Message>,
    ready: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.write.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.ready.store(false, Ordering::SeqCst);
        let _ = self.write.close().await;
    }
}

// ============================================================================
// Reader Task
// ============================================================================

/// Spawns the reader task and returns its event stream.
///
/// The task owns the read half and guarantees the
/// `Frame* → Error? → Closed` ordering, emitting exactly one `Closed`.
fn spawn_reader(mut read: SplitStream<WsStream>, ready: Arc<AtomicBool>) -> EventStream {
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    trace!(len = text.len(), "Frame received");
                    if event_tx.send(TransportEvent::Frame(text.to_string())).is_err() {
                        return;
                    }
                }

                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by peer".to_string());
                }

                Some(Err(e)) => {
                    let _ = event_tx.send(TransportEvent::Error(e.into()));
                    break "transport error".to_string();
                }

                None => break "connection closed".to_string(),

                // Ignore Binary, Ping, Pong, Frame
                Some(Ok(_)) => {}
            }
        };

        ready.store(false, Ordering::SeqCst);
        debug!(reason = %reason, "WebSocket stream ended");
        let _ = event_tx.send(TransportEvent::Closed { reason });
    });

    Box::pin(stream::unfold(event_rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    }))
}

// ============================================================================
// Tests
// ============================================================================
