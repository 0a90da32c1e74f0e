//! Raw TCP transport.
//!
//! Newline-delimited JSON frames over a plain TCP socket, for constrained
//! embedded peers that cannot afford a WebSocket stack. One line on the wire
//! is one envelope; the trailing `\n` is the frame boundary.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

use super::{EventStream, FrameSink, Transport, TransportEvent, TransportLink};

// ============================================================================
// TcpTransport
// ============================================================================

/// Dialer for `tcp://host:port` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    /// Creates the transport.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, endpoint: &Url) -> Result<TransportLink> {
        let host = endpoint
            .host_str()
            .ok_or_else(|| Error::config(format!("endpoint has no host: {endpoint}")))?;
        let port = endpoint
            .port()
            .ok_or_else(|| Error::config(format!("endpoint has no port: {endpoint}")))?;

        let socket = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::connection(format!("TCP connect failed: {e}")))?;

        debug!(endpoint = %endpoint, "TCP connection established");

        let (read, write) = socket.into_split();
        let ready = Arc::new(AtomicBool::new(true));
        let events = spawn_reader(read, Arc::clone(&ready));

        Ok(TransportLink {
            sink: Box::new(TcpSink {
                write,
                ready: Arc::clone(&ready),
            }),
            events,
            ready,
        })
    }
}

// ============================================================================
// TcpSink
// ============================================================================

/// Write half of a TCP link.
struct TcpSink {
    write: OwnedWriteHalf,
    ready: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.write.write_all(frame.as_bytes()).await?;
        self.write.write_all(b"\n").await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.ready.store(false, Ordering::SeqCst);
        let _ = self.write.shutdown().await;
    }
}

// ============================================================================
// Reader Task
// ============================================================================

/// Spawns the reader task and returns its event stream.
fn spawn_reader(read: OwnedReadHalf, ready: Arc<AtomicBool>) -> EventStream {
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut lines = BufReader::new(read).lines();

        let reason = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    trace!(len = line.len(), "Frame received");
                    if event_tx.send(TransportEvent::Frame(line)).is_err() {
                        return;
                    }
                }

                Ok(None) => break "connection closed".to_string(),

                Err(e) => {
                    let _ = event_tx.send(TransportEvent::Error(e.into()));
                    break "transport error".to_string();
                }
            }
        };

        ready.store(false, Ordering::SeqCst);
        debug!(reason = %reason, "TCP stream ended");
        let _ = event_tx.send(TransportEvent::Closed { reason });
    });

    Box::pin(stream::unfold(event_rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    }))
}

// ============================================================================
// Tests
// ============================================================================
