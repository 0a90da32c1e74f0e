//! Channel-backed mock transport for tests.
//!
//! Each dial hands the test a [`MockConn`] controller: inject inbound
//! frames, force errors and closes, flip readiness, and observe everything
//! the client wrote.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

use crate::error::{Error, Result};

use super::{FrameSink, Transport, TransportEvent, TransportLink};

// ============================================================================
// Constants
// ============================================================================

/// Patience for test-side expectations. Generous so that, under a paused
/// clock, auto-advance always reaches a pending backoff timer first.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Window in which something expected NOT to happen may still happen.
const QUIET_WINDOW: Duration = Duration::from_millis(250);

// ============================================================================
// MockTransport
// ============================================================================

/// Scriptable in-memory transport.
pub(crate) struct MockTransport {
    inner: Arc<MockInner>,
}

struct MockInner {
    conn_tx: mpsc::UnboundedSender<MockConn>,
    fail_next_dials: parking_lot::Mutex<u32>,
}

impl MockTransport {
    /// Creates the transport and its test-side handle.
    pub(crate) fn new() -> (Self, MockHandle) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MockInner {
            conn_tx,
            fail_next_dials: parking_lot::Mutex::new(0),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            MockHandle { conn_rx, inner },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(&self, endpoint: &Url) -> Result<TransportLink> {
        {
            let mut remaining = self.inner.fail_next_dials.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::connection("dial refused by mock"));
            }
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicBool::new(true));
        let fail_sends = Arc::new(AtomicBool::new(false));

        let conn = MockConn {
            endpoint: endpoint.clone(),
            event_tx,
            sent_rx,
            ready: Arc::clone(&ready),
            fail_sends: Arc::clone(&fail_sends),
        };
        // Receiver gone means the test does not care about this dial.
        let _ = self.inner.conn_tx.send(conn);

        Ok(TransportLink {
            sink: Box::new(MockSink {
                sent_tx,
                fail_sends,
            }),
            events: Box::pin(stream::unfold(event_rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })),
            ready,
        })
    }
}

// ============================================================================
// MockHandle
// ============================================================================

/// Test-side handle observing dials.
pub(crate) struct MockHandle {
    conn_rx: mpsc::UnboundedReceiver<MockConn>,
    inner: Arc<MockInner>,
}

impl MockHandle {
    /// Waits for the next dial and returns its connection controller.
    pub(crate) async fn next_conn(&mut self) -> MockConn {
        timeout(EXPECT_TIMEOUT, self.conn_rx.recv())
            .await
            .expect("timed out waiting for a dial")
            .expect("transport dropped")
    }

    /// Asserts that no dial happens within a quiet window.
    pub(crate) async fn expect_no_conn(&mut self) {
        let outcome = timeout(QUIET_WINDOW, self.conn_rx.recv()).await;
        assert!(outcome.is_err(), "unexpected dial");
    }

    /// Makes the next `count` dials fail with a connection error.
    pub(crate) fn fail_next_dials(&self, count: u32) {
        *self.inner.fail_next_dials.lock() = count;
    }
}

// ============================================================================
// MockConn
// ============================================================================

/// Controller for one dialed connection.
pub(crate) struct MockConn {
    /// Endpoint the client dialed.
    pub(crate) endpoint: Url,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    sent_rx: mpsc::UnboundedReceiver<String>,
    ready: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

impl MockConn {
    /// Injects an inbound frame.
    pub(crate) fn inject_frame(&self, frame: &str) {
        let _ = self.event_tx.send(TransportEvent::Frame(frame.to_string()));
    }

    /// Injects a transport error (without closing).
    pub(crate) fn inject_error(&self, error: Error) {
        let _ = self.event_tx.send(TransportEvent::Error(error));
    }

    /// Closes the connection from the peer side.
    pub(crate) fn close(&self, reason: &str) {
        self.ready.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(TransportEvent::Closed {
            reason: reason.to_string(),
        });
    }

    /// Flips the readiness flag without emitting any event.
    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Makes subsequent writes fail.
    pub(crate) fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Waits for the next frame written by the client.
    pub(crate) async fn next_sent(&mut self) -> String {
        timeout(EXPECT_TIMEOUT, self.sent_rx.recv())
            .await
            .expect("timed out waiting for a write")
            .expect("sink dropped")
    }

    /// Asserts that nothing is written within a quiet window.
    pub(crate) async fn expect_no_sent(&mut self) {
        let outcome = timeout(QUIET_WINDOW, self.sent_rx.recv()).await;
        assert!(outcome.is_err(), "unexpected write");
    }
}

// ============================================================================
// MockSink
// ============================================================================

struct MockSink {
    sent_tx: mpsc::UnboundedSender<String>,
    fail_sends: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: String) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::connection("write refused by mock"));
        }
        self.sent_tx
            .send(frame)
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&mut self) {}
}
