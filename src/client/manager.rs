//! Connection manager and public client handle.
//!
//! The manager is a single-owner event loop task: it holds the one active
//! transport link and performs every mutation of the connection state, the
//! authentication flag and the reconnect attempt counter. The [`Client`]
//! handle talks to it over a command channel; status reads and queue/listener
//! operations go through shared state guarded by locks.
//!
//! # Event Loop
//!
//! The spawned task handles:
//!
//! - Commands from the [`Client`] handle (connect, disconnect, transmit)
//! - Events from the open transport link (frames, errors, close)
//! - Dial outcomes from spawned connect attempts
//! - Expiry of the scheduled reconnect attempt
//!
//! Dial attempts are tagged with a generation counter so that an outcome
//! arriving after `disconnect` (or after a newer `connect`) is discarded
//! instead of resurrecting a dead connection.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::client::backoff::ScheduledAttempt;
use crate::client::listeners::{ListenerTable, Listeners, Slot};
use crate::client::queue::OutboundQueue;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, ErrorPayload, message_type};
use crate::transport::{
    EventStream, FrameSink, Transport, TransportEvent, TransportLink, WebSocketTransport,
};

// ============================================================================
// ConnectionState
// ============================================================================

/// Connection lifecycle state.
///
/// Owned exclusively by the manager task; read by callers through
/// [`Client::connection_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport, no pending attempt.
    Disconnected,
    /// A dial is in flight.
    Connecting,
    /// The transport is open.
    Connected,
    /// A reconnect attempt is scheduled.
    Reconnecting,
    /// The last attempt failed; cleared by the next `connect`.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Command
// ============================================================================

/// Internal commands for the manager task.
enum Command {
    /// Open a connection, optionally to a non-default address.
    Connect { address: Option<String> },
    /// Close the connection and cancel any scheduled attempt.
    Disconnect,
    /// Write an envelope now (queueing on failure).
    Transmit(Envelope),
    /// Outcome of a spawned dial attempt.
    DialDone {
        generation: u64,
        outcome: Result<TransportLink>,
    },
    /// The scheduled reconnect attempt expired.
    RetryFired,
    /// Tear down the manager task.
    Shutdown,
}

// ============================================================================
// Shared
// ============================================================================

/// State shared between the handle and the manager task.
///
/// Only the manager mutates `state`, `authenticated` and the ready flag; the
/// queue and listener table are mutated through [`Client`] methods as well,
/// never by outside collaborators directly.
struct Shared {
    state: Mutex<ConnectionState>,
    authenticated: AtomicBool,
    ready: Mutex<Option<Arc<AtomicBool>>>,
    queue: Mutex<OutboundQueue>,
    listeners: Mutex<ListenerTable>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            authenticated: AtomicBool::new(false),
            ready: Mutex::new(None),
            queue: Mutex::new(OutboundQueue::new()),
            listeners: Mutex::new(ListenerTable::default()),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Transport-side readiness of the current link, `false` with no link.
    fn transport_ready(&self) -> bool {
        self.ready
            .lock()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn set_ready_flag(&self, flag: Option<Arc<AtomicBool>>) {
        *self.ready.lock() = flag;
    }

    // Handlers are cloned out of the table before invocation so a callback
    // may re-enter the registry without deadlocking.

    fn notify_connect(&self) {
        let handler = self.listeners.lock().connect();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn notify_disconnect(&self, reason: &str) {
        let handler = self.listeners.lock().disconnect();
        if let Some(handler) = handler {
            handler(reason);
        }
    }

    fn notify_error(&self, error: &Error) {
        let handler = self.listeners.lock().error();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    fn notify_reconnect(&self, attempt: u32) {
        let handler = self.listeners.lock().reconnect();
        if let Some(handler) = handler {
            handler(attempt);
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Handle to the GuideLink connection.
///
/// Cheap to clone; all clones talk to the same manager task. Construct one at
/// the application's composition root and pass it to collaborators; there is
/// no ambient global instance.
///
/// No public method returns a transport failure: `connect`, `disconnect` and
/// `send` absorb errors into the error listener slot and the outbound queue.
///
/// # Example
///
/// ```no_run
/// use guidelink::{Client, ClientConfig, Listeners};
/// use serde_json::json;
/// use url::Url;
///
/// # async fn example() -> guidelink::Result<()> {
/// let config = ClientConfig::new(Url::parse("wss://guidance.example.com/session")?);
/// let client = Client::new(config);
///
/// client.on(
///     Listeners::new()
///         .on_connect(|| println!("connected"))
///         .on_guidance_response(|envelope| println!("guidance: {:?}", envelope.payload)),
/// );
///
/// client.connect();
/// client.send("request_guidance", &json!({ "query": "nearest exit" }));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    /// Channel into the manager task.
    command_tx: mpsc::UnboundedSender<Command>,
    /// State shared with the manager task.
    shared: Arc<Shared>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.shared.state())
            .field("queued", &self.shared.queue.lock().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Client - Constructors
// ============================================================================

impl Client {
    /// Creates a client using the WebSocket transport.
    ///
    /// Spawns the manager task internally; must be called within a Tokio
    /// runtime.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(config, Arc::new(WebSocketTransport::new()))
    }

    /// Creates a client over a custom transport, e.g. the raw TCP variant
    /// for an embedded peer.
    #[must_use]
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());

        let task = ManagerTask {
            current_endpoint: config.endpoint.clone(),
            config,
            transport,
            shared: Arc::clone(&shared),
            command_tx: command_tx.clone(),
            command_rx,
            sink: None,
            events: None,
            attempts: 0,
            pending_retry: None,
            manual_disconnect: false,
            generation: 0,
        };
        tokio::spawn(task.run());

        Self { command_tx, shared }
    }
}

// ============================================================================
// Client - Connection Control
// ============================================================================

impl Client {
    /// Opens a connection to the configured default endpoint.
    ///
    /// No-op when already connecting or connected. A malformed configured
    /// address surfaces through the error listener slot, never as a return
    /// value.
    pub fn connect(&self) {
        let _ = self.command_tx.send(Command::Connect { address: None });
    }

    /// Opens a connection to a specific address instead of the default.
    pub fn connect_to(&self, address: impl Into<String>) {
        let _ = self.command_tx.send(Command::Connect {
            address: Some(address.into()),
        });
    }

    /// Closes the connection and cancels any scheduled reconnect attempt,
    /// so a manual disconnect never triggers an unwanted auto-reconnect.
    ///
    /// Idempotent: calling it with no active transport is a safe no-op.
    pub fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Disconnect);
    }

    /// Tears down the manager task. The client is unusable afterwards.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

// ============================================================================
// Client - Messaging
// ============================================================================

impl Client {
    /// Sends an envelope of the given type, assigning a fresh message id and
    /// timestamp.
    ///
    /// Transmitted immediately when connected; queued when disconnected or
    /// when the write fails. Never raises to the caller.
    pub fn send<P: Serialize>(&self, message_type: impl Into<String>, payload: &P) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                let error = Error::Json(e);
                warn!(error = %error, "Failed to serialize payload");
                self.shared.notify_error(&error);
                return;
            }
        };
        let envelope = Envelope::new(message_type, payload);

        if self.is_connected() {
            if let Err(rejected) = self.command_tx.send(Command::Transmit(envelope))
                && let Command::Transmit(envelope) = rejected.0
            {
                self.shared.queue.lock().push(envelope);
            }
        } else {
            debug!(message_type = %envelope.message_type, "Not connected, queueing envelope");
            self.shared.queue.lock().push(envelope);
        }
    }

    /// Sends the reserved `authenticate` envelope.
    pub fn authenticate<P: Serialize>(&self, payload: &P) {
        self.send(message_type::AUTHENTICATE, payload);
    }
}

// ============================================================================
// Client - Status
// ============================================================================

impl Client {
    /// Returns `true` iff the state is `Connected` and the transport's own
    /// readiness check concurs.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected && self.shared.transport_ready()
    }

    /// Returns the current connection state.
    #[inline]
    #[must_use]
    pub fn connection_status(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns `true` once the service has acknowledged authentication for
    /// the current connection.
    #[inline]
    #[must_use]
    pub fn authentication_status(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Client - Listeners & Queue
// ============================================================================

impl Client {
    /// Merges a partial listener set into the registry.
    ///
    /// Slots named in `listeners` overwrite previously registered handlers;
    /// other slots are untouched.
    pub fn on(&self, listeners: Listeners) {
        self.shared.listeners.lock().merge(listeners);
    }

    /// Removes the handler under the given slot.
    pub fn off(&self, slot: &Slot) {
        self.shared.listeners.lock().remove(slot);
    }

    /// Returns the number of envelopes awaiting transmission.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Discards all queued envelopes.
    pub fn clear_queue(&self) {
        self.shared.queue.lock().clear();
    }
}

// ============================================================================
// ManagerTask
// ============================================================================

/// One loop step, extracted so handlers can borrow `self` freely.
enum Step {
    Command(Option<Command>),
    Event(Option<TransportEvent>),
}

/// The event loop task behind [`Client`].
struct ManagerTask {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    /// Sender for self-addressed commands (dial outcomes, retry expiry).
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    /// Write half of the active link.
    sink: Option<Box<dyn FrameSink>>,
    /// Read half of the active link.
    events: Option<EventStream>,
    /// Reconnect attempt counter; reset on successful connection.
    attempts: u32,
    /// At most one scheduled attempt exists, which keeps two reconnection
    /// cycles from running concurrently.
    pending_retry: Option<ScheduledAttempt>,
    /// Set by `disconnect`, cleared by `connect`.
    manual_disconnect: bool,
    /// Dial generation; outcomes from older generations are discarded.
    generation: u64,
    /// Address of the last dial, reused by reconnect attempts.
    current_endpoint: Url,
}

impl ManagerTask {
    async fn run(mut self) {
        debug!("Connection manager started");

        loop {
            let step = tokio::select! {
                command = self.command_rx.recv() => Step::Command(command),
                event = Self::next_event(&mut self.events) => Step::Event(event),
            };

            match step {
                Step::Command(Some(Command::Shutdown)) => {
                    self.handle_disconnect().await;
                    break;
                }
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => break,
                Step::Event(Some(event)) => self.handle_transport_event(event).await,
                // Stream ended without a close event.
                Step::Event(None) => self.handle_closed("connection closed"),
            }
        }

        debug!("Connection manager terminated");
    }

    /// Next event from the active link; pends forever without one.
    async fn next_event(events: &mut Option<EventStream>) -> Option<TransportEvent> {
        match events {
            Some(stream) => stream.next().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { address } => self.handle_connect(address),
            Command::Disconnect => self.handle_disconnect().await,
            Command::Transmit(envelope) => self.handle_transmit(envelope).await,
            Command::DialDone {
                generation,
                outcome,
            } => self.handle_dial_done(generation, outcome).await,
            Command::RetryFired => self.handle_retry_fired(),
            // Handled in run() so it can break the loop.
            Command::Shutdown => {}
        }
    }

    // ========================================================================
    // Connect / Disconnect
    // ========================================================================

    fn handle_connect(&mut self, address: Option<String>) {
        let state = self.shared.state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(state = %state, "Connect ignored, already active");
            return;
        }

        self.manual_disconnect = false;
        // A manual connect supersedes any scheduled attempt.
        self.cancel_pending_retry();

        let endpoint = match address {
            Some(raw) => match Url::parse(&raw) {
                Ok(url) => url,
                Err(parse_err) => {
                    // Construction errors are configuration errors; they are
                    // surfaced once and never retried automatically.
                    let error = Error::from(parse_err);
                    error!(address = %raw, error = %error, "Malformed endpoint address");
                    self.shared.set_state(ConnectionState::Failed);
                    self.shared.notify_error(&error);
                    return;
                }
            },
            None => self.config.endpoint.clone(),
        };

        self.begin_dial(endpoint);
    }

    fn begin_dial(&mut self, endpoint: Url) {
        self.shared.set_state(ConnectionState::Connecting);
        self.generation += 1;
        let generation = self.generation;
        self.current_endpoint = endpoint.clone();
        debug!(endpoint = %endpoint, generation, "Dialing");

        let transport = Arc::clone(&self.transport);
        let command_tx = self.command_tx.clone();
        tokio::spawn(async move {
            let outcome = transport.dial(&endpoint).await;
            let _ = command_tx.send(Command::DialDone {
                generation,
                outcome,
            });
        });
    }

    async fn handle_dial_done(&mut self, generation: u64, outcome: Result<TransportLink>) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "Stale dial outcome discarded");
            return;
        }

        match outcome {
            Ok(link) => self.install_link(link).await,
            Err(dial_err) => {
                // A failed dial surfaces as error-then-close, matching the
                // event order of a transport that opened and broke.
                warn!(endpoint = %self.current_endpoint, error = %dial_err, "Connect attempt failed");
                self.shared.notify_error(&dial_err);
                self.handle_closed("connect failed");
            }
        }
    }

    async fn install_link(&mut self, link: TransportLink) {
        // A fresh successful connection cancels any outstanding attempt.
        self.cancel_pending_retry();
        self.sink = Some(link.sink);
        self.events = Some(link.events);
        self.shared.set_ready_flag(Some(link.ready));
        self.shared.set_state(ConnectionState::Connected);
        self.attempts = 0;

        info!(endpoint = %self.current_endpoint, "Connection established");
        self.shared.notify_connect();

        if let Some(token) = self.config.auth_token.clone() {
            let envelope = Envelope::new(message_type::AUTHENTICATE, json!({ "token": token }));
            self.write_envelope(envelope).await;
        }
        self.flush_queue().await;
    }

    async fn handle_disconnect(&mut self) {
        self.manual_disconnect = true;
        // Invalidate any in-flight dial.
        self.generation += 1;
        self.cancel_pending_retry();

        let had_link = self.sink.is_some();
        if let Some(mut sink) = self.sink.take() {
            sink.close().await;
        }
        self.events = None;
        self.shared.set_ready_flag(None);
        self.shared.authenticated.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);

        if had_link {
            debug!("Disconnected by client");
            self.shared.notify_disconnect("disconnected by client");
        }
    }

    // ========================================================================
    // Transport Events
    // ========================================================================

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(text) => match Envelope::decode(&text) {
                Ok(envelope) => self.dispatch_inbound(&envelope),
                // Malformed frames from a noisy peer are noise, not errors.
                Err(decode_err) => {
                    warn!(error = %decode_err, "Discarding malformed frame");
                }
            },

            TransportEvent::Error(transport_err) => {
                // Transient; the trailing close event owns rescheduling, so
                // an error alone never double-schedules a reconnect cycle.
                error!(error = %transport_err, "Transport error");
                self.shared.set_state(ConnectionState::Failed);
                self.shared.notify_error(&transport_err);
            }

            TransportEvent::Closed { reason } => self.handle_closed(&reason),
        }
    }

    fn handle_closed(&mut self, reason: &str) {
        self.sink = None;
        self.events = None;
        self.shared.set_ready_flag(None);
        self.shared.authenticated.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);

        debug!(reason = %reason, "Connection closed");
        self.shared.notify_disconnect(reason);

        let policy = &self.config.reconnect;
        if !self.manual_disconnect && policy.enabled && self.attempts < policy.max_attempts {
            let attempt = self.attempts + 1;
            let delay = policy.delay_for(attempt);
            self.shared.set_state(ConnectionState::Reconnecting);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnect attempt scheduled"
            );

            let command_tx = self.command_tx.clone();
            self.pending_retry = Some(ScheduledAttempt::schedule(delay, async move {
                let _ = command_tx.send(Command::RetryFired);
            }));
        }
    }

    /// Cancels the scheduled reconnect attempt, if one is armed.
    fn cancel_pending_retry(&mut self) {
        if let Some(retry) = self.pending_retry.take() {
            retry.cancel();
        }
    }

    fn handle_retry_fired(&mut self) {
        // The attempt may have been superseded by disconnect or connect.
        if self.manual_disconnect || self.shared.state() != ConnectionState::Reconnecting {
            debug!("Expired reconnect attempt ignored");
            return;
        }
        self.pending_retry = None;
        self.attempts += 1;

        info!(attempt = self.attempts, "Reconnecting");
        self.shared.notify_reconnect(self.attempts);
        self.begin_dial(self.current_endpoint.clone());
    }

    // ========================================================================
    // Inbound Dispatch
    // ========================================================================

    fn dispatch_inbound(&self, envelope: &Envelope) {
        if envelope.message_type == message_type::CONNECTION_ACK {
            self.shared.authenticated.store(true, Ordering::SeqCst);
            debug!("Authentication acknowledged");
        }

        if envelope.message_type == message_type::ERROR {
            let server_err = match envelope.payload_as::<ErrorPayload>() {
                Ok(payload) => Error::server(payload.code, payload.message),
                Err(_) => Error::server("unknown", envelope.payload.to_string()),
            };
            self.shared.notify_error(&server_err);
        }

        // Dedicated slot first, then the generic one.
        let (typed, generic) = {
            let table = self.shared.listeners.lock();
            (table.for_type(&envelope.message_type), table.message())
        };
        if let Some(handler) = typed {
            handler(envelope);
        }
        if let Some(handler) = generic {
            handler(envelope);
        }
    }

    // ========================================================================
    // Outbound Writes
    // ========================================================================

    async fn handle_transmit(&mut self, envelope: Envelope) {
        if self.shared.state() == ConnectionState::Connected && self.sink.is_some() {
            // Queued entries drain before any live write to keep wire order.
            self.flush_queue().await;
            self.write_envelope(envelope).await;
        } else {
            self.shared.queue.lock().push(envelope);
        }
    }

    /// Writes one envelope, queueing it on failure.
    async fn write_envelope(&mut self, envelope: Envelope) {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(encode_err) => {
                warn!(error = %encode_err, "Failed to encode envelope");
                return;
            }
        };

        let Some(sink) = self.sink.as_mut() else {
            self.shared.queue.lock().push(envelope);
            return;
        };
        if let Err(write_err) = sink.send(frame).await {
            warn!(
                error = %write_err,
                message_type = %envelope.message_type,
                "Write failed, queueing envelope"
            );
            self.shared.queue.lock().push(envelope);
        }
    }

    /// Drains the outbound queue in insertion order.
    async fn flush_queue(&mut self) {
        if self.sink.is_none() || self.shared.queue.lock().is_empty() {
            return;
        }

        loop {
            let popped = self.shared.queue.lock().pop();
            let Some(envelope) = popped else { break };

            let frame = match envelope.encode() {
                Ok(frame) => frame,
                Err(encode_err) => {
                    warn!(error = %encode_err, "Failed to encode queued envelope, dropping");
                    continue;
                }
            };
            let Some(sink) = self.sink.as_mut() else { break };
            if let Err(write_err) = sink.send(frame).await {
                // An entry whose write fails mid-flush is dropped, not
                // re-queued.
                warn!(
                    error = %write_err,
                    message_type = %envelope.message_type,
                    "Dropping queued envelope after failed write"
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use crate::client::ReconnectPolicy;
    use crate::transport::mock::{MockHandle, MockTransport};

    fn test_endpoint() -> Url {
        Url::parse("ws://guidance.local:9000/session").expect("valid url")
    }

    fn mock_client(config: ClientConfig) -> (Client, MockHandle) {
        let (transport, handle) = MockTransport::new();
        (Client::with_transport(config, Arc::new(transport)), handle)
    }

    fn default_client() -> (Client, MockHandle) {
        mock_client(ClientConfig::new(test_endpoint()))
    }

    async fn wait_until(check: impl Fn() -> bool) {
        // Generous under the paused clock: the full backoff ladder spans 15s
        // of virtual time.
        timeout(Duration::from_secs(60), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Collects error descriptions from the error slot.
    fn error_collector(client: &Client) -> Arc<Mutex<Vec<String>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        client.on(Listeners::new().on_error(move |error| {
            sink.lock().push(error.to_string());
        }));
        errors
    }

    #[tokio::test]
    async fn test_sends_queue_while_disconnected() {
        let (client, _handle) = default_client();

        for n in 1..=3usize {
            client.send("send_imu_data", &json!({ "sample": n }));
            assert_eq!(client.queued_count(), n);
        }

        client.clear_queue();
        assert_eq!(client.queued_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_flushes_queue_in_order() {
        let (client, mut handle) = default_client();

        client.send("x", &json!({ "a": 1 }));
        client.send("y", &json!({ "a": 2 }));
        client.send("z", &json!({ "a": 3 }));
        assert_eq!(client.queued_count(), 3);

        client.connect();
        let mut conn = handle.next_conn().await;
        assert_eq!(conn.endpoint, test_endpoint());

        let flushed: Vec<Envelope> = [
            conn.next_sent().await,
            conn.next_sent().await,
            conn.next_sent().await,
        ]
        .iter()
        .map(|wire| Envelope::decode(wire).expect("decode"))
        .collect();

        let types: Vec<&str> = flushed.iter().map(|e| e.message_type.as_str()).collect();
        assert_eq!(types, vec!["x", "y", "z"]);
        assert_eq!(flushed[0].payload, json!({ "a": 1 }));
        assert_eq!(client.queued_count(), 0);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_send_writes_immediately() {
        let (client, mut handle) = default_client();

        client.connect();
        let mut conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        client.send("request_guidance", &json!({ "query": "crosswalk" }));

        let wire = conn.next_sent().await;
        let envelope = Envelope::decode(&wire).expect("decode");
        assert_eq!(envelope.message_type, "request_guidance");
        assert!(envelope.message_id.is_some());
        assert_eq!(client.queued_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent_while_active() {
        let (client, mut handle) = default_client();

        client.connect();
        client.connect();
        let _conn = handle.next_conn().await;
        handle.expect_no_conn().await;

        wait_until(|| client.is_connected()).await;
        client.connect();
        handle.expect_no_conn().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_ack_sets_authentication() {
        let (client, mut handle) = default_client();

        client.connect();
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;
        assert!(!client.authentication_status());

        conn.inject_frame(
            r#"{"type":"connection_ack","payload":{"sessionId":"s-1"},"timestamp":1}"#,
        );
        wait_until(|| client.authentication_status()).await;

        client.disconnect();
        wait_until(|| client.connection_status() == ConnectionState::Disconnected).await;
        assert!(!client.authentication_status());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_discarded() {
        let (client, mut handle) = default_client();
        let messages = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&messages);
        client.on(Listeners::new().on_message(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        client.connect();
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        conn.inject_frame(r#"{"payload":{"a":1},"timestamp":1}"#);
        conn.inject_frame("not json at all");
        conn.inject_frame(r#"{"type":"","payload":{},"timestamp":1}"#);
        conn.inject_frame(r#"{"type":"send_audio","payload":{},"timestamp":1}"#);

        wait_until(|| messages.load(Ordering::SeqCst) == 1).await;
        assert_eq!(client.connection_status(), ConnectionState::Connected);
        assert!(!client.authentication_status());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guidance_response_dual_dispatch() {
        let (client, mut handle) = default_client();
        let guidance_seen = Arc::new(Mutex::new(Vec::new()));
        let generic_seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&guidance_seen);
        let generic_sink = Arc::clone(&generic_seen);
        client.on(
            Listeners::new()
                .on_guidance_response(move |envelope| {
                    sink.lock().push(envelope.clone());
                })
                .on_message(move |envelope| {
                    generic_sink.lock().push(envelope.clone());
                }),
        );

        client.connect();
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        conn.inject_frame(
            r#"{"type":"guidance_response","payload":{"guidance":"turn left"},"timestamp":1}"#,
        );
        wait_until(|| guidance_seen.lock().len() == 1 && generic_seen.lock().len() == 1).await;

        assert_eq!(guidance_seen.lock()[0], generic_seen.lock()[0]);
        let guidance: crate::protocol::GuidanceResponse =
            guidance_seen.lock()[0].payload_as().expect("typed payload");
        assert_eq!(guidance.guidance, "turn left");
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_frame_forwarded() {
        let (client, mut handle) = default_client();
        let errors = error_collector(&client);

        client.connect();
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        conn.inject_frame(
            r#"{"type":"error","payload":{"code":"AUTH_FAILED","message":"bad token"},"timestamp":1}"#,
        );
        wait_until(|| errors.lock().len() == 1).await;

        assert_eq!(errors.lock()[0], "Server error AUTH_FAILED: bad token");
        assert_eq!(client.connection_status(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_alone_does_not_reconnect() {
        let (client, mut handle) = default_client();
        let errors = error_collector(&client);

        client.connect();
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        conn.inject_error(Error::connection("socket reset"));
        wait_until(|| client.connection_status() == ConnectionState::Failed).await;

        assert_eq!(errors.lock().len(), 1);
        handle.expect_no_conn().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_sequence() {
        let (client, mut handle) = default_client();
        let errors = error_collector(&client);
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let fired_at = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&attempts);
        let instants = Arc::clone(&fired_at);
        client.on(Listeners::new().on_reconnect(move |attempt| {
            sink.lock().push(attempt);
            instants.lock().push(tokio::time::Instant::now());
        }));

        client.connect();
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        // Every reconnect dial fails, so the counter escalates 1..=5 without
        // the reset a successful connection would apply.
        handle.fail_next_dials(5);
        let closed_at = tokio::time::Instant::now();
        conn.close("peer went away");

        wait_until(|| attempts.lock().len() == 5).await;
        assert_eq!(*attempts.lock(), vec![1, 2, 3, 4, 5]);

        // Each failed dial surfaces through the error slot.
        wait_until(|| errors.lock().len() == 5).await;

        // Each attempt waits its full linear-capped delay.
        let mut last = closed_at;
        for (fired, expected_ms) in fired_at.lock().iter().zip([1000u64, 2000, 3000, 4000, 5000]) {
            assert!(
                fired.duration_since(last) >= Duration::from_millis(expected_ms),
                "attempt fired before its backoff delay"
            );
            last = *fired;
        }

        // Counter exhausted: ride past every backoff delay, no sixth attempt
        // (a sixth dial would succeed and register), terminally disconnected.
        wait_until(|| client.connection_status() == ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.expect_no_conn().await;
        assert_eq!(*attempts.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_resets_on_successful_connection() {
        let (client, mut handle) = default_client();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&attempts);
        client.on(Listeners::new().on_reconnect(move |attempt| {
            sink.lock().push(attempt);
        }));

        client.connect();
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;
        conn.close("blip");

        // First reconnect succeeds and stays up.
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        // Next drop starts counting from 1 again.
        conn.close("blip");
        let _conn = handle.next_conn().await;
        assert_eq!(*attempts.lock(), vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_scheduled_reconnect() {
        let (client, mut handle) = default_client();

        client.connect();
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        conn.close("peer went away");
        wait_until(|| client.connection_status() == ConnectionState::Reconnecting).await;

        client.disconnect();
        wait_until(|| client.connection_status() == ConnectionState::Disconnected).await;

        // Ride past every backoff delay: the cancelled timer stays quiet.
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.expect_no_conn().await;

        // A fresh manual connect dials exactly once.
        client.connect();
        let _conn = handle.next_conn().await;
        handle.expect_no_conn().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_never_reconnects() {
        let (client, mut handle) = default_client();

        client.connect();
        let _conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        client.disconnect();
        wait_until(|| client.connection_status() == ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.expect_no_conn().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_address_fails_without_retry() {
        let (client, mut handle) = default_client();
        let errors = error_collector(&client);

        client.connect_to("not a url");
        wait_until(|| client.connection_status() == ConnectionState::Failed).await;

        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].starts_with("Invalid endpoint"));
        handle.expect_no_conn().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_failure_arms_reconnect() {
        let (client, mut handle) = default_client();
        let errors = error_collector(&client);

        handle.fail_next_dials(1);
        client.connect();

        wait_until(|| errors.lock().len() == 1).await;
        wait_until(|| client.connection_status() == ConnectionState::Reconnecting).await;

        // The scheduled attempt succeeds on the second dial.
        let _conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_disabled_stays_down() {
        let config =
            ClientConfig::new(test_endpoint()).with_reconnect(ReconnectPolicy::disabled());
        let (client, mut handle) = mock_client(config);

        client.connect();
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        conn.close("peer went away");
        wait_until(|| client.connection_status() == ConnectionState::Disconnected).await;
        handle.expect_no_conn().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_requeues_envelope() {
        let (client, mut handle) = default_client();

        client.connect();
        let mut conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        conn.fail_sends(true);
        client.send("send_audio", &json!({ "chunk": 1 }));
        wait_until(|| client.queued_count() == 1).await;

        // Once writes recover, the queued entry drains before the live one.
        conn.fail_sends(false);
        client.send("send_audio", &json!({ "chunk": 2 }));

        let first = Envelope::decode(&conn.next_sent().await).expect("decode");
        let second = Envelope::decode(&conn.next_sent().await).expect("decode");
        assert_eq!(first.payload, json!({ "chunk": 1 }));
        assert_eq!(second.payload, json!({ "chunk": 2 }));
        assert_eq!(client.queued_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_flag_desync_guards_is_connected() {
        let (client, mut handle) = default_client();

        client.connect();
        let conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        conn.set_ready(false);

        assert_eq!(client.connection_status(), ConnectionState::Connected);
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_token_sent_before_flush() {
        let config = ClientConfig::new(test_endpoint()).with_auth_token("device-token");
        let (client, mut handle) = mock_client(config);

        client.send("request_guidance", &json!({ "query": "exit" }));
        client.connect();
        let mut conn = handle.next_conn().await;

        let first = Envelope::decode(&conn.next_sent().await).expect("decode");
        let second = Envelope::decode(&conn.next_sent().await).expect("decode");
        assert_eq!(first.message_type, message_type::AUTHENTICATE);
        assert_eq!(first.payload, json!({ "token": "device-token" }));
        assert_eq!(second.message_type, "request_guidance");
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_removes_listener() {
        let (client, mut handle) = default_client();
        let messages = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&messages);
        client.on(Listeners::new().on_message(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        client.connect();
        let mut conn = handle.next_conn().await;
        wait_until(|| client.is_connected()).await;

        conn.inject_frame(r#"{"type":"ping","payload":{},"timestamp":1}"#);
        wait_until(|| messages.load(Ordering::SeqCst) == 1).await;

        client.off(&Slot::Message);
        conn.inject_frame(r#"{"type":"ping","payload":{},"timestamp":1}"#);
        conn.expect_no_sent().await;
        assert_eq!(messages.load(Ordering::SeqCst), 1);
    }
}
