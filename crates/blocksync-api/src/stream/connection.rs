// ── StreamConnection ──
//
// One persistent channel to one endpoint, driven by a single actor task.
// The actor is the only writer of connection state; handles talk to it
// over an unbounded command channel and observe it through a watch of
// `ConnectionState` plus a broadcast of `StreamEvent`s.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::backoff::{ReconnectConfig, backoff_delay};
use super::envelope::{HEARTBEAT_FRAME, InboundEnvelope, OutboundMessage, Payload};
use super::socket::{Connector, Frame, PayloadSink, Transport};
use crate::error::Error;

/// Lifecycle of a `StreamConnection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    /// Terminal; reached only through `close()`.
    Closed(String),
    Errored(String),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Events broadcast to every listener of a connection.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Transport opened; the outbound queue has already been flushed.
    Opened,
    Envelope(Arc<InboundEnvelope>),
    /// Transport lost or failed to open.
    Disconnected { reason: String },
    /// The reconnect budget ran out. The connection parks until the next
    /// `connect()` or `close()`.
    Exhausted { attempts: u32 },
    Closed,
}

/// Timing knobs for a single connection.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub reconnect: ReconnectConfig,
    /// Time allowed for the transport to confirm open. Default: 10s.
    pub connect_timeout: Duration,
    /// Outbound heartbeat period. `Duration::ZERO` disables. Default: 15s.
    pub heartbeat_interval: Duration,
    /// Inbound silence that counts as a dead transport. `Duration::ZERO`
    /// disables. Default: 45s.
    pub idle_timeout: Duration,
    /// Broadcast buffer per connection. Default: 1024.
    pub event_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
            event_capacity: 1024,
        }
    }
}

enum Command {
    Connect,
    Send(OutboundMessage),
}

/// Handle to a persistent stream connection.
///
/// Dropping the handle closes the connection.
pub struct StreamConnection {
    endpoint: Url,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl StreamConnection {
    /// Spawn the connection actor in `Idle`. Must be called inside a tokio
    /// runtime. Nothing is dialled until [`connect`](Self::connect).
    pub fn spawn(endpoint: Url, config: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let cancel = CancellationToken::new();

        let actor = Actor {
            endpoint: endpoint.clone(),
            config,
            connector,
            commands: commands_rx,
            state: state_tx,
            events: events_tx.clone(),
            cancel: cancel.clone(),
            outbound: VecDeque::new(),
            attempt: 0,
        };
        tokio::spawn(actor.run());

        Self {
            endpoint,
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
            cancel,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Start (or restart) connecting. No-op while connecting or open.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Queue `payload` for delivery. Delivered immediately when open,
    /// otherwise on the next open ahead of anything queued later.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(closed_error());
        }
        self.commands
            .send(Command::Send(OutboundMessage::new(payload)))
            .map_err(|_| closed_error())
    }

    /// Close the connection for good and cancel any pending reconnect.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until the actor has reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(ConnectionState::is_closed).await;
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch channel of state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to connection events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("endpoint", &self.endpoint.as_str())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

fn closed_error() -> Error {
    Error::StreamClosed {
        code: 1000,
        reason: "connection closed by caller".into(),
    }
}

// ── Actor ────────────────────────────────────────────────────────────

enum Wait {
    Proceed,
    Cancelled,
}

enum SessionEnd {
    Cancelled,
    Lost(String),
}

struct Actor {
    endpoint: Url,
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<StreamEvent>,
    cancel: CancellationToken,
    outbound: VecDeque<OutboundMessage>,
    /// Consecutive failed attempts since the last open.
    attempt: u32,
}

impl Actor {
    async fn run(mut self) {
        if matches!(self.park().await, Wait::Cancelled) {
            self.finish();
            return;
        }

        loop {
            self.set_state(ConnectionState::Connecting);
            debug!(url = %self.endpoint, attempt = self.attempt, "Opening stream transport");

            let opened = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = tokio::time::timeout(
                    self.config.connect_timeout,
                    self.connector.connect(&self.endpoint),
                ) => result,
            };
            // connect() calls made while connecting are no-ops
            self.drain_commands();

            let reason = match opened {
                Ok(Ok(transport)) => {
                    self.attempt = 0;
                    self.set_state(ConnectionState::Open);
                    info!(url = %self.endpoint, queued = self.outbound.len(), "Stream open");
                    match self.session(transport).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Lost(reason) => reason,
                    }
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "no open confirmation within {}ms",
                    self.config.connect_timeout.as_millis()
                ),
            };

            warn!(url = %self.endpoint, %reason, "Stream disconnected");
            self.set_state(ConnectionState::Errored(reason.clone()));
            self.emit(StreamEvent::Disconnected { reason });

            if self.config.reconnect.exhausted(self.attempt) {
                error!(
                    url = %self.endpoint,
                    attempts = self.attempt,
                    "Reconnect budget exhausted, giving up until reconnect is requested"
                );
                self.emit(StreamEvent::Exhausted {
                    attempts: self.attempt,
                });
                match self.park().await {
                    Wait::Cancelled => break,
                    Wait::Proceed => {
                        self.attempt = 0;
                        continue;
                    }
                }
            }

            let delay = backoff_delay(self.attempt, &self.config.reconnect);
            self.attempt += 1;
            info!(
                url = %self.endpoint,
                attempt = self.attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting after backoff"
            );
            if matches!(self.backoff(delay).await, Wait::Cancelled) {
                break;
            }
        }

        self.finish();
    }

    /// Wait for `connect()` while not connected. Sends are queued.
    async fn park(&mut self) -> Wait {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Wait::Cancelled,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => return Wait::Proceed,
                    Some(Command::Send(msg)) => self.outbound.push_back(msg),
                    None => return Wait::Cancelled,
                },
            }
        }
    }

    /// Sleep out a backoff delay. `connect()` ends the wait early.
    async fn backoff(&mut self, delay: Duration) -> Wait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Wait::Cancelled,
                () = &mut sleep => return Wait::Proceed,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => {
                        debug!(url = %self.endpoint, "Reconnect requested, skipping backoff");
                        return Wait::Proceed;
                    }
                    Some(Command::Send(msg)) => self.outbound.push_back(msg),
                    None => return Wait::Cancelled,
                },
            }
        }
    }

    async fn session(&mut self, transport: Transport) -> SessionEnd {
        let Transport {
            mut reader,
            mut writer,
        } = transport;

        let end = 'session: {
            if let Err(e) = self.flush(&mut writer).await {
                break 'session SessionEnd::Lost(e.to_string());
            }
            self.emit(StreamEvent::Opened);

            let heartbeat_on = !self.config.heartbeat_interval.is_zero();
            let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
            let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let idle_on = !self.config.idle_timeout.is_zero();
            let idle = tokio::time::sleep(self.config.idle_timeout);
            tokio::pin!(idle);

            loop {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break 'session SessionEnd::Cancelled,
                    cmd = self.commands.recv() => match cmd {
                        Some(Command::Send(msg)) => {
                            self.outbound.push_back(msg);
                            if let Err(e) = self.flush(&mut writer).await {
                                break 'session SessionEnd::Lost(e.to_string());
                            }
                        }
                        Some(Command::Connect) => trace!(url = %self.endpoint, "connect() while open"),
                        None => break 'session SessionEnd::Cancelled,
                    },
                    frame = reader.next() => {
                        let frame = match frame {
                            Some(Ok(frame)) => frame,
                            Some(Err(e)) => break 'session SessionEnd::Lost(e.to_string()),
                            None => break 'session SessionEnd::Lost("stream ended".into()),
                        };
                        if idle_on {
                            idle.as_mut().reset(Instant::now() + self.config.idle_timeout);
                        }
                        match frame {
                            Frame::Text(text) => self.dispatch(InboundEnvelope::parse(&text)),
                            Frame::Binary(bytes) => self.dispatch(InboundEnvelope::parse_bytes(&bytes)),
                            Frame::Ping | Frame::Pong => {}
                            Frame::Close { code, reason } => {
                                break 'session SessionEnd::Lost(
                                    Error::StreamClosed { code, reason }.to_string(),
                                );
                            }
                        }
                    }
                    _ = heartbeat.tick(), if heartbeat_on => {
                        trace!(url = %self.endpoint, "Sending heartbeat");
                        if let Err(e) = writer.send(Payload::Text(HEARTBEAT_FRAME.to_owned())).await {
                            break 'session SessionEnd::Lost(e.to_string());
                        }
                    }
                    () = &mut idle, if idle_on => {
                        break 'session SessionEnd::Lost(format!(
                            "no inbound traffic for {}ms",
                            self.config.idle_timeout.as_millis()
                        ));
                    }
                }
            }
        };

        if matches!(end, SessionEnd::Cancelled) {
            self.set_state(ConnectionState::Closing);
        }
        // The old transport is fully torn down before any reconnect.
        if let Err(e) = writer.close().await {
            debug!(url = %self.endpoint, error = %e, "Error closing stream transport");
        }
        drop(reader);
        end
    }

    /// Send queued messages oldest-first. A message leaves the queue only
    /// after its send succeeded.
    async fn flush(&mut self, writer: &mut PayloadSink) -> Result<(), Error> {
        while let Some(front) = self.outbound.front() {
            let payload = front.payload.clone();
            writer.send(payload).await?;
            if let Some(sent) = self.outbound.pop_front() {
                trace!(url = %self.endpoint, enqueued_at = %sent.enqueued_at, "Flushed outbound message");
            }
        }
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            if let Command::Send(msg) = cmd {
                self.outbound.push_back(msg);
            }
        }
    }

    fn dispatch(&self, parsed: Result<InboundEnvelope, Error>) {
        match parsed {
            Ok(envelope) => {
                trace!(url = %self.endpoint, seq = ?envelope.seq(), "Stream envelope");
                self.emit(StreamEvent::Envelope(Arc::new(envelope)));
            }
            Err(e) => {
                warn!(url = %self.endpoint, error = %e, "Dropping malformed stream payload");
            }
        }
    }

    fn emit(&self, event: StreamEvent) {
        // No listeners is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn finish(&mut self) {
        if !self.outbound.is_empty() {
            debug!(url = %self.endpoint, dropped = self.outbound.len(), "Discarding unsent messages");
            self.outbound.clear();
        }
        info!(url = %self.endpoint, "Stream closed");
        self.set_state(ConnectionState::Closed("closed by caller".into()));
        self.emit(StreamEvent::Closed);
    }
}
