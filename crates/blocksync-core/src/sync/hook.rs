// ── SyncHook ──
//
// Per-consumer facade over the shared stream and poll sources. Each
// subscription gets one driver task that owns the `SyncState` sender;
// consumers only ever read through the watch channel.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use blocksync_api::{Connector, InboundEnvelope, StreamEvent};
use futures_util::Stream;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::mode::{ModeEvent, ModeMachine, RequestedMode};
use super::poll::PollSource;
use super::state::{Applied, SyncMode, SyncState};
use crate::config::SyncConfig;
use crate::error::{CoreError, SyncError};
use crate::registry::{ConnectionLease, ConnectionRegistry};

/// Filter over envelope `data`. Rejected envelopes are ignored without
/// advancing `last_seq`.
pub type DataPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Parameters of one `SyncHook::subscribe` call.
#[derive(Clone)]
pub struct SubscribeRequest {
    endpoint: Option<Url>,
    mode: RequestedMode,
    poll: Option<Arc<dyn PollSource>>,
    predicate: Option<DataPredicate>,
}

impl SubscribeRequest {
    pub fn new(endpoint: Option<Url>, mode: RequestedMode) -> Self {
        Self {
            endpoint,
            mode,
            poll: None,
            predicate: None,
        }
    }

    /// Stream only. A poll source added later is used for the initial
    /// snapshot.
    pub fn stream(endpoint: Url) -> Self {
        Self::new(Some(endpoint), RequestedMode::Stream)
    }

    /// Poll only.
    pub fn poll(source: impl PollSource) -> Self {
        Self::new(None, RequestedMode::Poll).with_poll_source(source)
    }

    /// Stream first, then poll `source` once the stream gives up.
    pub fn auto(endpoint: Url, source: impl PollSource) -> Self {
        Self::new(Some(endpoint), RequestedMode::Auto).with_poll_source(source)
    }

    pub fn with_poll_source(self, source: impl PollSource) -> Self {
        self.with_shared_poll_source(Arc::new(source))
    }

    pub fn with_shared_poll_source(mut self, source: Arc<dyn PollSource>) -> Self {
        self.poll = Some(source);
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    fn validate(&self) -> Result<(), CoreError> {
        let needs_endpoint = matches!(self.mode, RequestedMode::Stream | RequestedMode::Auto);
        let needs_poll = matches!(self.mode, RequestedMode::Poll | RequestedMode::Auto);
        if needs_endpoint && self.endpoint.is_none() {
            return Err(CoreError::Config {
                message: format!("{} subscription needs a stream endpoint", self.mode),
            });
        }
        if needs_poll && self.poll.is_none() {
            return Err(CoreError::Config {
                message: format!("{} subscription needs a poll source", self.mode),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct PollSettings {
    interval: Duration,
    timeout: Duration,
    max_failures: u32,
}

/// Entry point for consumers that want one consistent, ordered view of
/// a remote value.
#[derive(Clone)]
pub struct SyncHook {
    registry: ConnectionRegistry,
    settings: PollSettings,
}

impl SyncHook {
    pub fn new(registry: ConnectionRegistry, config: &SyncConfig) -> Self {
        Self {
            registry,
            settings: PollSettings {
                interval: config.poll_interval.max(Duration::from_millis(1)),
                timeout: config.poll_timeout,
                max_failures: config.max_poll_failures.max(1),
            },
        }
    }

    /// Hook with its own registry over `connector`.
    pub fn from_config(connector: Arc<dyn Connector>, config: &SyncConfig) -> Self {
        let registry =
            ConnectionRegistry::new(connector, config.stream.clone(), config.release_grace);
        Self::new(registry, config)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Start a subscription. Must be called inside a tokio runtime.
    pub fn subscribe(&self, request: SubscribeRequest) -> Result<Subscription, CoreError> {
        request.validate()?;

        let mode = ModeMachine::new(request.mode);
        let lease = match (mode.current(), &request.endpoint) {
            (SyncMode::Stream, Some(endpoint)) => Some(self.registry.acquire(endpoint)),
            _ => None,
        };
        let origin = request
            .endpoint
            .as_ref()
            .map_or_else(|| "poll".to_owned(), ToString::to_string);

        let initial = SyncState::new(mode.current());
        let (state_tx, state_rx) = watch::channel(initial.clone());
        let cancel = CancellationToken::new();

        info!(origin = %origin, mode = %request.mode, "Subscription started");
        let driver = Driver {
            origin,
            state: state_tx,
            mode,
            lease,
            poll: request.poll,
            predicate: request.predicate,
            settings: self.settings,
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run());

        Ok(Subscription {
            current: initial,
            receiver: state_rx,
            guard: cancel.drop_guard(),
        })
    }
}

// ── Subscription handle ──────────────────────────────────────────────

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    current: SyncState,
    receiver: watch::Receiver<SyncState>,
    guard: DropGuard,
}

impl Subscription {
    /// State captured at creation or at the last `changed()`.
    pub fn current(&self) -> &SyncState {
        &self.current
    }

    /// Latest state (may have moved on since `current`).
    pub fn latest(&self) -> SyncState {
        self.receiver.borrow().clone()
    }

    /// Another receiver for this subscription's state. It does not keep
    /// the subscription alive; once unsubscribed it sees no further
    /// changes.
    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.receiver.clone()
    }

    /// Wait for the next change. `None` once the driver has stopped.
    pub async fn changed(&mut self) -> Option<SyncState> {
        self.receiver.changed().await.ok()?;
        let state = self.receiver.borrow_and_update().clone();
        self.current = state.clone();
        Some(state)
    }

    /// Wait until the state satisfies `condition`.
    pub async fn wait_for(
        &mut self,
        condition: impl FnMut(&SyncState) -> bool,
    ) -> Option<SyncState> {
        let state = self.receiver.wait_for(condition).await.ok()?.clone();
        self.current = state.clone();
        Some(state)
    }

    /// Convert into a `Stream` of states. The stream keeps the
    /// subscription alive.
    pub fn into_stream(self) -> SyncStream {
        SyncStream {
            inner: WatchStream::new(self.receiver),
            _guard: self.guard,
        }
    }

    /// Stop the subscription and release its shared connection.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

/// `Stream` adapter over a subscription's state channel.
pub struct SyncStream {
    inner: WatchStream<SyncState>,
    _guard: DropGuard,
}

impl Stream for SyncStream {
    type Item = SyncState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ── Driver task ──────────────────────────────────────────────────────

enum StreamExit {
    Cancelled,
    Downgraded,
}

struct Driver {
    origin: String,
    state: watch::Sender<SyncState>,
    mode: ModeMachine,
    lease: Option<ConnectionLease>,
    poll: Option<Arc<dyn PollSource>>,
    predicate: Option<DataPredicate>,
    settings: PollSettings,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        if self.mode.current() == SyncMode::Stream {
            match self.follow_stream().await {
                StreamExit::Cancelled => {
                    debug!(origin = %self.origin, "Subscription ended");
                    return;
                }
                StreamExit::Downgraded => {}
            }
        }
        self.poll_loop().await;
        debug!(origin = %self.origin, "Subscription ended");
    }

    async fn follow_stream(&mut self) -> StreamExit {
        let Some((mut events, open)) = self.lease.as_ref().map(|lease| {
            let connection = lease.connection();
            (connection.subscribe(), connection.state().is_open())
        }) else {
            return StreamExit::Downgraded;
        };
        self.set_connected(open);

        let source = self.poll.clone();
        let timeout = self.settings.timeout;
        let bootstrap = async move {
            match source {
                Some(source) => timed_fetch(source.as_ref(), timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(bootstrap);
        let mut bootstrapping = self.poll.is_some();

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return StreamExit::Cancelled,
                event = events.recv() => match event {
                    Ok(StreamEvent::Envelope(envelope)) => self.apply(&envelope),
                    Ok(StreamEvent::Opened) => self.set_connected(true),
                    Ok(StreamEvent::Disconnected { reason }) => {
                        debug!(origin = %self.origin, %reason, "Stream interrupted");
                        self.set_connected(false);
                    }
                    Ok(StreamEvent::Exhausted { attempts }) => {
                        self.set_connected(false);
                        self.record_error(SyncError::PersistentFailure { attempts });
                        if self.mode.transition(ModeEvent::StreamExhausted).is_some() {
                            warn!(origin = %self.origin, attempts, "Stream gave up, switching to polling");
                            self.lease = None;
                            return StreamExit::Downgraded;
                        }
                    }
                    Ok(StreamEvent::Closed) => self.set_connected(false),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(origin = %self.origin, skipped, "Subscription lagged behind stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.set_connected(false);
                        self.cancel.cancelled().await;
                        return StreamExit::Cancelled;
                    }
                },
                result = &mut bootstrap, if bootstrapping => {
                    bootstrapping = false;
                    self.apply_bootstrap(result);
                }
            }
        }
    }

    async fn poll_loop(&mut self) {
        let Some(source) = self.poll.clone() else {
            self.cancel.cancelled().await;
            return;
        };

        self.state.send_modify(|state| {
            state.mode = SyncMode::Poll;
            state.connected = false;
        });
        info!(
            origin = %self.origin,
            interval_ms = u64::try_from(self.settings.interval.as_millis()).unwrap_or(u64::MAX),
            "Polling"
        );

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0_u32;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            // A result that lands after unsubscribe is never applied.
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                result = timed_fetch(source.as_ref(), self.settings.timeout) => result,
            };
            match result {
                Ok(value) => {
                    failures = 0;
                    self.apply_polled(value);
                }
                Err(message) => {
                    failures = failures.saturating_add(1);
                    self.poll_failed(failures, message);
                }
            }
        }
    }

    fn admits(&self, envelope: &InboundEnvelope) -> bool {
        let Some(predicate) = &self.predicate else {
            return true;
        };
        match envelope {
            InboundEnvelope::Snapshot { data, .. } => predicate(data),
            InboundEnvelope::Update { data, .. } => predicate(&Value::Object(data.clone())),
            InboundEnvelope::Error { .. } | InboundEnvelope::Heartbeat => true,
        }
    }

    fn apply(&self, envelope: &InboundEnvelope) {
        if !self.admits(envelope) {
            trace!(origin = %self.origin, seq = ?envelope.seq(), "Envelope rejected by predicate");
            return;
        }
        self.state.send_if_modified(|state| {
            let outcome = state.apply(envelope);
            if outcome == Applied::Stale {
                trace!(
                    origin = %self.origin,
                    seq = ?envelope.seq(),
                    last_seq = ?state.last_seq,
                    "Stale envelope dropped"
                );
            }
            outcome.changed_state()
        });
    }

    fn apply_bootstrap(&self, result: Result<Value, String>) {
        match result {
            Ok(value) => {
                if self.predicate.as_ref().is_some_and(|p| !p(&value)) {
                    return;
                }
                let seeded = self.state.send_if_modified(|state| state.bootstrap(value));
                debug!(origin = %self.origin, seeded, "Initial snapshot fetched");
            }
            Err(message) => {
                warn!(origin = %self.origin, error = %message, "Initial snapshot failed");
                self.state.send_if_modified(|state| {
                    if state.last_seq.is_some() {
                        return false;
                    }
                    state.last_error = Some(SyncError::Bootstrap { message });
                    true
                });
            }
        }
    }

    fn apply_polled(&self, value: Value) {
        let admitted = self.predicate.as_ref().is_none_or(|p| p(&value));
        self.state.send_modify(|state| {
            state.connected = true;
            if admitted {
                let seq = state.apply_polled(value);
                trace!(origin = %self.origin, seq, "Polled snapshot applied");
            }
        });
    }

    fn poll_failed(&self, failures: u32, message: String) {
        let unreachable = failures >= self.settings.max_failures;
        if unreachable {
            warn!(origin = %self.origin, failures, error = %message, "Polling keeps failing");
        } else {
            debug!(origin = %self.origin, failures, error = %message, "Poll failed");
        }
        self.state.send_modify(|state| {
            state.last_error = Some(SyncError::Poll { message });
            if unreachable {
                state.connected = false;
            }
        });
    }

    fn set_connected(&self, connected: bool) {
        self.state.send_if_modified(|state| {
            if state.connected == connected {
                return false;
            }
            state.connected = connected;
            true
        });
    }

    fn record_error(&self, error: SyncError) {
        self.state.send_modify(|state| state.last_error = Some(error));
    }
}

async fn timed_fetch(source: &dyn PollSource, timeout: Duration) -> Result<Value, String> {
    match tokio::time::timeout(timeout, source.fetch()).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    }
}
