use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::runtime::TryCurrentError;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::policy::ReconnectPolicy;
use super::scheduler::{Scheduler, TimerHandle, TokioScheduler};
use super::transport::{HttpTransport, Transport, TransportHandle};
use super::types::{
    ConnectionState, ReadyState, StateSnapshot, StreamError, StreamEvent, StreamMessage,
    StreamTarget,
};

/// Labels whose payload is parsed as JSON and emitted as [`StreamEvent::Named`]
pub const DEFAULT_NAMED_EVENTS: &[&str] = &[
    "update",
    "complete",
    "error",
    "progress",
    "start",
    "connecting",
    "discovering",
    "capabilities",
    "planning",
    "plan_ready",
    "executing_step",
    "invoking_tool",
    "tool_result",
    "tool_error",
    "finalizing",
    "gemini_response",
];

/// Labels that end the subscription once delivered
pub const DEFAULT_TERMINAL_EVENTS: &[&str] = &["complete"];

/// How a [`StreamClient`] reacts to failures and which frames it decodes
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub reconnect: ReconnectPolicy,
    pub named_events: Vec<String>,
    pub terminal_events: Vec<String>,
    /// Also treat an unlabeled frame as terminal when its JSON body carries a
    /// terminal `event` field
    pub terminal_in_payload: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            named_events: DEFAULT_NAMED_EVENTS.iter().map(|s| s.to_string()).collect(),
            terminal_events: DEFAULT_TERMINAL_EVENTS.iter().map(|s| s.to_string()).collect(),
            terminal_in_payload: false,
        }
    }
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for an orchestration task stream: the final response and a
    /// server-reported failure both end the task. The platform sends these as
    /// unlabeled frames with an `event` field.
    pub fn orchestration() -> Self {
        Self::default()
            .with_terminal_events(["complete", "gemini_response", "error"])
            .with_terminal_in_payload(true)
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_named_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.named_events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_terminal_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terminal_events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_terminal_in_payload(mut self, enabled: bool) -> Self {
        self.terminal_in_payload = enabled;
        self
    }

    fn is_named(&self, label: &str) -> bool {
        self.named_events.iter().any(|e| e == label)
    }

    fn is_terminal(&self, label: &str) -> bool {
        self.terminal_events.iter().any(|e| e == label)
    }

    fn is_terminal_payload(&self, message: &StreamMessage) -> bool {
        if !self.terminal_in_payload || message.event.is_some() {
            return false;
        }
        serde_json::from_str::<Value>(&message.data)
            .ok()
            .and_then(|body| body.get("event").and_then(Value::as_str).map(str::to_string))
            .is_some_and(|label| self.is_terminal(&label))
    }
}

struct Inner {
    state: ConnectionState,
    attempts: u32,
    /// Bumped for every new transport and on close; callbacks from older
    /// transports are ignored.
    generation: u64,
    transport: Option<Box<dyn TransportHandle>>,
    timer: Option<TimerHandle>,
}

struct Core {
    target: StreamTarget,
    options: StreamOptions,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StreamEvent) {
        // Nobody listening is not an error
        let _ = self.events.send(event);
    }

    fn connect(self: &Arc<Self>) {
        let generation = {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Closed | ConnectionState::Connecting | ConnectionState::Open => {
                    return
                }
                ConnectionState::Reconnecting if inner.timer.is_some() => return,
                ConnectionState::Idle | ConnectionState::Reconnecting => {}
            }
            inner.state = ConnectionState::Connecting;
            inner.generation += 1;
            inner.generation
        };

        debug!("Opening stream to {} (generation {})", self.target.url, generation);

        let sink = TransportSink {
            core: Arc::downgrade(self),
            generation,
        };

        match self.transport.open(&self.target, sink) {
            Ok(mut handle) => {
                let mut inner = self.lock();
                let current = inner.generation == generation
                    && matches!(
                        inner.state,
                        ConnectionState::Connecting | ConnectionState::Open
                    );
                if current {
                    inner.transport = Some(handle);
                } else {
                    // Closed or failed while the transport was being opened
                    drop(inner);
                    handle.close();
                }
            }
            Err(e) => {
                warn!("Failed to open stream to {}: {}", self.target.url, e);
                let reason = match e {
                    StreamError::Transport(reason) => reason,
                    other => other.to_string(),
                };
                self.on_failure(generation, ReadyState::Closed, reason);
            }
        }
    }

    fn close(&self) {
        let (transport, timer) = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.state = ConnectionState::Closed;
            inner.generation += 1;
            self.emit(StreamEvent::Close);
            (inner.transport.take(), inner.timer.take())
        };

        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(mut transport) = transport {
            transport.close();
        }

        info!("Stream to {} closed", self.target.url);
    }

    fn fire_reconnect(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Reconnecting {
                return;
            }
            inner.timer = None;
        }
        self.connect();
    }

    fn on_open(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state == ConnectionState::Closed {
            return;
        }
        inner.state = ConnectionState::Open;
        inner.attempts = 0;
        self.emit(StreamEvent::Open);
        info!("Stream to {} open", self.target.url);
    }

    fn on_message(&self, generation: u64, message: StreamMessage) {
        let terminal = {
            let inner = self.lock();
            if inner.generation != generation || inner.state == ConnectionState::Closed {
                return;
            }

            let label = message.event_type().to_string();
            if !self.options.is_named(&label) {
                let terminal = self.options.is_terminal_payload(&message);
                self.emit(StreamEvent::Message(message));
                terminal
            } else {
                match serde_json::from_str::<Value>(&message.data) {
                    Ok(data) => {
                        self.emit(StreamEvent::Named {
                            event: label.clone(),
                            data,
                            id: message.id,
                        });
                    }
                    Err(e) => {
                        warn!("Dropping '{}' frame with malformed payload: {}", label, e);
                        self.emit(StreamEvent::Error(StreamError::Payload {
                            event: label,
                            message: e.to_string(),
                        }));
                        return;
                    }
                }

                self.options.is_terminal(&label)
            }
        };

        if terminal {
            debug!("Terminal event received from {}", self.target.url);
            self.close();
        }
    }

    fn on_failure(self: &Arc<Self>, generation: u64, ready_state: ReadyState, reason: String) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state == ConnectionState::Closed {
            return;
        }

        self.emit(StreamEvent::Error(StreamError::Transport(reason)));

        // The transport is still retrying on its own
        if ready_state != ReadyState::Closed {
            return;
        }

        let stale = inner.transport.take();
        let policy = &self.options.reconnect;

        if !policy.enabled {
            drop(inner);
            close_handle(stale);
            self.close();
            return;
        }

        if !policy.allows(inner.attempts) {
            let attempts = inner.attempts;
            warn!(
                "Giving up on {} after {} reconnect attempts",
                self.target.url, attempts
            );
            self.emit(StreamEvent::MaxReconnectAttempts { attempts });
            drop(inner);
            close_handle(stale);
            self.close();
            return;
        }

        let delay = policy.delay_for(inner.attempts);
        inner.attempts += 1;
        inner.state = ConnectionState::Reconnecting;
        let attempt = inner.attempts;
        self.emit(StreamEvent::Reconnecting {
            attempt,
            delay,
            max_attempts: policy.max_attempts,
        });
        drop(inner);

        info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            self.target.url, delay, attempt, policy.max_attempts
        );
        close_handle(stale);

        let weak = Arc::downgrade(self);
        let timer = self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.fire_reconnect();
                }
            }),
        );

        let mut inner = self.lock();
        if inner.state == ConnectionState::Reconnecting
            && inner.generation == generation
            && inner.timer.is_none()
        {
            inner.timer = Some(timer);
        } else {
            // Already fired or the client was closed in the meantime
            drop(inner);
            timer.cancel();
        }
    }
}

fn close_handle(handle: Option<Box<dyn TransportHandle>>) {
    if let Some(mut handle) = handle {
        handle.close();
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = inner.timer.take() {
            timer.cancel();
        }
        close_handle(inner.transport.take());
    }
}

/// Callback side of a transport connection.
///
/// Each sink is bound to the connection attempt it was created for. Once that
/// attempt is superseded (by a reconnect or by `close`) every call is ignored.
#[derive(Clone)]
pub struct TransportSink {
    core: Weak<Core>,
    generation: u64,
}

impl TransportSink {
    pub fn opened(&self) {
        if let Some(core) = self.core.upgrade() {
            core.on_open(self.generation);
        }
    }

    pub fn message(&self, message: StreamMessage) {
        if let Some(core) = self.core.upgrade() {
            core.on_message(self.generation, message);
        }
    }

    /// Report a transport failure. Only `ReadyState::Closed` starts a reconnect;
    /// any other state is treated as a transient error.
    pub fn failed(&self, ready_state: ReadyState, reason: impl Into<String>) {
        if let Some(core) = self.core.upgrade() {
            core.on_failure(self.generation, ready_state, reason.into());
        }
    }

    /// True once nothing will accept callbacks from this sink anymore
    pub fn is_detached(&self) -> bool {
        match self.core.upgrade() {
            Some(core) => {
                let inner = core.lock();
                inner.generation != self.generation || inner.state == ConnectionState::Closed
            }
            None => true,
        }
    }
}

impl std::fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Receiving half of a stream client's events
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<StreamEvent>,
}

impl EventStream {
    /// Wait for the next event. `None` once the client is gone and drained.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Take an already delivered event without waiting
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        self.receiver.try_recv().ok()
    }

    /// Take every event delivered so far
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

/// A reconnecting subscription to a server-push endpoint.
///
/// Cloning yields another handle to the same connection. When the last handle
/// is dropped the transport is closed and any pending reconnect is cancelled.
#[derive(Clone)]
pub struct StreamClient {
    core: Arc<Core>,
}

impl StreamClient {
    pub fn new(
        target: StreamTarget,
        options: StreamOptions,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> (Self, EventStream) {
        let (events, receiver) = mpsc::unbounded_channel();
        let core = Arc::new(Core {
            target,
            options,
            transport,
            scheduler,
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                attempts: 0,
                generation: 0,
                transport: None,
                timer: None,
            }),
            events,
        });

        (Self { core }, EventStream { receiver })
    }

    /// A client using [`HttpTransport`] and tokio timers on the current runtime
    pub fn over_http(
        target: StreamTarget,
        options: StreamOptions,
        http: reqwest::Client,
    ) -> Result<(Self, EventStream), TryCurrentError> {
        let transport = HttpTransport::current(http)?;
        let scheduler = TokioScheduler::current()?;
        Ok(Self::new(
            target,
            options,
            Arc::new(transport),
            Arc::new(scheduler),
        ))
    }

    /// Start the subscription. No-op while connecting, open, waiting to
    /// reconnect, or after close.
    #[instrument(skip(self), fields(url = %self.core.target.url))]
    pub fn connect(&self) {
        self.core.connect();
    }

    /// End the subscription for good
    #[instrument(skip(self), fields(url = %self.core.target.url))]
    pub fn close(&self) {
        self.core.close();
    }

    pub fn state(&self) -> StateSnapshot {
        let inner = self.core.lock();
        StateSnapshot {
            state: inner.state,
            connected: inner.state == ConnectionState::Open,
            closed: inner.state == ConnectionState::Closed,
            attempts: inner.attempts,
            ready_state: inner.transport.as_ref().map(|t| t.ready_state()),
        }
    }

    pub fn target(&self) -> &StreamTarget {
        &self.core.target
    }

    pub fn options(&self) -> &StreamOptions {
        &self.core.options
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("target", &self.core.target)
            .field("state", &self.state())
            .finish()
    }
}
