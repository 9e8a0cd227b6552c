//! Deterministic stand-ins for the network and the clock.
//!
//! [`FakeTransport`] hands out connections that only change state when a test
//! says so, and [`ManualScheduler`] keeps timers on a virtual clock that moves
//! only on [`ManualScheduler::advance`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::stream::{
    ReadyState, ScheduledTask, Scheduler, StreamError, StreamMessage, StreamTarget, TimerHandle,
    Transport, TransportHandle, TransportSink,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PendingTimer {
    id: u64,
    due: Duration,
    task: ScheduledTask,
}

#[derive(Default)]
struct Clock {
    now: Duration,
    next_id: u64,
    timers: Vec<PendingTimer>,
    requested: Vec<Duration>,
}

/// Scheduler driven by a virtual clock
#[derive(Clone, Default)]
pub struct ManualScheduler {
    clock: Arc<Mutex<Clock>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation
    pub fn now(&self) -> Duration {
        lock(&self.clock).now
    }

    /// Timers scheduled and neither fired nor cancelled
    pub fn pending(&self) -> usize {
        lock(&self.clock).timers.len()
    }

    /// Every delay ever requested, in order
    pub fn requested_delays(&self) -> Vec<Duration> {
        lock(&self.clock).requested.clone()
    }

    /// Move the clock forward, running every timer that comes due on the way.
    /// Returns how many timers fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = lock(&self.clock).now + by;
        let mut fired = 0;

        loop {
            let task = {
                let mut clock = lock(&self.clock);
                let next = clock
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| (t.due, t.id))
                    .map(|(idx, _)| idx);

                match next {
                    Some(idx) => {
                        let timer = clock.timers.remove(idx);
                        clock.now = timer.due;
                        timer.task
                    }
                    None => {
                        clock.now = target;
                        break;
                    }
                }
            };

            task();
            fired += 1;
        }

        fired
    }

    /// Jump straight to the next timer and run it, returning the virtual time
    /// that had to pass
    pub fn run_next(&self) -> Option<Duration> {
        let wait = {
            let clock = lock(&self.clock);
            let due = clock.timers.iter().map(|t| t.due).min()?;
            due - clock.now
        };
        self.advance(wait);
        Some(wait)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> TimerHandle {
        let id = {
            let mut clock = lock(&self.clock);
            let id = clock.next_id;
            clock.next_id += 1;
            let due = clock.now + delay;
            clock.requested.push(delay);
            clock.timers.push(PendingTimer { id, due, task });
            id
        };

        let clock = self.clock.clone();
        TimerHandle::new(move || {
            lock(&clock).timers.retain(|t| t.id != id);
        })
    }
}

struct FakeConnection {
    target: StreamTarget,
    sink: TransportSink,
    ready: Arc<AtomicU8>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct FakeState {
    connections: Vec<FakeConnection>,
    open_failures: VecDeque<String>,
}

/// Transport whose connections are driven by hand
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open` call fail synchronously
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        lock(&self.state).open_failures.push_back(reason.into());
    }

    /// Number of connections ever handed out
    pub fn open_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    /// Connections handed out and not yet closed by their owner
    pub fn live_connections(&self) -> usize {
        lock(&self.state)
            .connections
            .iter()
            .filter(|c| !c.closed.load(Ordering::Acquire))
            .count()
    }

    /// Target the most recent connection was opened for
    pub fn last_target(&self) -> Option<StreamTarget> {
        lock(&self.state).connections.last().map(|c| c.target.clone())
    }

    fn latest(&self) -> Option<(TransportSink, Arc<AtomicU8>)> {
        lock(&self.state)
            .connections
            .last()
            .map(|c| (c.sink.clone(), c.ready.clone()))
    }

    /// Complete the handshake of the most recent connection
    pub fn accept(&self) {
        if let Some((sink, ready)) = self.latest() {
            ready.store(ReadyState::Open as u8, Ordering::Release);
            sink.opened();
        }
    }

    /// Deliver a frame on the most recent connection
    pub fn send(&self, message: StreamMessage) {
        if let Some((sink, _)) = self.latest() {
            sink.message(message);
        }
    }

    /// Deliver a labeled frame on the most recent connection
    pub fn send_event(&self, event: &str, data: &str) {
        self.send(StreamMessage::new(data).with_event(event));
    }

    /// Lose the most recent connection for good
    pub fn drop_connection(&self) {
        if let Some((sink, ready)) = self.latest() {
            ready.store(ReadyState::Closed as u8, Ordering::Release);
            sink.failed(ReadyState::Closed, "connection lost");
        }
    }

    /// Report an error while the connection is still being retried underneath
    pub fn hiccup(&self) {
        if let Some((sink, ready)) = self.latest() {
            ready.store(ReadyState::Connecting as u8, Ordering::Release);
            sink.failed(ReadyState::Connecting, "transient network error");
        }
    }
}

impl Transport for FakeTransport {
    fn open(
        &self,
        target: &StreamTarget,
        sink: TransportSink,
    ) -> Result<Box<dyn TransportHandle>, StreamError> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.open_failures.pop_front() {
            return Err(StreamError::Transport(reason));
        }

        let ready = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
        let closed = Arc::new(AtomicBool::new(false));
        state.connections.push(FakeConnection {
            target: target.clone(),
            sink,
            ready: ready.clone(),
            closed: closed.clone(),
        });

        Ok(Box::new(FakeHandle { ready, closed }))
    }
}

struct FakeHandle {
    ready: Arc<AtomicU8>,
    closed: Arc<AtomicBool>,
}

impl TransportHandle for FakeHandle {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_raw(self.ready.load(Ordering::Acquire))
    }

    fn close(&mut self) {
        self.ready.store(ReadyState::Closed as u8, Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }
}
