//! Reconnecting Server-Sent Events client.
//!
//! A [`StreamClient`] owns at most one transport connection at a time and
//! reports everything that happens on it as [`StreamEvent`]s on the
//! [`EventStream`] returned next to it. Transport failures never surface as
//! `Err` values: they become `Error` events and, when the transport reports the
//! socket as closed, a reconnect with exponential backoff
//! (`min(base * 2^attempts, max)`) until the attempt budget runs out.
//!
//! The transport and the timer source are injected, so the whole lifecycle can
//! be driven deterministically (see the `testing` module, enabled by the
//! `testing` feature).

pub mod client;
pub mod parse;
pub mod policy;
pub mod scheduler;
pub mod transport;
pub mod types;

pub use client::{
    EventStream, StreamClient, StreamOptions, TransportSink, DEFAULT_NAMED_EVENTS,
    DEFAULT_TERMINAL_EVENTS,
};
pub use parse::SseParser;
pub use policy::ReconnectPolicy;
pub use scheduler::{ScheduledTask, Scheduler, TimerHandle, TokioScheduler};
pub use transport::{HttpTransport, Transport, TransportHandle};
pub use types::{
    ConnectionState, ReadyState, StateSnapshot, StreamError, StreamEvent, StreamMessage,
    StreamTarget, DEFAULT_EVENT_TYPE,
};
