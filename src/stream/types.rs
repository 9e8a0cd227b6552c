use serde_json::Value;
use std::time::Duration;

/// Event type assumed for frames that carry no `event:` label
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Where a stream connects to
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTarget {
    pub url: String,
    pub query: Vec<(String, String)>,
    /// When set, the subscription is opened with a POST carrying this JSON body
    pub body: Option<Value>,
}

impl StreamTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_json_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A single inbound frame as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamMessage {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    /// Reconnection interval hint sent by the server, in milliseconds
    pub retry: Option<u64>,
}

impl StreamMessage {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The frame's label, falling back to `message`
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT_TYPE)
    }
}

/// Transport-level connection state, numbered like the browser `EventSource`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ReadyState {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            _ => ReadyState::Closed,
        }
    }
}

/// Lifecycle of a [`StreamClient`](super::StreamClient)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Failures surfaced through [`StreamEvent::Error`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid JSON payload for '{event}' event: {message}")]
    Payload { event: String, message: String },
}

/// Everything a stream subscriber can observe
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Open,
    /// A frame without a recognized label; payload left untouched
    Message(StreamMessage),
    /// A frame whose label is one of the configured named events
    Named {
        event: String,
        data: Value,
        id: Option<String>,
    },
    Error(StreamError),
    Reconnecting {
        attempt: u32,
        delay: Duration,
        max_attempts: u32,
    },
    MaxReconnectAttempts {
        attempts: u32,
    },
    Close,
}

impl StreamEvent {
    /// Name of the event as a listener would subscribe to it
    pub fn kind(&self) -> &str {
        match self {
            StreamEvent::Open => "open",
            StreamEvent::Message(_) => DEFAULT_EVENT_TYPE,
            StreamEvent::Named { event, .. } => event,
            StreamEvent::Error(_) => "error",
            StreamEvent::Reconnecting { .. } => "reconnecting",
            StreamEvent::MaxReconnectAttempts { .. } => "max-reconnect-attempts",
            StreamEvent::Close => "close",
        }
    }
}

/// Point-in-time view of a stream client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    pub connected: bool,
    pub closed: bool,
    pub attempts: u32,
    /// `None` when no transport is attached
    pub ready_state: Option<ReadyState>,
}
