use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Url};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::client::TransportSink;
use super::parse::SseParser;
use super::types::{ReadyState, StreamError, StreamTarget};

const EVENT_STREAM: &str = "text/event-stream";

/// Opens push-channel connections on behalf of a stream client.
///
/// `open` must not block. Everything that happens on the connection afterwards
/// is reported through the given [`TransportSink`].
pub trait Transport: Send + Sync + 'static {
    fn open(
        &self,
        target: &StreamTarget,
        sink: TransportSink,
    ) -> Result<Box<dyn TransportHandle>, StreamError>;
}

/// A live connection created by a [`Transport`]
pub trait TransportHandle: Send {
    fn ready_state(&self) -> ReadyState;

    /// Tear the connection down. Must be safe to call more than once.
    fn close(&mut self);
}

/// SSE over HTTP using `reqwest` streaming bodies
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    runtime: Handle,
}

impl HttpTransport {
    pub fn new(client: Client, runtime: Handle) -> Self {
        Self { client, runtime }
    }

    /// Spawn connections on the runtime the caller is running on
    pub fn current(client: Client) -> Result<Self, TryCurrentError> {
        Ok(Self::new(client, Handle::try_current()?))
    }

    /// A client suited to long-lived streams: no overall request timeout
    pub fn stream_client(connect_timeout: Duration) -> Result<Client, reqwest::Error> {
        Client::builder().connect_timeout(connect_timeout).build()
    }

    fn build_request(&self, target: &StreamTarget) -> Result<RequestBuilder, StreamError> {
        let url = Url::parse_with_params(&target.url, &target.query).map_err(|e| {
            StreamError::Transport(format!("invalid stream url {}: {}", target.url, e))
        })?;

        let builder = match &target.body {
            Some(body) => self.client.post(url).json(body),
            None => self.client.get(url),
        };

        Ok(builder
            .header(ACCEPT, EVENT_STREAM)
            .header(CACHE_CONTROL, "no-cache"))
    }
}

impl Transport for HttpTransport {
    fn open(
        &self,
        target: &StreamTarget,
        sink: TransportSink,
    ) -> Result<Box<dyn TransportHandle>, StreamError> {
        let request = self.build_request(target)?;
        let ready = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
        let task = self.runtime.spawn(drive(request, sink, ready.clone()));

        Ok(Box::new(HttpStreamHandle { task, ready }))
    }
}

struct HttpStreamHandle {
    task: JoinHandle<()>,
    ready: Arc<AtomicU8>,
}

impl TransportHandle for HttpStreamHandle {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_raw(self.ready.load(Ordering::Acquire))
    }

    fn close(&mut self) {
        self.ready.store(ReadyState::Closed as u8, Ordering::Release);
        self.task.abort();
    }
}

impl Drop for HttpStreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn fail(sink: &TransportSink, ready: &AtomicU8, reason: String) {
    ready.store(ReadyState::Closed as u8, Ordering::Release);
    sink.failed(ReadyState::Closed, reason);
}

async fn drive(request: RequestBuilder, sink: TransportSink, ready: Arc<AtomicU8>) {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Stream request failed: {}", e);
            fail(&sink, &ready, format!("request failed: {}", e));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        fail(&sink, &ready, format!("unexpected status {}", status));
        return;
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type.starts_with(EVENT_STREAM) {
        fail(
            &sink,
            &ready,
            format!("unexpected content type '{}'", content_type),
        );
        return;
    }

    ready.store(ReadyState::Open as u8, Ordering::Release);
    sink.opened();

    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for message in parser.feed(&bytes) {
                    sink.message(message);
                }
            }
            Err(e) => {
                fail(&sink, &ready, format!("stream read failed: {}", e));
                return;
            }
        }

        if sink.is_detached() {
            debug!("Stream detached from its client, stopping reader");
            return;
        }
    }

    fail(&sink, &ready, "stream ended by server".to_string());
}
