use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use mcp_dash::stream::{
    EventStream, HttpTransport, ReconnectPolicy, StreamClient, StreamError, StreamEvent,
    StreamOptions, StreamTarget,
};
use mcp_dash::testing::ManualScheduler;
use mcp_dash::{ApiClient, TaskPhase, TaskTracker};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn next_event(events: &mut EventStream) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("timed out waiting for a stream event")
        .expect("event channel closed")
}

async fn until_close(events: &mut EventStream) -> Vec<StreamEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(event, StreamEvent::Close);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn kinds(events: &[StreamEvent]) -> Vec<&str> {
    events.iter().map(|e| e.kind()).collect()
}

#[tokio::test]
async fn test_labeled_frames_until_complete() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/events")
                .query_param("task", "abc")
                .header("accept", "text/event-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(
                    ": connected\n\n\
                     event: progress\nid: 1\ndata: {\"pct\": 50}\n\n\
                     event: complete\nid: 2\ndata: {\"ok\": true}\n\n",
                );
        })
        .await;

    let target = StreamTarget::new(server.url("/events")).with_query("task", "abc");
    let (client, mut events) =
        StreamClient::over_http(target, StreamOptions::default(), reqwest::Client::new())
            .expect("runtime available");
    client.connect();

    let seen = until_close(&mut events).await;

    mock.assert_async().await;
    assert_eq!(kinds(&seen), vec!["open", "progress", "complete", "close"]);
    assert_eq!(
        seen[1],
        StreamEvent::Named {
            event: "progress".to_string(),
            data: json!({"pct": 50}),
            id: Some("1".to_string()),
        }
    );
    assert!(client.state().closed);
}

#[tokio::test]
async fn test_server_error_with_no_attempts_left() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/events");
            then.status(500).body("boom");
        })
        .await;

    let options = StreamOptions::default().with_reconnect(ReconnectPolicy::new().with_max_attempts(0));
    let (client, mut events) = StreamClient::over_http(
        StreamTarget::new(server.url("/events")),
        options,
        reqwest::Client::new(),
    )
    .expect("runtime available");
    client.connect();

    let seen = until_close(&mut events).await;

    assert_eq!(kinds(&seen), vec!["error", "max-reconnect-attempts", "close"]);
    match &seen[0] {
        StreamEvent::Error(StreamError::Transport(reason)) => assert!(reason.contains("500")),
        other => panic!("Expected transport error, got {:?}", other),
    }
    assert_eq!(seen[1], StreamEvent::MaxReconnectAttempts { attempts: 0 });
}

#[tokio::test]
async fn test_wrong_content_type_is_a_failure() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/events");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"detail": "not a stream"}));
        })
        .await;

    let options = StreamOptions::default().with_reconnect(ReconnectPolicy::disabled());
    let (client, mut events) = StreamClient::over_http(
        StreamTarget::new(server.url("/events")),
        options,
        reqwest::Client::new(),
    )
    .expect("runtime available");
    client.connect();

    let seen = until_close(&mut events).await;

    assert_eq!(kinds(&seen), vec!["error", "close"]);
    match &seen[0] {
        StreamEvent::Error(StreamError::Transport(reason)) => {
            assert!(reason.contains("content type"))
        }
        other => panic!("Expected transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reconnects_after_server_failure() {
    let server = MockServer::start_async().await;
    let mut failing = server
        .mock_async(|when, then| {
            when.method(GET).path("/events");
            then.status(503);
        })
        .await;

    // Real HTTP, virtual timers
    let scheduler = ManualScheduler::new();
    let transport = HttpTransport::current(reqwest::Client::new()).expect("runtime available");
    let (client, mut events) = StreamClient::new(
        StreamTarget::new(server.url("/events")),
        StreamOptions::default(),
        Arc::new(transport),
        Arc::new(scheduler.clone()),
    );
    client.connect();

    assert_eq!(next_event(&mut events).await.kind(), "error");
    match next_event(&mut events).await {
        StreamEvent::Reconnecting { attempt, delay, .. } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(1000));
        }
        other => panic!("Expected reconnecting, got {:?}", other),
    }

    failing.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/events");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body("event: complete\ndata: {}\n\n");
        })
        .await;

    assert_eq!(scheduler.run_next(), Some(Duration::from_millis(1000)));

    let seen = until_close(&mut events).await;
    assert_eq!(kinds(&seen), vec!["open", "complete", "close"]);
    assert_eq!(client.state().attempts, 0);
}

#[tokio::test]
async fn test_orchestration_stream_drives_tracker() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/orchestrate/stream")
                .json_body(json!({"server_id": "srv-1", "prompt": "list the repo files"}));
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    "data: {\"event\": \"start\", \"server\": \"srv-1\"}\n\n",
                    "data: {\"event\": \"capabilities\", \"protocol\": \"2024-11-05\", \"tools\": [{\"name\": \"list_files\"}]}\n\n",
                    "data: {\"event\": \"plan_ready\", \"plan\": [{\"action\": \"call_tool\"}]}\n\n",
                    "data: {\"event\": \"executing_step\", \"step_index\": 1, \"total_steps\": 1, \"action\": \"call_tool\", \"description\": \"List files\"}\n\n",
                    "data: {\"event\": \"tool_result\", \"tool\": \"list_files\", \"success\": true, \"result\": [\"README.md\"]}\n\n",
                    "data: {\"event\": \"gemini_response\", \"response\": {\"text\": \"One file: README.md\"}}\n\n",
                    "data: {\"event\": \"complete\"}\n\n",
                ));
        })
        .await;

    let api = ApiClient::new(server.base_url()).expect("client builds");
    let (client, mut events) = api
        .orchestrate_stream(
            "srv-1",
            "list the repo files",
            None,
            ReconnectPolicy::disabled(),
        )
        .expect("stream starts");

    let mut tracker = TaskTracker::new("srv-1", "list the repo files");
    while !tracker.is_finished() {
        let event = next_event(&mut events).await;
        tracker.observe(&event);
    }
    client.close();

    mock.assert_async().await;
    let progress = tracker.progress();
    assert_eq!(progress.phase, TaskPhase::Completed);
    assert_eq!(progress.tools_available, 1);
    assert_eq!(progress.plan_steps, 1);
    assert_eq!(progress.step, Some((1, 1)));
    assert_eq!(progress.tool_outcomes.len(), 1);
    assert!(progress.tool_outcomes[0].success);
    assert_eq!(
        progress.response,
        Some(json!({"text": "One file: README.md"}))
    );
    assert!(progress.finished_at.is_some());
}

#[tokio::test]
async fn test_finished_orchestration_is_not_resent() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/orchestrate/stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    "data: {\"event\": \"start\", \"server\": \"srv-1\"}\n\n",
                    "data: {\"event\": \"gemini_response\", \"response\": \"done\"}\n\n",
                    "data: {\"event\": \"complete\"}\n\n",
                ));
        })
        .await;

    let api = ApiClient::new(server.base_url()).expect("client builds");
    let policy = ReconnectPolicy::new().with_base_delay(Duration::from_millis(50));
    let (client, mut events) = api
        .orchestrate_stream("srv-1", "summarize the repo", None, policy)
        .expect("stream starts");

    // The client closes on its own, without the caller's help
    let seen = until_close(&mut events).await;
    assert_eq!(kinds(&seen), vec!["open", "message", "message", "close"]);

    // Several base delays later the task still ran exactly once
    tokio::time::sleep(Duration::from_millis(300)).await;
    mock.assert_hits_async(1).await;
    assert!(client.state().closed);
    assert!(events.try_next().is_none());
}

#[tokio::test]
async fn test_tokio_scheduler_fires_and_cancels() {
    use mcp_dash::stream::{Scheduler, TokioScheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    let scheduler = TokioScheduler::current().expect("runtime available");
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    let _kept = scheduler.schedule(
        Duration::from_millis(10),
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let counter = fired.clone();
    let cancelled = scheduler.schedule(
        Duration::from_millis(10),
        Box::new(move || {
            counter.fetch_add(10, Ordering::SeqCst);
        }),
    );
    cancelled.cancel();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
