use mcp_dash::stream::{StreamError, StreamEvent, StreamMessage};
use mcp_dash::{OrchestrationEvent, TaskPhase, TaskTracker};
use serde_json::{json, Value};
use std::time::Duration;

fn named(event: &str, data: Value) -> StreamEvent {
    StreamEvent::Named {
        event: event.to_string(),
        data,
        id: None,
    }
}

fn unlabeled(data: Value) -> StreamEvent {
    StreamEvent::Message(StreamMessage::new(data.to_string()))
}

#[test]
fn test_decode_named_event() {
    let decoded = OrchestrationEvent::decode(&named(
        "executing_step",
        json!({"step_index": 2, "total_steps": 3, "action": "call_tool", "description": "Read file"}),
    ))
    .expect("valid payload");

    assert_eq!(
        decoded,
        Some(OrchestrationEvent::ExecutingStep {
            step_index: 2,
            total_steps: 3,
            action: Some("call_tool".to_string()),
            description: "Read file".to_string(),
        })
    );
}

#[test]
fn test_decode_unlabeled_frame_uses_event_field() {
    let decoded = OrchestrationEvent::decode(&unlabeled(
        json!({"event": "tool_result", "tool": "read_file", "result": {"text": "hi"}}),
    ))
    .expect("valid payload");

    assert_eq!(
        decoded,
        Some(OrchestrationEvent::ToolResult {
            tool: "read_file".to_string(),
            success: true,
            result: json!({"text": "hi"}),
        })
    );
}

#[test]
fn test_decode_error_event() {
    let with_message =
        OrchestrationEvent::decode(&named("error", json!({"message": "Server not deployed"})))
            .expect("valid payload");
    assert_eq!(
        with_message,
        Some(OrchestrationEvent::Failed {
            message: "Server not deployed".to_string()
        })
    );

    let with_error = OrchestrationEvent::decode(&unlabeled(
        json!({"event": "error", "error": "Gemini quota exceeded"}),
    ))
    .expect("valid payload");
    assert_eq!(
        with_error,
        Some(OrchestrationEvent::Failed {
            message: "Gemini quota exceeded".to_string()
        })
    );
}

#[test]
fn test_decode_complete_and_plan() {
    assert_eq!(
        OrchestrationEvent::decode(&named("complete", Value::Null)).expect("valid payload"),
        Some(OrchestrationEvent::Complete)
    );

    let plan = OrchestrationEvent::decode(&named(
        "plan_ready",
        json!({"plan": [{"action": "call_tool"}, {"action": "respond"}]}),
    ))
    .expect("valid payload");
    match plan {
        Some(OrchestrationEvent::PlanReady { steps }) => assert_eq!(steps.len(), 2),
        other => panic!("Expected plan, got {:?}", other),
    }
}

#[test]
fn test_decode_unknown_and_plain_frames() {
    let unknown = OrchestrationEvent::decode(&unlabeled(json!({"event": "heartbeat", "n": 1})))
        .expect("valid payload");
    assert_eq!(
        unknown,
        Some(OrchestrationEvent::Other {
            event: "heartbeat".to_string(),
            data: json!({"event": "heartbeat", "n": 1}),
        })
    );

    let plain = OrchestrationEvent::decode(&unlabeled(json!({"status": "ok"})))
        .expect("valid payload");
    assert_eq!(
        plain,
        Some(OrchestrationEvent::Other {
            event: "message".to_string(),
            data: json!({"status": "ok"}),
        })
    );

    let scalar = OrchestrationEvent::decode(&named("update", json!(42))).expect("valid payload");
    assert_eq!(
        scalar,
        Some(OrchestrationEvent::Other {
            event: "update".to_string(),
            data: json!(42),
        })
    );
}

#[test]
fn test_decode_rejects_non_json_message() {
    let event = StreamEvent::Message(StreamMessage::new("not json"));
    assert!(OrchestrationEvent::decode(&event).is_err());
}

#[test]
fn test_lifecycle_events_decode_to_nothing() {
    for event in [
        StreamEvent::Open,
        StreamEvent::Close,
        StreamEvent::Error(StreamError::Transport("lost".to_string())),
    ] {
        assert_eq!(OrchestrationEvent::decode(&event).expect("no payload"), None);
    }
}

#[test]
fn test_tracker_follows_task() {
    let mut tracker = TaskTracker::new("fs-1", "read the README");
    assert_eq!(tracker.progress().phase, TaskPhase::Pending);

    tracker.observe(&StreamEvent::Open);
    tracker.observe(&unlabeled(json!({"event": "start", "server": "fs-1"})));
    tracker.observe(&unlabeled(
        json!({"event": "connecting", "message": "Connecting to MCP server"}),
    ));
    assert_eq!(tracker.progress().phase, TaskPhase::Connecting);

    tracker.observe(&unlabeled(json!({
        "event": "capabilities",
        "tools": [{"name": "read_file", "description": "Read"}, {"name": "list_files"}]
    })));
    tracker.observe(&unlabeled(json!({"event": "planning", "message": "Planning"})));
    assert_eq!(tracker.progress().phase, TaskPhase::Planning);

    tracker.observe(&unlabeled(json!({"event": "plan_ready", "plan": [{}]})));
    tracker.observe(&unlabeled(json!({
        "event": "executing_step",
        "step_index": 1,
        "total_steps": 1,
        "description": "Read README.md"
    })));
    tracker.observe(&unlabeled(
        json!({"event": "invoking_tool", "tool": "read_file", "args": {"path": "README.md"}}),
    ));
    assert_eq!(
        tracker.progress().status_message.as_deref(),
        Some("Invoking read_file")
    );
    tracker.observe(&unlabeled(
        json!({"event": "tool_result", "tool": "read_file", "success": true, "result": "# Hi"}),
    ));
    tracker.observe(&unlabeled(json!({"event": "finalizing", "message": "Summarizing"})));
    assert_eq!(tracker.progress().phase, TaskPhase::Finalizing);

    let decoded = tracker.observe(&unlabeled(
        json!({"event": "gemini_response", "response": "The README says hi"}),
    ));
    assert!(matches!(decoded, Some(OrchestrationEvent::Response { .. })));

    let progress = tracker.progress();
    assert!(tracker.is_finished());
    assert_eq!(progress.phase, TaskPhase::Completed);
    assert_eq!(progress.tools_available, 2);
    assert_eq!(progress.plan_steps, 1);
    assert_eq!(progress.step, Some((1, 1)));
    assert_eq!(progress.tool_outcomes.len(), 1);
    assert_eq!(progress.response, Some(json!("The README says hi")));
    assert_eq!(progress.error, None);
    assert!(progress.finished_at.is_some());

    // The trailing close must not turn a completed task into a failure
    assert_eq!(tracker.observe(&StreamEvent::Close), None);
    assert_eq!(tracker.progress().phase, TaskPhase::Completed);
}

#[test]
fn test_tracker_records_tool_errors() {
    let mut tracker = TaskTracker::new("fs-1", "read a missing file");

    tracker.observe(&named(
        "tool_error",
        json!({"tool": "read_file", "error": "No such file"}),
    ));

    let outcome = &tracker.progress().tool_outcomes[0];
    assert_eq!(outcome.tool, "read_file");
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("No such file"));
    assert!(!tracker.is_finished());
}

#[test]
fn test_tracker_fails_on_server_error() {
    let mut tracker = TaskTracker::new("fs-1", "anything");

    tracker.observe(&named("error", json!({"message": "Server fs-1 is not deployed"})));

    assert_eq!(tracker.progress().phase, TaskPhase::Failed);
    assert_eq!(
        tracker.progress().error.as_deref(),
        Some("Server fs-1 is not deployed")
    );
}

#[test]
fn test_tracker_fails_when_stream_closes_early() {
    let mut tracker = TaskTracker::new("fs-1", "anything");

    tracker.observe(&StreamEvent::Open);
    tracker.observe(&StreamEvent::Close);

    assert_eq!(tracker.progress().phase, TaskPhase::Failed);
    assert_eq!(
        tracker.progress().error.as_deref(),
        Some("stream closed before the task finished")
    );
}

#[test]
fn test_tracker_reports_reconnects() {
    let mut tracker = TaskTracker::new("fs-1", "anything");

    tracker.observe(&StreamEvent::Error(StreamError::Transport(
        "connection lost".to_string(),
    )));
    tracker.observe(&StreamEvent::Reconnecting {
        attempt: 2,
        delay: Duration::from_secs(2),
        max_attempts: 5,
    });
    assert_eq!(tracker.progress().reconnecting, Some((2, 5)));
    assert!(!tracker.is_finished());

    tracker.observe(&StreamEvent::Open);
    assert_eq!(tracker.progress().reconnecting, None);

    tracker.observe(&StreamEvent::MaxReconnectAttempts { attempts: 5 });
    assert_eq!(tracker.progress().phase, TaskPhase::Failed);
    assert!(tracker
        .progress()
        .error
        .as_deref()
        .is_some_and(|e| e.contains("5 reconnect attempts")));
}

#[test]
fn test_tracker_skips_malformed_frames() {
    let mut tracker = TaskTracker::new("fs-1", "anything");

    assert_eq!(
        tracker.observe(&StreamEvent::Message(StreamMessage::new("{broken"))),
        None
    );
    assert_eq!(
        tracker.observe(&StreamEvent::Error(StreamError::Payload {
            event: "update".to_string(),
            message: "expected value".to_string(),
        })),
        None
    );
    assert_eq!(tracker.progress().phase, TaskPhase::Pending);
}
