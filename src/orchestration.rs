//! Client-side view of a streaming orchestration task.
//!
//! The orchestration stream reports progress either as labeled frames
//! (`event: tool_result`) or as unlabeled frames whose JSON body carries an
//! `event` field. [`OrchestrationEvent::decode`] accepts both, and
//! [`TaskTracker`] folds the events into a [`TaskProgress`] a view can render.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::stream::{StreamError, StreamEvent};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Progress reported by the platform while it works on a task
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationEvent {
    Start {
        server: Option<String>,
    },
    Connecting {
        message: String,
    },
    Discovering {
        message: String,
    },
    Capabilities {
        protocol: Option<String>,
        tools: Vec<ToolSummary>,
    },
    Planning {
        message: String,
    },
    PlanReady {
        steps: Vec<Value>,
    },
    ExecutingStep {
        step_index: usize,
        total_steps: usize,
        action: Option<String>,
        description: String,
    },
    InvokingTool {
        tool: String,
        args: Value,
    },
    ToolResult {
        tool: String,
        success: bool,
        result: Value,
    },
    ToolError {
        tool: String,
        error: String,
    },
    Finalizing {
        message: String,
    },
    /// The model's final answer
    Response {
        response: Value,
    },
    Complete,
    Failed {
        message: String,
    },
    /// A label this client does not know about
    Other {
        event: String,
        data: Value,
    },
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireEvent {
    Start {
        #[serde(default)]
        server: Option<String>,
    },
    Connecting {
        #[serde(default)]
        message: String,
    },
    Discovering {
        #[serde(default)]
        message: String,
    },
    Capabilities {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        tools: Vec<ToolSummary>,
    },
    Planning {
        #[serde(default)]
        message: String,
    },
    PlanReady {
        #[serde(default)]
        plan: Vec<Value>,
    },
    ExecutingStep {
        #[serde(default)]
        step_index: usize,
        #[serde(default)]
        total_steps: usize,
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        description: String,
    },
    InvokingTool {
        #[serde(default)]
        tool: String,
        #[serde(default)]
        args: Value,
    },
    ToolResult {
        #[serde(default)]
        tool: String,
        #[serde(default = "default_success")]
        success: bool,
        #[serde(default)]
        result: Value,
    },
    ToolError {
        #[serde(default)]
        tool: String,
        #[serde(default)]
        error: String,
    },
    Finalizing {
        #[serde(default)]
        message: String,
    },
    GeminiResponse {
        #[serde(default)]
        response: Value,
    },
    Complete,
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

fn default_success() -> bool {
    true
}

impl WireEvent {
    fn into_event(self) -> Option<OrchestrationEvent> {
        let event = match self {
            WireEvent::Start { server } => OrchestrationEvent::Start { server },
            WireEvent::Connecting { message } => OrchestrationEvent::Connecting { message },
            WireEvent::Discovering { message } => OrchestrationEvent::Discovering { message },
            WireEvent::Capabilities { protocol, tools } => {
                OrchestrationEvent::Capabilities { protocol, tools }
            }
            WireEvent::Planning { message } => OrchestrationEvent::Planning { message },
            WireEvent::PlanReady { plan } => OrchestrationEvent::PlanReady { steps: plan },
            WireEvent::ExecutingStep {
                step_index,
                total_steps,
                action,
                description,
            } => OrchestrationEvent::ExecutingStep {
                step_index,
                total_steps,
                action,
                description,
            },
            WireEvent::InvokingTool { tool, args } => OrchestrationEvent::InvokingTool { tool, args },
            WireEvent::ToolResult {
                tool,
                success,
                result,
            } => OrchestrationEvent::ToolResult {
                tool,
                success,
                result,
            },
            WireEvent::ToolError { tool, error } => OrchestrationEvent::ToolError { tool, error },
            WireEvent::Finalizing { message } => OrchestrationEvent::Finalizing { message },
            WireEvent::GeminiResponse { response } => OrchestrationEvent::Response { response },
            WireEvent::Complete => OrchestrationEvent::Complete,
            WireEvent::Error { message, error } => OrchestrationEvent::Failed {
                message: message
                    .or(error)
                    .unwrap_or_else(|| "orchestration failed".to_string()),
            },
            WireEvent::Unknown => return None,
        };
        Some(event)
    }
}

impl OrchestrationEvent {
    /// Decode a JSON object carrying an `event` field
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let label = value
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let wire: WireEvent = serde_json::from_value(value.clone())?;
        Ok(wire.into_event().unwrap_or(OrchestrationEvent::Other {
            event: label,
            data: value,
        }))
    }

    /// Decode the orchestration payload of a stream event, if it has one.
    ///
    /// Named events use their label as the event kind; unlabeled messages must
    /// be JSON objects with an `event` field. Lifecycle events (`Open`,
    /// `Reconnecting`, ...) yield `Ok(None)`.
    pub fn decode(event: &StreamEvent) -> Result<Option<Self>, serde_json::Error> {
        match event {
            StreamEvent::Named { event, data, .. } => {
                let mut data = match data {
                    Value::Object(map) => Value::Object(map.clone()),
                    Value::Null => Value::Object(Default::default()),
                    other => {
                        return Ok(Some(OrchestrationEvent::Other {
                            event: event.clone(),
                            data: other.clone(),
                        }))
                    }
                };
                if let Some(map) = data.as_object_mut() {
                    map.insert("event".to_string(), Value::String(event.clone()));
                }
                Self::from_value(data).map(Some)
            }
            StreamEvent::Message(message) => {
                let value: Value = serde_json::from_str(&message.data)?;
                if value.get("event").and_then(Value::as_str).is_some() {
                    Self::from_value(value).map(Some)
                } else {
                    Ok(Some(OrchestrationEvent::Other {
                        event: message.event_type().to_string(),
                        data: value,
                    }))
                }
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Pending,
    Connecting,
    Planning,
    Executing,
    Finalizing,
    Completed,
    Failed,
}

impl TaskPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskPhase::Completed | TaskPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub tool: String,
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
}

/// Everything known about a task so far
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub id: Uuid,
    pub server_id: String,
    pub prompt: String,
    pub phase: TaskPhase,
    pub status_message: Option<String>,
    pub tools_available: usize,
    pub plan_steps: usize,
    /// (current step, total steps), 1-based
    pub step: Option<(usize, usize)>,
    pub tool_outcomes: Vec<ToolOutcome>,
    pub response: Option<Value>,
    pub error: Option<String>,
    /// (attempt, max attempts) while the stream is reconnecting
    pub reconnecting: Option<(u32, u32)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Folds stream events into [`TaskProgress`]
#[derive(Debug, Clone)]
pub struct TaskTracker {
    progress: TaskProgress,
}

impl TaskTracker {
    pub fn new(server_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            progress: TaskProgress {
                id: Uuid::new_v4(),
                server_id: server_id.into(),
                prompt: prompt.into(),
                phase: TaskPhase::Pending,
                status_message: None,
                tools_available: 0,
                plan_steps: 0,
                step: None,
                tool_outcomes: Vec::new(),
                response: None,
                error: None,
                reconnecting: None,
                started_at: Utc::now(),
                finished_at: None,
            },
        }
    }

    pub fn progress(&self) -> &TaskProgress {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.progress.phase.is_finished()
    }

    /// Apply a raw stream event. Returns the decoded orchestration event, if any.
    pub fn observe(&mut self, event: &StreamEvent) -> Option<OrchestrationEvent> {
        if self.is_finished() {
            return None;
        }

        match event {
            StreamEvent::Open => {
                self.progress.reconnecting = None;
                None
            }
            StreamEvent::Reconnecting {
                attempt,
                max_attempts,
                ..
            } => {
                self.progress.reconnecting = Some((*attempt, *max_attempts));
                None
            }
            StreamEvent::MaxReconnectAttempts { attempts } => {
                self.fail(format!(
                    "lost connection to the orchestration stream after {} reconnect attempts",
                    attempts
                ));
                None
            }
            StreamEvent::Close => {
                self.fail("stream closed before the task finished".to_string());
                None
            }
            StreamEvent::Error(StreamError::Transport(reason)) => {
                debug!("Transport error during task {}: {}", self.progress.id, reason);
                None
            }
            StreamEvent::Error(e @ StreamError::Payload { .. }) => {
                warn!("Ignoring malformed frame for task {}: {}", self.progress.id, e);
                None
            }
            StreamEvent::Named { .. } | StreamEvent::Message(_) => {
                match OrchestrationEvent::decode(event) {
                    Ok(Some(decoded)) => {
                        self.apply(decoded.clone());
                        Some(decoded)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!("Undecodable orchestration frame: {}", e);
                        None
                    }
                }
            }
        }
    }

    pub fn apply(&mut self, event: OrchestrationEvent) {
        if self.is_finished() {
            return;
        }

        let progress = &mut self.progress;
        match event {
            OrchestrationEvent::Start { server } => {
                progress.status_message = server.map(|s| format!("Started on {}", s));
            }
            OrchestrationEvent::Connecting { message } | OrchestrationEvent::Discovering { message } => {
                progress.phase = TaskPhase::Connecting;
                progress.status_message = Some(message);
            }
            OrchestrationEvent::Capabilities { tools, .. } => {
                progress.tools_available = tools.len();
            }
            OrchestrationEvent::Planning { message } => {
                progress.phase = TaskPhase::Planning;
                progress.status_message = Some(message);
            }
            OrchestrationEvent::PlanReady { steps } => {
                progress.plan_steps = steps.len();
            }
            OrchestrationEvent::ExecutingStep {
                step_index,
                total_steps,
                description,
                ..
            } => {
                progress.phase = TaskPhase::Executing;
                progress.step = Some((step_index, total_steps));
                progress.status_message = Some(description);
            }
            OrchestrationEvent::InvokingTool { tool, .. } => {
                progress.status_message = Some(format!("Invoking {}", tool));
            }
            OrchestrationEvent::ToolResult {
                tool,
                success,
                result,
            } => progress.tool_outcomes.push(ToolOutcome {
                tool,
                success,
                result,
                error: None,
            }),
            OrchestrationEvent::ToolError { tool, error } => progress.tool_outcomes.push(ToolOutcome {
                tool,
                success: false,
                result: Value::Null,
                error: Some(error),
            }),
            OrchestrationEvent::Finalizing { message } => {
                progress.phase = TaskPhase::Finalizing;
                progress.status_message = Some(message);
            }
            OrchestrationEvent::Response { response } => {
                progress.response = Some(response);
                self.finish(TaskPhase::Completed);
            }
            OrchestrationEvent::Complete => self.finish(TaskPhase::Completed),
            OrchestrationEvent::Failed { message } => self.fail(message),
            OrchestrationEvent::Other { event, .. } => {
                debug!("Unhandled orchestration event '{}'", event);
            }
        }
    }

    fn fail(&mut self, message: String) {
        self.progress.error = Some(message);
        self.finish(TaskPhase::Failed);
    }

    fn finish(&mut self, phase: TaskPhase) {
        self.progress.phase = phase;
        self.progress.reconnecting = None;
        self.progress.finished_at = Some(Utc::now());
    }
}
