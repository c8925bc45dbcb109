use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ProjectId, SessionId, TaskId, ThreadId};

/// Domain events produced by agents and relayed to browsers over SSE.
/// Serialized with a `type` discriminator, e.g. `{"type":"AGENT_TOKEN",...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum LaceEvent {
    UserMessage {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
        data: MessageContent,
    },
    AgentMessage {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
        data: MessageContent,
    },
    /// One streamed chunk of an in-progress agent response.
    AgentToken {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
        data: TokenChunk,
    },
    ToolCall {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
        data: ToolCallData,
    },
    ToolResult {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
        data: ToolResultData,
    },
    AgentStateChange {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
        data: StateChange,
    },
    CompactionStart {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
        data: CompactionStartData,
    },
    CompactionComplete {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
        data: CompactionCompleteData,
    },
    LocalSystemMessage {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
        data: MessageContent,
    },
    ToolApprovalRequest {
        thread_id: ThreadId,
        timestamp: DateTime<Utc>,
        data: ApprovalRequest,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenChunk {
    pub token: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultData {
    pub id: String,
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Thinking,
    Streaming,
    ToolExecution,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub agent_id: ThreadId,
    pub from: AgentState,
    pub to: AgentState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionStartData {
    pub strategy: String,
    #[serde(default)]
    pub auto: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionCompleteData {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_before: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_after: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Moderate,
    Destructive,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    pub risk_level: RiskLevel,
}

impl LaceEvent {
    pub fn thread_id(&self) -> &ThreadId {
        match self {
            Self::UserMessage { thread_id, .. }
            | Self::AgentMessage { thread_id, .. }
            | Self::AgentToken { thread_id, .. }
            | Self::ToolCall { thread_id, .. }
            | Self::ToolResult { thread_id, .. }
            | Self::AgentStateChange { thread_id, .. }
            | Self::CompactionStart { thread_id, .. }
            | Self::CompactionComplete { thread_id, .. }
            | Self::LocalSystemMessage { thread_id, .. }
            | Self::ToolApprovalRequest { thread_id, .. } => thread_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::UserMessage { timestamp, .. }
            | Self::AgentMessage { timestamp, .. }
            | Self::AgentToken { timestamp, .. }
            | Self::ToolCall { timestamp, .. }
            | Self::ToolResult { timestamp, .. }
            | Self::AgentStateChange { timestamp, .. }
            | Self::CompactionStart { timestamp, .. }
            | Self::CompactionComplete { timestamp, .. }
            | Self::LocalSystemMessage { timestamp, .. }
            | Self::ToolApprovalRequest { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "USER_MESSAGE",
            Self::AgentMessage { .. } => "AGENT_MESSAGE",
            Self::AgentToken { .. } => "AGENT_TOKEN",
            Self::ToolCall { .. } => "TOOL_CALL",
            Self::ToolResult { .. } => "TOOL_RESULT",
            Self::AgentStateChange { .. } => "AGENT_STATE_CHANGE",
            Self::CompactionStart { .. } => "COMPACTION_START",
            Self::CompactionComplete { .. } => "COMPACTION_COMPLETE",
            Self::LocalSystemMessage { .. } => "LOCAL_SYSTEM_MESSAGE",
            Self::ToolApprovalRequest { .. } => "TOOL_APPROVAL_REQUEST",
        }
    }

    pub fn agent_state_change(agent_id: ThreadId, from: AgentState, to: AgentState) -> Self {
        Self::AgentStateChange {
            thread_id: agent_id.clone(),
            timestamp: Utc::now(),
            data: StateChange { agent_id, from, to },
        }
    }
}

/// Task lifecycle notifications broadcast under the `task` category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Value>,
    pub context: TaskContext,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEventKind {
    #[serde(rename = "task:created")]
    Created,
    #[serde(rename = "task:updated")]
    Updated,
    #[serde(rename = "task:deleted")]
    Deleted,
    #[serde(rename = "task:note_added")]
    NoteAdded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
}

/// Broadcast category. Carried on the wire as `eventType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Session,
    Task,
    Project,
    Global,
}

/// Addressing metadata. Informational only: recipients are never selected by scope.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
}

impl EventScope {
    pub fn session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Session(LaceEvent),
    Task(TaskEvent),
    Other(Value),
}

/// The envelope handed to the broadcaster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub event_type: EventCategory,
    pub scope: EventScope,
    pub data: EventData,
}

impl StreamEvent {
    pub fn session(session_id: SessionId, event: LaceEvent) -> Self {
        Self {
            event_type: EventCategory::Session,
            scope: EventScope::session(session_id),
            data: EventData::Session(event),
        }
    }

    /// Scope a session event from its thread ID (`<sessionId>.<n>`).
    /// Falls back to the thread ID itself when it carries no session prefix.
    pub fn for_thread(event: LaceEvent) -> Self {
        let thread_id = event.thread_id().clone();
        let session_id = thread_id
            .session_id()
            .unwrap_or_else(|| SessionId::from_raw(thread_id.as_str()));
        Self {
            event_type: EventCategory::Session,
            scope: EventScope {
                session_id: Some(session_id),
                thread_id: Some(thread_id),
                ..Default::default()
            },
            data: EventData::Session(event),
        }
    }

    pub fn task(event: TaskEvent) -> Self {
        Self {
            event_type: EventCategory::Task,
            scope: EventScope {
                session_id: event.context.session_id.clone(),
                project_id: event.context.project_id.clone(),
                task_id: Some(event.task_id.clone()),
                thread_id: None,
            },
            data: EventData::Task(event),
        }
    }

    pub fn global(data: Value) -> Self {
        Self {
            event_type: EventCategory::Global,
            scope: EventScope::default(),
            data: EventData::Other(data),
        }
    }
}
