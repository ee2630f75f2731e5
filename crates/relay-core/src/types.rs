use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A tool invocation requested by a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
        }
    }
}

/// Outcome of a single tool call. Failures are values, not errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_name: String,
    pub status: ToolStatus,
    pub output: String,
}

impl ToolResult {
    pub fn success(tool_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolStatus::Success,
            output: output.into(),
        }
    }

    pub fn error(tool_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolStatus::Error,
            output: output.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}

/// Tool schema sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Provider-agnostic completion request.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// One frame of a streamed completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Why a workflow run stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Terminal,
    Signal,
    Paused,
    HandoffsExhausted,
    NoNextAgent,
    MaxRounds,
    QuotaExceeded,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Terminal => "terminal",
            StopReason::Signal => "signal",
            StopReason::Paused => "paused",
            StopReason::HandoffsExhausted => "handoffs_exhausted",
            StopReason::NoNextAgent => "no_next_agent",
            StopReason::MaxRounds => "max_rounds",
            StopReason::QuotaExceeded => "quota_exceeded",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// Input to one workflow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub input: String,
    #[serde(default)]
    pub resume_agent_id: Option<String>,
}

impl ExecuteRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            resume_agent_id: None,
        }
    }

    pub fn resume_from(mut self, agent_id: impl Into<String>) -> Self {
        self.resume_agent_id = Some(agent_id.into());
        self
    }
}

/// Final state of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResponse {
    pub agent_id: String,
    pub agent_name: String,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub is_terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_agent_id: Option<String>,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    AgentStart,
    AgentResponse,
    /// Incremental content while an agent is still answering.
    Delta,
    ToolStart,
    ToolResult,
    Route,
    Parallel,
    Warning,
    Pause,
    Terminate,
    Error,
    Done,
    Ping,
}

/// Event emitted by a streaming workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(kind: EventKind, agent: impl Into<String>) -> Self {
        Self {
            kind,
            agent: agent.into(),
            content: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// True for the two events that close a stream.
    pub fn is_final(&self) -> bool {
        matches!(self.kind, EventKind::Done | EventKind::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_serializes_type_field() {
        let event = StreamEvent::new(EventKind::AgentStart, "writer").with_content("go");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent_start");
        assert_eq!(json["agent"], "writer");
        assert_eq!(json["content"], "go");
    }

    #[test]
    fn workflow_response_omits_empty_pause() {
        let resp = WorkflowResponse {
            agent_id: "a".into(),
            agent_name: "A".into(),
            content: "hi".into(),
            tool_calls: vec![],
            is_terminal: true,
            paused_agent_id: None,
            stop_reason: StopReason::Terminal,
            signal: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("paused_agent_id").is_none());
        assert_eq!(json["stop_reason"], "terminal");
    }

    #[test]
    fn role_rejects_unknown_values() {
        let bad: std::result::Result<Message, _> =
            serde_json::from_str(r#"{"role":"tool","content":"x"}"#);
        assert!(bad.is_err());
    }
}
