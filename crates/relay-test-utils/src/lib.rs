//! Test doubles and fixtures shared by the Relay crates.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};

use relay_core::config::{
    AgentConfig, GatewayConfig, ModelConfig, QuotaConfig, RoutingConfig, RoutingSignal, WorkflowConfig,
    WorkflowSettings,
};
use relay_core::error::{RelayError, Result};
use relay_core::traits::{LlmProvider, Tool};
use relay_core::types::{CompletionRequest, CompletionResponse, StreamChunk, ToolCall, Usage};

enum Step {
    Reply(CompletionResponse),
    Fail(String),
}

/// Provider that plays back a queue of replies and failures, recording every
/// request it receives. An exhausted script fails the call.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, content: impl Into<String>) -> Self {
        self.reply_with(CompletionResponse::text(content))
    }

    pub fn reply_with(self, response: CompletionResponse) -> Self {
        self.script.lock().unwrap().push_back(Step::Reply(response));
        self
    }

    /// Reply with structured tool calls.
    pub fn reply_tool_calls(self, content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        self.reply_with(CompletionResponse {
            content: content.into(),
            tool_calls: calls,
            usage: None,
        })
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.script.lock().unwrap().push_back(Step::Fail(message.into()));
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }

    fn next(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.requests.lock().unwrap().push(request);
        match self.script.lock().unwrap().pop_front() {
            Some(Step::Reply(r)) => Ok(r),
            Some(Step::Fail(msg)) => Err(RelayError::Provider(msg)),
            None => Err(RelayError::Provider(format!("{}: script exhausted", self.name))),
        }
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        let result = self.next(request);
        Box::pin(async move { result })
    }

    /// Streams the scripted reply word by word, then a `done` chunk carrying usage.
    fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamChunk>>>> {
        let result = self.next(request);
        Box::pin(async move {
            let response = result?;
            let mut chunks: Vec<Result<StreamChunk>> = response
                .content
                .split_inclusive(' ')
                .map(|word| {
                    Ok(StreamChunk {
                        content: word.to_string(),
                        done: false,
                        usage: None,
                    })
                })
                .collect();
            chunks.push(Ok(StreamChunk {
                content: String::new(),
                done: true,
                usage: response.usage,
            }));
            Ok(Box::pin(stream::iter(chunks)) as BoxStream<'static, Result<StreamChunk>>)
        })
    }
}

/// Provider whose every call fails with the same message.
pub struct FailingProvider {
    message: String,
    calls: Mutex<usize>,
}

impl FailingProvider {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl LlmProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    fn complete(&self, _request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        *self.calls.lock().unwrap() += 1;
        let message = self.message.clone();
        Box::pin(async move { Err(RelayError::Provider(message)) })
    }

    fn complete_stream(
        &self,
        _request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamChunk>>>> {
        *self.calls.lock().unwrap() += 1;
        let message = self.message.clone();
        Box::pin(async move { Err(RelayError::ProviderStream(message)) })
    }
}

/// Provider that waits before answering with a fixed text.
pub struct SlowProvider {
    delay: Duration,
    content: String,
    usage: Option<Usage>,
}

impl SlowProvider {
    pub fn new(delay: Duration, content: impl Into<String>) -> Self {
        Self {
            delay,
            content: content.into(),
            usage: None,
        }
    }
}

impl LlmProvider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    fn complete(&self, _request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(CompletionResponse {
                content: self.content.clone(),
                tool_calls: Vec::new(),
                usage: self.usage,
            })
        })
    }

    fn complete_stream(
        &self,
        _request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamChunk>>>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            let chunk = StreamChunk {
                content: self.content.clone(),
                done: true,
                usage: self.usage,
            };
            Ok(Box::pin(stream::iter(vec![Ok(chunk)])) as BoxStream<'static, Result<StreamChunk>>)
        })
    }
}

/// Tool named `Echo` that returns its `text` argument.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "Echo"
    }

    fn description(&self) -> &str {
        "Repeat the given text"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    fn execute(&self, args: serde_json::Map<String, serde_json::Value>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            match args.get("text").and_then(|v| v.as_str()) {
                Some(text) => Ok(format!("echo: {text}")),
                None => Err(RelayError::ToolExecution {
                    tool: "Echo".into(),
                    message: "missing text".into(),
                }),
            }
        })
    }
}

/// Build a tool call as a provider would return it.
pub fn tool_call(name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: format!("{name}_0"),
        name: name.to_string(),
        arguments: args.as_object().cloned().unwrap_or_default(),
    }
}

/// Agent bound to a provider registered under `provider` in the test registry.
pub fn agent(id: &str, provider: &str) -> AgentConfig {
    let mut a = AgentConfig::new(id, ModelConfig::new(provider, "test-model"));
    a.name = id.to_uppercase();
    a.role = format!("{id} role");
    a
}

pub fn route(signal: &str, target: &str) -> RoutingSignal {
    RoutingSignal {
        signal: signal.to_string(),
        target: target.to_string(),
        description: String::new(),
    }
}

/// Workflow over `agents` with default settings; the first agent is the entry.
pub fn workflow_config(agents: Vec<AgentConfig>) -> WorkflowConfig {
    WorkflowConfig {
        workflow: WorkflowSettings::default(),
        agents,
        routing: RoutingConfig::default(),
        signals: Vec::new(),
        quota_defaults: QuotaConfig::default(),
        gateway: GatewayConfig::default(),
    }
}

/// A small valid configuration file: a writer routing to a terminal reviewer.
pub const SAMPLE_CONFIG: &str = r#"
[workflow]
name = "review"
entry_point = "writer"
max_handoffs = 3

[[agents]]
id = "writer"
name = "Writer"
role = "Drafts answers"
handoff_targets = ["reviewer"]

[agents.primary]
provider = "ollama"
model_id = "llama3"

[[agents]]
id = "reviewer"
name = "Reviewer"
role = "Checks drafts"
is_terminal = true

[agents.primary]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "${RELAY_TEST_KEY}"

[routing.signals]
writer = [
  { signal = "[NEXT]", target = "reviewer" },
  { signal = "[END]", target = "" },
]
"#;

/// Write `content` to a temporary `.toml` file.
pub fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}
