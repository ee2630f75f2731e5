use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::config::{ModelConfig, WorkflowSettings};
use relay_core::error::{RelayError, Result};
use relay_core::types::{
    CompletionRequest, CompletionResponse, Message, ToolCall, ToolDefinition, ToolResult, Usage,
};
use relay_llm::ProviderRegistry;
use relay_tools::{format_tool_results, ExecutedTool, ToolRegistry};

use crate::agent::Agent;
use crate::history::{estimate_message_tokens, estimate_tokens};
use crate::metrics::MetricsCollector;
use crate::observer::{TurnEvent, TurnObserver};
use crate::parser::parse_tool_calls;

const MIB: usize = 1024 * 1024;

/// Output of one agent turn.
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub elapsed: Duration,
    pub memory_mb: u64,
    /// The call completed but breached the memory quota.
    pub memory_exceeded: Option<String>,
}

/// Size limits and timeout applied when running tools for an agent.
#[derive(Debug, Clone, Copy)]
pub struct ToolLimits {
    pub timeout: Duration,
    pub max_output_chars: usize,
    pub max_total_output_chars: usize,
}

impl From<&WorkflowSettings> for ToolLimits {
    fn from(s: &WorkflowSettings) -> Self {
        Self {
            timeout: Duration::from_secs(s.tool_timeout_secs),
            max_output_chars: s.max_tool_output_chars,
            max_total_output_chars: s.max_total_tool_output_chars,
        }
    }
}

/// Everything a provider call needs, built once per turn and shared by the
/// primary and backup attempts.
struct Prepared {
    system_prompt: String,
    tools: Vec<ToolDefinition>,
    messages: Vec<Message>,
    estimated_tokens: u64,
}

/// Runs single agent turns against providers: quota gate, primary/backup
/// fallback, accounting.
pub struct Executor {
    providers: Arc<ProviderRegistry>,
    tools: Arc<ToolRegistry>,
    metrics: Arc<MetricsCollector>,
    limits: ToolLimits,
}

impl Executor {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        metrics: Arc<MetricsCollector>,
        limits: ToolLimits,
    ) -> Self {
        Self {
            providers,
            tools,
            metrics,
            limits,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Build the request inputs and run the pre-call quota gate.
    fn prepare(&self, agent: &Agent, messages: &[Message]) -> Result<Prepared> {
        let tools = self.tools.definitions_for(&agent.config().tools);
        let system_prompt = agent.system_prompt(&tools, &self.metrics);
        let estimated_tokens =
            (estimate_message_tokens(&Message::system(system_prompt.as_str())) + estimate_tokens(messages)) as u64;

        agent.quota().check_cost_limits(estimated_tokens)?;
        agent.quota().check_error_quota()?;

        Ok(Prepared {
            system_prompt,
            tools,
            messages: messages.to_vec(),
            estimated_tokens,
        })
    }

    fn request(agent: &Agent, model: &ModelConfig, prepared: &Prepared) -> CompletionRequest {
        CompletionRequest {
            model: model.model_id.clone(),
            system_prompt: prepared.system_prompt.clone(),
            messages: prepared.messages.clone(),
            temperature: agent.config().temperature,
            tools: prepared.tools.clone(),
            max_tokens: model.max_tokens,
        }
    }

    async fn call(
        &self,
        agent: &Agent,
        model: &ModelConfig,
        prepared: &Prepared,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        let provider = self.providers.get(model)?;
        let request = Self::request(agent, model, prepared);
        tokio::select! {
            result = provider.complete(request) => result,
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
        }
    }

    async fn call_streaming(
        &self,
        agent: &Agent,
        model: &ModelConfig,
        prepared: &Prepared,
        cancel: &CancellationToken,
        observer: &mut dyn TurnObserver,
    ) -> Result<CompletionResponse> {
        let provider = self.providers.get(model)?;
        let request = Self::request(agent, model, prepared);
        let mut stream = tokio::select! {
            result = provider.complete_stream(request) => result?,
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
        };

        let mut response = CompletionResponse::default();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            if let Some(usage) = chunk.usage {
                response.usage = Some(usage);
            }
            if !chunk.content.is_empty() {
                response.content.push_str(&chunk.content);
                observer
                    .notify(TurnEvent::Delta {
                        agent_id: agent.id().to_string(),
                        content: chunk.content,
                    })
                    .await;
            }
            if chunk.done {
                break;
            }
        }
        Ok(response)
    }

    /// Run one turn: gate, call the primary model and fall back to the backup.
    pub async fn execute(&self, agent: &Agent, messages: &[Message], cancel: &CancellationToken) -> Result<AgentTurn> {
        let prepared = self.prepare(agent, messages)?;
        let start = Instant::now();

        let result = match self.call(agent, &agent.config().primary, &prepared, cancel).await {
            Ok(response) => Ok(response),
            Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
            Err(primary) => match &agent.config().backup {
                None => Err(RelayError::PrimaryFailed(primary.to_string())),
                Some(backup) => {
                    warn!(agent_id = %agent.id(), error = %primary, backup = %backup.model_id, "Primary model failed, trying backup");
                    match self.call(agent, backup, &prepared, cancel).await {
                        Ok(response) => Ok(response),
                        Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
                        Err(e) => Err(RelayError::FallbackExhausted {
                            primary: primary.to_string(),
                            backup: e.to_string(),
                        }),
                    }
                }
            },
        };

        self.finish(agent, &prepared, result, start.elapsed())
    }

    /// Same as [`execute`](Self::execute), streaming content deltas to `observer`
    /// as they arrive. The gate runs before the first chunk and accounting
    /// after the stream ends.
    pub async fn execute_streaming(
        &self,
        agent: &Agent,
        messages: &[Message],
        cancel: &CancellationToken,
        observer: &mut dyn TurnObserver,
    ) -> Result<AgentTurn> {
        let prepared = self.prepare(agent, messages)?;
        let start = Instant::now();

        let primary = self
            .call_streaming(agent, &agent.config().primary, &prepared, cancel, observer)
            .await;
        let result = match primary {
            Ok(response) => Ok(response),
            Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
            Err(primary) => match &agent.config().backup {
                None => Err(RelayError::PrimaryFailed(primary.to_string())),
                Some(backup) => {
                    warn!(agent_id = %agent.id(), error = %primary, backup = %backup.model_id, "Primary stream failed, trying backup");
                    match self.call_streaming(agent, backup, &prepared, cancel, observer).await {
                        Ok(response) => Ok(response),
                        Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
                        Err(e) => Err(RelayError::FallbackExhausted {
                            primary: primary.to_string(),
                            backup: e.to_string(),
                        }),
                    }
                }
            },
        };

        self.finish(agent, &prepared, result, start.elapsed())
    }

    /// Post-call accounting. Failures count against the error quota; a
    /// success records cost, performance and memory.
    fn finish(
        &self,
        agent: &Agent,
        prepared: &Prepared,
        result: Result<CompletionResponse>,
        elapsed: Duration,
    ) -> Result<AgentTurn> {
        let quota = agent.quota();
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!(agent_id = %agent.id(), error = %e, "Agent call failed");
                quota.update_performance_metrics(elapsed, Some(&e.to_string()));
                self.metrics.record_agent_execution(agent.id(), agent.name(), elapsed, false);
                quota.check_error_quota()?;
                return Err(RelayError::AgentFailed {
                    agent: agent.id().to_string(),
                    source: Box::new(e),
                });
            }
        };

        let mut tool_calls = response.tool_calls;
        if tool_calls.is_empty() && agent.has_tools() {
            tool_calls = parse_tool_calls(&response.content, &prepared.tools);
        }

        let usage = response.usage.unwrap_or(Usage {
            input_tokens: prepared.estimated_tokens,
            output_tokens: estimate_message_tokens(&Message::assistant(response.content.as_str())) as u64,
        });
        quota.update_cost_metrics(usage);
        self.metrics
            .record_llm_call(usage.total(), quota.calculate_cost(usage.input_tokens, usage.output_tokens));
        quota.update_performance_metrics(elapsed, None);
        quota.check_slow_call(elapsed);
        self.metrics.record_agent_execution(agent.id(), agent.name(), elapsed, true);

        let bytes = prepared.system_prompt.len()
            + prepared.messages.iter().map(|m| m.content.len()).sum::<usize>()
            + response.content.len();
        let memory_mb = bytes.div_ceil(MIB).max(1) as u64;
        let memory_exceeded = match quota.check_memory_quota(memory_mb) {
            Ok(()) => {
                quota.update_memory_metrics(memory_mb);
                self.metrics.update_memory_usage(memory_mb);
                None
            }
            Err(e) => {
                warn!(agent_id = %agent.id(), error = %e, "Memory quota exceeded after call");
                Some(e.to_string())
            }
        };

        info!(
            agent_id = %agent.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            tokens = usage.total(),
            tool_calls = tool_calls.len(),
            "Agent turn complete"
        );
        self.metrics.log_cost_summary();

        Ok(AgentTurn {
            content: response.content,
            tool_calls,
            usage,
            elapsed,
            memory_mb,
            memory_exceeded,
        })
    }

    /// Run tool calls for `agent` and render the results for the conversation.
    pub async fn run_tools(&self, agent: &Agent, calls: &[ToolCall]) -> (Vec<ExecutedTool>, String) {
        let executed = self
            .tools
            .execute_calls(calls, &agent.config().tools, self.limits.timeout)
            .await;
        for e in &executed {
            self.metrics
                .record_tool_execution(agent.id(), agent.name(), &e.call.name, e.elapsed, !e.result.is_error());
        }
        let results: Vec<ToolResult> = executed.iter().map(|e| e.result.clone()).collect();
        let formatted = format_tool_results(
            &results,
            self.limits.max_output_chars,
            self.limits.max_total_output_chars,
        );
        debug!(agent_id = %agent.id(), tools = executed.len(), "Tool calls executed");
        (executed, formatted)
    }
}
