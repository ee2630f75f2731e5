use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::config::{SignalBehavior, WorkflowConfig, WorkflowSettings};
use relay_core::error::{RelayError, Result};
use relay_core::types::{
    EventKind, ExecuteRequest, Message, StopReason, StreamEvent, ToolCall, WorkflowResponse,
};
use relay_llm::ProviderRegistry;
use relay_tools::ToolRegistry;

use crate::adapter::{Executor, ToolLimits};
use crate::agent::Agent;
use crate::history::History;
use crate::metrics::MetricsCollector;
use crate::observer::{CollectingObserver, StreamObserver, TurnEvent, TurnObserver};
use crate::parallel::run_group;
use crate::signal::{SignalMatch, SignalRegistry, SignalValidator};

/// The shared, immutable part of a workflow: roster, routing, signal
/// registry, providers, tools and metrics. Many conversations run against
/// one crew.
pub struct Crew {
    config: WorkflowConfig,
    agents: Vec<Agent>,
    validator: SignalValidator,
    executor: Executor,
    metrics: Arc<MetricsCollector>,
    warnings: Vec<String>,
}

impl Crew {
    /// Validate `config` and assemble the runtime. Routing errors found by the
    /// signal validator are fatal; its warnings are logged and kept.
    pub fn new(config: WorkflowConfig, providers: ProviderRegistry, tools: ToolRegistry) -> Result<Self> {
        config.validate()?;

        let registry = SignalRegistry::for_workflow(&config)?;
        let validator = SignalValidator::new(Arc::new(registry), &config);
        let warnings = validator.validate_configuration(&config.routing).into_result()?;
        for w in &warnings {
            warn!(warning = %w, "Routing configuration");
        }

        for agent in &config.agents {
            for tool in &agent.tools {
                if !tools.contains(tool) {
                    warn!(agent_id = %agent.id, tool = %tool, "Agent lists a tool that is not registered");
                }
            }
        }

        let agents = config
            .agents
            .iter()
            .map(|a| {
                Agent::new(
                    a.clone(),
                    config.routing.agent_behaviors.get(&a.id),
                    config.quota_for(&a.id).clone(),
                )
            })
            .collect();

        let metrics = Arc::new(MetricsCollector::new());
        let executor = Executor::new(
            Arc::new(providers),
            Arc::new(tools),
            metrics.clone(),
            ToolLimits::from(&config.workflow),
        );

        info!(
            workflow = %config.workflow.name,
            agents = config.agents.len(),
            groups = config.routing.parallel_groups.len(),
            "Crew ready"
        );

        Ok(Self {
            config,
            agents,
            validator,
            executor,
            metrics,
            warnings,
        })
    }

    /// Crew with network providers resolved on demand and no tools.
    pub fn from_config(config: WorkflowConfig) -> Result<Self> {
        let ttl = Duration::from_secs(config.workflow.provider_cache_ttl_secs);
        Self::new(config, ProviderRegistry::new(ttl), ToolRegistry::new())
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.config.workflow
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id() == id)
    }

    pub fn validator(&self) -> &SignalValidator {
        &self.validator
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Configuration warnings collected at construction.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn entry_agent(&self) -> Result<&Agent> {
        let id = self
            .config
            .entry_agent_id()
            .ok_or_else(|| RelayError::Config("workflow has no agents".into()))?;
        self.agent(id).ok_or_else(|| RelayError::AgentNotFound(id.to_string()))
    }

    /// First handoff target other than `from`, else any other agent in roster order.
    fn default_target(&self, from: &Agent) -> Option<&Agent> {
        from.config()
            .handoff_targets
            .iter()
            .filter(|id| id.as_str() != from.id())
            .find_map(|id| self.agent(id))
            .or_else(|| self.agents.iter().find(|a| a.id() != from.id()))
    }
}

fn stop(agent: &Agent, content: String, reason: StopReason, tool_calls: Vec<ToolCall>) -> WorkflowResponse {
    WorkflowResponse {
        agent_id: agent.id().to_string(),
        agent_name: agent.name().to_string(),
        content,
        tool_calls,
        is_terminal: !matches!(reason, StopReason::Paused | StopReason::Cancelled),
        paused_agent_id: (reason == StopReason::Paused).then(|| agent.id().to_string()),
        stop_reason: reason,
        signal: None,
    }
}

fn error_agent(e: &RelayError) -> String {
    match e {
        RelayError::AgentFailed { agent, .. } | RelayError::QuotaExceeded { agent, .. } => agent.clone(),
        RelayError::ParallelGroup { group, .. } => group.clone(),
        _ => String::new(),
    }
}

/// One conversation: a crew plus its own history.
pub struct Workflow {
    crew: Arc<Crew>,
    history: History,
}

impl Workflow {
    pub fn new(crew: Arc<Crew>) -> Self {
        Self {
            crew,
            history: History::new(),
        }
    }

    /// Conversation seeded with earlier messages.
    pub fn with_history(crew: Arc<Crew>, messages: Vec<Message>) -> Self {
        Self {
            crew,
            history: History::from_messages(messages),
        }
    }

    pub fn crew(&self) -> &Arc<Crew> {
        &self.crew
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Forget the conversation and restart session cost accounting.
    pub fn clear_history(&self) {
        self.history.clear();
        self.crew.metrics.reset_session_cost();
    }

    /// Run to a stable stopping state and return it.
    pub async fn execute(&self, request: ExecuteRequest, cancel: &CancellationToken) -> Result<WorkflowResponse> {
        let mut observer = CollectingObserver::new();
        self.run(request, &mut observer, cancel).await
    }

    /// Run and deliver every step as a [`StreamEvent`] on `sink`, with a `ping`
    /// whenever the stream has been idle for `keep_alive_secs`. The stream
    /// starts with `start` and ends with `done` or `error`.
    pub async fn execute_stream(
        &self,
        request: ExecuteRequest,
        sink: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let settings = self.crew.settings();
        let (tx, mut rx) = mpsc::channel(settings.stream_buffer_size);
        let send_timeout = Duration::from_millis(settings.stream_send_timeout_ms);
        let keep_alive = Duration::from_secs(settings.keep_alive_secs.max(1));

        let driver = async move {
            let mut observer = StreamObserver::new(tx, send_timeout);
            self.run(request, &mut observer, cancel).await
        };

        let forward = async move {
            loop {
                match tokio::time::timeout(keep_alive, rx.recv()).await {
                    Ok(Some(event)) => {
                        if sink.send(event).await.is_err() {
                            debug!("Stream consumer went away");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        if sink.send(StreamEvent::new(EventKind::Ping, "")).await.is_err() {
                            break;
                        }
                    }
                }
            }
        };

        let (result, ()) = tokio::join!(driver, forward);
        result.map(|_| ())
    }

    /// The state machine with lifecycle notifications around it.
    pub async fn run(
        &self,
        request: ExecuteRequest,
        observer: &mut dyn TurnObserver,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResponse> {
        let start_agent = request
            .resume_agent_id
            .clone()
            .or_else(|| self.crew.config.entry_agent_id().map(str::to_string))
            .unwrap_or_default();
        observer
            .notify(TurnEvent::Started {
                agent_id: start_agent,
                input: request.input.clone(),
            })
            .await;

        match self.drive(request, observer, cancel).await {
            Ok(response) => {
                observer.finalize(&response).await;
                Ok(response)
            }
            Err(e) => {
                observer
                    .notify(TurnEvent::Error {
                        agent_id: error_agent(&e),
                        message: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        request: ExecuteRequest,
        observer: &mut dyn TurnObserver,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResponse> {
        let crew: &Crew = &self.crew;
        let settings = crew.settings();
        let executor = &crew.executor;

        let mut current = match request.resume_agent_id.as_deref() {
            Some(id) => {
                info!(agent_id = %id, "Resuming paused workflow");
                crew.agent(id).ok_or_else(|| RelayError::AgentNotFound(id.to_string()))?
            }
            None => crew.entry_agent()?,
        };

        if !request.input.trim().is_empty() {
            self.history.append(Message::user(request.input));
        }

        let mut handoffs = 0usize;
        let mut rounds = 0usize;
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut last_content = String::new();

        loop {
            if cancel.is_cancelled() {
                observer
                    .notify(TurnEvent::Terminated {
                        agent_id: current.id().to_string(),
                        reason: StopReason::Cancelled,
                    })
                    .await;
                return Ok(stop(current, last_content, StopReason::Cancelled, tool_calls));
            }
            if rounds >= settings.max_rounds {
                warn!(agent_id = %current.id(), rounds, "Round limit reached");
                observer
                    .notify(TurnEvent::Terminated {
                        agent_id: current.id().to_string(),
                        reason: StopReason::MaxRounds,
                    })
                    .await;
                return Ok(stop(current, last_content, StopReason::MaxRounds, tool_calls));
            }
            rounds += 1;

            self.history.trim_if_needed(
                settings.max_context_tokens,
                f64::from(settings.context_trim_percent) / 100.0,
            );

            observer
                .notify(TurnEvent::AgentStart {
                    agent_id: current.id().to_string(),
                    agent_name: current.name().to_string(),
                })
                .await;

            let messages = self.history.snapshot();
            let turn = if observer.wants_deltas() {
                executor.execute_streaming(current, &messages, cancel, &mut *observer).await
            } else {
                executor.execute(current, &messages, cancel).await
            };
            let turn = match turn {
                Ok(turn) => turn,
                Err(RelayError::Cancelled) => {
                    info!(agent_id = %current.id(), "Workflow cancelled during agent turn");
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.history.append(Message::assistant(turn.content.as_str()));
            last_content = turn.content.clone();
            observer
                .notify(TurnEvent::AgentResponse {
                    agent_id: current.id().to_string(),
                    content: turn.content.clone(),
                })
                .await;

            if let Some(reason) = turn.memory_exceeded {
                observer
                    .notify(TurnEvent::Warning {
                        agent_id: current.id().to_string(),
                        message: reason,
                    })
                    .await;
                observer
                    .notify(TurnEvent::Terminated {
                        agent_id: current.id().to_string(),
                        reason: StopReason::QuotaExceeded,
                    })
                    .await;
                return Ok(stop(current, last_content, StopReason::QuotaExceeded, tool_calls));
            }

            // Tool calls always run before any routing decision.
            if !turn.tool_calls.is_empty() {
                for call in &turn.tool_calls {
                    observer
                        .notify(TurnEvent::ToolStart {
                            agent_id: current.id().to_string(),
                            call: call.clone(),
                        })
                        .await;
                }
                let (executed, formatted) = executor.run_tools(current, &turn.tool_calls).await;
                for e in executed {
                    observer
                        .notify(TurnEvent::ToolResult {
                            agent_id: current.id().to_string(),
                            result: e.result,
                        })
                        .await;
                }
                tool_calls.extend(turn.tool_calls);
                self.history.append(Message::user(formatted));
                continue;
            }

            let matches = crew.validator.scan_content(
                current.id(),
                crew.config.routing.signals_for(current.id()),
                &turn.content,
            );
            let accepted: Vec<&SignalMatch> = matches
                .iter()
                .filter(|m| crew.validator.accept_at_runtime(current.id(), m))
                .collect();
            let is_group = |target: &str| crew.config.routing.parallel_groups.contains_key(target);

            if let Some(m) = accepted.iter().find(|m| m.behavior == SignalBehavior::Terminate) {
                observer
                    .notify(TurnEvent::TerminationSignal {
                        agent_id: current.id().to_string(),
                        signal: m.signal.clone(),
                    })
                    .await;
                let mut response = stop(current, last_content, StopReason::Signal, tool_calls);
                response.signal = Some(m.signal.clone());
                return Ok(response);
            }

            let route = accepted.iter().find_map(|m| {
                if m.behavior != SignalBehavior::Route || is_group(&m.target) {
                    return None;
                }
                crew.agent(&m.target).map(|next| (*m, next))
            });
            if let Some((m, next)) = route {
                observer
                    .notify(TurnEvent::RoutingSignal {
                        agent_id: current.id().to_string(),
                        signal: m.signal.clone(),
                        target: next.id().to_string(),
                    })
                    .await;
                handoffs += 1;
                current = next;
                continue;
            }

            let pause = accepted.iter().find(|m| m.behavior == SignalBehavior::Pause);
            if pause.is_some() || current.wait_for_signal() {
                let reason = match pause {
                    Some(m) => format!("paused by {}", m.signal),
                    None => "waiting for signal".to_string(),
                };
                observer
                    .notify(TurnEvent::Pause {
                        agent_id: current.id().to_string(),
                        reason,
                    })
                    .await;
                let mut response = stop(current, last_content, StopReason::Paused, tool_calls);
                response.signal = pause.map(|m| m.signal.clone());
                return Ok(response);
            }

            if current.is_terminal() {
                observer
                    .notify(TurnEvent::Terminated {
                        agent_id: current.id().to_string(),
                        reason: StopReason::Terminal,
                    })
                    .await;
                return Ok(stop(current, last_content, StopReason::Terminal, tool_calls));
            }

            if let Some(m) = accepted.iter().find(|m| is_group(&m.target)) {
                let name = m.target.as_str();
                if let Some(group) = crew.config.routing.parallel_groups.get(name) {
                    let members: Vec<&Agent> = group.agents.iter().filter_map(|id| crew.agent(id)).collect();
                    observer
                        .notify(TurnEvent::ParallelStart {
                            agent_id: current.id().to_string(),
                            group: name.to_string(),
                            members: group.agents.clone(),
                        })
                        .await;

                    let timeout = Duration::from_secs(group.timeout_secs.unwrap_or(settings.parallel_timeout_secs));
                    let snapshot = self.history.snapshot();
                    let result = run_group(executor, name, group, &members, &snapshot, timeout, cancel).await;
                    if cancel.is_cancelled() {
                        continue;
                    }
                    let outcome = result?;

                    if outcome.failed() > 0 {
                        observer
                            .notify(TurnEvent::Warning {
                                agent_id: current.id().to_string(),
                                message: format!(
                                    "{} of {} members of group {} did not succeed",
                                    outcome.failed(),
                                    outcome.members.len(),
                                    name
                                ),
                            })
                            .await;
                    }
                    let aggregate = outcome.aggregate();
                    self.history.append(Message::user(aggregate.as_str()));
                    for member in &outcome.members {
                        tool_calls.extend(member.tool_calls.iter().cloned());
                    }
                    observer
                        .notify(TurnEvent::ParallelResult {
                            group: name.to_string(),
                            aggregate: aggregate.clone(),
                        })
                        .await;
                    last_content = aggregate;
                    handoffs += 1;

                    if let Some(next) = group.next_agent.as_deref().and_then(|id| crew.agent(id)) {
                        current = next;
                        continue;
                    }
                }
            }

            if handoffs >= settings.max_handoffs {
                observer
                    .notify(TurnEvent::HandoffsExhausted {
                        agent_id: current.id().to_string(),
                        handoffs,
                    })
                    .await;
                return Ok(stop(current, last_content, StopReason::HandoffsExhausted, tool_calls));
            }

            match crew.default_target(current) {
                Some(next) => {
                    info!(from = %current.id(), to = %next.id(), handoffs, "Default handoff");
                    handoffs += 1;
                    current = next;
                }
                None => {
                    observer
                        .notify(TurnEvent::Terminated {
                            agent_id: current.id().to_string(),
                            reason: StopReason::NoNextAgent,
                        })
                        .await;
                    return Ok(stop(current, last_content, StopReason::NoNextAgent, tool_calls));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_test_utils::{agent, workflow_config, SlowProvider};

    #[test]
    fn default_target_prefers_handoff_list() {
        let mut a = agent("a", "p");
        a.handoff_targets = vec!["a".into(), "c".into()];
        let config = workflow_config(vec![a, agent("b", "p"), agent("c", "p")]);
        let crew = Crew::new(config, ProviderRegistry::default(), ToolRegistry::new()).unwrap();

        let from_a = crew.agent("a").unwrap();
        assert_eq!(crew.default_target(from_a).map(Agent::id), Some("c"));
        let from_b = crew.agent("b").unwrap();
        assert_eq!(crew.default_target(from_b).map(Agent::id), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_gets_keep_alive_pings() {
        let mut solo = agent("solo", "slow");
        solo.is_terminal = true;
        let providers = ProviderRegistry::default().with_provider(
            "slow",
            Arc::new(SlowProvider::new(Duration::from_secs(65), "late answer")),
        );
        let crew = Crew::new(workflow_config(vec![solo]), providers, ToolRegistry::new()).unwrap();
        let wf = Workflow::new(Arc::new(crew));

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(32);
        let cancel = CancellationToken::new();
        let gather = async {
            let mut kinds = Vec::new();
            while let Some(e) = rx.recv().await {
                kinds.push(e.kind);
            }
            kinds
        };
        let (result, kinds) = tokio::join!(wf.execute_stream(ExecuteRequest::new("hi"), tx, &cancel), gather);
        result.unwrap();
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Ping).count(), 2);
        assert_eq!(kinds.first(), Some(&EventKind::Start));
        assert_eq!(kinds.last(), Some(&EventKind::Done));
    }
}
