use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Top-level workflow configuration, loaded once and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub workflow: WorkflowSettings,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Custom signal definitions registered next to the default catalogue.
    #[serde(default)]
    pub signals: Vec<SignalDefinition>,
    #[serde(default)]
    pub quota_defaults: QuotaConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default = "default_workflow_name")]
    pub name: String,
    /// Agent the conversation starts at. Defaults to the first agent.
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: usize,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_parallel_timeout")]
    pub parallel_timeout_secs: u64,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Whole percent of the context window freed by a trim.
    #[serde(default = "default_context_trim_percent")]
    pub context_trim_percent: u8,
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
    #[serde(default = "default_max_total_tool_output_chars")]
    pub max_total_tool_output_chars: usize,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_stream_send_timeout")]
    pub stream_send_timeout_ms: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    #[serde(default = "default_provider_cache_ttl")]
    pub provider_cache_ttl_secs: u64,
    #[serde(default = "default_load_default_signals")]
    pub load_default_signals: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            name: default_workflow_name(),
            entry_point: None,
            max_handoffs: default_max_handoffs(),
            max_rounds: default_max_rounds(),
            parallel_timeout_secs: default_parallel_timeout(),
            max_context_tokens: default_max_context_tokens(),
            context_trim_percent: default_context_trim_percent(),
            max_tool_output_chars: default_max_tool_output_chars(),
            max_total_tool_output_chars: default_max_total_tool_output_chars(),
            tool_timeout_secs: default_tool_timeout(),
            stream_send_timeout_ms: default_stream_send_timeout(),
            keep_alive_secs: default_keep_alive(),
            stream_buffer_size: default_stream_buffer_size(),
            provider_cache_ttl_secs: default_provider_cache_ttl(),
            load_default_signals: default_load_default_signals(),
        }
    }
}

fn default_workflow_name() -> String { "relay".to_string() }
fn default_max_handoffs() -> usize { 5 }
fn default_max_rounds() -> usize { 25 }
fn default_parallel_timeout() -> u64 { 60 }
fn default_max_context_tokens() -> usize { 8_000 }
fn default_context_trim_percent() -> u8 { 20 }
fn default_max_tool_output_chars() -> usize { 2_000 }
fn default_max_total_tool_output_chars() -> usize { 4_000 }
fn default_tool_timeout() -> u64 { 5 }
fn default_stream_send_timeout() -> u64 { 100 }
fn default_keep_alive() -> u64 { 30 }
fn default_stream_buffer_size() -> usize { 100 }
fn default_provider_cache_ttl() -> u64 { 3_600 }
fn default_load_default_signals() -> bool { true }

/// One agent in the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub backstory: String,
    /// Prompt template; `{{name}}`, `{{role}}`, `{{description}}`, `{{backstory}}` are substituted.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(default)]
    pub wait_for_signal: bool,
    #[serde(default)]
    pub handoff_targets: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub primary: ModelConfig,
    #[serde(default)]
    pub backup: Option<ModelConfig>,
    /// Replaces `[quota_defaults]` for this agent when present.
    #[serde(default)]
    pub quota: Option<QuotaConfig>,
}

impl AgentConfig {
    /// Agent with default flags bound to one model.
    pub fn new(id: impl Into<String>, primary: ModelConfig) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            role: String::new(),
            backstory: String::new(),
            system_prompt: None,
            temperature: default_temperature(),
            is_terminal: false,
            wait_for_signal: false,
            handoff_targets: Vec::new(),
            tools: Vec::new(),
            primary,
            backup: None,
            quota: None,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

fn default_temperature() -> f32 { 0.7 }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_provider() -> String { "openai".to_string() }

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: None,
        }
    }
}

/// Whether a quota breach fails the call or only logs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    #[default]
    Block,
    Warn,
}

/// Per-agent limits and pricing. Zero means unlimited for every limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default)]
    pub enforcement: EnforcementMode,
    #[serde(default)]
    pub cost_enforcement: Option<EnforcementMode>,
    #[serde(default)]
    pub memory_enforcement: Option<EnforcementMode>,
    #[serde(default)]
    pub error_enforcement: Option<EnforcementMode>,
    #[serde(default)]
    pub max_tokens_per_call: u64,
    #[serde(default)]
    pub max_tokens_per_day: u64,
    #[serde(default)]
    pub max_cost_per_day_usd: f64,
    /// Fraction of the daily cost cap at which a warning is logged.
    #[serde(default = "default_cost_alert_threshold")]
    pub cost_alert_threshold: f64,
    #[serde(default = "default_input_price")]
    pub input_price_per_million: f64,
    #[serde(default = "default_output_price")]
    pub output_price_per_million: f64,
    #[serde(default)]
    pub max_memory_per_call_mb: u64,
    #[serde(default)]
    pub max_memory_per_day_mb: u64,
    #[serde(default)]
    pub max_consecutive_errors: u64,
    #[serde(default)]
    pub max_errors_per_day: u64,
    #[serde(default)]
    pub slow_call_threshold_ms: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enforcement: EnforcementMode::default(),
            cost_enforcement: None,
            memory_enforcement: None,
            error_enforcement: None,
            max_tokens_per_call: 0,
            max_tokens_per_day: 0,
            max_cost_per_day_usd: 0.0,
            cost_alert_threshold: default_cost_alert_threshold(),
            input_price_per_million: default_input_price(),
            output_price_per_million: default_output_price(),
            max_memory_per_call_mb: 0,
            max_memory_per_day_mb: 0,
            max_consecutive_errors: 0,
            max_errors_per_day: 0,
            slow_call_threshold_ms: 0,
        }
    }
}

impl QuotaConfig {
    pub fn cost_mode(&self) -> EnforcementMode {
        self.cost_enforcement.unwrap_or(self.enforcement)
    }

    pub fn memory_mode(&self) -> EnforcementMode {
        self.memory_enforcement.unwrap_or(self.enforcement)
    }

    pub fn error_mode(&self) -> EnforcementMode {
        self.error_enforcement.unwrap_or(self.enforcement)
    }
}

fn default_cost_alert_threshold() -> f64 { 0.8 }
fn default_input_price() -> f64 { 0.15 }
fn default_output_price() -> f64 { 0.60 }

/// Routing rules: signals per agent, behavior overrides, parallel groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub signals: BTreeMap<String, Vec<RoutingSignal>>,
    #[serde(default)]
    pub agent_behaviors: BTreeMap<String, AgentBehavior>,
    #[serde(default)]
    pub parallel_groups: BTreeMap<String, ParallelGroupConfig>,
}

impl RoutingConfig {
    pub fn signals_for(&self, agent_id: &str) -> &[RoutingSignal] {
        self.signals.get(agent_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingSignal {
    pub signal: String,
    /// Agent id or parallel group name; empty for terminate/pause.
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentBehavior {
    #[serde(default)]
    pub wait_for_signal: bool,
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroupConfig {
    pub agents: Vec<String>,
    #[serde(default = "default_wait_for_all")]
    pub wait_for_all: bool,
    /// Falls back to `workflow.parallel_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub next_agent: Option<String>,
    #[serde(default)]
    pub description: String,
}

fn default_wait_for_all() -> bool { true }

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SignalBehavior {
    Route,
    Terminate,
    Pause,
    Parallel,
    Broadcast,
}

impl SignalBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalBehavior::Route => "route",
            SignalBehavior::Terminate => "terminate",
            SignalBehavior::Pause => "pause",
            SignalBehavior::Parallel => "parallel",
            SignalBehavior::Broadcast => "broadcast",
        }
    }

    /// Terminate and pause signals never carry a target.
    pub fn requires_empty_target(&self) -> bool {
        matches!(self, SignalBehavior::Terminate | SignalBehavior::Pause)
    }
}

/// A control signal known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub behavior: SignalBehavior,
    /// Off unless written out; a non-empty `allowed_agents` then restricts emission.
    #[serde(default)]
    pub allow_all_agents: bool,
    /// Agents allowed to emit; empty means every agent.
    #[serde(default)]
    pub allowed_agents: Vec<String>,
    /// Restricts route targets when non-empty.
    #[serde(default)]
    pub valid_targets: Vec<String>,
    #[serde(default = "default_signal_priority")]
    pub priority: i32,
    #[serde(default)]
    pub example: String,
    #[serde(default)]
    pub deprecated: Option<String>,
}

impl SignalDefinition {
    pub fn new(name: impl Into<String>, behavior: SignalBehavior) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            behavior,
            allow_all_agents: true,
            allowed_agents: Vec::new(),
            valid_targets: Vec::new(),
            priority: default_signal_priority(),
            example: String::new(),
            deprecated: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn restricted_to(mut self, agents: &[&str]) -> Self {
        self.allow_all_agents = false;
        self.allowed_agents = agents.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_valid_targets(mut self, targets: &[&str]) -> Self {
        self.valid_targets = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn deprecated(mut self, note: impl Into<String>) -> Self {
        self.deprecated = Some(note.into());
        self
    }

    pub fn allows_agent(&self, agent_id: &str) -> bool {
        self.allow_all_agents
            || self.allowed_agents.is_empty()
            || self.allowed_agents.iter().any(|a| a == agent_id)
    }
}

fn default_signal_priority() -> i32 { 50 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

impl WorkflowConfig {
    /// Load config from a TOML file, with env var expansion and validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| RelayError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse and validate config text.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn has_agent(&self, id: &str) -> bool {
        self.agent(id).is_some()
    }

    /// Entry point, or the first agent when none is configured.
    pub fn entry_agent_id(&self) -> Option<&str> {
        match &self.workflow.entry_point {
            Some(id) => Some(id.as_str()),
            None => self.agents.first().map(|a| a.id.as_str()),
        }
    }

    /// Effective quota for an agent.
    pub fn quota_for(&self, agent_id: &str) -> &QuotaConfig {
        self.agent(agent_id)
            .and_then(|a| a.quota.as_ref())
            .unwrap_or(&self.quota_defaults)
    }

    /// Structural checks. Signal semantics are checked by the engine's validator.
    pub fn validate(&self) -> Result<()> {
        let settings = &self.workflow;
        if self.agents.is_empty() {
            return Err(RelayError::Config("no agents configured".into()));
        }
        if settings.max_rounds == 0 {
            return Err(RelayError::Config("workflow.max_rounds must be positive".into()));
        }
        if settings.parallel_timeout_secs == 0 {
            return Err(RelayError::Config(
                "workflow.parallel_timeout_secs must be positive".into(),
            ));
        }
        if settings.tool_timeout_secs == 0 {
            return Err(RelayError::Config("workflow.tool_timeout_secs must be positive".into()));
        }
        if settings.context_trim_percent >= 100 {
            return Err(RelayError::Config(
                "workflow.context_trim_percent must be below 100".into(),
            ));
        }
        if settings.stream_buffer_size == 0 {
            return Err(RelayError::Config("workflow.stream_buffer_size must be positive".into()));
        }

        let mut ids = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(RelayError::Config("agent with empty id".into()));
            }
            if !ids.insert(agent.id.as_str()) {
                return Err(RelayError::Config(format!("duplicate agent id '{}'", agent.id)));
            }
            if agent.primary.model_id.trim().is_empty() {
                return Err(RelayError::Config(format!(
                    "agent '{}': primary.model_id is empty",
                    agent.id
                )));
            }
            if !(0.0..=2.0).contains(&agent.temperature) {
                return Err(RelayError::Config(format!(
                    "agent '{}': temperature {} out of range 0..=2",
                    agent.id, agent.temperature
                )));
            }
            if let Some(quota) = &agent.quota {
                validate_quota(quota, &format!("agent '{}' quota", agent.id))?;
            }
        }
        validate_quota(&self.quota_defaults, "quota_defaults")?;

        if let Some(entry) = &settings.entry_point {
            if !ids.contains(entry.as_str()) {
                return Err(RelayError::Config(format!("entry point '{entry}' is not an agent")));
            }
        }

        for agent in &self.agents {
            for target in &agent.handoff_targets {
                if !ids.contains(target.as_str()) {
                    return Err(RelayError::Config(format!(
                        "agent '{}': handoff target '{}' is not an agent",
                        agent.id, target
                    )));
                }
            }
        }

        for (name, group) in &self.routing.parallel_groups {
            if ids.contains(name.as_str()) {
                return Err(RelayError::Config(format!(
                    "parallel group '{name}' shadows an agent id"
                )));
            }
            if group.agents.is_empty() {
                return Err(RelayError::Config(format!("parallel group '{name}' has no agents")));
            }
            for member in &group.agents {
                if !ids.contains(member.as_str()) {
                    return Err(RelayError::Config(format!(
                        "parallel group '{name}': member '{member}' is not an agent"
                    )));
                }
            }
            if group.timeout_secs == Some(0) {
                return Err(RelayError::Config(format!(
                    "parallel group '{name}': timeout_secs must be positive"
                )));
            }
            if let Some(next) = &group.next_agent {
                if !ids.contains(next.as_str()) {
                    return Err(RelayError::Config(format!(
                        "parallel group '{name}': next agent '{next}' is not an agent"
                    )));
                }
            }
        }

        for (agent_id, signals) in &self.routing.signals {
            if !ids.contains(agent_id.as_str()) {
                return Err(RelayError::Config(format!(
                    "routing signals declared for unknown agent '{agent_id}'"
                )));
            }
            for rs in signals {
                if rs.signal.trim().is_empty() {
                    return Err(RelayError::Config(format!(
                        "agent '{agent_id}': routing signal with empty name"
                    )));
                }
                if !rs.target.is_empty()
                    && !ids.contains(rs.target.as_str())
                    && !self.routing.parallel_groups.contains_key(&rs.target)
                {
                    return Err(RelayError::Config(format!(
                        "agent '{}': signal {} targets unknown agent or group '{}'",
                        agent_id, rs.signal, rs.target
                    )));
                }
            }
        }

        for agent_id in self.routing.agent_behaviors.keys() {
            if !ids.contains(agent_id.as_str()) {
                return Err(RelayError::Config(format!(
                    "agent behavior declared for unknown agent '{agent_id}'"
                )));
            }
        }

        let mut names = HashSet::new();
        for def in &self.signals {
            if def.name.trim().is_empty() {
                return Err(RelayError::Config("custom signal with empty name".into()));
            }
            if !names.insert(def.name.as_str()) {
                return Err(RelayError::Config(format!(
                    "custom signal '{}' declared twice",
                    def.name
                )));
            }
        }

        self.check_routing_cycles()
    }

    /// Reject routing loops no agent can leave. A loop is allowed when one of
    /// its agents is terminal, waits for a signal, has a signal without a
    /// target, or routes to something outside the loop.
    fn check_routing_cycles(&self) -> Result<()> {
        let edges: BTreeMap<&str, Vec<&str>> = self
            .agents
            .iter()
            .map(|a| (a.id.as_str(), self.routing_edges(&a.id)))
            .collect();

        for agent in &self.agents {
            let start = agent.id.as_str();
            let reach = reachable(&edges, start);
            if !reach.contains(start) {
                continue;
            }
            let cycle: HashSet<&str> = reach
                .iter()
                .copied()
                .filter(|v| reachable(&edges, v).contains(start))
                .collect();
            let closed = cycle.iter().all(|id| {
                !self.has_routing_exit(id)
                    && edges
                        .get(id)
                        .map_or(true, |targets| targets.iter().all(|t| cycle.contains(t)))
            });
            if closed {
                let mut members: Vec<&str> = cycle.into_iter().collect();
                members.sort_unstable();
                return Err(RelayError::Config(format!(
                    "circular routing detected starting from agent '{start}': {} never reach a terminal agent or exit signal",
                    members.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Agents a routing signal can hand the conversation to. A group stands
    /// in for its `next_agent`.
    fn routing_edges(&self, agent_id: &str) -> Vec<&str> {
        self.routing
            .signals_for(agent_id)
            .iter()
            .filter(|rs| !rs.target.is_empty())
            .filter_map(|rs| match self.routing.parallel_groups.get(&rs.target) {
                Some(group) => group.next_agent.as_deref(),
                None => Some(rs.target.as_str()),
            })
            .collect()
    }

    fn has_routing_exit(&self, agent_id: &str) -> bool {
        let flagged = self
            .agent(agent_id)
            .is_some_and(|a| a.is_terminal || a.wait_for_signal)
            || self
                .routing
                .agent_behaviors
                .get(agent_id)
                .is_some_and(|b| b.is_terminal || b.wait_for_signal);
        flagged
            || self.routing.signals_for(agent_id).iter().any(|rs| {
                rs.target.is_empty()
                    || self
                        .routing
                        .parallel_groups
                        .get(&rs.target)
                        .is_some_and(|g| g.next_agent.is_none())
            })
    }
}

/// Agents reachable from `start` over at least one edge.
fn reachable<'a>(edges: &BTreeMap<&'a str, Vec<&'a str>>, start: &str) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&'a str> = edges.get(start).cloned().unwrap_or_default();
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            if let Some(next) = edges.get(id) {
                stack.extend(next.iter().copied());
            }
        }
    }
    seen
}

fn validate_quota(quota: &QuotaConfig, label: &str) -> Result<()> {
    if !(0.0..=1.0).contains(&quota.cost_alert_threshold) {
        return Err(RelayError::Config(format!(
            "{label}: cost_alert_threshold must be within 0..=1"
        )));
    }
    if quota.input_price_per_million < 0.0 || quota.output_price_per_million < 0.0 {
        return Err(RelayError::Config(format!("{label}: prices must not be negative")));
    }
    if quota.max_cost_per_day_usd < 0.0 {
        return Err(RelayError::Config(format!(
            "{label}: max_cost_per_day_usd must not be negative"
        )));
    }
    Ok(())
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[[agents]]
id = "writer"

[agents.primary]
model_id = "gpt-4o-mini"
"#;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_RELAY_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_RELAY_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_RELAY_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_RELAY_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_RELAY_VAR}\"");
    }

    #[test]
    fn defaults_from_minimal_toml() {
        let config = WorkflowConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.workflow.max_handoffs, 5);
        assert_eq!(config.workflow.max_rounds, 25);
        assert_eq!(config.workflow.parallel_timeout_secs, 60);
        assert_eq!(config.workflow.context_trim_percent, 20);
        assert_eq!(config.workflow.tool_timeout_secs, 5);
        assert_eq!(config.entry_agent_id(), Some("writer"));
        assert_eq!(config.agents[0].primary.provider, "openai");
        assert_eq!(config.agents[0].display_name(), "writer");
        assert_eq!(config.quota_defaults.enforcement, EnforcementMode::Block);
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
    }

    #[test]
    fn per_agent_quota_replaces_defaults() {
        let toml_str = r#"
[quota_defaults]
max_tokens_per_call = 500

[[agents]]
id = "a"
[agents.primary]
model_id = "m"
[agents.quota]
max_tokens_per_call = 1000
enforcement = "warn"
cost_enforcement = "block"

[[agents]]
id = "b"
[agents.primary]
model_id = "m"
"#;
        let config = WorkflowConfig::parse(toml_str).unwrap();
        let a = config.quota_for("a");
        assert_eq!(a.max_tokens_per_call, 1000);
        assert_eq!(a.memory_mode(), EnforcementMode::Warn);
        assert_eq!(a.cost_mode(), EnforcementMode::Block);
        assert_eq!(config.quota_for("b").max_tokens_per_call, 500);
    }

    #[test]
    fn rejects_unknown_entry_point() {
        let toml_str = format!("[workflow]\nentry_point = \"ghost\"\n{MINIMAL}");
        let err = WorkflowConfig::parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_duplicate_agent_ids() {
        let toml_str = format!("{MINIMAL}{MINIMAL}");
        let err = WorkflowConfig::parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("duplicate agent id"));
    }

    #[test]
    fn rejects_group_shadowing_agent() {
        let toml_str = format!(
            "{MINIMAL}\n[routing.parallel_groups.writer]\nagents = [\"writer\"]\n"
        );
        assert!(WorkflowConfig::parse(&toml_str).is_err());
    }

    #[test]
    fn signal_target_may_name_a_group() {
        let toml_str = format!(
            "{MINIMAL}\n[routing.parallel_groups.reviewers]\nagents = [\"writer\"]\n\n[[routing.signals.writer]]\nsignal = \"[REVIEW]\"\ntarget = \"reviewers\"\n"
        );
        let config = WorkflowConfig::parse(&toml_str).unwrap();
        assert_eq!(config.routing.signals_for("writer")[0].target, "reviewers");
        assert!(config.routing.signals_for("nobody").is_empty());
    }

    #[test]
    fn allow_list_semantics() {
        let open = SignalDefinition::new("[X]", SignalBehavior::Route);
        assert!(open.allows_agent("anyone"));
        let closed = open.restricted_to(&["a"]);
        assert!(closed.allows_agent("a"));
        assert!(!closed.allows_agent("b"));
    }
}
