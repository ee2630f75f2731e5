use std::sync::{Mutex, MutexGuard, PoisonError};

use relay_core::config::{AgentBehavior, AgentConfig, QuotaConfig};
use relay_core::types::ToolDefinition;

use crate::metrics::MetricsCollector;
use crate::prompt::build_system_prompt;
use crate::quota::AgentQuota;

/// Runtime view of a configured agent: merged behavior flags, its quota
/// record, and the cached system prompt.
pub struct Agent {
    config: AgentConfig,
    behavior: Option<AgentBehavior>,
    quota: AgentQuota,
    prompt: Mutex<Option<String>>,
}

impl Agent {
    /// Routing behaviors are OR-ed into the agent's own flags.
    pub fn new(config: AgentConfig, behavior: Option<&AgentBehavior>, quota: QuotaConfig) -> Self {
        let behavior = behavior.cloned();
        let config = merge_behavior(config, behavior.as_ref());
        let quota = AgentQuota::new(config.id.clone(), quota);
        Self {
            config,
            behavior,
            quota,
            prompt: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        self.config.display_name()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn is_terminal(&self) -> bool {
        self.config.is_terminal
    }

    pub fn wait_for_signal(&self) -> bool {
        self.config.wait_for_signal
    }

    pub fn has_tools(&self) -> bool {
        !self.config.tools.is_empty()
    }

    pub fn quota(&self) -> &AgentQuota {
        &self.quota
    }

    fn prompt_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.prompt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rendered system prompt, built on first use and cached afterwards.
    pub fn system_prompt(&self, tools: &[ToolDefinition], metrics: &MetricsCollector) -> String {
        let mut slot = self.prompt_slot();
        if let Some(prompt) = slot.as_ref() {
            metrics.record_cache_hit();
            return prompt.clone();
        }
        metrics.record_cache_miss();
        let prompt = build_system_prompt(&self.config, tools);
        *slot = Some(prompt.clone());
        prompt
    }

    /// Drop the cached prompt so the next turn rebuilds it.
    pub fn invalidate_prompt(&self) {
        *self.prompt_slot() = None;
    }

    /// Replace the agent definition. The quota record and its counters stay.
    /// Routing behaviors are merged again.
    pub fn reconfigure(&mut self, config: AgentConfig) {
        self.config = merge_behavior(config, self.behavior.as_ref());
        self.invalidate_prompt();
    }
}

fn merge_behavior(mut config: AgentConfig, behavior: Option<&AgentBehavior>) -> AgentConfig {
    if let Some(b) = behavior {
        config.is_terminal |= b.is_terminal;
        config.wait_for_signal |= b.wait_for_signal;
    }
    config
}
