use std::collections::HashMap;
use std::fmt::Write;

use relay_core::config::{SignalBehavior, SignalDefinition, WorkflowConfig};
use relay_core::error::{RelayError, Result};

/// Catalogue of known control signals. Written at startup, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    signals: HashMap<String, SignalDefinition>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the standard signal set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for def in default_signals() {
            registry.signals.insert(def.name.clone(), def);
        }
        registry
    }

    /// Registry for a workflow: the standard set unless disabled, plus the
    /// workflow's own `[[signals]]`.
    pub fn for_workflow(config: &WorkflowConfig) -> Result<Self> {
        let mut registry = if config.workflow.load_default_signals {
            Self::with_defaults()
        } else {
            Self::new()
        };
        registry
            .register_all(config.signals.iter().cloned())
            .map_err(|e| RelayError::Config(format!("[[signals]]: {e}")))?;
        Ok(registry)
    }

    pub fn register(&mut self, def: SignalDefinition) -> Result<()> {
        if def.name.trim().is_empty() {
            return Err(RelayError::Signal("signal name cannot be empty".into()));
        }
        if self.signals.contains_key(&def.name) {
            return Err(RelayError::Signal(format!(
                "signal '{}' already registered",
                def.name
            )));
        }
        self.signals.insert(def.name.clone(), def);
        Ok(())
    }

    /// Register several definitions, stopping at the first failure.
    pub fn register_all(&mut self, defs: impl IntoIterator<Item = SignalDefinition>) -> Result<()> {
        defs.into_iter().try_for_each(|def| self.register(def))
    }

    pub fn get(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.signals.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.signals.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Priority of a signal; unregistered names rank lowest.
    pub fn priority_of(&self, name: &str) -> i32 {
        self.signals.get(name).map_or(0, |d| d.priority)
    }

    /// Definitions with the given behavior, highest priority first.
    pub fn by_behavior(&self, behavior: SignalBehavior) -> Vec<&SignalDefinition> {
        let mut defs: Vec<&SignalDefinition> = self
            .signals
            .values()
            .filter(|d| d.behavior == behavior)
            .collect();
        defs.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        defs
    }

    pub fn termination_signals(&self) -> Vec<&SignalDefinition> {
        self.by_behavior(SignalBehavior::Terminate)
    }

    pub fn routing_signals(&self) -> Vec<&SignalDefinition> {
        self.by_behavior(SignalBehavior::Route)
    }

    /// Check one emission against the registry alone: existence, allow-list,
    /// empty target for terminate/pause, and the `valid_targets` restriction.
    /// Resolving the target to a real agent is the validator's job.
    pub fn validate(&self, name: &str, agent_id: &str, target: &str) -> Result<()> {
        let def = self
            .get(name)
            .ok_or_else(|| RelayError::Signal(format!("signal '{name}' not found in registry")))?;

        if !def.allows_agent(agent_id) {
            return Err(RelayError::Signal(format!(
                "agent '{agent_id}' is not allowed to emit signal '{name}'"
            )));
        }

        if def.behavior.requires_empty_target() && !target.is_empty() {
            return Err(RelayError::Signal(format!(
                "{} signal '{name}' must not have a target (got '{target}')",
                def.behavior.as_str()
            )));
        }

        if def.behavior == SignalBehavior::Route {
            if target.is_empty() {
                return Err(RelayError::Signal(format!(
                    "routing signal '{name}' requires a target"
                )));
            }
            if !def.valid_targets.is_empty() && !def.valid_targets.iter().any(|t| t == target) {
                return Err(RelayError::Signal(format!(
                    "signal '{name}' cannot target '{target}' (valid: {})",
                    def.valid_targets.join(", ")
                )));
            }
        }

        Ok(())
    }

    /// Human-readable catalogue grouped by behavior.
    pub fn report(&self) -> String {
        let mut out = format!("Signal registry: {} signal(s)\n", self.len());
        for behavior in [
            SignalBehavior::Terminate,
            SignalBehavior::Route,
            SignalBehavior::Pause,
            SignalBehavior::Parallel,
            SignalBehavior::Broadcast,
        ] {
            let defs = self.by_behavior(behavior);
            if defs.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{} ({}):", behavior.as_str(), defs.len());
            for def in defs {
                let _ = write!(out, "  {:<14} p={:<4}", def.name, def.priority);
                if !def.description.is_empty() {
                    let _ = write!(out, " {}", def.description);
                }
                if !def.allows_agent("") {
                    let _ = write!(out, " [agents: {}]", def.allowed_agents.join(", "));
                }
                if let Some(note) = &def.deprecated {
                    let _ = write!(out, " DEPRECATED: {note}");
                }
                out.push('\n');
            }
        }
        out
    }
}

fn default_signals() -> Vec<SignalDefinition> {
    use SignalBehavior::*;
    vec![
        SignalDefinition::new("[END]", Terminate)
            .with_description("End the workflow")
            .with_priority(100),
        SignalDefinition::new("[END_EXAM]", Terminate)
            .with_description("End an exam session")
            .with_priority(100),
        SignalDefinition::new("[DONE]", Terminate)
            .with_description("Task complete")
            .with_priority(100),
        SignalDefinition::new("[STOP]", Terminate)
            .with_description("Stop immediately")
            .with_priority(110),
        SignalDefinition::new("[NEXT]", Route)
            .with_description("Hand off to the next agent")
            .with_priority(50),
        SignalDefinition::new("[QUESTION]", Route)
            .with_description("Ask another agent a question")
            .with_priority(50),
        SignalDefinition::new("[ANSWER]", Route)
            .with_description("Answer a question")
            .with_priority(50),
        SignalDefinition::new("[OK]", Route)
            .with_description("Acknowledge and continue")
            .with_priority(30),
        SignalDefinition::new("[ERROR]", Route)
            .with_description("Report an error for handling")
            .with_priority(90),
        SignalDefinition::new("[RETRY]", Route)
            .with_description("Ask for a retry")
            .with_priority(70),
        SignalDefinition::new("[WAIT]", Pause)
            .with_description("Wait for external input")
            .with_priority(80),
    ]
}
