use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use relay_core::config::{RoutingConfig, RoutingSignal, SignalBehavior, WorkflowConfig};
use relay_core::error::{RelayError, Result};

use super::matcher::{is_well_formed, match_signal, MatchMethod};
use super::registry::SignalRegistry;

/// Outcome of checking a routing configuration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse into a config error listing every problem.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(RelayError::Config(format!(
                "invalid routing configuration: {}",
                self.errors.join("; ")
            )))
        }
    }
}

/// A configured signal found in an agent's output.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMatch {
    pub signal: String,
    pub target: String,
    pub behavior: SignalBehavior,
    pub method: MatchMethod,
    pub registered: bool,
}

/// Checks configuration and runtime emissions against the registry and roster.
pub struct SignalValidator {
    registry: Arc<SignalRegistry>,
    agents: HashSet<String>,
    groups: HashSet<String>,
}

impl SignalValidator {
    pub fn new(registry: Arc<SignalRegistry>, config: &WorkflowConfig) -> Self {
        Self {
            registry,
            agents: config.agents.iter().map(|a| a.id.clone()).collect(),
            groups: config.routing.parallel_groups.keys().cloned().collect(),
        }
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    fn is_known_target(&self, target: &str) -> bool {
        self.agents.contains(target) || self.groups.contains(target)
    }

    /// Can `agent_id` emit `signal` at all? Returns warnings (deprecation) on success.
    pub fn validate_emission(&self, signal: &str, agent_id: &str) -> Result<Vec<String>> {
        if !is_well_formed(signal) {
            return Err(RelayError::Signal(format!(
                "signal '{signal}' must be a bracketed token like [NEXT]"
            )));
        }
        let def = self
            .registry
            .get(signal)
            .ok_or_else(|| RelayError::Signal(format!("signal '{signal}' not found in registry")))?;
        if !def.allows_agent(agent_id) {
            return Err(RelayError::Signal(format!(
                "agent '{agent_id}' is not allowed to emit signal '{signal}'"
            )));
        }
        Ok(def
            .deprecated
            .iter()
            .map(|note| format!("DEPRECATED: {signal}: {note}"))
            .collect())
    }

    /// Registry rules plus roster resolution for the target.
    pub fn validate_target(&self, signal: &str, agent_id: &str, target: &str) -> Result<()> {
        self.registry.validate(signal, agent_id, target)?;
        if !target.is_empty() && !self.is_known_target(target) {
            return Err(RelayError::Signal(format!(
                "signal '{signal}' from '{agent_id}' targets unknown agent or group '{target}'"
            )));
        }
        Ok(())
    }

    /// Check the whole routing table before anything runs.
    pub fn validate_configuration(&self, routing: &RoutingConfig) -> ValidationReport {
        let mut report = ValidationReport::default();

        for (agent_id, signals) in &routing.signals {
            if !self.agents.contains(agent_id) {
                report
                    .errors
                    .push(format!("signals declared for unknown agent '{agent_id}'"));
                continue;
            }

            let mut seen = HashSet::new();
            for rs in signals {
                if !seen.insert(rs.signal.as_str()) {
                    report
                        .errors
                        .push(format!("agent '{agent_id}': signal {} declared twice", rs.signal));
                    continue;
                }
                self.check_routing_signal(agent_id, rs, &mut report);
            }
        }

        report
    }

    fn check_routing_signal(&self, agent_id: &str, rs: &RoutingSignal, report: &mut ValidationReport) {
        if !is_well_formed(&rs.signal) {
            report.errors.push(format!(
                "agent '{agent_id}': malformed signal name '{}'",
                rs.signal
            ));
            return;
        }
        if !rs.target.is_empty() && !self.is_known_target(&rs.target) {
            report.errors.push(format!(
                "agent '{agent_id}': signal {} targets unknown agent or group '{}'",
                rs.signal, rs.target
            ));
            return;
        }

        let Some(def) = self.registry.get(&rs.signal) else {
            report.warnings.push(format!(
                "agent '{agent_id}': signal {} is not registered; behavior inferred from target",
                rs.signal
            ));
            return;
        };

        // Group triggers bypass the route-target rules.
        let targets_group = self.groups.contains(&rs.target);
        let result = if targets_group && !def.behavior.requires_empty_target() {
            if def.allows_agent(agent_id) {
                Ok(())
            } else {
                Err(RelayError::Signal(format!(
                    "agent '{agent_id}' is not allowed to emit signal '{}'",
                    rs.signal
                )))
            }
        } else {
            self.validate_target(&rs.signal, agent_id, &rs.target)
        };
        if let Err(e) = result {
            report.errors.push(format!("agent '{agent_id}': {e}"));
        }

        if let Some(note) = &def.deprecated {
            report
                .warnings
                .push(format!("agent '{agent_id}': DEPRECATED: {}: {note}", rs.signal));
        }
    }

    /// Behavior a configured signal has at runtime. Unregistered signals
    /// terminate when they have no target and route otherwise.
    pub fn effective_behavior(&self, rs: &RoutingSignal) -> SignalBehavior {
        match self.registry.get(&rs.signal) {
            Some(def) => def.behavior,
            None if rs.target.is_empty() => SignalBehavior::Terminate,
            None => SignalBehavior::Route,
        }
    }

    /// Every configured signal of `agent_id` present in `content`, highest
    /// registry priority first, configuration order among equals.
    pub fn scan_content(&self, agent_id: &str, signals: &[RoutingSignal], content: &str) -> Vec<SignalMatch> {
        let mut found: Vec<SignalMatch> = signals
            .iter()
            .filter_map(|rs| {
                let method = match_signal(content, &rs.signal)?;
                Some(SignalMatch {
                    signal: rs.signal.clone(),
                    target: rs.target.clone(),
                    behavior: self.effective_behavior(rs),
                    method,
                    registered: self.registry.exists(&rs.signal),
                })
            })
            .collect();
        found.sort_by_key(|m| std::cmp::Reverse(self.registry.priority_of(&m.signal)));

        if !found.is_empty() {
            tracing::debug!(
                agent_id,
                signals = ?found.iter().map(|m| m.signal.as_str()).collect::<Vec<_>>(),
                "Signals found in response"
            );
        }
        found
    }

    /// Runtime check for a matched signal. Failures are logged and reported
    /// as `false` so the caller can fall through to later transitions.
    pub fn accept_at_runtime(&self, agent_id: &str, m: &SignalMatch) -> bool {
        if !m.registered {
            return true;
        }
        let result = if self.groups.contains(&m.target) {
            self.validate_emission(&m.signal, agent_id).map(|_| ())
        } else {
            self.validate_target(&m.signal, agent_id, &m.target)
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(agent_id, signal = %m.signal, error = %e, "Ignoring invalid signal");
                false
            }
        }
    }

    /// Registry catalogue followed by the configured routes.
    pub fn report(&self, routing: &RoutingConfig) -> String {
        let mut out = self.registry.report();
        if routing.signals.is_empty() {
            return out;
        }
        out.push_str("\nConfigured routes:\n");
        for (agent_id, signals) in &routing.signals {
            for rs in signals {
                let target = if rs.target.is_empty() { "(stop)" } else { rs.target.as_str() };
                let _ = write!(out, "  {agent_id:<12} {:<14} -> {target}", rs.signal);
                if !rs.description.is_empty() {
                    let _ = write!(out, "  # {}", rs.description);
                }
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::config::SignalDefinition;

    fn config() -> WorkflowConfig {
        WorkflowConfig::parse(
            r#"
[[agents]]
id = "a"
[agents.primary]
model_id = "m"

[[agents]]
id = "b"
[agents.primary]
model_id = "m"

[routing.parallel_groups.team]
agents = ["a", "b"]
"#,
        )
        .unwrap()
    }

    fn validator() -> SignalValidator {
        let mut registry = SignalRegistry::with_defaults();
        registry
            .register(SignalDefinition::new("[LEGACY]", SignalBehavior::Route).deprecated("use [NEXT]"))
            .unwrap();
        SignalValidator::new(Arc::new(registry), &config())
    }

    fn rs(signal: &str, target: &str) -> RoutingSignal {
        RoutingSignal {
            signal: signal.into(),
            target: target.into(),
            description: String::new(),
        }
    }

    #[test]
    fn route_target_must_be_known_and_non_empty() {
        let v = validator();
        assert!(v.validate_target("[NEXT]", "a", "b").is_ok());
        assert!(v.validate_target("[NEXT]", "a", "").is_err());
        assert!(v.validate_target("[NEXT]", "a", "ghost").is_err());
        assert!(v.validate_target("[END]", "a", "").is_ok());
        assert!(v.validate_target("[END]", "a", "b").is_err());
    }

    #[test]
    fn configuration_report() {
        let v = validator();
        let mut routing = RoutingConfig::default();
        routing.signals.insert(
            "a".into(),
            vec![
                rs("[NEXT]", "b"),
                rs("[NEXT]", "b"),
                rs("[END]", "b"),
                rs("[CUSTOM]", "b"),
                rs("[LEGACY]", "b"),
                rs("bad", ""),
                rs("[OK]", "team"),
            ],
        );
        routing.signals.insert("ghost".into(), vec![rs("[END]", "")]);

        let report = v.validate_configuration(&routing);
        assert_eq!(report.errors.len(), 4, "{:?}", report.errors);
        assert!(report.errors.iter().any(|e| e.contains("declared twice")));
        assert!(report.errors.iter().any(|e| e.contains("must not have a target")));
        assert!(report.errors.iter().any(|e| e.contains("malformed")));
        assert!(report.errors.iter().any(|e| e.contains("unknown agent 'ghost'")));
        assert_eq!(report.warnings.len(), 2);
        assert!(report.clone().into_result().is_err());
    }

    #[test]
    fn emission_checks_format_and_deprecation() {
        let v = validator();
        assert!(v.validate_emission("NEXT", "a").is_err());
        assert!(v.validate_emission("[NOPE]", "a").is_err());
        assert!(v.validate_emission("[NEXT]", "a").unwrap().is_empty());
        assert_eq!(v.validate_emission("[LEGACY]", "a").unwrap().len(), 1);
    }

    #[test]
    fn scan_orders_by_priority() {
        let v = validator();
        let signals = vec![rs("[NEXT]", "b"), rs("[CUSTOM]", ""), rs("[STOP]", "")];
        let found = v.scan_content("a", &signals, "ok [next] and [STOP] and [custom]");
        let names: Vec<_> = found.iter().map(|m| m.signal.as_str()).collect();
        assert_eq!(names, vec!["[STOP]", "[NEXT]", "[CUSTOM]"]);
        assert_eq!(found[1].method, MatchMethod::CaseInsensitive);
        assert_eq!(found[2].behavior, SignalBehavior::Terminate);
        assert!(!found[2].registered);
    }

    #[test]
    fn runtime_acceptance() {
        let v = validator();
        let found = v.scan_content("a", &[rs("[NEXT]", "ghost")], "[NEXT]");
        assert!(!v.accept_at_runtime("a", &found[0]));
        let found = v.scan_content("a", &[rs("[OK]", "team")], "[OK]");
        assert!(v.accept_at_runtime("a", &found[0]));
    }
}
