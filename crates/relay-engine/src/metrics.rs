use std::collections::BTreeMap;
use std::fmt::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use relay_core::error::{RelayError, Result};

/// Duration statistics in milliseconds.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DurationStats {
    pub count: u64,
    pub total_ms: u64,
    pub average_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DurationStats {
    fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
        self.average_ms = self.total_ms / self.count;
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ToolMetrics {
    pub successes: u64,
    pub errors: u64,
    pub duration: DurationStats,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AgentMetrics {
    pub agent_name: String,
    pub successes: u64,
    pub errors: u64,
    pub duration: DurationStats,
    pub tools: BTreeMap<String, ToolMetrics>,
}

/// Process-wide aggregate. Handed out by value only.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SystemMetrics {
    pub started_at: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_execution_ms: u64,
    pub average_request_ms: u64,
    pub memory_usage_mb: u64,
    pub max_memory_usage_mb: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub session_tokens: u64,
    pub session_cost_usd: f64,
    pub llm_calls: u64,
    pub agents: BTreeMap<String, AgentMetrics>,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            last_updated: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            total_execution_ms: 0,
            average_request_ms: 0,
            memory_usage_mb: 0,
            max_memory_usage_mb: 0,
            cache_hits: 0,
            cache_misses: 0,
            cache_hit_rate: 0.0,
            total_tokens: 0,
            total_cost_usd: 0.0,
            session_tokens: 0,
            session_cost_usd: 0.0,
            llm_calls: 0,
            agents: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsFormat {
    #[default]
    Json,
    Prometheus,
}

impl FromStr for MetricsFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "prometheus" => Ok(Self::Prometheus),
            other => Err(RelayError::Config(format!(
                "unsupported export format: {other} (supported: json, prometheus)"
            ))),
        }
    }
}

/// Thread-safe aggregation of agent, tool, and LLM usage for the whole process.
pub struct MetricsCollector {
    state: RwLock<SystemMetrics>,
    enabled: AtomicBool,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SystemMetrics::default()),
            enabled: AtomicBool::new(true),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SystemMetrics> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access, or `None` while collection is disabled.
    fn write(&self) -> Option<RwLockWriteGuard<'_, SystemMetrics>> {
        if !self.is_enabled() {
            return None;
        }
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        guard.last_updated = Some(Utc::now());
        Some(guard)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn record_tool_execution(
        &self,
        agent_id: &str,
        agent_name: &str,
        tool: &str,
        elapsed: Duration,
        success: bool,
    ) {
        let Some(mut m) = self.write() else { return };
        let agent = m.agents.entry(agent_id.to_string()).or_default();
        if agent.agent_name.is_empty() {
            agent.agent_name = agent_name.to_string();
        }
        let tool = agent.tools.entry(tool.to_string()).or_default();
        tool.duration.record(elapsed);
        if success {
            tool.successes += 1;
        } else {
            tool.errors += 1;
        }
    }

    pub fn record_agent_execution(&self, agent_id: &str, agent_name: &str, elapsed: Duration, success: bool) {
        let Some(mut m) = self.write() else { return };
        m.total_requests += 1;
        if success {
            m.successful_requests += 1;
        } else {
            m.failed_requests += 1;
        }
        m.total_execution_ms += elapsed.as_millis() as u64;
        m.average_request_ms = m.total_execution_ms / m.total_requests;

        let agent = m.agents.entry(agent_id.to_string()).or_default();
        agent.agent_name = agent_name.to_string();
        agent.duration.record(elapsed);
        if success {
            agent.successes += 1;
        } else {
            agent.errors += 1;
        }
    }

    pub fn record_llm_call(&self, tokens: u64, cost_usd: f64) {
        let Some(mut m) = self.write() else { return };
        m.total_tokens += tokens;
        m.total_cost_usd += cost_usd;
        m.session_tokens += tokens;
        m.session_cost_usd += cost_usd;
        m.llm_calls += 1;
    }

    pub fn reset_session_cost(&self) {
        let Some(mut m) = self.write() else { return };
        m.session_tokens = 0;
        m.session_cost_usd = 0.0;
    }

    /// `(tokens, cost)` since the last session reset.
    pub fn session_cost(&self) -> (u64, f64) {
        let m = self.read();
        (m.session_tokens, m.session_cost_usd)
    }

    /// `(tokens, cost, calls)` since start.
    pub fn total_cost(&self) -> (u64, f64, u64) {
        let m = self.read();
        (m.total_tokens, m.total_cost_usd, m.llm_calls)
    }

    pub fn log_cost_summary(&self) {
        if !self.is_enabled() {
            return;
        }
        let m = self.read();
        info!(
            session_tokens = m.session_tokens,
            session_cost_usd = %format!("{:.6}", m.session_cost_usd),
            total_tokens = m.total_tokens,
            total_cost_usd = %format!("{:.6}", m.total_cost_usd),
            llm_calls = m.llm_calls,
            "Crew cost summary"
        );
    }

    pub fn record_cache_hit(&self) {
        let Some(mut m) = self.write() else { return };
        m.cache_hits += 1;
        m.cache_hit_rate = m.cache_hits as f64 / (m.cache_hits + m.cache_misses) as f64;
    }

    pub fn record_cache_miss(&self) {
        let Some(mut m) = self.write() else { return };
        m.cache_misses += 1;
        m.cache_hit_rate = m.cache_hits as f64 / (m.cache_hits + m.cache_misses) as f64;
    }

    pub fn update_memory_usage(&self, current_mb: u64) {
        let Some(mut m) = self.write() else { return };
        m.memory_usage_mb = current_mb;
        m.max_memory_usage_mb = m.max_memory_usage_mb.max(current_mb);
    }

    pub fn snapshot(&self) -> SystemMetrics {
        self.read().clone()
    }

    pub fn reset(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = SystemMetrics::default();
    }

    pub fn export(&self, format: MetricsFormat) -> Result<String> {
        let m = self.read();
        match format {
            MetricsFormat::Json => Ok(serde_json::to_string_pretty(&serde_json::json!({
                "system_metrics": &*m
            }))?),
            MetricsFormat::Prometheus => Ok(prometheus(&m)),
        }
    }
}

fn prometheus(m: &SystemMetrics) -> String {
    let mut out = String::new();
    let mut metric = |name: &str, kind: &str, help: &str, samples: &[(&str, String)]| {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {kind}");
        for (labels, value) in samples {
            let _ = writeln!(out, "{name}{labels} {value}");
        }
    };

    metric(
        "relay_requests_total",
        "counter",
        "Total agent executions",
        &[
            ("{status=\"success\"}", m.successful_requests.to_string()),
            ("{status=\"error\"}", m.failed_requests.to_string()),
        ],
    );
    metric(
        "relay_average_request_duration_seconds",
        "gauge",
        "Average agent execution duration",
        &[("", format!("{:.6}", m.average_request_ms as f64 / 1000.0))],
    );
    metric("relay_cache_hits_total", "counter", "Prompt cache hits", &[("", m.cache_hits.to_string())]);
    metric("relay_cache_misses_total", "counter", "Prompt cache misses", &[("", m.cache_misses.to_string())]);
    metric("relay_cache_hit_rate", "gauge", "Prompt cache hit rate", &[("", format!("{:.6}", m.cache_hit_rate))]);
    metric("relay_memory_usage_mb", "gauge", "Last call memory estimate", &[("", m.memory_usage_mb.to_string())]);
    metric("relay_max_memory_usage_mb", "gauge", "Peak call memory estimate", &[("", m.max_memory_usage_mb.to_string())]);
    metric("relay_llm_calls_total", "counter", "LLM calls made", &[("", m.llm_calls.to_string())]);
    metric("relay_llm_tokens_total", "counter", "LLM tokens used", &[("", m.total_tokens.to_string())]);
    metric("relay_llm_cost_usd_total", "counter", "LLM cost in USD", &[("", format!("{:.6}", m.total_cost_usd))]);

    for (id, agent) in &m.agents {
        let _ = writeln!(out, "# Agent {id} ({})", agent.agent_name);
        let _ = writeln!(out, "relay_agent_executions{{agent=\"{id}\"}} {}", agent.duration.count);
        let _ = writeln!(out, "relay_agent_successes{{agent=\"{id}\"}} {}", agent.successes);
        let _ = writeln!(out, "relay_agent_errors{{agent=\"{id}\"}} {}", agent.errors);
        let _ = writeln!(
            out,
            "relay_agent_average_duration_seconds{{agent=\"{id}\"}} {:.6}",
            agent.duration.average_ms as f64 / 1000.0
        );
        for (tool, t) in &agent.tools {
            let _ = writeln!(
                out,
                "relay_tool_executions{{agent=\"{id}\",tool=\"{tool}\"}} {}",
                t.duration.count
            );
            let _ = writeln!(out, "relay_tool_errors{{agent=\"{id}\",tool=\"{tool}\"}} {}", t.errors);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_and_tool_records() {
        let mc = MetricsCollector::new();
        mc.record_agent_execution("a", "Alpha", Duration::from_millis(100), true);
        mc.record_agent_execution("a", "Alpha", Duration::from_millis(300), false);
        mc.record_tool_execution("a", "Alpha", "search", Duration::from_millis(20), true);
        mc.record_tool_execution("a", "Alpha", "search", Duration::from_millis(40), false);

        let m = mc.snapshot();
        assert_eq!(m.total_requests, 2);
        assert_eq!(m.failed_requests, 1);
        assert_eq!(m.average_request_ms, 200);
        let agent = &m.agents["a"];
        assert_eq!(agent.duration.min_ms, 100);
        assert_eq!(agent.duration.max_ms, 300);
        let tool = &agent.tools["search"];
        assert_eq!(tool.duration.count, 2);
        assert_eq!(tool.errors, 1);
        assert_eq!(tool.duration.average_ms, 30);
    }

    #[test]
    fn session_and_total_cost() {
        let mc = MetricsCollector::new();
        mc.record_llm_call(100, 0.01);
        mc.record_llm_call(50, 0.005);
        mc.reset_session_cost();
        mc.record_llm_call(10, 0.001);

        assert_eq!(mc.session_cost().0, 10);
        let (tokens, cost, calls) = mc.total_cost();
        assert_eq!(tokens, 160);
        assert_eq!(calls, 3);
        assert!((cost - 0.016).abs() < 1e-9);
    }

    #[test]
    fn cache_hit_rate() {
        let mc = MetricsCollector::new();
        mc.record_cache_miss();
        mc.record_cache_hit();
        mc.record_cache_hit();
        mc.record_cache_hit();
        assert!((mc.snapshot().cache_hit_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn disabled_collector_ignores_records() {
        let mc = MetricsCollector::new();
        mc.disable();
        mc.record_llm_call(100, 1.0);
        mc.update_memory_usage(5);
        assert_eq!(mc.total_cost().2, 0);
        mc.enable();
        mc.update_memory_usage(5);
        mc.update_memory_usage(2);
        let m = mc.snapshot();
        assert_eq!(m.memory_usage_mb, 2);
        assert_eq!(m.max_memory_usage_mb, 5);
    }

    #[test]
    fn exports() {
        let mc = MetricsCollector::new();
        mc.record_agent_execution("a", "Alpha", Duration::from_millis(1500), true);
        mc.record_tool_execution("a", "Alpha", "calc", Duration::from_millis(5), true);

        let json: serde_json::Value = serde_json::from_str(&mc.export(MetricsFormat::Json).unwrap()).unwrap();
        assert_eq!(json["system_metrics"]["total_requests"], 1);
        assert_eq!(json["system_metrics"]["agents"]["a"]["agent_name"], "Alpha");

        let prom = mc.export(MetricsFormat::Prometheus).unwrap();
        assert!(prom.contains("relay_requests_total{status=\"success\"} 1"));
        assert!(prom.contains("relay_agent_average_duration_seconds{agent=\"a\"} 1.500000"));
        assert!(prom.contains("relay_tool_executions{agent=\"a\",tool=\"calc\"} 1"));

        assert!("xml".parse::<MetricsFormat>().is_err());
        assert_eq!("prometheus".parse::<MetricsFormat>().unwrap(), MetricsFormat::Prometheus);
    }

    #[test]
    fn reset_clears_everything() {
        let mc = MetricsCollector::new();
        mc.record_agent_execution("a", "Alpha", Duration::from_millis(1), true);
        mc.reset();
        let m = mc.snapshot();
        assert_eq!(m.total_requests, 0);
        assert!(m.agents.is_empty());
    }
}
