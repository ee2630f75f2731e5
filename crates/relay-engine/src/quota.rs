use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use relay_core::config::{EnforcementMode, QuotaConfig};
use relay_core::error::{QuotaKind, RelayError, Result};
use relay_core::types::Usage;

/// Source of the current time; swapped out in tests to drive the daily reset.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const DAY: chrono::Duration = chrono::Duration::hours(24);

#[derive(Debug, Clone, Default)]
struct QuotaState {
    day_started: Option<DateTime<Utc>>,

    call_count: u64,
    total_tokens: u64,
    total_cost_usd: f64,
    daily_tokens: u64,
    daily_cost_usd: f64,

    current_memory_mb: u64,
    peak_memory_mb: u64,
    total_memory_mb: u64,
    memory_samples: u64,
    daily_memory_mb: u64,

    successful_calls: u64,
    failed_calls: u64,
    consecutive_errors: u64,
    errors_today: u64,
    total_response_ms: u64,
    response_samples: u64,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

/// Copy-out view of one agent's counters.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuotaUsage {
    pub call_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub daily_tokens: u64,
    pub daily_cost_usd: f64,
    pub current_memory_mb: u64,
    pub peak_memory_mb: u64,
    pub average_memory_mb: f64,
    pub daily_memory_mb: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub consecutive_errors: u64,
    pub errors_today: u64,
    pub average_response_ms: f64,
    /// Percentage of calls that succeeded, 100 when nothing ran yet.
    pub success_rate: f64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub day_started: Option<DateTime<Utc>>,
}

/// Per-agent budget enforcement and accounting.
///
/// `check_*` methods only read; `update_*` methods only write, and callers
/// run them strictly after the matching check passed.
pub struct AgentQuota {
    agent_id: String,
    config: QuotaConfig,
    state: RwLock<QuotaState>,
    clock: Clock,
}

impl AgentQuota {
    pub fn new(agent_id: impl Into<String>, config: QuotaConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            state: RwLock::new(QuotaState::default()),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, QuotaState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, QuotaState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cost in USD at the configured per-million prices.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 * self.config.input_price_per_million / 1_000_000.0
            + output_tokens as f64 * self.config.output_price_per_million / 1_000_000.0
    }

    /// Roll daily counters over once 24h have passed since the day began.
    /// The first call only records the start of the day.
    pub fn reset_daily_metrics_if_needed(&self) -> bool {
        let now = (self.clock)();
        let mut state = self.write();
        match state.day_started {
            None => {
                state.day_started = Some(now);
                false
            }
            Some(started) if now - started >= DAY => {
                state.day_started = Some(now);
                state.daily_tokens = 0;
                state.daily_cost_usd = 0.0;
                state.daily_memory_mb = 0;
                state.errors_today = 0;
                info!(agent_id = %self.agent_id, "Daily quota counters reset");
                true
            }
            Some(_) => false,
        }
    }

    fn breach(&self, kind: QuotaKind, mode: EnforcementMode, message: String) -> Result<()> {
        match mode {
            EnforcementMode::Block => Err(RelayError::QuotaExceeded {
                agent: self.agent_id.clone(),
                kind,
                message,
            }),
            EnforcementMode::Warn => {
                warn!(agent_id = %self.agent_id, quota = %kind, %message, "Quota exceeded (warn only)");
                Ok(())
            }
        }
    }

    /// Gate a call estimated at `tokens` input tokens.
    pub fn check_cost_limits(&self, tokens: u64) -> Result<()> {
        self.reset_daily_metrics_if_needed();
        let cfg = &self.config;
        let mode = cfg.cost_mode();
        let (daily_tokens, daily_cost) = {
            let s = self.read();
            (s.daily_tokens, s.daily_cost_usd)
        };

        if cfg.max_tokens_per_call > 0 && tokens > cfg.max_tokens_per_call {
            return self.breach(
                QuotaKind::Cost,
                mode,
                format!("request {} tokens > limit {}", tokens, cfg.max_tokens_per_call),
            );
        }

        if cfg.max_tokens_per_day > 0 && daily_tokens + tokens > cfg.max_tokens_per_day {
            return self.breach(
                QuotaKind::Cost,
                mode,
                format!(
                    "daily tokens {} + {} > limit {}",
                    daily_tokens, tokens, cfg.max_tokens_per_day
                ),
            );
        }

        if cfg.max_cost_per_day_usd > 0.0 {
            let estimated = self.calculate_cost(tokens, 0);
            let projected = daily_cost + estimated;
            if projected > cfg.max_cost_per_day_usd {
                return self.breach(
                    QuotaKind::Cost,
                    mode,
                    format!(
                        "daily cost ${:.6} + ${:.6} > limit ${:.2}",
                        daily_cost, estimated, cfg.max_cost_per_day_usd
                    ),
                );
            }
            if cfg.cost_alert_threshold > 0.0
                && projected >= cfg.max_cost_per_day_usd * cfg.cost_alert_threshold
            {
                warn!(
                    agent_id = %self.agent_id,
                    projected_usd = projected,
                    limit_usd = cfg.max_cost_per_day_usd,
                    "Daily cost approaching limit"
                );
            }
        }

        Ok(())
    }

    /// Gate on this call's memory estimate.
    pub fn check_memory_quota(&self, call_mb: u64) -> Result<()> {
        let cfg = &self.config;
        let daily = self.read().daily_memory_mb;
        if cfg.max_memory_per_call_mb > 0 && call_mb > cfg.max_memory_per_call_mb {
            return self.breach(
                QuotaKind::Memory,
                cfg.memory_mode(),
                format!("call used {} MB > limit {} MB", call_mb, cfg.max_memory_per_call_mb),
            );
        }
        if cfg.max_memory_per_day_mb > 0 && daily + call_mb > cfg.max_memory_per_day_mb {
            return self.breach(
                QuotaKind::Memory,
                cfg.memory_mode(),
                format!(
                    "daily memory {} MB + {} MB > limit {} MB",
                    daily, call_mb, cfg.max_memory_per_day_mb
                ),
            );
        }
        Ok(())
    }

    pub fn check_error_quota(&self) -> Result<()> {
        self.reset_daily_metrics_if_needed();
        let cfg = &self.config;
        let (consecutive, today) = {
            let s = self.read();
            (s.consecutive_errors, s.errors_today)
        };
        if cfg.max_consecutive_errors > 0 && consecutive > cfg.max_consecutive_errors {
            return self.breach(
                QuotaKind::Errors,
                cfg.error_mode(),
                format!(
                    "{} consecutive errors > limit {}",
                    consecutive, cfg.max_consecutive_errors
                ),
            );
        }
        if cfg.max_errors_per_day > 0 && today >= cfg.max_errors_per_day {
            return self.breach(
                QuotaKind::Errors,
                cfg.error_mode(),
                format!("{} errors today >= limit {}", today, cfg.max_errors_per_day),
            );
        }
        Ok(())
    }

    pub fn update_cost_metrics(&self, usage: Usage) {
        let cost = self.calculate_cost(usage.input_tokens, usage.output_tokens);
        let mut s = self.write();
        s.call_count += 1;
        s.total_tokens += usage.total();
        s.daily_tokens += usage.total();
        s.total_cost_usd += cost;
        s.daily_cost_usd += cost;
    }

    pub fn update_memory_metrics(&self, call_mb: u64) {
        let mut s = self.write();
        s.current_memory_mb = call_mb;
        s.peak_memory_mb = s.peak_memory_mb.max(call_mb);
        s.total_memory_mb += call_mb;
        s.memory_samples += 1;
        s.daily_memory_mb += call_mb;
    }

    /// Record a call outcome. Success clears the consecutive-error streak.
    pub fn update_performance_metrics(&self, elapsed: Duration, error: Option<&str>) {
        let now = (self.clock)();
        let mut s = self.write();
        s.total_response_ms += elapsed.as_millis() as u64;
        s.response_samples += 1;
        match error {
            None => {
                s.successful_calls += 1;
                s.consecutive_errors = 0;
            }
            Some(e) => {
                s.failed_calls += 1;
                s.consecutive_errors += 1;
                s.errors_today += 1;
                s.last_error = Some(e.to_string());
                s.last_error_at = Some(now);
            }
        }
    }

    /// Log a warning when a call ran past the slow-call threshold.
    pub fn check_slow_call(&self, elapsed: Duration) -> bool {
        let threshold = self.config.slow_call_threshold_ms;
        let slow = threshold > 0 && elapsed.as_millis() as u64 > threshold;
        if slow {
            warn!(
                agent_id = %self.agent_id,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold,
                "Slow LLM call"
            );
        }
        slow
    }

    pub fn usage(&self) -> QuotaUsage {
        let s = self.read();
        let total_calls = s.successful_calls + s.failed_calls;
        QuotaUsage {
            call_count: s.call_count,
            total_tokens: s.total_tokens,
            total_cost_usd: s.total_cost_usd,
            daily_tokens: s.daily_tokens,
            daily_cost_usd: s.daily_cost_usd,
            current_memory_mb: s.current_memory_mb,
            peak_memory_mb: s.peak_memory_mb,
            average_memory_mb: average(s.total_memory_mb, s.memory_samples),
            daily_memory_mb: s.daily_memory_mb,
            successful_calls: s.successful_calls,
            failed_calls: s.failed_calls,
            consecutive_errors: s.consecutive_errors,
            errors_today: s.errors_today,
            average_response_ms: average(s.total_response_ms, s.response_samples),
            success_rate: if total_calls == 0 {
                100.0
            } else {
                s.successful_calls as f64 * 100.0 / total_calls as f64
            },
            last_error: s.last_error.clone(),
            last_error_at: s.last_error_at,
            day_started: s.day_started,
        }
    }
}

fn average(total: u64, samples: u64) -> f64 {
    if samples == 0 {
        0.0
    } else {
        total as f64 / samples as f64
    }
}
