use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which per-agent budget a quota error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    Cost,
    Memory,
    Errors,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::Cost => write!(f, "cost"),
            QuotaKind::Memory => write!(f, "memory"),
            QuotaKind::Errors => write!(f, "error"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    // Provider errors
    #[error("LLM request failed: {0}")]
    Provider(String),

    #[error("LLM streaming error: {0}")]
    ProviderStream(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("LLM response parse error: {0}")]
    ProviderParse(String),

    #[error("both primary and backup models failed: primary={primary}, backup={backup}")]
    FallbackExhausted { primary: String, backup: String },

    #[error("primary model failed: {0}")]
    PrimaryFailed(String),

    // Tool errors
    #[error("Tool {0} not found")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {tool}: {message}")]
    ToolValidation { tool: String, message: String },

    // Quota errors
    #[error("{kind} quota exceeded for agent {agent}: {message}")]
    QuotaExceeded {
        agent: String,
        kind: QuotaKind,
        message: String,
    },

    // Workflow errors
    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {agent} failed: {source}")]
    AgentFailed {
        agent: String,
        #[source]
        source: Box<RelayError>,
    },

    #[error("parallel execution failed for group {group}: {message}")]
    ParallelGroup { group: String, message: String },

    #[error("Workflow cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RelayError {
    /// True for quota breaches, including those wrapped in `AgentFailed`.
    pub fn is_quota(&self) -> bool {
        match self {
            RelayError::QuotaExceeded { .. } => true,
            RelayError::AgentFailed { source, .. } => source.is_quota(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_message_names_both_causes() {
        let err = RelayError::FallbackExhausted {
            primary: "timeout".into(),
            backup: "401".into(),
        };
        assert_eq!(
            err.to_string(),
            "both primary and backup models failed: primary=timeout, backup=401"
        );
    }

    #[test]
    fn wrapped_quota_is_detected() {
        let err = RelayError::AgentFailed {
            agent: "a".into(),
            source: Box::new(RelayError::QuotaExceeded {
                agent: "a".into(),
                kind: QuotaKind::Errors,
                message: "3 consecutive errors".into(),
            }),
        };
        assert!(err.is_quota());
        assert!(!RelayError::Cancelled.is_quota());
    }
}
