//! The Relay workflow engine: agents take turns on a shared conversation and
//! hand control to each other through signals found in their output.

pub mod adapter;
pub mod agent;
pub mod history;
pub mod metrics;
pub mod observer;
pub mod parallel;
pub mod parser;
pub mod prompt;
pub mod quota;
pub mod signal;
pub mod workflow;

pub use adapter::{AgentTurn, Executor, ToolLimits};
pub use agent::Agent;
pub use history::History;
pub use metrics::{MetricsCollector, MetricsFormat, SystemMetrics};
pub use observer::{CollectingObserver, StreamObserver, TurnEvent, TurnObserver};
pub use parallel::{MemberStatus, ParallelOutcome};
pub use quota::{AgentQuota, QuotaUsage};
pub use signal::{SignalMatch, SignalRegistry, SignalValidator};
pub use workflow::{Crew, Workflow};
