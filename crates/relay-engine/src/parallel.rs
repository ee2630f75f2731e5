use std::fmt::Write;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::config::ParallelGroupConfig;
use relay_core::error::{RelayError, Result};
use relay_core::types::{Message, ToolCall};

use crate::adapter::Executor;
use crate::agent::Agent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct MemberOutcome {
    pub agent_id: String,
    pub status: MemberStatus,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Per-member results of one fan-out, in configured member order.
#[derive(Debug, Clone)]
pub struct ParallelOutcome {
    pub group: String,
    pub members: Vec<MemberOutcome>,
}

impl ParallelOutcome {
    pub fn succeeded(&self) -> usize {
        self.members.iter().filter(|m| m.status == MemberStatus::Ok).count()
    }

    pub fn failed(&self) -> usize {
        self.members.len() - self.succeeded()
    }

    /// The synthetic message appended to history after the group ran.
    pub fn aggregate(&self) -> String {
        let mut out = String::from("[PARALLEL EXECUTION RESULTS]\n\n");
        for m in &self.members {
            let _ = write!(out, "[{}]", m.agent_id);
            match m.status {
                MemberStatus::Ok => {}
                MemberStatus::Error => out.push_str(" (error)"),
                MemberStatus::Timeout => out.push_str(" (timeout)"),
            }
            let _ = write!(out, "\n{}\n\n", m.content);
        }
        out.push_str("[END PARALLEL RESULTS]");
        out
    }
}

/// One member turn against the shared history, tools included.
async fn run_member(
    executor: &Executor,
    agent: &Agent,
    history: &[Message],
    cancel: &CancellationToken,
) -> MemberOutcome {
    match executor.execute(agent, history, cancel).await {
        Ok(turn) => {
            let mut content = turn.content;
            if !turn.tool_calls.is_empty() {
                let (_, formatted) = executor.run_tools(agent, &turn.tool_calls).await;
                content.push('\n');
                content.push_str(&formatted);
            }
            MemberOutcome {
                agent_id: agent.id().to_string(),
                status: MemberStatus::Ok,
                content,
                tool_calls: turn.tool_calls,
            }
        }
        Err(e) => {
            warn!(agent_id = %agent.id(), error = %e, "Parallel member failed");
            MemberOutcome {
                agent_id: agent.id().to_string(),
                status: MemberStatus::Error,
                content: e.to_string(),
                tool_calls: Vec::new(),
            }
        }
    }
}

/// Run every member of `group` concurrently and join under `timeout`.
///
/// With `wait_for_all` the join waits for every member or the deadline, and
/// unfinished members are reported as timed out. Otherwise it returns at the
/// first success and drops the rest. Fails only when no member succeeded.
pub async fn run_group(
    executor: &Executor,
    name: &str,
    group: &ParallelGroupConfig,
    members: &[&Agent],
    history: &[Message],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ParallelOutcome> {
    info!(group = %name, members = members.len(), timeout_secs = timeout.as_secs(), "Starting parallel group");
    let deadline = tokio::time::Instant::now() + timeout;

    let mut pending: FuturesUnordered<_> = members
        .iter()
        .enumerate()
        .map(|(i, agent)| async move { (i, run_member(executor, agent, history, cancel).await) })
        .collect();

    let mut slots: Vec<Option<MemberOutcome>> = vec![None; members.len()];
    let mut returned_early = false;
    loop {
        match tokio::time::timeout_at(deadline, pending.next()).await {
            Ok(Some((i, outcome))) => {
                let ok = outcome.status == MemberStatus::Ok;
                debug!(group = %name, agent_id = %outcome.agent_id, ok, "Parallel member finished");
                slots[i] = Some(outcome);
                if ok && !group.wait_for_all {
                    returned_early = true;
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                warn!(group = %name, pending = pending.len(), "Parallel group deadline reached");
                break;
            }
        }
    }
    drop(pending);

    let members: Vec<MemberOutcome> = slots
        .into_iter()
        .zip(members)
        .filter_map(|(slot, agent)| match slot {
            Some(outcome) => Some(outcome),
            None if returned_early => None,
            None => Some(MemberOutcome {
                agent_id: agent.id().to_string(),
                status: MemberStatus::Timeout,
                content: format!("timed out after {}s", timeout.as_secs()),
                tool_calls: Vec::new(),
            }),
        })
        .collect();

    let outcome = ParallelOutcome {
        group: name.to_string(),
        members,
    };

    if outcome.succeeded() == 0 {
        let first = outcome
            .members
            .first()
            .map(|m| format!("{}: {}", m.agent_id, m.content))
            .unwrap_or_else(|| "no members".to_string());
        return Err(RelayError::ParallelGroup {
            group: name.to_string(),
            message: first,
        });
    }

    info!(
        group = %name,
        succeeded = outcome.succeeded(),
        failed = outcome.failed(),
        "Parallel group finished"
    );
    Ok(outcome)
}
