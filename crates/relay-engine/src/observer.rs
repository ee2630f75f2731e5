use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use relay_core::types::{
    EventKind, StopReason, StreamEvent, ToolCall, ToolResult, WorkflowResponse,
};

/// One step of a workflow run, as seen from outside the state machine.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Started { agent_id: String, input: String },
    AgentStart { agent_id: String, agent_name: String },
    Delta { agent_id: String, content: String },
    AgentResponse { agent_id: String, content: String },
    ToolStart { agent_id: String, call: ToolCall },
    ToolResult { agent_id: String, result: ToolResult },
    TerminationSignal { agent_id: String, signal: String },
    RoutingSignal { agent_id: String, signal: String, target: String },
    Pause { agent_id: String, reason: String },
    ParallelStart { agent_id: String, group: String, members: Vec<String> },
    ParallelResult { group: String, aggregate: String },
    Warning { agent_id: String, message: String },
    HandoffsExhausted { agent_id: String, handoffs: usize },
    Terminated { agent_id: String, reason: StopReason },
    Error { agent_id: String, message: String },
}

/// Receives every step of a run. The state machine is written once against
/// this trait; collecting and streaming are two implementations.
pub trait TurnObserver: Send {
    fn notify(&mut self, event: TurnEvent) -> BoxFuture<'_, ()>;

    /// Called once with the final state of a successful run.
    fn finalize(&mut self, response: &WorkflowResponse) -> BoxFuture<'_, ()>;

    /// Whether agent turns should stream content deltas to this observer.
    fn wants_deltas(&self) -> bool {
        false
    }
}

/// Logs every step and keeps the final response.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    tool_calls: Vec<ToolCall>,
    response: Option<WorkflowResponse>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn into_response(self) -> Option<WorkflowResponse> {
        self.response
    }
}

impl TurnObserver for CollectingObserver {
    fn notify(&mut self, event: TurnEvent) -> BoxFuture<'_, ()> {
        match event {
            TurnEvent::Started { agent_id, .. } => info!(agent_id = %agent_id, "Workflow started"),
            TurnEvent::AgentStart { agent_id, agent_name } => {
                info!(agent_id = %agent_id, name = %agent_name, "Agent turn")
            }
            TurnEvent::Delta { .. } => {}
            TurnEvent::AgentResponse { agent_id, content } => {
                debug!(agent_id = %agent_id, chars = content.chars().count(), "Agent responded")
            }
            TurnEvent::ToolStart { agent_id, call } => {
                debug!(agent_id = %agent_id, tool = %call.name, "Tool call");
                self.tool_calls.push(call);
            }
            TurnEvent::ToolResult { agent_id, result } => {
                debug!(agent_id = %agent_id, tool = %result.tool_name, status = result.status.as_str(), "Tool result")
            }
            TurnEvent::TerminationSignal { agent_id, signal } => {
                info!(agent_id = %agent_id, signal = %signal, "Termination signal")
            }
            TurnEvent::RoutingSignal { agent_id, signal, target } => {
                info!(agent_id = %agent_id, signal = %signal, target = %target, "Routing signal")
            }
            TurnEvent::Pause { agent_id, reason } => {
                info!(agent_id = %agent_id, reason = %reason, "Workflow paused")
            }
            TurnEvent::ParallelStart { group, members, .. } => {
                info!(group = %group, members = members.len(), "Parallel group started")
            }
            TurnEvent::ParallelResult { group, .. } => info!(group = %group, "Parallel group finished"),
            TurnEvent::Warning { agent_id, message } => warn!(agent_id = %agent_id, "{message}"),
            TurnEvent::HandoffsExhausted { agent_id, handoffs } => {
                warn!(agent_id = %agent_id, handoffs, "Handoff limit reached")
            }
            TurnEvent::Terminated { agent_id, reason } => {
                info!(agent_id = %agent_id, reason = reason.as_str(), "Workflow stopped")
            }
            TurnEvent::Error { agent_id, message } => error!(agent_id = %agent_id, error = %message, "Workflow failed"),
        }
        Box::pin(async {})
    }

    fn finalize(&mut self, response: &WorkflowResponse) -> BoxFuture<'_, ()> {
        let mut response = response.clone();
        if response.tool_calls.is_empty() {
            response.tool_calls = self.tool_calls.clone();
        }
        self.response = Some(response);
        Box::pin(async {})
    }
}

/// Maps every step to a [`StreamEvent`] on a bounded channel.
///
/// Intermediate events wait at most `send_timeout` for room and are dropped
/// after that. `done` and `error` are always delivered unless the receiver is gone.
pub struct StreamObserver {
    sink: mpsc::Sender<StreamEvent>,
    send_timeout: Duration,
    deltas: bool,
    dropped: usize,
}

impl StreamObserver {
    pub fn new(sink: mpsc::Sender<StreamEvent>, send_timeout: Duration) -> Self {
        Self {
            sink,
            send_timeout,
            deltas: false,
            dropped: 0,
        }
    }

    pub fn with_deltas(mut self, deltas: bool) -> Self {
        self.deltas = deltas;
        self
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    async fn send(&mut self, event: StreamEvent) {
        if event.is_final() {
            if self.sink.send(event).await.is_err() {
                debug!("Stream receiver closed before final event");
            }
            return;
        }
        match tokio::time::timeout(self.send_timeout, self.sink.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Stream receiver closed"),
            Err(_) => {
                self.dropped += 1;
                warn!(dropped = self.dropped, "Stream consumer too slow, event dropped");
            }
        }
    }
}

fn to_stream_event(event: TurnEvent) -> StreamEvent {
    match event {
        TurnEvent::Started { agent_id, input } => StreamEvent::new(EventKind::Start, agent_id).with_content(input),
        TurnEvent::AgentStart { agent_id, agent_name } => {
            StreamEvent::new(EventKind::AgentStart, agent_id).with_content(agent_name)
        }
        TurnEvent::Delta { agent_id, content } => StreamEvent::new(EventKind::Delta, agent_id).with_content(content),
        TurnEvent::AgentResponse { agent_id, content } => {
            StreamEvent::new(EventKind::AgentResponse, agent_id).with_content(content)
        }
        TurnEvent::ToolStart { agent_id, call } => StreamEvent::new(EventKind::ToolStart, agent_id).with_content(
            format!("{}({})", call.name, serde_json::Value::Object(call.arguments)),
        ),
        TurnEvent::ToolResult { agent_id, result } => StreamEvent::new(EventKind::ToolResult, agent_id)
            .with_content(format!("{} [{}]: {}", result.tool_name, result.status.as_str(), result.output)),
        TurnEvent::TerminationSignal { agent_id, signal } => {
            StreamEvent::new(EventKind::Terminate, agent_id).with_content(signal)
        }
        TurnEvent::RoutingSignal { agent_id, signal, target } => {
            StreamEvent::new(EventKind::Route, agent_id).with_content(format!("{signal} -> {target}"))
        }
        TurnEvent::Pause { agent_id, reason } => StreamEvent::new(EventKind::Pause, agent_id).with_content(reason),
        TurnEvent::ParallelStart { agent_id, group, members } => StreamEvent::new(EventKind::Parallel, agent_id)
            .with_content(format!("group {group} started: {}", members.join(", "))),
        TurnEvent::ParallelResult { group, aggregate } => {
            StreamEvent::new(EventKind::Parallel, group).with_content(aggregate)
        }
        TurnEvent::Warning { agent_id, message } => StreamEvent::new(EventKind::Warning, agent_id).with_content(message),
        TurnEvent::HandoffsExhausted { agent_id, handoffs } => StreamEvent::new(EventKind::Terminate, agent_id)
            .with_content(format!("handoff limit reached after {handoffs} handoffs")),
        TurnEvent::Terminated { agent_id, reason } => {
            StreamEvent::new(EventKind::Terminate, agent_id).with_content(reason.as_str())
        }
        TurnEvent::Error { agent_id, message } => StreamEvent::new(EventKind::Error, agent_id).with_content(message),
    }
}

impl TurnObserver for StreamObserver {
    fn notify(&mut self, event: TurnEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.send(to_stream_event(event)).await })
    }

    fn finalize(&mut self, response: &WorkflowResponse) -> BoxFuture<'_, ()> {
        let event = StreamEvent::new(EventKind::Done, response.agent_id.clone()).with_content(response.content.clone());
        Box::pin(async move { self.send(event).await })
    }

    fn wants_deltas(&self) -> bool {
        self.deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> WorkflowResponse {
        WorkflowResponse {
            agent_id: "b".into(),
            agent_name: "B".into(),
            content: "final".into(),
            tool_calls: vec![],
            is_terminal: true,
            paused_agent_id: None,
            stop_reason: StopReason::Terminal,
            signal: None,
        }
    }

    #[tokio::test]
    async fn stream_observer_maps_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut obs = StreamObserver::new(tx, Duration::from_millis(100));
        obs.notify(TurnEvent::RoutingSignal {
            agent_id: "a".into(),
            signal: "[NEXT]".into(),
            target: "b".into(),
        })
        .await;
        obs.finalize(&response()).await;
        drop(obs);

        let route = rx.recv().await.unwrap();
        assert_eq!(route.kind, EventKind::Route);
        assert_eq!(route.content, "[NEXT] -> b");
        let done = rx.recv().await.unwrap();
        assert_eq!(done.kind, EventKind::Done);
        assert_eq!(done.content, "final");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_drops_intermediate_events() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut obs = StreamObserver::new(tx, Duration::from_millis(100));
        for i in 0..3 {
            obs.notify(TurnEvent::Warning {
                agent_id: "a".into(),
                message: i.to_string(),
            })
            .await;
        }
        assert_eq!(obs.dropped(), 2);
        assert_eq!(rx.recv().await.unwrap().content, "0");
    }

    #[tokio::test]
    async fn collecting_observer_keeps_tool_calls() {
        let mut obs = CollectingObserver::new();
        obs.notify(TurnEvent::ToolStart {
            agent_id: "a".into(),
            call: ToolCall {
                id: "Calc_0".into(),
                name: "Calc".into(),
                arguments: Default::default(),
            },
        })
        .await;
        obs.finalize(&response()).await;
        assert_eq!(obs.tool_calls().len(), 1);
        let resp = obs.into_response().unwrap();
        assert_eq!(resp.tool_calls[0].name, "Calc");
    }
}
