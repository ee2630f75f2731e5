use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_core::config::{
    AgentConfig, EnforcementMode, ParallelGroupConfig, QuotaConfig, RoutingSignal, WorkflowConfig,
};
use relay_core::error::RelayError;
use relay_core::types::{EventKind, ExecuteRequest, Message, Role, StopReason, StreamEvent};
use relay_engine::{Crew, Workflow};
use relay_llm::ProviderRegistry;
use relay_test_utils::{agent, route, tool_call, workflow_config, EchoTool, FailingProvider, ScriptedProvider};
use relay_tools::ToolRegistry;

fn workflow(config: WorkflowConfig, providers: ProviderRegistry) -> Workflow {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    Workflow::new(Arc::new(Crew::new(config, providers, tools).unwrap()))
}

fn signals(config: &mut WorkflowConfig, agent_id: &str, routes: Vec<RoutingSignal>) {
    config.routing.signals.insert(agent_id.to_string(), routes);
}

fn terminal(id: &str, provider: &str) -> AgentConfig {
    let mut a = agent(id, provider);
    a.is_terminal = true;
    a
}

async fn run(wf: &Workflow, input: &str) -> relay_core::types::WorkflowResponse {
    wf.execute(ExecuteRequest::new(input), &CancellationToken::new()).await.unwrap()
}

#[tokio::test]
async fn next_signal_routes_to_terminal_agent() {
    let mut config = workflow_config(vec![agent("a", "pa"), terminal("b", "pb")]);
    signals(&mut config, "a", vec![route("[NEXT]", "b")]);
    let providers = ProviderRegistry::default()
        .with_provider("pa", ScriptedProvider::new("pa").reply("draft ready [NEXT]").into_arc())
        .with_provider("pb", ScriptedProvider::new("pb").reply("approved").into_arc());
    let wf = workflow(config, providers);

    let response = run(&wf, "write something").await;
    assert_eq!(response.agent_id, "b");
    assert_eq!(response.content, "approved");
    assert_eq!(response.stop_reason, StopReason::Terminal);
    assert!(response.is_terminal);

    let history = wf.history().snapshot();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Assistant]);
    assert_eq!(history[1].content, "draft ready [NEXT]");
}

#[tokio::test]
async fn termination_signal_stops_immediately() {
    let mut config = workflow_config(vec![agent("a", "pa"), terminal("b", "pb")]);
    signals(&mut config, "a", vec![route("[NEXT]", "b"), route("[END]", "")]);
    let pb = ScriptedProvider::new("pb").reply("unused").into_arc();
    let providers = ProviderRegistry::default()
        .with_provider("pa", ScriptedProvider::new("pa").reply("[NEXT] or rather [END]").into_arc())
        .with_provider("pb", pb.clone());
    let wf = workflow(config, providers);

    let response = run(&wf, "go").await;
    assert_eq!(response.agent_id, "a");
    assert_eq!(response.stop_reason, StopReason::Signal);
    assert_eq!(response.signal.as_deref(), Some("[END]"));
    assert!(response.is_terminal);
    assert_eq!(pb.call_count(), 0);
}

#[tokio::test]
async fn paused_workflow_resumes_at_the_paused_agent() {
    let mut waiting = agent("a", "pa");
    waiting.wait_for_signal = true;
    let mut config = workflow_config(vec![waiting, terminal("b", "pb")]);
    signals(&mut config, "a", vec![route("[NEXT]", "b")]);
    let providers = ProviderRegistry::default()
        .with_provider(
            "pa",
            ScriptedProvider::new("pa")
                .reply("which format do you want?")
                .reply("markdown it is [NEXT]")
                .into_arc(),
        )
        .with_provider("pb", ScriptedProvider::new("pb").reply("done").into_arc());
    let wf = workflow(config, providers);

    let paused = run(&wf, "write a report").await;
    assert_eq!(paused.stop_reason, StopReason::Paused);
    assert!(!paused.is_terminal);
    assert_eq!(paused.paused_agent_id.as_deref(), Some("a"));

    let resumed = wf
        .execute(ExecuteRequest::new("markdown").resume_from("a"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.agent_id, "b");
    assert_eq!(resumed.stop_reason, StopReason::Terminal);
    assert_eq!(wf.history().len(), 5);
}

#[tokio::test]
async fn wait_signal_pauses() {
    let mut config = workflow_config(vec![agent("a", "pa"), terminal("b", "pb")]);
    signals(&mut config, "a", vec![route("[WAIT]", "")]);
    let providers = ProviderRegistry::default()
        .with_provider("pa", ScriptedProvider::new("pa").reply("hold on [WAIT]").into_arc())
        .with_provider("pb", ScriptedProvider::new("pb").into_arc());
    let response = run(&workflow(config, providers), "hi").await;
    assert_eq!(response.stop_reason, StopReason::Paused);
    assert_eq!(response.signal.as_deref(), Some("[WAIT]"));
}

#[tokio::test]
async fn seeded_history_is_sent_to_the_first_agent() {
    let provider = ScriptedProvider::new("p").reply("continuing").into_arc();
    let config = workflow_config(vec![terminal("a", "p")]);
    let crew = Crew::new(config, ProviderRegistry::default().with_provider("p", provider.clone()), ToolRegistry::new());
    let wf = Workflow::with_history(
        Arc::new(crew.unwrap()),
        vec![Message::user("earlier"), Message::assistant("earlier answer")],
    );
    run(&wf, "and now?").await;
    let sent = &provider.requests()[0].messages;
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].content, "earlier");
    assert_eq!(sent[2].content, "and now?");
}

#[tokio::test]
async fn tool_turn_feeds_results_back() {
    let mut worker = terminal("a", "p");
    worker.tools = vec!["Echo".into()];
    let provider = ScriptedProvider::new("p")
        .reply_tool_calls("", vec![tool_call("Echo", serde_json::json!({ "text": "ping" }))])
        .reply("the tool said ping")
        .into_arc();
    let wf = workflow(workflow_config(vec![worker]), ProviderRegistry::default().with_provider("p", provider.clone()));

    let response = run(&wf, "use the tool").await;
    assert_eq!(response.content, "the tool said ping");
    assert_eq!(response.tool_calls.len(), 1);

    let history = wf.history().snapshot();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    assert!(history[2].content.contains("echo: ping"));
    // Tool calls run before the terminal flag is considered.
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test]
async fn parallel_group_aggregates_then_continues() {
    let mut config = workflow_config(vec![
        agent("lead", "lead"),
        agent("x", "x"),
        agent("y", "y"),
        terminal("judge", "judge"),
    ]);
    signals(&mut config, "lead", vec![route("[NEXT]", "team")]);
    config.routing.parallel_groups = BTreeMap::from([(
        "team".to_string(),
        ParallelGroupConfig {
            agents: vec!["x".into(), "y".into()],
            wait_for_all: true,
            timeout_secs: Some(10),
            next_agent: Some("judge".into()),
            description: String::new(),
        },
    )]);
    let judge = ScriptedProvider::new("judge").reply("x wins").into_arc();
    let providers = ProviderRegistry::default()
        .with_provider("lead", ScriptedProvider::new("lead").reply("ask the team [NEXT]").into_arc())
        .with_provider("x", ScriptedProvider::new("x").reply("x says yes").into_arc())
        .with_provider("y", ScriptedProvider::new("y").reply("y says no").into_arc())
        .with_provider("judge", judge.clone());
    let wf = workflow(config, providers);

    let response = run(&wf, "decide").await;
    assert_eq!(response.agent_id, "judge");
    assert_eq!(response.content, "x wins");

    let history = wf.history().snapshot();
    let aggregate = &history[2].content;
    assert!(aggregate.starts_with("[PARALLEL EXECUTION RESULTS]"));
    assert!(aggregate.contains("[x]\nx says yes"));
    assert!(aggregate.contains("[y]\ny says no"));
    assert_eq!(judge.requests()[0].messages.last().map(|m| m.content.clone()), Some(aggregate.clone()));
}

#[tokio::test]
async fn failed_parallel_group_fails_the_workflow() {
    let mut config = workflow_config(vec![agent("lead", "lead"), agent("x", "down"), terminal("z", "z")]);
    signals(&mut config, "lead", vec![route("[NEXT]", "team")]);
    config.routing.parallel_groups = BTreeMap::from([(
        "team".to_string(),
        ParallelGroupConfig {
            agents: vec!["x".into()],
            wait_for_all: true,
            timeout_secs: None,
            next_agent: Some("z".into()),
            description: String::new(),
        },
    )]);
    let providers = ProviderRegistry::default()
        .with_provider("lead", ScriptedProvider::new("lead").reply("[NEXT]").into_arc())
        .with_provider("down", Arc::new(FailingProvider::new("unreachable")))
        .with_provider("z", ScriptedProvider::new("z").into_arc());
    let err = workflow(config, providers)
        .execute(ExecuteRequest::new("go"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::ParallelGroup { ref group, .. } if group == "team"));
}

#[tokio::test]
async fn cost_quota_blocks_before_the_call() {
    let mut config = workflow_config(vec![terminal("a", "p")]);
    config.quota_defaults = QuotaConfig {
        enforcement: EnforcementMode::Block,
        max_tokens_per_call: 1,
        ..QuotaConfig::default()
    };
    let provider = ScriptedProvider::new("p").reply("never").into_arc();
    let wf = workflow(config, ProviderRegistry::default().with_provider("p", provider.clone()));

    let err = wf.execute(ExecuteRequest::new("hello"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RelayError::QuotaExceeded { ref agent, .. } if agent == "a"));
    assert_eq!(provider.call_count(), 0);
    assert_eq!(wf.crew().metrics().snapshot().llm_calls, 0);
}

#[tokio::test]
async fn cost_quota_warns_and_continues() {
    let mut config = workflow_config(vec![terminal("a", "p")]);
    config.quota_defaults = QuotaConfig {
        enforcement: EnforcementMode::Warn,
        max_tokens_per_call: 1,
        ..QuotaConfig::default()
    };
    let provider = ScriptedProvider::new("p").reply("fine").into_arc();
    let wf = workflow(config, ProviderRegistry::default().with_provider("p", provider.clone()));
    let response = run(&wf, "hello").await;
    assert_eq!(response.content, "fine");
    assert_eq!(wf.crew().metrics().snapshot().llm_calls, 1);
}

#[tokio::test]
async fn memory_breach_stops_with_the_answer() {
    let mut greedy = agent("a", "p");
    greedy.quota = Some(QuotaConfig {
        enforcement: EnforcementMode::Block,
        max_memory_per_call_mb: 2,
        ..QuotaConfig::default()
    });
    let mut config = workflow_config(vec![greedy, terminal("b", "pb")]);
    signals(&mut config, "a", vec![route("[NEXT]", "b")]);
    let big = format!("{} [NEXT]", "x".repeat(3 * 1024 * 1024));
    let pb = ScriptedProvider::new("pb").reply("unused").into_arc();
    let providers = ProviderRegistry::default()
        .with_provider("p", ScriptedProvider::new("p").reply(big.clone()).into_arc())
        .with_provider("pb", pb.clone());

    let response = run(&workflow(config, providers), "go").await;
    assert_eq!(response.stop_reason, StopReason::QuotaExceeded);
    assert!(response.is_terminal);
    assert_eq!(response.content, big);
    assert_eq!(pb.call_count(), 0);
}

#[tokio::test]
async fn consecutive_errors_trip_the_error_quota() {
    let mut flaky = terminal("a", "down");
    flaky.quota = Some(QuotaConfig {
        enforcement: EnforcementMode::Block,
        max_consecutive_errors: 1,
        ..QuotaConfig::default()
    });
    let wf = workflow(
        workflow_config(vec![flaky]),
        ProviderRegistry::default().with_provider("down", Arc::new(FailingProvider::new("503"))),
    );
    let cancel = CancellationToken::new();

    let first = wf.execute(ExecuteRequest::new("one"), &cancel).await.unwrap_err();
    assert!(matches!(first, RelayError::AgentFailed { .. }), "{first}");

    let second = wf.execute(ExecuteRequest::new("two"), &cancel).await.unwrap_err();
    assert!(matches!(second, RelayError::QuotaExceeded { .. }), "{second}");
    assert!(second.to_string().contains("2 consecutive errors > limit 1"));
}

#[tokio::test]
async fn default_handoffs_are_bounded() {
    let mut config = workflow_config(vec![agent("a", "p"), agent("b", "p")]);
    config.workflow.max_handoffs = 2;
    let provider = ScriptedProvider::new("p")
        .reply("one")
        .reply("two")
        .reply("three")
        .reply("four")
        .into_arc();
    let response = run(&workflow(config, ProviderRegistry::default().with_provider("p", provider.clone())), "go").await;
    assert_eq!(response.stop_reason, StopReason::HandoffsExhausted);
    assert!(response.is_terminal);
    assert_eq!(response.agent_id, "a");
    assert_eq!(provider.call_count(), 3);
}

#[tokio::test]
async fn lone_agent_without_a_next_agent_stops() {
    let provider = ScriptedProvider::new("p").reply("nobody to ask").into_arc();
    let response = run(
        &workflow(workflow_config(vec![agent("a", "p")]), ProviderRegistry::default().with_provider("p", provider)),
        "go",
    )
    .await;
    assert_eq!(response.stop_reason, StopReason::NoNextAgent);
}

#[tokio::test]
async fn tool_loops_are_bounded_by_max_rounds() {
    let mut looping = terminal("a", "p");
    looping.tools = vec!["Echo".into()];
    let mut config = workflow_config(vec![looping]);
    config.workflow.max_rounds = 3;
    let mut provider = ScriptedProvider::new("p");
    for _ in 0..5 {
        provider = provider.reply("Echo(\"again\")");
    }
    let provider = provider.into_arc();
    let response = run(&workflow(config, ProviderRegistry::default().with_provider("p", provider.clone())), "go").await;
    assert_eq!(response.stop_reason, StopReason::MaxRounds);
    assert_eq!(provider.call_count(), 3);
    assert_eq!(response.tool_calls.len(), 3);
}

#[tokio::test]
async fn cancelled_before_start_makes_no_calls() {
    let provider = ScriptedProvider::new("p").reply("unused").into_arc();
    let wf = workflow(
        workflow_config(vec![terminal("a", "p")]),
        ProviderRegistry::default().with_provider("p", provider.clone()),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    let response = wf.execute(ExecuteRequest::new("go"), &cancel).await.unwrap();
    assert_eq!(response.stop_reason, StopReason::Cancelled);
    assert!(!response.is_terminal);
    assert_eq!(provider.call_count(), 0);
}

async fn collect(wf: &Workflow, input: &str, cancel: &CancellationToken) -> Vec<StreamEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    let run = wf.execute_stream(ExecuteRequest::new(input), tx, cancel);
    let gather = async {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    };
    let (_, events) = tokio::join!(run, gather);
    events
}

#[tokio::test]
async fn stream_reports_each_step_in_order() {
    let mut config = workflow_config(vec![agent("a", "pa"), terminal("b", "pb")]);
    signals(&mut config, "a", vec![route("[NEXT]", "b")]);
    let providers = ProviderRegistry::default()
        .with_provider("pa", ScriptedProvider::new("pa").reply("over to b [NEXT]").into_arc())
        .with_provider("pb", ScriptedProvider::new("pb").reply("finished").into_arc());
    let wf = workflow(config, providers);

    let events = collect(&wf, "go", &CancellationToken::new()).await;
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Start,
            EventKind::AgentStart,
            EventKind::AgentResponse,
            EventKind::Route,
            EventKind::AgentStart,
            EventKind::AgentResponse,
            EventKind::Terminate,
            EventKind::Done,
        ]
    );
    assert_eq!(events[3].content, "[NEXT] -> b");
    assert_eq!(events[7].content, "finished");
}

#[tokio::test]
async fn stream_ends_with_error_on_failure() {
    let wf = workflow(
        workflow_config(vec![terminal("a", "down")]),
        ProviderRegistry::default().with_provider("down", Arc::new(FailingProvider::new("gone"))),
    );
    let events = collect(&wf, "go", &CancellationToken::new()).await;
    assert_eq!(events.first().map(|e| e.kind), Some(EventKind::Start));
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert_eq!(last.agent, "a");
    assert!(last.content.contains("gone"));
}

#[tokio::test]
async fn cancelled_stream_terminates_then_finishes() {
    let wf = workflow(
        workflow_config(vec![terminal("a", "p")]),
        ProviderRegistry::default().with_provider("p", ScriptedProvider::new("p").into_arc()),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    let events = collect(&wf, "go", &cancel).await;
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Start, EventKind::Terminate, EventKind::Done]);
    assert_eq!(events[1].content, "cancelled");
}
