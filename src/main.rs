use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_core::config::WorkflowConfig;
use relay_core::types::{EventKind, ExecuteRequest, StreamEvent};
use relay_engine::{Crew, SignalRegistry, SignalValidator, StreamObserver, Workflow};

#[derive(Parser)]
#[command(name = "relay", version, about = "Multi-agent LLM workflow engine")]
struct Cli {
    /// Path to the workflow config file
    #[arg(short, long, env = "RELAY_CONFIG", default_value = "relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow once, printing events as they happen
    Run {
        /// Resume at this agent instead of the entry point
        #[arg(long)]
        resume: Option<String>,
        /// Input for the first agent (read from stdin when omitted)
        #[arg(trailing_var_arg = true)]
        input: Vec<String>,
    },
    /// Check the configuration and print warnings and errors
    Validate,
    /// Show the signal registry and configured routes
    Signals,
    /// Start the HTTP/SSE gateway
    Serve,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay=info,warn")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "relay", &mut io::stdout());
        }
        Some(Commands::Validate) => validate(&cli.config)?,
        Some(Commands::Signals) => {
            let config = load_config(&cli.config)?;
            let validator = SignalValidator::new(Arc::new(SignalRegistry::for_workflow(&config)?), &config);
            print!("{}", validator.report(&config.routing));
        }
        Some(Commands::Serve) => {
            let config = load_config(&cli.config)?;
            let gateway_config = config.gateway.clone();
            let crew = Arc::new(Crew::from_config(config)?);
            let server = relay_gateway::GatewayServer::new(gateway_config, crew);

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Some(Commands::Run { resume, input }) => {
            let mut text = input.join(" ");
            if text.trim().is_empty() && resume.is_none() {
                io::stdin().read_to_string(&mut text)?;
            }
            let config = load_config(&cli.config)?;
            let workflow = Workflow::new(Arc::new(Crew::from_config(config)?));

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                warn!("Cancelling workflow");
                cancel_clone.cancel();
            });

            let request = ExecuteRequest {
                input: text.trim().to_string(),
                resume_agent_id: resume,
            };
            run_once(&workflow, request, &cancel).await?;
        }
        None => {
            Cli::command().print_help()?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<WorkflowConfig> {
    WorkflowConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let validator = SignalValidator::new(Arc::new(SignalRegistry::for_workflow(&config)?), &config);
    let report = validator.validate_configuration(&config.routing);

    for w in &report.warnings {
        println!("warning: {w}");
    }
    for e in &report.errors {
        println!("error: {e}");
    }
    if !report.is_ok() {
        anyhow::bail!("{} configuration error(s) in {}", report.errors.len(), path.display());
    }
    println!(
        "{}: {} agents, {} parallel groups, configuration OK",
        config.workflow.name,
        config.agents.len(),
        config.routing.parallel_groups.len()
    );
    Ok(())
}

async fn run_once(workflow: &Workflow, request: ExecuteRequest, cancel: &CancellationToken) -> anyhow::Result<()> {
    let settings = workflow.crew().settings();
    let (tx, mut rx) = mpsc::channel(settings.stream_buffer_size);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let mut observer =
        StreamObserver::new(tx, Duration::from_millis(settings.stream_send_timeout_ms)).with_deltas(true);
    let result = workflow.run(request, &mut observer, cancel).await;
    drop(observer);
    printer.await.ok();

    let response = result?;
    if let Some(agent) = &response.paused_agent_id {
        eprintln!("[paused at {agent}; continue with `relay run --resume {agent} <input>`]");
    }
    Ok(())
}

fn print_event(event: &StreamEvent) {
    match event.kind {
        EventKind::Delta => {
            print!("{}", event.content);
            io::stdout().flush().ok();
        }
        EventKind::AgentStart => eprintln!("\n[{}]", event.agent),
        EventKind::AgentResponse => println!(),
        EventKind::ToolStart => eprintln!("[tool: {}]", truncate(&event.content, 200)),
        EventKind::ToolResult => eprintln!("[result] {}", truncate(&event.content, 200)),
        EventKind::Route => eprintln!("[route] {}", event.content),
        EventKind::Parallel => eprintln!("[parallel] {}", truncate(&event.content, 400)),
        EventKind::Warning => eprintln!("[warning] {}", event.content),
        EventKind::Pause => eprintln!("[pause] {}", event.content),
        EventKind::Terminate => eprintln!("[stop] {}", event.content),
        EventKind::Error => eprintln!("[error] {}", event.content),
        EventKind::Start | EventKind::Done | EventKind::Ping => {}
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}
