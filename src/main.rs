//! CLI front end for the crucible engine.
//!
//! Runs a single task to completion, printing the event stream as JSON
//! lines so the output can be piped into other tooling.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use crucible::config::Config;
use crucible::engine::Engine;
use crucible::events::{TaskEvent, TaskOutcome};
use crucible::gateway::{ApprovalDecision, ApprovalRequest, ApprovalSink, AutoApprove};
use crucible::oracle::OpenRouterOracle;
use crucible::task::TaskSpec;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crucible", about = "A self-correcting coding agent engine", version)]
struct Args {
    /// What the agent should accomplish
    goal: String,

    /// Workspace root the agent may modify (defaults to current directory)
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Reflect-and-retry cycles before giving up
    #[arg(short, long)]
    budget: Option<u32>,

    /// Approve every tool proposal without prompting
    #[arg(long)]
    auto_approve: bool,

    /// Override the configured model
    #[arg(short, long)]
    model: Option<String>,
}

/// Interactive sink: prints the proposal preview and reads y/n from the
/// terminal. Anything but an explicit yes is a denial.
struct StdinApprovals;

#[async_trait]
impl ApprovalSink for StdinApprovals {
    async fn request(&self, req: ApprovalRequest) -> ApprovalDecision {
        let preview = req.preview.clone();
        let answer = tokio::task::spawn_blocking(move || {
            eprintln!("\n--- proposed {} ---\n{}\n---", req.proposal.tool_name(), preview);
            eprint!("approve? [y/N] ");
            std::io::stderr().flush().ok();
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).ok();
            line
        })
        .await
        .unwrap_or_default();

        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => ApprovalDecision::Approved,
            other => ApprovalDecision::Denied {
                reason: if other.is_empty() {
                    "declined at prompt".to_string()
                } else {
                    format!("declined at prompt: {other}")
                },
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = Config::load();
    if let Some(model) = args.model {
        config.model = model;
    }

    let api_key = config
        .api_key()
        .ok_or_else(|| anyhow!("no API key; set OPENROUTER_API_KEY or add it to the config file"))?;
    let oracle = Arc::new(OpenRouterOracle::new(
        api_key,
        config.model.clone(),
        config.max_tokens,
    )?);

    let approvals: Arc<dyn ApprovalSink> = if args.auto_approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(StdinApprovals)
    };

    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("workspace root {} not found", args.root.display()))?;
    let engine = Engine::new(config, oracle, approvals).await;

    let mut spec = TaskSpec::new(args.goal, root);
    spec.retry_budget = args.budget;
    let mut handle = engine.submit(spec).await;

    let mut outcome = TaskOutcome::Done;
    while let Some(event) = handle.events.recv().await {
        if let TaskEvent::Finished { outcome: last } = &event {
            outcome = last.clone();
        }
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("unserializable event: {err}"),
        }
    }

    engine.shutdown().await;
    match outcome {
        TaskOutcome::Done => Ok(()),
        TaskOutcome::Cancelled => Err(anyhow!("task cancelled")),
        TaskOutcome::Aborted { reason } => Err(anyhow!("task aborted: {reason}")),
    }
}
