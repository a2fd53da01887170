use std::io::Write;
use std::path::PathBuf;

use agentrelay_agents::default_registry;
use agentrelay_core::{
    ConfigLoader, DispatchEnvelope, EnvelopeTrace, SubscriptionFilter, SyncHandler,
    TelemetryOptions, TurnRequest, WorkflowCoordinator, handle_turn, init_telemetry, metrics,
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "agentrelay",
    version,
    about = "Run a multi-agent research turn and stream its envelopes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Research a query and stream context-tagged envelopes to stdout.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Query to research.
    #[arg(long)]
    query: String,

    /// Configuration file (defaults to `AGENTRELAY_CONFIG`, then `agentrelay.toml`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Deepest context depth forwarded to stdout; overrides `dispatch.max_depth`.
    #[arg(long)]
    max_depth: Option<usize>,

    /// Trace summary printed to stderr once the turn ends.
    #[arg(long, value_enum, default_value_t = TraceFormat::None)]
    trace: TraceFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TraceFormat {
    Markdown,
    Mermaid,
    None,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(args).await,
        }
    })
}

async fn run_command(args: RunArgs) -> Result<()> {
    let config = ConfigLoader::load_or_default(args.config.clone())
        .context("failed to load agentrelay configuration")?;
    init_telemetry(TelemetryOptions::from_config(&config.logging))?;
    metrics::init_metrics_from_env("agentrelay-cli")?;

    let mut filter = SubscriptionFilter::all();
    if let Some(depth) = args.max_depth.or(config.dispatch.max_depth) {
        filter = filter.max_depth(depth);
    }

    let trace = EnvelopeTrace::new();
    let recorder = trace.clone();
    let sink = SyncHandler::shared(move |envelope: &DispatchEnvelope| {
        let line = serde_json::to_string(envelope)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
        recorder.record(envelope.clone());
        Ok(())
    });

    let coordinator = WorkflowCoordinator::new(config.coordinator, default_registry());
    let outcome = handle_turn(
        &coordinator,
        TurnRequest::new(args.query).with_filter(filter),
        sink,
    )
    .await;

    let summary = trace.summary();
    match args.trace {
        TraceFormat::Markdown => eprintln!("{}", summary.render_markdown()),
        TraceFormat::Mermaid => eprintln!("{}", summary.render_mermaid()),
        TraceFormat::None => {}
    }

    match outcome {
        Ok(report) => {
            info!(
                workflow_id = %report.workflow_id,
                tasks = report.task_ids.len(),
                attempts = report.attempts,
                duration_ms = report.duration_ms,
                "research turn finished"
            );
            Ok(())
        }
        Err(err) => {
            warn!(phase = ?err.phase(), "research turn failed");
            Err(anyhow::Error::new(err).context("research workflow failed"))
        }
    }
}
