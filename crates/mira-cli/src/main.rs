use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mira_engine::JournalingDelivery;
use mira_sched::{load_job_registry, Orchestrator, SchedConfig};

#[derive(Debug, Parser)]
#[command(name = "mira")]
#[command(about = "Monitoring & incremental report automation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute one gated run of every configured job.
    Run,
    /// Stay resident and trigger a gated run on the daily cron schedule.
    Watch,
    /// Print the pending unsent delta for an incremental job, without
    /// delivering or touching the ledger.
    Delta { job: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SchedConfig::from_env();
    let jobs = load_job_registry(&config.jobs_path).await?;
    let orchestrator = Arc::new(Orchestrator::new(config, jobs, Arc::new(JournalingDelivery)));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = orchestrator.run_once().await?;
            println!(
                "run complete: run_id={} gate={:?} jobs={} failed={}",
                summary.run_id,
                summary.gate,
                summary.jobs.len(),
                summary.failed_jobs()
            );
        }
        Commands::Watch => {
            orchestrator.watch().await?;
        }
        Commands::Delta { job } => {
            let (report, delta) = orchestrator.pending_delta(&job).await?;
            println!("pending delta for `{job}`: {} row(s)", report.row_count());
            for key in &delta.keys {
                println!("{key}");
            }
        }
    }

    Ok(())
}
