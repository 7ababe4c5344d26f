use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tdh_sync::report::report_daily_markdown;
use tdh_sync::{CancelFlag, SyncConfig, SyncService};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "tdh-cli")]
#[command(about = "Tourism data hub sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import every enabled source, or just one.
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Run one pass over the retry queue.
    Retry,
    /// Serve the HTTP surface (and the scheduler when enabled).
    Serve,
    /// Markdown digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 1)]
        runs: usize,
        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source } => {
            let service = SyncService::from_config(SyncConfig::from_env()).await?;
            let cancel = cancel_on_ctrl_c();
            match source {
                Some(source) => {
                    let run = service.sync_source(&source, &cancel).await?;
                    println!("{}", serde_json::to_string_pretty(&run.outcome.result)?);
                }
                None => {
                    let summary = service.run_once(&cancel).await?;
                    for run in &summary.sources {
                        info!(source = %run.source_id, message = %run.outcome.result.message, "source finished");
                    }
                    println!(
                        "sync complete: run_id={} sources={} success={} reports={}",
                        summary.run_id,
                        summary.sources.len(),
                        summary.success(),
                        summary.reports_dir
                    );
                }
            }
        }
        Commands::Retry => {
            let service = SyncService::from_config(SyncConfig::from_env()).await?;
            let summary = service.retry_pass().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve => {
            tdh_web::serve_from_env().await?;
        }
        Commands::Report { runs, workspace_root } => {
            let root = workspace_root.or_else(|| std::env::var("TDH_WORKSPACE_ROOT").ok().map(PathBuf::from));
            println!("{}", report_daily_markdown(runs, root)?);
        }
    }

    Ok(())
}

/// Ctrl-C stops the run at the next record boundary.
fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight records");
            flag.cancel();
        }
    });
    cancel
}
