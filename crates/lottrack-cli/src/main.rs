use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lottrack_storage::DataDir;
use lottrack_sync::{
    audit, backfill, CycleReport, LotteryRegistry, Scheduler, SyncConfig, UpdateOrchestrator,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lottrack")]
#[command(about = "Lottery draw tracker: fetch, verify and store official results")]
struct Cli {
    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run update cycles until Ctrl-C.
    Run {
        #[arg(long)]
        interval_mins: Option<u64>,
        #[arg(long)]
        max_iterations: Option<u64>,
    },
    /// Run a single update cycle.
    Once,
    /// Merge a game's full CSV history into its store.
    Backfill { key: String },
    /// Check every store for rule violations without modifying it.
    Audit,
}

fn init_logger(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lottrack=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lottrack=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

fn interval_from_minutes(mins: u64) -> Duration {
    Duration::from_secs(mins.saturating_mul(60))
}

fn print_report(report: &CycleReport) {
    println!("cycle {}: inserted={}", report.run_id, report.inserted_count());
    for outcome in &report.outcomes {
        println!("  {:<4} draw={} jackpot={}", outcome.key, outcome.draw, outcome.jackpot);
    }
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C; stop the process externally");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let config = SyncConfig::from_env();
    let registry = LotteryRegistry::load_or_builtin(&config.registry_path).await?;

    match cli.command.unwrap_or(Commands::Run {
        interval_mins: None,
        max_iterations: None,
    }) {
        Commands::Run {
            interval_mins,
            max_iterations,
        } => {
            let mut sched_config = config.scheduler_config();
            if let Some(mins) = interval_mins {
                sched_config.interval = interval_from_minutes(mins);
            }
            if max_iterations.is_some() {
                sched_config.max_iterations = max_iterations;
            }

            let orch = Arc::new(UpdateOrchestrator::new(&config, &registry)?);
            info!(
                data_dir = %config.data_dir.display(),
                interval_secs = sched_config.interval.as_secs(),
                "lottrack scheduler starting"
            );
            let summary = Scheduler::new(sched_config)
                .run(
                    move || {
                        let orch = orch.clone();
                        async move {
                            let report = orch.run_cycle().await;
                            print_report(&report);
                            Ok::<_, anyhow::Error>(report)
                        }
                    },
                    wait_for_ctrl_c(),
                )
                .await?;
            println!(
                "stopped: cycles={} failed={} inserted={}",
                summary.cycles, summary.failed, summary.inserted
            );
        }
        Commands::Once => {
            let orch = UpdateOrchestrator::new(&config, &registry)?;
            let report = orch.run_cycle().await;
            print_report(&report);
        }
        Commands::Backfill { key } => {
            let lottery = registry
                .get(&key)
                .with_context(|| format!("unknown lottery {key}"))?;
            let http = config.http_fetcher()?;
            let data = DataDir::new(config.data_dir.clone());
            let report = backfill(&http, &data, lottery).await?;
            println!(
                "backfill {} from {}: rows={} inserted={} already_present={} invalid={}",
                report.key,
                report.source,
                report.rows,
                report.summary.inserted,
                report.summary.already_present,
                report.summary.invalid
            );
        }
        Commands::Audit => {
            let data = DataDir::new(config.data_dir.clone());
            let reports = audit(&data, &registry).await?;
            let mut issues = 0;
            for report in &reports {
                let latest = report
                    .latest
                    .map(|date| date.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<4} draws={} latest={}", report.key, report.draws, latest);
                for issue in &report.issues {
                    println!("  {issue}");
                }
                issues += report.issues.len();
            }
            if issues > 0 {
                bail!("audit found {issues} issue(s)");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_interval_saturates_instead_of_overflowing() {
        assert_eq!(interval_from_minutes(30), Duration::from_secs(1800));
        assert_eq!(interval_from_minutes(u64::MAX), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from(["lottrack", "run", "--interval-mins", "15", "--max-iterations", "2"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Run {
                interval_mins: Some(15),
                max_iterations: Some(2)
            })
        ));
    }
}
