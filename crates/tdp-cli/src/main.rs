use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tdp_core::{RunSummary, Verdict};
use tdp_sync::PipelineKind;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "tdp-cli")]
#[command(about = "Travel data ingestion pipelines")]
struct Cli {
    /// Harvester worker count; overrides TDP_CONCURRENCY.
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape destination pages and upsert destination details.
    Destinations,
    /// Fetch daily forecasts and upsert one row per location-day.
    Weather,
    /// Print a digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .try_init();
}

fn exit_status(verdict: Verdict) -> u8 {
    match verdict {
        Verdict::Success => 0,
        Verdict::PartialSuccess => 2,
        Verdict::Failure => 1,
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} run complete: run_token={} verdict={} attempted={} succeeded={} failed={} abandoned={} staged={}",
        summary.pipeline,
        summary.run_token,
        summary.verdict.as_str(),
        summary.attempted,
        summary.succeeded,
        summary.failed.len(),
        summary.abandoned.len(),
        summary.records_staged
    );
    if let Some(load) = &summary.load {
        println!(
            "loaded {}: inserted={} updated={} unchanged={} total={}",
            load.table, load.inserted, load.updated, load.unchanged, load.total_rows
        );
    }
    if let Some(err) = &summary.fatal_error {
        eprintln!("{err}");
    }
}

async fn run_pipeline(kind: PipelineKind, concurrency: Option<usize>) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling harvest");
            on_signal.cancel();
        }
    });

    let summary = tdp_sync::run_pipeline_from_env(kind, concurrency, cancel).await?;
    print_summary(&summary);
    Ok(ExitCode::from(exit_status(summary.verdict)))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Destinations => run_pipeline(PipelineKind::Destinations, cli.concurrency).await,
        Commands::Weather => run_pipeline(PipelineKind::Weather, cli.concurrency).await,
        Commands::Report { runs } => tdp_sync::report_recent_runs_from_env(runs).map(|md| {
            println!("{md}");
            ExitCode::SUCCESS
        }),
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn concurrency_is_global() {
        let cli = Cli::try_parse_from(["tdp-cli", "weather", "--concurrency", "8"]).expect("parse");
        assert_eq!(cli.concurrency, Some(8));
        assert!(matches!(cli.command, Commands::Weather));

        let cli = Cli::try_parse_from(["tdp-cli", "report"]).expect("parse");
        assert!(matches!(cli.command, Commands::Report { runs: 5 }));
    }

    #[test]
    fn verdicts_map_to_exit_codes() {
        assert_eq!(exit_status(Verdict::Success), 0);
        assert_eq!(exit_status(Verdict::PartialSuccess), 2);
        assert_eq!(exit_status(Verdict::Failure), 1);
    }
}
