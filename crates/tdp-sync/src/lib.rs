//! Pipeline orchestration: parallel harvest, normalization and idempotent upsert loading.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tdp_adapters::{OpenWeatherAdapter, WikipediaAdapter};
use tdp_core::RunSummary;
use tdp_storage::{FsBlobStore, ReqwestSource};
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod coordinator;
pub mod harvest;
pub mod loader;
pub mod normalize;
pub mod report;
pub mod snapshot;
pub mod store;
pub mod table;

pub use config::{PipelineConfig, SourceList};
pub use coordinator::{run_token, IngestSource, PipelineCoordinator};
pub use harvest::{HarvestConfig, HarvestReport, ParallelHarvester};
pub use loader::{LoadError, LoadPhase, UpsertLoader};
pub use report::{report_recent_runs, summary_markdown, write_run_report};
pub use store::{MergeCounts, SqlTableStore, TableStore};
pub use table::{CellValue, Column, ColumnType, StagedBatch, TableRef, TableRow, TableSchema};

pub const CRATE_NAME: &str = "tdp-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Destinations,
    Weather,
}

/// Builds the production wiring from the environment and runs one pipeline.
pub async fn run_pipeline_from_env(
    kind: PipelineKind,
    concurrency: Option<usize>,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let mut config = PipelineConfig::from_env();
    if let Some(n) = concurrency {
        config.concurrency = n.max(1);
    }
    config.check_tables()?;
    let sources = SourceList::load(&config.sources_path())?;

    let http = Arc::new(ReqwestSource::new(config.http_client_config())?);
    let blobs = Arc::new(FsBlobStore::new(&config.raw_archive_dir));
    let store = SqlTableStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening table store for {}", config.dataset_id))?;
    let loader = UpsertLoader::new(Arc::new(store));
    let coordinator = PipelineCoordinator::new(http, blobs, loader, config.harvest_config())
        .with_reports_root(config.reports_root());

    let summary = match kind {
        PipelineKind::Destinations => {
            let adapter = Arc::new(WikipediaAdapter::new(&config.wikipedia_base_url));
            coordinator
                .run(
                    adapter,
                    sources.destination_items(),
                    &config.destination_table(),
                    cancel,
                )
                .await
        }
        PipelineKind::Weather => {
            if config.weather_api_key.trim().is_empty() {
                bail!("WEATHER_API_KEY is not set");
            }
            let adapter = Arc::new(OpenWeatherAdapter::new(
                &config.weather_api_base_url,
                &config.weather_api_key,
                config.forecast_days,
            ));
            coordinator
                .run(
                    adapter,
                    sources.location_items(),
                    &config.weather_table(),
                    cancel,
                )
                .await
        }
    };
    Ok(summary)
}

pub fn report_recent_runs_from_env(runs: usize) -> Result<String> {
    report_recent_runs(runs, &PipelineConfig::from_env().reports_root())
}
