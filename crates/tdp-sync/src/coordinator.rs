//! One pipeline run end to end: harvest, archive, normalize, snapshot, load, report.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tdp_adapters::{Fetched, SourceAdapter};
use tdp_core::{ItemError, RunSummary, SourceItem};
use tdp_storage::{BlobStore, HttpSource, RawArchiver};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::harvest::{HarvestConfig, HarvestReport, ParallelHarvester};
use crate::loader::UpsertLoader;
use crate::report::write_run_report;
use crate::snapshot::batch_to_parquet;
use crate::table::{StagedBatch, TableRef, TableRow};

/// A source whose parsed payloads become rows of one table.
pub trait IngestSource: SourceAdapter {
    type Record: TableRow + Send + 'static;

    fn pipeline_name(&self) -> &'static str;

    /// Canonical records for one fetched item. An error fails just that item.
    fn normalize(&self, fetched: &Fetched<Self::Parsed>) -> Result<Vec<Self::Record>, ItemError>;

    fn defaulted_fields(parsed: &Self::Parsed) -> Vec<&'static str>;

    /// Records a fully successful run over `items` inputs would produce.
    fn expected_records(&self, items: usize) -> usize;
}

/// `YYYYMMDD_HHMMSS_{8 hex}`: sortable by start time, unique per run.
pub fn run_token(run_id: Uuid) -> String {
    let hex = run_id.simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &hex[..8])
}

pub struct PipelineCoordinator {
    http: Arc<dyn HttpSource>,
    blobs: Arc<dyn BlobStore>,
    loader: UpsertLoader,
    harvest: HarvestConfig,
    reports_root: Option<PathBuf>,
}

impl PipelineCoordinator {
    pub fn new(
        http: Arc<dyn HttpSource>,
        blobs: Arc<dyn BlobStore>,
        loader: UpsertLoader,
        harvest: HarvestConfig,
    ) -> Self {
        Self {
            http,
            blobs,
            loader,
            harvest,
            reports_root: None,
        }
    }

    pub fn with_reports_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.reports_root = Some(root.into());
        self
    }

    pub async fn run<S>(
        &self,
        source: Arc<S>,
        items: Vec<SourceItem>,
        table: &TableRef,
        cancel: CancellationToken,
    ) -> RunSummary
    where
        S: IngestSource + 'static,
    {
        let run_id = Uuid::new_v4();
        let token = run_token(run_id);
        let span = info_span!(
            "pipeline_run",
            pipeline = source.pipeline_name(),
            %run_id,
            run_token = %token
        );
        self.run_inner(source, items, table, cancel, run_id, token)
            .instrument(span)
            .await
    }

    async fn run_inner<S>(
        &self,
        source: Arc<S>,
        items: Vec<SourceItem>,
        table: &TableRef,
        cancel: CancellationToken,
        run_id: Uuid,
        token: String,
    ) -> RunSummary
    where
        S: IngestSource + 'static,
    {
        let mut summary = RunSummary::start(run_id, &token, source.pipeline_name());
        let expected = source.expected_records(items.len());
        info!(items = items.len(), table = %table, "run started");

        if let Err(err) = table.physical_name() {
            warn!(table = %table, error = %err, "destination table is unusable, nothing fetched");
            summary.fatal_error = Some(err.to_string());
            summary.finish();
            return summary;
        }

        let harvester =
            ParallelHarvester::new(source.clone(), self.http.clone(), self.harvest.clone());
        let report = harvester.harvest(items, cancel).await;

        let archiver = RawArchiver::new(
            self.blobs.clone(),
            source.archive_prefix(),
            run_id,
            token.as_str(),
        );
        self.archive_captures(&archiver, &report, &mut summary).await;

        for failure in &report.failed {
            summary.record_failure(&failure.item.id(), &failure.error);
        }
        let mut records = Vec::new();
        for fetched in &report.fetched {
            match source.normalize(fetched) {
                Ok(rows) => {
                    summary.record_success(&S::defaulted_fields(&fetched.parsed));
                    records.extend(rows);
                }
                Err(err) => {
                    warn!(source_item_id = %fetched.item.id(), reason = %err, "normalization failed");
                    summary.record_failure(&fetched.item.id(), &err);
                }
            }
        }
        summary.abandoned = report.abandoned.clone();
        summary.cancelled = report.cancelled;

        let produced = records.len();
        let batch = StagedBatch::from_records(records);
        summary.records_staged = batch.len();
        log_completeness(&summary, produced, expected);

        if !batch.is_empty() {
            self.write_snapshot(table, &token, run_id, &batch, &mut summary)
                .await;
            match self
                .loader
                .load(table, &<S::Record as TableRow>::schema(), &batch)
                .await
            {
                Ok(result) => summary.load = Some(result),
                Err(err) => summary.fatal_error = Some(err.to_string()),
            }
        } else {
            info!("nothing to load");
        }

        summary.finish();
        info!(
            verdict = summary.verdict.as_str(),
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            abandoned = summary.abandoned.len(),
            "run finished"
        );

        if let Some(root) = &self.reports_root {
            match write_run_report(root, &summary).await {
                Ok(dir) => info!(path = %dir.display(), "run report written"),
                Err(err) => warn!(error = %err, "could not write run report"),
            }
        }
        summary
    }

    async fn archive_captures<P>(
        &self,
        archiver: &RawArchiver,
        report: &HarvestReport<P>,
        summary: &mut RunSummary,
    ) {
        for capture in report.captures() {
            if let Err(err) = archiver.archive(capture).await {
                warn!(source_item_id = %capture.source_item_id, error = %err, "raw archive failed");
                summary.record_degraded(&capture.source_item_id, format!("StorageError:{err}"));
            }
        }
    }

    async fn write_snapshot(
        &self,
        table: &TableRef,
        token: &str,
        run_id: Uuid,
        batch: &StagedBatch,
        summary: &mut RunSummary,
    ) {
        let path = format!("processed/{}/{token}.parquet", table.dataset);
        let outcome = match batch_to_parquet(batch) {
            Ok(bytes) => {
                let metadata = BTreeMap::from([
                    ("pipeline_run_id".to_string(), run_id.to_string()),
                    ("table".to_string(), table.to_string()),
                    ("rows".to_string(), batch.len().to_string()),
                    ("content_type".to_string(), "application/vnd.apache.parquet".to_string()),
                ]);
                self.blobs
                    .put(&path, &bytes, &metadata)
                    .await
                    .map(|_| ())
                    .map_err(|err| format!("StorageError:{err}"))
            }
            Err(err) => Err(format!("SnapshotError:{err:#}")),
        };
        match outcome {
            Ok(()) => info!(path = %path, rows = batch.len(), "processed snapshot written"),
            Err(reason) => {
                warn!(path = %path, reason = %reason, "processed snapshot failed");
                summary.record_degraded("snapshot", reason);
            }
        }
    }
}

fn log_completeness(summary: &RunSummary, produced: usize, expected: usize) {
    let coverage = if expected == 0 {
        1.0
    } else {
        produced as f64 / expected as f64
    };
    info!(
        produced,
        expected,
        coverage_pct = coverage * 100.0,
        defaulted = ?summary.defaulted_fields,
        "completeness"
    );
    if coverage < 1.0 {
        warn!(missing = expected.saturating_sub(produced), "incomplete coverage");
    }
}
