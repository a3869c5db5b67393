use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tdp_core::LoadResult;
use tdp_storage::BackoffPolicy;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{MergeCounts, TableStore};
use crate::table::{StagedBatch, TableRef, TableSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Staging,
    Validating,
    Merging,
    Committed,
    Failed,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Staging => "STAGING",
            Self::Validating => "VALIDATING",
            Self::Merging => "MERGING",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("SchemaError: {0}")]
    Schema(String),
    #[error("LoadError: {phase}: {source}")]
    Destination {
        phase: LoadPhase,
        #[source]
        source: sqlx::Error,
    },
    #[error("LoadError: invalid table identifier {0:?}")]
    InvalidIdentifier(String),
}

impl LoadError {
    /// Destination briefly unavailable; the whole load may start over from staging.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Destination {
                source: sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut,
                ..
            }
        )
    }
}

/// In-process exclusion so two merges never hit the same table at once.
fn table_lock(physical: &str) -> Arc<tokio::sync::Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    locks.entry(physical.to_string()).or_default().clone()
}

fn validate(expected: &TableSchema, batch: &StagedBatch) -> Result<(), LoadError> {
    let mut problems = expected.mismatches(&batch.schema);
    for (i, row) in batch.rows.iter().enumerate() {
        if row.len() != batch.schema.columns.len() {
            problems.push(format!(
                "row {i} has {} cells, expected {}",
                row.len(),
                batch.schema.columns.len()
            ));
            continue;
        }
        for (col, cell) in batch.schema.columns.iter().zip(row) {
            if !cell.fits(col.ty) {
                problems.push(format!("row {i} column {} holds {cell:?}", col.name));
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(LoadError::Schema(problems.join("; ")))
    }
}

/// Stages a batch, validates it against the table's schema and merges it in one statement.
///
/// `STAGING -> VALIDATING -> MERGING -> COMMITTED`, with `FAILED` reachable from every
/// phase. The staging table is dropped whatever the outcome. Loading the same batch
/// twice leaves the table as a single load would.
#[derive(Clone)]
pub struct UpsertLoader {
    store: Arc<dyn TableStore>,
    backoff: BackoffPolicy,
}

impl UpsertLoader {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self {
            store,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn load(
        &self,
        table: &TableRef,
        expected: &TableSchema,
        batch: &StagedBatch,
    ) -> Result<LoadResult, LoadError> {
        let physical = table.physical_name()?;
        let lock = table_lock(&physical);
        let _guard = lock.lock().await;

        let suffix = Uuid::new_v4().simple().to_string();
        let staging = TableRef::staging_name(&physical, &suffix);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let outcome = self.attempt(table, &staging, expected, batch).await;
            if let Err(err) = self.store.drop_staging(&staging).await {
                warn!(table = %table, staging = %staging, error = %err, "could not drop staging table");
            }

            match outcome {
                Ok(counts) => {
                    let inserted = counts.after.saturating_sub(counts.before);
                    let updated = counts.affected.saturating_sub(inserted);
                    let result = LoadResult {
                        table: table.to_string(),
                        staged_rows: batch.len(),
                        inserted,
                        updated,
                        unchanged: (batch.len() as u64).saturating_sub(counts.affected),
                        total_rows: counts.after,
                        attempts: attempt,
                    };
                    info!(
                        table = %table,
                        phase = %LoadPhase::Committed,
                        staged = result.staged_rows,
                        inserted,
                        updated,
                        unchanged = result.unchanged,
                        total = result.total_rows,
                        "load committed"
                    );
                    return Ok(result);
                }
                Err(err) if err.is_transient() && attempt <= self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(
                        table = %table,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient load failure, restarting from staging"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(table = %table, phase = %LoadPhase::Failed, error = %err, "load failed");
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        table: &TableRef,
        staging: &str,
        expected: &TableSchema,
        batch: &StagedBatch,
    ) -> Result<MergeCounts, LoadError> {
        tracing::debug!(table = %table, phase = %LoadPhase::Staging, rows = batch.len());
        self.store.stage(staging, batch).await?;

        tracing::debug!(table = %table, phase = %LoadPhase::Validating);
        validate(expected, batch)?;
        let required = expected.required_columns();
        let nulls = self.store.count_nulls(staging, &required).await?;
        if nulls > 0 {
            return Err(LoadError::Schema(format!(
                "{nulls} staged rows have NULL in a required column ({})",
                required.join(", ")
            )));
        }

        tracing::debug!(table = %table, phase = %LoadPhase::Merging);
        self.store.merge(table, staging, expected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{CellValue, Column, ColumnType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn schema() -> TableSchema {
        TableSchema {
            key: "k",
            columns: vec![
                Column::required("k", ColumnType::Text),
                Column::nullable("v", ColumnType::Float),
            ],
        }
    }

    fn batch() -> StagedBatch {
        StagedBatch {
            schema: schema(),
            rows: vec![vec![CellValue::Text("a".into()), CellValue::Float(1.0)]],
        }
    }

    #[derive(Default)]
    struct Flaky {
        io_failures_left: AtomicUsize,
        stages: AtomicUsize,
        merges: AtomicUsize,
        drops: AtomicUsize,
    }

    #[async_trait]
    impl TableStore for Flaky {
        async fn stage(&self, _staging: &str, _batch: &StagedBatch) -> Result<(), LoadError> {
            self.stages.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn count_nulls(&self, _staging: &str, _columns: &[&str]) -> Result<u64, LoadError> {
            Ok(0)
        }

        async fn merge(
            &self,
            _table: &TableRef,
            _staging: &str,
            _schema: &TableSchema,
        ) -> Result<MergeCounts, LoadError> {
            if self
                .io_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LoadError::Destination {
                    phase: LoadPhase::Merging,
                    source: sqlx::Error::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "reset",
                    )),
                });
            }
            self.merges.fetch_add(1, Ordering::SeqCst);
            Ok(MergeCounts {
                before: 0,
                after: 1,
                affected: 1,
            })
        }

        async fn drop_staging(&self, _staging: &str) -> Result<(), LoadError> {
            self.drops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn row_count(&self, _table: &TableRef) -> Result<u64, LoadError> {
            Ok(0)
        }
    }

    fn quick_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_restarts_from_staging() {
        let store = Arc::new(Flaky {
            io_failures_left: AtomicUsize::new(1),
            ..Flaky::default()
        });
        let loader = UpsertLoader::new(store.clone()).with_backoff(quick_backoff());
        let table = TableRef::new("p", "ds", "retry_table");
        let result = loader.load(&table, &schema(), &batch()).await.expect("load");
        assert_eq!(result.attempts, 2);
        assert_eq!(result.inserted, 1);
        assert_eq!(store.stages.load(Ordering::SeqCst), 2);
        assert_eq!(store.drops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let store = Arc::new(Flaky {
            io_failures_left: AtomicUsize::new(10),
            ..Flaky::default()
        });
        let loader = UpsertLoader::new(store.clone()).with_backoff(quick_backoff());
        let table = TableRef::new("p", "ds", "bounded_table");
        let err = loader.load(&table, &schema(), &batch()).await.expect_err("gives up");
        assert!(err.is_transient());
        assert_eq!(store.stages.load(Ordering::SeqCst), 3);
        assert_eq!(store.merges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn schema_mismatch_never_reaches_merge() {
        let store = Arc::new(Flaky::default());
        let loader = UpsertLoader::new(store.clone());
        let mut bad = batch();
        bad.schema.columns.pop();
        for row in &mut bad.rows {
            row.pop();
        }
        let err = loader
            .load(&TableRef::new("p", "ds", "schema_table"), &schema(), &bad)
            .await
            .expect_err("schema error");
        assert!(matches!(err, LoadError::Schema(ref m) if m.contains("missing column v")));
        assert_eq!(store.merges.load(Ordering::SeqCst), 0);
        assert_eq!(store.drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wrongly_typed_cells_are_schema_errors() {
        let mut bad = batch();
        bad.rows[0][1] = CellValue::Text("warm".into());
        let err = validate(&schema(), &bad).expect_err("type error");
        assert!(err.to_string().starts_with("SchemaError: row 0 column v"));
    }
}
