use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::query::Query;
use sqlx::{Any, AnyPool};

use crate::loader::{LoadError, LoadPhase};
use crate::table::{checked_identifier, CellValue, ColumnType, StagedBatch, TableRef, TableSchema};

/// Row counts observed around one merge statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeCounts {
    pub before: u64,
    pub after: u64,
    pub affected: u64,
}

/// Analytical table boundary: bulk append into a scratch area, then one keyed merge.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Creates `staging` from the batch's own columns and appends every row.
    async fn stage(&self, staging: &str, batch: &StagedBatch) -> Result<(), LoadError>;

    /// Rows in `staging` with a NULL in any of `columns`.
    async fn count_nulls(&self, staging: &str, columns: &[&str]) -> Result<u64, LoadError>;

    /// Upserts everything in `staging` into `table` atomically, creating `table` if absent.
    async fn merge(
        &self,
        table: &TableRef,
        staging: &str,
        schema: &TableSchema,
    ) -> Result<MergeCounts, LoadError>;

    async fn drop_staging(&self, staging: &str) -> Result<(), LoadError>;

    async fn row_count(&self, table: &TableRef) -> Result<u64, LoadError>;
}

fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

fn db_err(phase: LoadPhase) -> impl Fn(sqlx::Error) -> LoadError {
    move |source| LoadError::Destination { phase, source }
}

/// sqlx `Any` table store. Works against sqlite and postgres URLs.
#[derive(Debug, Clone)]
pub struct SqlTableStore {
    pool: AnyPool,
}

impl SqlTableStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();
        let is_sqlite = database_url.starts_with("sqlite:");
        if is_sqlite {
            prepare_sqlite_dir(database_url)?;
        }
        let pool = AnyPoolOptions::new()
            .max_connections(if is_sqlite { 1 } else { 5 })
            .connect(database_url)
            .await
            .context("connecting to table store")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

/// sqlite creates the file but not its directory.
fn prepare_sqlite_dir(database_url: &str) -> anyhow::Result<()> {
    let path = database_url
        .trim_start_matches("sqlite:")
        .trim_start_matches("//");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(':') {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

fn bind_cell<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    ty: ColumnType,
    cell: &CellValue,
) -> Query<'q, Any, AnyArguments<'q>> {
    match (ty, cell) {
        (ColumnType::Float, CellValue::Float(v)) => query.bind(*v),
        (ColumnType::Float, CellValue::Integer(v)) => query.bind(*v as f64),
        (ColumnType::Float, _) => query.bind(None::<f64>),
        (ColumnType::Integer, CellValue::Integer(v)) => query.bind(*v),
        (ColumnType::Integer, _) => query.bind(None::<i64>),
        (_, CellValue::Text(v)) => query.bind(v.clone()),
        (_, CellValue::Float(v)) => query.bind(v.to_string()),
        (_, CellValue::Integer(v)) => query.bind(v.to_string()),
        (_, CellValue::Null) => query.bind(None::<String>),
    }
}

fn column_list(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| quoted(c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn create_table_sql(name: &str, schema: &TableSchema, with_constraints: bool) -> String {
    let mut defs: Vec<String> = schema
        .columns
        .iter()
        .map(|c| {
            let not_null = if with_constraints && c.required { " NOT NULL" } else { "" };
            format!("{} {}{not_null}", quoted(c.name), c.ty.sql_type())
        })
        .collect();
    if with_constraints {
        defs.push(format!("PRIMARY KEY ({})", quoted(schema.key)));
    }
    let if_not_exists = if with_constraints { "IF NOT EXISTS " } else { "" };
    format!("CREATE TABLE {if_not_exists}{} ({})", quoted(name), defs.join(", "))
}

/// One `INSERT .. SELECT .. ON CONFLICT DO UPDATE` that only touches rows whose values differ.
pub(crate) fn merge_sql(target: &str, staging: &str, schema: &TableSchema) -> String {
    let columns = column_list(schema);
    let non_key: Vec<&str> = schema
        .columns
        .iter()
        .map(|c| c.name)
        .filter(|name| *name != schema.key)
        .collect();
    let assignments = non_key
        .iter()
        .map(|name| format!("{0} = excluded.{0}", quoted(name)))
        .collect::<Vec<_>>()
        .join(", ");
    let changed = non_key
        .iter()
        .map(|name| format!("{}.{1} IS DISTINCT FROM excluded.{1}", quoted(target), quoted(name)))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!(
        "INSERT INTO {target_q} ({columns}) SELECT {columns} FROM {staging_q} WHERE true \
         ON CONFLICT ({key}) DO UPDATE SET {assignments} WHERE {changed}",
        target_q = quoted(target),
        staging_q = quoted(staging),
        key = quoted(schema.key),
    )
}

async fn count_rows<'e, E>(executor: E, table: &str, phase: LoadPhase) -> Result<u64, LoadError>
where
    E: sqlx::Executor<'e, Database = Any>,
{
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quoted(table)))
        .fetch_one(executor)
        .await
        .map_err(db_err(phase))?;
    Ok(count.max(0) as u64)
}

#[async_trait]
impl TableStore for SqlTableStore {
    async fn stage(&self, staging: &str, batch: &StagedBatch) -> Result<(), LoadError> {
        let staging = checked_identifier(staging)?;
        let err = db_err(LoadPhase::Staging);
        let mut tx = self.pool.begin().await.map_err(&err)?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quoted(staging)))
            .execute(&mut *tx)
            .await
            .map_err(&err)?;
        sqlx::query(&create_table_sql(staging, &batch.schema, false))
            .execute(&mut *tx)
            .await
            .map_err(&err)?;

        let placeholders = (1..=batch.schema.columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quoted(staging),
            column_list(&batch.schema)
        );
        for row in &batch.rows {
            let mut query = sqlx::query(&insert);
            for (col, cell) in batch.schema.columns.iter().zip(row) {
                query = bind_cell(query, col.ty, cell);
            }
            query.execute(&mut *tx).await.map_err(&err)?;
        }

        tx.commit().await.map_err(&err)
    }

    async fn count_nulls(&self, staging: &str, columns: &[&str]) -> Result<u64, LoadError> {
        if columns.is_empty() {
            return Ok(0);
        }
        let staging = checked_identifier(staging)?;
        let predicate = columns
            .iter()
            .map(|c| format!("{} IS NULL", quoted(c)))
            .collect::<Vec<_>>()
            .join(" OR ");
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE {predicate}",
            quoted(staging)
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err(LoadPhase::Validating))?;
        Ok(count.max(0) as u64)
    }

    async fn merge(
        &self,
        table: &TableRef,
        staging: &str,
        schema: &TableSchema,
    ) -> Result<MergeCounts, LoadError> {
        let target = table.physical_name()?;
        let staging = checked_identifier(staging)?;
        let err = db_err(LoadPhase::Merging);
        let mut tx = self.pool.begin().await.map_err(&err)?;

        sqlx::query(&create_table_sql(&target, schema, true))
            .execute(&mut *tx)
            .await
            .map_err(&err)?;
        let before = count_rows(&mut *tx, &target, LoadPhase::Merging).await?;
        let affected = sqlx::query(&merge_sql(&target, staging, schema))
            .execute(&mut *tx)
            .await
            .map_err(&err)?
            .rows_affected();
        let after = count_rows(&mut *tx, &target, LoadPhase::Merging).await?;
        tx.commit().await.map_err(&err)?;

        Ok(MergeCounts {
            before,
            after,
            affected,
        })
    }

    async fn drop_staging(&self, staging: &str) -> Result<(), LoadError> {
        let staging = checked_identifier(staging)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quoted(staging)))
            .execute(&self.pool)
            .await
            .map_err(db_err(LoadPhase::Failed))?;
        Ok(())
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64, LoadError> {
        count_rows(&self.pool, &table.physical_name()?, LoadPhase::Committed).await
    }
}
