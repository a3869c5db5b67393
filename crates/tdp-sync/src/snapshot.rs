use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;

use crate::table::{CellValue, ColumnType, StagedBatch};

fn arrow_type(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::Text | ColumnType::Timestamp | ColumnType::Date => DataType::Utf8,
        ColumnType::Float => DataType::Float64,
        ColumnType::Integer => DataType::Int64,
    }
}

fn column_array(batch: &StagedBatch, index: usize, ty: ColumnType) -> ArrayRef {
    let cells = batch.rows.iter().map(|row| row.get(index));
    match ty {
        ColumnType::Float => Arc::new(
            cells
                .map(|cell| match cell {
                    Some(CellValue::Float(v)) => Some(*v),
                    Some(CellValue::Integer(v)) => Some(*v as f64),
                    _ => None,
                })
                .collect::<Float64Array>(),
        ),
        ColumnType::Integer => Arc::new(
            cells
                .map(|cell| match cell {
                    Some(CellValue::Integer(v)) => Some(*v),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        ColumnType::Text | ColumnType::Timestamp | ColumnType::Date => Arc::new(
            cells
                .map(|cell| match cell {
                    Some(CellValue::Text(v)) => Some(v.clone()),
                    _ => None,
                })
                .collect::<StringArray>(),
        ),
    }
}

pub fn to_record_batch(batch: &StagedBatch) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(
        batch
            .schema
            .columns
            .iter()
            .map(|c| Field::new(c.name, arrow_type(c.ty), !c.required))
            .collect::<Vec<_>>(),
    ));
    let columns = batch
        .schema
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| column_array(batch, i, c.ty))
        .collect::<Vec<_>>();
    RecordBatch::try_new(schema, columns).context("building record batch")
}

/// Parquet bytes for the processed batch, one row group.
pub fn batch_to_parquet(batch: &StagedBatch) -> Result<Vec<u8>> {
    let record_batch = to_record_batch(batch)?;
    let mut writer = ArrowWriter::try_new(Vec::new(), record_batch.schema(), None)
        .context("opening parquet writer")?;
    writer
        .write(&record_batch)
        .context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}
