use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use tdp_core::{DestinationRecord, ForecastRecord};

use crate::loader::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Float,
    Integer,
    /// RFC 3339 text.
    Timestamp,
    /// `YYYY-MM-DD` text.
    Date,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::Timestamp | Self::Date => "TEXT",
            Self::Float => "DOUBLE PRECISION",
            Self::Integer => "BIGINT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub required: bool,
}

impl Column {
    pub const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    pub const fn nullable(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }
}

/// Expected column layout of one destination table, keyed by a single natural-key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub key: &'static str,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn required_columns(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .filter(|c| c.required)
            .map(|c| c.name)
            .collect()
    }

    /// Every way `staged` differs from `self`, one message per problem.
    pub fn mismatches(&self, staged: &TableSchema) -> Vec<String> {
        let mut problems = Vec::new();
        if staged.key != self.key {
            problems.push(format!("key is {}, expected {}", staged.key, self.key));
        }
        for expected in &self.columns {
            match staged.column(expected.name) {
                None => problems.push(format!("missing column {}", expected.name)),
                Some(col) if col.ty != expected.ty => problems.push(format!(
                    "column {} is {:?}, expected {:?}",
                    expected.name, col.ty, expected.ty
                )),
                Some(_) => {}
            }
        }
        for col in &staged.columns {
            if self.column(col.name).is_none() {
                problems.push(format!("unexpected column {}", col.name));
            }
        }
        problems
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Text(String),
    Float(f64),
    Integer(i64),
}

impl CellValue {
    pub fn timestamp(ts: DateTime<Utc>) -> Self {
        Self::Text(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn date(date: NaiveDate) -> Self {
        Self::Text(date.format("%Y-%m-%d").to_string())
    }

    /// Whether this value can be stored in a column of type `ty`.
    pub fn fits(&self, ty: ColumnType) -> bool {
        match (self, ty) {
            (Self::Null, _) => true,
            (Self::Float(_) | Self::Integer(_), ColumnType::Float) => true,
            (Self::Integer(_), ColumnType::Integer) => true,
            (Self::Text(_), ColumnType::Text | ColumnType::Timestamp | ColumnType::Date) => true,
            _ => false,
        }
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A canonical record that can be staged into a table.
pub trait TableRow {
    fn schema() -> TableSchema;
    fn natural_key(&self) -> &str;
    /// When the values in this row were observed; the latest observation wins a key collision.
    fn observed_at(&self) -> DateTime<Utc>;
    /// One cell per `schema()` column, in column order.
    fn cells(&self) -> Vec<CellValue>;
}

impl TableRow for DestinationRecord {
    fn schema() -> TableSchema {
        use ColumnType::*;
        TableSchema {
            key: "destination_name",
            columns: vec![
                Column::required("destination_name", Text),
                Column::nullable("description", Text),
                Column::nullable("country", Text),
                Column::nullable("latitude", Float),
                Column::nullable("longitude", Float),
                Column::nullable("population_count", Integer),
                Column::nullable("population_year", Integer),
                Column::nullable("timezone", Text),
                Column::nullable("languages", Text),
                Column::nullable("climate", Text),
                Column::nullable("image_url", Text),
                Column::nullable("sections", Text),
                Column::required("attractions_count", Integer),
                Column::nullable("attractions", Text),
                Column::required("ingestion_timestamp", Timestamp),
            ],
        }
    }

    fn natural_key(&self) -> &str {
        &self.destination_name
    }

    fn observed_at(&self) -> DateTime<Utc> {
        self.ingestion_timestamp
    }

    fn cells(&self) -> Vec<CellValue> {
        vec![
            self.destination_name.as_str().into(),
            self.description.as_str().into(),
            self.country.as_str().into(),
            self.latitude.into(),
            self.longitude.into(),
            self.population_count.into(),
            self.population_year.into(),
            self.timezone.as_str().into(),
            self.languages.as_str().into(),
            self.climate.as_str().into(),
            self.image_url.as_str().into(),
            self.sections.as_str().into(),
            self.attractions_count.into(),
            self.attractions.as_str().into(),
            CellValue::timestamp(self.ingestion_timestamp),
        ]
    }
}

impl TableRow for ForecastRecord {
    fn schema() -> TableSchema {
        use ColumnType::*;
        TableSchema {
            key: "logical_key",
            columns: vec![
                Column::required("logical_key", Text),
                Column::required("city", Text),
                Column::required("country", Text),
                Column::required("latitude", Float),
                Column::required("longitude", Float),
                Column::required("forecast_date", Date),
                Column::required("forecast_timestamp", Timestamp),
                Column::nullable("max_temp", Float),
                Column::nullable("min_temp", Float),
                Column::nullable("day_temp", Float),
                Column::nullable("night_temp", Float),
                Column::nullable("feels_like_day", Float),
                Column::nullable("feels_like_night", Float),
                Column::nullable("humidity", Float),
                Column::nullable("wind_speed", Float),
                Column::nullable("weather_main", Text),
                Column::nullable("weather_description", Text),
                Column::nullable("weather_icon", Text),
                Column::required("precipitation_probability", Float),
                Column::required("rain", Float),
                Column::required("uvi", Float),
                Column::required("clouds", Float),
                Column::nullable("sunrise", Timestamp),
                Column::nullable("sunset", Timestamp),
                Column::required("ingestion_timestamp", Timestamp),
            ],
        }
    }

    fn natural_key(&self) -> &str {
        &self.logical_key
    }

    fn observed_at(&self) -> DateTime<Utc> {
        self.ingestion_timestamp
    }

    fn cells(&self) -> Vec<CellValue> {
        vec![
            self.logical_key.as_str().into(),
            self.city.as_str().into(),
            self.country.as_str().into(),
            self.latitude.into(),
            self.longitude.into(),
            CellValue::date(self.forecast_date),
            CellValue::timestamp(self.forecast_timestamp),
            self.max_temp.into(),
            self.min_temp.into(),
            self.day_temp.into(),
            self.night_temp.into(),
            self.feels_like_day.into(),
            self.feels_like_night.into(),
            self.humidity.into(),
            self.wind_speed.into(),
            self.weather_main.as_str().into(),
            self.weather_description.as_str().into(),
            self.weather_icon.as_str().into(),
            self.precipitation_probability.into(),
            self.rain.into(),
            self.uvi.into(),
            self.clouds.into(),
            self.sunrise.map(CellValue::timestamp).unwrap_or(CellValue::Null),
            self.sunset.map(CellValue::timestamp).unwrap_or(CellValue::Null),
            CellValue::timestamp(self.ingestion_timestamp),
        ]
    }
}

/// Keeps one record per natural key: the latest `observed_at`, and on a tie the later
/// record in the input. Output follows the first appearance of each key.
pub fn latest_per_key<R: TableRow>(records: Vec<R>) -> Vec<R> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<R> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(record.natural_key()) {
            Some(&slot) => {
                if record.observed_at() >= kept[slot].observed_at() {
                    kept[slot] = record;
                }
            }
            None => {
                index.insert(record.natural_key().to_string(), kept.len());
                kept.push(record);
            }
        }
    }
    kept
}

/// Run-scoped rows destined for one table. Owned by a single load.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBatch {
    pub schema: TableSchema,
    pub rows: Vec<Vec<CellValue>>,
}

impl StagedBatch {
    pub fn from_records<R: TableRow>(records: Vec<R>) -> Self {
        Self {
            schema: R::schema(),
            rows: latest_per_key(records).iter().map(TableRow::cells).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// `{project, dataset, table}` address of an analytical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// `{dataset}__{table}`; the project names the connection, not the table.
    /// Short enough that its staging tables are valid identifiers too.
    pub fn physical_name(&self) -> Result<String, LoadError> {
        let dataset = checked_identifier(&self.dataset)?;
        let table = checked_identifier(&self.table)?;
        let physical = format!("{dataset}__{table}");
        if physical.len() > MAX_IDENTIFIER_LEN - STAGING_SUFFIX_LEN {
            return Err(LoadError::InvalidIdentifier(physical));
        }
        Ok(physical)
    }

    pub fn staging_name(physical: &str, run_hex: &str) -> String {
        let short = run_hex.get(..STAGING_HEX_LEN).unwrap_or(run_hex);
        format!("{physical}__stg_{short}")
    }
}

const MAX_IDENTIFIER_LEN: usize = 63;
const STAGING_HEX_LEN: usize = 8;
const STAGING_SUFFIX_LEN: usize = "__stg_".len() + STAGING_HEX_LEN;

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

pub(crate) fn checked_identifier(name: &str) -> Result<&str, LoadError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(LoadError::InvalidIdentifier(name.to_string()))
    }
}
