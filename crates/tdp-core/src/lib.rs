//! Core domain model for the travel data ingestion pipelines.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tdp-core";

/// A forecast location supplied by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub city: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(city: &str, country: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            city: city.to_string(),
            country: country.to_string(),
            latitude,
            longitude,
        }
    }

    pub fn check_bounds(&self) -> Result<(), String> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(format!("latitude {} out of range", self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(format!("longitude {} out of range", self.longitude));
        }
        Ok(())
    }
}

/// One unit of fetch work. Immutable input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceItem {
    Destination { name: String },
    Location(Location),
}

impl SourceItem {
    pub fn destination(name: impl Into<String>) -> Self {
        Self::Destination { name: name.into() }
    }

    pub fn id(&self) -> String {
        match self {
            Self::Destination { name } => name.clone(),
            Self::Location(loc) => format!("{}|{}", loc.city, loc.country),
        }
    }
}

/// Unmodified response payload plus provenance, captured once per attempt that got a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture {
    pub source_item_id: String,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub http_status: u16,
    pub content_type: String,
    pub payload: Vec<u8>,
    /// Zero for the first request of an item, then one per retry.
    pub attempt: u32,
}

impl RawCapture {
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Extracted field value tagged with whether the source actually supplied it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Extracted<T> {
    pub value: T,
    pub defaulted: bool,
}

impl<T> Extracted<T> {
    pub fn found(value: T) -> Self {
        Self {
            value,
            defaulted: false,
        }
    }

    pub fn defaulted_to(value: T) -> Self {
        Self {
            value,
            defaulted: true,
        }
    }

    pub fn or_else_default(value: Option<T>, fallback: T) -> Self {
        match value {
            Some(value) => Self::found(value),
            None => Self::defaulted_to(fallback),
        }
    }
}

impl<T: Default> Extracted<T> {
    pub fn from_option(value: Option<T>) -> Self {
        Self::or_else_default(value, T::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attraction {
    pub name: String,
    pub description: String,
    pub image_url: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Best-effort extraction from one destination page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDestination {
    pub destination_name: String,
    pub description: Extracted<String>,
    /// Raw `"lat; lon"` text; coerced during normalization.
    pub coordinates: Extracted<String>,
    pub country: Extracted<String>,
    /// Raw infobox population cell text.
    pub population: Extracted<String>,
    pub timezone: Extracted<String>,
    pub languages: Extracted<Vec<String>>,
    pub climate: Extracted<String>,
    pub image_url: Extracted<String>,
    pub sections: Extracted<Vec<String>>,
    pub attractions: Extracted<Vec<Attraction>>,
}

impl ParsedDestination {
    pub fn defaulted_fields(&self) -> Vec<&'static str> {
        let flags = [
            ("description", self.description.defaulted),
            ("coordinates", self.coordinates.defaulted),
            ("country", self.country.defaulted),
            ("population", self.population.defaulted),
            ("timezone", self.timezone.defaulted),
            ("languages", self.languages.defaulted),
            ("climate", self.climate.defaulted),
            ("image_url", self.image_url.defaulted),
            ("sections", self.sections.defaulted),
            ("attractions", self.attractions.defaulted),
        ];
        flags
            .into_iter()
            .filter_map(|(name, defaulted)| defaulted.then_some(name))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedForecastDay {
    /// Epoch seconds of the forecast day; `None` when absent or not an integer.
    pub dt: Option<i64>,
    pub max_temp: Extracted<Option<f64>>,
    pub min_temp: Extracted<Option<f64>>,
    pub day_temp: Extracted<Option<f64>>,
    pub night_temp: Extracted<Option<f64>>,
    pub feels_like_day: Extracted<Option<f64>>,
    pub feels_like_night: Extracted<Option<f64>>,
    pub humidity: Extracted<Option<f64>>,
    pub wind_speed: Extracted<Option<f64>>,
    pub weather_main: Extracted<String>,
    pub weather_description: Extracted<String>,
    pub weather_icon: Extracted<String>,
    pub precipitation_probability: Extracted<f64>,
    pub rain: Extracted<f64>,
    pub uvi: Extracted<f64>,
    pub clouds: Extracted<f64>,
    pub sunrise: Extracted<Option<i64>>,
    pub sunset: Extracted<Option<i64>>,
}

impl ParsedForecastDay {
    pub fn defaulted_fields(&self) -> Vec<&'static str> {
        let flags = [
            ("max_temp", self.max_temp.defaulted),
            ("min_temp", self.min_temp.defaulted),
            ("day_temp", self.day_temp.defaulted),
            ("night_temp", self.night_temp.defaulted),
            ("feels_like_day", self.feels_like_day.defaulted),
            ("feels_like_night", self.feels_like_night.defaulted),
            ("humidity", self.humidity.defaulted),
            ("wind_speed", self.wind_speed.defaulted),
            ("weather_main", self.weather_main.defaulted),
            ("weather_description", self.weather_description.defaulted),
            ("weather_icon", self.weather_icon.defaulted),
            ("precipitation_probability", self.precipitation_probability.defaulted),
            ("rain", self.rain.defaulted),
            ("uvi", self.uvi.defaulted),
            ("clouds", self.clouds.defaulted),
            ("sunrise", self.sunrise.defaulted),
            ("sunset", self.sunset.defaulted),
        ];
        flags
            .into_iter()
            .filter_map(|(name, defaulted)| defaulted.then_some(name))
            .collect()
    }
}

/// Best-effort extraction from one forecast API response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedForecast {
    pub location: Location,
    pub requested_days: usize,
    pub available_days: usize,
    pub days: Vec<ParsedForecastDay>,
}

impl ParsedForecast {
    pub fn defaulted_fields(&self) -> Vec<&'static str> {
        self.days.iter().flat_map(|d| d.defaulted_fields()).collect()
    }
}

/// Canonical destination row, keyed by `destination_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub destination_name: String,
    pub description: String,
    pub country: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub population_count: Option<i64>,
    pub population_year: Option<i64>,
    pub timezone: String,
    /// JSON array text.
    pub languages: String,
    pub climate: String,
    pub image_url: String,
    /// JSON array text.
    pub sections: String,
    pub attractions_count: i64,
    /// JSON array text.
    pub attractions: String,
    pub ingestion_timestamp: DateTime<Utc>,
}

/// Canonical forecast row, keyed by `city|country|date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub logical_key: String,
    pub city: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub forecast_date: NaiveDate,
    pub forecast_timestamp: DateTime<Utc>,
    pub max_temp: Option<f64>,
    pub min_temp: Option<f64>,
    pub day_temp: Option<f64>,
    pub night_temp: Option<f64>,
    pub feels_like_day: Option<f64>,
    pub feels_like_night: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub weather_main: String,
    pub weather_description: String,
    pub weather_icon: String,
    pub precipitation_probability: f64,
    pub rain: f64,
    pub uvi: f64,
    pub clouds: f64,
    pub sunrise: Option<DateTime<Utc>>,
    pub sunset: Option<DateTime<Utc>>,
    pub ingestion_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportFailure {
    Status(u16),
    Connection { message: String, retryable: bool },
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "{code}"),
            Self::Connection { message, .. } => f.write_str(message),
        }
    }
}

/// Per-item failure kinds. These never escape the harvester.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ItemError {
    #[error("TransportError:{0}")]
    Transport(TransportFailure),
    #[error("TimeoutError:{after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("ValidationError:{field}: {message}")]
    Validation { field: String, message: String },
}

impl ItemError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(TransportFailure::Status(code)) => *code == 429 || *code >= 500,
            Self::Transport(TransportFailure::Connection { retryable, .. }) => *retryable,
            Self::Validation { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub source_item_id: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(source_item_id: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            source_item_id: source_item_id.into(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of one committed merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    pub table: String,
    pub staged_rows: usize,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub total_rows: u64,
    pub attempts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    PartialSuccess,
    Failure,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failure => "failure",
        }
    }
}

/// Per-run bookkeeping, owned by the coordinator and read once at the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_token: String,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<ItemFailure>,
    pub abandoned: Vec<String>,
    pub cancelled: bool,
    pub records_staged: usize,
    pub defaulted_fields: BTreeMap<String, usize>,
    pub degraded: Vec<ItemFailure>,
    pub load: Option<LoadResult>,
    pub fatal_error: Option<String>,
    pub verdict: Verdict,
}

impl RunSummary {
    pub fn start(run_id: Uuid, run_token: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            run_id,
            run_token: run_token.into(),
            pipeline: pipeline.into(),
            started_at: Utc::now(),
            finished_at: None,
            attempted: 0,
            succeeded: 0,
            failed: Vec::new(),
            abandoned: Vec::new(),
            cancelled: false,
            records_staged: 0,
            defaulted_fields: BTreeMap::new(),
            degraded: Vec::new(),
            load: None,
            fatal_error: None,
            verdict: Verdict::Success,
        }
    }

    pub fn record_success(&mut self, defaulted: &[&'static str]) {
        self.attempted += 1;
        self.succeeded += 1;
        for field in defaulted {
            *self.defaulted_fields.entry((*field).to_string()).or_default() += 1;
        }
    }

    pub fn record_failure(&mut self, source_item_id: &str, error: &ItemError) {
        self.attempted += 1;
        self.failed.push(ItemFailure::new(source_item_id, error));
    }

    pub fn record_degraded(&mut self, source_item_id: &str, reason: impl ToString) {
        self.degraded.push(ItemFailure::new(source_item_id, reason));
    }

    pub fn compute_verdict(&self) -> Verdict {
        if self.fatal_error.is_some() {
            return Verdict::Failure;
        }
        if self.attempted > 0 && self.succeeded == 0 {
            return Verdict::Failure;
        }
        if self.cancelled && self.succeeded == 0 {
            return Verdict::Failure;
        }
        if !self.failed.is_empty() || self.cancelled {
            return Verdict::PartialSuccess;
        }
        Verdict::Success
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.verdict = self.compute_verdict();
    }
}
