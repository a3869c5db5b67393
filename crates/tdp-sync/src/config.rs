use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tdp_adapters::FetchConfig;
use tdp_core::{Location, SourceItem};
use tdp_storage::{BackoffPolicy, HttpClientConfig};

use crate::harvest::HarvestConfig;
use crate::table::TableRef;

const DEFAULT_USER_AGENT: &str =
    "Travel Data Platform/1.0 (https://github.com/yourusername/travel-data-platform; info@example.com)";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub project_id: String,
    pub dataset_id: String,
    pub destination_table_id: String,
    pub weather_table_id: String,
    pub raw_archive_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub sources_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub concurrency: usize,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub wikipedia_base_url: String,
    pub weather_api_base_url: String,
    pub weather_api_key: String,
    pub forecast_days: usize,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("DATABASE_URL", "sqlite://./data/tdp.db?mode=rwc"),
            project_id: env_or("BQ_PROJECT_ID", "travel-data-platform"),
            dataset_id: env_or("BQ_STAGING_DATASET_ID", "staging"),
            destination_table_id: env_or("BQ_DESTINATION_DETAILS_TABLE_ID", "destination_details"),
            weather_table_id: env_or("BQ_WEATHER_TABLE_ID", "weather_forecast"),
            raw_archive_dir: PathBuf::from(env_or("RAW_ARCHIVE_DIR", "./raw")),
            workspace_root: PathBuf::from(env_or("TDP_WORKSPACE_ROOT", ".")),
            sources_file: PathBuf::from(env_or("TDP_SOURCES_FILE", "sources.yaml")),
            user_agent: env_or("TDP_USER_AGENT", DEFAULT_USER_AGENT),
            http_timeout_secs: env_parsed("TDP_HTTP_TIMEOUT_SECS", 10),
            concurrency: env_parsed("TDP_CONCURRENCY", 4usize).max(1),
            rate_limit_ms: env_parsed("TDP_RATE_LIMIT_MS", 1000),
            max_retries: env_parsed("TDP_MAX_RETRIES", 2),
            wikipedia_base_url: env_or("WIKIPEDIA_BASE_URL", "https://en.wikipedia.org/wiki/"),
            weather_api_base_url: env_or("WEATHER_API_BASE_URL", "https://api.openweathermap.org"),
            weather_api_key: env_or("WEATHER_API_KEY", ""),
            forecast_days: env_parsed("FORECAST_DAYS", 2usize).clamp(1, 7),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn harvest_config(&self) -> HarvestConfig {
        HarvestConfig {
            concurrency: self.concurrency.max(1),
            min_interval: Duration::from_millis(self.rate_limit_ms),
            fetch: FetchConfig {
                timeout: Duration::from_secs(self.http_timeout_secs),
            },
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn destination_table(&self) -> TableRef {
        TableRef::new(&self.project_id, &self.dataset_id, &self.destination_table_id)
    }

    pub fn weather_table(&self) -> TableRef {
        TableRef::new(&self.project_id, &self.dataset_id, &self.weather_table_id)
    }

    /// Rejects table settings the loader could never write to.
    pub fn check_tables(&self) -> Result<()> {
        for table in [self.destination_table(), self.weather_table()] {
            table
                .physical_name()
                .with_context(|| format!("table {table} is not usable"))?;
        }
        Ok(())
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join(&self.sources_file)
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

/// Input lists for both pipelines.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceList {
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub locations: Vec<Location>,
}

impl Default for SourceList {
    fn default() -> Self {
        Self {
            destinations: [
                "Paris",
                "London",
                "New York City",
                "Tokyo",
                "Rome",
                "Barcelona",
                "Amsterdam",
                "Sydney",
                "Dubai",
                "Singapore",
                "Istanbul",
                "Prague",
                "Bangkok",
                "Cape Town",
                "Rio de Janeiro",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            locations: vec![
                Location::new("London", "UK", 51.5074, -0.1278),
                Location::new("Paris", "France", 48.8566, 2.3522),
                Location::new("New York", "USA", 40.7128, -74.0060),
                Location::new("Tokyo", "Japan", 35.6762, 139.6503),
                Location::new("Sydney", "Australia", -33.8688, 151.2093),
            ],
        }
    }
}

impl SourceList {
    /// Reads `path`, falling back to the built-in lists when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "sources file not found, using built-in lists");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let list: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        list.check()?;
        Ok(list)
    }

    fn check(&self) -> Result<()> {
        for loc in &self.locations {
            if let Err(msg) = loc.check_bounds() {
                bail!("location {}|{}: {msg}", loc.city, loc.country);
            }
        }
        Ok(())
    }

    pub fn destination_items(&self) -> Vec<SourceItem> {
        self.destinations
            .iter()
            .map(|name| SourceItem::destination(name.as_str()))
            .collect()
    }

    pub fn location_items(&self) -> Vec<SourceItem> {
        self.locations.iter().cloned().map(SourceItem::Location).collect()
    }
}
