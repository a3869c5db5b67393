//! Source adapter contracts plus the Wikipedia and OpenWeather implementations.
//!
//! An adapter knows how to turn a [`SourceItem`] into a request and how to pull
//! best-effort fields out of a raw payload. Transport, timeouts and retries stay
//! outside the adapter so the same retrieval path serves every source.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tdp_core::{ItemError, RawCapture, SourceItem, TransportFailure};
use tdp_storage::{FetchError, HttpResponse, HttpSource, RetryDisposition, SourceRequest};
use tracing::Instrument;

pub mod openweather;
pub mod wikipedia;

pub use openweather::{extract_forecast, OpenWeatherAdapter};
pub use wikipedia::{extract_destination, guess_attraction_type, WikipediaAdapter};

pub const CRATE_NAME: &str = "tdp-adapters";

/// Per-source request construction and payload extraction.
///
/// `parse` never fails: missing or malformed fields come back as defaulted
/// values and the caller decides whether the record is still usable.
pub trait SourceAdapter: Send + Sync {
    type Parsed: Send + 'static;

    fn source_id(&self) -> &'static str;

    /// Object-store prefix for this source's raw captures.
    fn archive_prefix(&self) -> &'static str;

    fn request_for(&self, item: &SourceItem) -> Result<SourceRequest, ItemError>;

    fn parse(&self, item: &SourceItem, capture: &RawCapture) -> Self::Parsed;
}

#[derive(Debug, Clone, Copy)]
pub struct FetchConfig {
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fetched<P> {
    pub item: SourceItem,
    pub capture: RawCapture,
    pub parsed: P,
}

/// A failed attempt. `capture` is set when the source answered with a non-2xx status.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub item: SourceItem,
    pub error: ItemError,
    pub capture: Option<RawCapture>,
}

impl FetchFailure {
    fn new(item: &SourceItem, error: ItemError, capture: Option<RawCapture>) -> Self {
        Self {
            item: item.clone(),
            error,
            capture,
        }
    }
}

fn capture_from(item: &SourceItem, response: HttpResponse) -> RawCapture {
    RawCapture {
        source_item_id: item.id(),
        source_url: response.final_url,
        fetched_at: Utc::now(),
        http_status: response.status,
        content_type: response.content_type,
        payload: response.body,
        attempt: 0,
    }
}

fn item_error_from(err: FetchError, timeout: Duration) -> ItemError {
    match err {
        FetchError::Timeout => ItemError::Timeout {
            after_ms: timeout.as_millis() as u64,
        },
        FetchError::Request {
            message,
            disposition,
        } => ItemError::Transport(TransportFailure::Connection {
            message,
            retryable: disposition == RetryDisposition::Retryable,
        }),
    }
}

/// One stateless retrieval attempt for one item: request, bounded wait, capture, parse.
pub async fn fetch<A>(
    adapter: &A,
    http: &dyn HttpSource,
    item: &SourceItem,
    config: &FetchConfig,
) -> Result<Fetched<A::Parsed>, FetchFailure>
where
    A: SourceAdapter + ?Sized,
{
    let id = item.id();
    let span = tracing::info_span!("fetch_item", source = adapter.source_id(), source_item_id = %id);
    async {
        let request = adapter
            .request_for(item)
            .map_err(|err| FetchFailure::new(item, err, None))?;

        let response = match tokio::time::timeout(config.timeout, http.get(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(FetchFailure::new(
                    item,
                    item_error_from(err, config.timeout),
                    None,
                ))
            }
            Err(_) => {
                return Err(FetchFailure::new(
                    item,
                    ItemError::Timeout {
                        after_ms: config.timeout.as_millis() as u64,
                    },
                    None,
                ))
            }
        };

        let ok = response.is_success();
        let status = response.status;
        let capture = capture_from(item, response);
        if !ok {
            tracing::debug!(status, "non-success status");
            return Err(FetchFailure::new(
                item,
                ItemError::Transport(TransportFailure::Status(status)),
                Some(capture),
            ));
        }

        let parsed = adapter.parse(item, &capture);
        Ok(Fetched {
            item: item.clone(),
            capture,
            parsed,
        })
    }
    .instrument(span)
    .await
}

fn text_or_none(input: impl AsRef<str>) -> Option<String> {
    let trimmed = input.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Walks object keys and, where the current node is an array, numeric indices.
fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = match cur {
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => cur.get(*segment)?,
        };
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path)?.as_f64()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    json_at(value, path)?.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tdp_core::Location;

    struct Stub {
        status: u16,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Stub {
        fn new(status: u16) -> Self {
            Self {
                status,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpSource for Stub {
        async fn get(&self, request: &SourceRequest) -> Result<HttpResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(HttpResponse {
                status: self.status,
                final_url: request.url.clone(),
                content_type: "text/html; charset=UTF-8".to_string(),
                body: b"<html><body><div id=\"mw-content-text\"><div><p>A city.</p></div></div></body></html>"
                    .to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn success_returns_capture_and_parsed_fields() {
        let adapter = WikipediaAdapter::new("https://en.wikipedia.org/wiki");
        let http = Stub::new(200);
        let item = SourceItem::destination("New York City");
        let fetched = fetch(&adapter, &http, &item, &FetchConfig::default())
            .await
            .expect("fetch");
        assert_eq!(fetched.capture.source_item_id, "New York City");
        assert_eq!(
            fetched.capture.source_url,
            "https://en.wikipedia.org/wiki/New_York_City"
        );
        assert_eq!(fetched.parsed.description.value, "A city.");
        assert!(fetched.parsed.climate.defaulted);
    }

    #[tokio::test]
    async fn non_success_status_keeps_capture() {
        let adapter = WikipediaAdapter::new("https://en.wikipedia.org/wiki");
        let http = Stub::new(404);
        let item = SourceItem::destination("InvalidPage");
        let failure = fetch(&adapter, &http, &item, &FetchConfig::default())
            .await
            .expect_err("404 is a failure");
        assert_eq!(failure.error.to_string(), "TransportError:404");
        assert_eq!(failure.capture.map(|c| c.http_status), Some(404));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out_without_capture() {
        let adapter = WikipediaAdapter::new("https://en.wikipedia.org/wiki");
        let http = Stub {
            delay: Duration::from_secs(30),
            ..Stub::new(200)
        };
        let config = FetchConfig {
            timeout: Duration::from_secs(2),
        };
        let failure = fetch(&adapter, &http, &SourceItem::destination("Rome"), &config)
            .await
            .expect_err("must time out");
        assert_eq!(failure.error, ItemError::Timeout { after_ms: 2000 });
        assert!(failure.capture.is_none());
        assert!(failure.error.is_retryable());
    }

    #[tokio::test]
    async fn mismatched_item_kind_is_rejected_before_any_request() {
        let adapter = WikipediaAdapter::new("https://en.wikipedia.org/wiki");
        let http = Stub::new(200);
        let item = SourceItem::Location(Location::new("London", "UK", 51.5, -0.12));
        let failure = fetch(&adapter, &http, &item, &FetchConfig::default())
            .await
            .expect_err("wrong item kind");
        assert!(matches!(failure.error, ItemError::Validation { .. }));
        assert_eq!(http.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn json_paths_walk_arrays_by_index() {
        let value: JsonValue =
            serde_json::from_str(r#"{"daily":[{"weather":[{"main":"Rain"}],"dt":1714564800}]}"#)
                .expect("json");
        assert_eq!(json_str(&value, &["daily", "0", "weather", "0", "main"]), Some("Rain"));
        assert_eq!(json_i64(&value, &["daily", "0", "dt"]), Some(1714564800));
        assert_eq!(json_f64(&value, &["daily", "1", "dt"]), None);
    }
}
