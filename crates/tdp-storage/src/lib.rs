//! Raw payload archival, HTTP transport and request pacing for the ingestion pipelines.

mod archive;
mod http;
mod rate_limit;

pub use archive::{
    raw_object_path, sanitize_object_segment, BlobStore, FsBlobStore, RawArchiver,
    StorageError, StorageLocation,
};
pub use http::{
    classify_reqwest_error, BackoffPolicy, FetchError, HttpClientConfig, HttpResponse,
    HttpSource, ReqwestSource, RetryDisposition, SourceRequest,
};
pub use rate_limit::RateLimiter;

pub const CRATE_NAME: &str = "tdp-storage";
