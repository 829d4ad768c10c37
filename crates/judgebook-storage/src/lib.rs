//! Rate-limited fetching, the append-only grading event log and the
//! write-once pre-processing cache for judgebook.

pub mod cache;
pub mod event_log;
pub mod fetch;

pub use cache::{CacheError, RankingCacheStore, StoredArtifact};
pub use event_log::{archive_path, log_path, read_events, EventLog, EventLogError, RegradePolicy};
pub use fetch::{
    FetchError, FetchRequest, FetchedResponse, HttpClientConfig, HttpTransport, Method, RateLimit,
    RateLimitedFetcher, Transport,
};

pub const CRATE_NAME: &str = "judgebook-storage";
