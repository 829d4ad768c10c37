use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use judgebook_core::{ContestCreditPolicy, CourseCalendar, GradingWindow};
use judgebook_storage::{
    FetchError, FetchRequest, FetchedResponse, RankingCacheStore, RateLimit, RateLimitedFetcher, Transport,
};

use crate::AdapterDeps;

/// Serves canned bodies by exact URL; anything else is a 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, (u16, String)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(self: &Arc<Self>, url: &str, body: impl Into<String>) -> Arc<Self> {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (200, body.into()));
        Arc::clone(self)
    }

    pub fn fail(self: &Arc<Self>, url: &str, status: u16) -> Arc<Self> {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, String::new()));
        Arc::clone(self)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == url).count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        self.calls.lock().unwrap().push(request.url.clone());
        let (status, body) = self
            .routes
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or((404, String::new()));
        Ok(FetchedResponse {
            status,
            final_url: request.url.clone(),
            body: body.into_bytes(),
        })
    }
}

pub fn deps_with(transport: Arc<ScriptedTransport>) -> AdapterDeps {
    deps_with_cache(transport, &std::env::temp_dir().join("judgebook-adapter-tests"))
}

pub fn deps_with_cache(transport: Arc<ScriptedTransport>, cache_root: &Path) -> AdapterDeps {
    AdapterDeps {
        fetcher: Arc::new(RateLimitedFetcher::new("test", transport, RateLimit::default())),
        policy: ContestCreditPolicy::Overlap,
        cache: RankingCacheStore::new(cache_root),
    }
}

/// Week `n` of a course starting 2022-01-15 00:00 EST.
pub fn week(n: u32) -> GradingWindow {
    let start = DateTime::parse_from_rfc3339("2022-01-15T00:00:00-05:00").expect("ts");
    CourseCalendar::new(start, 14)
        .expect("calendar")
        .week(n)
        .expect("week")
}
