use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, debug_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json<B: Serialize + ?Sized>(url: impl Into<String>, body: &B) -> Result<Self, FetchError> {
        let url = url.into();
        let body = serde_json::to_vec(body).map_err(|err| FetchError::Encode {
            url: url.clone(),
            message: err.to_string(),
        })?;
        Ok(Self {
            method: Method::Post,
            url,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|err| FetchError::Decode {
            url: self.final_url.clone(),
            message: err.to_string(),
        })
    }

    pub fn text(&self) -> Result<String, FetchError> {
        String::from_utf8(self.body.clone()).map_err(|err| FetchError::Decode {
            url: self.final_url.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("could not encode request body for {url}: {message}")]
    Encode { url: String, message: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            Self::Request { url, .. }
            | Self::HttpStatus { url, .. }
            | Self::Decode { url, .. }
            | Self::Encode { url, .. } => url,
        }
    }
}

/// Executes one request. Implementations must not retry or cache.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await.map_err(|source| FetchError::Request {
            url: request.url.clone(),
            source,
        })?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp
            .bytes()
            .await
            .map_err(|source| FetchError::Request {
                url: request.url.clone(),
                source,
            })?
            .to_vec();

        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub min_interval: Duration,
    pub jitter: Duration,
}

impl RateLimit {
    pub fn from_millis(min_interval_ms: u64, jitter_ms: u64) -> Self {
        Self {
            min_interval: Duration::from_millis(min_interval_ms),
            jitter: Duration::from_millis(jitter_ms),
        }
    }
}

/// Serializes calls to one data source and spaces them by at least
/// `min_interval`. One instance per platform.
pub struct RateLimitedFetcher {
    name: String,
    transport: Arc<dyn Transport>,
    limit: RateLimit,
    last_call: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for RateLimitedFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedFetcher")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl RateLimitedFetcher {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, limit: RateLimit) -> Self {
        Self {
            name: name.into(),
            transport,
            limit,
            last_call: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.limit
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.limit.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchedResponse, FetchError> {
        // held for the whole call so requests through one source never interleave
        let mut last_call = self.last_call.lock().await;

        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.limit.min_interval {
                let wait = self.limit.min_interval - elapsed + self.jitter();
                debug!(platform = %self.name, wait_ms = wait.as_millis() as u64, "rate limiter sleeping");
                tokio::time::sleep(wait).await;
            }
        }

        let span = debug_span!("fetch", platform = %self.name, url = %request.url);
        let result = self.transport.execute(&request).instrument(span).await;
        *last_call = Some(Instant::now());

        let response = result?;
        if !response.is_success() {
            return Err(FetchError::HttpStatus {
                status: response.status,
                url: request.url,
            });
        }
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        self.fetch(FetchRequest::get(url)).await?.json()
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        self.fetch(FetchRequest::get(url)).await?.text()
    }

    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.fetch(FetchRequest::post_json(url, body)?).await?.json()
    }
}
