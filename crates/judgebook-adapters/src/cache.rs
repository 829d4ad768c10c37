use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::AdapterError;

/// In-memory cache of parsed responses keyed by request URL. Adapters are
/// built per grading run, so entries never outlive a run.
#[derive(Debug)]
pub struct ResponseCache<V> {
    entries: Mutex<HashMap<String, Arc<V>>>,
}

impl<V> Default for ResponseCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> ResponseCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed fetches are not cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Arc<V>, AdapterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, AdapterError>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(hit) = entries.get(key) {
            debug!(key, "response cache hit");
            return Ok(Arc::clone(hit));
        }
        let value = Arc::new(fetch().await?);
        entries.insert(key.to_string(), Arc::clone(&value));
        Ok(value)
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
