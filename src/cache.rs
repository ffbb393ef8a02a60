//! Single-flight caches for resource fetches and resource uploads.
//!
//! Both caches map a key to a shared future. The first caller for a key
//! creates the future; every later caller clones the same handle and awaits
//! the same outcome, so a URL is never fetched twice at once and the same
//! content is never uploaded twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::{Resource, Result};

/// A pending or completed fetch of one resource.
pub type ResourceFuture = Shared<BoxFuture<'static, Result<Arc<Resource>>>>;
/// A pending or completed upload of one resource.
pub type UploadFuture = Shared<BoxFuture<'static, Result<()>>>;

/// URL → fetch future, shared by every collector and driver.
#[derive(Clone, Default)]
pub struct ResourceCache {
    entries: Arc<Mutex<HashMap<String, ResourceFuture>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ResourceFuture>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.lock().contains_key(url)
    }

    pub fn get(&self, url: &str) -> Option<ResourceFuture> {
        self.lock().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Return the future for `url`, creating it with `fetch` only if absent.
    ///
    /// `fetch` runs under the cache lock and must only build the future.
    pub fn get_or_fetch<F>(&self, url: &str, fetch: F) -> ResourceFuture
    where
        F: FnOnce() -> BoxFuture<'static, Result<Resource>>,
    {
        self.lock()
            .entry(url.to_string())
            .or_insert_with(|| fetch().map(|res| res.map(Arc::new)).boxed().shared())
            .clone()
    }

    /// Commit an already available resource. Returns false if the URL was present.
    pub fn insert_ready(&self, resource: Arc<Resource>) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(resource.url()) {
            return false;
        }
        let url = resource.url().to_string();
        entries.insert(url, futures::future::ready(Ok(resource)).boxed().shared());
        true
    }

    /// Drop the entry for `url` if its fetch completed with an error, so a
    /// later collection may try again.
    pub fn evict_failed(&self, url: &str) -> bool {
        let mut entries = self.lock();
        let failed = matches!(entries.get(url).and_then(|f| f.peek()), Some(Err(_)));
        if failed {
            entries.remove(url);
        }
        failed
    }
}

/// Upload cache key for `resource`.
///
/// Content at a URL can change between snapshots (a frame whose markup
/// changed keeps its address), so the key carries the content hash as well.
pub fn upload_key(resource: &Resource) -> String {
    format!("{}#sha256={}", resource.url(), resource.sha256())
}

/// [`upload_key`] → upload future, shared across render jobs.
#[derive(Clone, Default)]
pub struct UploadCache {
    entries: Arc<Mutex<HashMap<String, UploadFuture>>>,
}

impl UploadCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UploadFuture>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<UploadFuture> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Return the upload for `key`, starting one with `put` if none is cached
    /// or if `force` is set. A forced upload replaces the cached entry.
    pub fn get_or_put<F>(&self, key: &str, force: bool, put: F) -> UploadFuture
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>>,
    {
        let mut entries = self.lock();
        if !force {
            if let Some(existing) = entries.get(key) {
                return existing.clone();
            }
        }
        let future = put().shared();
        entries.insert(key.to_string(), future.clone());
        future
    }

    /// Drop the entry for `key` if its upload failed.
    pub fn evict_failed(&self, key: &str) -> bool {
        let mut entries = self.lock();
        let failed = matches!(entries.get(key).and_then(|f| f.peek()), Some(Err(_)));
        if failed {
            entries.remove(key);
        }
        failed
    }
}
