//! Turns a captured DOM snapshot into a [`DomDocument`].
//!
//! Inline blobs are decoded, bare resource URLs are fetched through the shared
//! [`ResourceCache`], stylesheets are scanned for further URLs until nothing new
//! turns up, and nested frames are collected recursively and folded into the
//! parent document.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::ResourceCache;
use crate::css;
use crate::service::ResourceFetcher;
use crate::{DomDocument, Error, Resource, Result};

/// Inline resource captured by the snapshot script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobData {
    pub url: String,
    #[serde(rename = "type", default)]
    pub content_type: String,
    /// Base64-encoded content
    pub value: String,
}

/// A captured page or frame as produced by the in-browser snapshot script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomSnapshot {
    pub url: String,
    #[serde(rename = "cdt", default)]
    pub nodes: Vec<serde_json::Value>,
    #[serde(default)]
    pub blobs: Vec<BlobData>,
    #[serde(default)]
    pub resource_urls: Vec<String>,
    #[serde(default)]
    pub frames: Vec<DomSnapshot>,
}

type ResourceMap = BTreeMap<String, Arc<Resource>>;

/// Resolves every resource a snapshot references.
#[derive(Clone)]
pub struct DomCollector {
    fetcher: Arc<dyn ResourceFetcher>,
    cache: ResourceCache,
    max_frame_depth: usize,
    fetch_concurrency: usize,
}

impl DomCollector {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, cache: ResourceCache) -> Self {
        Self {
            fetcher,
            cache,
            max_frame_depth: 16,
            fetch_concurrency: 16,
        }
    }

    pub fn max_frame_depth(mut self, depth: usize) -> Self {
        self.max_frame_depth = depth;
        self
    }

    pub fn fetch_concurrency(mut self, limit: usize) -> Self {
        self.fetch_concurrency = limit.max(1);
        self
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Build the document for `snapshot`.
    ///
    /// Fails only when the page URL itself cannot be parsed; anything else
    /// that cannot be resolved is logged and left out.
    pub async fn collect(&self, snapshot: &DomSnapshot) -> Result<DomDocument> {
        let base = Url::parse(&snapshot.url).map_err(|e| Error::InvalidUrl(format!("{}: {}", snapshot.url, e)))?;
        let resources = self.collect_frame(snapshot, base.clone(), 0).await;
        debug!("collected {} with {} resources", base, resources.len());
        Ok(DomDocument::new(base.as_str(), snapshot.nodes.clone(), resources))
    }

    /// Resources of one frame and everything nested in it.
    fn collect_frame<'a>(&'a self, snapshot: &'a DomSnapshot, base: Url, depth: usize) -> BoxFuture<'a, ResourceMap> {
        async move {
            let mut resources = ResourceMap::new();

            for blob in &snapshot.blobs {
                let Some(url) = resolve(&base, &blob.url) else {
                    continue;
                };
                if let Some(resource) = self.cached(url.as_str()).await {
                    resources.insert(url.to_string(), resource);
                    continue;
                }
                match Resource::from_base64(url.as_str(), blob.content_type.as_str(), &blob.value) {
                    Ok(resource) => {
                        let resource = Arc::new(resource);
                        self.cache.insert_ready(Arc::clone(&resource));
                        resources.insert(url.to_string(), resource);
                    }
                    Err(err) => warn!("skipping blob: {}", err),
                }
            }

            let pending: Vec<Url> = snapshot
                .resource_urls
                .iter()
                .filter_map(|raw| resolve(&base, raw))
                .collect();
            let mut seen: HashSet<String> = resources.keys().cloned().collect();
            let mut to_scan: Vec<Arc<Resource>> = resources.values().cloned().collect();
            let mut pending: Vec<Url> = pending.into_iter().filter(|u| seen.insert(u.to_string())).collect();

            // Fetch, scan stylesheets, repeat until no new URL is discovered.
            loop {
                for fetched in self.fetch_all(std::mem::take(&mut pending)).await {
                    resources.insert(fetched.url().to_string(), Arc::clone(&fetched));
                    to_scan.push(fetched);
                }
                for sheet in to_scan.drain(..).filter(|r| r.is_stylesheet()) {
                    let Ok(sheet_url) = Url::parse(sheet.url()) else {
                        continue;
                    };
                    for raw in css::discover_urls(&sheet.text()) {
                        if let Some(url) = resolve(&sheet_url, &raw) {
                            if seen.insert(url.to_string()) {
                                pending.push(url);
                            }
                        }
                    }
                }
                if pending.is_empty() {
                    break;
                }
            }

            for frame in &snapshot.frames {
                if depth + 1 > self.max_frame_depth {
                    warn!("frame {} nested deeper than {}, skipped", frame.url, self.max_frame_depth);
                    continue;
                }
                let Some(frame_url) = resolve(&base, &frame.url) else {
                    continue;
                };
                let frame_resources = self.collect_frame(frame, frame_url.clone(), depth + 1).await;
                let frame_doc = DomDocument::new(frame_url.as_str(), frame.nodes.clone(), frame_resources);
                let frame_resource = Arc::new(frame_doc.as_resource());
                self.cache.insert_ready(Arc::clone(&frame_resource));

                for (url, resource) in frame_doc.resources() {
                    resources.entry(url.clone()).or_insert_with(|| Arc::clone(resource));
                }
                resources.insert(frame_url.to_string(), frame_resource);
            }

            resources
        }
        .boxed()
    }

    async fn cached(&self, url: &str) -> Option<Arc<Resource>> {
        match self.cache.get(url)?.await {
            Ok(resource) => Some(resource),
            Err(_) => {
                self.cache.evict_failed(url);
                None
            }
        }
    }

    /// Fetch every URL through the cache; failures are logged and dropped.
    async fn fetch_all(&self, urls: Vec<Url>) -> Vec<Arc<Resource>> {
        stream::iter(urls)
            .map(|url| {
                let fetcher = Arc::clone(&self.fetcher);
                let key = url.to_string();
                let fetch = self.cache.get_or_fetch(&key, move || async move { fetcher.fetch(&url).await }.boxed());
                async move { (key, fetch.await) }
            })
            .buffer_unordered(self.fetch_concurrency)
            .filter_map(|(key, outcome)| async move {
                match outcome {
                    Ok(resource) => Some(resource),
                    Err(err) => {
                        warn!("skipping resource {}: {}", key, err);
                        self.cache.evict_failed(&key);
                        None
                    }
                }
            })
            .collect()
            .await
    }
}

fn resolve(base: &Url, raw: &str) -> Option<Url> {
    match base.join(raw.trim()) {
        Ok(url) => Some(url),
        Err(err) => {
            warn!("skipping malformed URL {:?}: {}", raw, err);
            None
        }
    }
}
