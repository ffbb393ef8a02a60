//! RFox Render Grid client
//!
//! Turns a captured DOM snapshot into render jobs for a remote rendering
//! service, one per browser/device/viewport target, and tracks every job
//! until its visual check reaches a terminal result.
//!
//! # Layers
//!
//! - [`cache`]: process-wide single-flight stores for resource fetches and uploads
//! - [`collector`]: snapshot → [`DomDocument`] with every referenced resource resolved
//! - [`render`]: render-job building, submission, resource resolution and polling
//! - [`pipeline`]: the coordinator that advances many logical tests at once
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rfgrid::collector::{DomCollector, DomSnapshot};
//! use rfgrid::cache::ResourceCache;
//! use rfgrid::http::HttpResourceFetcher;
//! use rfgrid::GridConfig;
//!
//! # async fn run() -> rfgrid::Result<()> {
//! let config = GridConfig::default();
//! let fetcher = Arc::new(HttpResourceFetcher::new(&config)?);
//! let collector = DomCollector::new(fetcher, ResourceCache::new());
//! let snapshot: DomSnapshot = serde_json::from_str(r#"{"url":"https://example.com/"}"#)?;
//! let dom = collector.collect(&snapshot).await?;
//! println!("{} resources", dom.resources().len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{Error, Result};

pub mod cache;
pub mod collector;
pub mod css;
pub mod pipeline;
pub mod render;
pub mod resource;
pub mod service;

// reqwest-backed fetcher and rendering-service client
#[cfg(feature = "http")]
pub mod http;

pub use resource::{DomDocument, Resource};

/// Submissions that may fail in a row before the driver escalates.
pub const MAX_FETCH_FAILS: usize = 62;
/// Status polls per batch before pending renders are declared failed.
pub const MAX_POLL_ITERATIONS: usize = 30;
/// Backoff after a poll that returned nothing.
pub const POLL_EMPTY_BACKOFF: Duration = Duration::from_millis(500);
/// Backoff between polls while renders are still pending.
pub const POLL_BACKOFF: Duration = Duration::from_millis(1500);
/// Backoff after a failed batch submission.
pub const SUBMIT_BACKOFF: Duration = Duration::from_millis(1500);

/// Environment switch that forces every resource to be uploaded again.
pub const FORCE_PUT_ENV: &str = "RFGRID_FORCE_PUT";
/// Environment override for the number of simultaneously open tests.
pub const TEST_CONCURRENCY_ENV: &str = "RFGRID_TEST_CONCURRENCY";

/// Retry and backoff budget used by the render-job driver.
///
/// The defaults are the long-standing service constants; tests and callers
/// with different latency profiles may shrink them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_fetch_fails: usize,
    pub max_poll_iterations: usize,
    pub poll_empty_backoff: Duration,
    pub poll_backoff: Duration,
    pub submit_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_fetch_fails: MAX_FETCH_FAILS,
            max_poll_iterations: MAX_POLL_ITERATIONS,
            poll_empty_backoff: POLL_EMPTY_BACKOFF,
            poll_backoff: POLL_BACKOFF,
            submit_backoff: SUBMIT_BACKOFF,
        }
    }
}

/// Configuration for the grid client
///
/// Mirrors the knobs a rendering session needs: HTTP behaviour for resource
/// fetching, the per-stage concurrency caps of the pipeline, and the retry
/// policy of the render driver.
///
/// # Examples
///
/// ```
/// let cfg = rfgrid::GridConfig::default();
/// assert!(cfg.user_agent.contains("RFOX"));
/// assert_eq!(cfg.retry.max_poll_iterations, 30);
/// ```
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// User agent string sent when fetching page resources
    pub user_agent: String,
    /// Timeout for single HTTP requests in milliseconds
    pub timeout_ms: u64,
    /// Custom HTTP headers added to resource fetches
    pub headers: HashMap<String, String>,
    /// Identifier of this client, forwarded with every render job
    pub agent_id: String,
    /// Where the rendering service should post finished renders, if anywhere
    pub results_url: Option<String>,
    /// Stitching service the renderer should use for full-page captures
    pub stitching_service_url: Option<String>,
    /// Maximum number of logical tests open at the same time
    pub test_concurrency: usize,
    /// Parallel snapshot collections
    pub collect_concurrency: usize,
    /// Parallel document uploads
    pub upload_concurrency: usize,
    /// Parallel render batches
    pub render_concurrency: usize,
    /// Parallel match requests
    pub match_concurrency: usize,
    /// Parallel close requests
    pub close_concurrency: usize,
    /// Parallel resource fetches within one collection
    pub fetch_concurrency: usize,
    /// Upload every resource again even if an upload is cached
    pub force_put: bool,
    /// Deepest nested frame that is still collected
    pub max_frame_depth: usize,
    /// Idle sleep between coordinator sweeps in milliseconds
    pub tick_ms: u64,
    /// Render driver retry budget
    pub retry: RetryPolicy,
}

impl Default for GridConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/115.0 RFOX-grid/0.1"
                .to_string(),
            timeout_ms: 30000,
            headers: HashMap::new(),
            agent_id: format!("rfgrid/{}", env!("CARGO_PKG_VERSION")),
            results_url: None,
            stitching_service_url: None,
            test_concurrency: 5,
            collect_concurrency: cpus,
            upload_concurrency: cpus,
            render_concurrency: cpus * 2,
            match_concurrency: cpus * 2,
            close_concurrency: cpus,
            fetch_concurrency: cpus * 4,
            force_put: false,
            max_frame_depth: 16,
            tick_ms: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl GridConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(FORCE_PUT_ENV) {
            config.force_put = value.trim().eq_ignore_ascii_case("true");
        }
        if let Ok(value) = std::env::var(TEST_CONCURRENCY_ENV) {
            config.test_concurrency = value.trim().parse().map_err(|_| {
                Error::ConfigError(format!("{} must be a positive integer, got {:?}", TEST_CONCURRENCY_ENV, value))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject caps that would stall a pipeline stage forever.
    pub fn validate(&self) -> Result<()> {
        let caps = [
            ("test_concurrency", self.test_concurrency),
            ("collect_concurrency", self.collect_concurrency),
            ("upload_concurrency", self.upload_concurrency),
            ("render_concurrency", self.render_concurrency),
            ("match_concurrency", self.match_concurrency),
            ("close_concurrency", self.close_concurrency),
            ("fetch_concurrency", self.fetch_concurrency),
        ];
        for (name, value) in caps {
            if value == 0 {
                return Err(Error::ConfigError(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}
