//! Traits for the external collaborators the grid client talks to.
//!
//! The core only ever sees these traits; `crate::http` provides reqwest-backed
//! implementations and the tests provide in-memory ones.

use async_trait::async_trait;
use url::Url;

use crate::render::{RenderJob, RenderStatusResults, RunningRender};
use crate::{Resource, Result};

/// Downloads a page resource.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Resource>;
}

/// The remote rendering service.
#[async_trait]
pub trait RenderingService: Send + Sync {
    /// Submit a batch; the reply holds one running render per job, in order.
    async fn render(&self, jobs: &[RenderJob]) -> Result<Vec<RunningRender>>;

    /// Upload one resource, optionally on behalf of a running render.
    async fn put_resource(&self, render_id: Option<&str>, resource: &Resource) -> Result<()>;

    /// Current status for each id. `None` entries are renders the service
    /// cannot report on yet.
    async fn render_status(&self, render_ids: &[String]) -> Result<Vec<Option<RenderStatusResults>>>;
}
