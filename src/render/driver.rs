//! Drives one batch of render jobs to a terminal status.
//!
//! A batch is submitted, resources the service reports missing are uploaded
//! and the batch is resubmitted until no render is waiting on input. The
//! resulting render ids are then polled until each one is rendered, failed,
//! or out of polling budget.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{self, FutureExt};
use log::{debug, warn};

use super::{RenderJob, RenderStatus, RenderStatusResults, RunningRender};
use crate::cache::{upload_key, ResourceCache, UploadCache, UploadFuture};
use crate::service::RenderingService;
use crate::{DomDocument, Error, Resource, Result, RetryPolicy};

/// Terminal outcome of one job of a batch.
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub step_id: String,
    pub render_id: Option<String>,
    pub result: Result<RenderStatusResults>,
}

/// Most severe status across a batch.
///
/// Scanning starts from the first render. `Error` wins outright;
/// `NeedMoreResource` replaces a worst status that is still rendering or
/// already rendered.
pub fn worst_status(renders: &[RunningRender]) -> Option<RenderStatus> {
    let mut renders = renders.iter();
    let mut worst = renders.next()?.render_status;
    if worst == RenderStatus::Error {
        return Some(worst);
    }
    for render in renders {
        match render.render_status {
            RenderStatus::Error => return Some(RenderStatus::Error),
            RenderStatus::NeedMoreResource
                if matches!(worst, RenderStatus::Rendered | RenderStatus::Rendering) =>
            {
                worst = RenderStatus::NeedMoreResource;
            }
            _ => {}
        }
    }
    Some(worst)
}

pub struct RenderJobDriver {
    service: Arc<dyn RenderingService>,
    resources: ResourceCache,
    uploads: UploadCache,
    policy: RetryPolicy,
    force_put: bool,
}

impl RenderJobDriver {
    pub fn new(service: Arc<dyn RenderingService>, resources: ResourceCache, uploads: UploadCache) -> Self {
        Self {
            service,
            resources,
            uploads,
            policy: RetryPolicy::default(),
            force_put: false,
        }
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Upload every document resource after each submission, ignoring
    /// previously completed uploads.
    pub fn force_put(mut self, force_put: bool) -> Self {
        self.force_put = force_put;
        self
    }

    /// Submit, resolve and poll one batch. Jobs must come from one document.
    ///
    /// Errors are returned only for failures of the whole batch; per-render
    /// failures come back as outcomes.
    pub async fn drive(&self, mut jobs: Vec<RenderJob>) -> Result<Vec<RenderOutcome>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        self.submit(&mut jobs).await?;
        Ok(self.poll(&jobs).await)
    }

    /// Put a document and all of its resources ahead of rendering.
    pub async fn upload_document(&self, dom: &Arc<DomDocument>) -> Result<()> {
        let mut uploads = vec![self.put_dom(dom, None, self.force_put)];
        for resource in dom.resources().values() {
            uploads.push(self.put(None, Arc::clone(resource), self.force_put));
        }
        self.await_uploads(uploads).await
    }

    async fn submit(&self, jobs: &mut [RenderJob]) -> Result<Vec<RunningRender>> {
        let mut fails = 0usize;
        let mut rounds = 0usize;
        let mut escalated = false;
        let mut dom_sent = false;
        let mut last: Option<Vec<RunningRender>> = None;

        loop {
            let err = match self.service.render(jobs).await {
                Ok(renders) if renders.len() == jobs.len() => {
                    fails = 0;
                    for (job, render) in jobs.iter_mut().zip(&renders) {
                        job.render_id = Some(render.render_id.clone());
                    }
                    if self.force_put {
                        self.put_everything(jobs, &renders).await?;
                    }

                    let worst = worst_status(&renders);
                    let needs_dom = renders.iter().any(RunningRender::needs_dom);
                    if worst != Some(RenderStatus::NeedMoreResource) && !needs_dom {
                        debug!("batch of {} submitted, worst status {:?}", renders.len(), worst);
                        return Ok(renders);
                    }

                    rounds += 1;
                    if rounds > 1 {
                        warn!("Second request, yet still some resources were not PUT (round {})", rounds);
                    }
                    if rounds > self.policy.max_fetch_fails {
                        return Err(Error::Submission(format!(
                            "resources still missing after {} resolution rounds",
                            rounds - 1
                        )));
                    }
                    let put_dom = needs_dom && !dom_sent;
                    self.send_missing(jobs, &renders, put_dom, false).await?;
                    dom_sent |= put_dom;
                    last = Some(renders);
                    continue;
                }
                Ok(renders) => Error::Submission(format!(
                    "expected {} running renders, got {}",
                    jobs.len(),
                    renders.len()
                )),
                Err(err) => err,
            };

            fails += 1;
            warn!("render submission failed ({} in a row): {}", fails, err);
            if fails > self.policy.max_fetch_fails {
                match last.take() {
                    Some(renders) if !escalated => {
                        escalated = true;
                        fails = 0;
                        let put_dom = !dom_sent && renders.iter().any(RunningRender::needs_dom);
                        self.send_missing(jobs, &renders, put_dom, true).await?;
                        dom_sent |= put_dom;
                        continue;
                    }
                    _ => return Err(Error::Submission(err.to_string())),
                }
            }
            tokio::time::sleep(self.policy.submit_backoff).await;
        }
    }

    /// Upload what the service asked for: the document when `put_dom` is set
    /// and every URL listed as needed.
    async fn send_missing(
        &self,
        jobs: &[RenderJob],
        renders: &[RunningRender],
        put_dom: bool,
        force: bool,
    ) -> Result<()> {
        let render_id = renders.first().map(|r| r.render_id.clone());
        let mut uploads = Vec::new();
        if put_dom {
            // asked for explicitly, so a cached upload does not count
            uploads.push(self.put_dom(&jobs[0].dom, render_id.clone(), true));
        }

        let mut seen = HashSet::new();
        for (job, render) in jobs.iter().zip(renders) {
            for url in &render.need_more_resources {
                if !seen.insert(url.as_str()) {
                    continue;
                }
                let resource = self.resolve(&job.dom, url).await?;
                uploads.push(self.put(render_id.clone(), resource, force || self.force_put));
            }
        }
        debug!("uploading {} missing resources", uploads.len());
        self.await_uploads(uploads).await
    }

    async fn put_everything(&self, jobs: &[RenderJob], renders: &[RunningRender]) -> Result<()> {
        let render_id = renders.first().map(|r| r.render_id.clone());
        let dom = &jobs[0].dom;
        let mut uploads = vec![self.put_dom(dom, render_id.clone(), true)];
        for resource in dom.resources().values() {
            uploads.push(self.put(render_id.clone(), Arc::clone(resource), true));
        }
        self.await_uploads(uploads).await
    }

    async fn resolve(&self, dom: &DomDocument, url: &str) -> Result<Arc<Resource>> {
        if let Some(resource) = dom.resource(url) {
            return Ok(Arc::clone(resource));
        }
        match self.resources.get(url) {
            Some(fetch) => fetch.await,
            None => Err(Error::ResourceResolution(url.to_string())),
        }
    }

    fn put_dom(&self, dom: &DomDocument, render_id: Option<String>, force: bool) -> (String, UploadFuture) {
        let resource = Arc::new(dom.as_resource());
        let key = format!("dom:{}", resource.sha256());
        self.put_keyed(key, render_id, resource, force)
    }

    fn put(&self, render_id: Option<String>, resource: Arc<Resource>, force: bool) -> (String, UploadFuture) {
        let key = upload_key(&resource);
        self.put_keyed(key, render_id, resource, force)
    }

    fn put_keyed(
        &self,
        key: String,
        render_id: Option<String>,
        resource: Arc<Resource>,
        force: bool,
    ) -> (String, UploadFuture) {
        let service = Arc::clone(&self.service);
        let upload = self.uploads.get_or_put(&key, force, move || {
            async move {
                service
                    .put_resource(render_id.as_deref(), &resource)
                    .await
                    .map_err(|err| match err {
                        Error::Upload { .. } => err,
                        other => Error::Upload {
                            url: resource.url().to_string(),
                            message: other.to_string(),
                        },
                    })
            }
            .boxed()
        });
        (key, upload)
    }

    async fn await_uploads(&self, uploads: Vec<(String, UploadFuture)>) -> Result<()> {
        let (keys, futures): (Vec<_>, Vec<_>) = uploads.into_iter().unzip();
        let results = future::join_all(futures).await;
        let mut first_err = None;
        for (key, result) in keys.iter().zip(results) {
            if let Err(err) = result {
                self.uploads.evict_failed(key);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn poll(&self, jobs: &[RenderJob]) -> Vec<RenderOutcome> {
        let mut results: Vec<Option<Result<RenderStatusResults>>> = vec![None; jobs.len()];
        let mut pending: Vec<(usize, String)> = Vec::new();
        for (index, job) in jobs.iter().enumerate() {
            match &job.render_id {
                Some(id) => pending.push((index, id.clone())),
                None => results[index] = Some(Err(Error::Submission("render was never assigned an id".into()))),
            }
        }

        let mut iterations = 0usize;
        let mut faults = 0usize;
        while !pending.is_empty() && iterations < self.policy.max_poll_iterations {
            let ids: Vec<String> = pending.iter().map(|(_, id)| id.clone()).collect();
            let statuses = match self.service.render_status(&ids).await {
                Ok(statuses) if statuses.iter().any(Option::is_some) => {
                    faults = 0;
                    statuses
                }
                outcome => {
                    faults += 1;
                    match outcome {
                        Err(err) => warn!("render status request failed: {}", err),
                        Ok(_) => debug!("render status not available yet for {} renders", ids.len()),
                    }
                    if faults > self.policy.max_fetch_fails {
                        warn!("giving up on render status after {} empty replies", faults);
                        break;
                    }
                    tokio::time::sleep(self.policy.poll_empty_backoff).await;
                    continue;
                }
            };
            iterations += 1;

            let mut by_id: HashMap<String, RenderStatusResults> = HashMap::new();
            for (requested, status) in ids.iter().zip(statuses) {
                if let Some(status) = status {
                    let key = status.render_id.clone().unwrap_or_else(|| requested.clone());
                    by_id.insert(key, status);
                }
            }

            pending.retain(|(index, id)| {
                let Some(status) = by_id.remove(id) else {
                    return true;
                };
                match status.status {
                    Some(RenderStatus::Rendered) => {
                        results[*index] = Some(Ok(status));
                        false
                    }
                    Some(RenderStatus::Error) => {
                        let message = status.error.clone().unwrap_or_else(|| "render failed".to_string());
                        warn!("render {} failed: {}", id, message);
                        results[*index] = Some(Err(Error::RenderFailed {
                            render_id: id.clone(),
                            message,
                        }));
                        false
                    }
                    _ => true,
                }
            });

            if !pending.is_empty() && iterations < self.policy.max_poll_iterations {
                tokio::time::sleep(self.policy.poll_backoff).await;
            }
        }

        for (index, id) in pending {
            warn!("render {} still pending after {} polls", id, iterations);
            results[index] = Some(Err(Error::render_timeout(&id)));
        }

        jobs.iter()
            .zip(results)
            .map(|(job, result)| RenderOutcome {
                step_id: job.step_id.clone(),
                render_id: job.render_id.clone(),
                result: result.unwrap_or_else(|| Err(Error::render_timeout(job.render_id.as_deref().unwrap_or("")))),
            })
            .collect()
    }
}
