//! In-memory stand-ins for the external services.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use rfgrid::pipeline::{
    CheckListener, MatchData, MatchResult, RunningSession, SessionService, SessionStartInfo, StopInfo,
    TestListener, TestResults,
};
use rfgrid::render::{PlatformType, RenderJob, RenderStatus, RenderStatusResults, RunningRender};
use rfgrid::service::{RenderingService, ResourceFetcher};
use rfgrid::{Error, Resource, Result, RetryPolicy};

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_fetch_fails: 62,
        max_poll_iterations: 30,
        poll_empty_backoff: Duration::from_millis(1),
        poll_backoff: Duration::from_millis(1),
        submit_backoff: Duration::from_millis(1),
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Serves canned bodies and counts fetches per URL.
#[derive(Default)]
pub struct FakeFetcher {
    bodies: Mutex<HashMap<String, (String, Vec<u8>)>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn serve(self, url: &str, content_type: &str, body: &str) -> Self {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), (content_type.to_string(), body.as_bytes().to_vec()));
        self
    }

    pub fn add(&self, url: &str, content_type: &str, body: &str) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), (content_type.to_string(), body.as_bytes().to_vec()));
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ResourceFetcher for FakeFetcher {
    async fn fetch(&self, url: &Url) -> Result<Resource> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let body = self.bodies.lock().unwrap().get(url.as_str()).cloned();
        match body {
            Some((content_type, content)) => Ok(Resource::new(url.as_str(), content_type, content)),
            None => Err(Error::Fetch {
                url: url.to_string(),
                message: "HTTP 404 Not Found".into(),
            }),
        }
    }
}

/// A rendering service that asks for every resource it has not stored yet.
///
/// Render ids are `r-<step id>`. Steps listed in `stuck` never finish;
/// steps in `broken` and renders of pages in `broken_pages` end in error.
#[derive(Default)]
pub struct FakeRenderer {
    stored: Mutex<HashSet<String>>,
    pub puts: Mutex<Vec<String>>,
    pub batches: Mutex<Vec<usize>>,
    pub status_calls: AtomicUsize,
    pub stuck: Mutex<HashSet<String>>,
    pub broken: Mutex<HashSet<String>>,
    /// Page URLs whose renders end in error.
    pub broken_pages: Mutex<HashSet<String>>,
    pages: Mutex<HashMap<String, String>>,
    pub empty_replies: AtomicUsize,
    pub failing_submissions: AtomicUsize,
    /// Zero-based submission calls that fail.
    pub failing_calls: Mutex<HashSet<usize>>,
    pub submit_calls: AtomicUsize,
    /// URLs reported as needed even though no document contains them.
    pub phantom: Mutex<Vec<String>>,
    /// Steps whose status always comes back as `null`.
    pub unready: Mutex<HashSet<String>>,
    /// Submissions that ask for the document whether it is stored or not.
    pub demand_dom_rounds: AtomicUsize,
    pub platforms: Mutex<Vec<PlatformType>>,
    pub renderers: Mutex<Vec<Option<String>>>,
}

impl FakeRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self, url: &str) -> usize {
        self.puts.lock().unwrap().iter().filter(|u| u.as_str() == url).count()
    }
}

#[async_trait]
impl RenderingService for FakeRenderer {
    async fn render(&self, jobs: &[RenderJob]) -> Result<Vec<RunningRender>> {
        let call = self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_calls.lock().unwrap().contains(&call) {
            return Err(Error::Service("HTTP 502 Bad Gateway".into()));
        }
        if self
            .failing_submissions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Service("HTTP 503 Service Unavailable".into()));
        }
        self.batches.lock().unwrap().push(jobs.len());
        {
            let mut pages = self.pages.lock().unwrap();
            for job in jobs {
                pages.insert(format!("r-{}", job.step_id), job.page_url().to_string());
                self.platforms.lock().unwrap().push(job.platform_type);
                self.renderers.lock().unwrap().push(job.renderer.clone());
            }
        }
        let demand_dom = self
            .demand_dom_rounds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let stored = self.stored.lock().unwrap();
        let phantom = self.phantom.lock().unwrap().clone();
        Ok(jobs
            .iter()
            .map(|job| {
                let mut missing: Vec<String> = job
                    .dom
                    .resources()
                    .values()
                    .filter(|r| !stored.contains(r.sha256()))
                    .map(|r| r.url().to_string())
                    .collect();
                missing.extend(phantom.iter().cloned());
                let need_dom = demand_dom || !stored.contains(job.dom.as_resource().sha256());
                RunningRender {
                    render_id: format!("r-{}", job.step_id),
                    render_status: if missing.is_empty() {
                        RenderStatus::Rendering
                    } else {
                        RenderStatus::NeedMoreResource
                    },
                    need_more_resources: missing,
                    need_more_dom: need_dom,
                }
            })
            .collect())
    }

    async fn put_resource(&self, _render_id: Option<&str>, resource: &Resource) -> Result<()> {
        self.puts.lock().unwrap().push(resource.url().to_string());
        self.stored.lock().unwrap().insert(resource.sha256().to_string());
        Ok(())
    }

    async fn render_status(&self, render_ids: &[String]) -> Result<Vec<Option<RenderStatusResults>>> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .empty_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(Vec::new());
        }
        let stuck = self.stuck.lock().unwrap();
        let unready = self.unready.lock().unwrap();
        let broken = self.broken.lock().unwrap();
        let broken_pages = self.broken_pages.lock().unwrap();
        let pages = self.pages.lock().unwrap();
        Ok(render_ids
            .iter()
            .map(|id| {
                let step = id.trim_start_matches("r-");
                if unready.contains(step) {
                    return None;
                }
                let mut result = RenderStatusResults {
                    render_id: Some(id.clone()),
                    ..Default::default()
                };
                if stuck.contains(step) {
                    result.status = Some(RenderStatus::Rendering);
                } else if broken.contains(step) || pages.get(id).is_some_and(|p| broken_pages.contains(p)) {
                    result.status = Some(RenderStatus::Error);
                    result.error = Some("page crashed".into());
                } else {
                    result.status = Some(RenderStatus::Rendered);
                    result.image_location = Some(format!("https://img.test/{}.png", id));
                }
                Some(result)
            })
            .collect())
    }
}

/// Session service whose match latency is the check name in milliseconds.
#[derive(Default)]
pub struct FakeSessions {
    pub fail_open: Mutex<HashSet<String>>,
    pub open_delay: Mutex<Option<Duration>>,
    pub opened: Mutex<Vec<String>>,
    pub matches_started: AtomicUsize,
    pub closes: Mutex<Vec<(String, bool)>>,
}

impl FakeSessions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionService for FakeSessions {
    async fn open(&self, start: &SessionStartInfo) -> Result<RunningSession> {
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_open.lock().unwrap().contains(&start.test_name) {
            return Err(Error::Session(format!("cannot open {}", start.test_name)));
        }
        self.opened.lock().unwrap().push(start.test_name.clone());
        Ok(RunningSession {
            id: format!("session-{}", start.test_name),
            url: None,
            is_new: true,
            renderer: Some(format!("renderer-{}", start.test_name)),
        })
    }

    async fn match_window(&self, _session: &RunningSession, data: &MatchData) -> Result<MatchResult> {
        self.matches_started.fetch_add(1, Ordering::SeqCst);
        let delay = data.name.as_deref().and_then(|n| n.parse::<u64>().ok()).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(MatchResult {
            as_expected: data.render.image_location.is_some(),
            window_id: Some(data.step_id.clone()),
        })
    }

    async fn close(&self, stop: &StopInfo) -> Result<TestResults> {
        self.closes.lock().unwrap().push((stop.test_id.clone(), stop.aborted));
        Ok(TestResults {
            session_id: stop.session.id.clone(),
            aborted: stop.aborted,
            ..Default::default()
        })
    }
}

/// Records every callback in arrival order.
#[derive(Default)]
pub struct Journal {
    pub events: Mutex<Vec<String>>,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl CheckListener for Journal {
    fn on_complete(&self, step_id: &str, _result: &MatchResult) {
        self.push(format!("check-ok:{}", step_id));
    }

    fn on_fail(&self, step_id: &str, error: &Error) {
        self.push(format!("check-fail:{}:{}", step_id, error));
    }
}

impl TestListener for Journal {
    fn on_open(&self, test_id: &str, _session: &RunningSession) {
        self.push(format!("open:{}", test_id));
    }

    fn on_open_failed(&self, test_id: &str, _error: &Error) {
        self.push(format!("open-fail:{}", test_id));
    }

    fn on_closed(&self, test_id: &str, _results: &TestResults) {
        self.push(format!("closed:{}", test_id));
    }

    fn on_close_failed(&self, test_id: &str, _error: &Error) {
        self.push(format!("close-fail:{}", test_id));
    }
}
