//! The coordinator that advances many logical tests at once.
//!
//! Six stages (open, collect, upload, render, match, close) run under their
//! own concurrency caps. One tokio task owns every check task and logical
//! test and sweeps the stages every tick; callers talk to it over a command
//! channel.

pub mod session;
pub mod stage;
pub mod task;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{ResourceCache, UploadCache};
use crate::collector::{DomCollector, DomSnapshot};
use crate::render::{CheckSettings, RenderJob, RenderJobBuilder, RenderJobDriver, RenderOutcome};
use crate::service::{RenderingService, ResourceFetcher};
use crate::{DomDocument, Error, GridConfig, Resource, Result};

pub use session::{
    MatchData, MatchResult, RunningSession, SessionService, SessionStartInfo, StopInfo, TestResults,
};
pub use stage::StageService;
pub use task::{CheckEvent, CheckListener, CheckState, CheckTask, LogicalTest, OpenState, TestListener};

/// External collaborators and the shared caches.
#[derive(Clone)]
pub struct Services {
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub rendering: Arc<dyn RenderingService>,
    pub sessions: Arc<dyn SessionService>,
    pub resources: ResourceCache,
    pub uploads: UploadCache,
}

impl Services {
    pub fn new(
        fetcher: Arc<dyn ResourceFetcher>,
        rendering: Arc<dyn RenderingService>,
        sessions: Arc<dyn SessionService>,
    ) -> Self {
        Self {
            fetcher,
            rendering,
            sessions,
            resources: ResourceCache::new(),
            uploads: UploadCache::new(),
        }
    }
}

enum Command {
    OpenTest(LogicalTest),
    Check {
        snapshot_id: String,
        snapshot: DomSnapshot,
        settings: CheckSettings,
        steps: Vec<(String, String)>,
        listener: Arc<dyn CheckListener>,
    },
    CheckNative {
        capture_id: String,
        dom: Arc<DomDocument>,
        settings: CheckSettings,
        steps: Vec<(String, String)>,
        listener: Arc<dyn CheckListener>,
    },
    CloseTest {
        test_id: String,
        aborted: bool,
    },
}

/// Caller-side handle of one logical test.
#[derive(Clone)]
pub struct TestHandle {
    test_id: String,
    active: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
}

impl TestHandle {
    pub fn id(&self) -> &str {
        &self.test_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Close once every check of this test is terminal.
    pub fn close(&self) -> Result<()> {
        self.send_close(false)
    }

    /// Tear the test down. Outcomes still in flight for its checks are dropped
    /// without reaching their listeners.
    pub fn abort(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        self.send_close(true)
    }

    fn send_close(&self, aborted: bool) -> Result<()> {
        self.commands
            .send(Command::CloseTest {
                test_id: self.test_id.clone(),
                aborted,
            })
            .map_err(|_| Error::Cancelled("coordinator is not running".into()))
    }
}

/// Handle of the running coordinator task.
pub struct Coordinator {
    commands: mpsc::UnboundedSender<Command>,
    running: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<Error>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Spawn the coordinator on the current tokio runtime.
    pub fn start(config: GridConfig, services: Services) -> Result<Self> {
        config.validate()?;
        let (commands, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let fault = Arc::new(Mutex::new(None));
        let tick = Duration::from_millis(config.tick_ms);
        let sweep = Sweep::new(config, services);

        let handle = tokio::spawn(run_loop(sweep, rx, tick, Arc::clone(&running), Arc::clone(&fault)));
        Ok(Self {
            commands,
            running,
            fault,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Register a logical test; it is opened as soon as an open slot frees up.
    pub fn open_test(&self, start: SessionStartInfo, listener: Arc<dyn TestListener>) -> Result<TestHandle> {
        let test_id = uuid::Uuid::new_v4().to_string();
        let active = Arc::new(AtomicBool::new(true));
        let test = LogicalTest::new(test_id.clone(), start, Arc::clone(&active), listener);
        self.send(Command::OpenTest(test))?;
        Ok(TestHandle {
            test_id,
            active,
            commands: self.commands.clone(),
        })
    }

    /// Request one visual check of `snapshot` for each test. Returns the step
    /// id of each check, in test order.
    pub fn check(
        &self,
        snapshot: DomSnapshot,
        settings: CheckSettings,
        tests: &[&TestHandle],
        listener: Arc<dyn CheckListener>,
    ) -> Result<Vec<String>> {
        let (steps, step_ids) = new_steps(tests);
        self.send(Command::Check {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            snapshot,
            settings,
            steps,
            listener,
        })?;
        Ok(step_ids)
    }

    /// Request a check of a native-app capture. The capture is uploaded as
    /// one opaque resource; there is nothing to collect.
    pub fn check_native(
        &self,
        content: Vec<u8>,
        content_type: &str,
        settings: CheckSettings,
        tests: &[&TestHandle],
        listener: Arc<dyn CheckListener>,
    ) -> Result<Vec<String>> {
        let (steps, step_ids) = new_steps(tests);
        let dom = DomDocument::native(Resource::new("", content_type, content));
        self.send(Command::CheckNative {
            capture_id: uuid::Uuid::new_v4().to_string(),
            dom: Arc::new(dom),
            settings,
            steps,
            listener,
        })?;
        Ok(step_ids)
    }

    fn send(&self, command: Command) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Cancelled("coordinator is not running".into()));
        }
        self.commands
            .send(command)
            .map_err(|_| Error::Cancelled("coordinator is not running".into()))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop after the current sweep.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// The fault that halted the loop, if any.
    pub fn error(&self) -> Option<Error> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Wait for the loop task to exit.
    pub async fn join(&self) {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("coordinator task panicked: {}", err);
            }
        }
    }
}

/// Fresh step ids paired with their test ids, plus the step ids alone.
fn new_steps(tests: &[&TestHandle]) -> (Vec<(String, String)>, Vec<String>) {
    let steps: Vec<(String, String)> = tests
        .iter()
        .map(|t| (uuid::Uuid::new_v4().to_string(), t.test_id.clone()))
        .collect();
    let step_ids = steps.iter().map(|(step, _)| step.clone()).collect();
    (steps, step_ids)
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    mut sweep: Sweep,
    mut commands: mpsc::UnboundedReceiver<Command>,
    tick: Duration,
    running: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<Error>>>,
) {
    info!("coordinator started");
    while running.load(Ordering::SeqCst) {
        // a panicking listener halts the loop like any other fault
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| sweep.tick(&mut commands))).unwrap_or_else(|payload| {
            Err(Error::Other(format!("coordinator panicked: {}", panic_message(&*payload))))
        });
        if let Err(err) = outcome {
            error!("coordinator halted: {}", err);
            *fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
            break;
        }
        tokio::time::sleep(tick).await;
    }
    running.store(false, Ordering::SeqCst);
    info!("coordinator stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// A document waiting for its test to open before it can be rendered.
struct WaitingRender {
    dom: Arc<DomDocument>,
    step_id: String,
}

/// State owned by the coordinator loop.
struct Sweep {
    config: GridConfig,
    tests: HashMap<String, LogicalTest>,
    tasks: HashMap<String, CheckTask>,
    waiting: Vec<WaitingRender>,
    collect_steps: HashMap<String, Vec<String>>,
    upload_steps: HashMap<String, Vec<String>>,
    batch_steps: HashMap<String, Vec<String>>,
    open: StageService<SessionStartInfo, RunningSession>,
    collect: StageService<DomSnapshot, Arc<DomDocument>>,
    upload: StageService<Arc<DomDocument>, Arc<DomDocument>>,
    render: StageService<Vec<RenderJob>, Vec<RenderOutcome>>,
    matcher: StageService<(RunningSession, MatchData), MatchResult>,
    close: StageService<StopInfo, TestResults>,
}

impl Sweep {
    fn new(config: GridConfig, services: Services) -> Self {
        let collector = Arc::new(
            DomCollector::new(Arc::clone(&services.fetcher), services.resources.clone())
                .max_frame_depth(config.max_frame_depth)
                .fetch_concurrency(config.fetch_concurrency),
        );
        let driver = Arc::new(
            RenderJobDriver::new(
                Arc::clone(&services.rendering),
                services.resources.clone(),
                services.uploads.clone(),
            )
            .policy(config.retry)
            .force_put(config.force_put),
        );
        let sessions = services.sessions;

        let open = {
            let sessions = Arc::clone(&sessions);
            StageService::new("open", config.test_concurrency, move |start: SessionStartInfo| {
                let sessions = Arc::clone(&sessions);
                async move { sessions.open(&start).await }.boxed()
            })
            .holding_slots()
        };
        let collect = StageService::new("collect", config.collect_concurrency, move |snapshot: DomSnapshot| {
            let collector = Arc::clone(&collector);
            async move { collector.collect(&snapshot).await.map(Arc::new) }.boxed()
        });
        let upload = {
            let driver = Arc::clone(&driver);
            StageService::new("upload", config.upload_concurrency, move |dom: Arc<DomDocument>| {
                let driver = Arc::clone(&driver);
                async move {
                    driver.upload_document(&dom).await?;
                    Ok(dom)
                }
                .boxed()
            })
        };
        let render = StageService::new("render", config.render_concurrency, move |jobs: Vec<RenderJob>| {
            let driver = Arc::clone(&driver);
            async move { driver.drive(jobs).await }.boxed()
        });
        let matcher = {
            let sessions = Arc::clone(&sessions);
            StageService::new("match", config.match_concurrency, move |(session, data): (RunningSession, MatchData)| {
                let sessions = Arc::clone(&sessions);
                async move { sessions.match_window(&session, &data).await }.boxed()
            })
        };
        let close = StageService::new("close", config.close_concurrency, move |stop: StopInfo| {
            let sessions = Arc::clone(&sessions);
            async move { sessions.close(&stop).await }.boxed()
        });

        Self {
            config,
            tests: HashMap::new(),
            tasks: HashMap::new(),
            waiting: Vec::new(),
            collect_steps: HashMap::new(),
            upload_steps: HashMap::new(),
            batch_steps: HashMap::new(),
            open,
            collect,
            upload,
            render,
            matcher,
            close,
        }
    }

    fn tick(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Result<()> {
        while let Ok(command) = commands.try_recv() {
            self.handle_command(command)?;
        }
        self.prune_inactive();
        self.open_iteration();
        self.collect_iteration()?;
        self.upload_iteration()?;
        self.render_iteration()?;
        self.match_iteration()?;
        self.close_iteration();
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::OpenTest(test) => {
                debug!("test {} queued for open", test.test_id);
                self.open.add_input(test.test_id.clone(), test.start.clone());
                self.tests.insert(test.test_id.clone(), test);
            }
            Command::Check {
                snapshot_id,
                snapshot,
                settings,
                steps,
                listener,
            } => {
                let live = self.register_checks(steps, &settings, &listener);
                if !live.is_empty() {
                    self.collect.add_input(snapshot_id.clone(), snapshot);
                    self.collect_steps.insert(snapshot_id, live);
                }
            }
            Command::CheckNative {
                capture_id,
                dom,
                settings,
                steps,
                listener,
            } => {
                let live = self.register_checks(steps, &settings, &listener);
                let live = self.advance_steps(live, CheckEvent::Collected)?;
                if !live.is_empty() {
                    debug!("native capture {} queued for upload", capture_id);
                    self.upload.add_input(capture_id.clone(), dom);
                    self.upload_steps.insert(capture_id, live);
                }
            }
            Command::CloseTest { test_id, aborted } => match self.tests.get_mut(&test_id) {
                Some(test) => {
                    if test.close_requested.is_none() {
                        test.close_requested = Some(aborted);
                    } else if aborted {
                        test.close_requested = Some(true);
                    }
                }
                None => warn!("close requested for unknown test {}", test_id),
            },
        }
        Ok(())
    }

    /// Create one check task per step. Returns the steps that can proceed;
    /// the rest have already failed.
    fn register_checks(
        &mut self,
        steps: Vec<(String, String)>,
        settings: &CheckSettings,
        listener: &Arc<dyn CheckListener>,
    ) -> Vec<String> {
        let mut live = Vec::new();
        for (step_id, test_id) in steps {
            let mut task = CheckTask::new(step_id.clone(), test_id.clone(), settings.clone(), Arc::clone(listener));
            match self.tests.get_mut(&test_id) {
                None => task.fail(&Error::Session(format!("unknown test {}", test_id))),
                Some(test) if test.close_requested.is_some() => {
                    task.fail(&Error::Session(format!("test {} is closing", test_id)))
                }
                Some(test) => {
                    if let OpenState::Failed(err) = &test.open {
                        task.fail(err);
                    } else {
                        live.push(step_id.clone());
                    }
                    test.step_ids.push(step_id.clone());
                    self.tasks.insert(step_id, task);
                }
            }
        }
        live
    }

    /// Forget the unfinished checks of torn-down tests without notifying anyone.
    fn prune_inactive(&mut self) {
        let inactive: Vec<String> = self
            .tests
            .values()
            .filter(|t| !t.is_active())
            .flat_map(|t| t.step_ids.iter().cloned())
            .collect();
        for step_id in inactive {
            if self.tasks.get(&step_id).is_some_and(|t| !t.is_terminal()) {
                debug!("dropping check {} of inactive test", step_id);
                self.tasks.remove(&step_id);
            }
        }
        let tasks = &self.tasks;
        self.waiting.retain(|w| tasks.contains_key(&w.step_id));
    }

    /// True when `step_id` belongs to a live test and can still change state.
    fn is_live(&self, step_id: &str) -> bool {
        match self.tasks.get(step_id) {
            Some(task) if !task.is_terminal() => self.tests.get(&task.test_id).is_some_and(LogicalTest::is_active),
            _ => false,
        }
    }

    fn fail_steps(&mut self, step_ids: &[String], err: &Error) {
        for step_id in step_ids {
            if !self.is_live(step_id) {
                continue;
            }
            if let Some(task) = self.tasks.get_mut(step_id) {
                task.fail(err);
            }
        }
    }

    fn advance_steps(&mut self, step_ids: Vec<String>, event: CheckEvent) -> Result<Vec<String>> {
        let mut advanced = Vec::new();
        for step_id in step_ids {
            if !self.is_live(&step_id) {
                continue;
            }
            if let Some(task) = self.tasks.get_mut(&step_id) {
                task.advance(event)?;
                advanced.push(step_id);
            }
        }
        Ok(advanced)
    }

    fn open_iteration(&mut self) {
        let (opened, failed) = self.open.drain();
        for (test_id, session) in opened {
            let Some(test) = self.tests.get_mut(&test_id) else {
                continue;
            };
            debug!("test {} opened as session {}", test_id, session.id);
            if test.is_active() {
                test.listener.on_open(&test_id, &session);
            }
            test.open = OpenState::Open(session);
        }
        for (test_id, err) in failed {
            let Some(test) = self.tests.get_mut(&test_id) else {
                continue;
            };
            warn!("test {} failed to open: {}", test_id, err);
            if test.is_active() {
                test.listener.on_open_failed(&test_id, &err);
            }
            test.open = OpenState::Failed(err.clone());
            let steps = test.step_ids.clone();
            self.fail_steps(&steps, &err);
        }
        self.open.run();
    }

    fn collect_iteration(&mut self) -> Result<()> {
        let (collected, failed) = self.collect.drain();
        for (snapshot_id, dom) in collected {
            let steps = self.collect_steps.remove(&snapshot_id).unwrap_or_default();
            let live = self.advance_steps(steps, CheckEvent::Collected)?;
            if live.is_empty() {
                continue;
            }
            self.upload.add_input(snapshot_id.clone(), dom);
            self.upload_steps.insert(snapshot_id, live);
        }
        for (snapshot_id, err) in failed {
            warn!("collecting snapshot {} failed: {}", snapshot_id, err);
            let steps = self.collect_steps.remove(&snapshot_id).unwrap_or_default();
            self.fail_steps(&steps, &err);
        }
        self.collect.run();
        Ok(())
    }

    fn upload_iteration(&mut self) -> Result<()> {
        let (uploaded, failed) = self.upload.drain();
        for (snapshot_id, dom) in uploaded {
            let steps = self.upload_steps.remove(&snapshot_id).unwrap_or_default();
            for step_id in self.advance_steps(steps, CheckEvent::Uploaded)? {
                self.waiting.push(WaitingRender {
                    dom: Arc::clone(&dom),
                    step_id,
                });
            }
        }
        for (snapshot_id, err) in failed {
            warn!("uploading snapshot {} failed: {}", snapshot_id, err);
            let steps = self.upload_steps.remove(&snapshot_id).unwrap_or_default();
            self.fail_steps(&steps, &err);
        }
        self.upload.run();
        Ok(())
    }

    fn render_iteration(&mut self) -> Result<()> {
        let (rendered, failed) = self.render.drain();
        for (batch_id, outcomes) in rendered {
            self.batch_steps.remove(&batch_id);
            for outcome in outcomes {
                if !self.is_live(&outcome.step_id) {
                    continue;
                }
                match outcome.result {
                    Ok(render) => self.queue_match(&outcome.step_id, render)?,
                    Err(err) => self.fail_steps(&[outcome.step_id], &err),
                }
            }
        }
        for (batch_id, err) in failed {
            warn!("render batch {} failed: {}", batch_id, err);
            let steps = self.batch_steps.remove(&batch_id).unwrap_or_default();
            self.fail_steps(&steps, &err);
        }

        // Jobs whose test is open are grouped by document into batches;
        // the rest wait for the next tick.
        let mut batches: Vec<(Arc<DomDocument>, Vec<RenderJob>)> = Vec::new();
        let mut still_waiting = Vec::new();
        for waiting in std::mem::take(&mut self.waiting) {
            if !self.is_live(&waiting.step_id) {
                continue;
            }
            let Some(task) = self.tasks.get(&waiting.step_id) else {
                continue;
            };
            let Some(test) = self.tests.get(&task.test_id) else {
                continue;
            };
            if test.session().is_none() {
                still_waiting.push(waiting);
                continue;
            }
            let job = RenderJobBuilder::new(&waiting.dom, &task.settings)
                .agent_id(self.config.agent_id.clone())
                .results_url(self.config.results_url.clone())
                .stitching_service_url(self.config.stitching_service_url.clone())
                .renderer(test.session().and_then(|s| s.renderer.clone()))
                .build_one(&task.step_id, &task.test_id, &test.start.target);
            match batches.iter_mut().find(|(dom, _)| Arc::ptr_eq(dom, &waiting.dom)) {
                Some((_, jobs)) => jobs.push(job),
                None => batches.push((Arc::clone(&waiting.dom), vec![job])),
            }
        }
        self.waiting = still_waiting;

        for (_, jobs) in batches {
            let batch_id = uuid::Uuid::new_v4().to_string();
            debug!("render batch {} with {} jobs", batch_id, jobs.len());
            self.batch_steps
                .insert(batch_id.clone(), jobs.iter().map(|j| j.step_id.clone()).collect());
            self.render.add_input(batch_id, jobs);
        }
        self.render.run();
        Ok(())
    }

    fn queue_match(&mut self, step_id: &str, render: crate::render::RenderStatusResults) -> Result<()> {
        let Some(task) = self.tasks.get_mut(step_id) else {
            return Ok(());
        };
        task.advance(CheckEvent::Rendered)?;
        let session = self.tests.get(&task.test_id).and_then(LogicalTest::session).cloned();
        match session {
            Some(session) => {
                let data = MatchData {
                    step_id: task.step_id.clone(),
                    test_id: task.test_id.clone(),
                    name: task.settings.name.clone(),
                    render,
                };
                self.matcher.add_input(step_id, (session, data));
            }
            None => task.fail(&Error::Session(format!("test {} has no open session", task.test_id))),
        }
        Ok(())
    }

    fn match_iteration(&mut self) -> Result<()> {
        let (matched, failed) = self.matcher.drain();
        for (step_id, result) in matched {
            if !self.is_live(&step_id) {
                continue;
            }
            if let Some(task) = self.tasks.get_mut(&step_id) {
                task.complete(&result)?;
            }
        }
        for (step_id, err) in failed {
            self.fail_steps(&[step_id], &err);
        }
        self.matcher.run();
        Ok(())
    }

    fn close_iteration(&mut self) {
        let (closed, failed) = self.close.drain();
        for (test_id, results) in closed {
            if let Some(test) = self.finish_test(&test_id) {
                info!("test {} closed", test_id);
                test.listener.on_closed(&test_id, &results);
            }
        }
        for (test_id, err) in failed {
            if let Some(test) = self.finish_test(&test_id) {
                warn!("closing test {} failed: {}", test_id, err);
                test.listener.on_close_failed(&test_id, &err);
            }
        }

        let ready: Vec<String> = self
            .tests
            .values()
            .filter(|t| t.close_requested.is_some() && !t.closing && t.open != OpenState::Pending)
            .filter(|t| {
                t.step_ids
                    .iter()
                    .all(|s| self.tasks.get(s).map_or(true, CheckTask::is_terminal))
            })
            .map(|t| t.test_id.clone())
            .collect();
        for test_id in ready {
            let Some(test) = self.tests.get_mut(&test_id) else {
                continue;
            };
            test.closing = true;
            let aborted = test.close_requested.unwrap_or(false);
            match test.session().cloned() {
                Some(session) => {
                    debug!("closing test {}", test_id);
                    self.close.add_input(
                        test_id.clone(),
                        StopInfo {
                            test_id: test_id.clone(),
                            session,
                            aborted,
                        },
                    );
                }
                None => {
                    if let Some(test) = self.finish_test(&test_id) {
                        let err = Error::Session(format!("test {} was never opened", test_id));
                        warn!("{}", err);
                        test.listener.on_close_failed(&test_id, &err);
                    }
                }
            }
        }
        self.close.run();
    }

    /// Remove a test and its checks, releasing its open slot.
    fn finish_test(&mut self, test_id: &str) -> Option<LogicalTest> {
        let test = self.tests.remove(test_id)?;
        test.deactivate();
        for step_id in &test.step_ids {
            self.tasks.remove(step_id);
        }
        self.open.release_slot();
        Some(test)
    }
}
