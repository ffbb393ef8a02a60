//! Check tasks, logical tests, and the callbacks that report on them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use super::session::{MatchResult, RunningSession, SessionStartInfo, TestResults};
use crate::render::CheckSettings;
use crate::{Error, Result};

/// Receives the terminal outcome of a check task.
pub trait CheckListener: Send + Sync {
    fn on_complete(&self, step_id: &str, result: &MatchResult);
    fn on_fail(&self, step_id: &str, error: &Error);
}

/// Receives lifecycle events of a logical test.
pub trait TestListener: Send + Sync {
    fn on_open(&self, _test_id: &str, _session: &RunningSession) {}
    fn on_open_failed(&self, _test_id: &str, _error: &Error) {}
    fn on_closed(&self, test_id: &str, results: &TestResults);
    fn on_close_failed(&self, test_id: &str, error: &Error);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckState {
    CollectingResources,
    UploadingDom,
    Rendering,
    Matching,
    Done,
    Failed,
}

impl CheckState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckState::Done | CheckState::Failed)
    }

    /// The transition table. `None` marks an edge the machine does not have.
    pub fn next(self, event: CheckEvent) -> Option<CheckState> {
        use CheckEvent as E;
        use CheckState as S;
        match (self, event) {
            (S::Done | S::Failed, _) => Some(self),
            (_, E::Failed) => Some(S::Failed),
            (S::CollectingResources, E::Collected) => Some(S::UploadingDom),
            (S::UploadingDom, E::Uploaded) => Some(S::Rendering),
            (S::Rendering, E::Rendered) => Some(S::Matching),
            (S::Matching, E::Matched) => Some(S::Done),
            _ => None,
        }
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckEvent {
    Collected,
    Uploaded,
    Rendered,
    Matched,
    Failed,
}

impl fmt::Display for CheckEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One visual check of one logical test.
pub struct CheckTask {
    pub step_id: String,
    pub test_id: String,
    pub settings: CheckSettings,
    state: CheckState,
    listener: Arc<dyn CheckListener>,
}

impl CheckTask {
    pub fn new(
        step_id: impl Into<String>,
        test_id: impl Into<String>,
        settings: CheckSettings,
        listener: Arc<dyn CheckListener>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            test_id: test_id.into(),
            settings,
            state: CheckState::CollectingResources,
            listener,
        }
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move along one edge of the table. Terminal tasks ignore late events.
    pub fn advance(&mut self, event: CheckEvent) -> Result<CheckState> {
        let next = self.state.next(event).ok_or_else(|| Error::IllegalTransition {
            step_id: self.step_id.clone(),
            from: self.state.to_string(),
            event: event.to_string(),
        })?;
        if next != self.state {
            debug!("check {}: {} -> {}", self.step_id, self.state, next);
        }
        self.state = next;
        Ok(next)
    }

    /// Finish with a match result. The listener hears about it only if this
    /// call is what made the task terminal.
    pub fn complete(&mut self, result: &MatchResult) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        self.advance(CheckEvent::Matched)?;
        self.listener.on_complete(&self.step_id, result);
        Ok(())
    }

    /// Fail the task unless it already finished.
    pub fn fail(&mut self, error: &Error) {
        if self.is_terminal() || self.advance(CheckEvent::Failed).is_err() {
            return;
        }
        debug!("check {} failed: {}", self.step_id, error);
        self.listener.on_fail(&self.step_id, error);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenState {
    Pending,
    Open(RunningSession),
    Failed(Error),
}

/// A test session: opened once, owns check tasks, closed once they are all
/// terminal.
pub struct LogicalTest {
    pub test_id: String,
    pub start: SessionStartInfo,
    pub open: OpenState,
    /// `Some(aborted)` once a close was requested.
    pub close_requested: Option<bool>,
    pub closing: bool,
    pub step_ids: Vec<String>,
    pub listener: Arc<dyn TestListener>,
    active: Arc<AtomicBool>,
}

impl LogicalTest {
    pub fn new(
        test_id: impl Into<String>,
        start: SessionStartInfo,
        active: Arc<AtomicBool>,
        listener: Arc<dyn TestListener>,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            start,
            open: OpenState::Pending,
            close_requested: None,
            closing: false,
            step_ids: Vec::new(),
            listener,
            active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn session(&self) -> Option<&RunningSession> {
        match &self.open {
            OpenState::Open(session) => Some(session),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl CheckListener for Recorder {
        fn on_complete(&self, step_id: &str, _result: &MatchResult) {
            self.events.lock().unwrap().push(format!("ok:{}", step_id));
        }
        fn on_fail(&self, step_id: &str, _error: &Error) {
            self.events.lock().unwrap().push(format!("fail:{}", step_id));
        }
    }

    fn task(listener: Arc<Recorder>) -> CheckTask {
        CheckTask::new("s1", "t1", CheckSettings::default(), listener)
    }

    #[test]
    fn happy_path_walks_the_table() {
        let recorder = Arc::new(Recorder::default());
        let mut t = task(Arc::clone(&recorder));
        assert_eq!(t.advance(CheckEvent::Collected).unwrap(), CheckState::UploadingDom);
        assert_eq!(t.advance(CheckEvent::Uploaded).unwrap(), CheckState::Rendering);
        assert_eq!(t.advance(CheckEvent::Rendered).unwrap(), CheckState::Matching);
        t.complete(&MatchResult { as_expected: true, window_id: None }).unwrap();
        assert_eq!(t.state(), CheckState::Done);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["ok:s1"]);
    }

    #[test]
    fn out_of_order_event_is_illegal() {
        let mut t = task(Arc::new(Recorder::default()));
        let err = t.advance(CheckEvent::Rendered).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert_eq!(t.state(), CheckState::CollectingResources);
    }

    #[test]
    fn failure_mid_flight_follows_the_table() {
        let recorder = Arc::new(Recorder::default());
        let mut t = task(Arc::clone(&recorder));
        t.advance(CheckEvent::Collected).unwrap();
        t.advance(CheckEvent::Uploaded).unwrap();
        assert_eq!(CheckState::Rendering.next(CheckEvent::Failed), Some(CheckState::Failed));
        t.fail(&Error::Other("render crashed".into()));
        assert_eq!(t.state(), CheckState::Failed);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["fail:s1"]);
    }

    #[test]
    fn outcome_is_delivered_once() {
        let recorder = Arc::new(Recorder::default());
        let mut t = task(Arc::clone(&recorder));
        t.fail(&Error::Other("boom".into()));
        t.fail(&Error::Other("again".into()));
        t.complete(&MatchResult { as_expected: true, window_id: None }).unwrap();
        assert_eq!(t.advance(CheckEvent::Collected).unwrap(), CheckState::Failed);
        assert_eq!(*recorder.events.lock().unwrap(), vec!["fail:s1"]);
    }
}
