//! Session-side types: opening a test, matching a rendered window, closing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::render::{RenderStatusResults, RenderTarget};
use crate::Result;

/// What the session service needs to open a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartInfo {
    pub app_name: String,
    pub test_name: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub target: RenderTarget,
}

/// An open session on the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub is_new: bool,
    /// Renderer the service assigned to this session
    #[serde(default)]
    pub renderer: Option<String>,
}

/// A finished render handed over for comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchData {
    pub step_id: String,
    pub test_id: String,
    pub name: Option<String>,
    pub render: RenderStatusResults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub as_expected: bool,
    #[serde(default)]
    pub window_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopInfo {
    pub test_id: String,
    pub session: RunningSession,
    pub aborted: bool,
}

/// Summary the service reports when a session closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestResults {
    pub session_id: String,
    pub steps: usize,
    pub mismatches: usize,
    pub aborted: bool,
}

/// The session (baseline) service.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn open(&self, start: &SessionStartInfo) -> Result<RunningSession>;

    async fn match_window(&self, session: &RunningSession, data: &MatchData) -> Result<MatchResult>;

    async fn close(&self, stop: &StopInfo) -> Result<TestResults>;
}
