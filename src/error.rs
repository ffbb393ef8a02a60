//! Error types for the render-grid client

use thiserror::Error;

/// Result type alias for grid operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while collecting, uploading or rendering snapshots.
///
/// The type is `Clone` because a single fetch or upload outcome is shared by
/// every caller awaiting the same single-flight future.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A URL could not be parsed or resolved
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Inline content could not be decoded
    #[error("Failed to decode content: {0}")]
    Decode(String),

    /// Fetching a resource failed
    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    /// Uploading a resource to the rendering service failed
    #[error("Failed to upload {url}: {message}")]
    Upload { url: String, message: String },

    /// A resource was requested for upload but was never downloaded
    #[error("Resource put requested but never downloaded: {0}")]
    ResourceResolution(String),

    /// The render batch could not be submitted
    #[error("Render submission failed: {0}")]
    Submission(String),

    /// A single render ended in error or never finished
    #[error("Render {render_id} failed: {message}")]
    RenderFailed { render_id: String, message: String },

    /// Rendering-service transport error
    #[error("Rendering service error: {0}")]
    Service(String),

    /// Open/match/close session error
    #[error("Session error: {0}")]
    Session(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// A check task was asked to move along an edge the state machine lacks
    #[error("Illegal transition for check {step_id}: {from} on {event}")]
    IllegalTransition {
        step_id: String,
        from: String,
        event: String,
    },

    /// The coordinator stopped before the request could be handled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Render error for a render id that never produced a terminal status.
    pub fn render_timeout(render_id: &str) -> Self {
        Error::RenderFailed {
            render_id: render_id.to_string(),
            message: "render did not finish within the polling budget".to_string(),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Service(err.to_string())
    }
}
