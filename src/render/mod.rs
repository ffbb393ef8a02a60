//! Render jobs, their service-side status, and the machinery that drives them.

pub mod driver;
pub mod request;
pub mod target;

use serde::{Deserialize, Serialize};

pub use driver::{worst_status, RenderJobDriver, RenderOutcome};
pub use request::{RenderInfo, RenderJob, RenderJobBuilder};
pub use target::{
    BrowserType, CheckSettings, EmulationInfo, IosDeviceInfo, PlatformType, Region, RenderTarget, SizeMode,
    VisualGridOption, VisualGridSelector,
};

/// Status the rendering service reports for a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenderStatus {
    #[serde(rename = "rendering")]
    Rendering,
    #[serde(rename = "need-more-resources")]
    NeedMoreResource,
    #[serde(rename = "need-more-dom")]
    NeedMoreDom,
    #[serde(rename = "rendered")]
    Rendered,
    #[serde(rename = "error")]
    Error,
}

impl RenderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RenderStatus::Rendered | RenderStatus::Error)
    }
}

/// A submitted render as acknowledged by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningRender {
    pub render_id: String,
    pub render_status: RenderStatus,
    #[serde(default)]
    pub need_more_resources: Vec<String>,
    #[serde(default)]
    pub need_more_dom: bool,
}

impl RunningRender {
    pub fn needs_dom(&self) -> bool {
        self.need_more_dom || self.render_status == RenderStatus::NeedMoreDom
    }
}

/// Size of the emulated device the page was rendered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceSize {
    pub width: u32,
    pub height: u32,
}

/// Outcome of one status poll for one render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderStatusResults {
    pub render_id: Option<String>,
    pub status: Option<RenderStatus>,
    pub image_location: Option<String>,
    pub dom_location: Option<String>,
    pub user_agent: Option<String>,
    pub os: Option<String>,
    pub error: Option<String>,
    pub selector_regions: Vec<Region>,
    pub device_size: Option<DeviceSize>,
}

impl RenderStatusResults {
    /// True for a placeholder entry that carries no information at all.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.image_location.is_none()
            && self.error.is_none()
            && self.os.is_none()
            && self.user_agent.is_none()
            && self.device_size.is_none()
            && self.selector_regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names() {
        let r: RunningRender = serde_json::from_str(
            r#"{"renderId":"r1","renderStatus":"need-more-resources","needMoreResources":["https://a.test/x.css"]}"#,
        )
        .unwrap();
        assert_eq!(r.render_status, RenderStatus::NeedMoreResource);
        assert_eq!(r.need_more_resources.len(), 1);
        assert!(!r.needs_dom());
    }

    #[test]
    fn status_result_defaults_to_empty() {
        let r: RenderStatusResults = serde_json::from_str("{}").unwrap();
        assert!(r.is_empty());
        let r: RenderStatusResults =
            serde_json::from_str(r#"{"status":"rendered","imageLocation":"https://img.test/1.png"}"#).unwrap();
        assert!(!r.is_empty());
        assert!(r.status.unwrap().is_terminal());
    }
}
