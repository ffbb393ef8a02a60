//! Expands one document into one render job per target configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::target::{BrowserType, CheckSettings, EmulationInfo, IosDeviceInfo, PlatformType, Region};
use super::target::{RenderTarget, SizeMode, VisualGridOption, VisualGridSelector};
use crate::resource::ResourceRef;
use crate::DomDocument;

/// Capture geometry sent with a render job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderInfo {
    pub width: u32,
    pub height: u32,
    pub size_mode: SizeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<VisualGridSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulation_info: Option<EmulationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ios_device_info: Option<IosDeviceInfo>,
}

/// One request to render a captured page under one target configuration.
///
/// `dom` is shared with every other job built from the same document.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub step_id: String,
    pub test_id: String,
    pub agent_id: String,
    pub results_url: Option<String>,
    pub dom: Arc<DomDocument>,
    pub render_info: RenderInfo,
    pub browser: BrowserType,
    pub platform: String,
    pub platform_type: PlatformType,
    /// Renderer assigned to the job's session, if the service named one.
    pub renderer: Option<String>,
    pub stitching_service_url: Option<String>,
    pub script_hooks: BTreeMap<String, String>,
    pub selectors_to_find_regions_for: Vec<VisualGridSelector>,
    pub send_dom: bool,
    pub options: Vec<VisualGridOption>,
    /// Assigned by the service on first submission.
    pub render_id: Option<String>,
}

#[derive(Serialize)]
struct BrowserBody<'a> {
    name: &'a str,
    platform: &'a str,
}

/// JSON body the rendering service expects for one job.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequestBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    render_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    dom: ResourceRef,
    resources: BTreeMap<&'a str, ResourceRef>,
    render_info: &'a RenderInfo,
    browser: BrowserBody<'a>,
    platform_type: PlatformType,
    #[serde(skip_serializing_if = "Option::is_none")]
    renderer: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stitching_service_url: Option<&'a str>,
    #[serde(skip_serializing_if = "no_hooks")]
    script_hooks: &'a BTreeMap<String, String>,
    selectors_to_find_regions_for: &'a [VisualGridSelector],
    send_dom: bool,
    agent_id: &'a str,
    #[serde(skip_serializing_if = "no_options")]
    options: &'a [VisualGridOption],
}

fn no_hooks(hooks: &&BTreeMap<String, String>) -> bool {
    hooks.is_empty()
}

fn no_options(options: &&[VisualGridOption]) -> bool {
    options.is_empty()
}

impl RenderJob {
    pub fn page_url(&self) -> &str {
        self.dom.url()
    }

    pub fn to_request_body(&self) -> RenderRequestBody<'_> {
        RenderRequestBody {
            render_id: self.render_id.as_deref(),
            webhook: self.results_url.as_deref(),
            url: (!self.dom.is_native()).then(|| self.dom.url()),
            dom: self.dom.as_resource().hash_ref(),
            resources: self
                .dom
                .resources()
                .iter()
                .map(|(url, resource)| (url.as_str(), resource.hash_ref()))
                .collect(),
            render_info: &self.render_info,
            browser: BrowserBody {
                name: self.browser.as_str(),
                platform: &self.platform,
            },
            platform_type: self.platform_type,
            renderer: self.renderer.as_deref(),
            stitching_service_url: self.stitching_service_url.as_deref(),
            script_hooks: &self.script_hooks,
            selectors_to_find_regions_for: &self.selectors_to_find_regions_for,
            send_dom: self.send_dom,
            agent_id: &self.agent_id,
            options: &self.options,
        }
    }
}

/// A target together with the check it belongs to.
#[derive(Debug, Clone)]
pub struct JobTarget {
    pub step_id: String,
    pub test_id: String,
    pub target: RenderTarget,
}

/// Builds the jobs of one batch from a document and its check settings.
pub struct RenderJobBuilder<'a> {
    dom: &'a Arc<DomDocument>,
    settings: &'a CheckSettings,
    agent_id: String,
    results_url: Option<String>,
    stitching_service_url: Option<String>,
    renderer: Option<String>,
}

impl<'a> RenderJobBuilder<'a> {
    pub fn new(dom: &'a Arc<DomDocument>, settings: &'a CheckSettings) -> Self {
        Self {
            dom,
            settings,
            agent_id: String::new(),
            results_url: None,
            stitching_service_url: None,
            renderer: None,
        }
    }

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn results_url(mut self, results_url: Option<String>) -> Self {
        self.results_url = results_url;
        self
    }

    pub fn stitching_service_url(mut self, url: Option<String>) -> Self {
        self.stitching_service_url = url;
        self
    }

    pub fn renderer(mut self, renderer: Option<String>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Job for a single target.
    ///
    /// Native captures carry no DOM, so region, selector and emulation
    /// settings are left out and the size mode is sent as given.
    pub fn build_one(&self, step_id: &str, test_id: &str, target: &RenderTarget) -> RenderJob {
        let settings = self.settings;
        let native = self.dom.is_native();
        let render_info = if native {
            RenderInfo {
                width: target.viewport.width,
                height: target.viewport.height,
                size_mode: settings.size_mode,
                region: None,
                selector: None,
                emulation_info: None,
                ios_device_info: target.ios_device.clone(),
            }
        } else {
            RenderInfo {
                width: target.viewport.width,
                height: target.viewport.height,
                size_mode: settings.effective_size_mode(),
                region: settings.target_region,
                selector: settings.target_selector.clone(),
                emulation_info: target.emulation.clone(),
                ios_device_info: target.ios_device.clone(),
            }
        };
        RenderJob {
            step_id: step_id.to_string(),
            test_id: test_id.to_string(),
            agent_id: self.agent_id.clone(),
            results_url: self.results_url.clone(),
            dom: Arc::clone(self.dom),
            render_info,
            browser: target.browser,
            platform: target.platform.clone(),
            platform_type: if native { PlatformType::Native } else { PlatformType::Web },
            renderer: self.renderer.clone(),
            stitching_service_url: self.stitching_service_url.clone(),
            script_hooks: settings.script_hooks.clone(),
            selectors_to_find_regions_for: if native { Vec::new() } else { settings.region_selectors.clone() },
            send_dom: settings.send_dom && !native,
            options: settings.visual_grid_options.clone(),
            render_id: None,
        }
    }

    /// One job per target, in target order.
    pub fn build(&self, targets: &[JobTarget]) -> Vec<RenderJob> {
        targets
            .iter()
            .map(|t| self.build_one(&t.step_id, &t.test_id, &t.target))
            .collect()
    }
}
