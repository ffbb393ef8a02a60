//! Target configurations a page is rendered under.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Viewport};

/// Browser engine the rendering service should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrowserType {
    Chrome,
    ChromeOneVersionBack,
    ChromeTwoVersionsBack,
    Firefox,
    FirefoxOneVersionBack,
    Safari,
    SafariOneVersionBack,
    Edge,
    EdgeLegacy,
    Ie,
}

impl BrowserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserType::Chrome => "chrome",
            BrowserType::ChromeOneVersionBack => "chrome-one-version-back",
            BrowserType::ChromeTwoVersionsBack => "chrome-two-versions-back",
            BrowserType::Firefox => "firefox",
            BrowserType::FirefoxOneVersionBack => "firefox-one-version-back",
            BrowserType::Safari => "safari",
            BrowserType::SafariOneVersionBack => "safari-one-version-back",
            BrowserType::Edge => "edge",
            BrowserType::EdgeLegacy => "edge-legacy",
            BrowserType::Ie => "ie",
        }
    }

    /// Platform a browser runs on when the caller does not name one.
    pub fn default_platform(&self) -> &'static str {
        match self {
            BrowserType::Safari | BrowserType::SafariOneVersionBack => "mac-os",
            BrowserType::Edge | BrowserType::EdgeLegacy | BrowserType::Ie => "windows",
            _ => "linux",
        }
    }
}

impl fmt::Display for BrowserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrowserType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            BrowserType::Chrome,
            BrowserType::ChromeOneVersionBack,
            BrowserType::ChromeTwoVersionsBack,
            BrowserType::Firefox,
            BrowserType::FirefoxOneVersionBack,
            BrowserType::Safari,
            BrowserType::SafariOneVersionBack,
            BrowserType::Edge,
            BrowserType::EdgeLegacy,
            BrowserType::Ie,
        ];
        all.into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::ConfigError(format!("unknown browser {:?}", s)))
    }
}

/// How much of the page is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizeMode {
    #[default]
    FullPage,
    Viewport,
    Region,
    Selector,
}

/// Mobile emulation, either by device name or by explicit metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmulationInfo {
    Device {
        #[serde(rename = "deviceName")]
        device_name: String,
        #[serde(rename = "screenOrientation", skip_serializing_if = "Option::is_none")]
        screen_orientation: Option<String>,
    },
    Metrics {
        width: u32,
        height: u32,
        #[serde(rename = "deviceScaleFactor")]
        device_scale_factor: f32,
        mobile: bool,
    },
}

/// Simulated iOS device for native-app captures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IosDeviceInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_orientation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Whether a render job carries a web DOM or a native-app capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformType {
    #[default]
    Web,
    Native,
}

/// One browser/device/viewport combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderTarget {
    pub browser: BrowserType,
    pub platform: String,
    pub viewport: Viewport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulation: Option<EmulationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ios_device: Option<IosDeviceInfo>,
}

impl RenderTarget {
    pub fn new(browser: BrowserType, viewport: Viewport) -> Self {
        Self {
            browser,
            platform: browser.default_platform().to_string(),
            viewport,
            emulation: None,
            ios_device: None,
        }
    }

    pub fn with_emulation(mut self, emulation: EmulationInfo) -> Self {
        self.emulation = Some(emulation);
        self
    }

    pub fn with_ios_device(mut self, device: IosDeviceInfo) -> Self {
        self.platform = "ios".to_string();
        self.ios_device = Some(device);
        self
    }
}

/// Parses `browser:WIDTHxHEIGHT`, e.g. `chrome:1280x720` or `safari:375x812`.
impl FromStr for RenderTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (browser, size) = s
            .split_once(':')
            .ok_or_else(|| Error::ConfigError(format!("expected browser:WIDTHxHEIGHT, got {:?}", s)))?;
        let (w, h) = size
            .split_once(['x', 'X'])
            .ok_or_else(|| Error::ConfigError(format!("expected WIDTHxHEIGHT, got {:?}", size)))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| Error::ConfigError(format!("invalid dimension {:?}", v)))
        };
        Ok(RenderTarget::new(
            browser.parse()?,
            Viewport {
                width: parse(w)?,
                height: parse(h)?,
            },
        ))
    }
}

/// Rectangle in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// Element selector the service resolves on its side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualGridSelector {
    #[serde(rename = "type")]
    pub kind: String,
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl VisualGridSelector {
    pub fn css(selector: impl Into<String>) -> Self {
        Self {
            kind: "css".to_string(),
            selector: selector.into(),
            category: None,
        }
    }
}

/// Free-form option forwarded to the rendering service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualGridOption {
    pub key: String,
    pub value: serde_json::Value,
}

/// Per-check settings shared by every target of one check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckSettings {
    pub name: Option<String>,
    pub size_mode: SizeMode,
    /// Capture beyond the viewport even when `size_mode` is `Viewport`.
    pub stitch_content: bool,
    pub target_region: Option<Region>,
    pub target_selector: Option<VisualGridSelector>,
    pub region_selectors: Vec<VisualGridSelector>,
    pub script_hooks: BTreeMap<String, String>,
    pub send_dom: bool,
    pub visual_grid_options: Vec<VisualGridOption>,
}

impl CheckSettings {
    /// Size mode actually requested from the service.
    pub fn effective_size_mode(&self) -> SizeMode {
        if self.size_mode == SizeMode::Viewport && self.stitch_content {
            SizeMode::FullPage
        } else {
            self.size_mode
        }
    }
}
