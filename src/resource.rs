//! Resources and the document object built from a DOM snapshot.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Content type under which a serialized document is uploaded.
pub const DOM_CONTENT_TYPE: &str = "x-rfgrid-html/cdt";

const HASH_FORMAT: &str = "sha256";

/// A fetched or inlined page resource. Immutable once created.
#[derive(Clone, PartialEq, Eq)]
pub struct Resource {
    url: String,
    content_type: String,
    content: Vec<u8>,
    sha256: String,
}

impl Resource {
    pub fn new(url: impl Into<String>, content_type: impl Into<String>, content: Vec<u8>) -> Self {
        let sha256 = hex::encode(Sha256::digest(&content));
        Self {
            url: url.into(),
            content_type: content_type.into(),
            content,
            sha256,
        }
    }

    /// Decode a base64 blob as captured by the snapshot script.
    pub fn from_base64(url: impl Into<String>, content_type: impl Into<String>, encoded: &str) -> Result<Self> {
        let url = url.into();
        let content = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Decode(format!("{}: {}", url, e)))?;
        Ok(Self::new(url, content_type, content))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Hex-encoded SHA-256 of the content.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn is_stylesheet(&self) -> bool {
        self.content_type.to_ascii_lowercase().contains("text/css")
    }

    /// Content as text; invalid UTF-8 sequences are replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    /// Hash reference the rendering service uses to identify the content.
    pub fn hash_ref(&self) -> ResourceRef {
        ResourceRef {
            hash_format: HASH_FORMAT.to_string(),
            hash: self.sha256.clone(),
            content_type: self.content_type.clone(),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("url", &self.url)
            .field("content_type", &self.content_type)
            .field("len", &self.content.len())
            .field("sha256", &self.sha256)
            .finish()
    }
}

/// Wire reference to a resource by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub hash_format: String,
    pub hash: String,
    pub content_type: String,
}

/// Normalized DOM tree plus every resource it references.
///
/// Render jobs share one document through an `Arc`; nothing mutates it after
/// collection. A native-app capture has no tree: its single opaque payload is
/// uploaded in place of the serialized DOM.
#[derive(Debug, Clone, PartialEq)]
pub struct DomDocument {
    url: String,
    nodes: Vec<serde_json::Value>,
    resources: BTreeMap<String, Arc<Resource>>,
    payload: Option<Arc<Resource>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DomBody<'a> {
    url: &'a str,
    dom_nodes: &'a [serde_json::Value],
    resources: BTreeMap<&'a str, ResourceRef>,
}

impl DomDocument {
    pub fn new(
        url: impl Into<String>,
        nodes: Vec<serde_json::Value>,
        resources: BTreeMap<String, Arc<Resource>>,
    ) -> Self {
        Self {
            url: url.into(),
            nodes,
            resources,
            payload: None,
        }
    }

    /// Document for a native-app capture uploaded as-is.
    pub fn native(payload: Resource) -> Self {
        Self {
            url: payload.url().to_string(),
            nodes: Vec::new(),
            resources: BTreeMap::new(),
            payload: Some(Arc::new(payload)),
        }
    }

    pub fn is_native(&self) -> bool {
        self.payload.is_some()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn nodes(&self) -> &[serde_json::Value] {
        &self.nodes
    }

    pub fn resources(&self) -> &BTreeMap<String, Arc<Resource>> {
        &self.resources
    }

    pub fn resource(&self, url: &str) -> Option<&Arc<Resource>> {
        self.resources.get(url)
    }

    /// Serialized form: URL, node list and the hash of every resource.
    ///
    /// The URL is part of the body so two frames with identical markup at
    /// different addresses hash differently.
    pub fn content(&self) -> Vec<u8> {
        if let Some(payload) = &self.payload {
            return payload.content().to_vec();
        }
        let body = DomBody {
            url: &self.url,
            dom_nodes: &self.nodes,
            resources: self
                .resources
                .iter()
                .map(|(url, resource)| (url.as_str(), resource.hash_ref()))
                .collect(),
        };
        serde_json::to_vec(&body).unwrap_or_default()
    }

    /// The document as an uploadable resource addressed by its own URL.
    pub fn as_resource(&self) -> Resource {
        match &self.payload {
            Some(payload) => Resource::clone(payload),
            None => Resource::new(self.url.clone(), DOM_CONTENT_TYPE, self.content()),
        }
    }
}
