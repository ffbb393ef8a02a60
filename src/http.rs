//! reqwest-backed implementations of [`ResourceFetcher`] and [`RenderingService`].

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response};
use url::Url;

use crate::render::{RenderJob, RenderStatusResults, RunningRender};
use crate::service::{RenderingService, ResourceFetcher};
use crate::{Error, GridConfig, Resource, Result};

const API_KEY_HEADER: &str = "X-Api-Key";

/// Downloads page resources over HTTP.
#[derive(Clone)]
pub struct HttpResourceFetcher {
    client: Client,
}

impl HttpResourceFetcher {
    pub fn new(config: &GridConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| Error::ConfigError(format!("Invalid user agent: {}", e)))?;
        headers.insert(USER_AGENT, agent);
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::ConfigError(format!("Invalid header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::ConfigError(format!("Invalid header value for {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResourceFetcher for HttpResourceFetcher {
    async fn fetch(&self, url: &Url) -> Result<Resource> {
        let fetch_error = |message: String| Error::Fetch {
            url: url.to_string(),
            message,
        };

        let res = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if !res.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", res.status())));
        }

        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = res.bytes().await.map_err(|e| fetch_error(e.to_string()))?;
        debug!("fetched {} ({} bytes, {})", url, body.len(), content_type);
        Ok(Resource::new(url.as_str(), content_type, body.to_vec()))
    }
}

/// Client for the rendering service's JSON API.
#[derive(Clone)]
pub struct HttpRenderingService {
    client: Client,
    base: Url,
    api_key: Option<String>,
}

impl HttpRenderingService {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base, api_key })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    async fn check(res: Response) -> Result<Response> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        Err(Error::Service(format!("HTTP {}: {}", status, body)))
    }
}

#[async_trait]
impl RenderingService for HttpRenderingService {
    async fn render(&self, jobs: &[RenderJob]) -> Result<Vec<RunningRender>> {
        let body: Vec<_> = jobs.iter().map(RenderJob::to_request_body).collect();
        let req = self.client.post(self.endpoint("render")?).json(&body);
        let res = Self::check(self.authorize(req).send().await?).await?;
        Ok(res.json().await?)
    }

    async fn put_resource(&self, render_id: Option<&str>, resource: &Resource) -> Result<()> {
        let mut url = self.endpoint(&format!("resources/sha256/{}", resource.sha256()))?;
        if let Some(id) = render_id {
            url.query_pairs_mut().append_pair("render-id", id);
        }
        let req = self
            .client
            .put(url)
            .header(CONTENT_TYPE, resource.content_type())
            .body(resource.content().to_vec());
        let res = self.authorize(req).send().await.map_err(|e| Error::Upload {
            url: resource.url().to_string(),
            message: e.to_string(),
        })?;
        Self::check(res).await.map_err(|e| Error::Upload {
            url: resource.url().to_string(),
            message: e.to_string(),
        })?;
        debug!("put {} ({})", resource.url(), resource.sha256());
        Ok(())
    }

    async fn render_status(&self, render_ids: &[String]) -> Result<Vec<Option<RenderStatusResults>>> {
        let req = self.client.post(self.endpoint("render-status")?).json(render_ids);
        let res = Self::check(self.authorize(req).send().await?).await?;
        Ok(res.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let service = HttpRenderingService::new("https://render.test/api", None).unwrap();
        assert_eq!(service.endpoint("render").unwrap().as_str(), "https://render.test/api/render");
    }

    #[test]
    fn bad_header_is_a_config_error() {
        let mut config = GridConfig::default();
        config.headers.insert("bad header".into(), "x".into());
        assert!(matches!(HttpResourceFetcher::new(&config), Err(Error::ConfigError(_))));
    }
}
