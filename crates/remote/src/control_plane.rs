//! Control-plane lookups (token → session descriptor) and duplex URL building.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sessionview_core::{CapabilityToken, Config, Error, Result};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// One debuggable target returned by the screencast lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreencastTarget {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub web_socket_debugger_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreencastDescriptor {
    #[serde(default)]
    pub targets: Vec<ScreencastTarget>,
}

impl ScreencastDescriptor {
    /// Duplex endpoint of the first page target, else of the first target.
    pub fn endpoint(&self) -> Option<&str> {
        let usable = |t: &&ScreencastTarget| !t.web_socket_debugger_url.is_empty();
        self.targets
            .iter()
            .filter(usable)
            .find(|t| t.target_type == "page")
            .or_else(|| self.targets.iter().find(usable))
            .map(|t| t.web_socket_debugger_url.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramebufferDescriptor {
    pub host: String,
    pub port: u16,
    pub width: u32,
    pub height: u32,
    /// Proxied transport path for the framebuffer WebSocket.
    pub path: String,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn screencast_session(&self, token: &CapabilityToken) -> Result<ScreencastDescriptor>;

    async fn framebuffer_session(&self, token: &CapabilityToken) -> Result<FramebufferDescriptor>;
}

/// `GET {base}{path}?token=...` against the collaborating backend.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    screencast_path: String,
    framebuffer_path: String,
    bearer_token: Option<String>,
}

impl HttpControlPlane {
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.control_plane.timeout_secs))
            .build()
            .map_err(|e| Error::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            screencast_path: config.control_plane.screencast_path.clone(),
            framebuffer_path: config.control_plane.framebuffer_path.clone(),
            bearer_token: config.bearer_token(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, token: &CapabilityToken) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, token = %token, "Control-plane lookup");

        let mut request = self.client.get(&url).query(&[("token", token.as_str())]);
        if let Some(bearer) = &self.bearer_token {
            request = request.bearer_auth(bearer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("Control-plane request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_status(status.as_u16(), body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Decode(format!("Invalid control-plane response: {}", e)))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn screencast_session(&self, token: &CapabilityToken) -> Result<ScreencastDescriptor> {
        self.get_json(&self.screencast_path, token).await
    }

    async fn framebuffer_session(&self, token: &CapabilityToken) -> Result<FramebufferDescriptor> {
        self.get_json(&self.framebuffer_path, token).await
    }
}

/// Scheme and authority of the hosting page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOrigin {
    pub secure: bool,
    /// Host, including a port when one was given.
    pub authority: String,
}

impl PageOrigin {
    pub fn parse(origin: &str) -> Result<Self> {
        let url = Url::parse(origin)
            .map_err(|e| Error::Config(format!("Invalid page origin '{}': {}", origin, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("Page origin '{}' has no host", origin)))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        Ok(Self {
            secure: matches!(url.scheme(), "https" | "wss"),
            authority,
        })
    }

    /// Build a duplex endpoint URL from a path (or a full URL whose path and
    /// query are kept) under this origin.
    pub fn duplex_url(&self, reference: &str) -> Result<Url> {
        let path_and_query = match Url::parse(reference) {
            Ok(absolute) => match absolute.query() {
                Some(q) => format!("{}?{}", absolute.path(), q),
                None => absolute.path().to_string(),
            },
            Err(_) if reference.starts_with('/') => reference.to_string(),
            Err(_) => format!("/{}", reference),
        };
        let scheme = if self.secure { "wss" } else { "ws" };
        Url::parse(&format!("{}://{}{}", scheme, self.authority, path_and_query))
            .map_err(|e| Error::Config(format!("Invalid duplex endpoint '{}': {}", reference, e)))
    }
}
