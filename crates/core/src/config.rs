use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    /// Base URL of the collaborating backend, e.g. "http://localhost:8000".
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Origin of the hosting page. Duplex endpoints inherit its host, and
    /// its scheme decides between ws and wss.
    #[serde(default = "default_page_origin")]
    pub page_origin: String,
    /// Optional bearer credential sent with control-plane lookups.
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_screencast_path")]
    pub screencast_path: String,
    #[serde(default = "default_framebuffer_path")]
    pub framebuffer_path: String,
    #[serde(default = "default_terminal_path")]
    pub terminal_path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_page_origin() -> String {
    "http://localhost:8000".to_string()
}

fn default_screencast_path() -> String {
    "/api/v1/browser/session".to_string()
}

fn default_framebuffer_path() -> String {
    "/api/v1/vnc/session".to_string()
}

fn default_terminal_path() -> String {
    "/api/v1/terminal/ws".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            page_origin: default_page_origin(),
            bearer_token: None,
            screencast_path: default_screencast_path(),
            framebuffer_path: default_framebuffer_path(),
            terminal_path: default_terminal_path(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    /// Fixed delay before the single scheduled reconnect attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    2000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Encoding parameters for `Page.startScreencast`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreencastConfig {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_max_height")]
    pub max_height: u32,
}

fn default_format() -> String {
    "jpeg".to_string()
}

fn default_quality() -> u8 {
    80
}

fn default_max_width() -> u32 {
    1280
}

fn default_max_height() -> u32 {
    720
}

impl Default for ScreencastConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            quality: default_quality(),
            max_width: default_max_width(),
            max_height: default_max_height(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalConfig {
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_scrollback")]
    pub scrollback: usize,
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

fn default_scrollback() -> usize {
    1000
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            scrollback: default_scrollback(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub screencast: ScreencastConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    /// Whether local input is forwarded to remote sessions.
    #[serde(default)]
    pub interactive: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.screencast.quality > 100 {
            return Err(Error::Config(format!(
                "screencast.quality must be 0-100, got {}",
                self.screencast.quality
            )));
        }
        if self.terminal.rows == 0 || self.terminal.cols == 0 {
            return Err(Error::Config("terminal geometry must be non-zero".into()));
        }
        Ok(())
    }

    pub fn bearer_token(&self) -> Option<String> {
        self.control_plane
            .bearer_token
            .as_ref()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
    }

    pub fn base_url(&self) -> String {
        self.control_plane.base_url.trim().trim_end_matches('/').to_string()
    }
}
