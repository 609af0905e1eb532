use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque capability string granting access to one remote session.
///
/// Tokens are issued by the collaborating backend and never minted here.
/// `Debug` and `Display` only show a short prefix so tokens stay out of logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityToken(String);

impl CapabilityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// First few characters followed by an ellipsis.
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(6).collect();
        if self.0.chars().count() > 6 {
            format!("{}…", prefix)
        } else {
            prefix
        }
    }
}

impl std::fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CapabilityToken({})", self.redacted())
    }
}

impl std::fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

impl From<&str> for CapabilityToken {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CapabilityToken {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// The three wire protocols a remote session can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    /// Remote-debugging frame streaming (DevTools screencast).
    Screencast,
    /// Pixel framebuffer (RFB) over a WebSocket proxy.
    Framebuffer,
    /// Raw terminal bytes over a WebSocket.
    Terminal,
}

impl ProtocolFamily {
    pub const ALL: [ProtocolFamily; 3] = [
        ProtocolFamily::Screencast,
        ProtocolFamily::Framebuffer,
        ProtocolFamily::Terminal,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Screencast => "screencast",
            Self::Framebuffer => "framebuffer",
            Self::Terminal => "terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "screencast" | "browser" | "cdp" => Some(Self::Screencast),
            "framebuffer" | "vnc" | "desktop" => Some(Self::Framebuffer),
            "terminal" | "shell" | "tty" => Some(Self::Terminal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Status indicator reported for an automation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Loading,
    Complete,
    Error,
    /// Any status this subsystem does not act upon.
    #[serde(other)]
    Other,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Loading => write!(f, "loading"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ComputerUse,
    BrowserUse,
    #[default]
    #[serde(other)]
    Other,
}

/// At most one token per protocol family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screencast: Option<CapabilityToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framebuffer: Option<CapabilityToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<CapabilityToken>,
}

impl SessionTokens {
    pub fn get(&self, family: ProtocolFamily) -> Option<&CapabilityToken> {
        let token = match family {
            ProtocolFamily::Screencast => self.screencast.as_ref(),
            ProtocolFamily::Framebuffer => self.framebuffer.as_ref(),
            ProtocolFamily::Terminal => self.terminal.as_ref(),
        };
        token.filter(|t| !t.is_empty())
    }
}

/// One step of a workflow, as last reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationTask {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub tokens: SessionTokens,
    #[serde(default)]
    pub action_label: Option<String>,
    /// Previously captured static frames, oldest first (URLs or data URIs).
    #[serde(default)]
    pub screenshots: Vec<String>,
}

impl AutomationTask {
    pub fn is_computer_use_style(&self) -> bool {
        matches!(self.kind, TaskKind::ComputerUse | TaskKind::BrowserUse)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub tasks: Vec<AutomationTask>,
}

/// Which task's live session is currently mounted for a protocol family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionRecord {
    pub token: CapabilityToken,
    pub task_id: String,
}

/// A PNG snapshot of a pixel surface.
#[derive(Clone)]
pub struct CapturedFrame {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("png_bytes", &self.png.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// Static fallback kept across a live session's teardown.
#[derive(Debug, Clone)]
pub struct LastCapturedFrame {
    pub task_id: String,
    pub frame: CapturedFrame,
    pub action_label: Option<String>,
    /// Length of the task's screenshot list when the frame was captured.
    pub screenshots_seen: usize,
}
