//! Remote-debugging wire messages used by the screencast client.

use serde::Deserialize;
use serde_json::{json, Value};
use sessionview_core::{Error, Result};

use crate::input::{KeyEvent, KeyKind, MouseButton, PointerEvent, PointerKind, WheelEvent};
use crate::session::NavigationState;

pub const PAGE_ENABLE: &str = "Page.enable";
pub const GET_NAVIGATION_HISTORY: &str = "Page.getNavigationHistory";
pub const START_SCREENCAST: &str = "Page.startScreencast";
pub const STOP_SCREENCAST: &str = "Page.stopScreencast";
pub const SCREENCAST_FRAME_ACK: &str = "Page.screencastFrameAck";
pub const NAVIGATE: &str = "Page.navigate";
pub const GO_BACK: &str = "Page.goBack";
pub const GO_FORWARD: &str = "Page.goForward";
pub const RELOAD: &str = "Page.reload";
pub const DISPATCH_MOUSE_EVENT: &str = "Input.dispatchMouseEvent";
pub const DISPATCH_KEY_EVENT: &str = "Input.dispatchKeyEvent";

pub const EVENT_SCREENCAST_FRAME: &str = "Page.screencastFrame";
pub const EVENT_FRAME_NAVIGATED: &str = "Page.frameNavigated";

/// Serialize one `{id, method, params}` command.
pub fn command(id: u64, method: &str, params: Value) -> String {
    json!({
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string()
}

/// A decoded inbound text message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: u64,
        result: Value,
        error: Option<Value>,
    },
    Event {
        method: String,
        params: Value,
    },
}

pub fn parse_inbound(text: &str) -> Result<Inbound> {
    let val: Value = serde_json::from_str(text)?;
    if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
        return Ok(Inbound::Response {
            id,
            result: val.get("result").cloned().unwrap_or(Value::Null),
            error: val.get("error").cloned(),
        });
    }
    match val.get("method").and_then(|v| v.as_str()) {
        Some(method) => Ok(Inbound::Event {
            method: method.to_string(),
            params: val.get("params").cloned().unwrap_or(Value::Null),
        }),
        None => Err(Error::Protocol(format!(
            "message has neither id nor method: {}",
            truncate(text, 120)
        ))),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMetadata {
    #[serde(default)]
    pub device_width: f64,
    #[serde(default)]
    pub device_height: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreencastFrame {
    /// Base64-encoded image.
    pub data: String,
    #[serde(default)]
    pub metadata: FrameMetadata,
    /// Echoed back verbatim in the acknowledgement.
    pub session_id: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigatedFrame {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameNavigated {
    pub frame: NavigatedFrame,
}

impl FrameNavigated {
    pub fn is_main_frame(&self) -> bool {
        self.frame.parent_id.as_deref().map_or(true, str::is_empty)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationHistory {
    pub current_index: i64,
    #[serde(default)]
    pub entries: Vec<HistoryEntry>,
}

impl NavigationHistory {
    pub fn can_go_back(&self) -> bool {
        self.current_index > 0
    }

    pub fn can_go_forward(&self) -> bool {
        self.current_index < self.entries.len() as i64 - 1
    }

    /// Merge into the tracked state, keeping a known URL when the history
    /// entry for the current index is missing.
    pub fn apply(&self, state: &mut NavigationState) {
        state.can_go_back = self.can_go_back();
        state.can_go_forward = self.can_go_forward();
        if let Some(entry) = usize::try_from(self.current_index)
            .ok()
            .and_then(|i| self.entries.get(i))
        {
            if !entry.url.is_empty() {
                state.url = Some(entry.url.clone());
            }
        }
    }
}

pub fn start_screencast_params(format: &str, quality: u8, max_width: u32, max_height: u32) -> Value {
    json!({
        "format": format,
        "quality": quality,
        "maxWidth": max_width,
        "maxHeight": max_height,
        "everyNthFrame": 1,
    })
}

fn button_name(button: MouseButton) -> &'static str {
    match button {
        MouseButton::None => "none",
        MouseButton::Left => "left",
        MouseButton::Middle => "middle",
        MouseButton::Right => "right",
    }
}

/// Mouse params for an event already mapped into device coordinates.
pub fn mouse_event_params(event: &PointerEvent, x: f64, y: f64) -> Value {
    let kind = match event.kind {
        PointerKind::Down => "mousePressed",
        PointerKind::Up => "mouseReleased",
        PointerKind::Move => "mouseMoved",
    };
    json!({
        "type": kind,
        "x": x,
        "y": y,
        "button": button_name(event.button),
        "clickCount": event.click_count,
        "modifiers": event.modifiers.bits(),
    })
}

pub fn wheel_event_params(event: &WheelEvent, x: f64, y: f64) -> Value {
    json!({
        "type": "mouseWheel",
        "x": x,
        "y": y,
        "deltaX": event.delta_x,
        "deltaY": event.delta_y,
        "modifiers": event.modifiers.bits(),
    })
}

pub fn key_event_params(event: &KeyEvent) -> Value {
    let kind = match event.kind {
        KeyKind::Down if event.text.is_some() => "keyDown",
        KeyKind::Down => "rawKeyDown",
        KeyKind::Up => "keyUp",
        KeyKind::Char => "char",
    };
    let mut params = json!({
        "type": kind,
        "key": event.key,
        "code": event.code,
        "modifiers": event.modifiers.bits(),
    });
    if let Some(text) = &event.text {
        params["text"] = json!(text);
    }
    if let Some(key_code) = event.key_code {
        params["windowsVirtualKeyCode"] = json!(key_code);
    }
    params
}
