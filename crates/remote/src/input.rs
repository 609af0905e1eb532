//! Local input events and their translation into remote coordinates.

use serde::{Deserialize, Serialize};

/// Keyboard/mouse modifier flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub shift: bool,
}

impl Modifiers {
    pub const ALT: u8 = 1;
    pub const CTRL: u8 = 2;
    pub const META: u8 = 4;
    pub const SHIFT: u8 = 8;

    /// Pack into the remote-debugging bitmask (alt=1, ctrl=2, meta=4, shift=8).
    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.alt {
            bits |= Self::ALT;
        }
        if self.ctrl {
            bits |= Self::CTRL;
        }
        if self.meta {
            bits |= Self::META;
        }
        if self.shift {
            bits |= Self::SHIFT;
        }
        bits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    None,
    Left,
    Middle,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerKind {
    Down,
    Up,
    Move,
}

/// A pointer event in surface pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
    pub kind: PointerKind,
    pub x: f64,
    pub y: f64,
    pub button: MouseButton,
    #[serde(default = "default_click_count")]
    pub click_count: u32,
    #[serde(default)]
    pub modifiers: Modifiers,
}

fn default_click_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WheelEvent {
    pub x: f64,
    pub y: f64,
    pub delta_x: f64,
    pub delta_y: f64,
    #[serde(default)]
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Down,
    Up,
    /// A character produced by a key press.
    Char,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub kind: KeyKind,
    /// DOM-style key value, e.g. "a", "Enter", "ArrowLeft".
    pub key: String,
    /// DOM-style physical code, e.g. "KeyA".
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub key_code: Option<u32>,
    #[serde(default)]
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub fn down(key: &str) -> Self {
        Self {
            kind: KeyKind::Down,
            key: key.to_string(),
            code: String::new(),
            text: None,
            key_code: None,
            modifiers: Modifiers::default(),
        }
    }

    pub fn up(key: &str) -> Self {
        Self {
            kind: KeyKind::Up,
            ..Self::down(key)
        }
    }
}

/// Everything a host can forward to a remote session.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Pointer(PointerEvent),
    Wheel(WheelEvent),
    Key(KeyEvent),
    /// Raw keystroke payload for byte-stream sessions.
    Bytes(Vec<u8>),
}

impl InputEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InputEvent::Pointer(_) => "pointer",
            InputEvent::Wheel(_) => "wheel",
            InputEvent::Key(_) => "key",
            InputEvent::Bytes(_) => "bytes",
        }
    }
}

/// Map a surface coordinate into the remote device's coordinate space.
///
/// Uses the last reported device dimensions; returns `None` while either
/// side has no usable size.
pub fn map_point(
    x: f64,
    y: f64,
    surface: (u32, u32),
    device: (f64, f64),
) -> Option<(f64, f64)> {
    let (sw, sh) = surface;
    let (dw, dh) = device;
    if sw == 0 || sh == 0 || dw <= 0.0 || dh <= 0.0 {
        return None;
    }
    Some((x * dw / sw as f64, y * dh / sh as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modifier_bits() {
        assert_eq!(Modifiers::default().bits(), 0);
        let all = Modifiers {
            alt: true,
            ctrl: true,
            meta: true,
            shift: true,
        };
        assert_eq!(all.bits(), 15);
        let ctrl_shift = Modifiers {
            ctrl: true,
            shift: true,
            ..Default::default()
        };
        assert_eq!(ctrl_shift.bits(), 10);
    }

    #[test]
    fn test_center_maps_to_center_for_any_ratio() {
        let cases = [
            ((1280, 720), (1280.0, 720.0)),
            ((640, 360), (1920.0, 1080.0)),
            ((800, 600), (375.0, 812.0)),
            ((3, 7), (1000.0, 10.0)),
        ];
        for (surface, device) in cases {
            let (cx, cy) = (surface.0 as f64 / 2.0, surface.1 as f64 / 2.0);
            let (rx, ry) = map_point(cx, cy, surface, device).unwrap();
            assert!((rx - device.0 / 2.0).abs() < 1e-9, "{:?} -> {}", surface, rx);
            assert!((ry - device.1 / 2.0).abs() < 1e-9, "{:?} -> {}", surface, ry);
        }
    }

    #[test]
    fn test_map_point_scales_per_axis() {
        let (x, y) = map_point(100.0, 50.0, (640, 360), (1280.0, 1080.0)).unwrap();
        assert_eq!((x, y), (200.0, 150.0));
    }

    #[test]
    fn test_map_point_without_dimensions() {
        assert!(map_point(1.0, 1.0, (0, 0), (100.0, 100.0)).is_none());
        assert!(map_point(1.0, 1.0, (10, 10), (0.0, 100.0)).is_none());
    }
}
