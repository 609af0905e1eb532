//! Remote-framebuffer wire protocol, without any I/O.
//!
//! [`RfbHandshake`] drives version and security negotiation up to ServerInit;
//! [`ServerMessageDecoder`] then splits the byte stream into server messages.
//! Only the "None" security type is offered: the transport proxy already
//! authenticated the capability token.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_COPY_RECT: i32 = 1;
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

const SECURITY_INVALID: u8 = 0;
const SECURITY_NONE: u8 = 1;

const MSG_FRAMEBUFFER_UPDATE: u8 = 0;
const MSG_SET_COLOUR_MAP: u8 = 1;
const MSG_BELL: u8 = 2;
const MSG_SERVER_CUT_TEXT: u8 = 3;

/// Bytes per pixel of the negotiated RGBX format.
pub const BYTES_PER_PIXEL: usize = 4;

/// Largest desktop or rect edge accepted from a server.
pub const MAX_DIMENSION: u16 = 16384;

pub const BUTTON_LEFT: u8 = 1;
pub const BUTTON_MIDDLE: u8 = 2;
pub const BUTTON_RIGHT: u8 = 4;
pub const WHEEL_UP: u8 = 8;
pub const WHEEL_DOWN: u8 = 16;

pub const KEYSYM_CONTROL_L: u32 = 0xffe3;
pub const KEYSYM_ALT_L: u32 = 0xffe9;
pub const KEYSYM_DELETE: u32 = 0xffff;

#[derive(Debug, Error)]
pub enum RfbError {
    #[error("security handshake failed: {0}")]
    SecurityFailure(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RfbError {
    /// Security and authentication failures never succeed on retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RfbError::SecurityFailure(_) | RfbError::AuthenticationFailed(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfbVersion {
    V3_3,
    V3_7,
    V3_8,
}

impl RfbVersion {
    fn from_server(major: u32, minor: u32) -> Result<Self, RfbError> {
        match (major, minor) {
            (3, m) if m >= 8 => Ok(RfbVersion::V3_8),
            (3, 7) => Ok(RfbVersion::V3_7),
            (3, m) if m >= 3 => Ok(RfbVersion::V3_3),
            _ => Err(RfbError::Protocol(format!(
                "unsupported protocol version {}.{}",
                major, minor
            ))),
        }
    }

    fn greeting(&self) -> &'static [u8; 12] {
        match self {
            RfbVersion::V3_3 => b"RFB 003.003\n",
            RfbVersion::V3_7 => b"RFB 003.007\n",
            RfbVersion::V3_8 => b"RFB 003.008\n",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Bytes to write back to the server.
    Reply(Vec<u8>),
    /// Negotiation finished; regular messages follow.
    Ready(ServerInit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Version,
    Security,
    SecurityResult,
    ServerInit,
    Done,
}

#[derive(Debug)]
pub struct RfbHandshake {
    state: HandshakeState,
    version: RfbVersion,
}

impl Default for RfbHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl RfbHandshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Version,
            version: RfbVersion::V3_8,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    pub fn version(&self) -> RfbVersion {
        self.version
    }

    /// Consume as much of `buf` as the current state allows.
    pub fn advance(&mut self, buf: &mut BytesMut) -> Result<Vec<HandshakeStep>, RfbError> {
        let mut steps = Vec::new();
        loop {
            let progressed = match self.state {
                HandshakeState::Version => self.read_version(buf, &mut steps)?,
                HandshakeState::Security => self.read_security(buf, &mut steps)?,
                HandshakeState::SecurityResult => self.read_security_result(buf, &mut steps)?,
                HandshakeState::ServerInit => self.read_server_init(buf, &mut steps)?,
                HandshakeState::Done => false,
            };
            if !progressed {
                return Ok(steps);
            }
        }
    }

    fn read_version(&mut self, buf: &mut BytesMut, steps: &mut Vec<HandshakeStep>) -> Result<bool, RfbError> {
        if buf.len() < 12 {
            return Ok(false);
        }
        let greeting = buf.split_to(12);
        let text = std::str::from_utf8(&greeting)
            .map_err(|_| RfbError::Protocol("non-ASCII version greeting".into()))?;
        let parse = |s: &str| s.parse::<u32>().ok();
        let (major, minor) = match (text.get(0..4), text.get(4..7), text.get(8..11)) {
            (Some("RFB "), Some(major), Some(minor)) => match (parse(major), parse(minor)) {
                (Some(major), Some(minor)) => (major, minor),
                _ => return Err(RfbError::Protocol(format!("bad version greeting {:?}", text))),
            },
            _ => return Err(RfbError::Protocol(format!("bad version greeting {:?}", text))),
        };
        self.version = RfbVersion::from_server(major, minor)?;
        steps.push(HandshakeStep::Reply(self.version.greeting().to_vec()));
        self.state = HandshakeState::Security;
        Ok(true)
    }

    fn read_security(&mut self, buf: &mut BytesMut, steps: &mut Vec<HandshakeStep>) -> Result<bool, RfbError> {
        if self.version == RfbVersion::V3_3 {
            // The server picks the type on its own.
            if buf.len() < 4 {
                return Ok(false);
            }
            let kind = peek_u32(buf, 0);
            if kind == SECURITY_INVALID as u32 {
                return match read_reason(buf, 4)? {
                    Some(reason) => Err(RfbError::SecurityFailure(reason)),
                    None => Ok(false),
                };
            }
            buf.advance(4);
            if kind != SECURITY_NONE as u32 {
                return Err(RfbError::SecurityFailure(format!(
                    "server requires unsupported security type {}",
                    kind
                )));
            }
            self.enter_server_init(steps);
            return Ok(true);
        }

        if buf.is_empty() {
            return Ok(false);
        }
        let count = buf[0] as usize;
        if count == 0 {
            return match read_reason(buf, 1)? {
                Some(reason) => Err(RfbError::SecurityFailure(reason)),
                None => Ok(false),
            };
        }
        if buf.len() < 1 + count {
            return Ok(false);
        }
        let offered = buf.split_to(1 + count);
        if !offered[1..].contains(&SECURITY_NONE) {
            return Err(RfbError::SecurityFailure(format!(
                "no supported security type among {:?}",
                &offered[1..]
            )));
        }
        steps.push(HandshakeStep::Reply(vec![SECURITY_NONE]));
        if self.version == RfbVersion::V3_8 {
            self.state = HandshakeState::SecurityResult;
        } else {
            self.enter_server_init(steps);
        }
        Ok(true)
    }

    fn read_security_result(&mut self, buf: &mut BytesMut, steps: &mut Vec<HandshakeStep>) -> Result<bool, RfbError> {
        if buf.len() < 4 {
            return Ok(false);
        }
        if peek_u32(buf, 0) == 0 {
            buf.advance(4);
            self.enter_server_init(steps);
            return Ok(true);
        }
        match read_reason(buf, 4)? {
            Some(reason) => Err(RfbError::AuthenticationFailed(reason)),
            None => Ok(false),
        }
    }

    fn read_server_init(&mut self, buf: &mut BytesMut, steps: &mut Vec<HandshakeStep>) -> Result<bool, RfbError> {
        // width, height, 16-byte pixel format, name length
        const FIXED: usize = 2 + 2 + 16 + 4;
        if buf.len() < FIXED {
            return Ok(false);
        }
        let name_len = peek_u32(buf, 20) as usize;
        if buf.len() < FIXED + name_len {
            return Ok(false);
        }
        check_dimensions(peek_u16(buf, 0), peek_u16(buf, 2))?;
        let width = buf.get_u16();
        let height = buf.get_u16();
        buf.advance(16 + 4);
        let name = String::from_utf8_lossy(&buf.split_to(name_len)).into_owned();
        steps.push(HandshakeStep::Ready(ServerInit { width, height, name }));
        self.state = HandshakeState::Done;
        Ok(true)
    }

    fn enter_server_init(&mut self, steps: &mut Vec<HandshakeStep>) {
        // ClientInit: request a shared session.
        steps.push(HandshakeStep::Reply(vec![1]));
        self.state = HandshakeState::ServerInit;
    }
}

fn peek_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn peek_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn peek_i32(buf: &[u8], at: usize) -> i32 {
    peek_u32(buf, at) as i32
}

/// Read a length-prefixed reason string starting at `at`, consuming the
/// whole message once it is complete.
fn read_reason(buf: &mut BytesMut, at: usize) -> Result<Option<String>, RfbError> {
    if buf.len() < at + 4 {
        return Ok(None);
    }
    let len = peek_u32(buf, at) as usize;
    if buf.len() < at + 4 + len {
        return Ok(None);
    }
    let message = buf.split_to(at + 4 + len);
    Ok(Some(String::from_utf8_lossy(&message[at + 4..]).into_owned()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RectContent {
    /// RGBX pixels, row-major.
    Raw(Vec<u8>),
    CopyRect { src_x: u16, src_y: u16 },
    /// The remote desktop changed size to the rect's width and height.
    DesktopSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub content: RectContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    FramebufferUpdate(Vec<Rect>),
    SetColourMap,
    Bell,
    ServerCutText(String),
}

/// Splits the post-handshake byte stream into [`ServerMessage`]s.
#[derive(Debug, Default)]
pub struct ServerMessageDecoder;

impl Decoder for ServerMessageDecoder {
    type Item = ServerMessage;
    type Error = RfbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerMessage>, RfbError> {
        if src.is_empty() {
            return Ok(None);
        }
        match src[0] {
            MSG_FRAMEBUFFER_UPDATE => decode_update(src),
            MSG_SET_COLOUR_MAP => {
                if src.len() < 6 {
                    return Ok(None);
                }
                let len = 6 + peek_u16(src, 4) as usize * 6;
                if src.len() < len {
                    return Ok(None);
                }
                src.advance(len);
                Ok(Some(ServerMessage::SetColourMap))
            }
            MSG_BELL => {
                src.advance(1);
                Ok(Some(ServerMessage::Bell))
            }
            MSG_SERVER_CUT_TEXT => {
                if src.len() < 8 {
                    return Ok(None);
                }
                let len = 8 + peek_u32(src, 4) as usize;
                if src.len() < len {
                    return Ok(None);
                }
                let message = src.split_to(len);
                // Latin-1 maps one byte to one code point.
                let text = message[8..].iter().map(|&b| b as char).collect();
                Ok(Some(ServerMessage::ServerCutText(text)))
            }
            other => Err(RfbError::Protocol(format!("unknown server message type {}", other))),
        }
    }
}

fn decode_update(src: &mut BytesMut) -> Result<Option<ServerMessage>, RfbError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let count = peek_u16(src, 2) as usize;
    let mut offset = 4;
    let mut rects = Vec::with_capacity(count);
    for _ in 0..count {
        if src.len() < offset + 12 {
            return Ok(None);
        }
        let x = peek_u16(src, offset);
        let y = peek_u16(src, offset + 2);
        let width = peek_u16(src, offset + 4);
        let height = peek_u16(src, offset + 6);
        let encoding = peek_i32(src, offset + 8);
        check_dimensions(width, height)?;
        offset += 12;

        let content = match encoding {
            ENCODING_RAW => {
                let len = width as usize * height as usize * BYTES_PER_PIXEL;
                if src.len() < offset + len {
                    return Ok(None);
                }
                let pixels = src[offset..offset + len].to_vec();
                offset += len;
                RectContent::Raw(pixels)
            }
            ENCODING_COPY_RECT => {
                if src.len() < offset + 4 {
                    return Ok(None);
                }
                let content = RectContent::CopyRect {
                    src_x: peek_u16(src, offset),
                    src_y: peek_u16(src, offset + 2),
                };
                offset += 4;
                content
            }
            ENCODING_DESKTOP_SIZE => RectContent::DesktopSize,
            other => {
                return Err(RfbError::Protocol(format!("unsupported rect encoding {}", other)));
            }
        };
        rects.push(Rect {
            x,
            y,
            width,
            height,
            content,
        });
    }
    src.advance(offset);
    Ok(Some(ServerMessage::FramebufferUpdate(rects)))
}

fn check_dimensions(width: u16, height: u16) -> Result<(), RfbError> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(RfbError::Protocol(format!(
            "dimensions {}x{} exceed {}",
            width, height, MAX_DIMENSION
        )));
    }
    Ok(())
}

/// SetPixelFormat: 32bpp little-endian true colour, red in the lowest byte.
pub fn set_pixel_format() -> Vec<u8> {
    let mut msg = BytesMut::with_capacity(20);
    msg.put_u8(0);
    msg.put_bytes(0, 3);
    msg.put_u8(32); // bits per pixel
    msg.put_u8(24); // depth
    msg.put_u8(0); // big-endian flag
    msg.put_u8(1); // true colour
    msg.put_u16(255);
    msg.put_u16(255);
    msg.put_u16(255);
    msg.put_u8(0); // red shift
    msg.put_u8(8); // green shift
    msg.put_u8(16); // blue shift
    msg.put_bytes(0, 3);
    msg.to_vec()
}

pub fn set_encodings(encodings: &[i32]) -> Vec<u8> {
    let mut msg = BytesMut::with_capacity(4 + encodings.len() * 4);
    msg.put_u8(2);
    msg.put_u8(0);
    msg.put_u16(encodings.len() as u16);
    for encoding in encodings {
        msg.put_i32(*encoding);
    }
    msg.to_vec()
}

pub fn framebuffer_update_request(incremental: bool, x: u16, y: u16, width: u16, height: u16) -> Vec<u8> {
    let mut msg = BytesMut::with_capacity(10);
    msg.put_u8(3);
    msg.put_u8(incremental as u8);
    msg.put_u16(x);
    msg.put_u16(y);
    msg.put_u16(width);
    msg.put_u16(height);
    msg.to_vec()
}

pub fn key_event(down: bool, keysym: u32) -> Vec<u8> {
    let mut msg = BytesMut::with_capacity(8);
    msg.put_u8(4);
    msg.put_u8(down as u8);
    msg.put_bytes(0, 2);
    msg.put_u32(keysym);
    msg.to_vec()
}

pub fn pointer_event(button_mask: u8, x: u16, y: u16) -> Vec<u8> {
    let mut msg = BytesMut::with_capacity(6);
    msg.put_u8(5);
    msg.put_u8(button_mask);
    msg.put_u16(x);
    msg.put_u16(y);
    msg.to_vec()
}

/// Messages sent right after ServerInit.
pub fn session_setup(init: &ServerInit) -> Vec<Vec<u8>> {
    vec![
        set_pixel_format(),
        set_encodings(&[ENCODING_RAW, ENCODING_COPY_RECT, ENCODING_DESKTOP_SIZE]),
        framebuffer_update_request(false, 0, 0, init.width, init.height),
    ]
}

/// X11 keysym for a DOM-style key value.
pub fn keysym_for(key: &str) -> Option<u32> {
    let named = match key {
        "Backspace" => 0xff08,
        "Tab" => 0xff09,
        "Enter" => 0xff0d,
        "Escape" => 0xff1b,
        "Delete" => KEYSYM_DELETE,
        "Home" => 0xff50,
        "ArrowLeft" => 0xff51,
        "ArrowUp" => 0xff52,
        "ArrowRight" => 0xff53,
        "ArrowDown" => 0xff54,
        "PageUp" => 0xff55,
        "PageDown" => 0xff56,
        "End" => 0xff57,
        "Insert" => 0xff63,
        "Shift" => 0xffe1,
        "Control" => KEYSYM_CONTROL_L,
        "CapsLock" => 0xffe5,
        "Meta" => 0xffe7,
        "Alt" => KEYSYM_ALT_L,
        _ => 0,
    };
    if named != 0 {
        return Some(named);
    }
    if let Some(n) = key.strip_prefix('F').and_then(|n| n.parse::<u32>().ok()) {
        if (1..=12).contains(&n) {
            return Some(0xffbe + n - 1);
        }
    }
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if (c as u32) < 0x100 => Some(c as u32),
        (Some(c), None) => Some(0x0100_0000 | c as u32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_init_bytes(width: u16, height: u16, name: &str) -> Vec<u8> {
        let mut b = BytesMut::new();
        b.put_u16(width);
        b.put_u16(height);
        b.put_bytes(0, 16);
        b.put_u32(name.len() as u32);
        b.put_slice(name.as_bytes());
        b.to_vec()
    }

    fn replies(steps: &[HandshakeStep]) -> Vec<Vec<u8>> {
        steps
            .iter()
            .filter_map(|s| match s {
                HandshakeStep::Reply(bytes) => Some(bytes.clone()),
                HandshakeStep::Ready(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_handshake_v38_none() {
        let mut hs = RfbHandshake::new();
        let mut buf = BytesMut::from(&b"RFB 003.008\n"[..]);
        let steps = hs.advance(&mut buf).unwrap();
        assert_eq!(replies(&steps), vec![b"RFB 003.008\n".to_vec()]);

        buf.extend_from_slice(&[2, 2, 1]);
        let steps = hs.advance(&mut buf).unwrap();
        assert_eq!(replies(&steps), vec![vec![1]]);

        // Security result split across reads.
        buf.extend_from_slice(&[0, 0]);
        assert!(hs.advance(&mut buf).unwrap().is_empty());
        buf.extend_from_slice(&[0, 0]);
        let steps = hs.advance(&mut buf).unwrap();
        assert_eq!(replies(&steps), vec![vec![1]]);

        buf.extend_from_slice(&server_init_bytes(1024, 768, "desk"));
        let steps = hs.advance(&mut buf).unwrap();
        assert_eq!(
            steps,
            vec![HandshakeStep::Ready(ServerInit {
                width: 1024,
                height: 768,
                name: "desk".into()
            })]
        );
        assert!(hs.is_done());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_v33_in_one_read() {
        let mut hs = RfbHandshake::new();
        let mut buf = BytesMut::from(&b"RFB 003.003\n"[..]);
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(&server_init_bytes(8, 6, ""));
        let steps = hs.advance(&mut buf).unwrap();
        assert_eq!(hs.version(), RfbVersion::V3_3);
        assert_eq!(replies(&steps), vec![b"RFB 003.003\n".to_vec(), vec![1]]);
        assert!(matches!(steps.last(), Some(HandshakeStep::Ready(init)) if init.width == 8));
    }

    #[test]
    fn test_newer_minor_version_negotiates_down() {
        let mut hs = RfbHandshake::new();
        let mut buf = BytesMut::from(&b"RFB 003.889\n"[..]);
        hs.advance(&mut buf).unwrap();
        assert_eq!(hs.version(), RfbVersion::V3_8);
    }

    #[test]
    fn test_security_failure_is_fatal() {
        let mut hs = RfbHandshake::new();
        let mut buf = BytesMut::from(&b"RFB 003.008\n"[..]);
        buf.extend_from_slice(&[0, 0, 0, 0, 4]);
        buf.extend_from_slice(b"nope");
        let err = hs.advance(&mut buf).unwrap_err();
        assert!(matches!(&err, RfbError::SecurityFailure(r) if r == "nope"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_vnc_auth_only_is_rejected() {
        let mut hs = RfbHandshake::new();
        let mut buf = BytesMut::from(&b"RFB 003.008\n"[..]);
        buf.extend_from_slice(&[1, 2]);
        let err = hs.advance(&mut buf).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_authentication_failure_is_fatal() {
        let mut hs = RfbHandshake::new();
        let mut buf = BytesMut::from(&b"RFB 003.008\n"[..]);
        buf.extend_from_slice(&[1, 1, 0, 0, 0, 1, 0, 0, 0, 6]);
        buf.extend_from_slice(b"denied");
        let err = hs.advance(&mut buf).unwrap_err();
        assert!(matches!(&err, RfbError::AuthenticationFailed(r) if r == "denied"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bad_greeting_is_not_fatal() {
        let mut hs = RfbHandshake::new();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200"[..]);
        let err = hs.advance(&mut buf).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_decode_update_waits_for_complete_rect() {
        let mut msg = BytesMut::new();
        msg.put_u8(0);
        msg.put_u8(0);
        msg.put_u16(2);
        msg.put_u16(0);
        msg.put_u16(0);
        msg.put_u16(1);
        msg.put_u16(1);
        msg.put_i32(ENCODING_RAW);
        msg.put_slice(&[1, 2, 3, 0]);
        msg.put_u16(1);
        msg.put_u16(0);
        msg.put_u16(1);
        msg.put_u16(1);
        msg.put_i32(ENCODING_COPY_RECT);
        msg.put_u16(0);
        msg.put_u16(0);
        msg.put_u8(MSG_BELL);

        let full = msg.to_vec();
        let mut decoder = ServerMessageDecoder;
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(decoder.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), full.len() - 3);

        let mut buf = BytesMut::from(&full[..]);
        let update = decoder.decode(&mut buf).unwrap().unwrap();
        match update {
            ServerMessage::FramebufferUpdate(rects) => {
                assert_eq!(rects.len(), 2);
                assert_eq!(rects[0].content, RectContent::Raw(vec![1, 2, 3, 0]));
                assert_eq!(rects[1].content, RectContent::CopyRect { src_x: 0, src_y: 0 });
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(ServerMessage::Bell));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_cut_text_latin1() {
        let mut buf = BytesMut::new();
        buf.put_u8(MSG_SERVER_CUT_TEXT);
        buf.put_bytes(0, 3);
        buf.put_u32(3);
        buf.put_slice(&[b'c', 0xe9, b'!']);
        let msg = ServerMessageDecoder.decode(&mut buf).unwrap();
        assert_eq!(msg, Some(ServerMessage::ServerCutText("cé!".into())));
    }

    #[test]
    fn test_oversized_dimensions_are_rejected() {
        let mut hs = RfbHandshake::new();
        let mut buf = BytesMut::from(&b"RFB 003.003\n"[..]);
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(&server_init_bytes(MAX_DIMENSION + 1, 600, "huge"));
        let err = hs.advance(&mut buf).unwrap_err();
        assert!(matches!(err, RfbError::Protocol(_)));
        assert!(!err.is_fatal());

        let mut msg = BytesMut::new();
        msg.put_u8(0);
        msg.put_u8(0);
        msg.put_u16(1);
        msg.put_u16(0);
        msg.put_u16(0);
        msg.put_u16(800);
        msg.put_u16(u16::MAX);
        msg.put_i32(ENCODING_DESKTOP_SIZE);
        assert!(ServerMessageDecoder.decode(&mut msg).is_err());

        // A raw rect this large would otherwise wait for gigabytes of pixels.
        let mut msg = BytesMut::new();
        msg.put_u8(0);
        msg.put_u8(0);
        msg.put_u16(1);
        msg.put_u16(0);
        msg.put_u16(0);
        msg.put_u16(u16::MAX);
        msg.put_u16(u16::MAX);
        msg.put_i32(ENCODING_RAW);
        assert!(ServerMessageDecoder.decode(&mut msg).is_err());

        let mut ok = BytesMut::new();
        ok.extend_from_slice(&server_init_bytes(MAX_DIMENSION, MAX_DIMENSION, ""));
        let mut hs = RfbHandshake::new();
        let mut buf = BytesMut::from(&b"RFB 003.003\n"[..]);
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(&ok);
        assert!(hs.advance(&mut buf).is_ok());
        assert!(hs.is_done());
    }

    #[test]
    fn test_unknown_message_type() {
        let mut buf = BytesMut::from(&[0x42u8][..]);
        assert!(ServerMessageDecoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_client_message_layouts() {
        assert_eq!(pointer_event(BUTTON_LEFT, 10, 300), vec![5, 1, 0, 10, 1, 44]);
        assert_eq!(key_event(true, KEYSYM_DELETE), vec![4, 1, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(set_pixel_format().len(), 20);
        let encodings = set_encodings(&[ENCODING_RAW, ENCODING_DESKTOP_SIZE]);
        assert_eq!(encodings, vec![2, 0, 0, 2, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0x21]);
    }

    #[test]
    fn test_keysyms() {
        assert_eq!(keysym_for("a"), Some(0x61));
        assert_eq!(keysym_for("Enter"), Some(0xff0d));
        assert_eq!(keysym_for("F5"), Some(0xffc2));
        assert_eq!(keysym_for("€"), Some(0x0100_20ac));
        assert_eq!(keysym_for("Unidentified"), None);
    }
}
