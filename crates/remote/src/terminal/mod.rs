//! Byte-stream terminal client backed by a VT100 emulation surface.

mod client;

pub use client::{SharedScreen, TerminalClient};
