//! Pixel-framebuffer client: an RFB session tunnelled over a WebSocket and
//! rendered onto a [`PixelSurface`](crate::surface::PixelSurface).

mod client;
pub mod rfb;

pub use client::FramebufferClient;
