//! Frame-streaming client: a browser page's screencast rendered onto a
//! [`PixelSurface`](crate::surface::PixelSurface), with input and navigation
//! forwarded over the same remote-debugging socket.

mod client;
pub mod protocol;

pub use client::ScreencastClient;
