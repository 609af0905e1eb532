pub mod control_plane;
pub mod framebuffer;
pub mod input;
pub mod launcher;
pub mod registry;
pub mod screencast;
pub mod session;
pub mod surface;
pub mod terminal;
mod ws;

pub use control_plane::{ControlPlane, HttpControlPlane, PageOrigin};
pub use framebuffer::FramebufferClient;
pub use input::{InputEvent, KeyEvent, Modifiers, MouseButton, PointerEvent, WheelEvent};
pub use launcher::{launch_session, DefaultLauncher, SessionLauncher};
pub use registry::Registries;
pub use screencast::ScreencastClient;
pub use session::{ClientContext, EventReceiver, EventSender, NavigationState, RemoteSession, SessionEvent};
pub use surface::{PixelSurface, SharedSurface};
pub use terminal::TerminalClient;
