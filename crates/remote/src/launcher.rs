//! Selects the concrete client for a protocol family.

use sessionview_core::{CapabilityToken, ProtocolFamily};
use tokio::sync::mpsc;
use tracing::debug;

use crate::framebuffer::FramebufferClient;
use crate::screencast::ScreencastClient;
use crate::session::{ClientContext, EventReceiver, RemoteSession, SessionEvent};
use crate::terminal::TerminalClient;

/// Start the client for `family` and return it with its event stream.
pub fn launch_session(
    family: ProtocolFamily,
    token: CapabilityToken,
    ctx: &ClientContext,
) -> (Box<dyn RemoteSession>, EventReceiver) {
    let (events, rx) = mpsc::unbounded_channel();
    if ctx.registries.fatal(family).contains(&token) {
        // The client stays inert; the caller still learns the token is dead.
        debug!(family = %family, token = %token, "Launching previously rejected token");
        let _ = events.send(SessionEvent::ConnectionError {
            fatal: true,
            code: None,
            reason: "token was previously rejected".to_string(),
        });
    }
    let ctx = ctx.clone();
    let session: Box<dyn RemoteSession> = match family {
        ProtocolFamily::Screencast => Box::new(ScreencastClient::connect(token, ctx, events)),
        ProtocolFamily::Framebuffer => Box::new(FramebufferClient::connect(token, ctx, events)),
        ProtocolFamily::Terminal => Box::new(TerminalClient::connect(token, ctx, events)),
    };
    (session, rx)
}

/// Seam between session supervision and client construction.
pub trait SessionLauncher: Send + Sync {
    fn launch(&self, family: ProtocolFamily, token: CapabilityToken) -> (Box<dyn RemoteSession>, EventReceiver);
}

pub struct DefaultLauncher {
    ctx: ClientContext,
}

impl DefaultLauncher {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }
}

impl SessionLauncher for DefaultLauncher {
    fn launch(&self, family: ProtocolFamily, token: CapabilityToken) -> (Box<dyn RemoteSession>, EventReceiver) {
        launch_session(family, token, &self.ctx)
    }
}
