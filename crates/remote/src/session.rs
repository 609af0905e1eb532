//! Lifecycle contract shared by every protocol client.
//!
//! Each client runs as one spawned task and reports what happens through
//! [`SessionEvent`]s; the owner only ever sees events, never protocol errors.

use async_trait::async_trait;
use serde::Serialize;
use sessionview_core::{CapabilityToken, CapturedFrame, Config, ProtocolFamily, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::control_plane::{ControlPlane, HttpControlPlane, PageOrigin};
use crate::input::InputEvent;
use crate::registry::Registries;

/// Navigation state of a frame-streaming session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NavigationState {
    pub url: Option<String>,
    pub can_go_back: bool,
    pub can_go_forward: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    /// A frame was drawn onto the surface.
    Frame { count: u64, width: u32, height: u32 },
    /// Raw bytes received by a byte-stream session.
    Data(Vec<u8>),
    Navigation(NavigationState),
    /// Clipboard text pushed by the remote side.
    Clipboard(String),
    /// A transient failure; one reconnect is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration, reason: String },
    /// The session failed. `fatal` means the token will never be retried.
    ConnectionError {
        fatal: bool,
        code: Option<u16>,
        reason: String,
    },
    /// The remote side ended the session.
    Closed { clean: bool, code: Option<u16> },
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Common lifecycle interface over the three protocol clients.
#[async_trait]
pub trait RemoteSession: Send {
    fn family(&self) -> ProtocolFamily;

    fn token(&self) -> &CapabilityToken;

    fn is_connected(&self) -> bool;

    /// Queue a local input event. Returns false when it was not accepted.
    fn send_input(&self, input: InputEvent) -> bool;

    /// Tear the session down, returning the last rendered frame when
    /// `capture` is set and anything was rendered.
    async fn disconnect(self: Box<Self>, capture: bool) -> Option<CapturedFrame>;
}

/// Everything a client needs besides its token.
#[derive(Clone)]
pub struct ClientContext {
    pub config: Arc<Config>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub registries: Arc<Registries>,
}

impl ClientContext {
    /// HTTP control plane and the process-wide registries.
    pub fn from_config(config: Config) -> Result<Self> {
        let control_plane = Arc::new(HttpControlPlane::from_config(&config)?);
        Ok(Self {
            config: Arc::new(config),
            control_plane,
            registries: Registries::global(),
        })
    }

    pub fn new(
        config: Config,
        control_plane: Arc<dyn ControlPlane>,
        registries: Arc<Registries>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            control_plane,
            registries,
        }
    }

    pub fn interactive(&self) -> bool {
        self.config.interactive
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.config.reconnect.backoff_ms)
    }

    pub fn page_origin(&self) -> Result<PageOrigin> {
        PageOrigin::parse(&self.config.control_plane.page_origin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationCommand {
    Navigate(String),
    Back,
    Forward,
    Reload,
}

pub(crate) struct ShutdownRequest {
    pub capture: bool,
    pub reply: Option<oneshot::Sender<Option<CapturedFrame>>>,
}

impl ShutdownRequest {
    pub fn respond(self, frame: Option<CapturedFrame>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(frame);
        }
    }
}

pub(crate) enum ClientCommand {
    Input(InputEvent),
    Navigate(NavigationCommand),
    Shutdown(ShutdownRequest),
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Input(input) => input.name(),
            ClientCommand::Navigate(_) => "navigate",
            ClientCommand::Shutdown(_) => "shutdown",
        }
    }
}

/// Why a client stopped waiting on something.
pub(crate) enum Interrupt {
    Shutdown(ShutdownRequest),
    /// Another instance took the token over, or the registries were reset.
    Evicted,
    /// The handle went away without an explicit disconnect.
    HandleDropped,
}

/// Await `fut` unless a shutdown, an eviction or a dropped handle comes first.
///
/// Commands other than shutdown are dropped while waiting: input is only
/// meaningful on a live connection.
pub(crate) async fn race_stop<F: Future>(
    fut: F,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    evict: &mut watch::Receiver<bool>,
) -> std::result::Result<F::Output, Interrupt> {
    tokio::pin!(fut);
    if *evict.borrow() {
        return Err(Interrupt::Evicted);
    }
    loop {
        tokio::select! {
            out = &mut fut => return Ok(out),
            cmd = commands.recv() => match cmd {
                Some(ClientCommand::Shutdown(req)) => return Err(Interrupt::Shutdown(req)),
                Some(other) => debug!(command = other.name(), "Dropping command while not connected"),
                None => return Err(Interrupt::HandleDropped),
            },
            changed = evict.changed() => {
                if changed.is_err() || *evict.borrow() {
                    return Err(Interrupt::Evicted);
                }
            }
        }
    }
}

/// Map a WebSocket close code onto the clean/unclean split.
pub(crate) fn is_clean_close(code: Option<u16>) -> bool {
    code == Some(1000)
}

/// Close code reported when the connection dropped without a close frame.
pub(crate) const ABNORMAL_CLOSURE: u16 = 1006;
