use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use image::RgbaImage;
use serde_json::{json, Value};
use sessionview_core::{CapabilityToken, CapturedFrame, Error, ProtocolFamily, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::protocol::{self, FrameNavigated, Inbound, NavigationHistory, ScreencastFrame};
use crate::control_plane::PageOrigin;
use crate::input::{map_point, InputEvent};
use crate::registry::{next_owner_id, Ownership};
use crate::session::{
    race_stop, ClientCommand, ClientContext, EventSender, Interrupt, NavigationCommand,
    NavigationState, RemoteSession, SessionEvent, ShutdownRequest,
};
use crate::surface::{self, capture_shared, lock_surface, PixelSurface, SharedSurface};
use crate::ws::{connect_error, status_of, WsSink, WsSource};

const FAMILY: ProtocolFamily = ProtocolFamily::Screencast;

/// Handle to a running screencast session.
pub struct ScreencastClient {
    token: CapabilityToken,
    ownership: Ownership,
    interactive: bool,
    commands: mpsc::UnboundedSender<ClientCommand>,
    connected: Arc<AtomicBool>,
    surface: SharedSurface,
    task: Option<JoinHandle<()>>,
}

impl ScreencastClient {
    /// Start a session for `token`, replacing any session already registered
    /// for it. A token marked fatal yields an inert handle.
    pub fn connect(token: CapabilityToken, ctx: ClientContext, events: EventSender) -> Self {
        let ownership = Ownership {
            registries: ctx.registries.clone(),
            family: FAMILY,
            token: token.clone(),
            owner: next_owner_id(),
        };
        let (commands, command_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let surface = surface::shared(PixelSurface::new());
        let interactive = ctx.interactive();

        let task = if ownership.is_fatal() {
            debug!(token = %token, "Screencast token is marked fatal, not connecting");
            None
        } else {
            let (evict_tx, evict_rx) = watch::channel(false);
            ctx.registries
                .connections(FAMILY)
                .register(&token, ownership.owner, evict_tx);
            let worker = Worker {
                ctx,
                ownership: ownership.clone(),
                events,
                commands: command_rx,
                evict: evict_rx,
                connected: connected.clone(),
                surface: surface.clone(),
                next_id: 0,
                device: (0.0, 0.0),
                navigation: NavigationState::default(),
                pending_history: HashSet::new(),
            };
            Some(tokio::spawn(worker.run()))
        };

        Self {
            token,
            ownership,
            interactive,
            commands,
            connected,
            surface,
            task,
        }
    }

    pub fn surface(&self) -> SharedSurface {
        self.surface.clone()
    }

    pub fn navigate(&self, url: &str) -> bool {
        self.send_navigation(NavigationCommand::Navigate(url.to_string()))
    }

    pub fn go_back(&self) -> bool {
        self.send_navigation(NavigationCommand::Back)
    }

    pub fn go_forward(&self) -> bool {
        self.send_navigation(NavigationCommand::Forward)
    }

    pub fn reload(&self) -> bool {
        self.send_navigation(NavigationCommand::Reload)
    }

    fn send_navigation(&self, command: NavigationCommand) -> bool {
        self.interactive && self.commands.send(ClientCommand::Navigate(command)).is_ok()
    }
}

#[async_trait]
impl RemoteSession for ScreencastClient {
    fn family(&self) -> ProtocolFamily {
        FAMILY
    }

    fn token(&self) -> &CapabilityToken {
        &self.token
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_input(&self, input: InputEvent) -> bool {
        self.interactive && self.commands.send(ClientCommand::Input(input)).is_ok()
    }

    async fn disconnect(mut self: Box<Self>, capture: bool) -> Option<CapturedFrame> {
        let (reply, rx) = oneshot::channel();
        let request = ShutdownRequest {
            capture,
            reply: Some(reply),
        };
        let answered = match self.commands.send(ClientCommand::Shutdown(request)) {
            Ok(()) => rx.await.ok(),
            Err(_) => None,
        };
        let frame = match answered {
            Some(frame) => frame,
            // The worker already stopped; the surface still holds its last frame.
            None if capture => capture_shared(&self.surface),
            None => None,
        };
        self.ownership.release();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        frame
    }
}

impl Drop for ScreencastClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.ownership.release();
    }
}

/// How one connection attempt ended.
enum Attempt {
    Retry(String),
    Exit(Exit),
}

enum Exit {
    Shutdown(ShutdownRequest, Option<CapturedFrame>),
    Evicted,
    HandleDropped,
    Fatal,
}

enum Step {
    Socket(Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Command(Option<ClientCommand>),
    /// The eviction flag changed; true when its sender is gone.
    Evict(bool),
}

struct Worker {
    ctx: ClientContext,
    ownership: Ownership,
    events: EventSender,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    evict: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    surface: SharedSurface,
    next_id: u64,
    /// Device dimensions reported with the last frame.
    device: (f64, f64),
    navigation: NavigationState,
    pending_history: HashSet<u64>,
}

impl Worker {
    async fn run(mut self) {
        let token = self.ownership.token.clone();
        let origin = match self.ctx.page_origin() {
            Ok(origin) => origin,
            Err(e) => {
                warn!(token = %token, error = %e, "Cannot build screencast endpoint");
                self.emit(SessionEvent::ConnectionError {
                    fatal: false,
                    code: None,
                    reason: e.to_string(),
                });
                self.finish(Exit::HandleDropped);
                return;
            }
        };

        let backoff = self.ctx.backoff();
        let mut attempt: u32 = 0;
        let exit = 'reconnect: loop {
            if self.ownership.is_fatal() {
                break 'reconnect Exit::Fatal;
            }
            info!(token = %token, attempt, "Screencast connecting");

            let reason = match self.attempt(&origin, &mut attempt).await {
                Attempt::Exit(exit) => break 'reconnect exit,
                Attempt::Retry(reason) => reason,
            };

            attempt += 1;
            warn!(token = %token, attempt, error = %reason, delay_ms = backoff.as_millis() as u64, "Screencast reconnecting");
            self.emit(SessionEvent::Reconnecting {
                attempt,
                delay: backoff,
                reason,
            });
            if let Err(interrupt) = race_stop(
                tokio::time::sleep(backoff),
                &mut self.commands,
                &mut self.evict,
            )
            .await
            {
                break 'reconnect self.interrupted(interrupt);
            }
        };
        self.finish(exit);
    }

    /// Lookup, connect and stream until the connection ends.
    async fn attempt(&mut self, origin: &PageOrigin, attempt: &mut u32) -> Attempt {
        // Responses for requests sent on an earlier socket never arrive.
        self.pending_history.clear();
        let token = self.ownership.token.clone();
        let control_plane = self.ctx.control_plane.clone();
        let lookup = race_stop(
            control_plane.screencast_session(&token),
            &mut self.commands,
            &mut self.evict,
        )
        .await;
        let descriptor = match lookup {
            Ok(Ok(descriptor)) => descriptor,
            Ok(Err(e)) => return self.failed(e),
            Err(interrupt) => return Attempt::Exit(self.interrupted(interrupt)),
        };

        let endpoint = match descriptor.endpoint() {
            Some(endpoint) => endpoint.to_string(),
            None => return Attempt::Retry("no debuggable target in session descriptor".into()),
        };
        let url = match origin.duplex_url(&endpoint) {
            Ok(url) => url,
            Err(e) => return Attempt::Retry(e.to_string()),
        };

        let connect = race_stop(connect_async(url.as_str()), &mut self.commands, &mut self.evict).await;
        let socket = match connect {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(e)) => return self.failed(connect_error(e)),
            Err(interrupt) => return Attempt::Exit(self.interrupted(interrupt)),
        };
        let (mut sink, mut source) = socket.split();

        if let Err(e) = self.start(&mut sink).await {
            return Attempt::Retry(e.to_string());
        }
        info!(token = %token, "Screencast connected");
        *attempt = 0;
        self.connected.store(true, Ordering::SeqCst);
        self.emit(SessionEvent::Connected);

        let outcome = self.stream(&mut sink, &mut source).await;
        self.connected.store(false, Ordering::SeqCst);
        outcome
    }

    async fn start(&mut self, sink: &mut WsSink) -> Result<()> {
        self.send(sink, protocol::PAGE_ENABLE, json!({})).await?;
        self.request_history(sink).await?;
        let cfg = &self.ctx.config.screencast;
        let params = protocol::start_screencast_params(&cfg.format, cfg.quality, cfg.max_width, cfg.max_height);
        self.send(sink, protocol::START_SCREENCAST, params).await?;
        Ok(())
    }

    async fn stream(&mut self, sink: &mut WsSink, source: &mut WsSource) -> Attempt {
        loop {
            let step = tokio::select! {
                msg = source.next() => Step::Socket(msg),
                cmd = self.commands.recv() => Step::Command(cmd),
                changed = self.evict.changed() => Step::Evict(changed.is_err()),
            };

            match step {
                Step::Socket(Some(Ok(Message::Text(text)))) => {
                    if let Err(e) = self.handle_text(sink, &text).await {
                        return Attempt::Retry(e.to_string());
                    }
                }
                Step::Socket(Some(Ok(Message::Close(frame)))) => {
                    debug!(token = %self.ownership.token, frame = ?frame, "Screencast closed by remote");
                    return Attempt::Retry("connection closed by remote".into());
                }
                Step::Socket(Some(Ok(_))) => {}
                Step::Socket(Some(Err(e))) => return Attempt::Retry(e.to_string()),
                Step::Socket(None) => return Attempt::Retry("connection lost".into()),
                Step::Command(Some(ClientCommand::Shutdown(req))) => {
                    return Attempt::Exit(self.teardown(sink, req).await);
                }
                Step::Command(Some(ClientCommand::Input(input))) => {
                    if let Err(e) = self.forward_input(sink, input).await {
                        return Attempt::Retry(e.to_string());
                    }
                }
                Step::Command(Some(ClientCommand::Navigate(nav))) => {
                    if let Err(e) = self.forward_navigation(sink, nav).await {
                        return Attempt::Retry(e.to_string());
                    }
                }
                Step::Command(None) => {
                    let _ = sink.close().await;
                    return Attempt::Exit(Exit::HandleDropped);
                }
                Step::Evict(closed) => {
                    if closed || *self.evict.borrow() {
                        let _ = sink.close().await;
                        return Attempt::Exit(Exit::Evicted);
                    }
                }
            }
        }
    }

    /// Stop the stream, capture, then close.
    async fn teardown(&mut self, sink: &mut WsSink, req: ShutdownRequest) -> Exit {
        if let Err(e) = self.send(sink, protocol::STOP_SCREENCAST, json!({})).await {
            debug!(error = %e, "Failed to stop screencast");
        }
        let frame = if req.capture {
            capture_shared(&self.surface)
        } else {
            None
        };
        let _ = sink.close().await;
        Exit::Shutdown(req, frame)
    }

    async fn handle_text(&mut self, sink: &mut WsSink, text: &str) -> Result<()> {
        let inbound = match protocol::parse_inbound(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "Dropping malformed screencast message");
                return Ok(());
            }
        };
        match inbound {
            Inbound::Event { method, params } if method == protocol::EVENT_SCREENCAST_FRAME => {
                match serde_json::from_value::<ScreencastFrame>(params) {
                    Ok(frame) => self.handle_frame(sink, frame).await,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed screencast frame");
                        Ok(())
                    }
                }
            }
            Inbound::Event { method, params } if method == protocol::EVENT_FRAME_NAVIGATED => {
                let navigated = match serde_json::from_value::<FrameNavigated>(params) {
                    Ok(navigated) => navigated,
                    Err(e) => {
                        debug!(error = %e, "Ignoring malformed frameNavigated");
                        return Ok(());
                    }
                };
                if navigated.is_main_frame() {
                    self.navigation.url = Some(navigated.frame.url);
                    self.emit(SessionEvent::Navigation(self.navigation.clone()));
                    self.request_history(sink).await?;
                }
                Ok(())
            }
            Inbound::Event { .. } => Ok(()),
            Inbound::Response { id, result, error } => {
                if !self.pending_history.remove(&id) {
                    return Ok(());
                }
                if let Some(error) = error {
                    debug!(id, error = %error, "Navigation history request failed");
                    return Ok(());
                }
                match serde_json::from_value::<NavigationHistory>(result) {
                    Ok(history) => {
                        history.apply(&mut self.navigation);
                        self.emit(SessionEvent::Navigation(self.navigation.clone()));
                    }
                    Err(e) => debug!(error = %e, "Ignoring malformed navigation history"),
                }
                Ok(())
            }
        }
    }

    /// Decode, draw, then acknowledge. Undecodable frames are never acked.
    async fn handle_frame(&mut self, sink: &mut WsSink, frame: ScreencastFrame) -> Result<()> {
        let ScreencastFrame {
            data,
            metadata,
            session_id,
        } = frame;

        let decoded = tokio::task::spawn_blocking(move || decode_frame(&data))
            .await
            .map_err(|e| Error::Other(format!("frame decode task failed: {}", e)))?;
        let image = match decoded {
            Ok(image) => image,
            Err(e) => {
                warn!(token = %self.ownership.token, error = %e, "Dropping undecodable frame");
                return Ok(());
            }
        };

        let (count, width, height) = {
            let mut surface = lock_surface(&self.surface);
            surface.draw_image(image);
            let count = surface.mark_frame();
            let (width, height) = surface.dimensions();
            (count, width, height)
        };
        self.device = if metadata.device_width > 0.0 && metadata.device_height > 0.0 {
            (metadata.device_width, metadata.device_height)
        } else {
            (width as f64, height as f64)
        };

        self.send(sink, protocol::SCREENCAST_FRAME_ACK, json!({ "sessionId": session_id }))
            .await?;
        self.emit(SessionEvent::Frame {
            count,
            width,
            height,
        });
        Ok(())
    }

    async fn forward_input(&mut self, sink: &mut WsSink, input: InputEvent) -> Result<()> {
        let surface = lock_surface(&self.surface).dimensions();
        match input {
            InputEvent::Pointer(event) => match map_point(event.x, event.y, surface, self.device) {
                Some((x, y)) => {
                    let params = protocol::mouse_event_params(&event, x, y);
                    self.send(sink, protocol::DISPATCH_MOUSE_EVENT, params).await?;
                }
                None => debug!("Dropping pointer event before first frame"),
            },
            InputEvent::Wheel(event) => match map_point(event.x, event.y, surface, self.device) {
                Some((x, y)) => {
                    let params = protocol::wheel_event_params(&event, x, y);
                    self.send(sink, protocol::DISPATCH_MOUSE_EVENT, params).await?;
                }
                None => debug!("Dropping wheel event before first frame"),
            },
            InputEvent::Key(event) => {
                let params = protocol::key_event_params(&event);
                self.send(sink, protocol::DISPATCH_KEY_EVENT, params).await?;
            }
            InputEvent::Bytes(_) => debug!("Screencast sessions take no raw bytes"),
        }
        Ok(())
    }

    async fn forward_navigation(&mut self, sink: &mut WsSink, nav: NavigationCommand) -> Result<()> {
        match nav {
            NavigationCommand::Navigate(url) => {
                self.send(sink, protocol::NAVIGATE, json!({ "url": url })).await?;
            }
            NavigationCommand::Back => {
                self.send(sink, protocol::GO_BACK, json!({})).await?;
            }
            NavigationCommand::Forward => {
                self.send(sink, protocol::GO_FORWARD, json!({})).await?;
            }
            NavigationCommand::Reload => {
                self.send(sink, protocol::RELOAD, json!({})).await?;
            }
        }
        Ok(())
    }

    async fn request_history(&mut self, sink: &mut WsSink) -> Result<()> {
        let id = self.send(sink, protocol::GET_NAVIGATION_HISTORY, json!({})).await?;
        self.pending_history.insert(id);
        Ok(())
    }

    async fn send(&mut self, sink: &mut WsSink, method: &str, params: Value) -> Result<u64> {
        self.next_id += 1;
        let id = self.next_id;
        sink.send(Message::Text(protocol::command(id, method, params)))
            .await
            .map_err(|e| Error::WebSocket(format!("Failed to send {}: {}", method, e)))?;
        Ok(id)
    }

    fn failed(&mut self, err: Error) -> Attempt {
        if !err.is_fatal() {
            return Attempt::Retry(err.to_string());
        }
        if self.ownership.mark_fatal() {
            warn!(token = %self.ownership.token, error = %err, "Screencast token rejected, giving up");
            self.emit(SessionEvent::ConnectionError {
                fatal: true,
                code: status_of(&err),
                reason: err.to_string(),
            });
        }
        Attempt::Exit(Exit::Fatal)
    }

    fn interrupted(&self, interrupt: Interrupt) -> Exit {
        match interrupt {
            Interrupt::Shutdown(req) => {
                let frame = if req.capture {
                    capture_shared(&self.surface)
                } else {
                    None
                };
                Exit::Shutdown(req, frame)
            }
            Interrupt::Evicted => Exit::Evicted,
            Interrupt::HandleDropped => Exit::HandleDropped,
        }
    }

    fn finish(&self, exit: Exit) {
        self.connected.store(false, Ordering::SeqCst);
        match exit {
            Exit::Shutdown(req, frame) => {
                self.ownership.release();
                debug!(token = %self.ownership.token, captured = frame.is_some(), "Screencast disconnected");
                req.respond(frame);
            }
            Exit::Evicted => {
                debug!(token = %self.ownership.token, "Screencast replaced by a newer session");
            }
            Exit::HandleDropped | Exit::Fatal => {
                self.ownership.release();
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn decode_frame(data: &str) -> Result<RgbaImage> {
    let bytes = BASE64
        .decode(data)
        .map_err(|e| Error::Decode(format!("invalid base64 frame: {}", e)))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| Error::Decode(format!("invalid frame image: {}", e)))?;
    Ok(image.to_rgba8())
}
