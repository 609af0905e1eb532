use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use sessionview_core::{CapabilityToken, CapturedFrame, Error, ProtocolFamily, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use super::rfb::{
    self, HandshakeStep, RectContent, RfbError, RfbHandshake, ServerInit, ServerMessage,
    ServerMessageDecoder,
};
use crate::control_plane::PageOrigin;
use crate::input::{InputEvent, KeyEvent, KeyKind, MouseButton, PointerKind};
use crate::registry::{next_owner_id, Ownership};
use crate::session::{
    is_clean_close, race_stop, ClientCommand, ClientContext, EventSender, Interrupt,
    RemoteSession, SessionEvent, ShutdownRequest,
};
use crate::surface::{self, capture_shared, lock_surface, PixelSurface, SharedSurface};
use crate::ws::{close_code, connect_error, status_of, WsSink, WsSource};

const FAMILY: ProtocolFamily = ProtocolFamily::Framebuffer;

/// Handle to a running remote-framebuffer session.
pub struct FramebufferClient {
    token: CapabilityToken,
    ownership: Ownership,
    view_only: bool,
    commands: mpsc::UnboundedSender<ClientCommand>,
    connected: Arc<AtomicBool>,
    fullscreen: AtomicBool,
    surface: SharedSurface,
    task: Option<JoinHandle<()>>,
}

impl FramebufferClient {
    /// Start a session for `token`, cancelling any live session already
    /// registered for it. A token marked fatal yields an inert handle.
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
        let view_only = !ctx.interactive();

        let task = if ownership.is_fatal() {
            debug!(token = %token, "Framebuffer token is marked fatal, not connecting");
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
                buttons: 0,
            };
            Some(tokio::spawn(worker.run()))
        };

        Self {
            token,
            ownership,
            view_only,
            commands,
            connected,
            fullscreen: AtomicBool::new(false),
            surface,
            task,
        }
    }

    pub fn surface(&self) -> SharedSurface {
        self.surface.clone()
    }

    pub fn view_only(&self) -> bool {
        self.view_only
    }

    /// Press Control, Alt and Delete, then release them in reverse order.
    pub fn send_ctrl_alt_del(&self) -> bool {
        if !self.is_connected() || self.view_only {
            return false;
        }
        let keys = ["Control", "Alt", "Delete"];
        let presses = keys.iter().map(|k| KeyEvent::down(k));
        let releases = keys.iter().rev().map(|k| KeyEvent::up(k));
        presses
            .chain(releases)
            .all(|key| self.commands.send(ClientCommand::Input(InputEvent::Key(key))).is_ok())
    }

    /// Flip the fullscreen flag of the view. Returns the new state, or
    /// `None` while not connected.
    pub fn toggle_fullscreen(&self) -> Option<bool> {
        if !self.is_connected() {
            return None;
        }
        Some(!self.fullscreen.fetch_xor(true, Ordering::SeqCst))
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSession for FramebufferClient {
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
        !self.view_only && self.commands.send(ClientCommand::Input(input)).is_ok()
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

impl Drop for FramebufferClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.ownership.release();
    }
}

enum Attempt {
    Retry(String),
    Exit(Exit),
}

enum Exit {
    Shutdown(ShutdownRequest, Option<CapturedFrame>),
    /// The remote side closed cleanly.
    Closed,
    Evicted,
    HandleDropped,
    Fatal,
}

enum Step {
    Socket(Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Command(Option<ClientCommand>),
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
    /// Currently pressed pointer buttons.
    buttons: u8,
}

impl Worker {
    async fn run(mut self) {
        let token = self.ownership.token.clone();
        let origin = match self.ctx.page_origin() {
            Ok(origin) => origin,
            Err(e) => {
                warn!(token = %token, error = %e, "Cannot build framebuffer endpoint");
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
            info!(token = %token, attempt, "Framebuffer connecting");

            let reason = match self.attempt(&origin, &mut attempt).await {
                Attempt::Exit(exit) => break 'reconnect exit,
                Attempt::Retry(reason) => reason,
            };
            if !self.ownership.is_current() {
                break 'reconnect Exit::Evicted;
            }

            attempt += 1;
            warn!(token = %token, attempt, error = %reason, delay_ms = backoff.as_millis() as u64, "Framebuffer reconnecting");
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

    async fn attempt(&mut self, origin: &PageOrigin, attempt: &mut u32) -> Attempt {
        let token = self.ownership.token.clone();
        let control_plane = self.ctx.control_plane.clone();
        let lookup = race_stop(
            control_plane.framebuffer_session(&token),
            &mut self.commands,
            &mut self.evict,
        )
        .await;
        let descriptor = match lookup {
            Ok(Ok(descriptor)) => descriptor,
            Ok(Err(e)) => return self.failed(e),
            Err(interrupt) => return Attempt::Exit(self.interrupted(interrupt)),
        };
        debug!(
            token = %token,
            host = %descriptor.host,
            port = descriptor.port,
            width = descriptor.width,
            height = descriptor.height,
            "Framebuffer session resolved"
        );

        let mut request = match origin
            .duplex_url(&descriptor.path)
            .and_then(|url| {
                url.as_str()
                    .into_client_request()
                    .map_err(|e| Error::WebSocket(e.to_string()))
            }) {
            Ok(request) => request,
            Err(e) => return Attempt::Retry(e.to_string()),
        };
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));

        let connect = race_stop(connect_async(request), &mut self.commands, &mut self.evict).await;
        let socket = match connect {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(e)) => return self.failed(connect_error(e)),
            Err(interrupt) => return Attempt::Exit(self.interrupted(interrupt)),
        };
        let (mut sink, mut source) = socket.split();

        let outcome = self.stream(&mut sink, &mut source, attempt).await;
        self.connected.store(false, Ordering::SeqCst);
        outcome
    }

    async fn stream(&mut self, sink: &mut WsSink, source: &mut WsSource, attempt: &mut u32) -> Attempt {
        let mut handshake = RfbHandshake::new();
        let mut decoder = ServerMessageDecoder;
        let mut buffer = BytesMut::new();
        self.buttons = 0;

        loop {
            let step = tokio::select! {
                msg = source.next() => Step::Socket(msg),
                cmd = self.commands.recv() => Step::Command(cmd),
                changed = self.evict.changed() => Step::Evict(changed.is_err()),
            };

            match step {
                Step::Socket(Some(Ok(Message::Binary(data)))) => {
                    buffer.extend_from_slice(&data);
                    let result = self
                        .process(sink, &mut handshake, &mut decoder, &mut buffer, attempt)
                        .await;
                    if let Err(e) = result {
                        return self.rfb_failed(e);
                    }
                }
                Step::Socket(Some(Ok(Message::Close(frame)))) => {
                    let code = close_code(&frame);
                    if is_clean_close(code) {
                        info!(token = %self.ownership.token, "Framebuffer closed by remote");
                        self.emit(SessionEvent::Closed { clean: true, code });
                        return Attempt::Exit(Exit::Closed);
                    }
                    return Attempt::Retry(format!("connection closed with code {:?}", code));
                }
                Step::Socket(Some(Ok(_))) => {}
                Step::Socket(Some(Err(e))) => return Attempt::Retry(e.to_string()),
                Step::Socket(None) => return Attempt::Retry("connection lost".into()),
                Step::Command(Some(ClientCommand::Shutdown(req))) => {
                    let frame = if req.capture {
                        capture_shared(&self.surface)
                    } else {
                        None
                    };
                    let _ = sink.close().await;
                    return Attempt::Exit(Exit::Shutdown(req, frame));
                }
                Step::Command(Some(ClientCommand::Input(input))) => {
                    if !handshake.is_done() {
                        debug!("Dropping input before framebuffer handshake completed");
                        continue;
                    }
                    if let Err(e) = self.forward_input(sink, input).await {
                        return Attempt::Retry(e.to_string());
                    }
                }
                Step::Command(Some(ClientCommand::Navigate(_))) => {
                    debug!("Framebuffer sessions have no navigation");
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

    /// Feed buffered bytes through the handshake, then the message decoder.
    async fn process(
        &mut self,
        sink: &mut WsSink,
        handshake: &mut RfbHandshake,
        decoder: &mut ServerMessageDecoder,
        buffer: &mut BytesMut,
        attempt: &mut u32,
    ) -> std::result::Result<(), RfbError> {
        if !handshake.is_done() {
            for step in handshake.advance(buffer)? {
                match step {
                    HandshakeStep::Reply(bytes) => send_binary(sink, bytes).await?,
                    HandshakeStep::Ready(init) => self.on_ready(sink, &init, attempt).await?,
                }
            }
            if !handshake.is_done() {
                return Ok(());
            }
        }

        while let Some(message) = decoder.decode(buffer)? {
            match message {
                ServerMessage::FramebufferUpdate(rects) => self.apply_update(sink, rects).await?,
                ServerMessage::SetColourMap => debug!("Ignoring colour map entries"),
                ServerMessage::Bell => debug!(token = %self.ownership.token, "Remote bell"),
                ServerMessage::ServerCutText(text) => self.emit(SessionEvent::Clipboard(text)),
            }
        }
        Ok(())
    }

    async fn on_ready(&mut self, sink: &mut WsSink, init: &ServerInit, attempt: &mut u32) -> std::result::Result<(), RfbError> {
        info!(
            token = %self.ownership.token,
            width = init.width,
            height = init.height,
            name = %init.name,
            "Framebuffer connected"
        );
        lock_surface(&self.surface).resize(init.width as u32, init.height as u32);
        for message in rfb::session_setup(init) {
            send_binary(sink, message).await?;
        }
        *attempt = 0;
        self.connected.store(true, Ordering::SeqCst);
        self.emit(SessionEvent::Connected);
        Ok(())
    }

    async fn apply_update(&mut self, sink: &mut WsSink, rects: Vec<rfb::Rect>) -> std::result::Result<(), RfbError> {
        let (count, width, height) = {
            let mut surface = lock_surface(&self.surface);
            for rect in rects {
                let (x, y, w, h) = (rect.x as u32, rect.y as u32, rect.width as u32, rect.height as u32);
                let applied = match rect.content {
                    RectContent::Raw(pixels) => surface.put_rect(x, y, w, h, &pixels),
                    RectContent::CopyRect { src_x, src_y } => {
                        surface.copy_rect(src_x as u32, src_y as u32, x, y, w, h)
                    }
                    RectContent::DesktopSize => {
                        surface.resize(w, h);
                        Ok(())
                    }
                };
                if let Err(e) = applied {
                    warn!(error = %e, "Dropping framebuffer rect");
                }
            }
            let count = surface.mark_frame();
            let (width, height) = surface.dimensions();
            (count, width, height)
        };

        let request = rfb::framebuffer_update_request(true, 0, 0, clamp_u16(width), clamp_u16(height));
        send_binary(sink, request).await?;
        self.emit(SessionEvent::Frame {
            count,
            width,
            height,
        });
        Ok(())
    }

    async fn forward_input(&mut self, sink: &mut WsSink, input: InputEvent) -> Result<()> {
        let bytes = match input {
            InputEvent::Pointer(event) => {
                let bit = button_bit(event.button);
                match event.kind {
                    PointerKind::Down => self.buttons |= bit,
                    PointerKind::Up => self.buttons &= !bit,
                    PointerKind::Move => {}
                }
                vec![rfb::pointer_event(self.buttons, coord(event.x), coord(event.y))]
            }
            InputEvent::Wheel(event) => {
                let bit = if event.delta_y < 0.0 { rfb::WHEEL_UP } else { rfb::WHEEL_DOWN };
                let (x, y) = (coord(event.x), coord(event.y));
                vec![
                    rfb::pointer_event(self.buttons | bit, x, y),
                    rfb::pointer_event(self.buttons, x, y),
                ]
            }
            InputEvent::Key(event) => {
                let down = match event.kind {
                    KeyKind::Down => true,
                    KeyKind::Up => false,
                    KeyKind::Char => return Ok(()),
                };
                match rfb::keysym_for(&event.key) {
                    Some(keysym) => vec![rfb::key_event(down, keysym)],
                    None => {
                        debug!(key = %event.key, "No keysym for key");
                        return Ok(());
                    }
                }
            }
            InputEvent::Bytes(_) => {
                debug!("Framebuffer sessions take no raw bytes");
                return Ok(());
            }
        };
        for message in bytes {
            send_binary(sink, message)
                .await
                .map_err(|e| Error::WebSocket(e.to_string()))?;
        }
        Ok(())
    }

    fn rfb_failed(&mut self, err: RfbError) -> Attempt {
        if !err.is_fatal() {
            return Attempt::Retry(err.to_string());
        }
        if self.ownership.mark_fatal() {
            warn!(token = %self.ownership.token, error = %err, "Framebuffer security handshake failed, giving up");
            self.emit(SessionEvent::ConnectionError {
                fatal: true,
                code: None,
                reason: err.to_string(),
            });
        }
        Attempt::Exit(Exit::Fatal)
    }

    fn failed(&mut self, err: Error) -> Attempt {
        if !err.is_fatal() {
            return Attempt::Retry(err.to_string());
        }
        if self.ownership.mark_fatal() {
            warn!(token = %self.ownership.token, error = %err, "Framebuffer token rejected, giving up");
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
                debug!(token = %self.ownership.token, captured = frame.is_some(), "Framebuffer disconnected");
                req.respond(frame);
            }
            Exit::Evicted => {
                debug!(token = %self.ownership.token, "Framebuffer replaced by a newer session");
            }
            Exit::Closed | Exit::HandleDropped | Exit::Fatal => {
                self.ownership.release();
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

async fn send_binary(sink: &mut WsSink, bytes: Vec<u8>) -> std::result::Result<(), RfbError> {
    sink.send(Message::Binary(bytes))
        .await
        .map_err(|e| RfbError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))
}

fn button_bit(button: MouseButton) -> u8 {
    match button {
        MouseButton::None => 0,
        MouseButton::Left => rfb::BUTTON_LEFT,
        MouseButton::Middle => rfb::BUTTON_MIDDLE,
        MouseButton::Right => rfb::BUTTON_RIGHT,
    }
}

fn coord(value: f64) -> u16 {
    value.round().clamp(0.0, u16::MAX as f64) as u16
}

fn clamp_u16(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::HttpControlPlane;
    use crate::registry::Registries;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use sessionview_core::Config;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

    type ServerWs = WebSocketStream<tokio::net::TcpStream>;

    async fn control_plane(hits: Arc<AtomicUsize>) -> String {
        let router = Router::new().route(
            "/vnc",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "host": "10.0.0.9", "port": 5900,
                        "width": 2, "height": 2, "path": "/websockify"
                    }))
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn context(base_url: &str, page_origin: &str, registries: Arc<Registries>) -> ClientContext {
        let mut config = Config::default();
        config.control_plane.base_url = base_url.to_string();
        config.control_plane.framebuffer_path = "/vnc".to_string();
        config.control_plane.page_origin = page_origin.to_string();
        config.reconnect.backoff_ms = 20;
        config.interactive = true;
        let plane = Arc::new(HttpControlPlane::from_config(&config).unwrap());
        ClientContext::new(config, plane, registries)
    }

    async fn accept_binary(listener: &TcpListener) -> ServerWs {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |req: &Request, mut resp: Response| -> std::result::Result<Response, ErrorResponse> {
            assert_eq!(req.uri().path(), "/websockify");
            let protocol = req.headers().get("Sec-WebSocket-Protocol").cloned();
            assert_eq!(protocol, Some(HeaderValue::from_static("binary")));
            resp.headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));
            Ok(resp)
        };
        accept_hdr_async(stream, callback).await.unwrap()
    }

    async fn read_exact(ws: &mut ServerWs, pending: &mut Vec<u8>, n: usize) -> Vec<u8> {
        while pending.len() < n {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => pending.extend_from_slice(&data),
                Some(Ok(_)) => {}
                other => panic!("client went away: {:?}", other),
            }
        }
        pending.drain(..n).collect()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Option<SessionEvent> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
    }

    fn server_init(width: u16, height: u16) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&width.to_be_bytes());
        b.extend_from_slice(&height.to_be_bytes());
        b.extend_from_slice(&[0; 16]);
        b.extend_from_slice(&4u32.to_be_bytes());
        b.extend_from_slice(b"test");
        b
    }

    fn raw_update(width: u16, height: u16, rgbx: [u8; 4]) -> Vec<u8> {
        let mut b = vec![0, 0, 0, 1, 0, 0, 0, 0];
        b.extend_from_slice(&width.to_be_bytes());
        b.extend_from_slice(&height.to_be_bytes());
        b.extend_from_slice(&rfb::ENCODING_RAW.to_be_bytes());
        for _ in 0..(width as usize * height as usize) {
            b.extend_from_slice(&rgbx);
        }
        b
    }

    #[tokio::test]
    async fn test_session_renders_and_forwards_ctrl_alt_del() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = control_plane(hits.clone()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let mut ws = accept_binary(&listener).await;
            let mut pending = Vec::new();
            ws.send(Message::Binary(b"RFB 003.008\n".to_vec())).await.unwrap();
            assert_eq!(read_exact(&mut ws, &mut pending, 12).await, b"RFB 003.008\n");
            ws.send(Message::Binary(vec![1, 1])).await.unwrap();
            assert_eq!(read_exact(&mut ws, &mut pending, 1).await, vec![1]);
            ws.send(Message::Binary(vec![0, 0, 0, 0])).await.unwrap();
            assert_eq!(read_exact(&mut ws, &mut pending, 1).await, vec![1]);
            ws.send(Message::Binary(server_init(2, 2))).await.unwrap();

            // SetPixelFormat, SetEncodings (3 encodings), full update request.
            let setup = read_exact(&mut ws, &mut pending, 20 + 16 + 10).await;
            assert_eq!(setup[0], 0);
            assert_eq!(setup[20], 2);
            assert_eq!(&setup[36..], &rfb::framebuffer_update_request(false, 0, 0, 2, 2)[..]);

            ws.send(Message::Binary(raw_update(2, 2, [255, 0, 0, 0]))).await.unwrap();
            let incremental = read_exact(&mut ws, &mut pending, 10).await;
            assert_eq!(incremental, rfb::framebuffer_update_request(true, 0, 0, 2, 2));

            let keys = read_exact(&mut ws, &mut pending, 6 * 8).await;
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))
            .await
            .unwrap();
            keys
        });

        let registries = Arc::new(Registries::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = FramebufferClient::connect(
            CapabilityToken::new("vnc-token"),
            context(&base, &origin, registries.clone()),
            tx,
        );
        assert!(!client.send_ctrl_alt_del());
        assert_eq!(client.toggle_fullscreen(), None);

        loop {
            match next_event(&mut rx).await {
                Some(SessionEvent::Frame { count, width, height }) => {
                    assert_eq!((count, width, height), (1, 2, 2));
                    break;
                }
                Some(_) => {}
                None => panic!("no frame received"),
            }
        }
        assert_eq!(client.toggle_fullscreen(), Some(true));
        assert_eq!(client.toggle_fullscreen(), Some(false));
        assert!(client.send_ctrl_alt_del());

        let keys = server.await.unwrap();
        let expected: Vec<u8> = [
            (true, rfb::KEYSYM_CONTROL_L),
            (true, rfb::KEYSYM_ALT_L),
            (true, rfb::KEYSYM_DELETE),
            (false, rfb::KEYSYM_DELETE),
            (false, rfb::KEYSYM_ALT_L),
            (false, rfb::KEYSYM_CONTROL_L),
        ]
        .iter()
        .flat_map(|(down, sym)| rfb::key_event(*down, *sym))
        .collect();
        assert_eq!(keys, expected);

        assert_eq!(
            next_event(&mut rx).await,
            Some(SessionEvent::Closed { clean: true, code: Some(1000) })
        );
        // A clean close is final.
        assert_eq!(next_event(&mut rx).await, None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let frame = Box::new(client).disconnect(true).await.unwrap();
        assert_eq!((frame.width, frame.height), (2, 2));
        assert!(registries.connections(FAMILY).is_empty());
    }

    #[tokio::test]
    async fn test_security_failure_marks_token_fatal() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = control_plane(hits.clone()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut ws = accept_binary(&listener).await;
            let mut failure = b"RFB 003.008\n".to_vec();
            failure.extend_from_slice(&[0, 0, 0, 0, 6]);
            failure.extend_from_slice(b"denied");
            ws.send(Message::Binary(failure)).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let registries = Arc::new(Registries::new());
        let token = CapabilityToken::new("locked");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = FramebufferClient::connect(token.clone(), context(&base, &origin, registries.clone()), tx);

        let mut events = Vec::new();
        while let Some(event) = next_event(&mut rx).await {
            events.push(event);
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SessionEvent::ConnectionError { fatal: true, reason, .. } if reason.contains("denied")));
        assert!(registries.fatal(FAMILY).contains(&token));
        Box::new(client).disconnect(false).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let again = FramebufferClient::connect(token, context(&base, &origin, registries.clone()), tx);
        assert!(next_event(&mut rx).await.is_none());
        assert!(!again.is_connected());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unclean_drop_schedules_reconnect() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = control_plane(hits.clone()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let ws = accept_binary(&listener).await;
                drop(ws);
            }
        });

        let registries = Arc::new(Registries::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = FramebufferClient::connect(
            CapabilityToken::new("flaky"),
            context(&base, &origin, registries.clone()),
            tx,
        );
        match next_event(&mut rx).await {
            Some(SessionEvent::Reconnecting { attempt, .. }) => assert_eq!(attempt, 1),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(Box::new(client).disconnect(true).await.is_none());
        assert!(hits.load(Ordering::SeqCst) >= 1);
        assert!(registries.fatal(FAMILY).is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_keeps_last_picture_until_next_update() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = control_plane(hits.clone()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());
        let (second_tx, second_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            // The desktop is 3x1 while the lookup reports 2x2.
            let mut ws = accept_binary(&listener).await;
            let mut pending = Vec::new();
            ws.send(Message::Binary(b"RFB 003.003\n".to_vec())).await.unwrap();
            read_exact(&mut ws, &mut pending, 12).await;
            ws.send(Message::Binary(vec![0, 0, 0, 1])).await.unwrap();
            read_exact(&mut ws, &mut pending, 1).await;
            ws.send(Message::Binary(server_init(3, 1))).await.unwrap();
            read_exact(&mut ws, &mut pending, 20 + 16 + 10).await;
            ws.send(Message::Binary(raw_update(3, 1, [255, 0, 0, 0]))).await.unwrap();
            read_exact(&mut ws, &mut pending, 10).await;
            drop(ws);

            let mut ws = accept_binary(&listener).await;
            let _ = second_tx.send(());
            while let Some(Ok(_)) = ws.next().await {}
        });

        let registries = Arc::new(Registries::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = FramebufferClient::connect(
            CapabilityToken::new("resized"),
            context(&base, &origin, registries),
            tx,
        );
        loop {
            match next_event(&mut rx).await {
                Some(SessionEvent::Reconnecting { attempt, .. }) => {
                    assert_eq!(attempt, 1);
                    break;
                }
                Some(_) => {}
                None => panic!("no reconnect scheduled"),
            }
        }
        tokio::time::timeout(Duration::from_secs(5), second_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let frame = Box::new(client).disconnect(true).await.unwrap();
        assert_eq!((frame.width, frame.height), (3, 1));
        let image = image::load_from_memory(&frame.png).unwrap().to_rgba8();
        assert_eq!(image.get_pixel(2, 0).0, [255, 0, 0, 255]);
    }

    #[test]
    fn test_coord_clamps() {
        assert_eq!(coord(-3.0), 0);
        assert_eq!(coord(10.4), 10);
        assert_eq!(coord(1e9), u16::MAX);
    }
}
