use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use sessionview_core::{CapabilityToken, CapturedFrame, Error, ProtocolFamily};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::input::{InputEvent, KeyKind};
use crate::registry::{next_owner_id, Ownership};
use crate::session::{
    is_clean_close, race_stop, ClientCommand, ClientContext, EventSender, Interrupt,
    RemoteSession, SessionEvent, ShutdownRequest, ABNORMAL_CLOSURE,
};
use crate::ws::{close_code, connect_error, status_of, WsSink, WsSource};

const FAMILY: ProtocolFamily = ProtocolFamily::Terminal;

/// Close code reported when the close frame carried no status.
const NO_STATUS: u16 = 1005;

pub type SharedScreen = Arc<Mutex<vt100::Parser>>;

/// Handle to a running byte-stream terminal session.
pub struct TerminalClient {
    token: CapabilityToken,
    ownership: Ownership,
    commands: mpsc::UnboundedSender<ClientCommand>,
    connected: Arc<AtomicBool>,
    screen: SharedScreen,
    task: Option<JoinHandle<()>>,
}

impl TerminalClient {
    /// Open the terminal stream for `token`. There is no control-plane
    /// lookup and no reconnect: a dropped stream stays dropped.
    pub fn connect(token: CapabilityToken, ctx: ClientContext, events: EventSender) -> Self {
        let ownership = Ownership {
            registries: ctx.registries.clone(),
            family: FAMILY,
            token: token.clone(),
            owner: next_owner_id(),
        };
        let (commands, command_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let geometry = &ctx.config.terminal;
        let screen = Arc::new(Mutex::new(vt100::Parser::new(
            geometry.rows,
            geometry.cols,
            geometry.scrollback,
        )));

        let task = if ownership.is_fatal() {
            debug!(token = %token, "Terminal token is marked fatal, not connecting");
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
                screen: screen.clone(),
            };
            Some(tokio::spawn(worker.run()))
        };

        Self {
            token,
            ownership,
            commands,
            connected,
            screen,
            task,
        }
    }

    /// Resize the local emulation surface. The remote side is not told.
    pub fn fit(&self, rows: u16, cols: u16) {
        lock_screen(&self.screen).set_size(rows, cols);
    }

    pub fn size(&self) -> (u16, u16) {
        lock_screen(&self.screen).screen().size()
    }

    /// Visible text of the emulated screen.
    pub fn screen_contents(&self) -> String {
        lock_screen(&self.screen).screen().contents()
    }

    pub fn screen(&self) -> SharedScreen {
        self.screen.clone()
    }

    /// Write a keystroke payload to the remote side.
    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.send_input(InputEvent::Bytes(bytes.into()))
    }
}

fn lock_screen(screen: &SharedScreen) -> MutexGuard<'_, vt100::Parser> {
    screen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RemoteSession for TerminalClient {
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
        self.commands.send(ClientCommand::Input(input)).is_ok()
    }

    /// Terminal sessions have no pixel surface, so nothing is captured.
    async fn disconnect(mut self: Box<Self>, _capture: bool) -> Option<CapturedFrame> {
        let (reply, rx) = oneshot::channel();
        let request = ShutdownRequest {
            capture: false,
            reply: Some(reply),
        };
        if self.commands.send(ClientCommand::Shutdown(request)).is_ok() {
            let _ = rx.await;
        }
        self.ownership.release();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        None
    }
}

impl Drop for TerminalClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.ownership.release();
    }
}

enum Exit {
    Shutdown(ShutdownRequest),
    Ended,
    Evicted,
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
    screen: SharedScreen,
}

impl Worker {
    async fn run(mut self) {
        let exit = self.session().await;
        self.connected.store(false, Ordering::SeqCst);
        match exit {
            Exit::Shutdown(req) => {
                self.ownership.release();
                debug!(token = %self.ownership.token, "Terminal disconnected");
                req.respond(None);
            }
            Exit::Ended => {
                self.ownership.release();
            }
            Exit::Evicted => {
                debug!(token = %self.ownership.token, "Terminal replaced by a newer session");
            }
        }
    }

    async fn session(&mut self) -> Exit {
        let token = self.ownership.token.clone();
        let url = match self.endpoint() {
            Ok(url) => url,
            Err(e) => {
                warn!(token = %token, error = %e, "Cannot build terminal endpoint");
                self.emit(SessionEvent::ConnectionError {
                    fatal: false,
                    code: None,
                    reason: e.to_string(),
                });
                return Exit::Ended;
            }
        };

        info!(token = %token, "Terminal connecting");
        let connect = race_stop(connect_async(url.as_str()), &mut self.commands, &mut self.evict).await;
        let socket = match connect {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(e)) => {
                self.connect_failed(connect_error(e));
                return Exit::Ended;
            }
            Err(Interrupt::Shutdown(req)) => return Exit::Shutdown(req),
            Err(Interrupt::Evicted) => return Exit::Evicted,
            Err(Interrupt::HandleDropped) => return Exit::Ended,
        };

        info!(token = %token, "Terminal connected");
        self.connected.store(true, Ordering::SeqCst);
        self.emit(SessionEvent::Connected);
        let (mut sink, mut source) = socket.split();
        self.stream(&mut sink, &mut source).await
    }

    fn endpoint(&self) -> sessionview_core::Result<Url> {
        let origin = self.ctx.page_origin()?;
        let mut url = origin.duplex_url(&self.ctx.config.control_plane.terminal_path)?;
        url.query_pairs_mut()
            .append_pair("token", self.ownership.token.as_str());
        Ok(url)
    }

    async fn stream(&mut self, sink: &mut WsSink, source: &mut WsSource) -> Exit {
        loop {
            let step = tokio::select! {
                msg = source.next() => Step::Socket(msg),
                cmd = self.commands.recv() => Step::Command(cmd),
                changed = self.evict.changed() => Step::Evict(changed.is_err()),
            };

            match step {
                Step::Socket(Some(Ok(Message::Binary(data)))) => self.received(data),
                Step::Socket(Some(Ok(Message::Text(text)))) => self.received(text.into_bytes()),
                Step::Socket(Some(Ok(Message::Close(frame)))) => {
                    let code = close_code(&frame);
                    if is_clean_close(code) {
                        info!(token = %self.ownership.token, "Terminal closed");
                        self.emit(SessionEvent::Closed { clean: true, code });
                    } else {
                        let code = code.unwrap_or(NO_STATUS);
                        let reason = frame.map(|f| f.reason.into_owned()).unwrap_or_default();
                        warn!(token = %self.ownership.token, code, reason = %reason, "Terminal closed abnormally");
                        self.emit(SessionEvent::ConnectionError {
                            fatal: false,
                            code: Some(code),
                            reason,
                        });
                    }
                    return Exit::Ended;
                }
                Step::Socket(Some(Ok(_))) => {}
                Step::Socket(Some(Err(e))) => {
                    warn!(token = %self.ownership.token, error = %e, "Terminal connection failed");
                    self.emit(SessionEvent::ConnectionError {
                        fatal: false,
                        code: Some(ABNORMAL_CLOSURE),
                        reason: e.to_string(),
                    });
                    return Exit::Ended;
                }
                Step::Socket(None) => {
                    self.emit(SessionEvent::ConnectionError {
                        fatal: false,
                        code: Some(ABNORMAL_CLOSURE),
                        reason: "connection lost".into(),
                    });
                    return Exit::Ended;
                }
                Step::Command(Some(ClientCommand::Input(input))) => {
                    let Some(message) = outbound(input) else {
                        continue;
                    };
                    if let Err(e) = sink.send(message).await {
                        warn!(token = %self.ownership.token, error = %e, "Terminal write failed");
                        self.emit(SessionEvent::ConnectionError {
                            fatal: false,
                            code: Some(ABNORMAL_CLOSURE),
                            reason: e.to_string(),
                        });
                        return Exit::Ended;
                    }
                }
                Step::Command(Some(ClientCommand::Navigate(_))) => {
                    debug!("Terminal sessions have no navigation");
                }
                Step::Command(Some(ClientCommand::Shutdown(req))) => {
                    let _ = sink.close().await;
                    return Exit::Shutdown(req);
                }
                Step::Command(None) => {
                    let _ = sink.close().await;
                    return Exit::Ended;
                }
                Step::Evict(closed) => {
                    if closed || *self.evict.borrow() {
                        let _ = sink.close().await;
                        return Exit::Evicted;
                    }
                }
            }
        }
    }

    fn received(&self, bytes: Vec<u8>) {
        lock_screen(&self.screen).process(&bytes);
        self.emit(SessionEvent::Data(bytes));
    }

    fn connect_failed(&self, err: Error) {
        let token = &self.ownership.token;
        if err.is_fatal() {
            if self.ownership.mark_fatal() {
                warn!(token = %token, error = %err, "Terminal token rejected, giving up");
                self.emit(SessionEvent::ConnectionError {
                    fatal: true,
                    code: status_of(&err),
                    reason: err.to_string(),
                });
            }
            return;
        }
        warn!(token = %token, error = %err, "Terminal connect failed");
        self.emit(SessionEvent::ConnectionError {
            fatal: false,
            code: Some(ABNORMAL_CLOSURE),
            reason: err.to_string(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Text frame when the payload is valid UTF-8, binary otherwise.
fn outbound(input: InputEvent) -> Option<Message> {
    let bytes = match input {
        InputEvent::Bytes(bytes) => bytes,
        InputEvent::Key(key) if matches!(key.kind, KeyKind::Down | KeyKind::Char) => {
            key.text?.into_bytes()
        }
        other => {
            debug!(input = other.name(), "Terminal ignores input");
            return None;
        }
    };
    if bytes.is_empty() {
        return None;
    }
    Some(match String::from_utf8(bytes) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    })
}
