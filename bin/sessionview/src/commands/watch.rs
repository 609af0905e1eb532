use sessionview_core::{CapabilityToken, Config, Paths, ProtocolFamily};
use sessionview_remote::{launch_session, ClientContext, InputEvent, SessionEvent};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};

use super::parse_family;

/// `capture`: `None` skips the capture, `Some(None)` writes under the captures dir.
pub async fn run(
    family: &str,
    token: &str,
    interactive: bool,
    capture: Option<Option<PathBuf>>,
) -> anyhow::Result<()> {
    let family = parse_family(family)?;
    let token = CapabilityToken::new(token);
    if token.is_empty() {
        anyhow::bail!("Token must not be empty");
    }

    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths)?;
    config.interactive |= interactive;
    let forward_stdin = config.interactive && family == ProtocolFamily::Terminal;

    let ctx = ClientContext::from_config(config)?;
    let (session, mut events) = launch_session(family, token.clone(), &ctx);
    info!(family = %family, token = %token, "Watching session (Ctrl-C to stop)");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = forward_stdin;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    info!("Session ended");
                    break;
                };
                if report(family, &event) {
                    break;
                }
            }
            line = next_line(&mut stdin), if stdin_open => {
                match line {
                    Some(line) => {
                        let payload = format!("{}\r", line).into_bytes();
                        if !session.send_input(InputEvent::Bytes(payload)) {
                            warn!("Input dropped, session not connected");
                        }
                    }
                    None => stdin_open = false,
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    let frame = session.disconnect(capture.is_some()).await;
    let Some(target) = capture else {
        return Ok(());
    };
    match frame {
        Some(frame) => {
            let path = target.unwrap_or_else(|| paths.capture_file(&capture_name(&token)));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &frame.png)?;
            println!(
                "✓ Saved {}x{} frame: {}",
                frame.width,
                frame.height,
                path.display()
            );
        }
        None => println!("No frame was rendered, nothing captured."),
    }
    Ok(())
}

async fn next_line(lines: &mut Lines<BufReader<Stdin>>) -> Option<String> {
    lines.next_line().await.ok().flatten()
}

/// Log one lifecycle event. Returns true when the session is over.
fn report(family: ProtocolFamily, event: &SessionEvent) -> bool {
    match event {
        SessionEvent::Connected => info!("Connected"),
        SessionEvent::Frame {
            count,
            width,
            height,
        } => {
            if *count == 1 || count % 100 == 0 {
                info!(count, width, height, "Frame rendered");
            }
        }
        SessionEvent::Data(bytes) => {
            print!("{}", String::from_utf8_lossy(bytes));
        }
        SessionEvent::Navigation(nav) => info!(
            url = nav.url.as_deref().unwrap_or(""),
            back = nav.can_go_back,
            forward = nav.can_go_forward,
            "Navigation"
        ),
        SessionEvent::Clipboard(text) => info!(len = text.len(), "Remote clipboard updated"),
        SessionEvent::Reconnecting {
            attempt,
            delay,
            reason,
        } => warn!(attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "Reconnecting"),
        SessionEvent::ConnectionError {
            fatal,
            code,
            reason,
        } => {
            warn!(fatal, code = ?code, reason = %reason, "Connection error");
            return *fatal || family == ProtocolFamily::Terminal;
        }
        SessionEvent::Closed { clean, code } => {
            info!(clean, code = ?code, "Session closed");
            return true;
        }
    }
    false
}

fn capture_name(token: &CapabilityToken) -> String {
    let prefix: String = token.as_str().chars().take(8).collect();
    format!("{}-{}", prefix, chrono::Utc::now().format("%Y%m%d-%H%M%S"))
}
