//! WebSocket plumbing shared by the three clients.

use futures::stream::{SplitSink, SplitStream};
use sessionview_core::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// Classify a failed WebSocket handshake; a 401/403 upgrade response is fatal.
pub(crate) fn connect_error(err: WsError) -> Error {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            Error::from_status(
                status.as_u16(),
                format!("WebSocket upgrade rejected: {}", status),
            )
        }
        other => Error::WebSocket(other.to_string()),
    }
}

pub(crate) fn close_code(frame: &Option<CloseFrame<'static>>) -> Option<u16> {
    frame.as_ref().map(|f| u16::from(f.code))
}

/// Status code carried by an authorization-class error.
pub(crate) fn status_of(err: &Error) -> Option<u16> {
    match err {
        Error::Unauthorized { status, .. } => Some(*status),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn test_close_code() {
        assert_eq!(close_code(&None), None);
        let frame = CloseFrame {
            code: CloseCode::Error,
            reason: "boom".into(),
        };
        assert_eq!(close_code(&Some(frame)), Some(1011));
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of(&Error::from_status(401, "no")), Some(401));
        assert_eq!(status_of(&Error::from_status(500, "no")), None);
    }
}
