use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The control plane or the duplex endpoint rejected the token.
    #[error("Unauthorized (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Authorization-class failures are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Unauthorized { .. })
    }

    /// Map an HTTP status onto the error taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 401 || status == 403 {
            Error::Unauthorized { status, message }
        } else {
            Error::Http(format!("status {}: {}", status, message))
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(Error::from_status(401, "expired").is_fatal());
        assert!(Error::from_status(403, "forbidden").is_fatal());
        assert!(!Error::from_status(500, "boom").is_fatal());
        assert!(!Error::from_status(404, "gone").is_fatal());
        assert!(!Error::WebSocket("reset".into()).is_fatal());
    }

    #[test]
    fn test_only_unauthorized_is_fatal() {
        let transient = [
            Error::Config("bad".into()),
            Error::Http("timed out".into()),
            Error::Protocol("short read".into()),
            Error::Decode("not a png".into()),
            Error::Other("x".into()),
            Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow")),
        ];
        assert!(transient.iter().all(|e| !e.is_fatal()));
        let rejected = Error::Unauthorized {
            status: 403,
            message: "nope".into(),
        };
        assert!(rejected.is_fatal());
        assert_eq!(rejected.to_string(), "Unauthorized (status 403): nope");
    }
}
