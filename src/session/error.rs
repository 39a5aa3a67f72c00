use std::fmt;

/// Errors ending a session or a handshake
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    /// Handshake budget exhausted
    Timeout,
    /// Peer answered the handshake with something else
    Rejected(String),
    /// Peer closed the stream
    Closed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Timeout => write!(f, "Handshake timeout"),
            ConnectionError::Rejected(text) => write!(f, "Rejected: {}", text.trim_end()),
            ConnectionError::Closed => write!(f, "Connection closed by peer"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}
