//! Error handling for the conferencing hub

use std::fmt;

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

/// Hub error taxonomy
///
/// Component boundaries convert internal failures into one of these
/// categories; control sessions render them as `error` replies where a
/// reply is appropriate.
#[derive(Debug, Clone)]
pub enum HubError {
    /// Malformed frame, oversize frame, unknown message type in state
    Protocol(String),
    /// Login rejected (empty or oversize name)
    Auth(String),
    /// File too large, no ephemeral port available, disk full
    Resource(String),
    /// Unknown fid or target uid
    NotFound(String),
    /// Short read/write or expired transfer deadline
    Transfer(String),
    /// Peer reset, socket closed
    Transport(String),
    /// Opus encode/decode failure
    Codec(String),
    /// Configuration error
    Config(String),
    /// Server internal error
    Internal(String),
}

impl HubError {
    /// Get the reason string carried by this error
    pub fn reason(&self) -> &str {
        match self {
            HubError::Protocol(msg) => msg,
            HubError::Auth(msg) => msg,
            HubError::Resource(msg) => msg,
            HubError::NotFound(msg) => msg,
            HubError::Transfer(msg) => msg,
            HubError::Transport(msg) => msg,
            HubError::Codec(msg) => msg,
            HubError::Config(msg) => msg,
            HubError::Internal(msg) => msg,
        }
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        HubError::Protocol(msg.into())
    }

    /// Create an authentication error
    pub fn auth<T: Into<String>>(msg: T) -> Self {
        HubError::Auth(msg.into())
    }

    /// Create a resource error
    pub fn resource<T: Into<String>>(msg: T) -> Self {
        HubError::Resource(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        HubError::NotFound(msg.into())
    }

    /// Create a transfer error
    pub fn transfer<T: Into<String>>(msg: T) -> Self {
        HubError::Transfer(msg.into())
    }

    /// Create a transport error
    pub fn transport<T: Into<String>>(msg: T) -> Self {
        HubError::Transport(msg.into())
    }

    /// Create a codec error
    pub fn codec<T: Into<String>>(msg: T) -> Self {
        HubError::Codec(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        HubError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        HubError::Internal(msg.into())
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            HubError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            HubError::Resource(msg) => write!(f, "Resource error: {}", msg),
            HubError::NotFound(msg) => write!(f, "Not found: {}", msg),
            HubError::Transfer(msg) => write!(f, "Transfer error: {}", msg),
            HubError::Transport(msg) => write!(f, "Transport error: {}", msg),
            HubError::Codec(msg) => write!(f, "Codec error: {}", msg),
            HubError::Config(msg) => write!(f, "Configuration error: {}", msg),
            HubError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for HubError {}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Transport(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Protocol(format!("JSON error: {}", err))
    }
}

impl From<opus::Error> for HubError {
    fn from(err: opus::Error) -> Self {
        HubError::Codec(format!("Opus error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_passthrough() {
        let err = HubError::resource("file size exceeds limit");
        assert_eq!(err.reason(), "file size exceeds limit");

        let err = HubError::not_found("fid=abc");
        assert!(err.to_string().contains("Not found"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err: HubError = io.into();
        assert!(matches!(err, HubError::Transport(_)));
    }
}
