//! Tagged error kinds shared across the session, extension, and codec layers.

use thiserror::Error;

/// Stable error surface for the protocol core.
///
/// Every variant carries the `code()` string a remote peer sees on an error
/// response, so local and wire-originated failures can be matched the same
/// way regardless of which side produced them.
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("handshake callback failed: {0}")]
    HandshakeFailed(String),

    #[error("connection invalid: {0}")]
    ConnectionInvalid(String),

    #[error("frame arrived for unknown extension: {0}")]
    ExtensionMissing(String),

    #[error("extension open/init failed: {0}")]
    InitFailed(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("{0}")]
    System(String),

    #[error("no handler installed for incoming request")]
    NoHandler,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("extension already open")]
    AlreadyOpen,

    #[error("session is closed")]
    Closed,
}

impl ProtocolError {
    /// The stable string code a remote peer (or a local caller) branches on.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::HandshakeFailed(_) => "ERR_PROTOCOL_HANDSHAKE_FAILED",
            ProtocolError::ConnectionInvalid(_) => "ERR_PROTOCOL_CONNECTION_INVALID",
            ProtocolError::ExtensionMissing(_) => "ERR_PROTOCOL_EXTENSION_MISSING",
            ProtocolError::InitFailed(_) => "ERR_PROTOCOL_INIT_FAILED",
            ProtocolError::RequestTimeout => "ERR_REQUEST_TIMEOUT",
            ProtocolError::System(_) => "ERR_SYSTEM",
            ProtocolError::NoHandler => "ERR_NO_HANDLER",
            ProtocolError::InvalidArgument(_) => "ERR_INVALID_ARGUMENT",
            ProtocolError::AlreadyOpen => "ERR_ALREADY_OPEN",
            ProtocolError::Closed => "ERR_CLOSE",
        }
    }

    /// Builds the `{code, message}` pair carried on a wire error response.
    pub fn to_wire(&self) -> (String, String) {
        (self.code().to_string(), self.to_string())
    }

    /// Reconstructs a `ProtocolError` from a wire `{code, message}` pair.
    ///
    /// Unknown codes fall back to `System`, matching the teacher's habit of
    /// never panicking on a malformed peer message.
    pub fn from_wire(code: &str, message: String) -> Self {
        match code {
            "ERR_PROTOCOL_HANDSHAKE_FAILED" => ProtocolError::HandshakeFailed(message),
            "ERR_PROTOCOL_CONNECTION_INVALID" => ProtocolError::ConnectionInvalid(message),
            "ERR_PROTOCOL_EXTENSION_MISSING" => ProtocolError::ExtensionMissing(message),
            "ERR_PROTOCOL_INIT_FAILED" => ProtocolError::InitFailed(message),
            "ERR_REQUEST_TIMEOUT" => ProtocolError::RequestTimeout,
            "ERR_NO_HANDLER" => ProtocolError::NoHandler,
            "ERR_INVALID_ARGUMENT" => ProtocolError::InvalidArgument(message),
            "ERR_ALREADY_OPEN" => ProtocolError::AlreadyOpen,
            "ERR_CLOSE" => ProtocolError::Closed,
            _ => ProtocolError::System(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_preserves_code() {
        let err = ProtocolError::System("boom".into());
        let (code, message) = err.to_wire();
        let back = ProtocolError::from_wire(&code, message);
        assert_eq!(back.code(), "ERR_SYSTEM");
    }

    #[test]
    fn unknown_wire_code_falls_back_to_system() {
        let back = ProtocolError::from_wire("ERR_MADE_UP", "huh".into());
        assert_eq!(back.code(), "ERR_SYSTEM");
    }
}
