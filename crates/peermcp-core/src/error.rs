//! Error types for MCP operations.

use serde_json::Value;

/// JSON-RPC parse error code.
pub const PARSE_ERROR: i32 = -32700;
/// JSON-RPC invalid request code.
pub const INVALID_REQUEST: i32 = -32600;
/// JSON-RPC method not found code.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// JSON-RPC invalid params code.
pub const INVALID_PARAMS: i32 = -32602;
/// JSON-RPC internal error code.
pub const INTERNAL_ERROR: i32 = -32603;
/// Application-range code for transport-level connection faults surfaced to
/// waiters on pending responses.
pub const CONNECTION_ERROR: i32 = -32001;

/// Classified error kinds produced by the engine.
///
/// Each kind maps onto a JSON-RPC error code via [`ErrorCode::json_rpc_code`].
/// Kinds without a dedicated wire code collapse to `-32603`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Message bytes could not be parsed as JSON-RPC.
    ParseError,
    /// Envelope failed validation (bad version, missing method or id).
    InvalidRequest,
    /// Method is unknown, or disabled by the negotiated capabilities.
    MethodNotFound,
    /// Parameters failed schema validation.
    InvalidParams,
    /// Handler failure or any otherwise-unclassified error.
    InternalError,
    /// The underlying connection failed while responses were outstanding.
    ConnectionError,
    /// The session exists but has been closed.
    SessionClosed,
    /// No session with the given id is known.
    SessionMissing,
    /// The initialize handshake has not completed for this session.
    SessionNotInitialized,
    /// The peer did not advertise the capability required by this method.
    NotSupported,
    /// The caller cancelled the request.
    Cancelled,
    /// The session send queue is drained and closed.
    SendEof,
    /// A second response arrived for an already-delivered request id.
    DuplicateResponse,
    /// The server is shutting down and rejects new work.
    Shutdown,
}

impl ErrorCode {
    /// Returns the JSON-RPC error code for this kind.
    #[must_use]
    pub fn json_rpc_code(self) -> i32 {
        match self {
            ErrorCode::ParseError => PARSE_ERROR,
            ErrorCode::InvalidRequest => INVALID_REQUEST,
            ErrorCode::MethodNotFound | ErrorCode::NotSupported => METHOD_NOT_FOUND,
            ErrorCode::InvalidParams => INVALID_PARAMS,
            ErrorCode::ConnectionError => CONNECTION_ERROR,
            _ => INTERNAL_ERROR,
        }
    }

    /// Maps a wire error code back onto the closest kind.
    #[must_use]
    pub fn from_json_rpc_code(code: i32) -> Self {
        match code {
            PARSE_ERROR => ErrorCode::ParseError,
            INVALID_REQUEST => ErrorCode::InvalidRequest,
            METHOD_NOT_FOUND => ErrorCode::MethodNotFound,
            INVALID_PARAMS => ErrorCode::InvalidParams,
            CONNECTION_ERROR => ErrorCode::ConnectionError,
            _ => ErrorCode::InternalError,
        }
    }
}

/// An MCP error: a classified kind, a human-readable message, and optional
/// structured data carried on the wire.
#[derive(Debug, Clone)]
pub struct McpError {
    /// Error classification.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Additional structured data.
    pub data: Option<Value>,
}

/// Result alias for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

impl McpError {
    /// Creates an error with the given kind and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured data to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Reconstructs an error from a wire error object received from the peer.
    #[must_use]
    pub fn from_wire(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code: ErrorCode::from_json_rpc_code(code),
            message: message.into(),
            data,
        }
    }

    /// Parse failure.
    #[must_use]
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    /// Invalid request envelope.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Unknown method.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("method not supported: method={method}"),
        )
    }

    /// Invalid parameters.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    /// Internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Connection failure surfaced to a pending-response waiter.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionError, message)
    }

    /// The session has been closed.
    #[must_use]
    pub fn session_closed() -> Self {
        Self::new(ErrorCode::SessionClosed, "session already closed")
    }

    /// No session with the given id exists.
    #[must_use]
    pub fn session_missing() -> Self {
        Self::new(ErrorCode::SessionMissing, "lack session")
    }

    /// The session has not completed the initialize handshake.
    #[must_use]
    pub fn session_not_initialized() -> Self {
        Self::new(ErrorCode::SessionNotInitialized, "session not initialized")
    }

    /// The peer did not advertise the required capability.
    #[must_use]
    pub fn not_supported() -> Self {
        Self::new(
            ErrorCode::NotSupported,
            "capability not supported by this peer",
        )
    }

    /// The caller cancelled the request.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, reason)
    }

    /// The send queue is drained and closed.
    #[must_use]
    pub fn send_eof() -> Self {
        Self::new(ErrorCode::SendEof, "send EOF")
    }

    /// A duplicate response arrived for an already-delivered id.
    #[must_use]
    pub fn duplicate_response(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::DuplicateResponse, detail)
    }

    /// The server is shutting down.
    #[must_use]
    pub fn shutdown() -> Self {
        Self::new(ErrorCode::Shutdown, "server already shutdown")
    }
}

impl std::fmt::Display for McpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for McpError {}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::parse_error(format!("json unmarshal: {err}"))
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::internal(format!("io: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping_follows_json_rpc() {
        assert_eq!(ErrorCode::ParseError.json_rpc_code(), -32700);
        assert_eq!(ErrorCode::InvalidRequest.json_rpc_code(), -32600);
        assert_eq!(ErrorCode::MethodNotFound.json_rpc_code(), -32601);
        assert_eq!(ErrorCode::NotSupported.json_rpc_code(), -32601);
        assert_eq!(ErrorCode::InvalidParams.json_rpc_code(), -32602);
        assert_eq!(ErrorCode::SessionClosed.json_rpc_code(), -32603);
        assert_eq!(ErrorCode::ConnectionError.json_rpc_code(), -32001);
    }

    #[test]
    fn wire_round_trip_preserves_known_codes() {
        for code in [-32700, -32600, -32601, -32602, -32603, -32001] {
            let err = McpError::from_wire(code, "m", None);
            assert_eq!(err.code.json_rpc_code(), code);
        }
        // Unknown codes collapse to internal
        let err = McpError::from_wire(-32099, "m", None);
        assert_eq!(err.code, ErrorCode::InternalError);
    }
}
