//! Error types for mcp-gateway
//!
//! Follows a 3-tier hierarchy: protocol-level errors (preserved from
//! `turbomcp-protocol` so JSON-RPC error codes survive the round trip),
//! transport-level errors (I/O, upstream connection failures), and
//! gateway-specific errors (session/process lifecycle, storage, configuration).

use thiserror::Error;
use turbomcp_protocol::jsonrpc::{JsonRpcError, JsonRpcErrorCode};

/// Result type for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Gateway-specific JSON-RPC application error codes.
///
/// These occupy the `-32000..-32099` "server error" range reserved by the
/// JSON-RPC 2.0 spec for implementation-defined errors, matching the
/// application codes named in the gateway's failure semantics table.
pub mod codes {
    pub const PROCESS_CRASHED: i32 = -32001;
    pub const SESSION_NOT_FOUND: i32 = -32002;
    pub const SESSION_CRASHED: i32 = -32003;
    pub const RESTART_NOT_SUPPORTED: i32 = -32004;
    pub const INVALID_REQUEST: i32 = -32005;
    pub const SERVER_ERROR: i32 = -32006;
    pub const RATE_LIMIT_EXCEEDED: i32 = -32007;
}

/// Main error type for mcp-gateway
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// Protocol-level error from the MCP protocol layer.
    ///
    /// Preserves the full protocol error with its original code so it can be
    /// forwarded to clients unchanged.
    #[error("protocol error: {0}")]
    Protocol(#[from] Box<turbomcp_protocol::Error>),

    /// Malformed or unparseable JSON-RPC request body.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A well-formed JSON document that is not a valid JSON-RPC 2.0 envelope.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Server name referenced in a route is not registered.
    #[error("unknown server: {name}")]
    UnknownServer { name: String },

    /// A server with this name is already registered.
    #[error("server already registered: {name}")]
    DuplicateServer { name: String },

    /// Server configuration failed validation (name shape, command allowlist, URL).
    #[error("invalid server configuration: {message}")]
    Configuration { message: String },

    /// Upstream transport failure: DNS, connect, timeout, non-2xx, decode error.
    #[error("upstream transport error: {message}")]
    UpstreamTransport { message: String },

    /// Shared-mode stdio subprocess has crashed; no auto-restart.
    #[error("stdio process crashed: {message}")]
    ProcessCrashed { message: String },

    /// Isolated-mode session has no known subprocess.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Isolated-mode session's subprocess crashed.
    #[error("session crashed: {session_id}")]
    SessionCrashed { session_id: String },

    /// `restart()` called on a mode that does not support it.
    #[error("restart not supported in this session mode")]
    RestartNotSupported,

    /// A pending request exceeded its deadline.
    #[error("request timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Too many mapping/session entries outstanding.
    #[error("rate limit exceeded: {message}")]
    RateLimitExceeded { message: String },

    /// Storage backend failure (write, read, CRUD on server config).
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Bearer-token authentication failed.
    #[error("authentication failed")]
    AuthFailed,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (subprocess spawn, file access).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client/transport error talking to an upstream.
    #[error("http error: {message}")]
    Http { message: String, status: Option<u16> },
}

impl GatewayError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    pub fn unknown_server(name: impl Into<String>) -> Self {
        Self::UnknownServer { name: name.into() }
    }

    pub fn duplicate_server(name: impl Into<String>) -> Self {
        Self::DuplicateServer { name: name.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn upstream_transport(message: impl Into<String>) -> Self {
        Self::UpstreamTransport { message: message.into() }
    }

    pub fn process_crashed(message: impl Into<String>) -> Self {
        Self::ProcessCrashed { message: message.into() }
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound { session_id: session_id.into() }
    }

    pub fn session_crashed(session_id: impl Into<String>) -> Self {
        Self::SessionCrashed { session_id: session_id.into() }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), timeout_ms }
    }

    pub fn rate_limit_exceeded(message: impl Into<String>) -> Self {
        Self::RateLimitExceeded { message: message.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    pub fn http(message: impl Into<String>) -> Self {
        Self::Http { message: message.into(), status: None }
    }

    pub fn http_with_status(message: impl Into<String>, status: u16) -> Self {
        Self::Http { message: message.into(), status: Some(status) }
    }

    /// Sanitized message safe to surface to a client (no internal paths, no
    /// subprocess command lines, no storage backend internals).
    pub fn sanitize(&self) -> String {
        match self {
            Self::Protocol(_) => "protocol error occurred".to_string(),
            Self::Parse { .. } => "parse error".to_string(),
            Self::InvalidRequest { .. } => "invalid request".to_string(),
            Self::UnknownServer { name } => format!("unknown server: {name}"),
            Self::DuplicateServer { name } => format!("server already registered: {name}"),
            Self::Configuration { .. } => "invalid server configuration".to_string(),
            Self::UpstreamTransport { .. } => "upstream transport error".to_string(),
            Self::ProcessCrashed { .. } => {
                "upstream process crashed; use the restart control".to_string()
            }
            Self::SessionNotFound { .. } => "session not found".to_string(),
            Self::SessionCrashed { .. } => "session crashed; start a new session".to_string(),
            Self::RestartNotSupported => "restart not supported for this server".to_string(),
            Self::Timeout { operation, .. } => format!("operation timed out: {operation}"),
            Self::RateLimitExceeded { .. } => "rate limit exceeded".to_string(),
            Self::Storage { .. } => "storage error".to_string(),
            Self::AuthFailed => "authentication failed".to_string(),
            Self::Serialization(_) => "serialization error".to_string(),
            Self::Io(_) => "io error".to_string(),
            Self::Http { status, .. } => match status {
                Some(code) => format!("http error {code}"),
                None => "http error".to_string(),
            },
        }
    }

    /// HTTP status code the router should pass through for gateway-originated
    /// errors (spec.md §7 / §4.10 step 8).
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Self::UnknownServer { .. } => StatusCode::NOT_FOUND,
            Self::Parse { .. } | Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::AuthFailed => StatusCode::UNAUTHORIZED,
            Self::DuplicateServer { .. } | Self::Configuration { .. } => StatusCode::BAD_REQUEST,
            Self::Http { status: Some(code), .. } => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::UpstreamTransport { .. } | Self::Http { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map to a JSON-RPC error object so the client always receives a
    /// well-formed reply (spec.md §7 propagation policy).
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        match self {
            Self::Protocol(err) => JsonRpcError {
                code: protocol_error_code(err),
                message: err.to_string(),
                data: None,
            },
            Self::Parse { message } => {
                JsonRpcError { code: JsonRpcErrorCode::ParseError.code(), message: message.clone(), data: None }
            }
            Self::InvalidRequest { message } => JsonRpcError {
                code: JsonRpcErrorCode::InvalidRequest.code(),
                message: message.clone(),
                data: None,
            },
            Self::Configuration { .. } | Self::RateLimitExceeded { .. } => JsonRpcError {
                code: JsonRpcErrorCode::InvalidParams.code(),
                message: self.sanitize(),
                data: None,
            },
            Self::ProcessCrashed { .. } => JsonRpcError {
                code: codes::PROCESS_CRASHED,
                message: "upstream process crashed; use the restart control".to_string(),
                data: None,
            },
            Self::SessionNotFound { .. } => JsonRpcError {
                code: codes::SESSION_NOT_FOUND,
                message: "session not found".to_string(),
                data: None,
            },
            Self::SessionCrashed { .. } => JsonRpcError {
                code: codes::SESSION_CRASHED,
                message: "session crashed; start a new session".to_string(),
                data: None,
            },
            Self::RestartNotSupported => JsonRpcError {
                code: codes::RESTART_NOT_SUPPORTED,
                message: "restart not supported for this server".to_string(),
                data: None,
            },
            Self::Timeout { .. } => JsonRpcError {
                code: codes::SERVER_ERROR,
                message: self.sanitize(),
                data: None,
            },
            Self::UpstreamTransport { .. } | Self::Http { .. } | Self::Io(_) => JsonRpcError {
                code: JsonRpcErrorCode::InternalError.code(),
                message: self.sanitize(),
                data: None,
            },
            _ => JsonRpcError {
                code: JsonRpcErrorCode::InternalError.code(),
                message: self.sanitize(),
                data: None,
            },
        }
    }

    /// Whether retrying the same operation might succeed. Used only for
    /// capture/logging; the gateway never auto-retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTransport { .. } | Self::Timeout { .. } | Self::Io(_) | Self::Http { .. }
        )
    }
}

fn protocol_error_code(err: &turbomcp_protocol::Error) -> i32 {
    use turbomcp_protocol::ErrorKind;
    match err.kind {
        ErrorKind::InvalidParams => JsonRpcErrorCode::InvalidParams.code(),
        ErrorKind::InvalidRequest => JsonRpcErrorCode::InvalidRequest.code(),
        ErrorKind::ParseError => JsonRpcErrorCode::ParseError.code(),
        ErrorKind::MethodNotFound => JsonRpcErrorCode::MethodNotFound.code(),
        _ => JsonRpcErrorCode::InternalError.code(),
    }
}

impl From<turbomcp_protocol::Error> for GatewayError {
    fn from(err: turbomcp_protocol::Error) -> Self {
        Self::Protocol(Box::new(err))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        match status {
            Some(code) => Self::http_with_status(err.to_string(), code),
            None => Self::upstream_transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_hides_internal_detail() {
        let err = GatewayError::configuration("command 'rm -rf /' not in allowlist");
        assert_eq!(err.sanitize(), "invalid server configuration");
    }

    #[test]
    fn jsonrpc_codes_match_failure_table() {
        assert_eq!(
            GatewayError::process_crashed("x").to_jsonrpc_error().code,
            codes::PROCESS_CRASHED
        );
        assert_eq!(
            GatewayError::session_not_found("s1").to_jsonrpc_error().code,
            codes::SESSION_NOT_FOUND
        );
        assert_eq!(
            GatewayError::RestartNotSupported.to_jsonrpc_error().code,
            codes::RESTART_NOT_SUPPORTED
        );
        assert_eq!(GatewayError::parse("bad json").to_jsonrpc_error().code, -32700);
    }

    #[test]
    fn status_codes_match_router_contract() {
        assert_eq!(GatewayError::unknown_server("x").status_code(), http::StatusCode::NOT_FOUND);
        assert_eq!(GatewayError::parse("x").status_code(), http::StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::upstream_transport("x").status_code(),
            http::StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn retryability() {
        assert!(GatewayError::timeout("call", 30_000).is_retryable());
        assert!(!GatewayError::configuration("bad").is_retryable());
    }

    #[test]
    fn protocol_error_preserved() {
        let protocol_err = turbomcp_protocol::Error::invalid_params("bad shape");
        let gw_err = GatewayError::from(protocol_err);
        assert_eq!(gw_err.to_jsonrpc_error().code, JsonRpcErrorCode::InvalidParams.code());
    }
}
