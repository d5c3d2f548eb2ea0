use thiserror::Error;

/// JSON-RPC error code for "method not found".
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC error code for "invalid params" (older nodes reject unknown filters this way).
pub const RPC_INVALID_PARAMS: i64 = -32602;

/// Top-level error type for the `blocksync-api` crate.
///
/// Covers every wire-level failure mode: HTTP transport, JSON-RPC, the
/// envelope stream, and feed queries. `blocksync-core` maps these into
/// user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Request exceeded the transport timeout.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Non-success HTTP status with the (truncated) body.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Node rejected the bearer token.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Calls are disabled because the node is configured as offline.
    #[error("RPC disabled (offline mode)")]
    Offline,

    // ── JSON-RPC ────────────────────────────────────────────────────
    /// Structured JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Response did not follow the JSON-RPC 2.0 envelope.
    #[error("Invalid JSON-RPC response: {0}")]
    InvalidResponse(String),

    // ── Stream ──────────────────────────────────────────────────────
    /// Stream transport could not be opened.
    #[error("Stream connection failed: {0}")]
    StreamConnect(String),

    /// Stream transport failed while reading or writing.
    #[error("Stream transport error: {0}")]
    StreamTransport(String),

    /// Stream closed by the remote side.
    #[error("Stream closed (code {code}): {reason}")]
    StreamClosed { code: u16, reason: String },

    /// Envelope could not be parsed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    // ── Feeds ───────────────────────────────────────────────────────
    /// The feed does not support the requested server-side filter.
    #[error("Feed does not support filter parameter '{param}'")]
    FilterUnsupported { param: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Timeout { .. } | Self::StreamConnect(_) | Self::StreamTransport(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if the remote side lacks the requested feature
    /// (method, filter, or endpoint).
    pub fn is_unsupported(&self) -> bool {
        match self {
            Self::FilterUnsupported { .. } => true,
            Self::Rpc { code, .. } => *code == RPC_METHOD_NOT_FOUND || *code == RPC_INVALID_PARAMS,
            _ => self.is_not_found(),
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Http { status: 404, .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if the credentials were rejected.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_found_is_unsupported() {
        let err = Error::Rpc {
            code: RPC_METHOD_NOT_FOUND,
            message: "no such method".into(),
        };
        assert!(err.is_unsupported());
        assert!(!err.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(Error::Http { status: 503, body: String::new() }.is_transient());
        assert!(Error::Http { status: 429, body: String::new() }.is_transient());
        assert!(!Error::Http { status: 400, body: String::new() }.is_transient());
    }

    #[test]
    fn http_404_is_not_found_and_unsupported() {
        let err = Error::Http {
            status: 404,
            body: "missing".into(),
        };
        assert!(err.is_not_found());
        assert!(err.is_unsupported());
    }

    #[test]
    fn protocol_errors_are_not_retried() {
        assert!(!Error::Protocol("bad".into()).is_transient());
    }
}
