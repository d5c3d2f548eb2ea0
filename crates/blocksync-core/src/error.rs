// ── Core error types ──
//
// User-facing errors from blocksync-core. Consumers never see raw HTTP
// bodies or JSON-RPC envelopes; the `From<blocksync_api::Error>` impl
// translates wire-level failures into these variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach node at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Node access disabled (offline mode)")]
    Offline,

    // ── Remote errors ────────────────────────────────────────────────
    #[error("Operation not supported by node: {operation}")]
    Unsupported { operation: String },

    #[error("Node error: {message}")]
    Remote {
        message: String,
        /// JSON-RPC error code, when the node sent one.
        code: Option<i64>,
        /// HTTP status, when the failure was at the HTTP layer.
        status: Option<u16>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// `true` when the node lacks the method, filter, or endpoint asked for.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

// ── Conversion from wire-level errors ────────────────────────────────

impl From<blocksync_api::Error> for CoreError {
    fn from(err: blocksync_api::Error) -> Self {
        use blocksync_api::Error as Api;

        if err.is_unsupported() {
            return CoreError::Unsupported {
                operation: err.to_string(),
            };
        }

        match err {
            Api::Authentication { message } => CoreError::AuthenticationFailed { message },
            Api::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_ms: 0 }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e.url().map_or_else(|| "<unknown>".into(), ToString::to_string),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Remote {
                        message: e.to_string(),
                        code: None,
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            Api::Timeout { timeout_ms } => CoreError::Timeout { timeout_ms },
            Api::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            Api::Http { status, body } => CoreError::Remote {
                message: body,
                code: None,
                status: Some(status),
            },
            Api::Offline => CoreError::Offline,
            Api::Rpc { code, message } => CoreError::Remote {
                message,
                code: Some(code),
                status: None,
            },
            Api::StreamConnect(reason) | Api::StreamTransport(reason) => {
                CoreError::ConnectionFailed {
                    url: String::new(),
                    reason,
                }
            }
            Api::StreamClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("stream closed (code {code}): {reason}"),
            },
            Api::InvalidResponse(msg) | Api::Protocol(msg) => CoreError::Protocol(msg),
            Api::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            // Classified above.
            Api::FilterUnsupported { param } => CoreError::Unsupported {
                operation: format!("filter '{param}'"),
            },
        }
    }
}

/// Error recorded in `SyncState::last_error`.
///
/// Cloneable so every state snapshot can carry it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The stream sender reported an error envelope.
    #[error("Remote error: {message}")]
    Remote { message: String },

    /// The stream used up its reconnect budget.
    #[error("Stream unavailable after {attempts} reconnect attempts")]
    PersistentFailure { attempts: u32 },

    /// A single poll request failed.
    #[error("Poll failed: {message}")]
    Poll { message: String },

    /// The snapshot bootstrap request failed; live data may still arrive.
    #[error("Initial snapshot failed: {message}")]
    Bootstrap { message: String },
}
