use thiserror::Error;

/// Top-level error type for the `direktive-api` crate.
///
/// Covers every failure mode across the three wire surfaces: the cloud
/// sync socket, the cloud REST endpoints, and the Home Assistant
/// WebSocket API. `direktive-core` maps these into its sync taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The cloud rejected the API key (HTTP 401/403 or `auth_revoked`).
    #[error("Invalid or revoked API key: {message}")]
    InvalidApiKey { message: String },

    /// Home Assistant rejected the access token during the auth handshake.
    #[error("Home Assistant authentication failed: {message}")]
    HostAuthentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Non-success HTTP status from the cloud REST API.
    #[error("Cloud API error (HTTP {status}): {message}")]
    CloudApi { status: u16, message: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// The session's channel to the socket task is gone.
    #[error("Session closed")]
    SessionClosed,

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// A frame could not be sealed or opened with the configured key.
    #[error("Payload encryption error: {0}")]
    Crypto(String),

    /// A frame violated the wire protocol (wrong version, plaintext when sealed is required).
    #[error("Protocol violation: {0}")]
    Protocol(String),

    // ── Home Assistant ──────────────────────────────────────────────
    /// Home Assistant answered a request with `success: false`.
    #[error("Home Assistant error ({code}): {message}")]
    HostCommand { code: String, message: String },
}

impl Error {
    /// Returns `true` if this error means the credentials themselves are bad
    /// and retrying with the same key cannot succeed.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidApiKey { .. } | Self::HostAuthentication { .. }
        ) || matches!(self, Self::CloudApi { status: 401 | 403, .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Timeout { .. }
            | Self::WebSocketConnect(_)
            | Self::WebSocketClosed { .. }
            | Self::SessionClosed => true,
            Self::CloudApi { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
