// ── Core error types ──
//
// The sync engine's taxonomy. Transport-level failures from
// direktive-api are folded into `Auth`, `Transport` or `Timeout` by the
// `From<direktive_api::Error>` impl; callers decide retry policy with
// `is_transient()` and `is_auth()`.

use thiserror::Error;

use crate::model::{Capability, EntityType};
use crate::store::StorageError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connectivity ─────────────────────────────────────────────────
    /// Invalid or revoked credentials. Sync stays suspended until the
    /// key is rotated.
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Authorization ────────────────────────────────────────────────
    #[error("Entity {entity_id} is not exposed with {capability}")]
    NotAuthorized {
        entity_id: String,
        capability: Capability,
    },

    // ── Configuration-time ───────────────────────────────────────────
    #[error("Unknown entity: {entity_id}")]
    UnknownEntity { entity_id: String },

    #[error("Unsupported entity type '{domain}' for {entity_id}")]
    UnsupportedType { entity_id: String, domain: String },

    #[error("{entity_type} entities cannot be granted {capability}")]
    UnsupportedCapability {
        entity_type: EntityType,
        capability: Capability,
    },

    #[error("Invalid entity id '{value}' (expected <domain>.<object_id>)")]
    InvalidEntityId { value: String },

    // ── Commands ─────────────────────────────────────────────────────
    #[error("Invalid command: {message}")]
    InvalidCommand { message: String },

    /// The host platform rejected or failed the action.
    #[error("Action failed: {message}")]
    ActionExecution { message: String },

    // ── Infrastructure ───────────────────────────────────────────────
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Bridge is shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<direktive_api::Error> for CoreError {
    fn from(err: direktive_api::Error) -> Self {
        use direktive_api::Error as Api;

        if err.is_auth_failure() {
            return CoreError::Auth {
                message: err.to_string(),
            };
        }

        match err {
            Api::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            Api::HostCommand { code, message } => CoreError::ActionExecution {
                message: if message.is_empty() {
                    code
                } else {
                    format!("{message} ({code})")
                },
            },
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Crypto(msg) => CoreError::Config {
                message: format!("Encryption key: {msg}"),
            },
            Api::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            other => CoreError::Transport {
                message: other.to_string(),
            },
        }
    }
}
