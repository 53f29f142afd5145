// Cloud sync wire protocol.
//
// Every WebSocket text frame is a versioned `Frame` carrying either a
// plaintext `CloudMessage` or a sealed (encrypted) one. The message enum is
// internally tagged by `type`; unknown types decode to `Unknown` so newer
// cloud builds do not break older bridges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::PayloadCipher;
use crate::error::Error;

/// Current frame version.
pub const PROTOCOL_VERSION: u8 = 1;

// ── Messages ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CloudMessage {
    StateUpdate {
        records: Vec<WireStateRecord>,
    },
    StateAck {
        seq: u64,
    },
    Command(WireCommand),
    CommandResult(WireCommandResult),
    ResumeRequest {
        connection_epoch: u64,
        last_acked_seq: u64,
    },
    ResumeResponse {
        mode: ResumeMode,
        #[serde(default)]
        pending_commands: Vec<WireCommand>,
    },
    EntityExposed {
        entity_id: String,
        entity_type: String,
        capabilities: Vec<String>,
    },
    EntityUnexposed {
        entity_id: String,
    },
    Session(SessionGrant),
    AuthRevoked {
        #[serde(default)]
        reason: String,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    #[serde(other)]
    Unknown,
}

impl CloudMessage {
    /// Short name for logging; never includes payload content.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateUpdate { .. } => "state_update",
            Self::StateAck { .. } => "state_ack",
            Self::Command(_) => "command",
            Self::CommandResult(_) => "command_result",
            Self::ResumeRequest { .. } => "resume_request",
            Self::ResumeResponse { .. } => "resume_response",
            Self::EntityExposed { .. } => "entity_exposed",
            Self::EntityUnexposed { .. } => "entity_unexposed",
            Self::Session(_) => "session",
            Self::AuthRevoked { .. } => "auth_revoked",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Unknown => "unknown",
        }
    }
}

/// One state change as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireStateRecord {
    pub seq: u64,
    pub entity_id: String,
    pub entity_type: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCommand {
    pub command_id: String,
    pub entity_id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCommandResult {
    pub command_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// Cloud's answer to a `resume_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// The cloud holds everything through `acked_through`; resend the rest.
    Resume { acked_through: u64 },
    /// The cloud has no record of this cursor.
    FullResync,
}

/// Session token issued by the cloud after the upgrade succeeds.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for SessionGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGrant")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ── Frames ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    v: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<CloudMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sealed: Option<String>,
}

/// Serialize `message` into a frame, sealing it when a cipher is configured.
pub fn encode_frame(
    message: &CloudMessage,
    cipher: Option<&PayloadCipher>,
) -> Result<String, Error> {
    let frame = match cipher {
        Some(cipher) => {
            let inner = serde_json::to_vec(message).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: String::new(),
            })?;
            Frame {
                v: PROTOCOL_VERSION,
                message: None,
                sealed: Some(cipher.seal(&inner)?),
            }
        }
        None => Frame {
            v: PROTOCOL_VERSION,
            message: Some(message.clone()),
            sealed: None,
        },
    };
    serde_json::to_string(&frame).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: String::new(),
    })
}

/// Parse a text frame. With a cipher configured, plaintext frames are refused.
pub fn decode_frame(text: &str, cipher: Option<&PayloadCipher>) -> Result<CloudMessage, Error> {
    let frame: Frame = serde_json::from_str(text).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: text.to_owned(),
    })?;

    if frame.v != PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported frame version {}",
            frame.v
        )));
    }

    match (frame.message, frame.sealed, cipher) {
        (_, Some(sealed), Some(cipher)) => {
            let plain = cipher.open(&sealed)?;
            serde_json::from_slice(&plain).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: String::from_utf8_lossy(&plain).into_owned(),
            })
        }
        (_, Some(_), None) => Err(Error::Protocol(
            "received sealed frame but no encryption key is configured".into(),
        )),
        (Some(_), None, Some(_)) => Err(Error::Protocol(
            "plaintext frame refused: encryption is required".into(),
        )),
        (Some(message), None, None) => Ok(message),
        (None, None, _) => Err(Error::Protocol("frame carries no message".into())),
    }
}
