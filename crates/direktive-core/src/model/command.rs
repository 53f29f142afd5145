// ── Inbound commands and their results ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::entity::EntityId;

/// A command pushed by the cloud. `entity_id` stays raw until it has been
/// checked against the registry, so malformed ids are rejected as
/// unauthorized rather than failing to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command_id: String,
    pub entity_id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub issued_at: DateTime<Utc>,
}

/// Actions the bridge knows how to translate.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    TurnOn,
    TurnOff,
    Toggle,
    Open,
    Close,
    Stop,
    SetPosition,
}

/// A fully translated host action call.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub entity_id: EntityId,
    pub data: Map<String, Value>,
}

/// Why a command did not succeed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    NotAuthorized,
    InvalidCommand,
    ActionFailed,
    Timeout,
    /// The command was dispatched before a crash and its result was never recorded.
    OutcomeUnknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Success,
    Failure { kind: FailureKind, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub outcome: CommandOutcome,
}

impl CommandResult {
    pub fn success(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            outcome: CommandOutcome::Success,
        }
    }

    pub fn failure(
        command_id: impl Into<String>,
        kind: FailureKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            outcome: CommandOutcome::Failure {
                kind,
                detail: detail.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Success)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            CommandOutcome::Success => None,
            CommandOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}
