// ── Outbound records, notices and the sync cursor ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{Capabilities, EntityId, EntityState, EntityType};

/// One observed state change of an exposed entity. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeRecord {
    pub seq: u64,
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub new_state: EntityState,
    pub timestamp: DateTime<Utc>,
}

/// Exposure change the cloud must be told about explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Exposed {
        entity_id: EntityId,
        entity_type: EntityType,
        capabilities: Capabilities,
    },
    Unexposed {
        entity_id: EntityId,
    },
}

impl Notice {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            Self::Exposed { entity_id, .. } | Self::Unexposed { entity_id } => entity_id,
        }
    }
}

/// How far the outbound backlog has been confirmed by the cloud.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Only advances on an explicit cloud ack.
    pub last_acked_seq: u64,
    /// Incremented on every successful connection.
    pub connection_epoch: u64,
}
