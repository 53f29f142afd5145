// ── Domain model ──
//
// Types shared by every component of the sync engine. Wire shapes live in
// `direktive_api::protocol`; `crate::convert` maps between the two.

mod command;
mod entity;
mod record;

pub use command::{Action, CommandMessage, CommandOutcome, CommandResult, FailureKind, ServiceCall};
pub use entity::{
    Capabilities, Capability, EntityId, EntityState, EntityType, ExposedEntity,
    FORWARDED_ATTRIBUTES, HostEntity,
};
pub use record::{Notice, StateChangeRecord, SyncCursor};
