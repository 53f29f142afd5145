// direktive-core: exposure registry and bidirectional sync engine
//
// Decides which Home Assistant entities the cloud may see and control,
// streams their state changes with at-least-once delivery, applies cloud
// commands at most once, and reconciles after every reconnect.

pub mod bridge;
pub mod config;
pub mod connector;
pub mod convert;
pub mod credentials;
pub mod error;
pub mod host;
pub mod inbound;
pub mod ledger;
pub mod model;
pub mod observer;
pub mod outbound;
pub mod reconcile;
pub mod registry;
pub mod store;

pub use bridge::{Bridge, SyncPhase, SyncStatus};
pub use config::BridgeConfig;
pub use connector::{CloudConnector, WsConnector};
pub use credentials::{AuthState, CredentialManager};
pub use error::CoreError;
pub use host::{HassHost, HostPlatform, HostStateEvent, StateSubscription};
pub use inbound::{CommandJob, CommandListener};
pub use ledger::{CommandLedger, LedgerDecision};
pub use model::{
    Action, Capabilities, Capability, CommandMessage, CommandOutcome, CommandResult, EntityId,
    EntityState, EntityType, ExposedEntity, FailureKind, HostEntity, Notice, ServiceCall,
    StateChangeRecord, SyncCursor,
};
pub use observer::StateObserver;
pub use outbound::{AckOutcome, OutboundQueue};
pub use reconcile::{ReconcileReport, Reconciler, ResumeReply};
pub use registry::{DeclaredDiff, ExposureRegistry, ExposureSnapshot};
pub use store::{BridgeStore, StorageError, StoredSummary};
