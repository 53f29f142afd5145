//! Applied-command ledger.
//!
//! Remembers every command id the bridge has started executing, so a
//! redelivered command gets its original result back instead of a second
//! host invocation. Entries older than the retention window are pruned.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{CommandResult, FailureKind};
use crate::store::{BridgeStore, LedgerStatus};

/// What to do with an incoming command id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerDecision {
    /// First sighting. The id is now recorded as dispatched.
    Execute,
    /// Seen before; answer with this result.
    Replay(CommandResult),
}

#[derive(Debug, Clone)]
pub struct CommandLedger {
    store: BridgeStore,
    retention: Duration,
}

impl CommandLedger {
    pub fn new(store: BridgeStore, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Claim `command_id`, or return the result it already produced.
    ///
    /// An id that was dispatched but never completed (the process died
    /// mid-call) replays as `outcome_unknown`: the host may or may not
    /// have acted, and it must not be invoked again.
    pub fn begin(&self, command_id: &str) -> Result<LedgerDecision, CoreError> {
        let Some(entry) = self.store.ledger_begin(command_id, Utc::now())? else {
            return Ok(LedgerDecision::Execute);
        };
        let result = match (entry.status, entry.result) {
            (LedgerStatus::Completed, Some(result)) => result,
            _ => CommandResult::failure(
                command_id,
                FailureKind::OutcomeUnknown,
                "command was dispatched before a restart; outcome not recorded",
            ),
        };
        debug!(command_id, "Replaying recorded command result");
        Ok(LedgerDecision::Replay(result))
    }

    pub fn complete(&self, result: &CommandResult) -> Result<(), CoreError> {
        self.store.ledger_complete(result, Utc::now())?;
        Ok(())
    }

    /// Drop entries older than the retention window.
    pub fn prune(&self) -> Result<usize, CoreError> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| CoreError::Config {
                message: format!("invalid dedup retention: {e}"),
            })?;
        let pruned = self.store.ledger_prune(Utc::now() - retention)?;
        if pruned > 0 {
            debug!(pruned, "Pruned command ledger");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ledger() -> CommandLedger {
        CommandLedger::new(
            BridgeStore::open_in_memory().unwrap(),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn completed_commands_replay_their_result() {
        let ledger = ledger();
        assert_eq!(ledger.begin("c1").unwrap(), LedgerDecision::Execute);
        let result = CommandResult::failure("c1", FailureKind::ActionFailed, "boom");
        ledger.complete(&result).unwrap();

        assert_eq!(ledger.begin("c1").unwrap(), LedgerDecision::Replay(result));
    }

    #[test]
    fn dispatched_without_result_replays_unknown() {
        let ledger = ledger();
        assert_eq!(ledger.begin("c2").unwrap(), LedgerDecision::Execute);

        let LedgerDecision::Replay(result) = ledger.begin("c2").unwrap() else {
            panic!("expected replay");
        };
        assert_eq!(result.failure_kind(), Some(FailureKind::OutcomeUnknown));
    }

    #[test]
    fn prune_keeps_recent_entries() {
        let ledger = ledger();
        ledger.begin("c3").unwrap();
        assert_eq!(ledger.prune().unwrap(), 0);
        assert!(matches!(ledger.begin("c3").unwrap(), LedgerDecision::Replay(_)));
    }
}
