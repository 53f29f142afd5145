//! redb-backed persistence for the bridge.
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `exposures` | `entity_id` | `ExposedEntity` (JSON) | Exposure registry |
//! | `meta` | name | `u64` | Registry version, sync cursor, epoch, flags |
//! | `outbound` | `seq` | `StateChangeRecord` (JSON) | Unacknowledged backlog |
//! | `notices` | notice id | `Notice` (JSON) | Exposure notices not yet confirmed by the cloud |
//! | `applied_commands` | `command_id` | `LedgerEntry` (JSON) | At-most-once dedup |
//!
//! Every mutation that touches more than one table runs in a single write
//! transaction, so a crash never leaves the registry and the backlog
//! disagreeing.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{CommandResult, EntityId, ExposedEntity, Notice, StateChangeRecord, SyncCursor};

const EXPOSURES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("exposures");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const OUTBOUND_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("outbound");
const NOTICES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("notices");
const APPLIED_COMMANDS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("applied_commands");

const REGISTRY_VERSION_KEY: &str = "registry_version";
const LAST_ACKED_KEY: &str = "last_acked_seq";
const LAST_ASSIGNED_KEY: &str = "last_assigned_seq";
const EPOCH_KEY: &str = "connection_epoch";
const NEXT_NOTICE_KEY: &str = "next_notice_id";
const BASELINE_KEY: &str = "baseline_done";
const REGISTERED_KEY: &str = "instance_registered";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Another process (usually the running daemon) holds the database.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Database(redb::DatabaseError::DatabaseAlreadyOpen))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// ── Ledger rows ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Recorded before the host action was invoked.
    Dispatched,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub status: LedgerStatus,
    #[serde(default)]
    pub result: Option<CommandResult>,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted state summary, readable while the daemon is not running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoredSummary {
    pub registry_version: u64,
    pub exposed_entities: usize,
    pub cursor: SyncCursor,
    pub last_assigned_seq: u64,
    pub backlog_len: usize,
    pub pending_notices: usize,
    pub applied_commands: usize,
    pub instance_registered: bool,
}

// ── Store ───────────────────────────────────────────────────────────

/// Bridge state backed by redb
#[derive(Clone)]
pub struct BridgeStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for BridgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeStore").finish_non_exhaustive()
    }
}

impl BridgeStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(EXPOSURES_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(OUTBOUND_TABLE)?;
            let _ = write_txn.open_table(NOTICES_TABLE)?;
            let _ = write_txn.open_table(APPLIED_COMMANDS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Run `f` in a write transaction and commit it.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let txn = self.db.begin_write()?;
        let value = f(&txn)?;
        txn.commit()?;
        Ok(value)
    }

    // ========== Meta ==========

    fn meta(&self, key: &str) -> StorageResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        Ok(table.get(key)?.map(|g| g.value()).unwrap_or(0))
    }

    pub fn meta_txn(txn: &WriteTransaction, key: &str) -> StorageResult<u64> {
        let table = txn.open_table(META_TABLE)?;
        Ok(table.get(key)?.map(|g| g.value()).unwrap_or(0))
    }

    fn set_meta_txn(txn: &WriteTransaction, key: &str, value: u64) -> StorageResult<()> {
        let mut table = txn.open_table(META_TABLE)?;
        table.insert(key, value)?;
        Ok(())
    }

    pub fn cursor(&self) -> StorageResult<SyncCursor> {
        Ok(SyncCursor {
            last_acked_seq: self.meta(LAST_ACKED_KEY)?,
            connection_epoch: self.meta(EPOCH_KEY)?,
        })
    }

    pub fn last_assigned_seq(&self) -> StorageResult<u64> {
        self.meta(LAST_ASSIGNED_KEY)
    }

    pub fn registry_version(&self) -> StorageResult<u64> {
        self.meta(REGISTRY_VERSION_KEY)
    }

    /// Increment and return the connection epoch.
    pub fn next_epoch(&self) -> StorageResult<u64> {
        self.write(|txn| {
            let next = Self::meta_txn(txn, EPOCH_KEY)? + 1;
            Self::set_meta_txn(txn, EPOCH_KEY, next)?;
            Ok(next)
        })
    }

    pub fn baseline_done(&self) -> StorageResult<bool> {
        Ok(self.meta(BASELINE_KEY)? != 0)
    }

    pub fn mark_baseline_done(&self) -> StorageResult<()> {
        self.write(|txn| Self::set_meta_txn(txn, BASELINE_KEY, 1))
    }

    pub fn instance_registered(&self) -> StorageResult<bool> {
        Ok(self.meta(REGISTERED_KEY)? != 0)
    }

    pub fn mark_instance_registered(&self) -> StorageResult<()> {
        self.write(|txn| Self::set_meta_txn(txn, REGISTERED_KEY, 1))
    }

    // ========== Exposures ==========

    pub fn load_exposures(&self) -> StorageResult<Vec<ExposedEntity>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EXPOSURES_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    /// Insert or replace an exposure and bump the registry version.
    pub fn put_exposure_txn(
        txn: &WriteTransaction,
        entity: &ExposedEntity,
        version: u64,
    ) -> StorageResult<()> {
        let bytes = serde_json::to_vec(entity)?;
        let mut table = txn.open_table(EXPOSURES_TABLE)?;
        table.insert(entity.entity_id.as_str(), bytes.as_slice())?;
        drop(table);
        Self::set_meta_txn(txn, REGISTRY_VERSION_KEY, version)
    }

    pub fn remove_exposure_txn(
        txn: &WriteTransaction,
        entity_id: &EntityId,
        version: u64,
    ) -> StorageResult<()> {
        let mut table = txn.open_table(EXPOSURES_TABLE)?;
        table.remove(entity_id.as_str())?;
        drop(table);
        Self::set_meta_txn(txn, REGISTRY_VERSION_KEY, version)
    }

    /// Record the newest acknowledged seq per entity on the exposure rows.
    fn mark_synced_txn(txn: &WriteTransaction, synced: &[(EntityId, u64)]) -> StorageResult<()> {
        let mut table = txn.open_table(EXPOSURES_TABLE)?;
        for (entity_id, seq) in synced {
            let current: Option<ExposedEntity> = match table.get(entity_id.as_str())? {
                Some(guard) => Some(serde_json::from_slice(guard.value())?),
                None => None,
            };
            if let Some(mut entity) = current {
                entity.last_synced_state_version = Some(*seq);
                let bytes = serde_json::to_vec(&entity)?;
                table.insert(entity_id.as_str(), bytes.as_slice())?;
            }
        }
        Ok(())
    }

    // ========== Outbound backlog ==========

    pub fn load_backlog(&self) -> StorageResult<Vec<StateChangeRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOUND_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    /// Append a record, optionally evicting one, and advance the seq high-water mark.
    pub fn append_record(
        &self,
        record: &StateChangeRecord,
        evicted: Option<u64>,
    ) -> StorageResult<()> {
        let bytes = serde_json::to_vec(record)?;
        self.write(|txn| {
            let mut table = txn.open_table(OUTBOUND_TABLE)?;
            if let Some(seq) = evicted {
                table.remove(seq)?;
            }
            table.insert(record.seq, bytes.as_slice())?;
            drop(table);
            Self::set_meta_txn(txn, LAST_ASSIGNED_KEY, record.seq)
        })
    }

    pub fn remove_records_txn(txn: &WriteTransaction, seqs: &[u64]) -> StorageResult<()> {
        let mut table = txn.open_table(OUTBOUND_TABLE)?;
        for seq in seqs {
            table.remove(*seq)?;
        }
        Ok(())
    }

    /// Purge acknowledged records and advance the cursor in one transaction.
    pub fn acknowledge(
        &self,
        seq: u64,
        purged: &[u64],
        synced: &[(EntityId, u64)],
        confirmed_notices: &[u64],
    ) -> StorageResult<()> {
        self.write(|txn| {
            Self::remove_records_txn(txn, purged)?;
            Self::remove_notices_txn(txn, confirmed_notices)?;
            Self::mark_synced_txn(txn, synced)?;
            Self::set_meta_txn(txn, LAST_ACKED_KEY, seq)
        })
    }

    pub fn remove_records(&self, seqs: &[u64]) -> StorageResult<()> {
        self.write(|txn| Self::remove_records_txn(txn, seqs))
    }

    // ========== Notices ==========

    pub fn load_notices(&self) -> StorageResult<Vec<(u64, Notice)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NOTICES_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            out.push((key.value(), serde_json::from_slice(value.value())?));
        }
        Ok(out)
    }

    /// Queue a notice, returning its id.
    pub fn push_notice_txn(txn: &WriteTransaction, notice: &Notice) -> StorageResult<u64> {
        let id = Self::meta_txn(txn, NEXT_NOTICE_KEY)? + 1;
        Self::set_meta_txn(txn, NEXT_NOTICE_KEY, id)?;
        let bytes = serde_json::to_vec(notice)?;
        let mut table = txn.open_table(NOTICES_TABLE)?;
        table.insert(id, bytes.as_slice())?;
        Ok(id)
    }

    pub fn remove_notices_txn(txn: &WriteTransaction, ids: &[u64]) -> StorageResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut table = txn.open_table(NOTICES_TABLE)?;
        for id in ids {
            table.remove(*id)?;
        }
        Ok(())
    }

    // ========== Command ledger ==========

    pub fn ledger_entry(&self, command_id: &str) -> StorageResult<Option<LedgerEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(APPLIED_COMMANDS_TABLE)?;
        match table.get(command_id)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Return the existing entry, or durably record `command_id` as dispatched.
    pub fn ledger_begin(
        &self,
        command_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<LedgerEntry>> {
        self.write(|txn| {
            let mut table = txn.open_table(APPLIED_COMMANDS_TABLE)?;
            let existing: Option<LedgerEntry> = match table.get(command_id)? {
                Some(guard) => Some(serde_json::from_slice(guard.value())?),
                None => None,
            };
            if existing.is_none() {
                let entry = LedgerEntry {
                    status: LedgerStatus::Dispatched,
                    result: None,
                    recorded_at: now,
                };
                let bytes = serde_json::to_vec(&entry)?;
                table.insert(command_id, bytes.as_slice())?;
            }
            Ok(existing)
        })
    }

    pub fn ledger_complete(&self, result: &CommandResult, now: DateTime<Utc>) -> StorageResult<()> {
        let entry = LedgerEntry {
            status: LedgerStatus::Completed,
            result: Some(result.clone()),
            recorded_at: now,
        };
        let bytes = serde_json::to_vec(&entry)?;
        self.write(|txn| {
            let mut table = txn.open_table(APPLIED_COMMANDS_TABLE)?;
            table.insert(result.command_id.as_str(), bytes.as_slice())?;
            Ok(())
        })
    }

    /// Drop ledger entries recorded before `cutoff`. Returns how many went.
    pub fn ledger_prune(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        self.write(|txn| {
            let mut table = txn.open_table(APPLIED_COMMANDS_TABLE)?;
            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let row: LedgerEntry = serde_json::from_slice(value.value())?;
                if row.recorded_at < cutoff {
                    expired.push(key.value().to_owned());
                }
            }
            for key in &expired {
                table.remove(key.as_str())?;
            }
            Ok(expired.len())
        })
    }

    // ========== Summary ==========

    pub fn summary(&self) -> StorageResult<StoredSummary> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(META_TABLE)?;
        let get = |key: &str| -> StorageResult<u64> {
            Ok(meta.get(key)?.map(|g| g.value()).unwrap_or(0))
        };
        let count = |n: u64| usize::try_from(n).unwrap_or(usize::MAX);

        Ok(StoredSummary {
            registry_version: get(REGISTRY_VERSION_KEY)?,
            exposed_entities: count(read_txn.open_table(EXPOSURES_TABLE)?.len()?),
            cursor: SyncCursor {
                last_acked_seq: get(LAST_ACKED_KEY)?,
                connection_epoch: get(EPOCH_KEY)?,
            },
            last_assigned_seq: get(LAST_ASSIGNED_KEY)?,
            backlog_len: count(read_txn.open_table(OUTBOUND_TABLE)?.len()?),
            pending_notices: count(read_txn.open_table(NOTICES_TABLE)?.len()?),
            applied_commands: count(read_txn.open_table(APPLIED_COMMANDS_TABLE)?.len()?),
            instance_registered: get(REGISTERED_KEY)? != 0,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Capabilities, EntityState, EntityType};
    use chrono::Duration;

    fn record(seq: u64, entity: &str) -> StateChangeRecord {
        StateChangeRecord {
            seq,
            entity_id: EntityId::new(entity).unwrap(),
            entity_type: EntityType::Light,
            new_state: EntityState::filtered("on", &serde_json::Map::new()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn backlog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.redb");
        {
            let store = BridgeStore::open(&path).unwrap();
            store.append_record(&record(1, "light.kitchen"), None).unwrap();
            store.append_record(&record(2, "light.kitchen"), None).unwrap();
            store.acknowledge(1, &[1], &[], &[]).unwrap();
        }
        let store = BridgeStore::open(&path).unwrap();
        let backlog = store.load_backlog().unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].seq, 2);
        assert_eq!(store.cursor().unwrap().last_acked_seq, 1);
        assert_eq!(store.last_assigned_seq().unwrap(), 2);
    }

    #[test]
    fn eviction_happens_with_append() {
        let store = BridgeStore::open_in_memory().unwrap();
        store.append_record(&record(1, "light.a"), None).unwrap();
        store.append_record(&record(2, "light.b"), Some(1)).unwrap();
        let seqs: Vec<u64> = store.load_backlog().unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2]);
    }

    #[test]
    fn ledger_begin_is_first_writer_wins() {
        let store = BridgeStore::open_in_memory().unwrap();
        let now = Utc::now();
        assert!(store.ledger_begin("c1", now).unwrap().is_none());

        let second = store.ledger_begin("c1", now).unwrap().unwrap();
        assert_eq!(second.status, LedgerStatus::Dispatched);

        store.ledger_complete(&CommandResult::success("c1"), now).unwrap();
        let third = store.ledger_begin("c1", now).unwrap().unwrap();
        assert_eq!(third.status, LedgerStatus::Completed);
        assert_eq!(third.result, Some(CommandResult::success("c1")));
    }

    #[test]
    fn ledger_prune_respects_cutoff() {
        let store = BridgeStore::open_in_memory().unwrap();
        let now = Utc::now();
        store.ledger_begin("old", now - Duration::hours(48)).unwrap();
        store.ledger_begin("new", now).unwrap();

        assert_eq!(store.ledger_prune(now - Duration::hours(24)).unwrap(), 1);
        assert!(store.ledger_entry("old").unwrap().is_none());
        assert!(store.ledger_entry("new").unwrap().is_some());
    }

    #[test]
    fn ack_marks_exposure_synced() {
        let store = BridgeStore::open_in_memory().unwrap();
        let entity = ExposedEntity {
            entity_id: EntityId::new("light.kitchen").unwrap(),
            entity_type: EntityType::Light,
            capabilities: Capabilities::all(),
            last_synced_state_version: None,
        };
        store
            .write(|txn| BridgeStore::put_exposure_txn(txn, &entity, 1))
            .unwrap();
        store.append_record(&record(1, "light.kitchen"), None).unwrap();
        store
            .acknowledge(1, &[1], &[(entity.entity_id.clone(), 1)], &[])
            .unwrap();

        let loaded = store.load_exposures().unwrap();
        assert_eq!(loaded[0].last_synced_state_version, Some(1));
        assert_eq!(store.registry_version().unwrap(), 1);
    }

    #[test]
    fn epochs_and_flags_persist() {
        let store = BridgeStore::open_in_memory().unwrap();
        assert_eq!(store.next_epoch().unwrap(), 1);
        assert_eq!(store.next_epoch().unwrap(), 2);
        assert!(!store.baseline_done().unwrap());
        store.mark_baseline_done().unwrap();
        assert!(store.baseline_done().unwrap());

        let summary = store.summary().unwrap();
        assert_eq!(summary.cursor.connection_epoch, 2);
        assert!(!summary.instance_registered);
    }
}
