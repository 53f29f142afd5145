// ── Outbound sync queue ──
//
// Ordered, durable backlog of state change records awaiting a cloud ack,
// plus the pending exposure notices. Sequence numbers are assigned here,
// under the queue lock, so they are strictly increasing in the order
// records are persisted.
//
// Notices carry no seq of their own. One handed to the session when the
// sender had streamed through `n` is confirmed by any ack above `n`: that
// record followed it on the same ordered session. Unconfirmed notices are
// sent again on every new session.
//
// Overflow policy when the backlog is at capacity, first match wins:
//   1. oldest sensor record that a newer record for the same entity supersedes
//   2. oldest sensor record
//   3. the incoming record itself, if it is a sensor record
//   4. oldest actuator record that a newer record supersedes
//   5. oldest record

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redb::WriteTransaction;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::model::{EntityId, EntityState, EntityType, Notice, StateChangeRecord};
use crate::store::{BridgeStore, StorageResult};

#[derive(Debug, Default)]
struct QueueState {
    backlog: BTreeMap<u64, StateChangeRecord>,
    notices: BTreeMap<u64, QueuedNotice>,
    last_assigned: u64,
    last_acked: u64,
    dropped: u64,
}

#[derive(Debug)]
struct QueuedNotice {
    notice: Notice,
    /// Stream position when this went out in the current session.
    sent_at: Option<u64>,
}

impl QueuedNotice {
    fn new(notice: Notice) -> Self {
        Self {
            notice,
            sent_at: None,
        }
    }
}

/// Result of applying a cloud acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The cursor moved forward; `purged` records were removed.
    Advanced { purged: usize },
    /// At or behind the current cursor. Nothing changes.
    Stale,
    /// Beyond anything assigned. Ignored.
    Future,
}

pub struct OutboundQueue {
    store: BridgeStore,
    capacity: usize,
    state: Mutex<QueueState>,
    synced: DashMap<EntityId, u64>,
    notify: Notify,
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl OutboundQueue {
    /// Restore the backlog, notices and cursor from the store.
    ///
    /// Numbering resumes after the highest seq ever assigned, so a seq the
    /// cloud may have seen is never reused.
    pub fn load(store: BridgeStore, capacity: usize) -> Result<Self, CoreError> {
        let backlog: BTreeMap<u64, StateChangeRecord> = store
            .load_backlog()?
            .into_iter()
            .map(|r| (r.seq, r))
            .collect();
        let notices: BTreeMap<u64, QueuedNotice> = store
            .load_notices()?
            .into_iter()
            .map(|(id, n)| (id, QueuedNotice::new(n)))
            .collect();
        let last_acked = store.cursor()?.last_acked_seq;
        let last_assigned = store
            .last_assigned_seq()?
            .max(last_acked)
            .max(backlog.keys().next_back().copied().unwrap_or(0));

        let synced = DashMap::new();
        for entity in store.load_exposures()? {
            if let Some(version) = entity.last_synced_state_version {
                synced.insert(entity.entity_id, version);
            }
        }

        debug!(
            backlog = backlog.len(),
            notices = notices.len(),
            last_acked,
            last_assigned,
            "Outbound queue restored"
        );

        Ok(Self {
            store,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                backlog,
                notices,
                last_assigned,
                last_acked,
                dropped: 0,
            }),
            synced,
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ── Records ──────────────────────────────────────────────────────

    /// Assign the next seq and durably append the record.
    ///
    /// Returns `None` when the overflow policy discarded the incoming record.
    pub fn enqueue(
        &self,
        entity_id: &EntityId,
        entity_type: EntityType,
        new_state: EntityState,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<u64>, CoreError> {
        let mut state = self.lock();

        let victim = if state.backlog.len() >= self.capacity {
            match pick_victim(&state.backlog, entity_type) {
                Some(seq) => Some(seq),
                None => {
                    state.dropped += 1;
                    debug!(entity_id = %entity_id, "Backlog full, sensor record discarded");
                    return Ok(None);
                }
            }
        } else {
            None
        };

        let record = StateChangeRecord {
            seq: state.last_assigned + 1,
            entity_id: entity_id.clone(),
            entity_type,
            new_state,
            timestamp,
        };
        self.store.append_record(&record, victim)?;

        if let Some(seq) = victim {
            state.backlog.remove(&seq);
            state.dropped += 1;
            warn!(dropped_seq = seq, "Backlog full, dropped oldest eligible record");
        }
        let seq = record.seq;
        state.last_assigned = seq;
        state.backlog.insert(seq, record);
        drop(state);

        self.notify.notify_one();
        Ok(Some(seq))
    }

    /// Up to `limit` records with seq greater than `after`, in seq order.
    pub fn records_after(&self, after: u64, limit: usize) -> Vec<StateChangeRecord> {
        self.lock()
            .backlog
            .range((Bound::Excluded(after), Bound::Unbounded))
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Apply a cloud ack: purge everything through `seq` and advance the cursor.
    pub fn ack(&self, seq: u64) -> Result<AckOutcome, CoreError> {
        let mut state = self.lock();
        if seq <= state.last_acked {
            return Ok(AckOutcome::Stale);
        }
        if seq > state.last_assigned {
            warn!(seq, last_assigned = state.last_assigned, "Ignoring ack beyond assigned range");
            return Ok(AckOutcome::Future);
        }

        let purged: Vec<u64> = state.backlog.range(..=seq).map(|(s, _)| *s).collect();
        let mut newest: HashMap<EntityId, u64> = HashMap::new();
        for s in &purged {
            if let Some(r) = state.backlog.get(s) {
                newest.insert(r.entity_id.clone(), *s);
            }
        }
        let synced: Vec<(EntityId, u64)> = newest.into_iter().collect();
        let confirmed: Vec<u64> = state
            .notices
            .iter()
            .filter(|(_, n)| n.sent_at.is_some_and(|at| at < seq))
            .map(|(id, _)| *id)
            .collect();

        self.store.acknowledge(seq, &purged, &synced, &confirmed)?;

        for s in &purged {
            state.backlog.remove(s);
        }
        for id in &confirmed {
            state.notices.remove(id);
        }
        state.last_acked = seq;
        drop(state);

        for (entity_id, version) in synced {
            self.synced.insert(entity_id, version);
        }
        debug!(
            seq,
            purged = purged.len(),
            notices = confirmed.len(),
            "Cloud acknowledged records"
        );
        Ok(AckOutcome::Advanced {
            purged: purged.len(),
        })
    }

    /// Remove every unacknowledged record for `entity_id` and queue
    /// `notice`, in the same transaction as `registry_write`.
    pub fn purge_entity<F>(
        &self,
        entity_id: &EntityId,
        notice: Notice,
        registry_write: F,
    ) -> Result<usize, CoreError>
    where
        F: FnOnce(&WriteTransaction) -> StorageResult<()>,
    {
        let mut state = self.lock();
        let purged: Vec<u64> = state
            .backlog
            .iter()
            .filter(|(_, r)| &r.entity_id == entity_id)
            .map(|(s, _)| *s)
            .collect();

        let notice_id = self.store.write(|txn| {
            registry_write(txn)?;
            BridgeStore::remove_records_txn(txn, &purged)?;
            BridgeStore::push_notice_txn(txn, &notice)
        })?;

        for s in &purged {
            state.backlog.remove(s);
        }
        state.notices.insert(notice_id, QueuedNotice::new(notice));
        drop(state);

        self.synced.remove(entity_id);
        self.notify.notify_one();
        Ok(purged.len())
    }

    /// Drop the whole backlog ahead of a full resync. Returns how many went.
    pub fn clear_backlog(&self) -> Result<usize, CoreError> {
        let mut state = self.lock();
        let seqs: Vec<u64> = state.backlog.keys().copied().collect();
        self.store.remove_records(&seqs)?;
        state.backlog.clear();
        Ok(seqs.len())
    }

    // ── Notices ──────────────────────────────────────────────────────

    /// Queue a notice in the same transaction as `registry_write`.
    pub fn push_notice<F>(&self, notice: Notice, registry_write: F) -> Result<(), CoreError>
    where
        F: FnOnce(&WriteTransaction) -> StorageResult<()>,
    {
        let mut state = self.lock();
        let id = self.store.write(|txn| {
            registry_write(txn)?;
            BridgeStore::push_notice_txn(txn, &notice)
        })?;
        state.notices.insert(id, QueuedNotice::new(notice));
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Notices not yet handed to the current session, oldest first.
    pub fn pending_notices(&self) -> Vec<(u64, Notice)> {
        self.lock()
            .notices
            .iter()
            .filter(|(_, n)| n.sent_at.is_none())
            .map(|(id, n)| (*id, n.notice.clone()))
            .collect()
    }

    /// Mark a notice as handed to the session, which had streamed records
    /// through `sent_through`. It stays stored until confirmed.
    pub fn notice_sent(&self, id: u64, sent_through: u64) {
        if let Some(n) = self.lock().notices.get_mut(&id) {
            n.sent_at = Some(sent_through);
        }
    }

    /// Put every unconfirmed notice back in line. Called when a session starts.
    pub fn resend_notices(&self) -> usize {
        let mut state = self.lock();
        let mut count = 0;
        for n in state.notices.values_mut() {
            if n.sent_at.take().is_some() {
                count += 1;
            }
        }
        count
    }

    pub fn unconfirmed_notices(&self) -> usize {
        self.lock().notices.len()
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn last_acked(&self) -> u64 {
        self.lock().last_acked
    }

    pub fn last_assigned(&self) -> u64 {
        self.lock().last_assigned
    }

    pub fn len(&self) -> usize {
        self.lock().backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().backlog.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn synced_version(&self, entity_id: &EntityId) -> Option<u64> {
        self.synced.get(entity_id).map(|v| *v)
    }

    /// Wait until something new is queued.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    /// Wake the sender without queuing anything.
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

fn pick_victim(
    backlog: &BTreeMap<u64, StateChangeRecord>,
    incoming: EntityType,
) -> Option<u64> {
    let mut newest: HashMap<&EntityId, u64> = HashMap::new();
    for (seq, r) in backlog {
        newest.insert(&r.entity_id, *seq);
    }
    let superseded = |seq: u64, r: &StateChangeRecord| newest.get(&r.entity_id) != Some(&seq);
    let is_sensor = |r: &StateChangeRecord| r.entity_type == EntityType::Sensor;

    backlog
        .iter()
        .find(|(s, r)| is_sensor(r) && superseded(**s, r))
        .or_else(|| backlog.iter().find(|(_, r)| is_sensor(r)))
        .map(|(s, _)| *s)
        .or_else(|| {
            if incoming == EntityType::Sensor {
                return None;
            }
            backlog
                .iter()
                .find(|(s, r)| superseded(**s, r))
                .or_else(|| backlog.iter().next())
                .map(|(s, _)| *s)
        })
}
