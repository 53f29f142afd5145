// ── Reconciliation engine ──
//
// Runs once at the start of every cloud session, before any record is
// streamed:
//
//   resume_request{epoch, last_acked}  ──▶
//                                      ◀──  resume_response{mode, pending_commands}
//
// `resume{acked_through}` advances the cursor and the sender resumes after
// it. `full_resync` (or no baseline yet, or a cloud cursor behind ours)
// drops the backlog and re-emits the current state of every exposed
// entity as fresh records, preceded by an exposed notice for each.
//
// The registry is held exclusively from the snapshot read until the last
// baseline record is queued. A host change that lands meanwhile waits in
// the observer and gets a later seq than the value it supersedes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use direktive_api::{CloudMessage, ResumeMode, WireCommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::convert::command_from_wire;
use crate::error::CoreError;
use crate::host::HostPlatform;
use crate::model::{Capability, CommandMessage, EntityState, Notice};
use crate::outbound::{AckOutcome, OutboundQueue};
use crate::registry::ExposureRegistry;
use crate::store::BridgeStore;

/// The cloud's `resume_response`, as routed by the session receiver.
#[derive(Debug, Clone)]
pub struct ResumeReply {
    pub mode: ResumeMode,
    pub pending_commands: Vec<WireCommand>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub full_resync: bool,
    /// Records at or below this seq need not be sent again.
    pub resume_after: u64,
    pub baseline_records: usize,
    /// Commands the cloud considers unacknowledged; replay through the listener.
    pub pending_commands: Vec<CommandMessage>,
}

pub struct Reconciler {
    registry: Arc<ExposureRegistry>,
    queue: Arc<OutboundQueue>,
    host: Arc<dyn HostPlatform>,
    store: BridgeStore,
    resume_timeout: Duration,
    request_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ExposureRegistry>,
        queue: Arc<OutboundQueue>,
        host: Arc<dyn HostPlatform>,
        store: BridgeStore,
        resume_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            host,
            store,
            resume_timeout,
            request_timeout,
        }
    }

    pub async fn reconcile(
        &self,
        epoch: u64,
        outbound: &mpsc::Sender<CloudMessage>,
        replies: &mut mpsc::Receiver<ResumeReply>,
    ) -> Result<ReconcileReport, CoreError> {
        let last_acked = self.queue.last_acked();
        outbound
            .send(CloudMessage::ResumeRequest {
                connection_epoch: epoch,
                last_acked_seq: last_acked,
            })
            .await
            .map_err(|_| CoreError::Transport {
                message: "session closed before resume request".into(),
            })?;
        debug!(epoch, last_acked, "Resume requested");

        let reply = tokio::time::timeout(self.resume_timeout, replies.recv())
            .await
            .map_err(|_| CoreError::Timeout {
                timeout_secs: self.resume_timeout.as_secs(),
            })?
            .ok_or_else(|| CoreError::Transport {
                message: "session closed before resume response".into(),
            })?;

        let mut full_resync = !self.store.baseline_done()?;
        match reply.mode {
            ResumeMode::FullResync => full_resync = true,
            ResumeMode::Resume { acked_through } if acked_through < last_acked => {
                warn!(acked_through, last_acked, "Cloud cursor is behind ours; resynchronizing");
                full_resync = true;
            }
            ResumeMode::Resume { acked_through } => {
                if self.queue.ack(acked_through)? == AckOutcome::Future {
                    full_resync = true;
                }
            }
        }

        let baseline_records = if full_resync { self.rebaseline().await? } else { 0 };

        let report = ReconcileReport {
            full_resync,
            resume_after: self.queue.last_acked(),
            baseline_records,
            pending_commands: reply
                .pending_commands
                .into_iter()
                .map(command_from_wire)
                .collect(),
        };
        info!(
            epoch,
            full_resync,
            resume_after = report.resume_after,
            baseline_records,
            pending_commands = report.pending_commands.len(),
            "Reconciled with cloud"
        );
        Ok(report)
    }

    /// Replace the backlog with a snapshot of every exposed entity.
    async fn rebaseline(&self) -> Result<usize, CoreError> {
        let snapshot = self.registry.hold().await;
        let dropped = self.queue.clear_backlog()?;
        if dropped > 0 {
            debug!(dropped, "Backlog superseded by full resync");
        }

        let readable: Vec<_> = snapshot
            .iter()
            .filter(|e| e.allows(Capability::StateRead))
            .map(|e| e.entity_id.clone())
            .collect();

        let mut states =
            tokio::time::timeout(self.request_timeout, self.host.current_states(&readable))
                .await
                .map_err(|_| CoreError::Timeout {
                    timeout_secs: self.request_timeout.as_secs(),
                })??;

        for entity in snapshot.iter() {
            self.queue.push_notice(
                Notice::Exposed {
                    entity_id: entity.entity_id.clone(),
                    entity_type: entity.entity_type,
                    capabilities: entity.capabilities.clone(),
                },
                |_| Ok(()),
            )?;
        }

        let now = Utc::now();
        let mut emitted = 0;
        for entity in snapshot.iter().filter(|e| e.allows(Capability::StateRead)) {
            let state = states
                .remove(&entity.entity_id)
                .unwrap_or_else(EntityState::unavailable);
            if self
                .queue
                .enqueue(&entity.entity_id, entity.entity_type, state, now)?
                .is_some()
            {
                emitted += 1;
            }
        }
        drop(snapshot);

        self.store.mark_baseline_done()?;
        Ok(emitted)
    }
}
