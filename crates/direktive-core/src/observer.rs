// ── State change observer ──
//
// Consumes the host's state-change stream and turns events for entities
// exposed with state_read into outbound records. Everything else is
// dropped silently; the read guard is held from the exposure check until
// the record is persisted, so a concurrent revoke either lands before the
// check or waits for the enqueue (and then purges it).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::CoreError;
use crate::host::{HostStateEvent, StateSubscription};
use crate::model::{Capability, EntityState};
use crate::outbound::OutboundQueue;
use crate::registry::ExposureRegistry;

pub struct StateObserver {
    registry: Arc<ExposureRegistry>,
    queue: Arc<OutboundQueue>,
}

impl StateObserver {
    pub fn new(registry: Arc<ExposureRegistry>, queue: Arc<OutboundQueue>) -> Self {
        Self { registry, queue }
    }

    /// Handle one host event. Returns the assigned seq when a record was queued.
    pub async fn observe(&self, event: HostStateEvent) -> Result<Option<u64>, CoreError> {
        let snapshot = self.registry.read().await;
        let Some(entity) = snapshot.get_raw(&event.entity_id) else {
            return Ok(None);
        };
        if !entity.allows(Capability::StateRead) {
            return Ok(None);
        }

        let new_state = event.new_state.unwrap_or_else(EntityState::unavailable);
        let seq = self
            .queue
            .enqueue(&entity.entity_id, entity.entity_type, new_state, event.timestamp)?;
        drop(snapshot);
        Ok(seq)
    }

    /// Consume `subscription` until it ends or `cancel` fires.
    pub async fn run(self, mut subscription: StateSubscription, cancel: CancellationToken) {
        info!("State observer started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = subscription.recv() => {
                    let Some(event) = event else {
                        debug!("Host state stream ended");
                        break;
                    };
                    if let Err(e) = self.observe(event).await {
                        error!(error = %e, "Failed to queue state change");
                    }
                }
            }
        }
        info!("State observer stopped");
    }
}
