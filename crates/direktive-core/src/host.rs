// ── Host platform boundary ──
//
// The sync engine only talks to the smart-home platform through
// `HostPlatform`. `HassHost` implements it over the Home Assistant
// WebSocket API; tests supply an in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktive_api::hass::{HassClient, HassInstanceConfig, HassState};
use tokio::sync::mpsc;

use crate::error::CoreError;
use crate::model::{EntityId, EntityState, HostEntity, ServiceCall};

/// A state change as delivered by the host, before any exposure filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct HostStateEvent {
    pub entity_id: String,
    /// `None` when the entity was removed from the host.
    pub new_state: Option<EntityState>,
    pub timestamp: DateTime<Utc>,
}

/// An explicit registration against the host's state-change bus.
///
/// Dropping it ends the registration.
#[derive(Debug)]
pub struct StateSubscription {
    rx: mpsc::UnboundedReceiver<HostStateEvent>,
}

impl StateSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<HostStateEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the host side has gone away.
    pub async fn recv(&mut self) -> Option<HostStateEvent> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait HostPlatform: Send + Sync + 'static {
    /// Registry lookup used at exposure time.
    async fn lookup_entity(&self, entity_id: &EntityId) -> Result<Option<HostEntity>, CoreError>;

    async fn current_state(&self, entity_id: &EntityId) -> Result<Option<EntityState>, CoreError>;

    /// Current states of several entities. Missing entities are absent
    /// from the map.
    async fn current_states(
        &self,
        entity_ids: &[EntityId],
    ) -> Result<HashMap<EntityId, EntityState>, CoreError> {
        let mut out = HashMap::with_capacity(entity_ids.len());
        for id in entity_ids {
            if let Some(state) = self.current_state(id).await? {
                out.insert(id.clone(), state);
            }
        }
        Ok(out)
    }

    /// Invoke an entity action and wait for the host to report the outcome.
    async fn call_service(&self, call: ServiceCall) -> Result<(), CoreError>;

    async fn subscribe_state_changes(&self) -> Result<StateSubscription, CoreError>;
}

// ── Home Assistant ───────────────────────────────────────────────────

/// [`HostPlatform`] over a live Home Assistant connection.
#[derive(Debug, Clone)]
pub struct HassHost {
    client: HassClient,
}

impl HassHost {
    pub fn new(client: HassClient) -> Self {
        Self { client }
    }

    /// Location details reported during instance registration.
    pub async fn instance_config(&self) -> Result<HassInstanceConfig, CoreError> {
        Ok(self.client.get_config().await?)
    }
}

fn to_host_entity(state: &HassState) -> Option<HostEntity> {
    let entity_id = EntityId::new(state.entity_id.as_str()).ok()?;
    Some(HostEntity {
        domain: entity_id.domain().to_owned(),
        device_class: state
            .attributes
            .get("device_class")
            .and_then(|v| v.as_str())
            .map(str::to_owned),
        entity_id,
    })
}

pub(crate) fn to_entity_state(state: &HassState) -> EntityState {
    EntityState::filtered(state.state.as_str(), &state.attributes)
}

#[async_trait]
impl HostPlatform for HassHost {
    async fn lookup_entity(&self, entity_id: &EntityId) -> Result<Option<HostEntity>, CoreError> {
        let states = self.client.get_states().await?;
        Ok(states
            .iter()
            .find(|s| s.entity_id == entity_id.as_str())
            .and_then(to_host_entity))
    }

    async fn current_state(&self, entity_id: &EntityId) -> Result<Option<EntityState>, CoreError> {
        let states = self.client.get_states().await?;
        Ok(states
            .iter()
            .find(|s| s.entity_id == entity_id.as_str())
            .map(to_entity_state))
    }

    async fn current_states(
        &self,
        entity_ids: &[EntityId],
    ) -> Result<HashMap<EntityId, EntityState>, CoreError> {
        let states = self.client.get_states().await?;
        let by_id: HashMap<&str, &HassState> =
            states.iter().map(|s| (s.entity_id.as_str(), s)).collect();
        Ok(entity_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|s| (id.clone(), to_entity_state(s))))
            .collect())
    }

    async fn call_service(&self, call: ServiceCall) -> Result<(), CoreError> {
        self.client
            .call_service(&call.domain, &call.service, call.entity_id.as_str(), call.data)
            .await
            .map_err(CoreError::from)
    }

    async fn subscribe_state_changes(&self) -> Result<StateSubscription, CoreError> {
        let mut events = self.client.subscribe_state_changes().await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let forwarded = HostStateEvent {
                    new_state: event.new_state.as_ref().map(to_entity_state),
                    entity_id: event.entity_id,
                    timestamp: event.time_fired,
                };
                if tx.send(forwarded).is_err() {
                    break;
                }
            }
        });

        Ok(StateSubscription::new(rx))
    }
}
