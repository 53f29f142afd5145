// ── Entity exposure registry ──
//
// A single versioned read model shared by the observer and the command
// listener. Readers hold the read guard for the whole of their decision
// and the action it authorizes; writers take the write guard, persist the
// change together with its cloud notice in one transaction, then swap in
// a new snapshot. A revoke therefore waits for in-flight decisions and no
// reader ever sees a half-applied change.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::host::HostPlatform;
use crate::model::{Capabilities, Capability, EntityId, ExposedEntity, Notice};
use crate::outbound::OutboundQueue;
use crate::store::BridgeStore;

/// Immutable view of the registry at one version.
#[derive(Debug, Clone, Default)]
pub struct ExposureSnapshot {
    pub version: u64,
    entities: BTreeMap<EntityId, ExposedEntity>,
}

impl ExposureSnapshot {
    pub fn get(&self, entity_id: &EntityId) -> Option<&ExposedEntity> {
        self.entities.get(entity_id)
    }

    /// Look up by raw id. Ids that do not parse are never exposed.
    pub fn get_raw(&self, raw: &str) -> Option<&ExposedEntity> {
        let id = EntityId::new(raw).ok()?;
        self.entities.get(&id)
    }

    pub fn allows(&self, entity_id: &EntityId, cap: Capability) -> bool {
        self.get(entity_id).is_some_and(|e| e.allows(cap))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExposedEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Outcome of reconciling the declared exposure list with the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredDiff {
    pub exposed: Vec<EntityId>,
    pub revoked: Vec<EntityId>,
    pub failed: Vec<(EntityId, String)>,
}

pub struct ExposureRegistry {
    current: RwLock<Arc<ExposureSnapshot>>,
    queue: Arc<OutboundQueue>,
    host: Arc<dyn HostPlatform>,
}

impl std::fmt::Debug for ExposureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposureRegistry").finish_non_exhaustive()
    }
}

impl ExposureRegistry {
    pub fn load(
        store: &BridgeStore,
        queue: Arc<OutboundQueue>,
        host: Arc<dyn HostPlatform>,
    ) -> Result<Self, CoreError> {
        let entities = store
            .load_exposures()?
            .into_iter()
            .map(|e| (e.entity_id.clone(), e))
            .collect();
        let version = store.registry_version()?;
        Ok(Self {
            current: RwLock::new(Arc::new(ExposureSnapshot { version, entities })),
            queue,
            host,
        })
    }

    /// Hold this guard across a decision and the action it authorizes.
    pub async fn read(&self) -> RwLockReadGuard<'_, Arc<ExposureSnapshot>> {
        self.current.read().await
    }

    /// Exclusive hold. Observers and listeners wait until it is dropped.
    pub(crate) async fn hold(&self) -> RwLockWriteGuard<'_, Arc<ExposureSnapshot>> {
        self.current.write().await
    }

    pub async fn snapshot(&self) -> Arc<ExposureSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    pub async fn version(&self) -> u64 {
        self.current.read().await.version
    }

    pub async fn query(&self, entity_id: &EntityId) -> Option<Capabilities> {
        self.current
            .read()
            .await
            .get(entity_id)
            .map(|e| e.capabilities.clone())
    }

    /// Every exposed entity, with its latest acknowledged version.
    pub async fn list(&self) -> Vec<ExposedEntity> {
        let snapshot = self.snapshot().await;
        snapshot
            .iter()
            .map(|e| ExposedEntity {
                last_synced_state_version: self
                    .queue
                    .synced_version(&e.entity_id)
                    .or(e.last_synced_state_version),
                ..e.clone()
            })
            .collect()
    }

    /// Expose `entity_id` with `capabilities`, replacing any previous grant.
    ///
    /// An empty capability set is a revoke.
    pub async fn expose(
        &self,
        entity_id: &EntityId,
        capabilities: Capabilities,
    ) -> Result<Option<ExposedEntity>, CoreError> {
        if capabilities.is_empty() {
            self.revoke(entity_id).await?;
            return Ok(None);
        }

        let host_entity = self
            .host
            .lookup_entity(entity_id)
            .await?
            .ok_or_else(|| CoreError::UnknownEntity {
                entity_id: entity_id.to_string(),
            })?;
        let entity_type = host_entity
            .entity_type()
            .ok_or_else(|| CoreError::UnsupportedType {
                entity_id: entity_id.to_string(),
                domain: host_entity.domain.clone(),
            })?;
        if capabilities.contains(Capability::CommandAccept) && !entity_type.accepts_commands() {
            return Err(CoreError::UnsupportedCapability {
                entity_type,
                capability: Capability::CommandAccept,
            });
        }

        let mut current = self.current.write().await;
        let previous = current.get(entity_id).cloned();
        if previous
            .as_ref()
            .is_some_and(|p| p.capabilities == capabilities && p.entity_type == entity_type)
        {
            return Ok(previous);
        }

        let version = current.version + 1;
        let entity = ExposedEntity {
            entity_id: entity_id.clone(),
            entity_type,
            capabilities: capabilities.clone(),
            last_synced_state_version: previous.and_then(|p| p.last_synced_state_version),
        };
        let notice = Notice::Exposed {
            entity_id: entity_id.clone(),
            entity_type,
            capabilities: capabilities.clone(),
        };

        let write_row =
            |txn: &redb::WriteTransaction| BridgeStore::put_exposure_txn(txn, &entity, version);
        if capabilities.contains(Capability::StateRead) {
            self.queue.push_notice(notice, write_row)?;
        } else {
            // Losing state_read drops any record still waiting for an ack.
            let purged = self.queue.purge_entity(entity_id, notice, write_row)?;
            if purged > 0 {
                debug!(
                    entity_id = %entity_id,
                    purged,
                    "Purged records after state_read was withdrawn"
                );
            }
        }

        let mut next = (**current).clone();
        next.version = version;
        next.entities.insert(entity_id.clone(), entity.clone());
        *current = Arc::new(next);

        info!(entity_id = %entity_id, capabilities = %capabilities, version, "Entity exposed");
        Ok(Some(entity))
    }

    /// Revoke an exposure. Returns `false` if the entity was not exposed.
    ///
    /// Pending records for the entity are purged and an unexposed notice
    /// is queued in the same transaction that removes the row.
    pub async fn revoke(&self, entity_id: &EntityId) -> Result<bool, CoreError> {
        let mut current = self.current.write().await;
        if current.get(entity_id).is_none() {
            return Ok(false);
        }

        let version = current.version + 1;
        let notice = Notice::Unexposed {
            entity_id: entity_id.clone(),
        };
        let purged = self.queue.purge_entity(entity_id, notice, |txn| {
            BridgeStore::remove_exposure_txn(txn, entity_id, version)
        })?;

        let mut next = (**current).clone();
        next.version = version;
        next.entities.remove(entity_id);
        *current = Arc::new(next);

        info!(entity_id = %entity_id, purged, version, "Entity revoked");
        Ok(true)
    }

    /// Make the registry match a declared exposure list.
    ///
    /// Entities missing from `declared` are revoked; new or changed entries
    /// are exposed. Per-entity failures are collected, not fatal.
    pub async fn apply_declared(
        &self,
        declared: &BTreeMap<EntityId, Capabilities>,
    ) -> Result<DeclaredDiff, CoreError> {
        let mut diff = DeclaredDiff::default();
        let snapshot = self.snapshot().await;

        for entity in snapshot.iter() {
            if !declared.contains_key(&entity.entity_id) && self.revoke(&entity.entity_id).await? {
                diff.revoked.push(entity.entity_id.clone());
            }
        }

        for (entity_id, capabilities) in declared {
            if snapshot
                .get(entity_id)
                .is_some_and(|e| &e.capabilities == capabilities)
            {
                continue;
            }
            match self.expose(entity_id, capabilities.clone()).await {
                Ok(Some(_)) => diff.exposed.push(entity_id.clone()),
                Ok(None) => diff.revoked.push(entity_id.clone()),
                Err(e @ CoreError::Storage(_)) => return Err(e),
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "Declared exposure rejected");
                    diff.failed.push((entity_id.clone(), e.to_string()));
                }
            }
        }

        Ok(diff)
    }
}
