//! Exposure list handlers.
//!
//! `expose` and `revoke` edit the declarative `[exposure]` table. A running
//! daemon applies the change on SIGHUP; otherwise on its next start.

use std::collections::BTreeMap;

use direktive_api::HassClient;
use direktive_core::{Capabilities, Capability, CoreError, EntityId, EntityType, ExposedEntity};
use serde::Serialize;
use tabled::Tabled;
use tracing::warn;

use crate::cli::{EntitiesArgs, EntitiesCommand, GlobalOpts};
use crate::commands::{load_config, open_store, storage};
use crate::error::CliError;
use crate::output;

// ── Row types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ExposureView {
    entity_id: String,
    entity_type: Option<EntityType>,
    declared: Vec<Capability>,
    active: Option<Vec<Capability>>,
    last_synced_seq: Option<u64>,
}

#[derive(Tabled)]
struct ExposureRow {
    #[tabled(rename = "ENTITY")]
    entity_id: String,
    #[tabled(rename = "TYPE")]
    entity_type: String,
    #[tabled(rename = "DECLARED")]
    declared: String,
    #[tabled(rename = "ACTIVE")]
    active: String,
    #[tabled(rename = "SYNCED SEQ")]
    synced: String,
}

fn caps_label(caps: &[Capability]) -> String {
    if caps.is_empty() {
        return "-".into();
    }
    caps.iter()
        .map(Capability::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl From<&ExposureView> for ExposureRow {
    fn from(v: &ExposureView) -> Self {
        Self {
            entity_id: v.entity_id.clone(),
            entity_type: v
                .entity_type
                .map_or_else(|| "unsupported".into(), |t| t.to_string()),
            declared: caps_label(&v.declared),
            active: v.active.as_deref().map_or_else(|| "-".into(), caps_label),
            synced: v
                .last_synced_seq
                .map_or_else(|| "-".into(), |s| s.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct AvailableEntity {
    entity_id: String,
    entity_type: Option<EntityType>,
    state: String,
    declared: Vec<Capability>,
}

#[derive(Tabled)]
struct AvailableRow {
    #[tabled(rename = "ENTITY")]
    entity_id: String,
    #[tabled(rename = "TYPE")]
    entity_type: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "EXPOSED")]
    declared: String,
}

impl From<&AvailableEntity> for AvailableRow {
    fn from(e: &AvailableEntity) -> Self {
        Self {
            entity_id: e.entity_id.clone(),
            entity_type: e
                .entity_type
                .map_or_else(|| "unsupported".into(), |t| t.to_string()),
            state: e.state.clone(),
            declared: caps_label(&e.declared),
        }
    }
}

// ── Handler ──────────────────────────────────────────────────────────

pub async fn handle(args: EntitiesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        EntitiesCommand::List => list(global),
        EntitiesCommand::Available { all } => available(global, all).await,
        EntitiesCommand::Expose {
            entity_id,
            capabilities,
        } => {
            let caps: Capabilities = capabilities.into_iter().map(Capability::from).collect();
            expose(global, &entity_id, &caps)
        }
        EntitiesCommand::Revoke { entity_id } => revoke(global, &entity_id),
    }
}

fn list(global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = load_config(global)?;
    let persisted: BTreeMap<EntityId, ExposedEntity> = match open_store(&cfg) {
        Ok(Some(store)) => store
            .load_exposures()
            .map_err(storage)?
            .into_iter()
            .map(|e| (e.entity_id.clone(), e))
            .collect(),
        Ok(None) => BTreeMap::new(),
        Err(CliError::StoreLocked { .. }) => {
            warn!("bridge is running; showing the declared list only");
            BTreeMap::new()
        }
        Err(e) => return Err(e),
    };

    let mut views: BTreeMap<String, ExposureView> = cfg
        .exposure
        .iter()
        .map(|(raw, caps)| {
            let entity_type = EntityId::new(raw.as_str())
                .ok()
                .and_then(|id| EntityType::from_domain(id.domain()));
            let view = ExposureView {
                entity_id: raw.clone(),
                entity_type,
                declared: caps.clone(),
                active: None,
                last_synced_seq: None,
            };
            (raw.clone(), view)
        })
        .collect();

    for (id, exposed) in persisted {
        let view = views
            .entry(id.to_string())
            .or_insert_with(|| ExposureView {
                entity_id: id.to_string(),
                entity_type: Some(exposed.entity_type),
                declared: Vec::new(),
                active: None,
                last_synced_seq: None,
            });
        view.active = Some(exposed.capabilities.iter().collect());
        view.last_synced_seq = exposed.last_synced_state_version;
    }

    let views: Vec<ExposureView> = views.into_values().collect();
    let out = output::render_list(
        global.output,
        &views,
        |v| ExposureRow::from(v),
        |v| v.entity_id.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

async fn available(global: &GlobalOpts, all: bool) -> Result<(), CliError> {
    let cfg = load_config(global)?;
    let client = HassClient::connect(cfg.to_hass_config()?).await?;
    let mut entities: Vec<AvailableEntity> = client
        .get_states()
        .await?
        .into_iter()
        .filter_map(|state| {
            let entity_type = EntityId::new(state.entity_id.as_str())
                .ok()
                .and_then(|id| EntityType::from_domain(id.domain()));
            (all || entity_type.is_some()).then(|| AvailableEntity {
                declared: cfg
                    .exposure
                    .get(&state.entity_id)
                    .cloned()
                    .unwrap_or_default(),
                entity_id: state.entity_id,
                entity_type,
                state: state.state,
            })
        })
        .collect();
    entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

    let out = output::render_list(
        global.output,
        &entities,
        |e| AvailableRow::from(e),
        |e| e.entity_id.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

/// Check what can be checked without Home Assistant: id shape, supported
/// type, and that sensors are not granted command_accept.
fn validate(raw: &str, caps: &Capabilities) -> Result<EntityId, CliError> {
    let entity_id = EntityId::new(raw)?;
    let entity_type =
        EntityType::from_domain(entity_id.domain()).ok_or_else(|| CoreError::UnsupportedType {
            entity_id: raw.to_owned(),
            domain: entity_id.domain().to_owned(),
        })?;
    if caps.contains(Capability::CommandAccept) && !entity_type.accepts_commands() {
        return Err(CoreError::UnsupportedCapability {
            entity_type,
            capability: Capability::CommandAccept,
        }
        .into());
    }
    Ok(entity_id)
}

fn expose(global: &GlobalOpts, raw: &str, caps: &Capabilities) -> Result<(), CliError> {
    let entity_id = validate(raw, caps)?;
    let path = global.config_path();
    let mut cfg = direktive_config::load_config_from(&path)?;
    cfg.set_exposure(&entity_id, caps);
    direktive_config::save_config_to(&cfg, &path)?;

    let caps: Vec<Capability> = caps.iter().collect();
    output::print_output(
        &format!(
            "{entity_id} declared with {}. Send SIGHUP to a running bridge to apply.",
            caps_label(&caps)
        ),
        global.quiet,
    );
    Ok(())
}

fn revoke(global: &GlobalOpts, raw: &str) -> Result<(), CliError> {
    let entity_id = EntityId::new(raw)?;
    let path = global.config_path();
    let mut cfg = direktive_config::load_config_from(&path)?;
    if !cfg.remove_exposure(&entity_id) {
        return Err(CliError::NotFound {
            entity_id: entity_id.to_string(),
        });
    }
    direktive_config::save_config_to(&cfg, &path)?;
    output::print_output(
        &format!("{entity_id} removed. Send SIGHUP to a running bridge to apply."),
        global.quiet,
    );
    Ok(())
}
