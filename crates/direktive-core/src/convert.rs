// ── Wire ↔ domain conversion and action translation ──

use direktive_api::protocol::{CloudMessage, WireCommand, WireCommandResult, WireStateRecord};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::model::{
    Action, CommandMessage, CommandOutcome, CommandResult, EntityType, ExposedEntity, Notice,
    ServiceCall, StateChangeRecord,
};

// ── Records, notices, results ───────────────────────────────────────

pub fn record_to_wire(record: &StateChangeRecord) -> WireStateRecord {
    WireStateRecord {
        seq: record.seq,
        entity_id: record.entity_id.to_string(),
        entity_type: record.entity_type.to_string(),
        state: record.new_state.state.clone(),
        attributes: record.new_state.attributes.clone(),
        timestamp: record.timestamp,
    }
}

pub fn notice_to_wire(notice: &Notice) -> CloudMessage {
    match notice {
        Notice::Exposed {
            entity_id,
            entity_type,
            capabilities,
        } => CloudMessage::EntityExposed {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        },
        Notice::Unexposed { entity_id } => CloudMessage::EntityUnexposed {
            entity_id: entity_id.to_string(),
        },
    }
}

pub fn command_from_wire(wire: WireCommand) -> CommandMessage {
    CommandMessage {
        command_id: wire.command_id,
        entity_id: wire.entity_id,
        action: wire.action,
        parameters: wire.parameters,
        issued_at: wire.issued_at,
    }
}

pub fn result_to_wire(result: &CommandResult) -> WireCommandResult {
    match &result.outcome {
        CommandOutcome::Success => WireCommandResult {
            command_id: result.command_id.clone(),
            success: true,
            error_kind: None,
            error_detail: None,
        },
        CommandOutcome::Failure { kind, detail } => WireCommandResult {
            command_id: result.command_id.clone(),
            success: false,
            error_kind: Some(kind.to_string()),
            error_detail: Some(detail.clone()),
        },
    }
}

// ── Action translation ──────────────────────────────────────────────

const LIGHT_ON_PARAMS: &[&str] = &[
    "brightness",
    "color_temp",
    "rgb_color",
    "xy_color",
    "transition",
];
const LIGHT_OFF_PARAMS: &[&str] = &["transition"];

/// Translate a command into the host action call for `entity`.
pub fn translate(
    entity: &ExposedEntity,
    command: &CommandMessage,
) -> Result<ServiceCall, CoreError> {
    let action: Action = command.action.parse().map_err(|_| CoreError::InvalidCommand {
        message: format!("unknown action '{}'", command.action),
    })?;
    let params = &command.parameters;
    let domain = entity.entity_id.domain().to_owned();

    let (service, data) = match (entity.entity_type, action) {
        (EntityType::Light, Action::TurnOn) => {
            allow_only(params, LIGHT_ON_PARAMS, action)?;
            validate_light_params(params)?;
            ("turn_on", params.clone())
        }
        (EntityType::Light, Action::TurnOff | Action::Toggle) => {
            allow_only(params, LIGHT_OFF_PARAMS, action)?;
            validate_light_params(params)?;
            (light_or_switch_service(action), params.clone())
        }
        (EntityType::Switch, Action::TurnOn | Action::TurnOff | Action::Toggle) => {
            allow_only(params, &[], action)?;
            (light_or_switch_service(action), Map::new())
        }
        (EntityType::Shutter, Action::Open | Action::Close | Action::Stop) => {
            allow_only(params, &[], action)?;
            let service = match action {
                Action::Open => "open_cover",
                Action::Close => "close_cover",
                _ => "stop_cover",
            };
            (service, Map::new())
        }
        (EntityType::Shutter, Action::SetPosition) => {
            allow_only(params, &["position"], action)?;
            let position = params
                .get("position")
                .and_then(Value::as_u64)
                .filter(|p| *p <= 100)
                .ok_or_else(|| CoreError::InvalidCommand {
                    message: "set_position requires an integer 'position' between 0 and 100".into(),
                })?;
            let mut data = Map::new();
            data.insert("position".into(), Value::from(position));
            ("set_cover_position", data)
        }
        (EntityType::Sensor, _) => {
            return Err(CoreError::InvalidCommand {
                message: format!("sensor {} does not accept commands", entity.entity_id),
            });
        }
        (ty, action) => {
            return Err(CoreError::InvalidCommand {
                message: format!("action '{action}' is not supported for {ty} entities"),
            });
        }
    };

    Ok(ServiceCall {
        domain,
        service: service.to_owned(),
        entity_id: entity.entity_id.clone(),
        data,
    })
}

fn light_or_switch_service(action: Action) -> &'static str {
    match action {
        Action::TurnOn => "turn_on",
        Action::TurnOff => "turn_off",
        _ => "toggle",
    }
}

fn allow_only(
    params: &Map<String, Value>,
    allowed: &[&str],
    action: Action,
) -> Result<(), CoreError> {
    match params.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(CoreError::InvalidCommand {
            message: format!("parameter '{key}' is not valid for '{action}'"),
        }),
        None => Ok(()),
    }
}

fn validate_light_params(params: &Map<String, Value>) -> Result<(), CoreError> {
    let invalid = |name: &str, expected: &str| CoreError::InvalidCommand {
        message: format!("parameter '{name}' must be {expected}"),
    };

    if let Some(v) = params.get("brightness") {
        v.as_u64()
            .filter(|b| *b <= 255)
            .ok_or_else(|| invalid("brightness", "an integer between 0 and 255"))?;
    }
    if let Some(v) = params.get("color_temp") {
        v.as_u64()
            .ok_or_else(|| invalid("color_temp", "a positive integer (mireds)"))?;
    }
    if let Some(v) = params.get("rgb_color") {
        let ok = v.as_array().is_some_and(|a| {
            a.len() == 3 && a.iter().all(|c| c.as_u64().is_some_and(|c| c <= 255))
        });
        if !ok {
            return Err(invalid("rgb_color", "three integers between 0 and 255"));
        }
    }
    if let Some(v) = params.get("xy_color") {
        let unit = |c: &Value| c.as_f64().is_some_and(|c| (0.0..=1.0).contains(&c));
        let ok = v
            .as_array()
            .is_some_and(|a| a.len() == 2 && a.iter().all(unit));
        if !ok {
            return Err(invalid("xy_color", "two numbers between 0 and 1"));
        }
    }
    if let Some(v) = params.get("transition") {
        v.as_f64()
            .filter(|t| *t >= 0.0)
            .ok_or_else(|| invalid("transition", "a non-negative number of seconds"))?;
    }
    Ok(())
}
