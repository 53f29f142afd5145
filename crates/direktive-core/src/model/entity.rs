// ── Entity identity, exposure and state ──

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

// ── EntityId ────────────────────────────────────────────────────────

/// Home Assistant entity id, `<domain>.<object_id>`.
///
/// Validated on construction so every id in the registry has a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        let valid = raw.split_once('.').is_some_and(|(domain, object)| {
            !domain.is_empty()
                && !object.is_empty()
                && !object.contains('.')
                && raw
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
        });
        if valid {
            Ok(Self(raw))
        } else {
            Err(CoreError::InvalidEntityId { value: raw })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the dot (`light` for `light.kitchen`).
    pub fn domain(&self) -> &str {
        self.0.split_once('.').map_or("", |(domain, _)| domain)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntityId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

// ── EntityType ──────────────────────────────────────────────────────

/// Entity kinds the bridge will expose.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Light,
    Shutter,
    Sensor,
    Switch,
}

impl EntityType {
    /// Map a Home Assistant domain onto a supported type.
    pub fn from_domain(domain: &str) -> Option<Self> {
        match domain {
            "light" => Some(Self::Light),
            "cover" => Some(Self::Shutter),
            "sensor" | "binary_sensor" => Some(Self::Sensor),
            "switch" | "input_boolean" => Some(Self::Switch),
            _ => None,
        }
    }

    /// Sensors only report; everything else takes commands.
    pub fn accepts_commands(self) -> bool {
        !matches!(self, Self::Sensor)
    }
}

// ── Capabilities ────────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    StateRead,
    CommandAccept,
}

/// Set of granted capabilities. Empty means "expose nothing".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    pub fn all() -> Self {
        Self::new([Capability::StateRead, Capability::CommandAccept])
    }

    pub fn read_only() -> Self {
        Self::new([Capability::StateRead])
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(AsRef::as_ref).collect();
        f.write_str(&names.join(","))
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self::new(iter)
    }
}

// ── ExposedEntity ───────────────────────────────────────────────────

/// One row of the exposure registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedEntity {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub capabilities: Capabilities,
    /// Sequence number of the newest record for this entity the cloud has
    /// acknowledged. `None` until the first ack.
    #[serde(default)]
    pub last_synced_state_version: Option<u64>,
}

impl ExposedEntity {
    pub fn allows(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }
}

// ── Host-side views ─────────────────────────────────────────────────

/// What the host platform knows about an entity at exposure time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntity {
    pub entity_id: EntityId,
    pub domain: String,
    pub device_class: Option<String>,
}

impl HostEntity {
    pub fn entity_type(&self) -> Option<EntityType> {
        EntityType::from_domain(&self.domain)
    }
}

/// Attributes forwarded to the cloud. Everything else is stripped.
pub const FORWARDED_ATTRIBUTES: &[&str] = &[
    "brightness",
    "color_temp",
    "rgb_color",
    "xy_color",
    "current_position",
    "current_temperature",
    "temperature",
    "hvac_mode",
    "preset_mode",
    "unit_of_measurement",
    "device_class",
];

/// A normalized entity state: the primary value plus allow-listed attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    /// Build a state, keeping only forwarded attributes.
    pub fn filtered(state: impl Into<String>, attributes: &Map<String, Value>) -> Self {
        let attributes = attributes
            .iter()
            .filter(|(k, _)| FORWARDED_ATTRIBUTES.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            state: state.into(),
            attributes,
        }
    }

    /// State reported for an entity the host no longer has.
    pub fn unavailable() -> Self {
        Self {
            state: "unavailable".into(),
            attributes: Map::new(),
        }
    }
}
