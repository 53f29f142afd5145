//! Configuration for the Direktive.ai bridge.
//!
//! A single TOML file, layered with figment (defaults, then the file, then
//! `DIREKTIVE_*` environment variables), secret resolution (env, keyring,
//! plaintext), and translation into the runtime configs of
//! `direktive_core` and `direktive_api`.

mod secrets;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use direktive_api::hass::HassConnectConfig;
use direktive_api::{PayloadCipher, ReconnectConfig, TlsMode, TransportConfig};
use direktive_core::{BridgeConfig, Capabilities, Capability, EntityId};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use secrets::{SecretKind, delete_secret, resolve_secret, store_secret};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error(
        "no {what} configured (set {env}, store it in the keyring, or add it to the config file)"
    )]
    MissingSecret { what: &'static str, env: String },

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cloud: CloudSection,

    #[serde(default)]
    pub home_assistant: HomeAssistantSection,

    #[serde(default)]
    pub sync: SyncSection,

    /// Declared exposure list: entity id to granted capabilities.
    #[serde(default)]
    pub exposure: BTreeMap<String, Vec<Capability>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CloudSection {
    /// REST base URL. The sync socket is `<api_url>/bridge`.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Stable identity of this installation, generated by `config init`.
    pub instance_id: Option<String>,

    /// API key (plaintext; prefer the keyring or an env var).
    pub api_key: Option<String>,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Option<String>,

    /// Base64 32-byte payload key. Frames are sealed when set.
    pub encryption_key: Option<String>,

    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: Option<String>,

    /// Custom CA certificate for the cloud endpoint.
    pub ca_cert: Option<PathBuf>,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            instance_id: None,
            api_key: None,
            api_key_env: default_api_key_env(),
            encryption_key: None,
            encryption_key_env: default_encryption_key_env(),
            ca_cert: None,
        }
    }
}

fn default_api_url() -> String {
    "https://api.direktive.ai".into()
}
#[allow(clippy::unnecessary_wraps)]
fn default_api_key_env() -> Option<String> {
    Some("DIREKTIVE_API_KEY".into())
}
#[allow(clippy::unnecessary_wraps)]
fn default_encryption_key_env() -> Option<String> {
    Some("DIREKTIVE_ENCRYPTION_KEY".into())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HomeAssistantSection {
    #[serde(default = "default_hass_url")]
    pub base_url: String,

    /// Long-lived access token (plaintext; prefer the keyring or an env var).
    pub token: Option<String>,

    #[serde(default = "default_token_env")]
    pub token_env: Option<String>,
}

impl Default for HomeAssistantSection {
    fn default() -> Self {
        Self {
            base_url: default_hass_url(),
            token: None,
            token_env: default_token_env(),
        }
    }
}

fn default_hass_url() -> String {
    "http://homeassistant.local:8123".into()
}
#[allow(clippy::unnecessary_wraps)]
fn default_token_env() -> Option<String> {
    Some("HASS_TOKEN".into())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSection {
    /// Where `bridge.redb` lives. Defaults to the platform data dir.
    pub state_dir: Option<PathBuf>,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
    pub action_timeout_secs: u64,
    /// How long applied command ids are remembered.
    pub dedup_retention_secs: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub resume_timeout_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            state_dir: None,
            queue_capacity: 10_000,
            batch_size: 100,
            request_timeout_secs: 15,
            action_timeout_secs: 10,
            dedup_retention_secs: 86_400,
            initial_backoff_ms: 1_000,
            max_backoff_secs: 60,
            resume_timeout_secs: 20,
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("ai", "direktive", "direktive")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".config").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default location of the bridge state database.
pub fn default_state_dir() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".local/share"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

fn home_fallback(sub: &str) -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(sub);
    p.push("direktive");
    p
}

// ── Loading & saving ────────────────────────────────────────────────

/// Load from `path` (missing file is fine) and the environment.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DIREKTIVE_").split("__"))
        .extract()?;
    Ok(config)
}

pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

// ── Accessors & editing ─────────────────────────────────────────────

impl Config {
    /// Fresh config with a newly generated instance id.
    pub fn init() -> Self {
        let mut cfg = Self::default();
        cfg.cloud.instance_id = Some(uuid::Uuid::new_v4().to_string());
        cfg
    }

    pub fn instance_id(&self) -> Result<&str, ConfigError> {
        self.cloud
            .instance_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| invalid("cloud.instance_id", "not set; run `direktive config init`"))
    }

    pub fn api_url(&self) -> Result<Url, ConfigError> {
        parse_http_url("cloud.api_url", &self.cloud.api_url)
    }

    pub fn hass_url(&self) -> Result<Url, ConfigError> {
        parse_http_url("home_assistant.base_url", &self.home_assistant.base_url)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.sync.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    /// The declared exposure list, validated.
    pub fn exposure_map(&self) -> Result<BTreeMap<EntityId, Capabilities>, ConfigError> {
        self.exposure
            .iter()
            .map(|(raw, caps)| {
                let id = EntityId::new(raw.as_str())
                    .map_err(|e| invalid(&format!("exposure.\"{raw}\""), e.to_string()))?;
                Ok((id, caps.iter().copied().collect()))
            })
            .collect()
    }

    /// Set (or, with no capabilities, remove) one declared exposure.
    pub fn set_exposure(&mut self, entity_id: &EntityId, capabilities: &Capabilities) {
        if capabilities.is_empty() {
            self.exposure.remove(entity_id.as_str());
        } else {
            self.exposure
                .insert(entity_id.to_string(), capabilities.iter().collect());
        }
    }

    pub fn remove_exposure(&mut self, entity_id: &EntityId) -> bool {
        self.exposure.remove(entity_id.as_str()).is_some()
    }

    /// Transport settings for the cloud REST client.
    pub fn cloud_transport(&self) -> TransportConfig {
        TransportConfig {
            tls: self
                .cloud
                .ca_cert
                .clone()
                .map_or(TlsMode::System, TlsMode::CustomCa),
            timeout: Duration::from_secs(self.sync.request_timeout_secs),
        }
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.sync.initial_backoff_ms),
            max_delay: Duration::from_secs(self.sync.max_backoff_secs),
            max_retries: None,
        }
    }

    /// Runtime config for the sync engine. Resolves the API key and the
    /// optional payload key.
    pub fn to_bridge_config(&self) -> Result<BridgeConfig, ConfigError> {
        let socket_url = direktive_api::session::bridge_socket_url(&self.api_url()?)
            .map_err(|e| invalid("cloud.api_url", e.to_string()))?;
        let api_key = resolve_secret(self, SecretKind::ApiKey)?;
        let cipher = match secrets::resolve_optional(self, SecretKind::EncryptionKey)? {
            Some(key) => Some(
                PayloadCipher::from_base64(&key)
                    .map_err(|e| invalid("cloud.encryption_key", e.to_string()))?,
            ),
            None => None,
        };

        if self.sync.queue_capacity == 0 {
            return Err(invalid("sync.queue_capacity", "must be at least 1"));
        }
        if self.sync.batch_size == 0 {
            return Err(invalid("sync.batch_size", "must be at least 1"));
        }

        let mut config = BridgeConfig::new(socket_url, self.instance_id()?, api_key);
        config.cipher = cipher;
        config.state_dir = self.state_dir();
        config.queue_capacity = self.sync.queue_capacity;
        config.batch_size = self.sync.batch_size;
        config.request_timeout = Duration::from_secs(self.sync.request_timeout_secs);
        config.action_timeout = Duration::from_secs(self.sync.action_timeout_secs);
        config.resume_timeout = Duration::from_secs(self.sync.resume_timeout_secs);
        config.dedup_retention = Duration::from_secs(self.sync.dedup_retention_secs);
        config.reconnect = self.reconnect();
        Ok(config)
    }

    /// Connection settings for the Home Assistant WebSocket API.
    pub fn to_hass_config(&self) -> Result<HassConnectConfig, ConfigError> {
        Ok(HassConnectConfig {
            base_url: self.hass_url()?,
            token: resolve_secret(self, SecretKind::HassToken)?,
            request_timeout: Duration::from_secs(self.sync.request_timeout_secs),
            reconnect: self.reconnect(),
        })
    }
}

fn parse_http_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| invalid(field, format!("'{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(field, format!("expected http or https, got '{other}'"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = Config::init();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
        assert!(cfg.instance_id().is_ok());
    }

    #[test]
    fn file_and_env_layers() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [cloud]
                instance_id = "abc"

                [sync]
                batch_size = 25

                [exposure]
                "light.kitchen" = ["state_read", "command_accept"]
                "sensor.outdoor_temperature" = ["state_read"]
                "#,
            )?;
            jail.set_env("DIREKTIVE_SYNC__QUEUE_CAPACITY", "42");

            let cfg = load_config_from(Path::new("config.toml")).unwrap();
            assert_eq!(cfg.cloud.instance_id.as_deref(), Some("abc"));
            assert_eq!(cfg.sync.batch_size, 25);
            assert_eq!(cfg.sync.queue_capacity, 42);
            assert_eq!(cfg.sync.action_timeout_secs, 10);

            let exposure = cfg.exposure_map().unwrap();
            let kitchen = EntityId::new("light.kitchen").unwrap();
            assert_eq!(exposure[&kitchen], Capabilities::all());
            assert_eq!(exposure.len(), 2);
            Ok(())
        });
    }

    #[test]
    fn missing_file_gives_defaults() {
        figment::Jail::expect_with(|_| {
            let cfg = load_config_from(Path::new("nope.toml")).unwrap();
            assert_eq!(cfg.cloud.api_url, "https://api.direktive.ai");
            assert!(cfg.instance_id().is_err());
            Ok(())
        });
    }

    #[test]
    fn invalid_exposure_ids_are_reported() {
        let mut cfg = Config::default();
        cfg.exposure
            .insert("Kitchen Light".into(), vec![Capability::StateRead]);
        let err = cfg.exposure_map().unwrap_err();
        assert!(err.to_string().contains("Kitchen Light"));
    }

    #[test]
    fn exposure_editing() {
        let mut cfg = Config::default();
        let id = EntityId::new("switch.fan").unwrap();
        cfg.set_exposure(&id, &Capabilities::all());
        assert_eq!(
            cfg.exposure["switch.fan"],
            vec![Capability::StateRead, Capability::CommandAccept]
        );
        cfg.set_exposure(&id, &Capabilities::default());
        assert!(cfg.exposure.is_empty());
        assert!(!cfg.remove_exposure(&id));
    }

    #[test]
    fn bridge_config_from_plaintext_secrets() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let mut cfg = Config::init();
            cfg.cloud.api_key_env = None;
            cfg.cloud.encryption_key_env = None;
            cfg.cloud.api_key = Some("plain-key".into());
            cfg.cloud.encryption_key = Some(direktive_api::crypto::generate_key());
            cfg.sync.state_dir = Some(PathBuf::from("/var/lib/direktive"));
            cfg.sync.batch_size = 7;

            let bridge = cfg.to_bridge_config().unwrap();
            assert_eq!(bridge.socket_url.as_str(), "wss://api.direktive.ai/bridge");
            assert!(bridge.cipher.is_some());
            assert_eq!(bridge.batch_size, 7);
            assert_eq!(bridge.store_path(), PathBuf::from("/var/lib/direktive/bridge.redb"));
            Ok(())
        });
    }

    #[test]
    fn env_secret_wins_over_plaintext() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TEST_DIREKTIVE_TOKEN", "from-env");
            let mut cfg = Config::default();
            cfg.home_assistant.token_env = Some("TEST_DIREKTIVE_TOKEN".into());
            cfg.home_assistant.token = Some("from-file".into());

            let hass = cfg.to_hass_config().unwrap();
            use secrecy::ExposeSecret;
            assert_eq!(hass.token.expose_secret(), "from-env");
            assert_eq!(hass.base_url.as_str(), "http://homeassistant.local:8123/");
            Ok(())
        });
    }

    #[test]
    fn rejects_bad_urls_and_sizes() {
        let mut cfg = Config::init();
        cfg.cloud.api_url = "ftp://example.com".into();
        assert!(matches!(cfg.api_url(), Err(ConfigError::Validation { .. })));

        let mut cfg = Config::init();
        cfg.cloud.api_key = Some("k".into());
        cfg.cloud.api_key_env = None;
        cfg.sync.batch_size = 0;
        assert!(cfg.to_bridge_config().is_err());
    }
}
