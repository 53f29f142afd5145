// ── Runtime configuration for the sync engine ──
//
// Built by direktive-config from the TOML file; no disk I/O here.

use std::path::PathBuf;
use std::time::Duration;

use direktive_api::{PayloadCipher, ReconnectConfig};
use secrecy::SecretString;
use url::Url;

/// File name of the redb database inside `state_dir`.
pub const STORE_FILE: &str = "bridge.redb";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Cloud sync socket, e.g. `wss://api.direktive.ai/bridge`.
    pub socket_url: Url,
    pub instance_id: String,
    pub api_key: SecretString,
    /// Seals every frame when present.
    pub cipher: Option<PayloadCipher>,
    pub state_dir: PathBuf,
    pub queue_capacity: usize,
    pub batch_size: usize,
    /// Bound on every network call (connect, snapshot reads).
    pub request_timeout: Duration,
    /// Bound on one host action invocation.
    pub action_timeout: Duration,
    pub resume_timeout: Duration,
    /// How long applied command ids are remembered.
    pub dedup_retention: Duration,
    pub reconnect: ReconnectConfig,
}

impl BridgeConfig {
    /// Defaults for everything but identity and endpoint.
    pub fn new(socket_url: Url, instance_id: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            socket_url,
            instance_id: instance_id.into(),
            api_key,
            cipher: None,
            state_dir: PathBuf::from("."),
            queue_capacity: 10_000,
            batch_size: 100,
            request_timeout: Duration::from_secs(15),
            action_timeout: Duration::from_secs(10),
            resume_timeout: Duration::from_secs(20),
            dedup_retention: Duration::from_secs(24 * 60 * 60),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join(STORE_FILE)
    }
}
