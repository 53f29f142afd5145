#![allow(clippy::unwrap_used, dead_code)]

// In-memory host platform and cloud for driving the bridge end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use direktive_api::protocol::{WireCommand, WireCommandResult, WireStateRecord};
use direktive_api::{CloudEndpoint, CloudMessage, CloudSession, ReconnectConfig, ResumeMode};
use direktive_core::host::{HostPlatform, HostStateEvent, StateSubscription};
use direktive_core::{
    Bridge, BridgeConfig, BridgeStore, CloudConnector, CoreError, EntityId, EntityState,
    HostEntity, ServiceCall, SyncStatus,
};
use secrecy::SecretString;
use tokio::sync::mpsc;
use url::Url;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn id(raw: &str) -> EntityId {
    EntityId::new(raw).unwrap()
}

// ── Host ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct HostInner {
    states: HashMap<EntityId, EntityState>,
    subscribers: Vec<mpsc::UnboundedSender<HostStateEvent>>,
    calls: Vec<(ServiceCall, Instant)>,
    failure: Option<String>,
    delay: Option<Duration>,
    /// Applied right after the next state read, which still sees the old value.
    change_after_read: Option<(String, String)>,
}

#[derive(Default)]
pub struct MemoryHost {
    inner: Mutex<HostInner>,
}

impl MemoryHost {
    pub fn with_entities(ids: &[&str]) -> Arc<Self> {
        let host = Arc::new(Self::default());
        for raw in ids {
            host.add(raw, "off");
        }
        host
    }

    pub fn add(&self, raw: &str, state: &str) {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(id(raw), EntityState::filtered(state, &serde_json::Map::new()));
    }

    /// Change an entity's state and notify subscribers, like a local automation would.
    pub fn set_state(&self, raw: &str, state: &str) {
        let new_state = EntityState::filtered(state, &serde_json::Map::new());
        let mut inner = self.inner.lock().unwrap();
        inner.states.insert(id(raw), new_state.clone());
        emit(&mut inner, raw, Some(new_state));
    }

    pub fn remove(&self, raw: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.states.remove(&id(raw));
        emit(&mut inner, raw, None);
    }

    pub fn state_of(&self, raw: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .states
            .get(&id(raw))
            .map(|s| s.state.clone())
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// When each host action finished.
    pub fn call_times(&self) -> Vec<Instant> {
        self.inner.lock().unwrap().calls.iter().map(|(_, t)| *t).collect()
    }

    pub fn fail_calls(&self, message: &str) {
        self.inner.lock().unwrap().failure = Some(message.to_owned());
    }

    pub fn delay_calls(&self, delay: Duration) {
        self.inner.lock().unwrap().delay = Some(delay);
    }

    /// Let the next state read return the current value, then change `raw`
    /// before the reader gets its answer.
    pub fn change_after_next_read(&self, raw: &str, state: &str) {
        self.inner.lock().unwrap().change_after_read = Some((raw.to_owned(), state.to_owned()));
    }
}

fn emit(inner: &mut HostInner, raw: &str, new_state: Option<EntityState>) {
    let event = HostStateEvent {
        entity_id: raw.to_owned(),
        new_state,
        timestamp: Utc::now(),
    };
    inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
}

#[async_trait]
impl HostPlatform for MemoryHost {
    async fn lookup_entity(&self, entity_id: &EntityId) -> Result<Option<HostEntity>, CoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.states.contains_key(entity_id).then(|| HostEntity {
            entity_id: entity_id.clone(),
            domain: entity_id.domain().to_owned(),
            device_class: None,
        }))
    }

    async fn current_state(&self, entity_id: &EntityId) -> Result<Option<EntityState>, CoreError> {
        let mut inner = self.inner.lock().unwrap();
        let seen = inner.states.get(entity_id).cloned();
        if let Some((raw, state)) = inner.change_after_read.take() {
            let new_state = EntityState::filtered(state, &serde_json::Map::new());
            inner.states.insert(id(&raw), new_state.clone());
            emit(&mut inner, &raw, Some(new_state));
        }
        Ok(seen)
    }

    async fn call_service(&self, call: ServiceCall) -> Result<(), CoreError> {
        let delay = self.inner.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.failure.clone() {
            return Err(CoreError::ActionExecution { message });
        }
        inner.calls.push((call.clone(), Instant::now()));

        let current = inner
            .states
            .get(&call.entity_id)
            .map(|s| s.state.clone())
            .unwrap_or_default();
        let next = match call.service.as_str() {
            "turn_on" => "on".to_owned(),
            "turn_off" => "off".to_owned(),
            "toggle" if current == "on" => "off".to_owned(),
            "toggle" => "on".to_owned(),
            "open_cover" | "set_cover_position" => "open".to_owned(),
            "close_cover" => "closed".to_owned(),
            _ => current,
        };
        let new_state = EntityState::filtered(next, &call.data);
        inner.states.insert(call.entity_id.clone(), new_state.clone());
        emit(&mut inner, call.entity_id.as_str(), Some(new_state));
        Ok(())
    }

    async fn subscribe_state_changes(&self) -> Result<StateSubscription, CoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        Ok(StateSubscription::new(rx))
    }
}

// ── Cloud ────────────────────────────────────────────────────────────

/// The cloud side of one session.
pub struct CloudPeer {
    pub endpoint: CloudEndpoint,
    to_bridge: mpsc::Sender<CloudMessage>,
    from_bridge: mpsc::Receiver<CloudMessage>,
}

impl CloudPeer {
    pub async fn send(&self, message: CloudMessage) {
        self.to_bridge.send(message).await.unwrap();
    }

    pub async fn recv(&mut self) -> CloudMessage {
        tokio::time::timeout(WAIT, self.from_bridge.recv())
            .await
            .expect("timed out waiting for the bridge")
            .expect("bridge closed the session")
    }

    /// Next message, or `None` if nothing arrives within `within`.
    pub async fn try_recv(&mut self, within: Duration) -> Option<CloudMessage> {
        tokio::time::timeout(within, self.from_bridge.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the resume request and answer it.
    pub async fn handshake(&mut self, mode: ResumeMode, pending: Vec<WireCommand>) -> (u64, u64) {
        let CloudMessage::ResumeRequest {
            connection_epoch,
            last_acked_seq,
        } = self.recv().await
        else {
            panic!("expected resume_request first");
        };
        self.send(CloudMessage::ResumeResponse {
            mode,
            pending_commands: pending,
        })
        .await;
        (connection_epoch, last_acked_seq)
    }

    /// Collect state records until one with `seq >= through` arrives.
    /// Other messages are returned separately.
    pub async fn records_through(
        &mut self,
        through: u64,
    ) -> (Vec<WireStateRecord>, Vec<CloudMessage>) {
        let mut records = Vec::new();
        let mut others = Vec::new();
        while records.last().is_none_or(|r: &WireStateRecord| r.seq < through) {
            match self.recv().await {
                CloudMessage::StateUpdate { records: batch } => records.extend(batch),
                other => others.push(other),
            }
        }
        (records, others)
    }

    /// Skip messages until a command result arrives.
    pub async fn command_result(&mut self) -> WireCommandResult {
        loop {
            if let CloudMessage::CommandResult(result) = self.recv().await {
                return result;
            }
        }
    }

    pub async fn ack(&self, seq: u64) {
        self.send(CloudMessage::StateAck { seq }).await;
    }
}

pub fn command(command_id: &str, entity_id: &str, action: &str) -> WireCommand {
    WireCommand {
        command_id: command_id.to_owned(),
        entity_id: entity_id.to_owned(),
        action: action.to_owned(),
        parameters: serde_json::Map::new(),
        issued_at: Utc::now(),
    }
}

pub struct MemoryCloud {
    peers: mpsc::UnboundedSender<CloudPeer>,
    reject_auth: AtomicBool,
    connects: AtomicUsize,
}

impl MemoryCloud {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CloudPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let cloud = Arc::new(Self {
            peers,
            reject_auth: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        });
        (cloud, rx)
    }

    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudConnector for MemoryCloud {
    async fn connect(&self, endpoint: &CloudEndpoint) -> Result<CloudSession, CoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(CoreError::Auth {
                message: "invalid API key".into(),
            });
        }
        let (out_tx, out_rx) = mpsc::channel(1024);
        let (in_tx, in_rx) = mpsc::channel(1024);
        let peer = CloudPeer {
            endpoint: endpoint.clone(),
            to_bridge: in_tx,
            from_bridge: out_rx,
        };
        self.peers.send(peer).map_err(|_| CoreError::Transport {
            message: "cloud gone".into(),
        })?;
        Ok(CloudSession::from_channels(out_tx, in_rx))
    }
}

// ── Harness ──────────────────────────────────────────────────────────

pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::new(
        Url::parse("ws://cloud.test/bridge").unwrap(),
        "instance-test",
        SecretString::from("test-key"),
    );
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_retries: None,
    };
    config.resume_timeout = Duration::from_secs(2);
    config.action_timeout = Duration::from_secs(2);
    config
}

pub struct Harness {
    pub bridge: Bridge,
    pub host: Arc<MemoryHost>,
    pub cloud: Arc<MemoryCloud>,
    pub peers: mpsc::UnboundedReceiver<CloudPeer>,
    pub store: BridgeStore,
}

impl Harness {
    /// Bridge over fresh in-memory state, with the initial baseline
    /// already taken so the first session resumes instead of resyncing.
    pub fn new(host: Arc<MemoryHost>) -> Self {
        let store = BridgeStore::open_in_memory().unwrap();
        store.mark_baseline_done().unwrap();
        Self::with_store(host, store, test_config())
    }

    pub fn with_store(host: Arc<MemoryHost>, store: BridgeStore, config: BridgeConfig) -> Self {
        let (cloud, peers) = MemoryCloud::new();
        let bridge = Bridge::new(
            config,
            store.clone(),
            Arc::clone(&host) as Arc<dyn HostPlatform>,
            Arc::clone(&cloud) as Arc<dyn CloudConnector>,
        )
        .unwrap();
        Self {
            bridge,
            host,
            cloud,
            peers,
            store,
        }
    }

    pub async fn next_peer(&mut self) -> CloudPeer {
        tokio::time::timeout(WAIT, self.peers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("cloud closed")
    }

    /// Wait until the published status satisfies `f`.
    pub async fn wait_status(&self, f: impl Fn(&SyncStatus) -> bool) -> SyncStatus {
        let mut rx = self.bridge.subscribe_status();
        let status = tokio::time::timeout(WAIT, rx.wait_for(|s| f(s)))
            .await
            .expect("timed out waiting for status")
            .unwrap();
        *status
    }
}
