// ── Bridge lifecycle ──
//
// Owns the components and the three long-lived tasks:
//
//   observer  host events ─▶ registry filter ─▶ outbound queue
//   worker    command jobs ─▶ listener ─▶ command_result
//   sync      connect ─▶ reconcile ─▶ stream ─▶ (backoff) ─▶ connect …
//
// The sync task is an explicit state machine over `SyncPhase`. Every
// transition is published on a watch channel; shutdown cancels all three
// tasks and waits for them, leaving persisted state untouched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use direktive_api::{CloudMessage, CloudSession};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::connector::CloudConnector;
use crate::convert::{command_from_wire, notice_to_wire, record_to_wire};
use crate::credentials::CredentialManager;
use crate::error::CoreError;
use crate::host::HostPlatform;
use crate::inbound::{CommandJob, CommandListener};
use crate::ledger::CommandLedger;
use crate::model::{Capabilities, EntityId, ExposedEntity};
use crate::observer::StateObserver;
use crate::outbound::{AckOutcome, OutboundQueue};
use crate::reconcile::{Reconciler, ResumeReply};
use crate::registry::{DeclaredDiff, ExposureRegistry};
use crate::store::BridgeStore;

const COMMAND_QUEUE: usize = 64;

// ── Status ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[serde(tag = "phase", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Connecting,
    BackoffWait {
        attempt: u32,
    },
    Streaming,
    Draining,
    /// Credentials rejected. No traffic until the API key is rotated.
    AuthSuspended,
}

/// Connectivity indicator published by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub connected: bool,
    pub auth_suspended: bool,
    pub last_acked_seq: u64,
    pub last_assigned_seq: u64,
    pub backlog_len: usize,
    pub dropped_records: u64,
    pub connection_epoch: u64,
    pub registry_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    AuthRevoked,
    Cancelled,
}

// ── Bridge ───────────────────────────────────────────────────────────

struct BridgeInner {
    config: BridgeConfig,
    store: BridgeStore,
    host: Arc<dyn HostPlatform>,
    connector: Arc<dyn CloudConnector>,
    registry: Arc<ExposureRegistry>,
    queue: Arc<OutboundQueue>,
    credentials: Arc<CredentialManager>,
    reconciler: Reconciler,
    status: watch::Sender<SyncStatus>,
    epoch: AtomicU64,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _guard: DropGuard,
}

pub struct Bridge {
    inner: Arc<BridgeInner>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("instance_id", &self.inner.config.instance_id)
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Open the store under `config.state_dir` and build the bridge.
    pub fn open(
        config: BridgeConfig,
        host: Arc<dyn HostPlatform>,
        connector: Arc<dyn CloudConnector>,
    ) -> Result<Self, CoreError> {
        std::fs::create_dir_all(&config.state_dir).map_err(|e| CoreError::Config {
            message: format!("cannot create state dir {}: {e}", config.state_dir.display()),
        })?;
        let store = BridgeStore::open(config.store_path())?;
        Self::new(config, store, host, connector)
    }

    pub fn new(
        config: BridgeConfig,
        store: BridgeStore,
        host: Arc<dyn HostPlatform>,
        connector: Arc<dyn CloudConnector>,
    ) -> Result<Self, CoreError> {
        let queue = Arc::new(OutboundQueue::load(store.clone(), config.queue_capacity)?);
        let registry = Arc::new(ExposureRegistry::load(
            &store,
            Arc::clone(&queue),
            Arc::clone(&host),
        )?);
        let credentials = Arc::new(CredentialManager::new(&config));
        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&host),
            store.clone(),
            config.resume_timeout,
            config.request_timeout,
        );
        let epoch = store.cursor()?.connection_epoch;
        let (status, _) = watch::channel(SyncStatus::default());

        let inner = Arc::new(BridgeInner {
            config,
            store,
            host,
            connector,
            registry,
            queue,
            credentials,
            reconciler,
            status,
            epoch: AtomicU64::new(epoch),
        });
        Ok(Self {
            inner,
            running: Mutex::new(None),
        })
    }

    /// Subscribe to host events and start syncing. Idempotent.
    pub async fn start(&self) -> Result<(), CoreError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let inner = &self.inner;
        let subscription = inner.host.subscribe_state_changes().await?;
        let cancel = CancellationToken::new();
        let (jobs_tx, jobs_rx) = mpsc::channel(COMMAND_QUEUE);

        let observer = StateObserver::new(Arc::clone(&inner.registry), Arc::clone(&inner.queue));
        let listener = CommandListener::new(
            Arc::clone(&inner.registry),
            CommandLedger::new(inner.store.clone(), inner.config.dedup_retention),
            Arc::clone(&inner.host),
            inner.config.action_timeout,
        );

        let tasks = vec![
            tokio::spawn(observer.run(subscription, cancel.child_token())),
            tokio::spawn(listener.run(jobs_rx, cancel.child_token())),
            tokio::spawn(Arc::clone(inner).sync_loop(jobs_tx, cancel.child_token())),
        ];

        info!(instance_id = %inner.config.instance_id, "Bridge started");
        *running = Some(Running {
            _guard: cancel.clone().drop_guard(),
            cancel,
            tasks,
        });
        Ok(())
    }

    /// Stop every loop and wait for it. Queue, cursor and ledger stay on disk.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.inner.set_phase(SyncPhase::Draining);
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Bridge task ended abnormally");
            }
        }
        self.inner.set_phase(SyncPhase::Idle);
        info!("Bridge stopped");
    }

    pub async fn status(&self) -> SyncStatus {
        self.inner.refresh_status().await;
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub async fn expose(
        &self,
        entity_id: &EntityId,
        capabilities: Capabilities,
    ) -> Result<Option<ExposedEntity>, CoreError> {
        let exposed = self.inner.registry.expose(entity_id, capabilities).await?;
        self.inner.refresh_status().await;
        Ok(exposed)
    }

    pub async fn revoke(&self, entity_id: &EntityId) -> Result<bool, CoreError> {
        let revoked = self.inner.registry.revoke(entity_id).await?;
        self.inner.refresh_status().await;
        Ok(revoked)
    }

    pub async fn query(&self, entity_id: &EntityId) -> Option<Capabilities> {
        self.inner.registry.query(entity_id).await
    }

    pub async fn list(&self) -> Vec<ExposedEntity> {
        self.inner.registry.list().await
    }

    /// Bring the registry in line with the configured exposure list.
    pub async fn apply_declared(
        &self,
        declared: &BTreeMap<EntityId, Capabilities>,
    ) -> Result<DeclaredDiff, CoreError> {
        let diff = self.inner.registry.apply_declared(declared).await?;
        info!(
            exposed = diff.exposed.len(),
            revoked = diff.revoked.len(),
            failed = diff.failed.len(),
            "Exposure list applied"
        );
        self.inner.refresh_status().await;
        Ok(diff)
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.inner.credentials
    }

    pub fn store(&self) -> &BridgeStore {
        &self.inner.store
    }
}

// ── Sync state machine ───────────────────────────────────────────────

impl BridgeInner {
    fn set_phase(&self, phase: SyncPhase) {
        let changed = self.status.send_if_modified(|s| {
            if s.phase == phase {
                return false;
            }
            s.phase = phase;
            s.connected = phase == SyncPhase::Streaming;
            s.auth_suspended = phase == SyncPhase::AuthSuspended;
            true
        });
        if changed {
            debug!(phase = %phase, "Sync phase changed");
        }
    }

    async fn refresh_status(&self) {
        let registry_version = self.registry.version().await;
        self.status.send_modify(|s| {
            s.last_acked_seq = self.queue.last_acked();
            s.last_assigned_seq = self.queue.last_assigned();
            s.backlog_len = self.queue.len();
            s.dropped_records = self.queue.dropped();
            s.connection_epoch = self.epoch.load(Ordering::Relaxed);
            s.registry_version = registry_version;
        });
    }

    async fn sync_loop(self: Arc<Self>, jobs: mpsc::Sender<CommandJob>, cancel: CancellationToken) {
        let reconnect = self.config.reconnect.clone();
        let mut attempt: u32 = 0;

        loop {
            if self.credentials.is_revoked() {
                self.set_phase(SyncPhase::AuthSuspended);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = self.credentials.wait_until_active() => {
                        attempt = 0;
                        continue;
                    }
                }
            }

            self.set_phase(SyncPhase::Connecting);
            let endpoint = self.credentials.endpoint();
            let connected = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = tokio::time::timeout(
                    self.config.request_timeout,
                    self.connector.connect(&endpoint),
                ) => result.unwrap_or_else(|_| Err(CoreError::Timeout {
                    timeout_secs: self.config.request_timeout.as_secs(),
                })),
            };

            match connected {
                Ok(session) => {
                    attempt = 0;
                    match self.run_session(session, &jobs, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::AuthRevoked => continue,
                        SessionEnd::Closed => info!("Cloud session ended"),
                    }
                }
                Err(e) if e.is_auth() => {
                    if self.credentials.clear_session_token() {
                        debug!("Session token rejected, retrying with API key");
                    } else {
                        self.credentials.mark_revoked(e.to_string());
                    }
                    continue;
                }
                Err(e) => warn!(attempt, error = %e, "Cloud connection failed"),
            }

            if !reconnect.allows(attempt) {
                error!(attempts = attempt, "Giving up on cloud connection");
                break;
            }
            let delay = reconnect.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            self.set_phase(SyncPhase::BackoffWait { attempt });
            debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Waiting before reconnect"
            );

            let mut auth = self.credentials.subscribe();
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
                _ = auth.changed() => attempt = 0,
            }
        }

        if !cancel.is_cancelled() {
            self.set_phase(SyncPhase::Idle);
        }
    }

    async fn run_session(
        &self,
        mut session: CloudSession,
        jobs: &mpsc::Sender<CommandJob>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let epoch = match self.store.next_epoch() {
            Ok(epoch) => epoch,
            Err(e) => {
                error!(error = %e, "Failed to advance connection epoch");
                return SessionEnd::Closed;
            }
        };
        self.epoch.store(epoch, Ordering::Relaxed);
        self.refresh_status().await;
        info!(epoch, "Cloud session started");

        let outbound = session.outbound.clone();
        let (resume_tx, mut resume_rx) = mpsc::channel(1);

        let end = tokio::select! {
            biased;
            () = cancel.cancelled() => SessionEnd::Cancelled,
            end = self.receive(&mut session.inbound, &outbound, resume_tx, jobs) => end,
            result = self.stream(epoch, &outbound, &mut resume_rx, jobs) => match result {
                Ok(()) => SessionEnd::Closed,
                Err(CoreError::Shutdown) => SessionEnd::Cancelled,
                Err(e) => {
                    warn!(epoch, error = %e, "Cloud session failed");
                    SessionEnd::Closed
                }
            },
        };

        drop(session);
        self.refresh_status().await;
        end
    }

    /// Route everything the cloud sends during one session.
    async fn receive(
        &self,
        inbound: &mut mpsc::Receiver<CloudMessage>,
        reply: &mpsc::Sender<CloudMessage>,
        resume: mpsc::Sender<ResumeReply>,
        jobs: &mpsc::Sender<CommandJob>,
    ) -> SessionEnd {
        while let Some(message) = inbound.recv().await {
            match message {
                CloudMessage::StateAck { seq } => match self.queue.ack(seq) {
                    Ok(AckOutcome::Advanced { .. }) => self.refresh_status().await,
                    Ok(AckOutcome::Stale | AckOutcome::Future) => {}
                    Err(e) => error!(seq, error = %e, "Failed to apply ack"),
                },
                CloudMessage::Command(wire) => {
                    let job = CommandJob {
                        command: command_from_wire(wire),
                        reply: reply.clone(),
                    };
                    if jobs.send(job).await.is_err() {
                        return SessionEnd::Cancelled;
                    }
                }
                CloudMessage::ResumeResponse {
                    mode,
                    pending_commands,
                } => {
                    if resume
                        .try_send(ResumeReply {
                            mode,
                            pending_commands,
                        })
                        .is_err()
                    {
                        debug!("Ignoring unsolicited resume response");
                    }
                }
                CloudMessage::Session(grant) => self.credentials.set_session_token(&grant),
                CloudMessage::AuthRevoked { reason } => {
                    self.credentials.mark_revoked(reason);
                    return SessionEnd::AuthRevoked;
                }
                CloudMessage::Ping { .. } | CloudMessage::Pong { .. } => {}
                other => debug!(kind = other.kind(), "Ignoring message"),
            }
        }
        SessionEnd::Closed
    }

    /// Reconcile, then stream notices and records until the session fails.
    ///
    /// The session counts as streaming only once reconciliation is done.
    async fn stream(
        &self,
        epoch: u64,
        outbound: &mpsc::Sender<CloudMessage>,
        resume: &mut mpsc::Receiver<ResumeReply>,
        jobs: &mpsc::Sender<CommandJob>,
    ) -> Result<(), CoreError> {
        let closed = |_| CoreError::Transport {
            message: "cloud session closed".into(),
        };

        let resent = self.queue.resend_notices();
        if resent > 0 {
            debug!(resent, "Unconfirmed notices queued for resend");
        }
        let report = self.reconciler.reconcile(epoch, outbound, resume).await?;
        self.set_phase(SyncPhase::Streaming);
        for command in report.pending_commands {
            jobs.send(CommandJob {
                command,
                reply: outbound.clone(),
            })
            .await
            .map_err(|_| CoreError::Shutdown)?;
        }
        self.refresh_status().await;

        let batch_size = self.config.batch_size.max(1);
        let mut sent_through = report.resume_after;
        loop {
            for (id, notice) in self.queue.pending_notices() {
                outbound.send(notice_to_wire(&notice)).await.map_err(closed)?;
                self.queue.notice_sent(id, sent_through);
            }

            let batch = self.queue.records_after(sent_through, batch_size);
            if let Some(last) = batch.last() {
                sent_through = last.seq;
                let records: Vec<_> = batch.iter().map(record_to_wire).collect();
                debug!(count = records.len(), through = sent_through, "Sending state update");
                outbound
                    .send(CloudMessage::StateUpdate { records })
                    .await
                    .map_err(closed)?;
                continue;
            }

            self.queue.wait_for_work().await;
        }
    }
}
