// ── Credential & session manager ──
//
// Holds the API key and the cloud-issued session token, and builds the
// endpoint for each connection attempt. An auth failure that survives a
// token refresh marks the credentials revoked; sync stays suspended until
// `rotate_api_key` is called.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use direktive_api::protocol::SessionGrant;
use direktive_api::{CloudEndpoint, PayloadCipher};
use secrecy::SecretString;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use crate::config::BridgeConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Active,
    Revoked { reason: String },
}

pub struct CredentialManager {
    socket_url: Url,
    instance_id: String,
    api_key: RwLock<SecretString>,
    session_token: RwLock<Option<SecretString>>,
    cipher: Option<PayloadCipher>,
    connect_timeout: Duration,
    state: watch::Sender<AuthState>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("instance_id", &self.instance_id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl CredentialManager {
    pub fn new(config: &BridgeConfig) -> Self {
        let (state, _) = watch::channel(AuthState::Active);
        Self {
            socket_url: config.socket_url.clone(),
            instance_id: config.instance_id.clone(),
            api_key: RwLock::new(config.api_key.clone()),
            session_token: RwLock::new(None),
            cipher: config.cipher.clone(),
            connect_timeout: config.request_timeout,
            state,
        }
    }

    /// Endpoint for the next connection attempt.
    pub fn endpoint(&self) -> CloudEndpoint {
        CloudEndpoint {
            socket_url: self.socket_url.clone(),
            instance_id: self.instance_id.clone(),
            api_key: self
                .api_key
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            session_token: self
                .session_token
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            cipher: self.cipher.clone(),
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Replace the API key and lift any auth suspension.
    pub fn rotate_api_key(&self, api_key: SecretString) {
        *self.api_key.write().unwrap_or_else(PoisonError::into_inner) = api_key;
        self.clear_session_token();
        self.state.send_replace(AuthState::Active);
        info!("API key rotated");
    }

    pub fn set_session_token(&self, grant: &SessionGrant) {
        let token = SecretString::from(grant.token.clone());
        *self
            .session_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token);
        info!(expires_at = ?grant.expires_at, "Session token issued");
    }

    /// Drop the session token. Returns whether one was held.
    pub fn clear_session_token(&self) -> bool {
        self.session_token
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn mark_revoked(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(
            reason = %reason,
            "Cloud credentials rejected; sync suspended until the API key is rotated"
        );
        self.clear_session_token();
        self.state.send_replace(AuthState::Revoked { reason });
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn is_revoked(&self) -> bool {
        matches!(*self.state.borrow(), AuthState::Revoked { .. })
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Resolve once the credentials are usable again.
    pub async fn wait_until_active(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this cannot fail while we are borrowed.
        let _ = rx.wait_for(|s| *s == AuthState::Active).await;
    }
}
