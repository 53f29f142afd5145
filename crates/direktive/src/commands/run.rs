//! `direktive run`: the long-running bridge daemon.

use std::sync::Arc;

use direktive_api::rest::Registration;
use direktive_api::{CloudRestClient, HassClient};
use direktive_config::{Config, SecretKind};
use direktive_core::{
    Bridge, BridgeConfig, CoreError, HassHost, HostPlatform, SyncPhase, WsConnector,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cli::{GlobalOpts, RunArgs};
use crate::commands::load_config;
use crate::error::CliError;

pub async fn handle(args: &RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = load_config(global)?;
    let bridge_config = cfg.to_bridge_config()?;
    let rest = CloudRestClient::new(
        &cfg.api_url()?,
        &bridge_config.api_key,
        &bridge_config.instance_id,
        &cfg.cloud_transport(),
    )?;

    preflight(&rest, &bridge_config).await?;

    let hass = HassClient::connect(cfg.to_hass_config()?).await?;
    let host = Arc::new(HassHost::new(hass));
    info!(url = %cfg.home_assistant.base_url, "Connected to Home Assistant");

    let bridge = Bridge::open(
        bridge_config,
        Arc::clone(&host) as Arc<dyn HostPlatform>,
        Arc::new(WsConnector),
    )?;

    if !args.no_register {
        register_instance(&bridge, &rest, &host, &cfg).await?;
    }

    apply_exposure(&bridge, &cfg).await?;
    bridge.start().await?;
    let status_log = tokio::spawn(log_status(bridge.subscribe_status()));

    wait_for_shutdown(&bridge, global).await;

    info!("Shutting down");
    bridge.shutdown().await;
    status_log.abort();
    Ok(())
}

/// Fail early on rejected credentials or a plan that demands encryption
/// when no key is configured. Network trouble is only logged; the sync loop
/// retries on its own.
async fn preflight(rest: &CloudRestClient, config: &BridgeConfig) -> Result<(), CliError> {
    match rest.subscription().await {
        Ok(plan) => {
            info!(plan = %plan.plan, "Direktive.ai subscription");
            if plan.encryption_required && config.cipher.is_none() {
                return Err(CliError::NotPermitted {
                    message: format!(
                        "the '{}' plan requires payload encryption; \
                         run `direktive config gen-key --store`",
                        plan.plan
                    ),
                });
            }
            Ok(())
        }
        Err(e) if e.is_auth_failure() => Err(e.into()),
        Err(e) => {
            warn!(error = %e, "Subscription check failed; continuing");
            Ok(())
        }
    }
}

async fn register_instance(
    bridge: &Bridge,
    rest: &CloudRestClient,
    host: &HassHost,
    cfg: &Config,
) -> Result<(), CliError> {
    let store = bridge.store();
    if store.instance_registered().map_err(CoreError::from)? {
        return Ok(());
    }

    let location = match host.instance_config().await {
        Ok(location) => location,
        Err(e) => {
            warn!(error = %e, "Could not read Home Assistant location; registering without it");
            direktive_api::hass::HassInstanceConfig::default()
        }
    };
    let registration = Registration {
        instance_id: bridge.credentials().instance_id().to_owned(),
        ha_base_url: cfg.home_assistant.base_url.clone(),
        country: location.country,
        timezone: location.time_zone,
        location: location.location_name,
    };

    match rest.register(&registration).await {
        Ok(()) => {
            store.mark_instance_registered().map_err(CoreError::from)?;
            info!(instance_id = %registration.instance_id, "Instance registered");
            Ok(())
        }
        Err(e) if e.is_auth_failure() => Err(e.into()),
        Err(e) => {
            warn!(error = %e, "Instance registration failed; will retry on next start");
            Ok(())
        }
    }
}

async fn apply_exposure(bridge: &Bridge, cfg: &Config) -> Result<(), CliError> {
    let declared = cfg.exposure_map()?;
    let diff = bridge.apply_declared(&declared).await?;
    for (entity_id, reason) in &diff.failed {
        warn!(%entity_id, %reason, "Declared exposure rejected");
    }
    Ok(())
}

/// Re-read the config: apply the exposure list and, if sync is suspended
/// on rejected credentials, pick up a rotated API key.
async fn reload(bridge: &Bridge, global: &GlobalOpts) {
    let cfg = match load_config(global) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Config reload failed; keeping the current exposure list");
            return;
        }
    };
    if let Err(e) = apply_exposure(bridge, &cfg).await {
        error!(error = %e, "Applying the exposure list failed");
    }
    if bridge.credentials().is_revoked() {
        match direktive_config::resolve_secret(&cfg, SecretKind::ApiKey) {
            Ok(key) => bridge.credentials().rotate_api_key(key),
            Err(e) => warn!(error = %e, "No API key to retry with"),
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(bridge: &Bridge, global: &GlobalOpts) {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut hangup), Ok(mut terminate)) =
        (signal(SignalKind::hangup()), signal(SignalKind::terminate()))
    else {
        warn!("Signal handlers unavailable; stop with Ctrl-C");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = terminate.recv() => return,
            _ = hangup.recv() => {
                info!("SIGHUP received; reloading configuration");
                reload(bridge, global).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_bridge: &Bridge, _global: &GlobalOpts) {
    let _ = tokio::signal::ctrl_c().await;
}

async fn log_status(mut rx: watch::Receiver<direktive_core::SyncStatus>) {
    let mut last = rx.borrow().phase;
    while rx.changed().await.is_ok() {
        let status = *rx.borrow_and_update();
        if status.phase == last {
            continue;
        }
        last = status.phase;
        match status.phase {
            SyncPhase::AuthSuspended => {
                warn!("Sync suspended: credentials rejected. Update the API key and send SIGHUP");
            }
            SyncPhase::BackoffWait { attempt } => {
                warn!(attempt, backlog = status.backlog_len, "Cloud unreachable; retrying");
            }
            SyncPhase::Streaming => info!(
                epoch = status.connection_epoch,
                last_acked_seq = status.last_acked_seq,
                backlog = status.backlog_len,
                "Syncing"
            ),
            phase => info!(%phase, "Sync phase changed"),
        }
    }
}
