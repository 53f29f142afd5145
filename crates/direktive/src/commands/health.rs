use direktive_api::CloudRestClient;
use direktive_config::SecretKind;
use serde::Serialize;

use crate::cli::GlobalOpts;
use crate::commands::load_config;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct HealthReport {
    api_url: String,
    status: String,
    error: Option<String>,
    plan: String,
    encryption_required: bool,
    encryption_configured: bool,
}

pub async fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = load_config(global)?;
    let api_url = cfg.api_url()?;
    let api_key = direktive_config::resolve_secret(&cfg, SecretKind::ApiKey)?;
    let client = CloudRestClient::new(
        &api_url,
        &api_key,
        cfg.instance_id().unwrap_or_default(),
        &cfg.cloud_transport(),
    )?;

    let health = client.health().await?;
    let subscription = client.subscription().await?;
    let report = HealthReport {
        api_url: api_url.to_string(),
        status: health.status.clone(),
        error: health.error.clone(),
        plan: subscription.plan,
        encryption_required: subscription.encryption_required,
        encryption_configured: cfg.to_bridge_config().is_ok_and(|c| c.cipher.is_some()),
    };

    let out = output::render_single(global.output, &report, |r| {
        vec![
            ("Service", r.api_url.clone()),
            ("Status", r.status.clone()),
            ("Error", r.error.clone().unwrap_or_else(|| "-".into())),
            ("Plan", r.plan.clone()),
            (
                "Encryption",
                match (r.encryption_required, r.encryption_configured) {
                    (_, true) => "configured".into(),
                    (true, false) => "REQUIRED, not configured".into(),
                    (false, false) => "off".into(),
                },
            ),
        ]
    })?;
    output::print_output(&out, global.quiet);

    if health.is_healthy() {
        Ok(())
    } else {
        Err(CliError::ConnectionFailed {
            target: api_url.to_string(),
            message: health.error.unwrap_or(health.status),
        })
    }
}
