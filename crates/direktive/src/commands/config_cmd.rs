//! Config subcommand handlers.

use dialoguer::{Input, Select};
use direktive_config::{Config, SecretKind};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::commands::load_config;
use crate::error::CliError;
use crate::output;

fn prompt_err(e: impl std::fmt::Display) -> CliError {
    CliError::Validation {
        field: "interactive".into(),
        reason: format!("prompt failed: {e}"),
    }
}

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Init {
            non_interactive,
            force,
        } => init(global, non_interactive, force),
        ConfigCommand::Show => show(global),
        ConfigCommand::Path => {
            output::print_output(&global.config_path().display().to_string(), global.quiet);
            Ok(())
        }
        ConfigCommand::SetSecret { kind, value } => {
            let kind = SecretKind::from(kind);
            let value = match value {
                Some(v) => v,
                None => rpassword::prompt_password(format!("{kind}: ")).map_err(prompt_err)?,
            };
            if value.trim().is_empty() {
                return Err(CliError::Validation {
                    field: kind.to_string(),
                    reason: "value cannot be empty".into(),
                });
            }
            direktive_config::store_secret(kind, value.trim())?;
            output::print_output(&format!("{kind} stored in the system keyring"), global.quiet);
            Ok(())
        }
        ConfigCommand::GenKey { store } => {
            let key = direktive_api::crypto::generate_key();
            if store {
                direktive_config::store_secret(SecretKind::EncryptionKey, &key)?;
                output::print_output(
                    "encryption-key stored in the system keyring. \
                     Share it with Direktive.ai to enable sealed frames.",
                    global.quiet,
                );
            } else {
                output::print_output(&key, false);
            }
            Ok(())
        }
    }
}

// ── Init ─────────────────────────────────────────────────────────────

fn init(global: &GlobalOpts, non_interactive: bool, force: bool) -> Result<(), CliError> {
    let path = global.config_path();
    if path.exists() && !force {
        return Err(CliError::ConfigExists {
            path: path.display().to_string(),
        });
    }

    let mut cfg = Config::init();
    if !non_interactive {
        wizard(&mut cfg, &path)?;
    }

    direktive_config::save_config_to(&cfg, &path)?;
    output::print_output(
        &format!("Config written to {}", path.display()),
        global.quiet,
    );
    Ok(())
}

fn wizard(cfg: &mut Config, path: &std::path::Path) -> Result<(), CliError> {
    eprintln!("Direktive.ai bridge setup");
    eprintln!("   Config path: {}\n", path.display());

    cfg.home_assistant.base_url = Input::new()
        .with_prompt("Home Assistant URL")
        .default(cfg.home_assistant.base_url.clone())
        .interact_text()
        .map_err(prompt_err)?;

    let hass_token = rpassword::prompt_password("Home Assistant long-lived access token: ")
        .map_err(prompt_err)?;
    let api_key = rpassword::prompt_password("Direktive.ai API key: ").map_err(prompt_err)?;

    let choices = &["System keyring (recommended)", "Plaintext in config file"];
    let storage = Select::new()
        .with_prompt("Where should secrets be stored?")
        .items(choices)
        .default(0)
        .interact()
        .map_err(prompt_err)?;

    for (kind, value) in [
        (SecretKind::HassToken, hass_token),
        (SecretKind::ApiKey, api_key),
    ] {
        let value = value.trim().to_owned();
        if value.is_empty() {
            continue;
        }
        if storage == 0 {
            direktive_config::store_secret(kind, &value)?;
        } else {
            match kind {
                SecretKind::HassToken => cfg.home_assistant.token = Some(value),
                SecretKind::ApiKey => cfg.cloud.api_key = Some(value),
                SecretKind::EncryptionKey => cfg.cloud.encryption_key = Some(value),
            }
        }
    }

    eprintln!(
        "\nAdd entities with: direktive entities expose light.kitchen -c state-read,command-accept"
    );
    Ok(())
}

// ── Show ─────────────────────────────────────────────────────────────

const REDACTED: &str = "<redacted>";

fn redact(value: &mut Option<String>) {
    if value.is_some() {
        *value = Some(REDACTED.into());
    }
}

fn show(global: &GlobalOpts) -> Result<(), CliError> {
    let mut cfg = load_config(global)?;
    redact(&mut cfg.cloud.api_key);
    redact(&mut cfg.cloud.encryption_key);
    redact(&mut cfg.home_assistant.token);

    let out = match global.output {
        OutputFormat::Table | OutputFormat::Plain => {
            toml::to_string_pretty(&cfg).map_err(|e| CliError::Serialize(e.to_string()))?
        }
        OutputFormat::Json | OutputFormat::JsonCompact | OutputFormat::Yaml => {
            output::render_single(global.output, &cfg, |_| Vec::new())?
        }
    };
    output::print_output(&out, global.quiet);
    Ok(())
}
