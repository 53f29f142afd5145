//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use direktive_config::ConfigError;
use direktive_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const PERMISSION: i32 = 5;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach {target}")]
    #[diagnostic(
        code(direktive::connection_failed),
        help("Check the URL in your config and that the service is reachable.")
    )]
    ConnectionFailed { target: String, message: String },

    #[error("Request timed out after {seconds}s")]
    #[diagnostic(
        code(direktive::timeout),
        help("Raise sync.request_timeout_secs or check the service's responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(direktive::auth_failed),
        help(
            "Verify the API key or Home Assistant token.\n\
             Run: direktive config set-secret api-key"
        )
    )]
    AuthFailed { message: String },

    #[error("No {what} configured")]
    #[diagnostic(
        code(direktive::no_credentials),
        help("Set {env}, or run: direktive config set-secret {kind}")
    )]
    NoCredentials {
        what: String,
        env: String,
        kind: String,
    },

    // ── Exposure ─────────────────────────────────────────────────────
    #[error("Entity '{entity_id}' not found")]
    #[diagnostic(
        code(direktive::not_found),
        help("Run: direktive entities available")
    )]
    NotFound { entity_id: String },

    #[error("{message}")]
    #[diagnostic(code(direktive::not_permitted))]
    NotPermitted { message: String },

    // ── Local state ──────────────────────────────────────────────────
    #[error("The bridge database is in use")]
    #[diagnostic(
        code(direktive::store_locked),
        help("A running `direktive run` holds {path}. Its status is in its log output.")
    )]
    StoreLocked { path: String },

    #[error("No bridge state at {path}")]
    #[diagnostic(
        code(direktive::no_state),
        help("The bridge has not run yet. Start it with: direktive run")
    )]
    NoState { path: String },

    // ── Validation / configuration ───────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(direktive::validation))]
    Validation { field: String, reason: String },

    #[error("Configuration file already exists at {path}")]
    #[diagnostic(
        code(direktive::config_exists),
        help("Use --force to overwrite it.")
    )]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(direktive::config))]
    Config(ConfigError),

    // ── Everything else ──────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(direktive::bridge))]
    Core(CoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialize(String),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::NotFound { .. } | Self::NoState { .. } => exit_code::NOT_FOUND,
            Self::NotPermitted { .. } => exit_code::PERMISSION,
            Self::Validation { .. } | Self::ConfigExists { .. } | Self::Config(_) => {
                exit_code::USAGE
            }
            _ => exit_code::GENERAL,
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Auth { message } => Self::AuthFailed { message },
            CoreError::Transport { message } => Self::ConnectionFailed {
                target: "remote service".into(),
                message,
            },
            CoreError::Timeout { timeout_secs } => Self::Timeout {
                seconds: timeout_secs,
            },
            CoreError::UnknownEntity { entity_id } => Self::NotFound { entity_id },
            err @ (CoreError::NotAuthorized { .. }
            | CoreError::UnsupportedType { .. }
            | CoreError::UnsupportedCapability { .. }) => Self::NotPermitted {
                message: err.to_string(),
            },
            CoreError::InvalidEntityId { value } => Self::Validation {
                field: "entity_id".into(),
                reason: format!("'{value}' is not <domain>.<object_id>"),
            },
            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message,
            },
            CoreError::Storage(ref storage) if storage.is_locked() => Self::StoreLocked {
                path: "the state directory".into(),
            },
            other => Self::Core(other),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::MissingSecret { what, env } => Self::NoCredentials {
                what: what.into(),
                kind: secret_kind_hint(what).into(),
                env,
            },
            other => Self::Config(other),
        }
    }
}

impl From<direktive_api::Error> for CliError {
    fn from(err: direktive_api::Error) -> Self {
        CoreError::from(err).into()
    }
}

fn secret_kind_hint(what: &str) -> &'static str {
    if what.contains("Home Assistant") {
        "hass-token"
    } else if what.contains("encryption") {
        "encryption-key"
    } else {
        "api-key"
    }
}
