//! Clap derive structures for the `direktive` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use direktive_config::SecretKind;
use direktive_core::Capability;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// direktive -- share selected Home Assistant entities with Direktive.ai
#[derive(Debug, Parser)]
#[command(
    name = "direktive",
    version,
    about = "Bridge Home Assistant entities to Direktive.ai",
    long_about = "Keeps an explicit exposure list of Home Assistant entities in sync with\n\
        Direktive.ai: state changes flow out, commands flow in. Nothing outside\n\
        the exposure list ever crosses the boundary.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config dir)
    #[arg(long, env = "DIREKTIVE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "DIREKTIVE_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, env = "DIREKTIVE_LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

impl GlobalOpts {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(direktive_config::config_path)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge until interrupted
    Run(RunArgs),

    /// Manage the exposure list
    #[command(alias = "e")]
    Entities(EntitiesArgs),

    /// Show the persisted sync state
    Status,

    /// Check the Direktive.ai service and subscription
    Health,

    /// Manage configuration and secrets
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Skip the one-time instance registration
    #[arg(long)]
    pub no_register: bool,
}

// ── Entities ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct EntitiesArgs {
    #[command(subcommand)]
    pub command: EntitiesCommand,
}

#[derive(Debug, Subcommand)]
pub enum EntitiesCommand {
    /// List declared exposures and their persisted sync state
    #[command(alias = "ls")]
    List,

    /// List Home Assistant entities that can be exposed
    Available {
        /// Include entities of unsupported types
        #[arg(long)]
        all: bool,
    },

    /// Declare an entity as exposed (applied on start or SIGHUP)
    Expose {
        /// Entity id, e.g. light.kitchen
        entity_id: String,

        /// Capabilities to grant
        #[arg(
            long,
            short = 'c',
            value_delimiter = ',',
            default_value = "state-read"
        )]
        capabilities: Vec<CapabilityArg>,
    },

    /// Remove an entity from the exposure list
    #[command(alias = "rm")]
    Revoke {
        entity_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CapabilityArg {
    StateRead,
    CommandAccept,
}

impl From<CapabilityArg> for Capability {
    fn from(arg: CapabilityArg) -> Self {
        match arg {
            CapabilityArg::StateRead => Self::StateRead,
            CapabilityArg::CommandAccept => Self::CommandAccept,
        }
    }
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Create a config file (interactive unless --non-interactive)
    Init {
        /// Write defaults with a fresh instance id, no prompts
        #[arg(long)]
        non_interactive: bool,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration (secrets redacted)
    Show,

    /// Print the config file path
    Path,

    /// Store a secret in the system keyring
    SetSecret {
        kind: SecretArg,

        /// Read the value from this flag instead of prompting
        #[arg(long)]
        value: Option<String>,
    },

    /// Generate a payload encryption key
    GenKey {
        /// Store it in the keyring instead of printing it
        #[arg(long)]
        store: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SecretArg {
    ApiKey,
    EncryptionKey,
    HassToken,
}

impl From<SecretArg> for SecretKind {
    fn from(arg: SecretArg) -> Self {
        match arg {
            SecretArg::ApiKey => Self::ApiKey,
            SecretArg::EncryptionKey => Self::EncryptionKey,
            SecretArg::HassToken => Self::HassToken,
        }
    }
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    pub shell: clap_complete::Shell,
}
