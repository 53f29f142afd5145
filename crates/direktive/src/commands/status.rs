use direktive_core::StoredSummary;

use crate::cli::GlobalOpts;
use crate::commands::{load_config, open_store, storage};
use crate::error::CliError;
use crate::output;

pub fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = load_config(global)?;
    let store = open_store(&cfg)?.ok_or_else(|| CliError::NoState {
        path: cfg.state_dir().display().to_string(),
    })?;
    let summary = store.summary().map_err(storage)?;

    let out = output::render_single(global.output, &summary, detail)?;
    output::print_output(&out, global.quiet);
    Ok(())
}

fn detail(s: &StoredSummary) -> Vec<(&'static str, String)> {
    vec![
        ("Registry version", s.registry_version.to_string()),
        ("Exposed entities", s.exposed_entities.to_string()),
        ("Connection epoch", s.cursor.connection_epoch.to_string()),
        ("Last acked seq", s.cursor.last_acked_seq.to_string()),
        ("Last assigned seq", s.last_assigned_seq.to_string()),
        ("Backlog", s.backlog_len.to_string()),
        ("Pending notices", s.pending_notices.to_string()),
        ("Applied commands", s.applied_commands.to_string()),
        (
            "Registered",
            if s.instance_registered { "yes" } else { "no" }.into(),
        ),
    ]
}
