// ── Inbound command listener ──
//
// Commands from every cloud session funnel into one worker, so they are
// applied one at a time in arrival order. Per command:
//
//   1. authorize against the registry (read guard held to the end)
//   2. claim the command id in the ledger, or replay its recorded result
//   3. translate to a host action and invoke it under a timeout
//   4. record the result, then report it
//
// Unauthorized commands are answered but never recorded, so exposing the
// entity later and redelivering the command works as expected.

use std::sync::Arc;
use std::time::Duration;

use direktive_api::CloudMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::convert::{result_to_wire, translate};
use crate::error::CoreError;
use crate::host::HostPlatform;
use crate::ledger::{CommandLedger, LedgerDecision};
use crate::model::{Capability, CommandMessage, CommandResult, FailureKind};
use crate::registry::ExposureRegistry;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// A command waiting for the worker, with the session to answer on.
#[derive(Debug)]
pub struct CommandJob {
    pub command: CommandMessage,
    pub reply: mpsc::Sender<CloudMessage>,
}

pub struct CommandListener {
    registry: Arc<ExposureRegistry>,
    ledger: CommandLedger,
    host: Arc<dyn HostPlatform>,
    action_timeout: Duration,
}

impl CommandListener {
    pub fn new(
        registry: Arc<ExposureRegistry>,
        ledger: CommandLedger,
        host: Arc<dyn HostPlatform>,
        action_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            ledger,
            host,
            action_timeout,
        }
    }

    /// Apply one command and produce the result to report.
    ///
    /// An `Err` means the ledger could not be consulted; nothing was
    /// invoked and nothing should be reported, so the cloud redelivers.
    pub async fn handle(&self, command: &CommandMessage) -> Result<CommandResult, CoreError> {
        let snapshot = self.registry.read().await;

        let entity = match snapshot.get_raw(&command.entity_id) {
            Some(entity) if entity.allows(Capability::CommandAccept) => entity,
            _ => {
                let err = CoreError::NotAuthorized {
                    entity_id: command.entity_id.clone(),
                    capability: Capability::CommandAccept,
                };
                warn!(command_id = %command.command_id, "Rejected command for unexposed entity");
                return Ok(CommandResult::failure(
                    &command.command_id,
                    FailureKind::NotAuthorized,
                    err.to_string(),
                ));
            }
        };

        if let LedgerDecision::Replay(previous) = self.ledger.begin(&command.command_id)? {
            debug!(command_id = %command.command_id, "Duplicate command, not reapplied");
            return Ok(previous);
        }

        let result = match translate(entity, command) {
            Err(e) => CommandResult::failure(
                &command.command_id,
                FailureKind::InvalidCommand,
                e.to_string(),
            ),
            Ok(call) => {
                let service = format!("{}.{}", call.domain, call.service);
                let invoked =
                    tokio::time::timeout(self.action_timeout, self.host.call_service(call)).await;
                match invoked {
                    Ok(Ok(())) => {
                        info!(
                            command_id = %command.command_id,
                            entity_id = %entity.entity_id,
                            service,
                            "Command applied"
                        );
                        CommandResult::success(&command.command_id)
                    }
                    Ok(Err(e)) => {
                        warn!(
                            command_id = %command.command_id,
                            service,
                            error = %e,
                            "Host rejected command"
                        );
                        CommandResult::failure(
                            &command.command_id,
                            FailureKind::ActionFailed,
                            e.to_string(),
                        )
                    }
                    Err(_) => {
                        warn!(command_id = %command.command_id, service, "Host action timed out");
                        let secs = self.action_timeout.as_secs();
                        CommandResult::failure(
                            &command.command_id,
                            FailureKind::Timeout,
                            format!("no response from host within {secs}s"),
                        )
                    }
                }
            }
        };

        if let Err(e) = self.ledger.complete(&result) {
            error!(command_id = %command.command_id, error = %e, "Failed to record command result");
        }
        drop(snapshot);
        Ok(result)
    }

    /// Worker loop: apply jobs in order until cancelled or every sender is gone.
    pub async fn run(self, mut jobs: mpsc::Receiver<CommandJob>, cancel: CancellationToken) {
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = prune.tick() => {
                    if let Err(e) = self.ledger.prune() {
                        warn!(error = %e, "Command ledger prune failed");
                    }
                }
                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    match self.handle(&job.command).await {
                        Ok(result) => {
                            let message = CloudMessage::CommandResult(result_to_wire(&result));
                            if job.reply.send(message).await.is_err() {
                                debug!(
                                    command_id = %job.command.command_id,
                                    "Session closed before result was sent"
                                );
                            }
                        }
                        Err(e) => {
                            error!(
                                command_id = %job.command.command_id,
                                error = %e,
                                "Command not processed"
                            );
                        }
                    }
                }
            }
        }
        debug!("Command worker stopped");
    }
}
