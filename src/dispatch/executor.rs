//! Agent execution — the collaborator that actually works a claimed ticket.
//!
//! The worker loop owns the lease; an executor only runs the agent and
//! reports how it ended. Dropping the `execute` future must stop the agent.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::board::model::{AgentVariant, Claim, RunFinalize};

/// Maximum summary length kept from agent output.
const MAX_SUMMARY_CHARS: usize = 2000;

/// Runs an agent against a claimed ticket.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, claim: &Claim, variant: AgentVariant) -> RunFinalize;
}

/// Runs a shell command per ticket with the claim exported as environment.
///
/// Exit code 0 finishes the run; anything else is an error.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn build(&self, claim: &Claim, variant: AgentVariant) -> Command {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", self.command.as_str()]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", self.command.as_str()]);
            c
        };

        let ticket = &claim.ticket;
        command
            .env("AGENT_BOARD_TICKET_ID", ticket.id.to_string())
            .env("AGENT_BOARD_RUN_ID", claim.run_id.to_string())
            .env("AGENT_BOARD_TICKET_TITLE", &ticket.title)
            .env(
                "AGENT_BOARD_TICKET_DESCRIPTION",
                ticket.description.as_deref().unwrap_or_default(),
            )
            .env("AGENT_BOARD_AGENT_VARIANT", variant.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(project) = &ticket.project_id {
            command.env("AGENT_BOARD_PROJECT_ID", project);
        }
        command
    }
}

/// Keep the tail of the output; the end of a log is where the verdict is.
fn summarize(output: &str) -> String {
    let trimmed = output.trim();
    let count = trimmed.chars().count();
    if count <= MAX_SUMMARY_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - MAX_SUMMARY_CHARS).collect()
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn execute(&self, claim: &Claim, variant: AgentVariant) -> RunFinalize {
        debug!(run_id = %claim.run_id, command = %self.command, "Starting agent command");
        let output = match self.build(claim, variant).output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(run_id = %claim.run_id, error = %e, "Failed to spawn agent command");
                return RunFinalize::error(None, format!("Failed to spawn command: {e}"));
            }
        };

        let code = output.status.code();
        if output.status.success() {
            RunFinalize::finished(code, summarize(&String::from_utf8_lossy(&output.stdout)))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let text = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&output.stdout).into_owned()
            } else {
                stderr.into_owned()
            };
            RunFinalize::error(code, summarize(&text))
        }
    }
}
