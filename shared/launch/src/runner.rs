use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use thiserror::Error;
use tracing::info;

use crate::command::LaunchCommand;

/// Shells report a child killed by SIGKILL as 128 + 9.
const SIGKILL_EXIT_CODE: i32 = 137;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub return_code: i32,
    pub captured_output: Option<String>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(
        "user script [{command_line}] exited with code {return_code}{}",
        exit_details(.extra_info, .stderr_tail)
    )]
    UserScriptExit {
        command_line: String,
        return_code: i32,
        extra_info: Option<String>,
        stderr_tail: Option<String>,
    },

    #[error(
        "user script [{command_line}] was killed by signal {signal}{}",
        exit_details(&None, .stderr_tail)
    )]
    KilledBySignal {
        command_line: String,
        signal: i32,
        stderr_tail: Option<String>,
    },

    #[error("failed while streaming process output: {0}")]
    Output(#[from] io::Error),

    #[error("{0}")]
    Prerequisite(String),
}

impl RunError {
    /// Exit code to propagate as the job's own, when the failure carries
    /// one.
    pub fn return_code(&self) -> Option<i32> {
        match self {
            RunError::UserScriptExit { return_code, .. } => Some(*return_code),
            _ => None,
        }
    }
}

fn exit_details(extra_info: &Option<String>, stderr_tail: &Option<String>) -> String {
    let mut details = String::new();
    if let Some(extra) = extra_info {
        details.push_str(", ");
        details.push_str(extra);
    }
    if let Some(tail) = stderr_tail {
        details.push('\n');
        details.push_str(tail);
    }
    details
}

/// Spawns the command with inherited stdio and waits for it. Errors keep
/// the exact command line so the job log names what actually ran.
pub async fn check_call(command: &LaunchCommand) -> Result<ProcessOutcome, RunError> {
    info!(command = %command, "executing");
    let mut child = command
        .as_tokio()
        .spawn()
        .map_err(|source| RunError::Spawn {
            program: command.program.clone(),
            source,
        })?;
    let status = child.wait().await?;
    outcome_from_status(status, command, None)
}

pub(crate) fn outcome_from_status(
    status: ExitStatus,
    command: &LaunchCommand,
    captured: Option<String>,
) -> Result<ProcessOutcome, RunError> {
    if status.success() {
        return Ok(ProcessOutcome {
            return_code: 0,
            captured_output: captured,
        });
    }
    if let Some(return_code) = status.code() {
        let extra_info = (return_code == SIGKILL_EXIT_CODE).then(|| {
            "the process received SIGKILL; on training hosts this is usually the kernel OOM killer"
                .to_string()
        });
        return Err(RunError::UserScriptExit {
            command_line: command.to_string(),
            return_code,
            extra_info,
            stderr_tail: captured,
        });
    }
    // no exit code on unix means the process died to a signal
    Err(RunError::KilledBySignal {
        command_line: command.to_string(),
        signal: status.signal().unwrap_or_default(),
        stderr_tail: captured,
    })
}
