use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::info;

const SSHD_PATH: &str = "/usr/sbin/sshd";

#[derive(Debug, Error)]
pub enum SshdError {
    #[error(
        "no ssh daemon at {path}; multi-host training needs an OpenSSH server installed in the image"
    )]
    Missing { path: String },

    #[error("failed to start {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Starts the host's ssh daemon and leaves it running for the life of the
/// container. Peers poll port 22 themselves, so there is no need to wait
/// for it to come up here. A missing daemon is fatal and never retried.
pub fn start_sshd() -> Result<(), SshdError> {
    start_sshd_at(SSHD_PATH)
}

fn start_sshd_at(path: &str) -> Result<(), SshdError> {
    if !Path::new(path).exists() {
        return Err(SshdError::Missing {
            path: path.to_string(),
        });
    }
    // -D keeps it in the foreground; the daemon outlives the dropped
    // handle and nothing ever awaits it
    let child = tokio::process::Command::new(path)
        .arg("-D")
        .spawn()
        .map_err(|source| SshdError::Spawn {
            path: path.to_string(),
            source,
        })?;
    info!(pid = ?child.id(), "sshd started");
    Ok(())
}
