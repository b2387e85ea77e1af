use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use gantry_core::RunnerRole;
use gantry_rendezvous::{start_sshd, CompletionSignal, CompletionWait, ReadinessCoordinator};
use tracing::{error, info, warn};

use crate::cli::Resolved;

/// Runs one host's share of the job to completion. Master: confirm the
/// cluster, launch, signal completion. Worker: wait for the master, serve
/// ssh, wait for the completion sentinel.
pub async fn train(resolved: &Resolved, readiness_timeout: Duration) -> Result<()> {
    match resolved.topology.role() {
        RunnerRole::Master => run_master(resolved, readiness_timeout).await,
        RunnerRole::Worker => run_worker(resolved).await,
    }
}

async fn run_master(resolved: &Resolved, readiness_timeout: Duration) -> Result<()> {
    let topology = &resolved.topology;
    if topology.distributed() {
        start_sshd()?;
        ReadinessCoordinator::new(topology.clone())
            .with_worker_wait_timeout(readiness_timeout)
            .wait_for_workers()
            .await?;
    }

    let command = resolved.launcher.build_command(
        topology,
        &resolved.node,
        &resolved.entry,
        &resolved.user_args,
    )?;

    let result = resolved.launcher.run(&command, topology).await;

    // workers cannot see the launcher exit; tell them either way
    if topology.distributed() {
        CompletionSignal::new(topology.clone()).announce().await;
    }

    let outcome = result?;
    info!(return_code = outcome.return_code, "training finished");
    Ok(())
}

async fn run_worker(resolved: &Resolved) -> Result<()> {
    let topology = &resolved.topology;
    let coordinator = ReadinessCoordinator::new(topology.clone());
    coordinator.wait_for_master().await;
    start_sshd()?;

    match CompletionSignal::new(topology.clone()).wait().await {
        CompletionWait::Signaled => info!("master signaled completion"),
        CompletionWait::MasterGone => {
            warn!("giving up on the completion sentinel, exiting with the job's outcome unknown")
        }
    }
    Ok(())
}

/// Job-level failure marker the platform surfaces to the user. Best
/// effort: a marker that cannot be written must not mask the real error.
pub fn write_failure_marker(output_dir: &Path, message: &str) {
    let write = || -> Result<()> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;
        let path = output_dir.join("failure");
        std::fs::write(&path, message)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    };
    if let Err(err) = write() {
        error!("{err:#}");
    }
}
