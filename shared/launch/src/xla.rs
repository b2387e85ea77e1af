use std::process::Stdio;

use gantry_core::{ClusterTopology, NodeEnv};
use tracing::info;

use crate::{
    command::LaunchCommand,
    entry::EntryPoint,
    launcher::{BuildError, PYTHON},
    runner::RunError,
};

const SPAWN_MODULE: &str = "torch_xla.distributed.xla_spawn";

/// Port each host's local XRT service listens on.
const WORKER_PORT: u16 = 43857;

/// Port of the mesh master service on the master host.
const MESH_PORT: u16 = 53957;

pub(crate) fn build(
    topology: &ClusterTopology,
    node: &NodeEnv,
    entry: &EntryPoint,
    user_args: &[String],
) -> Result<LaunchCommand, BuildError> {
    let script = match entry {
        EntryPoint::Script(script) => script,
        EntryPoint::Command(tokens) => {
            return Err(BuildError::UnsupportedEntryPoint {
                strategy: "pytorch_xla",
                entry: tokens.clone(),
            })
        }
    };
    if node.gpu_count == 0 {
        return Err(BuildError::NoXlaDevices);
    }

    info!(
        host_ordinal = topology.host_rank(),
        world = topology.host_count(),
        "building XLA spawn command"
    );

    let workers: Vec<String> = topology
        .hosts()
        .iter()
        .enumerate()
        .map(|(ordinal, host)| format!("localservice:{ordinal};{host}:{WORKER_PORT}"))
        .collect();

    let mut command = LaunchCommand::new(PYTHON, node.code_dir.clone());
    command
        .env("XRT_HOST_ORDINAL", topology.host_rank().to_string())
        .env("XRT_SHARD_WORLD_SIZE", topology.host_count().to_string())
        .env("XRT_WORKERS", workers.join("|"))
        .env(
            "XRT_MESH_SERVICE",
            format!("{}:{MESH_PORT}", topology.master_host()),
        )
        .env("GPU_NUM_DEVICES", topology.processes_per_host().to_string());
    command
        .args(["-m", SPAWN_MODULE])
        .args(["--num_gpus", &topology.processes_per_host().to_string()])
        .arg(script.display().to_string())
        .args(user_args.iter().cloned());

    Ok(command)
}

/// Confirms the XLA runtime is importable before committing to a launch
/// whose failure mode would otherwise be an opaque spawn error deep in the
/// user's traceback.
pub(crate) async fn preflight() -> Result<(), RunError> {
    let status = tokio::process::Command::new(PYTHON)
        .args(["-c", &format!("import {SPAWN_MODULE}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|source| RunError::Spawn {
            program: PYTHON.to_string(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(RunError::Prerequisite(format!(
            "{SPAWN_MODULE} is not importable in this image; install the torch_xla wheel matching the container's torch build"
        )))
    }
}
