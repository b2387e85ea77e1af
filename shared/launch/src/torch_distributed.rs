use gantry_core::{ClusterTopology, NodeEnv};
use tracing::info;

use crate::{command::LaunchCommand, entry::EntryPoint, launcher::BuildError};

/// Fixed c10d master port; rank zero's store binds here on every job.
pub(crate) const MASTER_PORT: u16 = 7777;

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
                strategy: "torch_distributed",
                entry: tokens.clone(),
            })
        }
    };

    info!(
        nodes = topology.host_count(),
        nproc_per_node = topology.processes_per_host(),
        "building torchrun command"
    );

    let mut command = LaunchCommand::new("torchrun", node.code_dir.clone());
    command
        .args(["--nnodes", &topology.host_count().to_string()])
        .args([
            "--nproc_per_node",
            &topology.processes_per_host().to_string(),
        ]);
    if topology.distributed() {
        command
            .args(["--master_addr", topology.master_host()])
            .args(["--master_port", &MASTER_PORT.to_string()])
            .args(["--node_rank", &topology.host_rank().to_string()]);
    }
    command
        .arg(script.display().to_string())
        .args(user_args.iter().cloned());

    Ok(command)
}
