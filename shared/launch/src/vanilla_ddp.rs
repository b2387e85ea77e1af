use gantry_core::{ClusterTopology, NodeEnv};
use tracing::{info, warn};

use crate::{
    command::LaunchCommand,
    entry::EntryPoint,
    launcher::{plain_command, BuildError, PYTHON},
    torch_distributed::MASTER_PORT,
};

/// Launcher module shipped before torchrun existed. Jobs pinned to old
/// torch builds still select it.
const LAUNCH_MODULE: &str = "torch.distributed.launch";

pub(crate) fn build(
    topology: &ClusterTopology,
    node: &NodeEnv,
    entry: &EntryPoint,
    user_args: &[String],
) -> Result<LaunchCommand, BuildError> {
    let script = match entry {
        EntryPoint::Script(script) => script,
        EntryPoint::Command(tokens) => {
            // the legacy wrapper only handles python scripts; anything
            // else runs unwrapped rather than failing the job
            warn!(
                command = ?tokens,
                "vanilla DDP launcher only wraps python scripts, running unwrapped"
            );
            return Ok(plain_command(node, entry, user_args));
        }
    };

    info!(
        nodes = topology.host_count(),
        nproc_per_node = topology.processes_per_host(),
        "building legacy DDP launch command"
    );

    let mut command = LaunchCommand::new(PYTHON, node.code_dir.clone());
    command
        .args(["-m", LAUNCH_MODULE])
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
