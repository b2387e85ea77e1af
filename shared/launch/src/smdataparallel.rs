use gantry_core::{ClusterTopology, NodeEnv};
use tracing::info;

use crate::{
    command::LaunchCommand,
    entry::EntryPoint,
    launcher::{BuildError, PYTHON},
};

/// The data-parallel runtime owns rank placement on its supported
/// instances; they all carry eight GPUs.
const PROCESSES_PER_HOST: usize = 8;

/// Port the rendezvous server on the master listens on.
const SERVER_PORT: u16 = 7592;

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
                strategy: "smdataparallel",
                entry: tokens.clone(),
            })
        }
    };

    info!(
        hosts = topology.host_count(),
        "building smddprun command"
    );

    let mut command = LaunchCommand::new("smddprun", node.code_dir.clone());
    if topology.distributed() {
        command
            .arg("--homogeneous")
            .args(["--hosts", &topology.hosts().join(",")]);
        command
            .env("SMDATAPARALLEL_SERVER_ADDR", topology.master_host())
            .env("SMDATAPARALLEL_SERVER_PORT", SERVER_PORT.to_string());
    } else {
        command.arg("--single-node");
    }
    command
        .args(["--nproc-per-node", &PROCESSES_PER_HOST.to_string()])
        .arg(PYTHON)
        .arg(script.display().to_string())
        .args(user_args.iter().cloned());

    Ok(command)
}
