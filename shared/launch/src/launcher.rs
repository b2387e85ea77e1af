use gantry_core::{ClusterTopology, NodeEnv};
use thiserror::Error;

use crate::{
    command::LaunchCommand,
    entry::EntryPoint,
    mpi::{self, MpiOptions},
    runner::{self, ProcessOutcome, RunError},
    smdataparallel, torch_distributed, vanilla_ddp, watcher, xla,
};

/// Interpreter the container contract guarantees on PATH.
pub const PYTHON: &str = "python";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("the {strategy} launcher only supports python script entry points, got {entry:?}")]
    UnsupportedEntryPoint {
        strategy: &'static str,
        entry: Vec<String>,
    },

    #[error("no GPUs visible on this host, the XLA launcher needs at least one device")]
    NoXlaDevices,
}

/// Every way this runtime knows how to start user code. Selecting a
/// variant selects both the command shape and the run mode; adding one
/// means teaching every match below about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    Mpi(MpiOptions),
    SmDataParallel,
    TorchDistributed,
    VanillaDdp,
    PyTorchXla,
    Process,
}

impl Launcher {
    pub fn name(&self) -> &'static str {
        match self {
            Launcher::Mpi(_) => "mpi",
            Launcher::SmDataParallel => "smdataparallel",
            Launcher::TorchDistributed => "torch_distributed",
            Launcher::VanillaDdp => "vanilla_ddp",
            Launcher::PyTorchXla => "pytorch_xla",
            Launcher::Process => "process",
        }
    }

    /// Builds the full launch invocation for this strategy. Pure: the same
    /// topology, node snapshot, entry point and arguments always produce a
    /// token-identical command.
    pub fn build_command(
        &self,
        topology: &ClusterTopology,
        node: &NodeEnv,
        entry: &EntryPoint,
        user_args: &[String],
    ) -> Result<LaunchCommand, BuildError> {
        match self {
            Launcher::Mpi(options) => mpi::build(topology, node, entry, user_args, options),
            Launcher::SmDataParallel => smdataparallel::build(topology, node, entry, user_args),
            Launcher::TorchDistributed => torch_distributed::build(topology, node, entry, user_args),
            Launcher::VanillaDdp => vanilla_ddp::build(topology, node, entry, user_args),
            Launcher::PyTorchXla => xla::build(topology, node, entry, user_args),
            Launcher::Process => Ok(plain_command(node, entry, user_args)),
        }
    }

    /// Runs a built command to completion. Distributed strategies stream
    /// their output through the watcher so rank tags get relabeled; the
    /// plain process strategy blocks on the child with inherited stdio.
    /// XLA additionally verifies its runtime is importable before
    /// committing to the launch.
    pub async fn run(
        &self,
        command: &LaunchCommand,
        topology: &ClusterTopology,
    ) -> Result<ProcessOutcome, RunError> {
        match self {
            Launcher::Process => runner::check_call(command).await,
            Launcher::PyTorchXla => {
                xla::preflight().await?;
                watcher::watch(command, topology).await
            }
            Launcher::Mpi(_)
            | Launcher::SmDataParallel
            | Launcher::TorchDistributed
            | Launcher::VanillaDdp => watcher::watch(command, topology).await,
        }
    }
}

/// The undistributed invocation: scripts go through the interpreter,
/// opaque commands run verbatim. Also the fallback shape other strategies
/// degrade to.
pub(crate) fn plain_command(
    node: &NodeEnv,
    entry: &EntryPoint,
    user_args: &[String],
) -> LaunchCommand {
    let mut command = match entry {
        EntryPoint::Script(script) => {
            let mut command = LaunchCommand::new(PYTHON, node.code_dir.clone());
            command.arg(script.display().to_string());
            command
        }
        EntryPoint::Command(tokens) => {
            let mut command = LaunchCommand::new(&tokens[0], node.code_dir.clone());
            command.args(tokens[1..].iter().cloned());
            command
        }
    };
    command.args(user_args.iter().cloned());
    command
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;

    fn node() -> NodeEnv {
        NodeEnv::new(
            None,
            0,
            vec![],
            PathBuf::from("/opt/ml/code"),
            PathBuf::from("/opt/ml/output"),
        )
    }

    fn topology() -> ClusterTopology {
        ClusterTopology::new(
            vec!["algo-1".to_string(), "algo-2".to_string()],
            "algo-1",
            "algo-1",
            2,
            "eth0",
        )
        .unwrap()
    }

    #[test]
    fn test_process_wraps_script_in_interpreter() {
        let command = Launcher::Process
            .build_command(
                &topology(),
                &node(),
                &EntryPoint::Script(PathBuf::from("train.py")),
                &["--epochs".to_string(), "3".to_string()],
            )
            .unwrap();
        assert_eq!(command.tokens(), vec!["python", "train.py", "--epochs", "3"]);
        assert_eq!(command.cwd, PathBuf::from("/opt/ml/code"));
    }

    #[test]
    fn test_process_runs_opaque_command_verbatim() {
        let command = Launcher::Process
            .build_command(
                &topology(),
                &node(),
                &EntryPoint::Command(vec!["run_all.sh".to_string(), "-v".to_string()]),
                &[],
            )
            .unwrap();
        assert_eq!(command.tokens(), vec!["run_all.sh", "-v"]);
    }

    #[test]
    fn test_vanilla_ddp_degrades_to_plain_run_for_commands() {
        let entry = EntryPoint::Command(vec!["run_all.sh".to_string()]);
        let wrapped = Launcher::VanillaDdp
            .build_command(&topology(), &node(), &entry, &[])
            .unwrap();
        let plain = Launcher::Process
            .build_command(&topology(), &node(), &entry, &[])
            .unwrap();
        assert_eq!(wrapped, plain);
    }

    #[tokio::test]
    async fn test_process_strategy_runs_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = LaunchCommand::new("sh", dir.path().to_path_buf());
        command.args(["-c", "true"]);
        let outcome = Launcher::Process
            .run(&command, &topology())
            .await
            .unwrap();
        assert_eq!(outcome.return_code, 0);
        assert_eq!(outcome.captured_output, None);
    }

    #[tokio::test]
    async fn test_process_strategy_failure_keeps_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = LaunchCommand::new("sh", dir.path().to_path_buf());
        command.args(["-c", "exit 7"]);
        let err = Launcher::Process
            .run(&command, &topology())
            .await
            .unwrap_err();
        match err {
            RunError::UserScriptExit { return_code, .. } => assert_eq!(return_code, 7),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let entry = EntryPoint::Script(PathBuf::from("train.py"));
        let args = vec!["--lr".to_string(), "0.01".to_string()];
        let node = NodeEnv::new(
            Some("ml.p4d.24xlarge".to_string()),
            8,
            vec!["AWS_ACCESS_KEY_ID".to_string()],
            PathBuf::from("/opt/ml/code"),
            PathBuf::from("/opt/ml/output"),
        );
        for launcher in [
            Launcher::Mpi(MpiOptions::default()),
            Launcher::SmDataParallel,
            Launcher::TorchDistributed,
            Launcher::VanillaDdp,
            Launcher::PyTorchXla,
            Launcher::Process,
        ] {
            let first = launcher
                .build_command(&topology(), &node, &entry, &args)
                .unwrap();
            let second = launcher
                .build_command(&topology(), &node, &entry, &args)
                .unwrap();
            assert_eq!(first, second, "{} build must be deterministic", launcher.name());
        }
    }
}
