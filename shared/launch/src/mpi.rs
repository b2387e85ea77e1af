use gantry_core::{ClusterTopology, NodeEnv};
use tracing::{debug, info};

use crate::{
    command::LaunchCommand,
    entry::EntryPoint,
    launcher::{BuildError, PYTHON},
};

/// Instance types wired with the EFA interconnect; only these get the
/// libfabric provider flags.
const EFA_INSTANCE_TYPES: [&str; 4] = [
    "ml.p3dn.24xlarge",
    "ml.p4d.24xlarge",
    "ml.p4de.24xlarge",
    "ml.trn1.32xlarge",
];

/// Subset of EFA instances whose NICs support GPUDirect RDMA.
const EFA_DEVICE_RDMA_INSTANCE_TYPES: [&str; 2] = ["ml.p4d.24xlarge", "ml.p4de.24xlarge"];

const DEFAULT_NCCL_DEBUG: &str = "INFO";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MpiOptions {
    /// Total process count. Defaults to processes-per-host times the
    /// number of hosts.
    pub num_processes: Option<usize>,
    /// Raw extra mpirun tokens supplied by the job config. One token is
    /// recognized and consumed (`--NCCL_DEBUG <level>`); the rest pass
    /// through verbatim.
    pub custom_options: Vec<String>,
}

pub(crate) fn build(
    topology: &ClusterTopology,
    node: &NodeEnv,
    entry: &EntryPoint,
    user_args: &[String],
    options: &MpiOptions,
) -> Result<LaunchCommand, BuildError> {
    let num_processes = options
        .num_processes
        .unwrap_or_else(|| topology.world_size());
    let (nccl_debug, passthrough) = split_custom_options(&options.custom_options);
    let interface = topology.network_interface();

    info!(
        num_processes,
        hosts = topology.host_count(),
        "building mpirun command"
    );

    let mut command = LaunchCommand::new("mpirun", node.code_dir.clone());
    command
        .args(["--host", &host_list(topology)])
        .args(["-np", &num_processes.to_string()])
        .arg("--allow-run-as-root")
        .arg("--display-map")
        .arg("--tag-output")
        .args(["-mca", "btl_tcp_if_include", interface])
        .args(["-mca", "oob_tcp_if_include", interface])
        .args(["-mca", "plm_rsh_no_tree_spawn", "1"])
        .args(["-bind-to", "none"])
        .args(["-map-by", "slot"])
        .args(["-mca", "pml", "ob1"])
        .args(["-mca", "btl", "^openib"])
        .args(["-mca", "orte_abort_on_non_zero_status", "1"])
        .args(["-mca", "btl_vader_single_copy_mechanism", "none"])
        .args(["-x", &format!("NCCL_SOCKET_IFNAME={interface}")])
        .args(["-x", &format!("NCCL_DEBUG={nccl_debug}")])
        .args(["-x", "LD_LIBRARY_PATH"])
        .args(["-x", "PATH"]);

    for name in &node.forwarded_env {
        command.args(["-x", name]);
    }

    command.args(passthrough);

    if let Some(instance_type) = node.instance_type.as_deref() {
        if EFA_INSTANCE_TYPES.contains(&instance_type) {
            debug!(instance_type, "enabling EFA provider");
            command.args(["-x", "FI_PROVIDER=efa"]);
            if EFA_DEVICE_RDMA_INSTANCE_TYPES.contains(&instance_type) {
                command.args(["-x", "FI_EFA_USE_DEVICE_RDMA=1"]);
            }
        }
    }

    match entry {
        EntryPoint::Script(script) => {
            command.arg(PYTHON).arg(script.display().to_string());
        }
        EntryPoint::Command(tokens) => {
            command.args(tokens.iter().cloned());
        }
    }
    command.args(user_args.iter().cloned());

    Ok(command)
}

/// `algo-1,algo-2` when each host runs one rank, `algo-1:2,algo-2:2` when
/// hosts carry slot counts.
fn host_list(topology: &ClusterTopology) -> String {
    let ppn = topology.processes_per_host();
    let annotated: Vec<String> = topology
        .hosts()
        .iter()
        .map(|host| {
            if ppn == 1 {
                host.clone()
            } else {
                format!("{host}:{ppn}")
            }
        })
        .collect();
    annotated.join(",")
}

/// Splits the job's raw mpirun options into the recognized debug-verbosity
/// setting and the tokens forwarded untouched. Accepts both
/// `--NCCL_DEBUG WARN` and `--NCCL_DEBUG=WARN`.
fn split_custom_options(tokens: &[String]) -> (String, Vec<String>) {
    let mut nccl_debug = DEFAULT_NCCL_DEBUG.to_string();
    let mut passthrough = Vec::new();
    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        if let Some(level) = token.strip_prefix("--NCCL_DEBUG=") {
            nccl_debug = level.to_string();
        } else if token == "--NCCL_DEBUG" {
            if let Some(level) = iter.next() {
                nccl_debug = level.clone();
            }
        } else {
            passthrough.push(token.clone());
        }
    }
    (nccl_debug, passthrough)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;

    fn node(instance_type: Option<&str>, forwarded: &[&str]) -> NodeEnv {
        NodeEnv::new(
            instance_type.map(str::to_string),
            8,
            forwarded.iter().map(|s| s.to_string()).collect(),
            PathBuf::from("/opt/ml/code"),
            PathBuf::from("/opt/ml/output"),
        )
    }

    fn topology(hosts: &[&str], ppn: usize) -> ClusterTopology {
        ClusterTopology::new(
            hosts.iter().map(|s| s.to_string()).collect(),
            hosts[0],
            hosts[0],
            ppn,
            "eth0",
        )
        .unwrap()
    }

    fn build_tokens(topology: &ClusterTopology, node: &NodeEnv, options: &MpiOptions) -> Vec<String> {
        build(
            topology,
            node,
            &EntryPoint::Script(PathBuf::from("train.py")),
            &[],
            options,
        )
        .unwrap()
        .tokens()
    }

    fn window(tokens: &[String], needle: &[&str]) -> bool {
        tokens
            .windows(needle.len())
            .any(|w| w.iter().map(String::as_str).eq(needle.iter().copied()))
    }

    #[test]
    fn test_two_hosts_two_ranks_each() {
        let tokens = build_tokens(
            &topology(&["algo-1", "algo-2"], 2),
            &node(None, &[]),
            &MpiOptions::default(),
        );
        assert!(window(&tokens, &["-np", "4"]));
        assert!(window(&tokens, &["--host", "algo-1:2,algo-2:2"]));
        assert!(window(&tokens, &["-mca", "orte_abort_on_non_zero_status", "1"]));
        assert!(window(&tokens, &["-mca", "btl_vader_single_copy_mechanism", "none"]));
        assert!(window(&tokens, &["-x", "NCCL_SOCKET_IFNAME=eth0"]));
        assert_eq!(tokens.last().unwrap(), "train.py");
    }

    #[test]
    fn test_single_rank_hosts_are_unannotated() {
        let tokens = build_tokens(
            &topology(&["algo-1", "algo-2"], 1),
            &node(None, &[]),
            &MpiOptions::default(),
        );
        assert!(window(&tokens, &["--host", "algo-1,algo-2"]));
        assert!(window(&tokens, &["-np", "2"]));
    }

    #[test]
    fn test_single_host_list_is_just_that_host() {
        let bare = build_tokens(
            &topology(&["algo-1"], 1),
            &node(None, &[]),
            &MpiOptions::default(),
        );
        assert!(window(&bare, &["--host", "algo-1"]));
        assert!(window(&bare, &["-np", "1"]));

        let slotted = build_tokens(
            &topology(&["algo-1"], 2),
            &node(None, &[]),
            &MpiOptions::default(),
        );
        assert!(window(&slotted, &["--host", "algo-1:2"]));
    }

    #[test]
    fn test_process_count_override() {
        let tokens = build_tokens(
            &topology(&["algo-1", "algo-2"], 2),
            &node(None, &[]),
            &MpiOptions {
                num_processes: Some(3),
                custom_options: vec![],
            },
        );
        assert!(window(&tokens, &["-np", "3"]));
    }

    #[test]
    fn test_custom_options_set_verbosity_and_pass_through() {
        let tokens = build_tokens(
            &topology(&["algo-1"], 1),
            &node(None, &[]),
            &MpiOptions {
                num_processes: None,
                custom_options: vec![
                    "--NCCL_DEBUG".to_string(),
                    "WARN".to_string(),
                    "--verbose".to_string(),
                ],
            },
        );
        assert!(window(&tokens, &["-x", "NCCL_DEBUG=WARN"]));
        assert!(tokens.contains(&"--verbose".to_string()));
        assert!(!tokens.contains(&"--NCCL_DEBUG".to_string()));
    }

    #[test]
    fn test_custom_options_equals_form() {
        let (nccl_debug, passthrough) =
            split_custom_options(&["--NCCL_DEBUG=TRACE".to_string(), "-q".to_string()]);
        assert_eq!(nccl_debug, "TRACE");
        assert_eq!(passthrough, vec!["-q".to_string()]);
    }

    #[test]
    fn test_default_verbosity() {
        let tokens = build_tokens(
            &topology(&["algo-1"], 1),
            &node(None, &[]),
            &MpiOptions::default(),
        );
        assert!(window(&tokens, &["-x", "NCCL_DEBUG=INFO"]));
    }

    #[test]
    fn test_efa_flags_gated_on_instance_type() {
        let efa = build_tokens(
            &topology(&["algo-1"], 1),
            &node(Some("ml.p4d.24xlarge"), &[]),
            &MpiOptions::default(),
        );
        assert!(window(&efa, &["-x", "FI_PROVIDER=efa"]));
        assert!(window(&efa, &["-x", "FI_EFA_USE_DEVICE_RDMA=1"]));

        let rdma_less = build_tokens(
            &topology(&["algo-1"], 1),
            &node(Some("ml.trn1.32xlarge"), &[]),
            &MpiOptions::default(),
        );
        assert!(window(&rdma_less, &["-x", "FI_PROVIDER=efa"]));
        assert!(!window(&rdma_less, &["-x", "FI_EFA_USE_DEVICE_RDMA=1"]));

        let plain = build_tokens(
            &topology(&["algo-1"], 1),
            &node(Some("ml.c5.xlarge"), &[]),
            &MpiOptions::default(),
        );
        assert!(!window(&plain, &["-x", "FI_PROVIDER=efa"]));
    }

    #[test]
    fn test_credentials_forwarded_when_present() {
        let tokens = build_tokens(
            &topology(&["algo-1"], 1),
            &node(None, &["AWS_ACCESS_KEY_ID", "AWS_SESSION_TOKEN"]),
            &MpiOptions::default(),
        );
        assert!(window(&tokens, &["-x", "AWS_ACCESS_KEY_ID"]));
        assert!(window(&tokens, &["-x", "AWS_SESSION_TOKEN"]));
        assert!(!window(&tokens, &["-x", "AWS_SECRET_ACCESS_KEY"]));
    }

    #[test]
    fn test_opaque_command_entry_runs_under_mpirun() {
        let command = build(
            &topology(&["algo-1"], 1),
            &node(None, &[]),
            &EntryPoint::Command(vec!["run_all.sh".to_string()]),
            &["--fast".to_string()],
            &MpiOptions::default(),
        )
        .unwrap();
        let tokens = command.tokens();
        let tail = &tokens[tokens.len() - 2..];
        assert_eq!(tail, ["run_all.sh", "--fast"]);
        assert!(!tokens.contains(&PYTHON.to_string()));
    }
}
