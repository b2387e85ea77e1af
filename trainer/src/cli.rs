use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use gantry_core::{ClusterTopology, NodeEnv, CREDENTIAL_ENV_VARS};
use gantry_launch::{EntryPoint, Launcher, MpiOptions};
use gantry_logging::LogOutput;

/// Distributed-training strategy selected by the platform's job config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    Mpi,
    Smdataparallel,
    TorchDistributed,
    VanillaDdp,
    PytorchXla,
    Process,
}

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Cluster host list: comma-separated names or a JSON array (the
    /// platform injects the JSON form).
    #[clap(long, env = "GANTRY_HOSTS")]
    pub hosts: String,

    /// Name of this host. Must appear in the host list.
    #[clap(long, env = "GANTRY_CURRENT_HOST")]
    pub current_host: String,

    /// Host that drives the launch. Defaults to the first host in the list.
    #[clap(long, env = "GANTRY_MASTER_HOST")]
    pub master_host: Option<String>,

    /// Ranks per host. Defaults to the GPU count, or 1 on CPU-only hosts.
    #[clap(long, env = "GANTRY_PROCESSES_PER_HOST")]
    pub processes_per_host: Option<usize>,

    #[clap(long, env = "GANTRY_NETWORK_INTERFACE", default_value = "eth0")]
    pub network_interface: String,

    /// Platform instance type; gates interconnect-specific launcher flags.
    #[clap(long, env = "GANTRY_INSTANCE_TYPE")]
    pub instance_type: Option<String>,

    #[clap(long, env = "GANTRY_NUM_GPUS", default_value_t = 0)]
    pub num_gpus: usize,

    #[clap(long, env = "GANTRY_STRATEGY", value_enum)]
    pub strategy: Strategy,

    /// User entry point: a python script resolved against the code dir, or
    /// any other executable run as-is.
    #[clap(long, env = "GANTRY_ENTRY_POINT")]
    pub entry_point: String,

    #[clap(long, env = "GANTRY_CODE_DIR", default_value = "/opt/ml/code")]
    pub code_dir: PathBuf,

    #[clap(long, env = "GANTRY_OUTPUT_DIR", default_value = "/opt/ml/output")]
    pub output_dir: PathBuf,

    /// Extra mpirun tokens, whitespace-separated. `--NCCL_DEBUG <level>` is
    /// recognized; everything else passes through verbatim.
    #[clap(long, env = "GANTRY_MPI_CUSTOM_OPTIONS")]
    pub mpi_custom_options: Option<String>,

    /// Total MPI process count override.
    #[clap(long, env = "GANTRY_NUM_PROCESSES")]
    pub num_processes: Option<usize>,

    /// Deadline for the master's wait on worker reachability.
    #[clap(long, env = "GANTRY_READINESS_TIMEOUT_SECS", default_value_t = 3600)]
    pub readiness_timeout_secs: u64,

    #[clap(long, env = "GANTRY_LOG_OUTPUT", value_enum, default_value_t = LogOutput::Console)]
    pub log_output: LogOutput,

    /// Also append logs to this file.
    #[clap(long, env = "GANTRY_WRITE_LOG")]
    pub write_log: Option<PathBuf>,

    /// Arguments passed through to the user entry point, after `--`.
    #[clap(last = true)]
    pub user_args: Vec<String>,
}

/// Everything the trainer loop needs, resolved once. The process
/// environment is read exactly once, here; the rest of the run consumes
/// these snapshots.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub topology: ClusterTopology,
    pub node: NodeEnv,
    pub launcher: Launcher,
    pub entry: EntryPoint,
    pub user_args: Vec<String>,
}

impl TrainArgs {
    pub fn resolve(&self) -> Result<Resolved> {
        let hosts = parse_hosts(&self.hosts)
            .with_context(|| format!("failed to parse host list {:?}", self.hosts))?;
        let master_host = match &self.master_host {
            Some(master) => master.clone(),
            None => match hosts.first() {
                Some(first) => first.clone(),
                None => bail!("host list is empty"),
            },
        };
        let processes_per_host = self.processes_per_host.unwrap_or(self.num_gpus.max(1));
        let topology = ClusterTopology::new(
            hosts,
            master_host,
            self.current_host.clone(),
            processes_per_host,
            self.network_interface.clone(),
        )?;

        let forwarded_env = CREDENTIAL_ENV_VARS
            .iter()
            .filter(|name| std::env::var(name).is_ok())
            .map(|name| name.to_string())
            .collect();
        let node = NodeEnv::new(
            self.instance_type.clone(),
            self.num_gpus,
            forwarded_env,
            self.code_dir.clone(),
            self.output_dir.clone(),
        );

        let launcher = match self.strategy {
            Strategy::Mpi => Launcher::Mpi(MpiOptions {
                num_processes: self.num_processes,
                custom_options: self
                    .mpi_custom_options
                    .as_deref()
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            }),
            Strategy::Smdataparallel => Launcher::SmDataParallel,
            Strategy::TorchDistributed => Launcher::TorchDistributed,
            Strategy::VanillaDdp => Launcher::VanillaDdp,
            Strategy::PytorchXla => Launcher::PyTorchXla,
            Strategy::Process => Launcher::Process,
        };

        Ok(Resolved {
            topology,
            node,
            launcher,
            entry: EntryPoint::parse(&self.entry_point),
            user_args: self.user_args.clone(),
        })
    }
}

fn parse_hosts(raw: &str) -> Result<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(Into::into);
    }
    Ok(trimmed
        .split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect())
}
