use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("cluster host list is empty")]
    EmptyHosts,

    #[error("master host \"{master}\" is not in the cluster host list {hosts:?}")]
    MasterNotInCluster { master: String, hosts: Vec<String> },

    #[error("current host \"{current}\" is not in the cluster host list {hosts:?}")]
    CurrentHostNotInCluster { current: String, hosts: Vec<String> },

    #[error("processes per host must be at least 1")]
    ZeroProcessesPerHost,
}

/// Which side of the rendezvous this host drives. Derived once from the
/// topology, never stored or re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerRole {
    Master,
    Worker,
}

impl fmt::Display for RunnerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerRole::Master => write!(f, "master"),
            RunnerRole::Worker => write!(f, "worker"),
        }
    }
}

/// Immutable description of the training cluster as resolved at startup:
/// every participating host, which of them coordinates the launch, which
/// one we are, and how many ranks each host runs.
///
/// Validated at construction; everything else in the launch path takes it
/// by reference and derives what it needs instead of consulting ambient
/// state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    hosts: Vec<String>,
    master_host: String,
    current_host: String,
    processes_per_host: usize,
    network_interface: String,
}

impl ClusterTopology {
    pub fn new(
        hosts: Vec<String>,
        master_host: impl Into<String>,
        current_host: impl Into<String>,
        processes_per_host: usize,
        network_interface: impl Into<String>,
    ) -> Result<Self, TopologyError> {
        let master_host = master_host.into();
        let current_host = current_host.into();

        if hosts.is_empty() {
            return Err(TopologyError::EmptyHosts);
        }
        if !hosts.contains(&master_host) {
            return Err(TopologyError::MasterNotInCluster {
                master: master_host,
                hosts,
            });
        }
        if !hosts.contains(&current_host) {
            return Err(TopologyError::CurrentHostNotInCluster {
                current: current_host,
                hosts,
            });
        }
        if processes_per_host == 0 {
            return Err(TopologyError::ZeroProcessesPerHost);
        }

        Ok(Self {
            hosts,
            master_host,
            current_host,
            processes_per_host,
            network_interface: network_interface.into(),
        })
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn master_host(&self) -> &str {
        &self.master_host
    }

    pub fn current_host(&self) -> &str {
        &self.current_host
    }

    pub fn processes_per_host(&self) -> usize {
        self.processes_per_host
    }

    pub fn network_interface(&self) -> &str {
        &self.network_interface
    }

    pub fn role(&self) -> RunnerRole {
        if self.current_host == self.master_host {
            RunnerRole::Master
        } else {
            RunnerRole::Worker
        }
    }

    pub fn is_master(&self) -> bool {
        self.role() == RunnerRole::Master
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// True when the job spans more than one host. Single-host jobs skip
    /// the rendezvous entirely and omit multi-host launcher flags.
    pub fn distributed(&self) -> bool {
        self.hosts.len() > 1
    }

    /// 0-based position of the current host in the host list, used as the
    /// node rank by the torch launchers and the XLA host ordinal.
    pub fn host_rank(&self) -> usize {
        self.hosts
            .iter()
            .position(|h| h == &self.current_host)
            .unwrap_or(0)
    }

    pub fn world_size(&self) -> usize {
        self.processes_per_host * self.hosts.len()
    }

    /// All hosts except the master, in host-list order.
    pub fn workers(&self) -> impl Iterator<Item = &str> {
        self.hosts
            .iter()
            .filter(move |h| *h != &self.master_host)
            .map(String::as_str)
    }

    /// Host owning a given global rank under block assignment: ranks
    /// 0..ppn live on hosts[0], the next ppn on hosts[1], and so on.
    pub fn host_for_rank(&self, global_rank: usize) -> Option<&str> {
        self.hosts
            .get(global_rank / self.processes_per_host)
            .map(String::as_str)
    }
}
