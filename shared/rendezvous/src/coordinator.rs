use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use gantry_core::ClusterTopology;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::probe::{can_connect, SSH_PORT};

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_WORKER_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Probes per progress log line while waiting on the master.
const WAIT_LOG_EVERY: usize = 60;

#[derive(Debug, Error)]
#[error("timed out after {waited:?} waiting for workers on port 22; still unreachable: {pending:?}")]
pub struct WorkersTimeout {
    pub waited: Duration,
    pub pending: Vec<String>,
}

/// Pre-launch readiness handshake over the cluster's ssh control plane.
/// The distributed launcher fans out from the master over ssh, so the
/// master confirms every worker before starting; a worker only ever needs
/// the master.
pub struct ReadinessCoordinator {
    topology: ClusterTopology,
    ssh_port: u16,
    probe_interval: Duration,
    worker_wait_timeout: Duration,
}

impl ReadinessCoordinator {
    pub fn new(topology: ClusterTopology) -> Self {
        Self {
            topology,
            ssh_port: SSH_PORT,
            probe_interval: PROBE_INTERVAL,
            worker_wait_timeout: DEFAULT_WORKER_WAIT_TIMEOUT,
        }
    }

    pub fn with_worker_wait_timeout(mut self, timeout: Duration) -> Self {
        self.worker_wait_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Worker side: block until the master answers on the ssh port. No
    /// deadline here; the master owns the only timeout in the handshake.
    pub async fn wait_for_master(&self) {
        let master = self.topology.master_host();
        info!(master, "waiting for master to accept connections");
        let mut probes = 0usize;
        while !self.master_reachable_within(WAIT_LOG_EVERY).await {
            probes += WAIT_LOG_EVERY;
            info!(master, probes, "master not reachable yet");
        }
        info!(master, "master is reachable");
    }

    /// Bounded slice of the master wait: up to `max_attempts` probes, one
    /// probe interval apart. The unbounded wait above is built out of
    /// these.
    pub async fn master_reachable_within(&self, max_attempts: usize) -> bool {
        for attempt in 0..max_attempts {
            if can_connect(self.topology.master_host(), self.ssh_port).await {
                return true;
            }
            if attempt + 1 < max_attempts {
                sleep(self.probe_interval).await;
            }
        }
        false
    }

    /// Master side: every worker must accept a connection before the
    /// launcher starts. One deadline covers the whole phase regardless of
    /// cluster size.
    pub async fn wait_for_workers(&self) -> Result<(), WorkersTimeout> {
        if !self.topology.distributed() {
            return Ok(());
        }
        let confirmed: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
        let poll_all = async {
            for worker in self.topology.workers() {
                while !can_connect(worker, self.ssh_port).await {
                    sleep(self.probe_interval).await;
                }
                info!(worker, "worker is reachable");
                confirmed.lock().unwrap().insert(worker.to_string());
            }
        };
        match timeout(self.worker_wait_timeout, poll_all).await {
            Ok(()) => {
                info!(
                    workers = self.topology.host_count() - 1,
                    "all workers reachable"
                );
                Ok(())
            }
            Err(_) => {
                let confirmed = confirmed.into_inner().unwrap();
                let pending: Vec<String> = self
                    .topology
                    .workers()
                    .filter(|worker| !confirmed.contains(*worker))
                    .map(str::to_string)
                    .collect();
                warn!(?pending, "workers never became reachable");
                Err(WorkersTimeout {
                    waited: self.worker_wait_timeout,
                    pending,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    use super::*;

    fn topology(hosts: &[&str], master: &str, current: &str) -> ClusterTopology {
        ClusterTopology::new(
            hosts.iter().map(|s| s.to_string()).collect(),
            master,
            current,
            1,
            "eth0",
        )
        .unwrap()
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test_log::test(tokio::test)]
    async fn test_bounded_master_wait_gives_up() {
        let coordinator = ReadinessCoordinator::new(topology(
            &["127.0.0.1", "algo-2"],
            "127.0.0.1",
            "algo-2",
        ))
        .with_ssh_port(closed_port().await)
        .with_probe_interval(Duration::from_millis(10));

        let started = Instant::now();
        assert!(!coordinator.master_reachable_within(3).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test_log::test(tokio::test)]
    async fn test_master_wait_succeeds_when_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let coordinator = ReadinessCoordinator::new(topology(
            &["127.0.0.1", "algo-2"],
            "127.0.0.1",
            "algo-2",
        ))
        .with_ssh_port(port);
        assert!(coordinator.master_reachable_within(1).await);
        accept.abort();
    }

    #[test_log::test(tokio::test)]
    async fn test_single_host_needs_no_worker_wait() {
        let coordinator =
            ReadinessCoordinator::new(topology(&["algo-1"], "algo-1", "algo-1"));
        coordinator.wait_for_workers().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_worker_wait_times_out_and_names_pending_hosts() {
        let coordinator = ReadinessCoordinator::new(topology(
            &["algo-1", "127.0.0.1"],
            "algo-1",
            "algo-1",
        ))
        .with_ssh_port(closed_port().await)
        .with_probe_interval(Duration::from_millis(50))
        .with_worker_wait_timeout(Duration::from_secs(1));

        let started = Instant::now();
        let err = coordinator.wait_for_workers().await.unwrap_err();
        let waited = started.elapsed();

        assert_eq!(err.pending, vec!["127.0.0.1".to_string()]);
        assert!(waited >= Duration::from_secs(1));
        assert!(waited < Duration::from_secs(3));
    }

    #[test_log::test(tokio::test)]
    async fn test_worker_wait_succeeds_once_workers_listen() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let coordinator = ReadinessCoordinator::new(topology(
            &["algo-1", "127.0.0.1"],
            "algo-1",
            "algo-1",
        ))
        .with_ssh_port(port)
        .with_worker_wait_timeout(Duration::from_secs(5));
        coordinator.wait_for_workers().await.unwrap();
        accept.abort();
    }
}
