use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use backon::{ConstantBuilder, Retryable};
use gantry_core::ClusterTopology;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::probe::{can_connect, SSH_PORT};

const DEFAULT_BASE: &str = "/tmp/done";
const WRITE_ATTEMPTS: usize = 5;
const WRITE_RETRY_DELAY: Duration = Duration::from_secs(1);
const SENTINEL_POLL: Duration = Duration::from_secs(30);
const MASTER_RECHECK: Duration = Duration::from_secs(120);

/// How a worker's completion wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionWait {
    /// The sentinel file appeared.
    Signaled,
    /// The master stopped answering and no sentinel was ever written.
    /// There is a window where a master that is still retrying its write
    /// loses the race against this; the worker exits anyway.
    MasterGone,
}

/// Cross-host completion marker: `<base>.<master_host>`, touched on every
/// worker by the master once the launcher exits, polled locally by each
/// worker. Written at most once per host pair, never deleted.
pub struct CompletionSignal {
    topology: ClusterTopology,
    path: PathBuf,
    remote_shell: String,
    ssh_port: u16,
    write_retry_delay: Duration,
    sentinel_poll: Duration,
    master_recheck: Duration,
}

impl CompletionSignal {
    pub fn new(topology: ClusterTopology) -> Self {
        let path = PathBuf::from(format!("{DEFAULT_BASE}.{}", topology.master_host()));
        Self {
            topology,
            path,
            remote_shell: "ssh".to_string(),
            ssh_port: SSH_PORT,
            write_retry_delay: WRITE_RETRY_DELAY,
            sentinel_poll: SENTINEL_POLL,
            master_recheck: MASTER_RECHECK,
        }
    }

    pub fn with_base(mut self, base: &Path) -> Self {
        self.path = PathBuf::from(format!(
            "{}.{}",
            base.display(),
            self.topology.master_host()
        ));
        self
    }

    pub fn with_remote_shell(mut self, program: impl Into<String>) -> Self {
        self.remote_shell = program.into();
        self
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn with_write_retry_delay(mut self, delay: Duration) -> Self {
        self.write_retry_delay = delay;
        self
    }

    pub fn with_sentinel_poll(mut self, interval: Duration) -> Self {
        self.sentinel_poll = interval;
        self
    }

    pub fn with_master_recheck(mut self, interval: Duration) -> Self {
        self.master_recheck = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Master side: mark the job finished on every worker. Best effort by
    /// contract; a worker that cannot be reached after all attempts is
    /// logged and skipped, never an error, because the job's real outcome
    /// has already been decided by the launcher.
    pub async fn announce(&self) {
        for worker in self.topology.workers() {
            let touch = || async { self.touch_on(worker).await };
            let written = touch
                .retry(
                    ConstantBuilder::default()
                        .with_delay(self.write_retry_delay)
                        .with_max_times(WRITE_ATTEMPTS - 1),
                )
                .sleep(tokio::time::sleep)
                .notify(|err: &io::Error, dur: Duration| {
                    warn!(worker, error = %err, "sentinel write failed, retrying in {dur:?}");
                })
                .await;
            match written {
                Ok(()) => info!(worker, path = %self.path.display(), "completion sentinel written"),
                Err(err) => {
                    warn!(worker, error = %err, "giving up on signaling completion to this worker")
                }
            }
        }
    }

    async fn touch_on(&self, worker: &str) -> io::Result<()> {
        let status = tokio::process::Command::new(&self.remote_shell)
            .arg(worker)
            .arg("touch")
            .arg(&self.path)
            .stdin(std::process::Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "{} {worker} exited with {status}",
                self.remote_shell
            )))
        }
    }

    /// Worker side: block until the master signals completion, re-probing
    /// the master between sentinel polls so a vanished master cannot strand
    /// the host forever.
    pub async fn wait(&self) -> CompletionWait {
        info!(path = %self.path.display(), "waiting for completion sentinel");
        let mut last_master_check = Instant::now();
        loop {
            if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
                info!(path = %self.path.display(), "completion sentinel found");
                return CompletionWait::Signaled;
            }
            if last_master_check.elapsed() >= self.master_recheck {
                if !can_connect(self.topology.master_host(), self.ssh_port).await {
                    warn!(
                        master = self.topology.master_host(),
                        "master is gone and no sentinel was written, ending the wait"
                    );
                    return CompletionWait::MasterGone;
                }
                last_master_check = Instant::now();
            }
            sleep(self.sentinel_poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    use super::*;

    fn topology() -> ClusterTopology {
        ClusterTopology::new(
            vec!["127.0.0.1".to_string(), "algo-2".to_string()],
            "127.0.0.1",
            "algo-2",
            1,
            "eth0",
        )
        .unwrap()
    }

    /// Fake remote shell that logs each invocation and exits as told.
    fn fake_shell(dir: &Path, exit_code: i32) -> (PathBuf, PathBuf) {
        let counter = dir.join("attempts");
        let script = dir.join("fake-ssh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho attempt >> {}\nexit {exit_code}\n", counter.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, counter)
    }

    fn attempts(counter: &Path) -> usize {
        std::fs::read_to_string(counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test_log::test(tokio::test)]
    async fn test_announce_retries_five_times_then_gives_up_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let (script, counter) = fake_shell(dir.path(), 1);
        let signal = CompletionSignal::new(topology())
            .with_remote_shell(script.to_str().unwrap())
            .with_write_retry_delay(Duration::from_millis(1));

        signal.announce().await;

        assert_eq!(attempts(&counter), 5);
    }

    #[test_log::test(tokio::test)]
    async fn test_announce_stops_after_first_success() {
        let dir = tempfile::tempdir().unwrap();
        let (script, counter) = fake_shell(dir.path(), 0);
        let signal = CompletionSignal::new(topology())
            .with_remote_shell(script.to_str().unwrap())
            .with_write_retry_delay(Duration::from_millis(1));

        signal.announce().await;

        assert_eq!(attempts(&counter), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_returns_when_sentinel_appears() {
        let dir = tempfile::tempdir().unwrap();
        let signal = CompletionSignal::new(topology())
            .with_base(&dir.path().join("done"))
            .with_sentinel_poll(Duration::from_millis(10))
            .with_master_recheck(Duration::from_secs(3600));

        let path = signal.path().to_path_buf();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            tokio::fs::write(&path, b"").await.unwrap();
        });

        assert_eq!(signal.wait().await, CompletionWait::Signaled);
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_gives_up_when_master_vanishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let signal = CompletionSignal::new(topology())
            .with_base(&dir.path().join("done"))
            .with_ssh_port(port)
            .with_sentinel_poll(Duration::from_millis(10))
            .with_master_recheck(Duration::ZERO);

        assert_eq!(signal.wait().await, CompletionWait::MasterGone);
    }

    #[test_log::test(tokio::test)]
    async fn test_wait_keeps_waiting_while_master_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let signal = CompletionSignal::new(topology())
            .with_base(&dir.path().join("done"))
            .with_ssh_port(port)
            .with_sentinel_poll(Duration::from_millis(10))
            .with_master_recheck(Duration::ZERO);

        let path = signal.path().to_path_buf();
        tokio::spawn(async move {
            sleep(Duration::from_millis(80)).await;
            tokio::fs::write(&path, b"").await.unwrap();
        });

        assert_eq!(signal.wait().await, CompletionWait::Signaled);
        accept.abort();
    }
}
