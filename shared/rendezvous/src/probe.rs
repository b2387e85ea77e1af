use std::io;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const SSH_PORT: u16 = 22;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const BANNER_TIMEOUT: Duration = Duration::from_secs(3);

/// One reachability attempt against `host:port`. Hosts come and go while
/// the cluster boots, so every failure maps to `false`; retry cadence
/// belongs to the calling loop.
pub async fn can_connect(host: &str, port: u16) -> bool {
    match probe(host, port, port == SSH_PORT).await {
        Ok(()) => {
            debug!(host, port, "reachable");
            true
        }
        Err(err) => {
            debug!(host, port, error = %err, "not reachable yet");
            false
        }
    }
}

async fn probe(host: &str, port: u16, expect_ssh_banner: bool) -> io::Result<()> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    if expect_ssh_banner {
        // an open port is not enough, wait until sshd actually answers
        let mut prefix = [0u8; 4];
        timeout(BANNER_TIMEOUT, stream.read_exact(&mut prefix))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "banner timed out"))??;
        if &prefix != b"SSH-" {
            return Err(io::Error::other("connected, but not to an ssh server"));
        }
    }
    Ok(())
}
