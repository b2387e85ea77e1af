use std::collections::HashSet;
use std::io;
use std::process::Stdio;

use gantry_core::ClusterTopology;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::info;

use crate::{
    command::LaunchCommand,
    runner::{outcome_from_status, ProcessOutcome, RunError},
};

/// First sight of any of these in a stderr line starts the captured tail;
/// everything earlier is launcher noise the job log already carries.
const ERROR_SIGNATURES: [&str; 11] = [
    "Traceback (most recent call last)",
    "SyntaxError",
    "ImportError",
    "ModuleNotFoundError",
    "RuntimeError",
    "ValueError",
    "TypeError",
    "OSError",
    "MemoryError",
    "CUDA out of memory",
    "Segmentation fault",
];

/// Runs the command with both output streams piped. Every line is echoed
/// to our own stdio as soon as it arrives; mpirun rank tags are rewritten
/// to name the owning host; stderr lines from the first recognized error
/// onward are kept (deduplicated) and attached to the outcome.
pub async fn watch(
    command: &LaunchCommand,
    topology: &ClusterTopology,
) -> Result<ProcessOutcome, RunError> {
    info!(command = %command, "executing with output capture");
    let mut tokio_command = command.as_tokio();
    tokio_command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = tokio_command
        .spawn()
        .map_err(|source| RunError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let stdout = child.stdout.take().unwrap();
    let stderr = child.stderr.take().unwrap();

    let stdout_task = tokio::spawn(pump(stdout, tokio::io::stdout(), topology.clone(), false));
    let stderr_task = tokio::spawn(pump(stderr, tokio::io::stderr(), topology.clone(), true));

    let status = child.wait().await?;
    stdout_task.await.map_err(io::Error::other)??;
    let tail = stderr_task.await.map_err(io::Error::other)??;

    outcome_from_status(status, command, tail)
}

async fn pump<R, W>(
    stream: R,
    mut sink: W,
    topology: ClusterTopology,
    collect_errors: bool,
) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut tail = ErrorTail::default();
    while let Some(line) = lines.next_line().await? {
        let line = relabel_rank_tags(&line, &topology);
        sink.write_all(line.as_bytes()).await?;
        sink.write_all(b"\n").await?;
        sink.flush().await?;
        if collect_errors {
            tail.observe(&line);
        }
    }
    Ok(tail.into_captured())
}

/// Rewrites mpirun `--tag-output` prefixes from `[job,rank]<stream>` to
/// `[job,mpirank:rank,host]<stream>` so multi-host logs name the machine a
/// rank ran on. Lines that do not parse as a tag pass through untouched.
fn relabel_rank_tags(line: &str, topology: &ClusterTopology) -> String {
    let Some(inside) = line.strip_prefix('[') else {
        return line.to_string();
    };
    let Some((tag, after_tag)) = inside.split_once(']') else {
        return line.to_string();
    };
    let Some((job, rank)) = tag.split_once(',') else {
        return line.to_string();
    };
    if job.is_empty() || job.parse::<u64>().is_err() {
        return line.to_string();
    }
    let Ok(rank) = rank.parse::<usize>() else {
        return line.to_string();
    };
    let stream = if after_tag.starts_with("<stdout>") {
        "stdout"
    } else if after_tag.starts_with("<stderr>") {
        "stderr"
    } else {
        return line.to_string();
    };
    let Some(host) = topology.host_for_rank(rank) else {
        return line.to_string();
    };
    let rest = &after_tag[stream.len() + 2..];
    format!("[{job},mpirank:{rank},{host}]<{stream}>{rest}")
}

#[derive(Default)]
struct ErrorTail {
    started: bool,
    seen: HashSet<String>,
    lines: Vec<String>,
}

impl ErrorTail {
    fn observe(&mut self, line: &str) {
        if !self.started {
            self.started = ERROR_SIGNATURES.iter().any(|sig| line.contains(sig));
        }
        if self.started && self.seen.insert(line.to_string()) {
            self.lines.push(line.to_string());
        }
    }

    fn into_captured(self) -> Option<String> {
        if self.lines.is_empty() {
            None
        } else {
            Some(self.lines.join("\n"))
        }
    }
}
