use std::path::PathBuf;

/// Credential variables forwarded into distributed launches when present,
/// so every rank can reach the same storage the coordinator can.
pub const CREDENTIAL_ENV_VARS: [&str; 3] = [
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
];

/// Snapshot of the per-host facts the command builders consult. Captured
/// once when the trainer starts; nothing downstream reads the process
/// environment again.
#[derive(Debug, Clone)]
pub struct NodeEnv {
    /// Platform instance type, when the platform advertises one. Gates
    /// interconnect-specific launcher flags.
    pub instance_type: Option<String>,
    /// GPUs visible on this host. Zero on CPU-only instances.
    pub gpu_count: usize,
    /// Names from [`CREDENTIAL_ENV_VARS`] that were present at startup.
    pub forwarded_env: Vec<String>,
    /// Directory holding the user's training code; becomes the working
    /// directory of every launched process.
    pub code_dir: PathBuf,
    /// Directory the platform collects after the job; failure markers are
    /// written here.
    pub output_dir: PathBuf,
}

impl NodeEnv {
    pub fn new(
        instance_type: Option<String>,
        gpu_count: usize,
        forwarded_env: Vec<String>,
        code_dir: PathBuf,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            instance_type,
            gpu_count,
            forwarded_env,
            code_dir,
            output_dir,
        }
    }
}
