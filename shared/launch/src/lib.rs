mod command;
mod entry;
mod launcher;
mod mpi;
mod runner;
mod smdataparallel;
mod torch_distributed;
mod vanilla_ddp;
mod watcher;
mod xla;

pub use command::LaunchCommand;
pub use entry::EntryPoint;
pub use launcher::{BuildError, Launcher, PYTHON};
pub use mpi::MpiOptions;
pub use runner::{check_call, ProcessOutcome, RunError};
pub use watcher::watch;
