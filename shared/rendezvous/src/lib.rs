mod coordinator;
mod probe;
mod sentinel;
mod sshd;

pub use coordinator::{ReadinessCoordinator, WorkersTimeout};
pub use probe::{can_connect, SSH_PORT};
pub use sentinel::{CompletionSignal, CompletionWait};
pub use sshd::{start_sshd, SshdError};
