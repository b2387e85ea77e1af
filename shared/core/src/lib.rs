mod node;
mod topology;

pub use node::{NodeEnv, CREDENTIAL_ENV_VARS};
pub use topology::{ClusterTopology, RunnerRole, TopologyError};
