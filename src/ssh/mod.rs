//! SSH module - keys, agent and connectivity
//!
//! # Features
//! - Key pair generation, inspection and listing (`keys`)
//! - SSH agent reset/load/list behind the `AgentControl` trait (`agent`)
//! - `ssh -T` connectivity probe (`probe`)

pub mod agent;
pub mod keys;
pub mod probe;

pub use agent::{is_agent_available, AgentControl, AgentError, SshAgentController};
pub use keys::{
    inspect_key, validate_key, KeyAlgorithm, KeyError, KeyPairRecord, KeyStore, MIN_RSA_BITS,
};
pub use probe::{probe, ProbeResult};
