//! QNet HA node: configuration loading and wiring of the HA managers

pub mod cli;
pub mod config;
pub mod error;
pub mod node;

pub use config::{NodeConfig, PeerConfig};
pub use error::{NodeError, NodeResult};
pub use node::{HaNode, Transports};
