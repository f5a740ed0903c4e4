//! Darknode - identity bootstrap and peer discovery for the republic overlay
//!
//! This library derives a node's secp256k1 identity, composes its canonical
//! peer address, loads the bootstrap set, assembles the network policy and
//! aggregates all of it into the configuration a node starts from.

pub mod address;
pub mod config;
pub mod error;
pub mod host;
pub mod keys;
pub mod net;
pub mod node_config;
pub mod policy;

// Re-export commonly used types for convenience
pub use address::{NodeAddress, PeerAddress};
pub use config::LogLevel;
pub use error::{Error, Result};
pub use net::boot::BootstrapSet;
pub use node_config::{NodeConfiguration, Startup};
pub use policy::NetworkPolicy;
