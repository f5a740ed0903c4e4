//! Error taxonomy for identity, configuration and bootstrap.
//!
//! [`ConfigError`] is what [`crate::node_config::NodeConfiguration::load`]
//! returns and is always recoverable by generating a fresh configuration.
//! [`Error`] is the fatal union returned once default generation or the
//! startup sequence fails.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::address::NodeAddress;

/// A canonical peer-address string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressFormatError {
    #[error("`{input}` must start with '/'")]
    MissingLeadingSlash { input: String },

    #[error("`{input}` has {found} segments, expected 6")]
    SegmentCount { input: String, found: usize },

    #[error("`{input}`: expected `{expected}` at segment {index}, found `{found}`")]
    UnexpectedTag {
        input: String,
        index: usize,
        expected: &'static str,
        found: String,
    },

    #[error("invalid ipv4 address `{0}`")]
    InvalidIp(String),

    #[error("invalid tcp port `{0}`")]
    InvalidPort(String),

    #[error("invalid node address `{value}`: {reason}")]
    InvalidNodeAddress { value: String, reason: &'static str },

    #[error("`{0}` does not survive a round-trip through its canonical form")]
    NonCanonical(String),

    #[error("bootstrap entry {index} is malformed: {source}")]
    BootstrapEntry {
        index: usize,
        #[source]
        source: Box<AddressFormatError>,
    },
}

/// Persisted configuration or a policy override is unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialize config: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("invalid value {value} for `{field}`: must be a positive integer")]
    InvalidPolicy { field: &'static str, value: i64 },

    #[error("invalid port `{0}`")]
    InvalidPort(String),

    #[error("invalid host `{0}`")]
    InvalidHost(String),

    #[error("listen port {listen} differs from advertised port {advertised}")]
    PortMismatch { listen: u16, advertised: u16 },

    #[error("bootstrap set is empty")]
    EmptyBootstrapSet,

    #[error(transparent)]
    Address(#[from] AddressFormatError),

    #[error("multiaddress names node {found}, but the private key derives {expected}")]
    IdentityMismatch {
        expected: NodeAddress,
        found: NodeAddress,
    },
}

/// Something outside the process we cannot start without.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalDependencyError {
    #[error("OS entropy source failed: {0}")]
    Entropy(String),

    #[error("external ip lookup failed after {attempts} attempt(s): {reason}")]
    IpLookup { attempts: u32, reason: String },
}

/// A single dial attempt against one bootstrap peer failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialError {
    #[error("dial {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("dial {addr}: {reason}")]
    Connect { addr: String, reason: String },
}

/// The bootstrap phase as a whole failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootstrapError {
    #[error("bootstrap set has no peers other than this node")]
    EmptySet,

    #[error("none of the {tried} bootstrap peers was reachable")]
    NoReachablePeers { tried: usize },

    #[error("bootstrap phase exceeded its deadline of {deadline:?}")]
    DeadlineExceeded { deadline: Duration },
}

/// Fatal startup failure. Wrapped errors are propagated unchanged.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    AddressFormat(#[from] AddressFormatError),

    #[error(transparent)]
    External(#[from] ExternalDependencyError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
