//! Node configuration: load, generate, save, and the startup lifecycle.
//!
//! The configuration is a JSON document, by default `./config.json`:
//!
//! ```json
//! {"host": "0.0.0.0",
//!  "port": "18514",
//!  "privateKey": "<64 hex chars>",
//!  "multiaddress": "/ip4/203.0.113.7/tcp/18514/republic/8M...",
//!  "bootstrapMultiAddresses": ["/ip4/52.78.129.188/tcp/18514/republic/8MKZ..."],
//!  "network": {"lookupConcurrency": 3, "dialTimeoutMs": 30000},
//!  "ledger": {"network": "testnet"},
//!  "logs": {"plugins": [{"file": {"path": "darknode.log"}}]}}
//! ```
//!
//! Loading is recoverable: any failure sends the caller to
//! [`NodeConfiguration::generate_default`], whose failures are fatal.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use k256::ecdsa::SigningKey;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Instrument};

use crate::address::{NodeAddress, PeerAddress};
use crate::error::{ConfigError, Result};
use crate::keys;
use crate::net::boot::{self, BootstrapSet};
use crate::net::ip::{self, IpResolver};
use crate::policy::{override_policy, NetworkPolicy, PolicyOverrides};

pub const DEFAULT_PORT: u16 = 18514;
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default configuration path: `./config.json`.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("config.json")
}

/// Settings handed through to the ledger client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConfig {
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            network: "testnet".to_owned(),
            key_path: None,
        }
    }
}

/// Telemetry sink settings handed through to the logging collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default)]
    pub plugins: Vec<LogPlugin>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogPlugin {
    File { path: PathBuf },
    Websocket { host: String, port: String },
}

/// On-disk shape of the configuration.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    host: String,
    port: String,
    private_key: String,
    multiaddress: String,
    bootstrap_multi_addresses: Vec<String>,
    #[serde(default)]
    network: PolicyOverrides,
    #[serde(default)]
    ledger: LedgerConfig,
    #[serde(default)]
    logs: LogsConfig,
}

/// Inputs to [`NodeConfiguration::generate_default`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub host: IpAddr,
    pub port: u16,
    /// Load the identity from (or create it for) this key file instead of
    /// generating an ephemeral one.
    pub key_path: Option<PathBuf>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            key_path: None,
        }
    }
}

/// Everything a node needs to start. Immutable once handed off.
#[derive(Clone)]
pub struct NodeConfiguration {
    host: IpAddr,
    port: u16,
    key: SigningKey,
    address: NodeAddress,
    multiaddress: PeerAddress,
    bootstrap: BootstrapSet,
    network: NetworkPolicy,
    ledger: LedgerConfig,
    logs: LogsConfig,
}

impl fmt::Debug for NodeConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfiguration")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("address", &self.address)
            .field("multiaddress", &self.multiaddress)
            .field("bootstrap", &self.bootstrap)
            .field("network", &self.network)
            .field("ledger", &self.ledger)
            .field("logs", &self.logs)
            .finish_non_exhaustive()
    }
}

impl NodeConfiguration {
    /// Read and validate a persisted configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_raw(raw)?;
        debug!(path = %path.display(), address = %config.address, "Loaded node configuration");
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let host: IpAddr = raw
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(raw.host.clone()))?;
        let port: u16 = raw
            .port
            .parse()
            .ok()
            .filter(|p: &u16| *p != 0 && p.to_string() == raw.port)
            .ok_or_else(|| ConfigError::InvalidPort(raw.port.clone()))?;

        let key = keys::from_hex(&raw.private_key)?;
        let address = keys::node_address(&key);

        let multiaddress: PeerAddress = raw.multiaddress.parse()?;
        if multiaddress.node_address() != &address {
            return Err(ConfigError::IdentityMismatch {
                expected: address,
                found: multiaddress.node_address().clone(),
            });
        }
        if multiaddress.port() != port {
            return Err(ConfigError::PortMismatch {
                listen: port,
                advertised: multiaddress.port(),
            });
        }

        let bootstrap = boot::load_bootstrap_set(&raw.bootstrap_multi_addresses)?;
        if bootstrap.is_empty() {
            return Err(ConfigError::EmptyBootstrapSet);
        }
        let network = override_policy(&NetworkPolicy::default(), &raw.network)?;

        Ok(Self {
            host,
            port,
            key,
            address,
            multiaddress,
            bootstrap,
            network,
            ledger: raw.ledger,
            logs: raw.logs,
        })
    }

    fn to_raw(&self) -> RawConfig {
        RawConfig {
            host: self.host.to_string(),
            port: self.port.to_string(),
            private_key: keys::to_hex(&self.key),
            multiaddress: self.multiaddress.to_string(),
            bootstrap_multi_addresses: self.bootstrap.to_strings(),
            network: PolicyOverrides::from(&self.network),
            ledger: self.ledger.clone(),
            logs: self.logs.clone(),
        }
    }

    /// Build a fresh configuration: identity, self address, bootstrap set,
    /// policy, in that order. The first failure is returned unchanged.
    pub async fn generate_default<R: IpResolver>(options: &GenerateOptions, resolver: &R) -> Result<Self> {
        let (key, address) = match &options.key_path {
            Some(path) => keys::load_or_create(path)?,
            None => {
                let key = keys::generate()?;
                let address = keys::node_address(&key);
                (key, address)
            }
        };
        info!(address = %address, "Node identity ready");

        let multiaddress = ip::build_self_address(&address, options.port, resolver).await?;
        let bootstrap = boot::default_bootstrap_set()?;
        let network = NetworkPolicy::default();

        Ok(Self {
            host: options.host,
            port: options.port,
            key,
            address,
            multiaddress,
            bootstrap,
            network,
            ledger: LedgerConfig::default(),
            logs: LogsConfig::default(),
        })
    }

    /// Write the full configuration as pretty-printed JSON, creating parent
    /// directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(&self.to_raw()).map_err(ConfigError::Serialize)?;
        std::fs::write(path, json).map_err(write_err)
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address the listener binds to.
    pub fn listen_multiaddr(&self) -> Multiaddr {
        let ip = match self.host {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Multiaddr::empty().with(ip).with(Protocol::Tcp(self.port))
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn multiaddress(&self) -> &PeerAddress {
        &self.multiaddress
    }

    pub fn bootstrap(&self) -> &BootstrapSet {
        &self.bootstrap
    }

    pub fn network(&self) -> &NetworkPolicy {
        &self.network
    }

    pub fn ledger(&self) -> &LedgerConfig {
        &self.ledger
    }

    pub fn logs(&self) -> &LogsConfig {
        &self.logs
    }
}

/// Startup lifecycle. `Active` is terminal; there is no reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Loading,
    Loaded,
    Generating,
    Generated,
    Active,
}

/// Where the active configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Loaded,
    Generated,
}

/// Drives `Uninitialized → {Loading → Loaded} | {Generating → Generated} → Active`.
pub struct Startup {
    path: PathBuf,
    extra_peers: Vec<PeerAddress>,
    phase: Phase,
}

impl Startup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            extra_peers: Vec::new(),
            phase: Phase::Uninitialized,
        }
    }

    /// Operator-supplied peers appended to the bootstrap set before handoff.
    /// They are not persisted.
    pub fn with_extra_peers(mut self, peers: Vec<PeerAddress>) -> Self {
        self.extra_peers = peers;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn advance(&mut self, next: Phase) {
        debug!(from = ?self.phase, to = ?next, "Startup phase");
        self.phase = next;
    }

    /// Load the persisted configuration, or generate and save a fresh one.
    ///
    /// Consumes the lifecycle, so a configuration can only be activated once.
    pub async fn run<R: IpResolver>(self, options: &GenerateOptions, resolver: &R) -> Result<Active> {
        let span = tracing::info_span!("startup", path = %self.path.display());
        self.activate(options, resolver).instrument(span).await
    }

    async fn activate<R: IpResolver>(mut self, options: &GenerateOptions, resolver: &R) -> Result<Active> {
        self.advance(Phase::Loading);
        let (mut config, origin) = match NodeConfiguration::load(&self.path) {
            Ok(config) => {
                self.advance(Phase::Loaded);
                if let Some(key_path) = options.key_path.as_deref().filter(|p| p.exists()) {
                    key_file_matches(&config, key_path);
                }
                (config, Origin::Loaded)
            }
            Err(e) => {
                info!(reason = %e, "No usable configuration, generating a fresh one");
                self.advance(Phase::Generating);
                let config = NodeConfiguration::generate_default(options, resolver).await?;
                self.advance(Phase::Generated);

                if let Err(e) = config.save(&self.path) {
                    warn!(error = %e, "Failed to persist configuration, continuing with in-memory copy");
                }
                if let Some(key_path) = options.key_path.as_deref().filter(|p| !p.exists()) {
                    if let Err(e) = keys::save(config.key(), key_path) {
                        warn!(error = %e, "Failed to persist node key");
                    }
                }
                (config, Origin::Generated)
            }
        };

        let added = config.bootstrap.extend_unique(std::mem::take(&mut self.extra_peers));
        if added > 0 {
            info!(added, total = config.bootstrap.len(), "Extended bootstrap set");
        }

        self.advance(Phase::Active);
        Ok(Active {
            config: Arc::new(config),
            origin,
        })
    }
}

/// Whether the key file at `path` holds the loaded configuration's key.
///
/// The configuration's key wins either way; a disagreement is only logged.
fn key_file_matches(config: &NodeConfiguration, path: &Path) -> bool {
    match keys::load(path) {
        Ok(key) if key.to_bytes() == config.key().to_bytes() => true,
        Ok(key) => {
            warn!(
                path = %path.display(),
                key_file = %keys::node_address(&key),
                running_as = %config.address(),
                "Key file disagrees with the configuration, ignoring key file"
            );
            false
        }
        Err(e) => {
            warn!(error = %e, "Unreadable key file, ignoring it");
            false
        }
    }
}

/// The configuration every collaborator shares for the rest of the process.
#[derive(Debug, Clone)]
pub struct Active {
    config: Arc<NodeConfiguration>,
    origin: Origin,
}

impl Active {
    pub fn config(&self) -> Arc<NodeConfiguration> {
        Arc::clone(&self.config)
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn phase(&self) -> Phase {
        Phase::Active
    }
}
