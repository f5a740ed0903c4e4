//! External IP resolution and the node's own peer address.

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::address::{NodeAddress, PeerAddress};
use crate::error::{ExternalDependencyError, Result};

/// Plain-text IPv4 echo service queried by default.
pub const DEFAULT_IP_ECHO_URL: &str = "https://api.ipify.org";

/// Resolves the IPv4 address other nodes can reach this one on.
pub trait IpResolver {
    fn resolve(&self) -> impl Future<Output = Result<Ipv4Addr, ExternalDependencyError>> + Send;
}

/// A fixed address, for operators who know their public IP.
#[derive(Debug, Clone, Copy)]
pub struct StaticIpResolver(pub Ipv4Addr);

impl IpResolver for StaticIpResolver {
    async fn resolve(&self) -> Result<Ipv4Addr, ExternalDependencyError> {
        Ok(self.0)
    }
}

/// Bounds on the external lookup: every request has a timeout and the number
/// of requests is capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for LookupPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Queries an HTTP echo service that answers with the caller's address.
pub struct HttpIpResolver {
    client: reqwest::Client,
    url: String,
    policy: LookupPolicy,
}

impl HttpIpResolver {
    pub fn new(url: impl Into<String>, policy: LookupPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            policy,
        }
    }

    async fn lookup_once(&self) -> Result<Ipv4Addr, String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("{} answered {}", self.url, response.status()));
        }

        let body = response.text().await.map_err(|e| e.to_string())?;
        body.trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| format!("unparseable response `{}`", body.trim()))
    }
}

impl Default for HttpIpResolver {
    fn default() -> Self {
        Self::new(DEFAULT_IP_ECHO_URL, LookupPolicy::default())
    }
}

impl IpResolver for HttpIpResolver {
    async fn resolve(&self) -> Result<Ipv4Addr, ExternalDependencyError> {
        let attempts = self.policy.attempts.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.policy.timeout, self.lookup_once()).await {
                Ok(Ok(ip)) => {
                    debug!(url = %self.url, %ip, attempt, "Resolved external ip");
                    return Ok(ip);
                }
                Ok(Err(e)) => reason = e,
                Err(_) => reason = format!("timed out after {:?}", self.policy.timeout),
            }
            warn!(url = %self.url, attempt, reason = %reason, "External ip lookup failed");
            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        Err(ExternalDependencyError::IpLookup { attempts, reason })
    }
}

/// Compose this node's canonical peer address from its external IP.
///
/// There is no fallback: if the IP cannot be resolved the caller cannot
/// advertise itself and generation must fail.
pub async fn build_self_address<R: IpResolver>(
    node_address: &NodeAddress,
    port: u16,
    resolver: &R,
) -> Result<PeerAddress> {
    let ip = resolver.resolve().await?;
    let address = PeerAddress::tcp(ip, port, node_address.clone())?;
    address.verify_round_trip()?;
    info!(multiaddress = %address, "Built self address");
    Ok(address)
}
