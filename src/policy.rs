//! Network policy: the tunables that govern how a node joins the overlay.
//!
//! `lookup_concurrency` (Kademlia's alpha) and `max_bucket_length` (k) are not
//! enforced here. They are validated and handed to the routing layer through
//! [`NetworkPolicy::kademlia_config`]. The dial tunables drive
//! [`crate::net::dial`].

use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

use libp2p::connection_limits::ConnectionLimits;
use libp2p::{kad, StreamProtocol};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_LOOKUP_CONCURRENCY: usize = 3;
pub const DEFAULT_MAX_BUCKET_LENGTH: usize = 20;
pub const DEFAULT_CONNECTION_CACHE_LIMIT: u32 = 20;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Validated overlay-join policy. Every integer is positive and every
/// duration non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkPolicy {
    lookup_concurrency: NonZeroUsize,
    max_bucket_length: NonZeroUsize,
    connection_cache_limit: NonZeroU32,
    dial_timeout: Duration,
    retry_backoff: Duration,
    max_retries: NonZeroU32,
    parallel_bootstrap_dial: bool,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            lookup_concurrency: non_zero_usize(DEFAULT_LOOKUP_CONCURRENCY),
            max_bucket_length: non_zero_usize(DEFAULT_MAX_BUCKET_LENGTH),
            connection_cache_limit: non_zero_u32(DEFAULT_CONNECTION_CACHE_LIMIT),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retries: non_zero_u32(DEFAULT_MAX_RETRIES),
            parallel_bootstrap_dial: false,
        }
    }
}

impl NetworkPolicy {
    /// Peers contacted in parallel per lookup step (alpha).
    pub fn lookup_concurrency(&self) -> usize {
        self.lookup_concurrency.get()
    }

    /// Routing-table capacity per distance bucket (k).
    pub fn max_bucket_length(&self) -> usize {
        self.max_bucket_length.get()
    }

    /// Maximum number of established outbound connections kept open.
    pub fn connection_cache_limit(&self) -> u32 {
        self.connection_cache_limit.get()
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.get()
    }

    pub fn parallel_bootstrap_dial(&self) -> bool {
        self.parallel_bootstrap_dial
    }

    /// Total dial attempts made against one peer.
    pub fn attempts_per_peer(&self) -> u32 {
        self.max_retries.get().saturating_add(1)
    }

    /// How many bootstrap peers may be dialed at once.
    pub fn dial_fan_out(&self) -> usize {
        if self.parallel_bootstrap_dial {
            self.lookup_concurrency.get()
        } else {
            1
        }
    }

    /// Upper bound on the time one peer can take: every attempt times out and
    /// every backoff is waited.
    pub fn per_peer_budget(&self) -> Duration {
        self.dial_timeout
            .saturating_mul(self.attempts_per_peer())
            .saturating_add(self.retry_backoff.saturating_mul(self.max_retries.get()))
    }

    /// Deadline for dialing `peers` bootstrap peers under this policy.
    ///
    /// The worst case of every wave plus one extra dial timeout, so timer
    /// rounding never cancels a peer that answers at the end of its budget.
    pub fn bootstrap_deadline(&self, peers: usize) -> Duration {
        let waves = peers.div_ceil(self.dial_fan_out());
        let waves = u32::try_from(waves).unwrap_or(u32::MAX);
        self.per_peer_budget()
            .saturating_mul(waves)
            .saturating_add(self.dial_timeout)
    }

    /// Kademlia configuration carrying alpha and k downstream.
    pub fn kademlia_config(&self, protocol: StreamProtocol) -> kad::Config {
        let mut config = kad::Config::new(protocol);
        config.set_parallelism(self.lookup_concurrency);
        config.set_kbucket_size(self.max_bucket_length);
        config.set_query_timeout(self.dial_timeout);
        // Bootstrap is triggered once the bootstrap set has been dialed.
        config.set_periodic_bootstrap_interval(None);
        config
    }

    /// Connection limits capping the outbound connection cache.
    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits::default()
            .with_max_established_outgoing(Some(self.connection_cache_limit.get()))
    }
}

/// Persisted form of a [`NetworkPolicy`]. Absent fields keep their base value.
///
/// Integers are signed so that zero and negative values reach validation and
/// are reported as such rather than as a JSON type error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_concurrency: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bucket_length: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_cache_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_timeout_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_bootstrap_dial: Option<bool>,
}

impl From<&NetworkPolicy> for PolicyOverrides {
    fn from(policy: &NetworkPolicy) -> Self {
        let millis = |d: Duration| i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Self {
            lookup_concurrency: Some(policy.lookup_concurrency() as i64),
            max_bucket_length: Some(policy.max_bucket_length() as i64),
            connection_cache_limit: Some(i64::from(policy.connection_cache_limit())),
            dial_timeout_ms: Some(millis(policy.dial_timeout)),
            retry_backoff_ms: Some(millis(policy.retry_backoff)),
            max_retries: Some(i64::from(policy.max_retries())),
            parallel_bootstrap_dial: Some(policy.parallel_bootstrap_dial),
        }
    }
}

/// Apply `overrides` on top of `base`.
///
/// Fails on the first non-positive or out-of-range value; nothing is clamped.
pub fn override_policy(base: &NetworkPolicy, overrides: &PolicyOverrides) -> Result<NetworkPolicy, ConfigError> {
    let mut policy = *base;

    if let Some(v) = overrides.lookup_concurrency {
        policy.lookup_concurrency = positive_usize("lookupConcurrency", v)?;
    }
    if let Some(v) = overrides.max_bucket_length {
        policy.max_bucket_length = positive_usize("maxBucketLength", v)?;
    }
    if let Some(v) = overrides.connection_cache_limit {
        policy.connection_cache_limit = positive_u32("connectionCacheLimit", v)?;
    }
    if let Some(v) = overrides.dial_timeout_ms {
        policy.dial_timeout = positive_millis("dialTimeoutMs", v)?;
    }
    if let Some(v) = overrides.retry_backoff_ms {
        policy.retry_backoff = positive_millis("retryBackoffMs", v)?;
    }
    if let Some(v) = overrides.max_retries {
        policy.max_retries = positive_u32("maxRetries", v)?;
    }
    if let Some(v) = overrides.parallel_bootstrap_dial {
        policy.parallel_bootstrap_dial = v;
    }

    Ok(policy)
}

fn positive(field: &'static str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or(ConfigError::InvalidPolicy { field, value })
}

fn positive_usize(field: &'static str, value: i64) -> Result<NonZeroUsize, ConfigError> {
    usize::try_from(positive(field, value)?)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or(ConfigError::InvalidPolicy { field, value })
}

fn positive_u32(field: &'static str, value: i64) -> Result<NonZeroU32, ConfigError> {
    u32::try_from(positive(field, value)?)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or(ConfigError::InvalidPolicy { field, value })
}

fn positive_millis(field: &'static str, value: i64) -> Result<Duration, ConfigError> {
    positive(field, value).map(Duration::from_millis)
}

const fn non_zero_usize(value: usize) -> NonZeroUsize {
    match NonZeroUsize::new(value) {
        Some(v) => v,
        None => panic!("policy default must be positive"),
    }
}

const fn non_zero_u32(value: u32) -> NonZeroU32 {
    match NonZeroU32::new(value) {
        Some(v) => v,
        None => panic!("policy default must be positive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_overlay_conventions() {
        let policy = NetworkPolicy::default();
        assert_eq!(policy.lookup_concurrency(), 3);
        assert_eq!(policy.max_bucket_length(), 20);
        assert_eq!(policy.connection_cache_limit(), 20);
        assert_eq!(policy.dial_timeout(), Duration::from_secs(30));
        assert_eq!(policy.retry_backoff(), Duration::from_secs(30));
        assert_eq!(policy.max_retries(), 1);
        assert!(!policy.parallel_bootstrap_dial());
    }

    #[test]
    fn default_is_idempotent() {
        assert_eq!(NetworkPolicy::default(), NetworkPolicy::default());
    }

    #[test]
    fn zero_lookup_concurrency_is_rejected() {
        let base = NetworkPolicy::default();
        let overrides = PolicyOverrides {
            lookup_concurrency: Some(0),
            ..Default::default()
        };
        match override_policy(&base, &overrides) {
            Err(ConfigError::InvalidPolicy { field, value }) => {
                assert_eq!(field, "lookupConcurrency");
                assert_eq!(value, 0);
            }
            other => panic!("expected InvalidPolicy, got {other:?}"),
        }
    }

    #[test]
    fn single_override_leaves_other_fields() {
        let base = NetworkPolicy::default();
        let overrides = PolicyOverrides {
            lookup_concurrency: Some(5),
            ..Default::default()
        };
        let policy = override_policy(&base, &overrides).unwrap();
        assert_eq!(policy.lookup_concurrency(), 5);
        assert_eq!(policy.max_bucket_length(), base.max_bucket_length());
        assert_eq!(policy.connection_cache_limit(), base.connection_cache_limit());
        assert_eq!(policy.dial_timeout(), base.dial_timeout());
        assert_eq!(policy.retry_backoff(), base.retry_backoff());
        assert_eq!(policy.max_retries(), base.max_retries());
        assert_eq!(policy.parallel_bootstrap_dial(), base.parallel_bootstrap_dial());
    }

    #[test]
    fn rejects_non_positive_values_for_every_field() {
        let base = NetworkPolicy::default();
        let cases: Vec<PolicyOverrides> = vec![
            PolicyOverrides { max_bucket_length: Some(0), ..Default::default() },
            PolicyOverrides { connection_cache_limit: Some(-3), ..Default::default() },
            PolicyOverrides { dial_timeout_ms: Some(0), ..Default::default() },
            PolicyOverrides { retry_backoff_ms: Some(-1), ..Default::default() },
            PolicyOverrides { max_retries: Some(0), ..Default::default() },
            PolicyOverrides { connection_cache_limit: Some(i64::from(u32::MAX) + 1), ..Default::default() },
        ];
        for overrides in cases {
            assert!(
                matches!(override_policy(&base, &overrides), Err(ConfigError::InvalidPolicy { .. })),
                "accepted {overrides:?}"
            );
        }
    }

    #[test]
    fn empty_overrides_yield_base() {
        let base = NetworkPolicy::default();
        assert_eq!(override_policy(&base, &PolicyOverrides::default()).unwrap(), base);
    }

    #[test]
    fn full_overrides_reproduce_policy() {
        let custom = override_policy(
            &NetworkPolicy::default(),
            &PolicyOverrides {
                dial_timeout_ms: Some(1500),
                parallel_bootstrap_dial: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        let persisted = PolicyOverrides::from(&custom);
        assert_eq!(persisted.dial_timeout_ms, Some(1500));
        assert_eq!(override_policy(&NetworkPolicy::default(), &persisted).unwrap(), custom);
    }

    #[test]
    fn overrides_deserialize_from_camel_case() {
        let overrides: PolicyOverrides =
            serde_json::from_str(r#"{"lookupConcurrency": 4, "retryBackoffMs": 250}"#).unwrap();
        assert_eq!(overrides.lookup_concurrency, Some(4));
        assert_eq!(overrides.retry_backoff_ms, Some(250));
        assert_eq!(overrides.max_retries, None);
    }

    #[test]
    fn sequential_deadline_covers_every_attempt_and_backoff() {
        let policy = NetworkPolicy::default();
        assert_eq!(policy.attempts_per_peer(), 2);
        assert_eq!(policy.dial_fan_out(), 1);
        // 2 x 30s dial + 1 x 30s backoff, five peers one after another,
        // plus one dial timeout of slack.
        assert_eq!(policy.per_peer_budget(), Duration::from_secs(90));
        assert_eq!(policy.bootstrap_deadline(5), Duration::from_secs(90 * 5 + 30));
    }

    #[test]
    fn parallel_deadline_is_split_into_waves() {
        let policy = override_policy(
            &NetworkPolicy::default(),
            &PolicyOverrides {
                parallel_bootstrap_dial: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(policy.dial_fan_out(), 3);
        assert_eq!(policy.bootstrap_deadline(5), Duration::from_secs(90 * 2 + 30));
    }
}
