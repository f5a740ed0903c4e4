//! Bootstrap dialing: retry, backoff and a phase-wide deadline.
//!
//! Every attempt is bounded by the policy's dial timeout. A peer that keeps
//! failing is tried `max_retries + 1` times, waiting `retry_backoff` between
//! tries, and then skipped. The phase fails only if no peer was reachable or
//! the overall deadline fires, in which case no partial report is returned.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream::{self, StreamExt};
use tokio::time;
use tracing::{debug, info, warn, Instrument};

use crate::address::PeerAddress;
use crate::error::{BootstrapError, DialError};
use crate::net::boot::BootstrapSet;
use crate::policy::NetworkPolicy;

/// Opens a connection to a peer. Timeouts are applied by the caller.
pub trait Dialer: Sync {
    fn dial(&self, peer: &PeerAddress) -> impl Future<Output = Result<(), DialError>> + Send;
}

/// Result of dialing one bootstrap peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerOutcome {
    pub peer: PeerAddress,
    pub attempts: u32,
    /// Last error seen, `None` if the peer was reached.
    pub error: Option<DialError>,
}

impl PeerOutcome {
    pub fn is_reachable(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-peer outcomes in bootstrap-set order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub outcomes: Vec<PeerOutcome>,
    pub reachable: usize,
}

impl BootstrapReport {
    pub fn reachable_peers(&self) -> impl Iterator<Item = &PeerAddress> {
        self.outcomes.iter().filter(|o| o.is_reachable()).map(|o| &o.peer)
    }

    pub fn unreachable_peers(&self) -> impl Iterator<Item = &PeerAddress> {
        self.outcomes.iter().filter(|o| !o.is_reachable()).map(|o| &o.peer)
    }

    pub fn total_attempts(&self) -> u32 {
        self.outcomes.iter().map(|o| o.attempts).sum()
    }
}

/// Dial every bootstrap peer except `own` according to `policy`.
pub async fn dial_bootstrap_set<D: Dialer>(
    dialer: &D,
    set: &BootstrapSet,
    own: Option<&PeerAddress>,
    policy: &NetworkPolicy,
) -> Result<BootstrapReport, BootstrapError> {
    let peers: Vec<&PeerAddress> = set.iter().filter(|p| Some(*p) != own).collect();
    if peers.is_empty() {
        return Err(BootstrapError::EmptySet);
    }

    let deadline = policy.bootstrap_deadline(peers.len());
    let reachable = AtomicUsize::new(0);
    let span = tracing::info_span!(
        "bootstrap",
        peer_count = peers.len(),
        parallel = policy.parallel_bootstrap_dial()
    );

    let phase = async {
        debug!(deadline = ?deadline, fan_out = policy.dial_fan_out(), "Dialing bootstrap set");
        if policy.parallel_bootstrap_dial() {
            stream::iter(peers.iter().copied())
                .map(|peer| dial_with_retry(dialer, peer, policy, &reachable))
                .buffered(policy.dial_fan_out())
                .collect::<Vec<_>>()
                .await
        } else {
            let mut outcomes = Vec::with_capacity(peers.len());
            for peer in &peers {
                outcomes.push(dial_with_retry(dialer, peer, policy, &reachable).await);
            }
            outcomes
        }
    };

    let outcomes = time::timeout(deadline, phase.instrument(span)).await.map_err(|_| {
        warn!(deadline = ?deadline, "Bootstrap phase cancelled");
        BootstrapError::DeadlineExceeded { deadline }
    })?;

    let reachable = reachable.load(Ordering::SeqCst);
    if reachable == 0 {
        return Err(BootstrapError::NoReachablePeers { tried: outcomes.len() });
    }

    info!(reachable, unreachable = outcomes.len() - reachable, "Bootstrap dialing finished");
    Ok(BootstrapReport { outcomes, reachable })
}

async fn dial_with_retry<D: Dialer>(
    dialer: &D,
    peer: &PeerAddress,
    policy: &NetworkPolicy,
    reachable: &AtomicUsize,
) -> PeerOutcome {
    let attempts = policy.attempts_per_peer();
    let mut last_error = None;

    for attempt in 1..=attempts {
        let result = match time::timeout(policy.dial_timeout(), dialer.dial(peer)).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout {
                addr: peer.to_string(),
                timeout: policy.dial_timeout(),
            }),
        };

        match result {
            Ok(()) => {
                reachable.fetch_add(1, Ordering::SeqCst);
                info!(peer = %peer, attempt, "Connected to bootstrap peer");
                return PeerOutcome {
                    peer: peer.clone(),
                    attempts: attempt,
                    error: None,
                };
            }
            Err(e) => {
                warn!(peer = %peer, attempt, max_attempts = attempts, error = %e, "Bootstrap dial failed");
                last_error = Some(e);
            }
        }

        if attempt < attempts {
            time::sleep(policy.retry_backoff()).await;
        }
    }

    warn!(peer = %peer, "Bootstrap peer unreachable, skipping");
    PeerOutcome {
        peer: peer.clone(),
        attempts,
        error: last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::boot::{default_bootstrap_set, load_bootstrap_set, DEFAULT_BOOTSTRAP};
    use crate::policy::{override_policy, PolicyOverrides};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Fails every dial to `down`, succeeds otherwise, and records when each
    /// attempt happened.
    #[derive(Default)]
    struct ScriptedDialer {
        down: HashSet<PeerAddress>,
        hang: HashSet<PeerAddress>,
        log: Mutex<HashMap<PeerAddress, Vec<Instant>>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedDialer {
        fn with_down(peers: &[&PeerAddress]) -> Self {
            Self {
                down: peers.iter().map(|p| (*p).clone()).collect(),
                ..Default::default()
            }
        }

        fn attempts(&self, peer: &PeerAddress) -> Vec<Instant> {
            self.log.lock().unwrap().get(peer).cloned().unwrap_or_default()
        }
    }

    impl Dialer for ScriptedDialer {
        async fn dial(&self, peer: &PeerAddress) -> Result<(), DialError> {
            self.log
                .lock()
                .unwrap()
                .entry(peer.clone())
                .or_default()
                .push(Instant::now());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            // Yield so concurrent dials overlap.
            time::sleep(Duration::from_millis(10)).await;
            if self.hang.contains(peer) {
                std::future::pending::<()>().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.down.contains(peer) {
                Err(DialError::Connect {
                    addr: peer.to_string(),
                    reason: "connection refused".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn parallel_policy() -> NetworkPolicy {
        override_policy(
            &NetworkPolicy::default(),
            &PolicyOverrides {
                parallel_bootstrap_dial: Some(true),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn failing_peer_is_tried_twice_with_one_backoff() {
        let set = load_bootstrap_set(&DEFAULT_BOOTSTRAP[..2]).unwrap();
        let down = set.iter().next().unwrap().clone();
        let dialer = ScriptedDialer::with_down(&[&down]);
        let policy = NetworkPolicy::default();

        let report = dial_bootstrap_set(&dialer, &set, None, &policy).await.unwrap();

        let attempts = dialer.attempts(&down);
        assert_eq!(attempts.len(), 2);
        let gap = attempts[1] - attempts[0];
        // One 30s backoff after a dial that took 10ms.
        assert_eq!(gap, Duration::from_secs(30) + Duration::from_millis(10));

        assert_eq!(report.reachable, 1);
        assert_eq!(report.unreachable_peers().collect::<Vec<_>>(), vec![&down]);
        assert!(matches!(
            report.outcomes[0].error,
            Some(DialError::Connect { .. })
        ));
        assert_eq!(report.total_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_dials_follow_set_order() {
        let set = default_bootstrap_set().unwrap();
        let dialer = ScriptedDialer::default();

        let report = dial_bootstrap_set(&dialer, &set, None, &NetworkPolicy::default())
            .await
            .unwrap();

        assert_eq!(dialer.max_in_flight.load(Ordering::SeqCst), 1);
        let firsts: Vec<Instant> = set.iter().map(|p| dialer.attempts(p)[0]).collect();
        assert!(firsts.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(report.reachable, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_dials_are_bounded_by_lookup_concurrency() {
        let set = default_bootstrap_set().unwrap();
        let dialer = ScriptedDialer::default();

        let report = dial_bootstrap_set(&dialer, &set, None, &parallel_policy()).await.unwrap();

        assert_eq!(dialer.max_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(report.reachable, 5);
        let order: Vec<&PeerAddress> = report.outcomes.iter().map(|o| &o.peer).collect();
        assert_eq!(order, set.iter().collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn fails_when_no_peer_is_reachable() {
        let set = default_bootstrap_set().unwrap();
        let all: Vec<&PeerAddress> = set.iter().collect();
        let dialer = ScriptedDialer::with_down(&all);

        let err = dial_bootstrap_set(&dialer, &set, None, &NetworkPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err, BootstrapError::NoReachablePeers { tried: 5 });
        for peer in &set {
            assert_eq!(dialer.attempts(peer).len(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_dial_times_out_and_is_retried() {
        let set = load_bootstrap_set(&DEFAULT_BOOTSTRAP[..2]).unwrap();
        let stuck = set.iter().next().unwrap().clone();
        let dialer = ScriptedDialer {
            hang: [stuck.clone()].into_iter().collect(),
            ..Default::default()
        };

        let report = dial_bootstrap_set(&dialer, &set, None, &NetworkPolicy::default())
            .await
            .unwrap();

        assert_eq!(dialer.attempts(&stuck).len(), 2);
        assert!(matches!(
            report.outcomes[0].error,
            Some(DialError::Timeout { .. })
        ));
        assert_eq!(report.reachable, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_own_address() {
        let set = default_bootstrap_set().unwrap();
        let own = set.iter().nth(2).unwrap().clone();
        let dialer = ScriptedDialer::default();

        let report = dial_bootstrap_set(&dialer, &set, Some(&own), &NetworkPolicy::default())
            .await
            .unwrap();

        assert!(dialer.attempts(&own).is_empty());
        assert_eq!(report.outcomes.len(), 4);
    }

    /// Fails the first attempt and succeeds on the last, each attempt using
    /// all but a millisecond of the dial timeout.
    struct LateDialer {
        attempts: std::sync::atomic::AtomicU32,
        latency: Duration,
    }

    impl Dialer for LateDialer {
        async fn dial(&self, peer: &PeerAddress) -> Result<(), DialError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            time::sleep(self.latency).await;
            if attempt == 1 {
                Err(DialError::Connect {
                    addr: peer.to_string(),
                    reason: "connection reset".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn peer_answering_at_end_of_budget_is_kept() {
        let set = load_bootstrap_set(&DEFAULT_BOOTSTRAP[..1]).unwrap();
        let policy = NetworkPolicy::default();
        let dialer = LateDialer {
            attempts: Default::default(),
            latency: policy.dial_timeout() - Duration::from_millis(1),
        };

        let start = Instant::now();
        let report = dial_bootstrap_set(&dialer, &set, None, &policy).await.unwrap();

        assert_eq!(report.reachable, 1);
        assert_eq!(report.outcomes[0].attempts, 2);
        assert!(start.elapsed() >= policy.per_peer_budget() - Duration::from_millis(2));
    }

    #[tokio::test]
    async fn set_of_only_self_is_empty() {
        let set = load_bootstrap_set(&DEFAULT_BOOTSTRAP[..1]).unwrap();
        let own = set.iter().next().unwrap().clone();
        let err = dial_bootstrap_set(&ScriptedDialer::default(), &set, Some(&own), &NetworkPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err, BootstrapError::EmptySet);
    }
}
