use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::address::PeerAddress;
use crate::error::AddressFormatError;

/// Compiled-in bootstrap nodes, dialed in this order.
pub const DEFAULT_BOOTSTRAP: [&str; 5] = [
    "/ip4/52.78.129.188/tcp/18514/republic/8MKZ8JwCU9m9affPWHZ9rxp2azXNnE",
    "/ip4/52.79.194.108/tcp/18514/republic/8MHSHGyhQpsjznCJjehxRtTWSmAdyZ",
    "/ip4/13.125.27.7/tcp/18514/republic/8MGF6L5RKmZdR1fMeWDf7EUWwNMGkE",
    "/ip4/52.59.176.141/tcp/18514/republic/8MJhBp91z6dreJh8G3sSjRt1EYVsTQ",
    "/ip4/34.213.11.47/tcp/18514/republic/8MGN7j1LqLiR9QAFadv5sxDWu5wyY8",
];

/// Ordered, fully-validated list of peers used to join the overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapSet(Vec<PeerAddress>);

impl BootstrapSet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PeerAddress> {
        self.0.iter()
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.0.contains(peer)
    }

    /// Canonical strings, in order, as persisted in the configuration file.
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }

    /// Append peers that are not already present, keeping their order.
    ///
    /// Returns how many were added.
    pub fn extend_unique<I>(&mut self, peers: I) -> usize
    where
        I: IntoIterator<Item = PeerAddress>,
    {
        let before = self.0.len();
        for peer in peers {
            if !self.0.contains(&peer) {
                self.0.push(peer);
            }
        }
        self.0.len() - before
    }
}

impl<'a> IntoIterator for &'a BootstrapSet {
    type Item = &'a PeerAddress;
    type IntoIter = std::slice::Iter<'a, PeerAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Parse trusted bootstrap strings, all or nothing.
///
/// Order is preserved. The first malformed entry fails the whole load and is
/// reported with its index; no partial set is produced.
pub fn load_bootstrap_set<S: AsRef<str>>(raw: &[S]) -> Result<BootstrapSet, AddressFormatError> {
    let peers = raw
        .iter()
        .enumerate()
        .map(|(index, s)| {
            s.as_ref()
                .parse::<PeerAddress>()
                .map_err(|source| AddressFormatError::BootstrapEntry {
                    index,
                    source: Box::new(source),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    debug!(count = peers.len(), "Loaded bootstrap set");
    Ok(BootstrapSet(peers))
}

/// The compiled-in bootstrap set.
pub fn default_bootstrap_set() -> Result<BootstrapSet, AddressFormatError> {
    load_bootstrap_set(&DEFAULT_BOOTSTRAP)
}

/// Parse newline-separated peer addresses from an operator-supplied list.
///
/// Unlike [`load_bootstrap_set`] this input is not trusted: blank lines and
/// `#` comments are ignored, and invalid lines are skipped with a warning.
pub fn parse_peer_list(content: &str) -> Vec<PeerAddress> {
    let mut peers = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line.parse::<PeerAddress>() {
            Ok(peer) => peers.push(peer),
            Err(e) => {
                warn!(line = %line, error = %e, "Skipping malformed peer address");
            }
        }
    }

    debug!(count = peers.len(), "Parsed peer list");
    peers
}

/// Read an operator-supplied peer list from disk.
pub fn read_peer_list(path: &Path) -> Result<Vec<PeerAddress>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read peer list: {}", path.display()))?;
    let peers = parse_peer_list(&content);
    info!(path = %path.display(), peer_count = peers.len(), "Loaded extra bootstrap peers");
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_has_five_ordered_entries() {
        let set = default_bootstrap_set().unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.to_strings(), DEFAULT_BOOTSTRAP.to_vec());
    }

    #[test]
    fn preserves_input_order() {
        let reversed: Vec<&str> = DEFAULT_BOOTSTRAP.iter().rev().copied().collect();
        let set = load_bootstrap_set(&reversed).unwrap();
        let ports_and_ips: Vec<String> = set.iter().map(|p| p.ip().to_string()).collect();
        assert_eq!(ports_and_ips[0], "34.213.11.47");
        assert_eq!(ports_and_ips[4], "52.78.129.188");
    }

    #[test]
    fn single_malformed_entry_fails_the_whole_set() {
        let mut raw: Vec<String> = DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect();
        raw[3] = "/ip4/52.59.176.141/tcp/18514/republic/not-base58!".to_string();

        match load_bootstrap_set(&raw) {
            Err(AddressFormatError::BootstrapEntry { index, .. }) => assert_eq!(index, 3),
            other => panic!("expected BootstrapEntry error, got {other:?}"),
        }
    }

    #[test]
    fn empty_input_gives_empty_set() {
        let set = load_bootstrap_set::<&str>(&[]).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn peer_list_skips_comments_and_invalid_lines() {
        let content = format!(
            "# operators\n\n{}\ninvalid_multiaddr\n  {}  \n",
            DEFAULT_BOOTSTRAP[0], DEFAULT_BOOTSTRAP[1]
        );
        let peers = parse_peer_list(&content);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].to_string(), DEFAULT_BOOTSTRAP[1]);
    }

    #[test]
    fn extend_unique_ignores_duplicates() {
        let mut set = default_bootstrap_set().unwrap();
        let extra: PeerAddress = "/ip4/10.0.0.1/tcp/18514/republic/8MKZ8JwCU9m9affPWHZ9rxp2azXNnE"
            .parse()
            .unwrap();
        let duplicate: PeerAddress = DEFAULT_BOOTSTRAP[2].parse().unwrap();
        assert_eq!(set.extend_unique(vec![duplicate, extra.clone()]), 1);
        assert_eq!(set.len(), 6);
        assert!(set.contains(&extra));
    }

    #[test]
    fn reads_peer_list_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers");
        std::fs::write(&path, DEFAULT_BOOTSTRAP.join("\n")).unwrap();
        assert_eq!(read_peer_list(&path).unwrap().len(), 5);
        assert!(read_peer_list(&dir.path().join("missing")).is_err());
    }
}
