//! Node addresses and canonical peer multiaddresses.
//!
//! A [`NodeAddress`] is the base58 encoding of a keccak-256 multihash
//! wrapping the node's 20-byte ID:
//!
//! ```text
//! base58( 0x1B || 0x14 || id[0..20] )
//! ```
//!
//! A [`PeerAddress`] combines a node address with where to reach it, and is
//! exchanged between nodes in its canonical string form:
//!
//! ```text
//! /ip4/<IPV4>/tcp/<PORT>/republic/<NODE-ADDRESS>
//! ```
//!
//! That form is shared with every other node's bootstrap list and must not
//! change.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use base58::{FromBase58, ToBase58};
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;

use crate::error::AddressFormatError;

/// Protocol segment naming the overlay network.
pub const PROTOCOL_NAME: &str = "republic";

/// Length of a node ID in bytes.
pub const ID_LENGTH: usize = 20;

/// Multihash function code for keccak-256.
const MULTIHASH_KECCAK_256: u8 = 0x1B;

/// Fingerprint of a node's public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    encoded: String,
    id: [u8; ID_LENGTH],
}

impl NodeAddress {
    /// Wrap a 20-byte node ID.
    pub fn from_id(id: [u8; ID_LENGTH]) -> Self {
        let mut bytes = Vec::with_capacity(ID_LENGTH + 2);
        bytes.push(MULTIHASH_KECCAK_256);
        bytes.push(ID_LENGTH as u8);
        bytes.extend_from_slice(&id);
        Self {
            encoded: bytes.to_base58(),
            id,
        }
    }

    /// The raw 20-byte ID (also the node's account address on the ledger).
    pub fn id(&self) -> &[u8; ID_LENGTH] {
        &self.id
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl FromStr for NodeAddress {
    type Err = AddressFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| AddressFormatError::InvalidNodeAddress {
            value: s.to_owned(),
            reason,
        };

        let bytes = s.from_base58().map_err(|_| invalid("not base58"))?;
        if bytes.len() != ID_LENGTH + 2 {
            return Err(invalid("expected a 22-byte multihash"));
        }
        if bytes[0] != MULTIHASH_KECCAK_256 || bytes[1] as usize != ID_LENGTH {
            return Err(invalid("expected a keccak-256 multihash of length 20"));
        }

        let mut id = [0u8; ID_LENGTH];
        id.copy_from_slice(&bytes[2..]);
        let address = Self::from_id(id);
        if address.encoded != s {
            return Err(invalid("not canonically encoded"));
        }
        Ok(address)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self.encoded)
    }
}

/// Transport segment of a peer address. Only TCP is spoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{transport, ip, port, node_address}`, validated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    transport: Transport,
    ip: Ipv4Addr,
    port: u16,
    node_address: NodeAddress,
}

impl PeerAddress {
    /// Build a TCP peer address.
    ///
    /// Rejects the unspecified address and port 0: neither can be dialed by
    /// another node.
    pub fn tcp(ip: Ipv4Addr, port: u16, node_address: NodeAddress) -> Result<Self, AddressFormatError> {
        if ip.is_unspecified() {
            return Err(AddressFormatError::InvalidIp(ip.to_string()));
        }
        if port == 0 {
            return Err(AddressFormatError::InvalidPort(port.to_string()));
        }
        Ok(Self {
            transport: Transport::Tcp,
            ip,
            port,
            node_address,
        })
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn node_address(&self) -> &NodeAddress {
        &self.node_address
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// The dialable part of the address as a libp2p multiaddr.
    ///
    /// The node address is not a libp2p peer ID, so it is left out.
    pub fn to_multiaddr(&self) -> Multiaddr {
        Multiaddr::empty()
            .with(Protocol::Ip4(self.ip))
            .with(Protocol::Tcp(self.port))
    }

    /// Check that the canonical form parses back to the same value.
    pub fn verify_round_trip(&self) -> Result<(), AddressFormatError> {
        let canonical = self.to_string();
        let reparsed: PeerAddress = canonical.parse()?;
        if &reparsed != self {
            return Err(AddressFormatError::NonCanonical(canonical));
        }
        Ok(())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/ip4/{}/{}/{}/{}/{}",
            self.ip, self.transport, self.port, PROTOCOL_NAME, self.node_address
        )
    }
}

impl FromStr for PeerAddress {
    type Err = AddressFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| AddressFormatError::MissingLeadingSlash { input: s.to_owned() })?;

        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() != 6 {
            return Err(AddressFormatError::SegmentCount {
                input: s.to_owned(),
                found: segments.len(),
            });
        }

        let expect_tag = |index: usize, expected: &'static str| {
            if segments[index] == expected {
                Ok(())
            } else {
                Err(AddressFormatError::UnexpectedTag {
                    input: s.to_owned(),
                    index,
                    expected,
                    found: segments[index].to_owned(),
                })
            }
        };
        expect_tag(0, "ip4")?;
        expect_tag(2, Transport::Tcp.as_str())?;
        expect_tag(4, PROTOCOL_NAME)?;

        let ip: Ipv4Addr = segments[1]
            .parse()
            .map_err(|_| AddressFormatError::InvalidIp(segments[1].to_owned()))?;

        // Only the canonical decimal spelling is accepted, so that the string
        // form is unique.
        let port: u16 = segments[3]
            .parse()
            .ok()
            .filter(|p: &u16| p.to_string() == segments[3])
            .ok_or_else(|| AddressFormatError::InvalidPort(segments[3].to_owned()))?;

        let node_address: NodeAddress = segments[5].parse()?;

        PeerAddress::tcp(ip, port, node_address)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_node_address() -> impl Strategy<Value = NodeAddress> {
        any::<[u8; ID_LENGTH]>().prop_map(NodeAddress::from_id)
    }

    fn arb_peer_address() -> impl Strategy<Value = PeerAddress> {
        (
            any::<u32>().prop_filter("dialable ip", |ip| *ip != 0),
            1u16..,
            arb_node_address(),
        )
            .prop_map(|(ip, port, node)| {
                PeerAddress::tcp(Ipv4Addr::from(ip), port, node).expect("valid peer address")
            })
    }

    proptest! {
        #[test]
        fn peer_address_survives_canonical_form(addr in arb_peer_address()) {
            let reparsed: PeerAddress = addr.to_string().parse().expect("canonical form must parse");
            prop_assert_eq!(&reparsed, &addr);
            prop_assert!(addr.verify_round_trip().is_ok());
        }

        #[test]
        fn node_address_survives_base58(id in any::<[u8; ID_LENGTH]>()) {
            let address = NodeAddress::from_id(id);
            let reparsed = NodeAddress::from_str(address.as_str()).expect("base58 form must parse");
            prop_assert_eq!(reparsed.id(), &id);
            prop_assert_eq!(reparsed, address);
        }
    }
}
