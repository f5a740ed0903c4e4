//! secp256k1 key management for darknodes.
//!
//! A single secp256k1 keypair serves as the node's identity:
//! - the 20-byte node ID and its base58 [`NodeAddress`]
//! - the libp2p identity of the listener (via libp2p's secp256k1 support)
//! - the account the ledger client signs with
//!
//! Keys are stored as raw lowercase hex (32 bytes = 64 hex chars), either in
//! a standalone key file or inline in the node configuration.

use std::path::Path;

use k256::ecdsa::SigningKey;
use libp2p::identity::Keypair;
use sha3::{Digest, Keccak256};
use tracing::{debug, info};

use crate::address::{NodeAddress, ID_LENGTH};
use crate::error::{ConfigError, ExternalDependencyError, Result};

/// Generate a new random secp256k1 signing key using the OS CSPRNG.
pub fn generate() -> Result<SigningKey, ExternalDependencyError> {
    use rand::RngCore;
    let mut secret_bytes = [0u8; 32];
    rand::rngs::OsRng
        .try_fill_bytes(&mut secret_bytes)
        .map_err(|e| ExternalDependencyError::Entropy(e.to_string()))?;
    SigningKey::from_bytes((&secret_bytes).into()).map_err(|_| {
        ExternalDependencyError::Entropy("CSPRNG produced an invalid secp256k1 scalar".into())
    })
}

/// Derive the node ID from a secp256k1 signing key.
///
/// Returns the last 20 bytes of `Keccak256(uncompressed_pubkey[1..])`, which
/// is also the key's EVM account address.
pub fn node_id(sk: &SigningKey) -> [u8; ID_LENGTH] {
    let vk = sk.verifying_key();
    let uncompressed = vk.to_encoded_point(false); // 65 bytes: 0x04 || x || y
    let pubkey_bytes = &uncompressed.as_bytes()[1..];
    let hash = Keccak256::digest(pubkey_bytes);
    let mut id = [0u8; ID_LENGTH];
    id.copy_from_slice(&hash[32 - ID_LENGTH..]);
    id
}

/// Derive the base58 node address from a secp256k1 signing key.
pub fn node_address(sk: &SigningKey) -> NodeAddress {
    NodeAddress::from_id(node_id(sk))
}

/// Convert a k256 [`SigningKey`] into a libp2p [`Keypair`] (secp256k1).
///
/// The resulting keypair can be used directly with [`libp2p::SwarmBuilder::with_existing_identity`].
pub fn to_libp2p(sk: &SigningKey) -> anyhow::Result<Keypair> {
    use anyhow::Context;
    let secret = libp2p::identity::secp256k1::SecretKey::try_from_bytes(sk.to_bytes().to_vec())
        .context("failed to convert secp256k1 key to libp2p identity")?;
    let kp = libp2p::identity::secp256k1::Keypair::from(secret);
    Ok(Keypair::from(kp))
}

/// Encode a signing key as 64 lowercase hex characters.
pub fn to_hex(sk: &SigningKey) -> String {
    hex::encode(sk.to_bytes())
}

/// Decode a hex-encoded 32-byte secp256k1 secret, ignoring surrounding whitespace.
pub fn from_hex(hex_str: &str) -> Result<SigningKey, ConfigError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| ConfigError::InvalidKey(format!("not hex: {e}")))?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey(format!(
            "expected 32-byte key, got {} bytes",
            bytes.len()
        )));
    }

    SigningKey::from_bytes(bytes.as_slice().into())
        .map_err(|_| ConfigError::InvalidKey("not a valid secp256k1 secret scalar".into()))
}

/// Load a hex-encoded secp256k1 private key from a local filesystem path.
pub fn load(path: &Path) -> Result<SigningKey, ConfigError> {
    let hex_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    from_hex(&hex_str)
}

/// Write a hex-encoded secp256k1 private key to disk.
///
/// Parent directories are created as needed. The file is written as 64
/// lowercase hex characters with no trailing newline.
pub fn save(sk: &SigningKey, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, to_hex(sk)).map_err(write_err)
}

/// Return the identity persisted at `path`, or a fresh one if there is none.
///
/// A fresh key is not written; persisting it is up to the caller. A key file
/// that exists but does not parse is an error rather than a reason to
/// generate over it.
pub fn load_or_create(path: &Path) -> Result<(SigningKey, NodeAddress)> {
    let sk = if path.exists() {
        let sk = load(path)?;
        debug!(path = %path.display(), "Loaded node identity");
        sk
    } else {
        let sk = generate()?;
        info!(path = %path.display(), "Generated new node identity");
        sk
    };
    let address = node_address(&sk);
    Ok((sk, address))
}
