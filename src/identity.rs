//! # Identity and Addressing
//!
//! This module defines the identity types used throughout Weft:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Address`]: 32-byte overlay address derived from the public key
//! - [`NodeInfo`]: value-like peer record (address, public key, transport contact)
//!
//! ## Identity Model
//!
//! Weft uses a simple identity model: **Address = Ed25519 Public Key**.
//! The address is derived deterministically from the node's long-lived key
//! and is immutable for the lifetime of the process. This provides:
//!
//! - **Self-certifying addresses**: possession of the private key proves
//!   ownership of the address, no external authority needed
//! - **XOR-metric routing**: addresses are points in a flat 256-bit space
//!   ordered by XOR distance to any target
//!
//! ## Distance
//!
//! The only operation on addresses beyond equality is XOR distance:
//! `closer_to(a, b, target)` holds iff `(a ^ target) < (b ^ target)` under
//! unsigned lexicographic comparison. For any `a`, `b`, `target`, exactly
//! one of `closer_to(a, b, t)`, `closer_to(b, a, t)`, `a == b` holds.
//!
//! ## Signatures
//!
//! Message bodies are signed with domain separation: the signature covers
//! the domain prefix plus the serialized body bytes, and nothing else.
//! Headers are intentionally not covered by the signature.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Domain separation prefix for message body signatures.
/// Prevents cross-protocol signature reuse.
const BODY_SIGNATURE_DOMAIN: &[u8] = b"weft-body-v1:";

/// Errors from signature verification on untrusted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The overlay address derived from this keypair's public key.
    pub fn address(&self) -> Address {
        Address::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }

    /// Build this node's own [`NodeInfo`] for the given transport contact.
    pub fn node_info(&self, contact: impl Into<String>) -> NodeInfo {
        NodeInfo {
            address: self.address(),
            public_key: self.public_key_bytes(),
            contact: contact.into(),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Fixed-width overlay address (W = 256 bits).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Address([u8; 32]);

impl Address {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// All-zero addresses are not derivable from any keypair and serve as
    /// the "invalid destination" sentinel.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    #[inline]
    pub fn xor_distance(&self, other: &Address) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Returns whether `a` is strictly closer to `target` than `b` under the
    /// XOR metric.
    #[inline]
    pub fn closer_to(a: &Address, b: &Address, target: &Address) -> bool {
        distance_cmp(&a.xor_distance(target), &b.xor_distance(target)) == std::cmp::Ordering::Less
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Address {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Address> for [u8; 32] {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Compare two XOR distances lexicographically.
///
/// Used to determine which of two addresses is closer to a target.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

/// Value-like peer record: overlay address, public key, and the opaque
/// handle the transport needs to reach the peer.
///
/// Equality and hashing are by address; a peer appears in multiple
/// containers only by copy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: Address,
    pub public_key: [u8; 32],
    pub contact: String,
}

impl NodeInfo {
    pub fn new(address: Address, public_key: [u8; 32], contact: impl Into<String>) -> Self {
        Self {
            address,
            public_key,
            contact: contact.into(),
        }
    }

    /// Check that the address is actually derived from the embedded public
    /// key and that the key is a valid Ed25519 point. An attacker cannot
    /// claim an arbitrary address with someone else's key.
    pub fn verify_binding(&self) -> bool {
        if self.address.as_bytes() != &self.public_key {
            return false;
        }
        VerifyingKey::try_from(self.public_key.as_slice()).is_ok()
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for NodeInfo {}

impl std::hash::Hash for NodeInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// Sign serialized body bytes with domain separation.
///
/// Returns a 64-byte Ed25519 signature covering exactly
/// `BODY_SIGNATURE_DOMAIN || body`.
pub fn sign_body(keypair: &Keypair, body: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(BODY_SIGNATURE_DOMAIN.len() + body.len());
    prefixed.extend_from_slice(BODY_SIGNATURE_DOMAIN);
    prefixed.extend_from_slice(body);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated body signature against the signer's address
/// (which is its public key).
pub fn verify_body(signer: &Address, body: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(signer.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(signature);
    let signature = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(BODY_SIGNATURE_DOMAIN.len() + body.len());
    prefixed.extend_from_slice(BODY_SIGNATURE_DOMAIN);
    prefixed.extend_from_slice(body);

    verifying_key
        .verify(&prefixed, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}
