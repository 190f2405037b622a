//! Keys & Trust Policy
//!
//! Private keys never serialize and never log. Public keys and signatures
//! travel as lowercase hex.

use ed25519_dalek::{Signer, Verifier as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::constants::DEFAULT_SIGNATURE_THRESHOLD;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("invalid ed25519 public key: {0}")]
    InvalidKey(String),
}

// ============================================================================
// PUBLIC KEY
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|e| KeyError::Hex(e.to_string()))?;
        // reject points that are not valid curve points up front
        ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Verify a 64-byte signature over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..6]))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// KEY PAIR
// ============================================================================

/// Ed25519 signing key. Does not implement `Serialize` or `Debug` output of
/// secret material.
pub struct SigningKeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    pub fn from_seed_hex(s: &str) -> Result<Self, KeyError> {
        let mut seed = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut seed).map_err(|e| KeyError::Hex(e.to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKeyPair(public={:?})", self.public_key())
    }
}

// ============================================================================
// TRUST POLICY
// ============================================================================

/// Which keys may admit which patches.
///
/// External keys sign operator patches; forge keys sign synthesized ones and
/// form a separate tier. With `forge_requires_cosign`, a synthesized patch
/// also needs at least one external (human) signature.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    pub external_keys: Vec<PublicKey>,
    pub external_threshold: usize,
    pub forge_keys: Vec<PublicKey>,
    pub forge_requires_cosign: bool,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            external_keys: Vec::new(),
            external_threshold: DEFAULT_SIGNATURE_THRESHOLD,
            forge_keys: Vec::new(),
            forge_requires_cosign: true,
        }
    }
}

impl TrustPolicy {
    pub fn with_external(mut self, key: PublicKey) -> Self {
        self.external_keys.push(key);
        self
    }

    pub fn with_forge(mut self, key: PublicKey) -> Self {
        self.forge_keys.push(key);
        self
    }

    /// Threshold is never below 1-of-N
    pub fn effective_threshold(&self) -> usize {
        self.external_threshold.max(1)
    }

    pub fn is_external(&self, key: &PublicKey) -> bool {
        self.external_keys.contains(key)
    }

    pub fn is_forge(&self, key: &PublicKey) -> bool {
        self.forge_keys.contains(key)
    }
}
