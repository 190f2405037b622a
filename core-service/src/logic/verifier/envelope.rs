//! Patch Envelope
//!
//! Wire unit submitted for admission. Signatures cover
//! `domain ‖ anchor.version ‖ anchor.digest ‖ payload_digest`, where the
//! payload digest binds the provenance and every op in order.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::keys::{PublicKey, SigningKeyPair};
use crate::constants::PATCH_SIGNING_DOMAIN;
use crate::logic::digest::{hex_bytes, ContentDigest, DigestBuilder};
use crate::logic::ledger::ChainHead;
use crate::logic::rules::{Provenance, RuleOp};

/// The state a patch claims to extend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAnchor {
    pub version: u64,
    pub digest: ContentDigest,
}

impl ChainAnchor {
    pub fn matches(&self, head: &ChainHead) -> bool {
        self.version == head.version && self.digest == head.digest
    }
}

impl From<ChainHead> for ChainAnchor {
    fn from(head: ChainHead) -> Self {
        Self {
            version: head.version,
            digest: head.digest,
        }
    }
}

impl std::fmt::Display for ChainAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}@{}", self.version, self.digest.short())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSignature {
    pub public_key: PublicKey,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEnvelope {
    pub patch_id: String,
    pub provenance: Provenance,
    pub anchor: ChainAnchor,
    pub ops: Vec<RuleOp>,
    #[serde(default)]
    pub signatures: Vec<PatchSignature>,
}

impl PatchEnvelope {
    /// Unsigned envelope with a fresh patch id
    pub fn new(provenance: Provenance, anchor: ChainAnchor, ops: Vec<RuleOp>) -> Self {
        Self {
            patch_id: Uuid::new_v4().to_string(),
            provenance,
            anchor,
            ops,
            signatures: Vec::new(),
        }
    }

    pub fn payload_digest(&self) -> ContentDigest {
        let mut b = DigestBuilder::new(b"shield.payload.v1");
        b.tag(self.provenance.tag()).u64(self.ops.len() as u64);
        for op in &self.ops {
            op.hash_into(&mut b);
        }
        b.finish()
    }

    /// Exact bytes every signature must cover
    pub fn signing_message(&self) -> Vec<u8> {
        let payload = self.payload_digest();
        let mut msg = Vec::with_capacity(PATCH_SIGNING_DOMAIN.len() + 8 + 64);
        msg.extend_from_slice(PATCH_SIGNING_DOMAIN);
        msg.extend_from_slice(&self.anchor.version.to_be_bytes());
        msg.extend_from_slice(self.anchor.digest.as_bytes());
        msg.extend_from_slice(payload.as_bytes());
        msg
    }

    /// Add a signature by `key`
    pub fn sign(&mut self, key: &SigningKeyPair) {
        let signature = key.sign(&self.signing_message());
        self.signatures.push(PatchSignature {
            public_key: key.public_key(),
            signature,
        });
    }

    pub fn signed_by(mut self, key: &SigningKeyPair) -> Self {
        self.sign(key);
        self
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
