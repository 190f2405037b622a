//! Verifier Module
//!
//! Admission control for hot patches: signature policy, chain-anchor check
//! and payload shape.
//!
//! ## Structure
//! - `keys.rs` - Ed25519 keys and the trust-tier policy
//! - `envelope.rs` - PatchEnvelope wire format and signing message
//! - `admit.rs` - Verifier, ValidatedPatch, VerifyError

pub mod admit;
pub mod envelope;
pub mod keys;

pub use admit::{ValidatedPatch, Verifier, VerifyError};
pub use envelope::{ChainAnchor, PatchEnvelope, PatchSignature};
pub use keys::{KeyError, PublicKey, SigningKeyPair, TrustPolicy};
