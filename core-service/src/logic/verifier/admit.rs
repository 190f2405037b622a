//! Patch Admission
//!
//! Checks, in order, first failure wins:
//! 1. signatures satisfy the trust policy for the patch's provenance
//! 2. the anchor equals the ledger head (version and digest)
//! 3. the payload is structurally sane
//!
//! Success yields a single-use `ValidatedPatch` bound to the anchor it was
//! checked against. `RuleStore::apply` re-checks that anchor under the
//! ledger's append lock.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use super::envelope::{ChainAnchor, PatchEnvelope};
use super::keys::{PublicKey, TrustPolicy};
use crate::logic::digest::ContentDigest;
use crate::logic::ledger::{ChainHead, ChainLedger};
use crate::logic::rules::{Provenance, RuleOp};

// ============================================================================
// ERRORS
// ============================================================================

/// Rejection of untrusted input. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("bad signature: {0}")]
    BadSignature(String),

    #[error("stale anchor: patch extends {got}, head is {head}")]
    StaleAnchor { got: ChainAnchor, head: ChainHead },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("synthesized patch requires a human co-signature")]
    CosignatureRequired,
}

impl VerifyError {
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::BadSignature(_) => "bad_signature",
            VerifyError::StaleAnchor { .. } => "stale_anchor",
            VerifyError::MalformedEnvelope(_) => "malformed_envelope",
            VerifyError::CosignatureRequired => "cosignature_required",
        }
    }
}

// ============================================================================
// VALIDATED PATCH
// ============================================================================

/// Admission token. Not `Clone`: consumed by exactly one `apply`.
#[derive(Debug)]
pub struct ValidatedPatch {
    patch_id: String,
    provenance: Provenance,
    anchor: ChainAnchor,
    payload_digest: ContentDigest,
    ops: Vec<RuleOp>,
}

impl ValidatedPatch {
    pub fn patch_id(&self) -> &str {
        &self.patch_id
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn anchor(&self) -> ChainAnchor {
        self.anchor
    }

    pub fn payload_digest(&self) -> ContentDigest {
        self.payload_digest
    }

    pub fn ops(&self) -> &[RuleOp] {
        &self.ops
    }

    pub(crate) fn into_ops(self) -> Vec<RuleOp> {
        self.ops
    }
}

// ============================================================================
// VERIFIER
// ============================================================================

pub struct Verifier {
    ledger: Arc<ChainLedger>,
    policy: TrustPolicy,
    max_rule_bytes: usize,
}

impl Verifier {
    pub fn new(ledger: Arc<ChainLedger>, policy: TrustPolicy, max_rule_bytes: usize) -> Self {
        Self {
            ledger,
            policy,
            max_rule_bytes,
        }
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    pub fn admit(&self, envelope: PatchEnvelope) -> Result<ValidatedPatch, VerifyError> {
        self.check_signatures(&envelope)?;

        let head = self.ledger.head();
        if !envelope.anchor.matches(&head) {
            return Err(VerifyError::StaleAnchor {
                got: envelope.anchor,
                head,
            });
        }

        self.check_payload(&envelope.ops)?;

        let payload_digest = envelope.payload_digest();
        Ok(ValidatedPatch {
            patch_id: envelope.patch_id,
            provenance: envelope.provenance,
            anchor: envelope.anchor,
            payload_digest,
            ops: envelope.ops,
        })
    }

    fn check_signatures(&self, envelope: &PatchEnvelope) -> Result<(), VerifyError> {
        if envelope.provenance == Provenance::Baseline {
            return Err(VerifyError::MalformedEnvelope(
                "baseline provenance cannot be submitted as a patch".to_string(),
            ));
        }

        let message = envelope.signing_message();
        let mut external: HashSet<PublicKey> = HashSet::new();
        let mut forge: HashSet<PublicKey> = HashSet::new();

        for sig in &envelope.signatures {
            let key = sig.public_key;
            let trusted_external = self.policy.is_external(&key);
            let trusted_forge = self.policy.is_forge(&key);
            if !trusted_external && !trusted_forge {
                // unknown signers carry no weight
                continue;
            }
            if !key.verify(&message, &sig.signature) {
                return Err(VerifyError::BadSignature(format!(
                    "signature by {:?} does not verify",
                    key
                )));
            }
            if trusted_external {
                external.insert(key);
            }
            if trusted_forge {
                forge.insert(key);
            }
        }

        match envelope.provenance {
            Provenance::Synthesized => {
                if forge.is_empty() {
                    return Err(VerifyError::BadSignature(
                        "synthesized patch lacks a forge signature".to_string(),
                    ));
                }
                if self.policy.forge_requires_cosign && external.is_empty() {
                    return Err(VerifyError::CosignatureRequired);
                }
            }
            _ => {
                let needed = self.policy.effective_threshold();
                if external.len() < needed {
                    return Err(VerifyError::BadSignature(format!(
                        "{} of {} required trusted signatures",
                        external.len(),
                        needed
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_payload(&self, ops: &[RuleOp]) -> Result<(), VerifyError> {
        if ops.is_empty() {
            return Err(VerifyError::MalformedEnvelope("patch has no operations".to_string()));
        }

        let mut seen = HashSet::new();
        for op in ops {
            if !seen.insert(op.rule_id()) {
                return Err(VerifyError::MalformedEnvelope(format!(
                    "rule '{}' appears twice in one patch",
                    op.rule_id()
                )));
            }
            match op {
                RuleOp::Upsert { rule } => {
                    rule.check_identifier().map_err(VerifyError::MalformedEnvelope)?;
                    if rule.body.len() > self.max_rule_bytes {
                        return Err(VerifyError::MalformedEnvelope(format!(
                            "rule '{}' body is {} bytes, limit {}",
                            rule.id,
                            rule.body.len(),
                            self.max_rule_bytes
                        )));
                    }
                }
                RuleOp::Remove { id } => {
                    if id.is_empty() {
                        return Err(VerifyError::MalformedEnvelope("remove with empty id".to_string()));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::rules::{RuleEntry, RuleLanguage};
    use crate::logic::verifier::SigningKeyPair;

    struct Fixture {
        ledger: Arc<ChainLedger>,
        operator: SigningKeyPair,
        forge: SigningKeyPair,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ledger: Arc::new(ChainLedger::in_memory(ContentDigest([0u8; 32])).unwrap()),
                operator: SigningKeyPair::from_seed(&[1u8; 32]),
                forge: SigningKeyPair::from_seed(&[2u8; 32]),
            }
        }

        fn verifier(&self, cosign: bool) -> Verifier {
            let policy = TrustPolicy {
                forge_requires_cosign: cosign,
                ..TrustPolicy::default()
            }
            .with_external(self.operator.public_key())
            .with_forge(self.forge.public_key());
            Verifier::new(self.ledger.clone(), policy, 1024)
        }

        fn envelope(&self, provenance: Provenance) -> PatchEnvelope {
            PatchEnvelope::new(
                provenance,
                self.ledger.head().into(),
                vec![RuleOp::Upsert {
                    rule: RuleEntry::new("r1", RuleLanguage::Yara, "@decision block\n@match target x", provenance),
                }],
            )
        }
    }

    #[test]
    fn test_admits_operator_patch() {
        let fx = Fixture::new();
        let patch = fx
            .verifier(true)
            .admit(fx.envelope(Provenance::Patch).signed_by(&fx.operator))
            .unwrap();
        assert_eq!(patch.anchor().version, 0);
        assert_eq!(patch.ops().len(), 1);
    }

    #[test]
    fn test_rejects_unsigned_and_untrusted() {
        let fx = Fixture::new();
        let v = fx.verifier(true);

        let err = v.admit(fx.envelope(Provenance::Patch)).unwrap_err();
        assert!(matches!(err, VerifyError::BadSignature(_)));

        let stranger = SigningKeyPair::from_seed(&[3u8; 32]);
        let err = v
            .admit(fx.envelope(Provenance::Patch).signed_by(&stranger))
            .unwrap_err();
        assert!(matches!(err, VerifyError::BadSignature(_)));
    }

    #[test]
    fn test_rejects_tampered_payload() {
        let fx = Fixture::new();
        let mut env = fx.envelope(Provenance::Patch).signed_by(&fx.operator);
        env.ops.push(RuleOp::Remove { id: "other".to_string() });
        let err = fx.verifier(true).admit(env).unwrap_err();
        assert!(matches!(err, VerifyError::BadSignature(_)));
    }

    #[test]
    fn test_signature_checked_before_anchor() {
        let fx = Fixture::new();
        let mut env = fx.envelope(Provenance::Patch);
        env.anchor.version = 7;
        let err = fx.verifier(true).admit(env).unwrap_err();
        assert!(matches!(err, VerifyError::BadSignature(_)));
    }

    #[test]
    fn test_rejects_stale_anchor() {
        let fx = Fixture::new();
        let env = fx.envelope(Provenance::Patch).signed_by(&fx.operator);
        fx.ledger
            .append(1, ContentDigest([1u8; 32]), Provenance::Patch)
            .unwrap();
        let err = fx.verifier(true).admit(env).unwrap_err();
        assert!(matches!(err, VerifyError::StaleAnchor { .. }));
    }

    #[test]
    fn test_threshold_counts_distinct_keys() {
        let fx = Fixture::new();
        let second = SigningKeyPair::from_seed(&[4u8; 32]);
        let policy = TrustPolicy {
            external_threshold: 2,
            ..TrustPolicy::default()
        }
        .with_external(fx.operator.public_key())
        .with_external(second.public_key());
        let v = Verifier::new(fx.ledger.clone(), policy, 1024);

        let twice = fx
            .envelope(Provenance::Patch)
            .signed_by(&fx.operator)
            .signed_by(&fx.operator);
        assert!(matches!(v.admit(twice), Err(VerifyError::BadSignature(_))));

        let both = fx
            .envelope(Provenance::Patch)
            .signed_by(&fx.operator)
            .signed_by(&second);
        assert!(v.admit(both).is_ok());
    }

    #[test]
    fn test_forge_tier_policy() {
        let fx = Fixture::new();

        let forge_only = fx.envelope(Provenance::Synthesized).signed_by(&fx.forge);
        assert_eq!(
            fx.verifier(true).admit(forge_only.clone()).unwrap_err(),
            VerifyError::CosignatureRequired
        );
        assert!(fx.verifier(false).admit(forge_only).is_ok());

        let cosigned = fx
            .envelope(Provenance::Synthesized)
            .signed_by(&fx.forge)
            .signed_by(&fx.operator);
        assert!(fx.verifier(true).admit(cosigned).is_ok());

        // an operator key alone cannot pass off a synthesized patch
        let operator_only = fx.envelope(Provenance::Synthesized).signed_by(&fx.operator);
        assert!(matches!(
            fx.verifier(true).admit(operator_only),
            Err(VerifyError::BadSignature(_))
        ));

        // a forge key alone cannot sign an operator patch
        let forged_patch = fx.envelope(Provenance::Patch).signed_by(&fx.forge);
        assert!(matches!(
            fx.verifier(false).admit(forged_patch),
            Err(VerifyError::BadSignature(_))
        ));
    }

    #[test]
    fn test_payload_shape() {
        let fx = Fixture::new();
        let v = fx.verifier(true);

        let mut empty = fx.envelope(Provenance::Patch);
        empty.ops.clear();
        let err = v.admit(empty.signed_by(&fx.operator)).unwrap_err();
        assert!(matches!(err, VerifyError::MalformedEnvelope(_)));

        let mut dup = fx.envelope(Provenance::Patch);
        dup.ops.push(RuleOp::Remove { id: "r1".to_string() });
        let err = v.admit(dup.signed_by(&fx.operator)).unwrap_err();
        assert!(matches!(err, VerifyError::MalformedEnvelope(_)));

        let mut huge = fx.envelope(Provenance::Patch);
        huge.ops = vec![RuleOp::Upsert {
            rule: RuleEntry::new("big", RuleLanguage::Yara, vec![b'a'; 2048], Provenance::Patch),
        }];
        let err = v.admit(huge.signed_by(&fx.operator)).unwrap_err();
        assert!(matches!(err, VerifyError::MalformedEnvelope(_)));

        let baseline = fx.envelope(Provenance::Baseline).signed_by(&fx.operator);
        assert!(matches!(v.admit(baseline), Err(VerifyError::MalformedEnvelope(_))));
    }
}
