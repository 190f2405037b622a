//! Admission Gate
//!
//! Single path for every patch, external or synthesized:
//! `Verifier::admit` -> `RuleStore::apply`, outcome recorded in the audit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::logic::audit::{AdmissionAudit, AdmissionRecord};
use crate::logic::rules::{ApplyError, Provenance, RuleSet, RuleStore};
use crate::logic::verifier::{PatchEnvelope, Verifier, VerifyError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("admission closed: shutting down")]
    ShuttingDown,
}

impl SubmitError {
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::Verify(e) => e.kind(),
            SubmitError::Apply(e) => e.kind(),
            SubmitError::ShuttingDown => "shutting_down",
        }
    }
}

pub struct Admission {
    verifier: Verifier,
    store: Arc<RuleStore>,
    audit: Arc<AdmissionAudit>,
    max_patch_bytes: usize,
    shutting_down: AtomicBool,
}

impl Admission {
    pub fn new(
        verifier: Verifier,
        store: Arc<RuleStore>,
        audit: Arc<AdmissionAudit>,
        max_patch_bytes: usize,
    ) -> Self {
        Self {
            verifier,
            store,
            audit,
            max_patch_bytes,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Raw ingress bytes. Oversized or undecodable payloads are malformed
    /// envelopes.
    pub fn submit_bytes(&self, bytes: &[u8]) -> Result<Arc<RuleSet>, SubmitError> {
        if self.is_shutting_down() {
            return Err(SubmitError::ShuttingDown);
        }
        if bytes.len() > self.max_patch_bytes {
            let err = VerifyError::MalformedEnvelope(format!(
                "payload is {} bytes, limit {}",
                bytes.len(),
                self.max_patch_bytes
            ));
            log::warn!("Rejected patch <unparsed>: {}", err);
            return Err(err.into());
        }
        let envelope = PatchEnvelope::from_json(bytes).map_err(|e| {
            let err = VerifyError::MalformedEnvelope(e.to_string());
            log::warn!("Rejected patch <unparsed>: {}", err);
            SubmitError::from(err)
        })?;
        self.submit(envelope)
    }

    pub fn submit(&self, envelope: PatchEnvelope) -> Result<Arc<RuleSet>, SubmitError> {
        if self.is_shutting_down() {
            return Err(SubmitError::ShuttingDown);
        }

        let patch_id = envelope.patch_id.clone();
        let provenance = envelope.provenance;
        // forge patches may be parked for a co-signature
        let pending = (provenance == Provenance::Synthesized).then(|| envelope.clone());

        let result = match self.verifier.admit(envelope) {
            Ok(patch) => {
                let payload = patch.payload_digest();
                self.store
                    .apply(patch)
                    .map(|set| (set, payload))
                    .map_err(SubmitError::from)
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok((set, payload)) => {
                log::info!(
                    "Accepted {} patch {} -> v{} ({}, payload {})",
                    provenance,
                    patch_id,
                    set.version(),
                    set.digest().short(),
                    payload.short()
                );
                self.audit.record(
                    AdmissionRecord::accepted(&patch_id, provenance, set.version()).with_payload(payload),
                );
                Ok(set)
            }
            Err(e) => {
                log::warn!("Rejected {} patch {}: {}", provenance, patch_id, e);
                let mut record = AdmissionRecord::rejected(&patch_id, provenance, e.kind(), e.to_string());
                if let (SubmitError::Verify(VerifyError::CosignatureRequired), Some(envelope)) = (&e, pending) {
                    log::info!(
                        "Holding forge patch {} for co-signature (payload {})",
                        patch_id,
                        envelope.payload_digest().short()
                    );
                    record = record.holding(envelope);
                }
                self.audit.record(record);
                Err(e)
            }
        }
    }

    /// New submissions fail from here on; an apply already under the
    /// ledger guard still completes.
    pub fn close(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AdmissionAudit> {
        &self.audit
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::rules::{HeaderRuleLoader, Provenance, RuleEntry, RuleLanguage, RuleOp};
    use crate::logic::verifier::{SigningKeyPair, TrustPolicy};

    fn setup(max_patch_bytes: usize) -> (Admission, SigningKeyPair) {
        let baseline = RuleSet::baseline(Vec::new(), &HeaderRuleLoader, 4096).unwrap();
        let store = Arc::new(RuleStore::in_memory(baseline, Arc::new(HeaderRuleLoader), 4096).unwrap());
        let key = SigningKeyPair::from_seed(&[1u8; 32]);
        let policy = TrustPolicy::default().with_external(key.public_key());
        let verifier = Verifier::new(Arc::clone(store.ledger()), policy, 4096);
        let admission = Admission::new(verifier, store, Arc::new(AdmissionAudit::new(16)), max_patch_bytes);
        (admission, key)
    }

    fn envelope(admission: &Admission, key: &SigningKeyPair) -> PatchEnvelope {
        let rule = RuleEntry::new("r1", RuleLanguage::Yara, "@decision flag\n@match subject ^nc$", Provenance::Patch);
        PatchEnvelope::new(
            Provenance::Patch,
            admission.store().ledger().head().into(),
            vec![RuleOp::Upsert { rule }],
        )
        .signed_by(key)
    }

    #[test]
    fn test_submit_bytes_accepts_and_audits() {
        let (admission, key) = setup(1 << 20);
        let env = envelope(&admission, &key);
        let bytes = env.to_json().unwrap();

        let set = admission.submit_bytes(&bytes).unwrap();
        assert_eq!(set.version(), 1);
        let record = admission.audit().find(&env.patch_id).unwrap();
        assert!(record.is_accepted());
        assert_eq!(record.version, Some(1));
        assert_eq!(record.payload, Some(env.payload_digest()));
        assert!(record.held.is_none());
    }

    #[test]
    fn test_forge_patch_without_cosign_is_held_for_operator() {
        let baseline = RuleSet::baseline(Vec::new(), &HeaderRuleLoader, 4096).unwrap();
        let store = Arc::new(RuleStore::in_memory(baseline, Arc::new(HeaderRuleLoader), 4096).unwrap());
        let operator = SigningKeyPair::from_seed(&[1u8; 32]);
        let forge = SigningKeyPair::from_seed(&[2u8; 32]);
        let policy = TrustPolicy::default()
            .with_external(operator.public_key())
            .with_forge(forge.public_key());
        let verifier = Verifier::new(Arc::clone(store.ledger()), policy, 4096);
        let admission = Admission::new(verifier, store, Arc::new(AdmissionAudit::new(16)), 1 << 20);

        let rule = RuleEntry::new("f1", RuleLanguage::Sigma, "@decision block\n@match target ^/tmp/x$", Provenance::Synthesized);
        let env = PatchEnvelope::new(
            Provenance::Synthesized,
            admission.store().ledger().head().into(),
            vec![RuleOp::Upsert { rule }],
        )
        .signed_by(&forge);
        assert!(matches!(
            admission.submit(env.clone()),
            Err(SubmitError::Verify(VerifyError::CosignatureRequired))
        ));

        // the held envelope, co-signed by an operator, goes through
        let record = admission.audit().find(&env.patch_id).unwrap();
        assert_eq!(record.outcome, "cosignature_required");
        assert_eq!(record.payload, Some(env.payload_digest()));
        let held = record.held.unwrap();
        assert_eq!(held, env);
        let set = admission.submit(held.signed_by(&operator)).unwrap();
        assert!(set.contains("f1"));
    }

    #[test]
    fn test_oversized_and_garbage_are_malformed_envelopes() {
        let (admission, key) = setup(64);
        let bytes = envelope(&admission, &key).to_json().unwrap();
        assert!(matches!(
            admission.submit_bytes(&bytes),
            Err(SubmitError::Verify(VerifyError::MalformedEnvelope(_)))
        ));
        assert!(matches!(
            admission.submit_bytes(b"{"),
            Err(SubmitError::Verify(VerifyError::MalformedEnvelope(_)))
        ));
        assert_eq!(admission.store().current().version(), 0);
    }

    #[test]
    fn test_closed_admission_rejects() {
        let (admission, key) = setup(1 << 20);
        admission.close();
        let env = envelope(&admission, &key);
        assert!(matches!(admission.submit(env), Err(SubmitError::ShuttingDown)));
        assert_eq!(admission.store().ledger().head().version, 0);
    }
}
