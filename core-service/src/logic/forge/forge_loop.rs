//! Forge Loop
//!
//! `IDLE -> ACCUMULATING -> SYNTHESIZING -> SUBMITTING -> IDLE`
//!
//! Candidates go through the same `Admission` gate as external patches,
//! signed with the forge key and anchored to the head seen at submit time.
//! Synthesis and submission both run on the blocking pool.
//! A stale or superseded candidate is dropped, never re-based: the next
//! window will propose again from fresh telemetry if the signal persists.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::synth::{CandidateRule, Synthesizer};
use super::window::{ForgeObservation, ForgeWindow};
use crate::logic::admission::{Admission, SubmitError};
use crate::logic::rules::{ApplyError, Provenance, RuleEntry, RuleOp, RuleSet};
use crate::logic::verifier::{PatchEnvelope, SigningKeyPair, VerifyError};

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ForgeState {
    Idle,
    Accumulating,
    Synthesizing,
    Submitting,
}

impl ForgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForgeState::Idle => "IDLE",
            ForgeState::Accumulating => "ACCUMULATING",
            ForgeState::Synthesizing => "SYNTHESIZING",
            ForgeState::Submitting => "SUBMITTING",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ForgeState::Accumulating,
            2 => ForgeState::Synthesizing,
            3 => ForgeState::Submitting,
            _ => ForgeState::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForgeStats {
    pub state: ForgeState,
    pub cycles: u64,
    pub candidates: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub discarded_stale: u64,
    pub skipped_existing: u64,
    pub abandoned: u64,
}

/// Shared view of a running loop
#[derive(Default)]
pub struct ForgeMonitor {
    state: AtomicU8,
    cycles: AtomicU64,
    candidates: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    discarded_stale: AtomicU64,
    skipped_existing: AtomicU64,
    abandoned: AtomicU64,
}

impl ForgeMonitor {
    pub fn state(&self) -> ForgeState {
        ForgeState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ForgeState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ForgeStats {
        ForgeStats {
            state: self.state(),
            cycles: self.cycles.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded_stale: self.discarded_stale.load(Ordering::Relaxed),
            skipped_existing: self.skipped_existing.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// LOOP
// ============================================================================

enum CycleEnd {
    Continue,
    Shutdown,
}

enum Submission {
    AlreadyActive,
    Submitted(Result<Arc<RuleSet>, SubmitError>),
}

pub struct ForgeLoop {
    rx: mpsc::Receiver<ForgeObservation>,
    window: ForgeWindow,
    synthesizer: Arc<dyn Synthesizer>,
    admission: Arc<Admission>,
    forge_key: Arc<SigningKeyPair>,
    shutdown: watch::Receiver<bool>,
    monitor: Arc<ForgeMonitor>,
    tick: Duration,
}

impl ForgeLoop {
    pub fn new(
        rx: mpsc::Receiver<ForgeObservation>,
        window: ForgeWindow,
        synthesizer: Arc<dyn Synthesizer>,
        admission: Arc<Admission>,
        forge_key: Arc<SigningKeyPair>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let tick = (window.max_age() / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        Self {
            rx,
            window,
            synthesizer,
            admission,
            forge_key,
            shutdown,
            monitor: Arc::new(ForgeMonitor::default()),
            tick,
        }
    }

    pub fn monitor(&self) -> Arc<ForgeMonitor> {
        Arc::clone(&self.monitor)
    }

    pub async fn run(mut self) {
        log::info!(
            "Forge loop started (forge key {})",
            self.forge_key.public_key().to_hex()
        );

        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown) => break,
                observation = self.rx.recv() => match observation {
                    Some(observation) => {
                        self.window.observe(observation);
                        if self.monitor.state() == ForgeState::Idle {
                            self.monitor.set_state(ForgeState::Accumulating);
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {}
            }

            if self.window.is_ready(Instant::now()) {
                if let CycleEnd::Shutdown = self.cycle().await {
                    break;
                }
            }
        }

        self.monitor.set_state(ForgeState::Idle);
        log::info!("Forge loop stopped");
    }

    /// One synthesis attempt. The window is cleared whatever happens.
    async fn cycle(&mut self) -> CycleEnd {
        let fresh = self.window.fresh();
        let window = std::mem::replace(&mut self.window, fresh);
        self.monitor.cycles.fetch_add(1, Ordering::Relaxed);
        self.monitor.set_state(ForgeState::Synthesizing);
        log::debug!(
            "Forge synthesizing over {} events ({} with verdicts, {} orphaned)",
            window.len(),
            window.paired(),
            window.orphaned()
        );

        let synthesizer = Arc::clone(&self.synthesizer);
        let rules = self.admission.store().current();
        let task = tokio::task::spawn_blocking(move || synthesizer.synthesize(&window, &rules));

        let candidates = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut self.shutdown) => {
                self.monitor.abandoned.fetch_add(1, Ordering::Relaxed);
                log::info!("Forge synthesis abandoned: shutting down");
                return CycleEnd::Shutdown;
            }
            joined = task => match joined {
                Ok(candidates) => candidates,
                Err(e) => {
                    log::error!("Synthesizer task failed: {}", e);
                    self.monitor.set_state(ForgeState::Idle);
                    return CycleEnd::Continue;
                }
            },
        };

        self.monitor
            .candidates
            .fetch_add(candidates.len() as u64, Ordering::Relaxed);
        self.monitor.set_state(ForgeState::Submitting);

        for candidate in candidates {
            if *self.shutdown.borrow() {
                self.monitor.abandoned.fetch_add(1, Ordering::Relaxed);
                return CycleEnd::Shutdown;
            }
            if let CycleEnd::Shutdown = self.submit(candidate).await {
                return CycleEnd::Shutdown;
            }
        }

        self.monitor.set_state(ForgeState::Idle);
        CycleEnd::Continue
    }

    /// Runs to completion once started; an apply is never cut short
    async fn submit(&self, candidate: CandidateRule) -> CycleEnd {
        let id = candidate.id.clone();
        let admission = Arc::clone(&self.admission);
        let forge_key = Arc::clone(&self.forge_key);
        let task = tokio::task::spawn_blocking(move || submit_candidate(&admission, &forge_key, candidate));

        let result = match task.await {
            Ok(Submission::AlreadyActive) => {
                self.monitor.skipped_existing.fetch_add(1, Ordering::Relaxed);
                return CycleEnd::Continue;
            }
            Ok(Submission::Submitted(result)) => result,
            Err(e) => {
                log::error!("Forge submission task for {} failed: {}", id, e);
                self.monitor.rejected.fetch_add(1, Ordering::Relaxed);
                return CycleEnd::Continue;
            }
        };

        match result {
            Ok(set) => {
                self.monitor.accepted.fetch_add(1, Ordering::Relaxed);
                log::info!("Forge rule {} active at v{}", id, set.version());
            }
            Err(SubmitError::Verify(VerifyError::StaleAnchor { .. }))
            | Err(SubmitError::Apply(ApplyError::Superseded { .. })) => {
                self.monitor.discarded_stale.fetch_add(1, Ordering::Relaxed);
                log::debug!("Forge candidate {} discarded: head moved", id);
            }
            Err(SubmitError::ShuttingDown) => return CycleEnd::Shutdown,
            Err(_) => {
                // already logged and audited by the gate
                self.monitor.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        CycleEnd::Continue
    }
}

/// Sign `candidate` against the current head and push it through admission
fn submit_candidate(admission: &Admission, forge_key: &SigningKeyPair, candidate: CandidateRule) -> Submission {
    let store = admission.store();
    if store.current().contains(&candidate.id) {
        return Submission::AlreadyActive;
    }

    let head = store.ledger().head();
    let rule = RuleEntry::new(
        &candidate.id,
        candidate.language,
        candidate.body,
        Provenance::Synthesized,
    );
    let envelope = PatchEnvelope::new(
        Provenance::Synthesized,
        head.into(),
        vec![RuleOp::Upsert { rule }],
    )
    .signed_by(forge_key);

    Submission::Submitted(admission.submit(envelope))
}

/// Resolves once shutdown is requested or the signal sender is gone
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::audit::AdmissionAudit;
    use crate::logic::engine::{Decision, Verdict};
    use crate::logic::forge::RepeatedTargetSynthesizer;
    use crate::logic::ledger::{LedgerError, LedgerJournal, LedgerRecord, MemoryJournal};
    use crate::logic::rules::{HeaderRuleLoader, RuleStore};
    use crate::logic::telemetry::TelemetryEvent;
    use crate::logic::verifier::{TrustPolicy, Verifier};
    use std::sync::atomic::AtomicBool;

    struct Harness {
        tx: mpsc::Sender<ForgeObservation>,
        stop: watch::Sender<bool>,
        admission: Arc<Admission>,
        monitor: Arc<ForgeMonitor>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn harness(requires_cosign: bool, synthesizer: Arc<dyn Synthesizer>) -> Harness {
        harness_over(requires_cosign, synthesizer, Box::new(MemoryJournal::new()))
    }

    fn harness_over(
        requires_cosign: bool,
        synthesizer: Arc<dyn Synthesizer>,
        journal: Box<dyn LedgerJournal>,
    ) -> Harness {
        let baseline = RuleSet::baseline(Vec::new(), &HeaderRuleLoader, 4096).unwrap();
        let store = Arc::new(RuleStore::bootstrap(baseline, journal, Arc::new(HeaderRuleLoader), 4096).unwrap());
        let forge_key = SigningKeyPair::from_seed(&[7u8; 32]);
        let mut policy = TrustPolicy::default().with_forge(forge_key.public_key());
        let forge_key = Arc::new(forge_key);
        policy.forge_requires_cosign = requires_cosign;
        let verifier = Verifier::new(Arc::clone(store.ledger()), policy, 4096);
        let admission = Arc::new(Admission::new(verifier, store, Arc::new(AdmissionAudit::new(64)), 1 << 20));

        let (tx, rx) = mpsc::channel(1024);
        let (stop, stop_rx) = watch::channel(false);
        let forge = ForgeLoop::new(
            rx,
            ForgeWindow::new(100, Duration::from_secs(3600)),
            synthesizer,
            Arc::clone(&admission),
            forge_key,
            stop_rx,
        );
        let monitor = forge.monitor();
        let handle = tokio::spawn(forge.run());
        Harness {
            tx,
            stop,
            admission,
            monitor,
            handle,
        }
    }

    async fn feed_blocks(tx: &mpsc::Sender<ForgeObservation>, target: &str, n: u64) {
        for seq in 1..=n {
            tx.send(ForgeObservation::Event(TelemetryEvent::new(seq, "p", "open", target, 0)))
                .await
                .unwrap();
            let mut v = Verdict::allow(seq, 0);
            v.decision = Decision::Block;
            tx.send(ForgeObservation::Verdict(v)).await.unwrap();
        }
    }

    async fn wait_cycles(monitor: &ForgeMonitor, n: u64) {
        for _ in 0..400 {
            let stats = monitor.stats();
            if stats.cycles >= n && stats.state == ForgeState::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("forge did not finish {} cycles", n);
    }

    #[tokio::test]
    async fn test_candidate_admitted_when_auto_admit() {
        let h = harness(false, Arc::new(RepeatedTargetSynthesizer::new(50)));
        feed_blocks(&h.tx, "/tmp/dropper", 100).await;
        wait_cycles(&h.monitor, 1).await;

        let current = h.admission.store().current();
        assert_eq!(current.version(), 1);
        let id = RepeatedTargetSynthesizer::rule_id("/tmp/dropper");
        let rule = current.get(&id).unwrap();
        assert_eq!(rule.entry.provenance, Provenance::Synthesized);
        assert_eq!(h.monitor.stats().accepted, 1);

        h.stop.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cosign_policy_rejects_and_audits() {
        let h = harness(true, Arc::new(RepeatedTargetSynthesizer::new(50)));
        feed_blocks(&h.tx, "/tmp/dropper", 100).await;
        wait_cycles(&h.monitor, 1).await;

        assert_eq!(h.admission.store().current().version(), 0);
        assert_eq!(h.monitor.stats().rejected, 1);
        let record = h.admission.audit().recent(1).pop().unwrap();
        assert_eq!(record.provenance, Provenance::Synthesized);
        assert_eq!(record.outcome, "cosignature_required");

        h.stop.send(true).unwrap();
        h.handle.await.unwrap();
    }

    struct SlowSynth;

    impl Synthesizer for SlowSynth {
        fn synthesize(&self, window: &ForgeWindow, rules: &RuleSet) -> Vec<CandidateRule> {
            std::thread::sleep(Duration::from_millis(300));
            RepeatedTargetSynthesizer::new(1).synthesize(window, rules)
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_synthesis_submits_nothing() {
        let h = harness(false, Arc::new(SlowSynth));
        feed_blocks(&h.tx, "/tmp/dropper", 100).await;

        for _ in 0..200 {
            if h.monitor.state() == ForgeState::Synthesizing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        h.stop.send(true).unwrap();
        h.handle.await.unwrap();

        assert_eq!(h.monitor.stats().abandoned, 1);
        assert_eq!(h.admission.store().current().version(), 0);
        assert!(h.admission.audit().recent(10).is_empty());
    }

    /// Journal whose appends hold the ledger guard for a while
    struct SlowJournal {
        in_append: Arc<AtomicBool>,
    }

    impl LedgerJournal for SlowJournal {
        fn load(&mut self) -> Result<Vec<LedgerRecord>, LedgerError> {
            Ok(Vec::new())
        }

        fn append(&mut self, _record: &LedgerRecord) -> std::io::Result<()> {
            self.in_append.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            self.in_append.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submission_leaves_runtime_responsive() {
        // single-threaded runtime: only observable if the append runs off-thread
        let in_append = Arc::new(AtomicBool::new(false));
        let journal = SlowJournal {
            in_append: Arc::clone(&in_append),
        };
        let h = harness_over(false, Arc::new(RepeatedTargetSynthesizer::new(50)), Box::new(journal));
        feed_blocks(&h.tx, "/tmp/dropper", 100).await;

        let mut seen = false;
        for _ in 0..1000 {
            if in_append.load(Ordering::SeqCst) {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(seen, "runtime never ran while the forge append was in flight");

        wait_cycles(&h.monitor, 1).await;
        assert_eq!(h.monitor.stats().accepted, 1);

        h.stop.send(true).unwrap();
        h.handle.await.unwrap();
    }
}
