//! Shield Runtime
//!
//! Process-scoped state built once at startup from the config and the
//! baseline bundle. Every component receives what it needs by reference;
//! nothing here is global.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::constants::APP_VERSION;
use crate::logic::admission::Admission;
use crate::logic::audit::AdmissionAudit;
use crate::logic::config::PipelineConfig;
use crate::logic::engine::{EngineStats, EvaluationEngine};
use crate::logic::forge::{
    ForgeLoop, ForgeMonitor, ForgeStats, ForgeWindow, RepeatedTargetSynthesizer, Synthesizer,
};
use crate::logic::ledger::{ChainHead, JsonlJournal, LedgerError, LedgerJournal, MemoryJournal};
use crate::logic::rules::{
    load_bundle, BaselineError, HeaderRuleLoader, PatchFault, RuleEntry, RuleLoader, RuleSet,
    RuleStore, StoreStats,
};
use crate::logic::telemetry::{PipelineStats, TelemetryPipeline};
use crate::logic::verifier::{PublicKey, SigningKeyPair, Verifier};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Bundle(#[from] BaselineError),

    #[error("baseline rule rejected: {0}")]
    Baseline(PatchFault),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("could not open {what}: {source}")]
    Open {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// Ledger writes keep failing: the chain cannot be extended safely
    Degraded,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub version: &'static str,
    pub health: HealthState,
    pub head: ChainHead,
    pub rules: usize,
    pub ledger_entries: usize,
    pub store: StoreStats,
    pub engine: EngineStats,
    pub pipeline: PipelineStats,
    pub forge: ForgeStats,
    pub patches_accepted: u64,
    pub patches_rejected: u64,
    pub forge_key: PublicKey,
    pub shutting_down: bool,
    pub uptime_secs: i64,
}

// ============================================================================
// CORE
// ============================================================================

pub struct ShieldCore {
    config: PipelineConfig,
    store: Arc<RuleStore>,
    admission: Arc<Admission>,
    engine: EvaluationEngine,
    pipeline: Arc<TelemetryPipeline>,
    forge_key: PublicKey,
    forge_monitor: Arc<ForgeMonitor>,
    /// Taken by `start`
    forge: Mutex<Option<ForgeLoop>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    forge_task: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl ShieldCore {
    /// Load the bundle from `config.baseline_dir` and use the default
    /// synthesizer
    pub fn from_config(config: PipelineConfig) -> Result<Self, RuntimeError> {
        let baseline = load_bundle(&config.baseline_dir)?;
        let synthesizer = Arc::new(RepeatedTargetSynthesizer::new(config.synth_min_hits));
        Self::new(config, baseline, synthesizer)
    }

    /// Journal chosen by `config.ledger_path`
    pub fn new(
        config: PipelineConfig,
        baseline: Vec<RuleEntry>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Result<Self, RuntimeError> {
        let journal: Box<dyn LedgerJournal> = match &config.ledger_path {
            Some(path) => Box::new(JsonlJournal::open(path).map_err(|source| RuntimeError::Open {
                what: "ledger journal",
                source,
            })?),
            None => {
                log::warn!("No ledger path configured: rule history is in memory only");
                Box::new(MemoryJournal::new())
            }
        };
        Self::with_journal(config, baseline, synthesizer, journal)
    }

    pub fn with_journal(
        config: PipelineConfig,
        baseline: Vec<RuleEntry>,
        synthesizer: Arc<dyn Synthesizer>,
        journal: Box<dyn LedgerJournal>,
    ) -> Result<Self, RuntimeError> {
        let loader: Arc<dyn RuleLoader> = Arc::new(HeaderRuleLoader);
        let baseline_set = RuleSet::baseline(baseline, loader.as_ref(), config.max_rule_bytes)
            .map_err(RuntimeError::Baseline)?;

        let store = Arc::new(RuleStore::bootstrap(
            baseline_set,
            journal,
            Arc::clone(&loader),
            config.max_rule_bytes,
        )?);

        let forge_key = match &config.forge_key {
            Some(key) => Arc::clone(key),
            None => {
                log::warn!("No forge key seed configured: using an ephemeral forge key");
                Arc::new(SigningKeyPair::generate())
            }
        };
        let policy = config.trust_policy(forge_key.public_key());
        if policy.external_keys.is_empty() {
            log::warn!("No trusted keys configured: external patches will be rejected");
        }
        let verifier = Verifier::new(Arc::clone(store.ledger()), policy, config.max_rule_bytes);

        let mut audit = AdmissionAudit::new(config.audit_capacity);
        if let Some(path) = &config.audit_path {
            audit = audit.with_sink(path).map_err(|source| RuntimeError::Open {
                what: "audit log",
                source,
            })?;
        }
        let admission = Arc::new(Admission::new(
            verifier,
            Arc::clone(&store),
            Arc::new(audit),
            config.max_patch_bytes,
        ));

        let engine = EvaluationEngine::new(store.snapshots());
        let (forge_tx, forge_rx) = mpsc::channel(config.forge_queue_capacity.max(1));
        let pipeline = Arc::new(TelemetryPipeline::new(
            engine.clone(),
            config.eval_queue_capacity,
            forge_tx,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let forge_public = forge_key.public_key();
        let forge = ForgeLoop::new(
            forge_rx,
            ForgeWindow::new(config.forge_window_events, config.forge_window),
            synthesizer,
            Arc::clone(&admission),
            forge_key,
            shutdown_rx,
        );
        let forge_monitor = forge.monitor();

        let head = store.ledger().head();
        log::info!(
            "Shield core ready at {} ({} rules)",
            head,
            store.current().len()
        );

        Ok(Self {
            config,
            store,
            admission,
            engine,
            pipeline,
            forge_key: forge_public,
            forge_monitor,
            forge: Mutex::new(Some(forge)),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            forge_task: Mutex::new(None),
            started_at: Utc::now(),
        })
    }

    /// Spawn evaluation workers and the forge loop. Needs a tokio runtime.
    pub fn start(&self) {
        let Some(forge) = self.forge.lock().take() else {
            log::warn!("Shield core already started");
            return;
        };
        let workers = self.pipeline.start(self.config.eval_workers);
        log::info!("Started {} evaluation workers", workers.len());
        *self.workers.lock() = workers;
        *self.forge_task.lock() = Some(tokio::spawn(forge.run()));
    }

    /// Cooperative stop: refuse new patches and events, let queued
    /// evaluations drain, then stop the forge loop. An apply already in
    /// progress completes.
    pub async fn shutdown(&self) {
        log::info!("Shield core shutting down");
        self.admission.close();
        self.pipeline.close();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                log::error!("Evaluation worker failed: {}", e);
            }
        }

        let _ = self.shutdown_tx.send(true);
        let forge_task = self.forge_task.lock().take();
        if let Some(task) = forge_task {
            if let Err(e) = task.await {
                log::error!("Forge loop failed: {}", e);
            }
        }
        log::info!("Shield core stopped at {}", self.store.ledger().head());
    }

    pub fn health(&self) -> HealthState {
        if self.store.consecutive_ledger_failures() >= self.config.ledger_failure_threshold.max(1) {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    pub fn status(&self) -> CoreStatus {
        let current = self.store.current();
        let audit = self.admission.audit();
        CoreStatus {
            version: APP_VERSION,
            health: self.health(),
            head: self.store.ledger().head(),
            rules: current.len(),
            ledger_entries: self.store.ledger().len(),
            store: self.store.stats(),
            engine: self.engine.stats(),
            pipeline: self.pipeline.stats(),
            forge: self.forge_monitor.stats(),
            patches_accepted: audit.accepted_count(),
            patches_rejected: audit.rejected_count(),
            forge_key: self.forge_key,
            shutting_down: self.admission.is_shutting_down(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    pub fn audit(&self) -> &Arc<AdmissionAudit> {
        self.admission.audit()
    }

    pub fn engine(&self) -> &EvaluationEngine {
        &self.engine
    }

    pub fn pipeline(&self) -> &Arc<TelemetryPipeline> {
        &self.pipeline
    }

    pub fn forge_key(&self) -> PublicKey {
        self.forge_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::admission::SubmitError;
    use crate::logic::forge::NullSynthesizer;
    use crate::logic::ledger::LedgerRecord;
    use crate::logic::rules::{ApplyError, Provenance, RuleLanguage, RuleOp};
    use crate::logic::telemetry::RawEvent;
    use crate::logic::verifier::PatchEnvelope;
    use std::time::Duration;

    /// Takes the genesis record, then every append fails
    struct FailingJournal {
        appended: usize,
    }

    impl LedgerJournal for FailingJournal {
        fn load(&mut self) -> Result<Vec<LedgerRecord>, LedgerError> {
            Ok(Vec::new())
        }

        fn append(&mut self, _record: &LedgerRecord) -> std::io::Result<()> {
            self.appended += 1;
            if self.appended > 1 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            Ok(())
        }
    }

    fn baseline() -> Vec<RuleEntry> {
        vec![RuleEntry::new(
            "shadow_read",
            RuleLanguage::Sigma,
            "@decision block\n@match target ^/etc/shadow$",
            Provenance::Baseline,
        )]
    }

    #[tokio::test]
    async fn test_start_evaluate_and_shutdown() {
        let core = ShieldCore::new(PipelineConfig::default(), baseline(), Arc::new(NullSynthesizer)).unwrap();
        core.start();

        core.pipeline().ingest(RawEvent::new("cat", "open", "/etc/shadow")).await.unwrap();
        core.pipeline().ingest(RawEvent::new("cat", "open", "/tmp/x")).await.unwrap();

        core.shutdown().await;
        let status = core.status();
        assert_eq!(status.engine.evaluated, 2);
        assert_eq!(status.engine.blocked, 1);
        assert_eq!(status.head.version, 0);
        assert_eq!(status.rules, 1);
        assert_eq!(status.health, HealthState::Healthy);
        assert!(status.shutting_down);

        assert!(core.pipeline().ingest(RawEvent::new("a", "b", "c")).await.is_err());
    }

    #[tokio::test]
    async fn test_journal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            ledger_path: Some(dir.path().join("ledger.jsonl")),
            forge_window: Duration::from_secs(60),
            ..PipelineConfig::default()
        };

        let first = ShieldCore::new(config.clone(), baseline(), Arc::new(NullSynthesizer)).unwrap();
        let head = first.store().ledger().head();
        drop(first);

        let second = ShieldCore::new(config, baseline(), Arc::new(NullSynthesizer)).unwrap();
        assert_eq!(second.store().ledger().head(), head);
    }

    #[test]
    fn test_broken_baseline_rule_is_fatal() {
        let bad = vec![RuleEntry::new("bad", RuleLanguage::Yara, "no header", Provenance::Baseline)];
        assert!(matches!(
            ShieldCore::new(PipelineConfig::default(), bad, Arc::new(NullSynthesizer)),
            Err(RuntimeError::Baseline(_))
        ));
    }

    #[test]
    fn test_repeated_ledger_failures_degrade_health() {
        let operator = SigningKeyPair::from_seed(&[3u8; 32]);
        let config = PipelineConfig {
            trusted_keys: vec![operator.public_key()],
            ledger_failure_threshold: 3,
            ..PipelineConfig::default()
        };
        let core = ShieldCore::with_journal(
            config,
            baseline(),
            Arc::new(NullSynthesizer),
            Box::new(FailingJournal { appended: 0 }),
        )
        .unwrap();

        for attempt in 1..=3 {
            assert_eq!(core.health(), HealthState::Healthy);
            let rule = RuleEntry::new("r", RuleLanguage::Sigma, "@decision flag\n@match subject ^nc$", Provenance::Patch);
            let env = PatchEnvelope::new(
                Provenance::Patch,
                core.store().ledger().head().into(),
                vec![RuleOp::Upsert { rule }],
            )
            .signed_by(&operator);
            assert!(matches!(
                core.admission().submit(env),
                Err(SubmitError::Apply(ApplyError::LedgerFailure(_)))
            ));
            assert_eq!(core.store().consecutive_ledger_failures(), attempt);
        }

        assert_eq!(core.health(), HealthState::Degraded);
        let status = core.status();
        assert_eq!(status.health, HealthState::Degraded);
        assert_eq!(status.store.ledger_failures, 3);
        assert_eq!(status.head.version, 0);
        assert_eq!(status.rules, 1);
    }
}
