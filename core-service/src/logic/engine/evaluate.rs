//! Evaluation Engine
//!
//! Policy:
//! - BLOCK if any blocking rule matches
//! - else FLAG if any advisory rule matches
//! - else ALLOW
//!
//! The deciding rule is the highest-severity match of the winning class;
//! ties go to the lowest identifier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use super::types::{Decision, Verdict};
use crate::logic::rules::{LoadedRule, RuleAction, RuleSet};
use crate::logic::telemetry::TelemetryEvent;

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub evaluated: u64,
    pub allowed: u64,
    pub flagged: u64,
    pub blocked: u64,
}

#[derive(Default)]
struct Counters {
    evaluated: AtomicU64,
    allowed: AtomicU64,
    flagged: AtomicU64,
    blocked: AtomicU64,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Cheap to clone; every clone shares counters and the snapshot cell
#[derive(Clone)]
pub struct EvaluationEngine {
    snapshots: Arc<ArcSwap<RuleSet>>,
    counters: Arc<Counters>,
}

impl EvaluationEngine {
    /// `snapshots` comes from `RuleStore::snapshots`
    pub fn new(snapshots: Arc<ArcSwap<RuleSet>>) -> Self {
        Self {
            snapshots,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Take the current snapshot. Holding it pins that version.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.snapshots.load_full()
    }

    pub fn evaluate(&self, event: &TelemetryEvent) -> Verdict {
        // one snapshot for the whole pass
        let snapshot = self.snapshot();
        let verdict = evaluate_snapshot(&snapshot, event);
        self.record(&verdict);
        verdict
    }

    fn record(&self, verdict: &Verdict) {
        self.counters.evaluated.fetch_add(1, Ordering::Relaxed);
        let counter = match verdict.decision {
            Decision::Allow => &self.counters.allowed,
            Decision::Flag => &self.counters.flagged,
            Decision::Block => &self.counters.blocked,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if verdict.decision == Decision::Block {
            log::info!(
                "BLOCK event #{} by {} (rules v{})",
                verdict.event_seq,
                verdict.primary.as_deref().unwrap_or("-"),
                verdict.rule_set_version
            );
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            evaluated: self.counters.evaluated.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            flagged: self.counters.flagged.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
        }
    }
}

/// Evaluate one event against an explicit snapshot
pub fn evaluate_snapshot(set: &RuleSet, event: &TelemetryEvent) -> Verdict {
    let matched: Vec<&LoadedRule> = set.rules().filter(|r| r.compiled.matches(event)).collect();
    if matched.is_empty() {
        return Verdict::allow(event.seq, set.version());
    }

    let winning_action = if matched.iter().any(|r| r.compiled.action == RuleAction::Block) {
        RuleAction::Block
    } else {
        RuleAction::Flag
    };

    // rules() iterates in id order, so strict `>` keeps the lowest id on ties
    let mut primary: Option<&LoadedRule> = None;
    for rule in matched.iter().filter(|r| r.compiled.action == winning_action) {
        match primary {
            Some(best) if rule.compiled.severity <= best.compiled.severity => {}
            _ => primary = Some(rule),
        }
    }

    Verdict {
        event_seq: event.seq,
        rule_set_version: set.version(),
        decision: match winning_action {
            RuleAction::Block => Decision::Block,
            RuleAction::Flag => Decision::Flag,
        },
        matched: matched.iter().map(|r| r.entry.id.clone()).collect(),
        primary: primary.map(|r| r.entry.id.clone()),
        severity: primary.map(|r| r.compiled.severity),
    }
}
