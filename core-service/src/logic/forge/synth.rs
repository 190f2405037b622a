//! Rule Synthesis
//!
//! `Synthesizer` is the pluggable model boundary: it reads a window, and
//! the rule set active when the window closed, and returns candidate rule
//! bodies. It knows nothing about keys, anchors or admission.

use std::collections::BTreeMap;

use crate::constants::DEFAULT_SYNTH_MIN_HITS;
use crate::logic::digest::DigestBuilder;
use crate::logic::rules::{RuleLanguage, RuleSet};

use super::window::ForgeWindow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRule {
    pub id: String,
    pub language: RuleLanguage,
    pub body: Vec<u8>,
}

pub trait Synthesizer: Send + Sync {
    /// May be slow; runs on the blocking pool
    fn synthesize(&self, window: &ForgeWindow, rules: &RuleSet) -> Vec<CandidateRule>;
}

/// Proposes nothing. Useful when synthesis is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSynthesizer;

impl Synthesizer for NullSynthesizer {
    fn synthesize(&self, _window: &ForgeWindow, _rules: &RuleSet) -> Vec<CandidateRule> {
        Vec::new()
    }
}

/// Promote a target that keeps tripping alerts to a dedicated block rule,
/// unless an active rule already pins that exact target
#[derive(Debug, Clone, Copy)]
pub struct RepeatedTargetSynthesizer {
    pub min_hits: usize,
}

impl Default for RepeatedTargetSynthesizer {
    fn default() -> Self {
        Self {
            min_hits: DEFAULT_SYNTH_MIN_HITS,
        }
    }
}

impl RepeatedTargetSynthesizer {
    pub fn new(min_hits: usize) -> Self {
        Self {
            min_hits: min_hits.max(1),
        }
    }

    /// Stable id: the same target always yields the same rule id
    pub fn rule_id(target: &str) -> String {
        let mut b = DigestBuilder::new(b"shield.forge.target.v1");
        b.field(target.as_bytes());
        format!("forge-target-{}", b.finish().short())
    }

    fn body(target: &str, hits: usize) -> Vec<u8> {
        format!(
            "@decision block\n@severity high\n@match target ^{}$\n# synthesized from {} alerts\n",
            regex::escape(target),
            hits
        )
        .into_bytes()
    }
}

impl Synthesizer for RepeatedTargetSynthesizer {
    fn synthesize(&self, window: &ForgeWindow, rules: &RuleSet) -> Vec<CandidateRule> {
        let mut hits: BTreeMap<&str, usize> = BTreeMap::new();
        for (event, verdict) in window.pairs() {
            if verdict.decision.is_alert() {
                *hits.entry(event.target.as_str()).or_default() += 1;
            }
        }

        hits.into_iter()
            .filter(|(target, n)| *n >= self.min_hits && !target.chars().any(char::is_control))
            .filter(|(target, _)| !rules.rules().any(|r| r.compiled.pins_target(target)))
            .map(|(target, n)| CandidateRule {
                id: Self::rule_id(target),
                language: RuleLanguage::Sigma,
                body: Self::body(target, n),
            })
            .collect()
    }
}
