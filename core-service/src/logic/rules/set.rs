//! Rule Set
//!
//! Immutable, versioned, content-addressed collection of loaded rules.
//! Every transition builds a new `RuleSet`; unchanged rules share their
//! `Arc`s with the previous version.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::loader::{CompiledRule, LoadError, RuleLoader};
use super::types::{RuleEntry, RuleOp};
use crate::logic::digest::{ContentDigest, DigestBuilder};

/// A rule entry together with its compiled matcher
#[derive(Debug, Clone)]
pub struct LoadedRule {
    pub entry: Arc<RuleEntry>,
    pub compiled: Arc<CompiledRule>,
}

/// Reasons a patch cannot be applied to a set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchFault {
    /// Rule failed structural or deep validation
    Invalid { id: String, reason: String },
    /// Remove targets a rule that is not in the set
    UnknownRule(String),
}

impl std::fmt::Display for PatchFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchFault::Invalid { id, reason } => write!(f, "rule '{}': {}", id, reason),
            PatchFault::UnknownRule(id) => write!(f, "cannot remove unknown rule '{}'", id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    version: u64,
    digest: ContentDigest,
    rules: BTreeMap<String, LoadedRule>,
}

impl RuleSet {
    /// Build the baseline set (version 0)
    pub fn baseline(
        entries: Vec<RuleEntry>,
        loader: &dyn RuleLoader,
        max_rule_bytes: usize,
    ) -> Result<Self, PatchFault> {
        let mut rules = BTreeMap::new();
        for entry in entries {
            let loaded = load(entry, loader, max_rule_bytes)?;
            rules.insert(loaded.entry.id.clone(), loaded);
        }
        Ok(Self::from_rules(0, rules))
    }

    fn from_rules(version: u64, rules: BTreeMap<String, LoadedRule>) -> Self {
        let digest = digest_rules(&rules);
        Self { version, digest, rules }
    }

    /// Compute the successor set. `self` is untouched; on error nothing
    /// of the patch is applied.
    pub fn with_ops(
        &self,
        ops: &[RuleOp],
        loader: &dyn RuleLoader,
        max_rule_bytes: usize,
    ) -> Result<RuleSet, PatchFault> {
        let mut rules = self.rules.clone();
        for op in ops {
            match op {
                RuleOp::Upsert { rule } => {
                    let loaded = load(rule.clone(), loader, max_rule_bytes)?;
                    rules.insert(loaded.entry.id.clone(), loaded);
                }
                RuleOp::Remove { id } => {
                    if rules.remove(id).is_none() {
                        return Err(PatchFault::UnknownRule(id.clone()));
                    }
                }
            }
        }
        Ok(Self::from_rules(self.version + 1, rules))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn digest(&self) -> ContentDigest {
        self.digest
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&LoadedRule> {
        self.rules.get(id)
    }

    /// Rules in identifier order
    pub fn rules(&self) -> impl Iterator<Item = &LoadedRule> {
        self.rules.values()
    }

    pub fn ids(&self) -> HashSet<&str> {
        self.rules.keys().map(String::as_str).collect()
    }
}

fn load(entry: RuleEntry, loader: &dyn RuleLoader, max_rule_bytes: usize) -> Result<LoadedRule, PatchFault> {
    entry
        .check_structure(max_rule_bytes)
        .map_err(|reason| PatchFault::Invalid {
            id: entry.id.clone(),
            reason,
        })?;
    let compiled = loader
        .compile(&entry)
        .map_err(|e: LoadError| PatchFault::Invalid {
            id: entry.id.clone(),
            reason: e.to_string(),
        })?;
    Ok(LoadedRule {
        entry: Arc::new(entry),
        compiled: Arc::new(compiled),
    })
}

/// Digest of the sorted entry digests. BTreeMap iteration order makes the
/// result independent of insertion order.
fn digest_rules(rules: &BTreeMap<String, LoadedRule>) -> ContentDigest {
    let mut b = DigestBuilder::new(b"shield.ruleset.v1");
    b.u64(rules.len() as u64);
    for loaded in rules.values() {
        b.digest(&loaded.entry.digest());
    }
    b.finish()
}
