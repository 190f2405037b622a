//! Verdict Types
//!
//! Data structures only - matching lives in `evaluate.rs`.

use serde::{Deserialize, Serialize};

use crate::logic::rules::RuleSeverity;

/// Outcome of evaluating one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Flag,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Flag => "flag",
            Decision::Block => "block",
        }
    }

    pub fn is_alert(&self) -> bool {
        !matches!(self, Decision::Allow)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Sequence number of the evaluated event
    pub event_seq: u64,
    /// Version of the snapshot the whole evaluation ran against
    pub rule_set_version: u64,
    pub decision: Decision,
    /// Every matching rule, identifier ascending
    pub matched: Vec<String>,
    /// Rule that decided the verdict (highest severity, lowest id)
    pub primary: Option<String>,
    pub severity: Option<RuleSeverity>,
}

impl Verdict {
    pub fn allow(event_seq: u64, rule_set_version: u64) -> Self {
        Self {
            event_seq,
            rule_set_version,
            decision: Decision::Allow,
            matched: Vec::new(),
            primary: None,
            severity: None,
        }
    }
}
