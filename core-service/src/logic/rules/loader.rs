//! Rule Loader
//!
//! Deep validation of rule bodies at apply time. A body is opaque
//! YARA/Sigma text preceded by a small structural header:
//!
//! ```text
//! @decision block
//! @severity high
//! @match target ^/etc/shadow$
//! @match action ^open$
//! rule shadow_read { condition: true }
//! ```
//!
//! Every `@match` must hold for the rule to match (AND). Text after the
//! header is carried verbatim and never interpreted here.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::RuleEntry;
use crate::logic::telemetry::TelemetryEvent;

// ============================================================================
// RULE ACTION / SEVERITY
// ============================================================================

/// What a matching rule asks the engine to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Advisory - raise a flag
    Flag,
    /// Blocking semantics
    Block,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Flag => "flag",
            RuleAction::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RuleSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSeverity::Low => "low",
            RuleSeverity::Medium => "medium",
            RuleSeverity::High => "high",
            RuleSeverity::Critical => "critical",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RuleSeverity::Low),
            "medium" => Some(RuleSeverity::Medium),
            "high" => Some(RuleSeverity::High),
            "critical" => Some(RuleSeverity::Critical),
            _ => None,
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("rule body is empty")]
    Empty,
    #[error("rule body is not valid UTF-8")]
    NotUtf8,
    #[error("missing @decision directive")]
    MissingDecision,
    #[error("rule has no @match directive")]
    NoMatchers,
    #[error("unknown directive @{0}")]
    UnknownDirective(String),
    #[error("bad value for @{key}: {value:?}")]
    BadValue { key: String, value: String },
    #[error("bad pattern {pattern:?}: {reason}")]
    BadPattern { pattern: String, reason: String },
}

// ============================================================================
// COMPILED RULE
// ============================================================================

/// Event field a matcher inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventField {
    Subject,
    Action,
    Target,
}

impl EventField {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "subject" => Some(EventField::Subject),
            "action" => Some(EventField::Action),
            "target" => Some(EventField::Target),
            _ => None,
        }
    }

    fn select<'a>(&self, event: &'a TelemetryEvent) -> &'a str {
        match self {
            EventField::Subject => &event.subject,
            EventField::Action => &event.action,
            EventField::Target => &event.target,
        }
    }
}

#[derive(Debug, Clone)]
struct FieldMatcher {
    field: EventField,
    pattern: Regex,
}

/// A rule after deep validation, ready for matching
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub action: RuleAction,
    pub severity: RuleSeverity,
    matchers: Vec<FieldMatcher>,
}

impl CompiledRule {
    pub fn matches(&self, event: &TelemetryEvent) -> bool {
        self.matchers
            .iter()
            .all(|m| m.pattern.is_match(m.field.select(event)))
    }

    pub fn matcher_count(&self) -> usize {
        self.matchers.len()
    }

    /// Whether this rule is a single exact `^<literal>$` match on `target`
    pub fn pins_target(&self, target: &str) -> bool {
        let [only] = self.matchers.as_slice() else {
            return false;
        };
        only.field == EventField::Target && only.pattern.as_str() == format!("^{}$", regex::escape(target))
    }
}

// ============================================================================
// LOADER
// ============================================================================

/// Compiles validated rule bodies into matchers
pub trait RuleLoader: Send + Sync {
    fn compile(&self, entry: &RuleEntry) -> Result<CompiledRule, LoadError>;
}

/// Default loader: parses the `@key value` header
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderRuleLoader;

impl RuleLoader for HeaderRuleLoader {
    fn compile(&self, entry: &RuleEntry) -> Result<CompiledRule, LoadError> {
        if entry.body.is_empty() {
            return Err(LoadError::Empty);
        }
        let text = std::str::from_utf8(&entry.body).map_err(|_| LoadError::NotUtf8)?;

        let mut action = None;
        let mut severity = RuleSeverity::Medium;
        let mut matchers = Vec::new();

        for line in text.lines().map(str::trim) {
            if line.is_empty() {
                continue;
            }
            let Some(directive) = line.strip_prefix('@') else {
                break;
            };
            let (key, value) = directive
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .unwrap_or((directive, ""));

            match key {
                "decision" => {
                    action = Some(match value {
                        "block" => RuleAction::Block,
                        "flag" => RuleAction::Flag,
                        _ => return Err(bad_value(key, value)),
                    });
                }
                "severity" => {
                    severity = RuleSeverity::parse(value).ok_or_else(|| bad_value(key, value))?;
                }
                "match" => {
                    let (field, pattern) = value
                        .split_once(char::is_whitespace)
                        .map(|(f, p)| (f, p.trim()))
                        .ok_or_else(|| bad_value(key, value))?;
                    let field = EventField::parse(field).ok_or_else(|| bad_value(key, value))?;
                    let pattern = Regex::new(pattern).map_err(|e| LoadError::BadPattern {
                        pattern: pattern.to_string(),
                        reason: e.to_string(),
                    })?;
                    matchers.push(FieldMatcher { field, pattern });
                }
                other => return Err(LoadError::UnknownDirective(other.to_string())),
            }
        }

        let action = action.ok_or(LoadError::MissingDecision)?;
        if matchers.is_empty() {
            return Err(LoadError::NoMatchers);
        }

        Ok(CompiledRule {
            action,
            severity,
            matchers,
        })
    }
}

fn bad_value(key: &str, value: &str) -> LoadError {
    LoadError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
