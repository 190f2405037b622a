//! Rule Types
//!
//! Core data structures for rule entries and patch operations.
//! No matching logic here - see `loader.rs` and `engine/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_RULE_ID_LEN;
use crate::logic::digest::{hex_bytes, ContentDigest, DigestBuilder};

// ============================================================================
// RULE LANGUAGE
// ============================================================================

/// Rule language tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleLanguage {
    Yara,
    Sigma,
}

impl RuleLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleLanguage::Yara => "yara",
            RuleLanguage::Sigma => "sigma",
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            RuleLanguage::Yara => 1,
            RuleLanguage::Sigma => 2,
        }
    }

    /// Guess the language from a bundle file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "yar" | "yara" => Some(RuleLanguage::Yara),
            "yml" | "yaml" | "sigma" => Some(RuleLanguage::Sigma),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PROVENANCE
// ============================================================================

/// Where a rule (or the patch carrying it) came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Provenance {
    /// Shipped with the binary, loaded at startup
    Baseline,
    /// Submitted through the patch ingress
    Patch,
    /// Proposed by the forge loop
    Synthesized,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Baseline => "baseline",
            Provenance::Patch => "patch",
            Provenance::Synthesized => "synthesized",
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Provenance::Baseline => 0,
            Provenance::Patch => 1,
            Provenance::Synthesized => 2,
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RULE ENTRY
// ============================================================================

/// A single detection rule. Immutable once part of an accepted RuleSet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEntry {
    pub id: String,
    pub language: RuleLanguage,
    #[serde(with = "hex_bytes")]
    pub body: Vec<u8>,
    pub provenance: Provenance,
    pub accepted_at: DateTime<Utc>,
}

impl RuleEntry {
    pub fn new(id: &str, language: RuleLanguage, body: impl Into<Vec<u8>>, provenance: Provenance) -> Self {
        Self {
            id: id.to_string(),
            language,
            body: body.into(),
            provenance,
            accepted_at: Utc::now(),
        }
    }

    /// Content digest over (id, language, body)
    pub fn digest(&self) -> ContentDigest {
        let mut b = DigestBuilder::new(b"shield.rule.v1");
        b.field(self.id.as_bytes()).tag(self.language.tag()).field(&self.body);
        b.finish()
    }

    /// Identifier shape: non-empty, bounded, no whitespace
    pub fn check_identifier(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("rule id is empty".to_string());
        }
        if self.id.len() > MAX_RULE_ID_LEN {
            return Err(format!("rule id exceeds {} chars", MAX_RULE_ID_LEN));
        }
        if self.id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(format!("rule id '{}' contains whitespace", self.id));
        }
        Ok(())
    }

    /// Cheap structural sanity check (no grammar validation)
    pub fn check_structure(&self, max_body: usize) -> Result<(), String> {
        self.check_identifier()?;
        if self.body.is_empty() {
            return Err(format!("rule '{}' has an empty body", self.id));
        }
        if self.body.len() > max_body {
            return Err(format!(
                "rule '{}' body is {} bytes, limit {}",
                self.id,
                self.body.len(),
                max_body
            ));
        }
        Ok(())
    }
}

// ============================================================================
// PATCH OPERATIONS
// ============================================================================

/// One change inside a hot patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleOp {
    /// Add a rule, replacing any rule with the same id
    Upsert { rule: RuleEntry },
    /// Remove an existing rule
    Remove { id: String },
}

impl RuleOp {
    pub fn rule_id(&self) -> &str {
        match self {
            RuleOp::Upsert { rule } => &rule.id,
            RuleOp::Remove { id } => id,
        }
    }

    /// Feed this op into a payload digest
    pub(crate) fn hash_into(&self, b: &mut DigestBuilder) {
        match self {
            RuleOp::Upsert { rule } => {
                b.tag(1).digest(&rule.digest());
            }
            RuleOp::Remove { id } => {
                b.tag(2).field(id.as_bytes());
            }
        }
    }
}
