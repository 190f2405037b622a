//! Rules Module
//!
//! ## Structure
//! - `types.rs` - RuleEntry, RuleLanguage, Provenance, RuleOp
//! - `loader.rs` - header parsing and deep validation
//! - `set.rs` - immutable, content-addressed RuleSet
//! - `baseline.rs` - startup rule bundle
//! - `store.rs` - RuleStore (snapshot publication + hot swap)

pub mod baseline;
pub mod loader;
pub mod set;
pub mod store;
pub mod types;

pub use baseline::{load_bundle, BaselineError};
pub use loader::{CompiledRule, HeaderRuleLoader, LoadError, RuleAction, RuleLoader, RuleSeverity};
pub use set::{LoadedRule, PatchFault, RuleSet};
pub use store::{ApplyError, RuleStore, StoreStats};
pub use types::{Provenance, RuleEntry, RuleLanguage, RuleOp};
