//! Baseline Rule Bundle
//!
//! Read-only rule files shipped with the binary. Each file becomes one
//! rule: the file stem is the identifier, the extension picks the language
//! (`.yar`/`.yara` → YARA, `.yml`/`.yaml`/`.sigma` → Sigma). Trust is
//! implicit: the bundle is `ledger[0]` and carries no signature.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::types::{Provenance, RuleEntry, RuleLanguage};

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("could not read rules directory {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not read rule file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("duplicate rule id '{0}' in bundle")]
    Duplicate(String),
}

/// Load every rule file in `dir`, sorted by file name
pub fn load_bundle(dir: &Path) -> Result<Vec<RuleEntry>, BaselineError> {
    let read_dir = std::fs::read_dir(dir).map_err(|source| BaselineError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = read_dir
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for path in paths {
        let Some(language) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(RuleLanguage::from_extension)
        else {
            log::warn!("Skipping non-rule file in bundle: {:?}", path);
            continue;
        };
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !seen.insert(id.to_string()) {
            return Err(BaselineError::Duplicate(id.to_string()));
        }

        let body = std::fs::read(&path).map_err(|source| BaselineError::ReadFile {
            path: path.clone(),
            source,
        })?;
        entries.push(RuleEntry::new(id, language, body, Provenance::Baseline));
    }

    log::info!("Loaded {} baseline rules from {:?}", entries.len(), dir);
    Ok(entries)
}
