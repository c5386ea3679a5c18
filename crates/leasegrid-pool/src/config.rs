//! Pool definition loading.
//!
//! Each pool is one TOML file in the pool directory:
//!
//! ```toml
//! # pools/default.toml
//! name = "default"          # optional, defaults to the file stem
//!
//! [[entry]]
//! hostname = "node-1"
//! mem_max = 4096
//! associations = "public,private"   # or "*"
//! ```
//!
//! The loader records each file's mtime; the matcher uses it (together
//! with per-entry max memory and association strings) to decide whether
//! an entry may carry its in-use accounting across a hot reload.

use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use tracing::debug;

use crate::error::{PoolError, PoolResult};

/// One node entry in a pool definition file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EntryDefinition {
    pub hostname: String,
    /// Total memory capacity (MB).
    pub mem_max: u64,
    /// Comma-separated supported associations, or `"*"` for all.
    #[serde(default = "default_associations")]
    pub associations: String,
}

fn default_associations() -> String {
    "*".to_string()
}

/// A parsed pool definition plus its source file mtime.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolDefinition {
    pub name: String,
    /// Source file modification time, epoch seconds. Zero when unknown.
    pub source_mtime: u64,
    pub entries: Vec<EntryDefinition>,
}

#[derive(Debug, Deserialize)]
struct PoolFile {
    name: Option<String>,
    #[serde(default, rename = "entry")]
    entries: Vec<EntryDefinition>,
}

/// Parse a single pool definition file.
pub fn load_pool_file(path: &Path) -> PoolResult<PoolDefinition> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PoolError::Config(format!("{}: {e}", path.display())))?;
    let file: PoolFile = toml::from_str(&raw)
        .map_err(|e| PoolError::Config(format!("{}: {e}", path.display())))?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("pool")
        .to_string();
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    Ok(PoolDefinition {
        name: file.name.unwrap_or(stem),
        source_mtime: mtime,
        entries: file.entries,
    })
}

/// Load every `*.toml` pool definition in a directory, sorted by name.
pub fn load_pool_dir(dir: &Path) -> PoolResult<Vec<PoolDefinition>> {
    let mut defs = Vec::new();
    let read = std::fs::read_dir(dir)
        .map_err(|e| PoolError::Config(format!("{}: {e}", dir.display())))?;
    for entry in read {
        let entry = entry.map_err(|e| PoolError::Config(e.to_string()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            defs.push(load_pool_file(&path)?);
        }
    }
    defs.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(pools = defs.len(), dir = %dir.display(), "pool definitions loaded");
    Ok(defs)
}
