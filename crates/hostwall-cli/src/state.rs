//! Substrate state-file handling.
//!
//! The native substrate adapter lives out of tree; the CLI runs every
//! mutating operation against a [`MemorySubstrate`] image loaded from, and
//! written back to, a JSON state file. Missing file means a fresh substrate.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use hostwall_engine::{MemoryState, MemorySubstrate};

/// Load a substrate from `path`, or a fresh one when the file is absent.
pub fn load_substrate(path: &Path) -> Result<MemorySubstrate> {
    if !path.exists() {
        return Ok(MemorySubstrate::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading substrate state {}", path.display()))?;
    let state: MemoryState = serde_json::from_str(&raw)
        .with_context(|| format!("parsing substrate state {}", path.display()))?;
    Ok(MemorySubstrate::from_state(state))
}

/// Write the substrate image back to `path`.
pub fn save_substrate(path: &Path, substrate: &MemorySubstrate) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }
    }
    let serialized =
        serde_json::to_string_pretty(substrate.state()).context("serializing substrate state")?;
    fs::write(path, serialized)
        .with_context(|| format!("writing substrate state {}", path.display()))
}
