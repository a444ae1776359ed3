//! Last-known-good (LKG) policy persistence.
//!
//! Single-slot store: one JSON entry holding the most recently
//! successfully-applied policy plus a SHA-256 integrity digest, overwritten
//! on each success and consumed on startup/recovery. Corruption (digest
//! mismatch, malformed JSON) is a distinct outcome from absence, because
//! callers fail open differently for each. The store locks independently of
//! the substrate so file I/O never blocks a filter transaction.

use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hostwall_core::Policy;

/// File name of the single LKG slot inside the store directory.
const LKG_FILE_NAME: &str = "lkg-policy.json";

/// Temp file used for atomic replace-on-write.
const LKG_TMP_NAME: &str = "lkg-policy.json.tmp";

/// One persisted LKG record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LkgEntry {
    /// The raw policy document exactly as it was applied.
    pub policy_json: String,
    /// Where the policy came from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub saved_at: DateTime<Utc>,
    /// Hex SHA-256 of `policy_json`.
    pub checksum: String,
}

/// Outcome of reading the LKG slot.
#[derive(Debug, Clone)]
pub enum LkgLoad {
    /// No entry has ever been saved (or it was deleted).
    Absent,
    /// An entry exists but must not be trusted or auto-applied.
    Corrupt { reason: String },
    /// A verified entry and its parsed policy.
    Loaded { entry: LkgEntry, policy: Policy },
}

/// Metadata probe over the LKG slot, for status surfaces.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LkgMetadata {
    pub exists: bool,
    pub is_corrupt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Store I/O failure, distinct from integrity failure.
#[derive(Debug, thiserror::Error)]
pub enum LkgError {
    #[error("LKG I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("LKG entry could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Single-slot LKG store rooted at a directory.
pub struct LkgStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl LkgStore {
    /// Store rooted at `dir`; the directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the current slot file.
    #[must_use]
    pub fn slot_path(&self) -> PathBuf {
        self.dir.join(LKG_FILE_NAME)
    }

    /// Persist `policy_json` as the new last-known-good entry.
    ///
    /// Overwrites the previous slot via temp file + rename so a crash cannot
    /// leave a half-written entry behind.
    pub fn save(&self, policy_json: &str, source_path: Option<&str>) -> Result<(), LkgError> {
        let entry = LkgEntry {
            policy_json: policy_json.to_string(),
            source_path: source_path.map(str::to_string),
            saved_at: Utc::now(),
            checksum: checksum_hex(policy_json),
        };
        let serialized = serde_json::to_vec_pretty(&entry)?;

        let _guard = self.lock.lock();
        fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(LKG_TMP_NAME);
        fs::write(&tmp, &serialized)?;
        fs::rename(&tmp, self.slot_path())?;
        tracing::info!(
            path = %self.slot_path().display(),
            source = source_path.unwrap_or("<inline>"),
            "saved last-known-good policy"
        );
        Ok(())
    }

    /// Read and verify the slot.
    ///
    /// `Absent` and `Corrupt` are ordinary outcomes; only I/O trouble other
    /// than not-found is an `Err`.
    pub fn load(&self) -> Result<LkgLoad, LkgError> {
        let _guard = self.lock.lock();
        let raw = match fs::read_to_string(self.slot_path()) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LkgLoad::Absent),
            Err(err) => return Err(err.into()),
        };

        let entry: LkgEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                return Ok(LkgLoad::Corrupt {
                    reason: format!("entry is not valid JSON: {err}"),
                });
            }
        };

        let expected = checksum_hex(&entry.policy_json);
        if entry.checksum != expected {
            return Ok(LkgLoad::Corrupt {
                reason: format!(
                    "checksum mismatch (stored {}, computed {expected})",
                    entry.checksum
                ),
            });
        }

        let policy = match Policy::from_json(&entry.policy_json) {
            Ok(policy) => policy,
            Err(err) => {
                return Ok(LkgLoad::Corrupt {
                    reason: format!("stored policy does not parse: {err}"),
                });
            }
        };

        Ok(LkgLoad::Loaded { entry, policy })
    }

    /// Metadata probe; never fails, folds I/O errors into the report.
    #[must_use]
    pub fn metadata(&self) -> LkgMetadata {
        match self.load() {
            Ok(LkgLoad::Absent) => LkgMetadata::default(),
            Ok(LkgLoad::Corrupt { reason }) => LkgMetadata {
                exists: true,
                is_corrupt: true,
                error: Some(reason),
                ..LkgMetadata::default()
            },
            Ok(LkgLoad::Loaded { entry, policy }) => LkgMetadata {
                exists: true,
                is_corrupt: false,
                policy_version: Some(policy.version),
                rule_count: Some(policy.rules.len()),
                saved_at: Some(entry.saved_at),
                source_path: entry.source_path,
                error: None,
            },
            Err(err) => LkgMetadata {
                exists: true,
                is_corrupt: false,
                error: Some(err.to_string()),
                ..LkgMetadata::default()
            },
        }
    }
}

fn checksum_hex(policy_json: &str) -> String {
    hex::encode(Sha256::digest(policy_json.as_bytes()))
}
