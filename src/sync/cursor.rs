//! Durable per-source sync cursors.
//!
//! The cursor file is the only coordinator state needed to resume after a
//! restart. It is rewritten atomically (temp file + rename) so a crash
//! leaves either the old or the new cursor set, never a torn one.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::sync::source::{ChangeRecord, Watermark};
use crate::vector::ItemId;

const CURSOR_FORMAT_VERSION: u32 = 1;

/// Progress through one metadata source's change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// `updated_at` of the last applied change.
    pub updated_at: Option<DateTime<Utc>>,
    /// Item of the last applied change; breaks `updated_at` ties.
    pub item_id: Option<ItemId>,
    /// Changes applied through this cursor since it was created.
    pub applied: u64,
    /// When the cursor last moved.
    pub synced_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// Position to resume from; `None` means the start of the feed.
    #[must_use]
    pub fn watermark(&self) -> Option<Watermark> {
        match (self.updated_at, self.item_id) {
            (Some(updated_at), Some(item_id)) => Some(Watermark {
                updated_at,
                item_id,
            }),
            _ => None,
        }
    }

    /// Moves past `record`.
    pub fn advance(&mut self, record: &ChangeRecord) {
        self.updated_at = Some(record.updated_at);
        self.item_id = Some(record.item_id);
        self.applied += 1;
        self.synced_at = Some(Utc::now());
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    version: u32,
    cursors: BTreeMap<String, SyncCursor>,
}

/// Cursor set keyed by source name, optionally persisted to a JSON file.
#[derive(Debug, Default)]
pub struct CursorStore {
    path: Option<PathBuf>,
    cursors: BTreeMap<String, SyncCursor>,
}

impl CursorStore {
    /// Cursors that live only as long as the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads cursors from `path`; a missing file means no progress yet.
    pub fn load(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        let cursors = match fs::read_to_string(&path) {
            Ok(content) => {
                let file: CursorFile =
                    serde_json::from_str(&content).map_err(|e| CoreError::StorageCorrupted {
                        reason: format!("cursor file '{}': {e}", path.display()),
                    })?;
                if file.version != CURSOR_FORMAT_VERSION {
                    return Err(CoreError::StorageCorrupted {
                        reason: format!(
                            "cursor file '{}' has format version {}, expected {CURSOR_FORMAT_VERSION}",
                            path.display(),
                            file.version
                        ),
                    });
                }
                file.cursors
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            cursors,
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current cursor for `source`, starting fresh if unknown.
    #[must_use]
    pub fn get(&self, source: &str) -> SyncCursor {
        self.cursors.get(source).cloned().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SyncCursor)> {
        self.cursors.iter()
    }

    /// Replaces the cursor for `source` and persists the whole set.
    pub fn update(&mut self, source: &str, cursor: SyncCursor) -> CoreResult<()> {
        let previous = self.cursors.insert(source.to_string(), cursor);
        if let Err(e) = self.persist() {
            // Keep memory in step with disk.
            match previous {
                Some(previous) => self.cursors.insert(source.to_string(), previous),
                None => self.cursors.remove(source),
            };
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self) -> CoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = CursorFile {
            version: CURSOR_FORMAT_VERSION,
            cursors: self.cursors.clone(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| CoreError::Internal {
            reason: format!("failed to serialize sync cursors: {e}"),
        })?;

        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
