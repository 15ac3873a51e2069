//! Change feeds from the external metadata store.
//!
//! The core never sees metadata fields; a source only reports which item
//! changed, when, and (for upserts) the text to embed.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::vector::ItemId;

/// Position in a change feed, ordered by `(updated_at, item_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    pub updated_at: DateTime<Utc>,
    pub item_id: ItemId,
}

/// What happened to an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ChangeKind {
    /// Inserted or content changed; embed `text`.
    Upsert { text: String },
    Delete,
}

/// One entry in a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub item_id: ItemId,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ChangeKind,
}

impl ChangeRecord {
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        Watermark {
            updated_at: self.updated_at,
            item_id: self.item_id,
        }
    }
}

/// A change feed the coordinator can pull from.
pub trait MetadataSource: Send + Sync {
    /// Stable name, used as the cursor key.
    fn name(&self) -> &str;

    /// Up to `limit` changes strictly after `after`, ordered by
    /// `(updated_at, item_id)`.
    fn changes_since(
        &self,
        after: Option<Watermark>,
        limit: usize,
    ) -> CoreResult<Vec<ChangeRecord>>;
}

fn select(records: &[ChangeRecord], after: Option<Watermark>, limit: usize) -> Vec<ChangeRecord> {
    records
        .iter()
        .filter(|record| after.is_none_or(|after| record.watermark() > after))
        .take(limit)
        .cloned()
        .collect()
}

fn sort_feed(records: &mut [ChangeRecord]) {
    records.sort_by_key(ChangeRecord::watermark);
}

/// Change feed read from a JSON-lines export.
///
/// Each non-blank line is one [`ChangeRecord`]:
///
/// ```text
/// {"item_id": 12, "updated_at": "2024-05-01T10:00:00Z", "op": "upsert", "text": "..."}
/// {"item_id": 9, "updated_at": "2024-05-02T08:30:00Z", "op": "delete"}
/// ```
///
/// The file is re-read on every call so appends are picked up.
#[derive(Debug, Clone)]
pub struct JsonlSource {
    name: String,
    path: PathBuf,
}

impl JsonlSource {
    /// Source named after the file stem.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "jsonl".to_string());
        Self { name, path }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn read_all(&self) -> CoreResult<Vec<ChangeRecord>> {
        let content = fs::read_to_string(&self.path).map_err(|e| CoreError::Source {
            source_name: self.name.clone(),
            reason: format!("failed to read '{}': {e}", self.path.display()),
        })?;

        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: ChangeRecord =
                serde_json::from_str(line).map_err(|e| CoreError::Source {
                    source_name: self.name.clone(),
                    reason: format!("{}:{}: {e}", self.path.display(), line_no + 1),
                })?;
            records.push(record);
        }
        sort_feed(&mut records);
        Ok(records)
    }
}

impl MetadataSource for JsonlSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn changes_since(
        &self,
        after: Option<Watermark>,
        limit: usize,
    ) -> CoreResult<Vec<ChangeRecord>> {
        Ok(select(&self.read_all()?, after, limit))
    }
}

/// In-process change feed, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    name: String,
    records: RwLock<Vec<ChangeRecord>>,
}

impl MemorySource {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(Vec::new()),
        }
    }

    /// Appends a change; the feed stays ordered.
    pub fn push(&self, record: ChangeRecord) {
        let mut records = self.records.write();
        records.push(record);
        sort_feed(&mut records);
    }

    pub fn upsert(&self, item_id: ItemId, updated_at: DateTime<Utc>, text: impl Into<String>) {
        self.push(ChangeRecord {
            item_id,
            updated_at,
            kind: ChangeKind::Upsert { text: text.into() },
        });
    }

    pub fn delete(&self, item_id: ItemId, updated_at: DateTime<Utc>) {
        self.push(ChangeRecord {
            item_id,
            updated_at,
            kind: ChangeKind::Delete,
        });
    }
}

impl MetadataSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn changes_since(
        &self,
        after: Option<Watermark>,
        limit: usize,
    ) -> CoreResult<Vec<ChangeRecord>> {
        Ok(select(&self.records.read(), after, limit))
    }
}
