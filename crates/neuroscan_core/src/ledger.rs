//! Append-only ledger of user corrections, mirrored to a JSON file.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::LedgerError;

/// Local wall-clock time, ISO-8601 without offset, microsecond precision.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// One recorded correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    /// ISO-8601 text, kept verbatim. New entries use local time without an
    /// offset; entries from other writers may carry `Z` or `+hh:mm`.
    pub timestamp: String,
    #[serde(rename = "original_prediction")]
    pub original_label: String,
    #[serde(rename = "corrected_prediction")]
    pub corrected_label: String,
}

impl FeedbackEntry {
    /// Key used in [`FeedbackStatistics::patterns`].
    pub fn pattern(&self) -> String {
        format!("{}→{}", self.original_label, self.corrected_label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedbackStatistics {
    pub total: usize,
    /// `"original→corrected"` to occurrence count.
    pub patterns: BTreeMap<String, usize>,
}

/// In-memory sequence of feedback entries plus its durable mirror.
#[derive(Debug)]
pub struct FeedbackLedger {
    path: PathBuf,
    entries: Vec<FeedbackEntry>,
}

impl FeedbackLedger {
    /// Opens the ledger stored at `path`.
    ///
    /// A missing file is an empty ledger. An unreadable or malformed file is
    /// logged and also yields an empty ledger; it is replaced on the next
    /// successful [`record`](Self::record).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match load_entries(&path) {
            Ok(Some(entries)) => {
                tracing::debug!(path = %path.display(), count = entries.len(), "feedback ledger loaded");
                entries
            }
            Ok(None) => {
                tracing::debug!(path = %path.display(), "no feedback ledger yet, starting empty");
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), "error loading feedback history: {err}");
                Vec::new()
            }
        };
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[FeedbackEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a correction and rewrites the store.
    ///
    /// On error the entry is removed again, so memory never holds an entry
    /// that is not on disk.
    pub fn record(
        &mut self,
        original_label: impl Into<String>,
        corrected_label: impl Into<String>,
    ) -> Result<&FeedbackEntry, LedgerError> {
        let entry = FeedbackEntry {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            original_label: original_label.into(),
            corrected_label: corrected_label.into(),
        };
        self.entries.push(entry);
        if let Err(source) = self.persist() {
            self.entries.pop();
            return Err(LedgerError::Persistence {
                path: self.path.clone(),
                source,
            });
        }

        let stats = self.statistics();
        let entry = &self.entries[self.entries.len() - 1];
        tracing::info!(
            original = %entry.original_label,
            corrected = %entry.corrected_label,
            total = stats.total,
            "recorded feedback correction"
        );
        for (pattern, count) in &stats.patterns {
            tracing::info!(%pattern, count, "correction pattern");
        }
        Ok(entry)
    }

    /// Totals and per-pattern counts over every entry, computed on each call.
    pub fn statistics(&self) -> FeedbackStatistics {
        let mut patterns = BTreeMap::new();
        for entry in &self.entries {
            *patterns.entry(entry.pattern()).or_insert(0) += 1;
        }
        FeedbackStatistics {
            total: self.entries.len(),
            patterns,
        }
    }

    /// Writes the full sequence to a sibling temp file and renames it over
    /// the store.
    fn persist(&self) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut ser = serde_json::Serializer::with_formatter(
                &mut tmp,
                serde_json::ser::PrettyFormatter::with_indent(b"    "),
            );
            self.entries.serialize(&mut ser).map_err(io::Error::other)?;
        }
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// `Ok(None)` when no store exists yet.
fn load_entries(path: &Path) -> io::Result<Option<Vec<FeedbackEntry>>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let entries = serde_json::from_str(&raw).map_err(io::Error::other)?;
    Ok(Some(entries))
}
