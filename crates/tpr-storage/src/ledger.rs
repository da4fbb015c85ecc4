//! Durable set of record ids that have already been accepted for processing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tpr_core::RecordId;
use tracing::{debug, info};
use uuid::Uuid;

const LEDGER_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing ledger: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub qualified: Option<String>,
    pub raw: String,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    entries: Vec<LedgerEntry>,
}

/// Snapshot of known id forms handed to adapters so they can skip known records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    forms: HashSet<String>,
}

impl ExclusionSet {
    pub fn contains(&self, id: &RecordId) -> bool {
        id.forms().iter().any(|form| self.forms.contains(form))
    }

    pub fn len(&self) -> usize {
        self.forms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forms.is_empty()
    }
}

impl FromIterator<RecordId> for ExclusionSet {
    fn from_iter<I: IntoIterator<Item = RecordId>>(iter: I) -> Self {
        let forms = iter.into_iter().flat_map(|id| id.forms()).collect();
        Self { forms }
    }
}

/// File-backed ledger. Marks are buffered in memory and written out every
/// `flush_every` new entries, so a crash loses at most that many marks.
#[derive(Debug)]
pub struct DedupLedger {
    path: Option<PathBuf>,
    flush_every: usize,
    known: HashSet<String>,
    entries: Vec<LedgerEntry>,
    unflushed: usize,
}

impl DedupLedger {
    pub async fn open(path: impl Into<PathBuf>, flush_every: usize) -> Result<Self, LedgerError> {
        let path = path.into();
        let mut ledger = Self {
            path: Some(path.clone()),
            flush_every: flush_every.max(1),
            known: HashSet::new(),
            entries: Vec::new(),
            unflushed: 0,
        };

        let exists = fs::try_exists(&path).await.map_err(|source| LedgerError::Io {
            path: path.clone(),
            source,
        })?;
        if !exists {
            info!(path = %path.display(), "starting empty dedup ledger");
            return Ok(ledger);
        }

        let text = fs::read_to_string(&path)
            .await
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;
        let file: LedgerFile = serde_json::from_str(&text).map_err(|source| LedgerError::Corrupt {
            path: path.clone(),
            source,
        })?;
        for entry in file.entries {
            ledger.index_entry(&entry);
            ledger.entries.push(entry);
        }
        info!(path = %path.display(), entries = ledger.entries.len(), "loaded dedup ledger");
        Ok(ledger)
    }

    /// Ledger with no backing file; `flush` is a no-op.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            flush_every: usize::MAX,
            known: HashSet::new(),
            entries: Vec::new(),
            unflushed: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unflushed(&self) -> usize {
        self.unflushed
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn is_known(&self, id: &RecordId) -> bool {
        id.forms().iter().any(|form| self.known.contains(form))
    }

    /// Records both forms of `id`. Returns `false` when the id was already known.
    pub async fn mark_known(&mut self, id: &RecordId) -> Result<bool, LedgerError> {
        let already_known = self.is_known(id);
        for form in id.forms() {
            self.known.insert(form);
        }
        if already_known {
            return Ok(false);
        }

        self.entries.push(LedgerEntry {
            qualified: id.qualified(),
            raw: id.raw().to_string(),
            first_seen_at: Utc::now(),
        });
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush().await?;
        }
        Ok(true)
    }

    pub fn build_exclusion_set(&self) -> ExclusionSet {
        ExclusionSet {
            forms: self.known.clone(),
        }
    }

    /// Writes the ledger through a temp file and an atomic rename.
    pub async fn flush(&mut self) -> Result<(), LedgerError> {
        let Some(path) = self.path.clone() else {
            self.unflushed = 0;
            return Ok(());
        };
        let io_err = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };

        let bytes = serde_json::to_vec_pretty(&LedgerFile {
            version: LEDGER_FORMAT_VERSION,
            entries: self.entries.clone(),
        })?;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.ledger.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }

        debug!(entries = self.entries.len(), flushed = self.unflushed, "flushed dedup ledger");
        self.unflushed = 0;
        Ok(())
    }

    fn index_entry(&mut self, entry: &LedgerEntry) {
        if let Some(qualified) = &entry.qualified {
            self.known.insert(qualified.clone());
        }
        self.known.insert(entry.raw.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn marking_qualified_form_makes_raw_form_known() {
        let mut ledger = DedupLedger::in_memory();
        let qualified = RecordId::new("lichess", "q7Zt0001");
        assert!(ledger.mark_known(&qualified).await.unwrap());

        assert!(ledger.is_known(&qualified));
        assert!(ledger.is_known(&RecordId::raw_only("q7Zt0001")));
        assert!(ledger.is_known(&RecordId::parse("lichess_q7Zt0001")));
    }

    #[tokio::test]
    async fn marking_raw_form_makes_qualified_form_known() {
        let mut ledger = DedupLedger::in_memory();
        assert!(ledger.mark_known(&RecordId::raw_only("981234")).await.unwrap());

        assert!(ledger.is_known(&RecordId::new("chesscom", "981234")));
        assert!(!ledger.mark_known(&RecordId::new("chesscom", "981234")).await.unwrap());
        assert_eq!(ledger.len(), 1);

        let exclusion = ledger.build_exclusion_set();
        assert!(exclusion.contains(&RecordId::parse("chesscom_981234")));
        assert!(exclusion.contains(&RecordId::parse("981234")));
        assert!(!exclusion.contains(&RecordId::parse("chesscom_000001")));
    }

    #[tokio::test]
    async fn ledger_survives_restart_after_flush() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("ledger.json");

        let mut ledger = DedupLedger::open(&path, 100).await.unwrap();
        ledger.mark_known(&RecordId::new("lichess", "a1")).await.unwrap();
        ledger.mark_known(&RecordId::raw_only("b2")).await.unwrap();
        assert_eq!(ledger.unflushed(), 2);
        ledger.flush().await.unwrap();
        assert_eq!(ledger.unflushed(), 0);
        drop(ledger);

        let reopened = DedupLedger::open(&path, 100).await.unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.is_known(&RecordId::raw_only("a1")));
        assert!(reopened.is_known(&RecordId::new("fixture", "b2")));
    }

    #[tokio::test]
    async fn periodic_flush_bounds_unflushed_marks() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let mut ledger = DedupLedger::open(&path, 3).await.unwrap();

        for n in 0..7 {
            ledger
                .mark_known(&RecordId::new("lichess", format!("g{n}")))
                .await
                .unwrap();
        }
        assert_eq!(ledger.unflushed(), 1);

        // Simulated crash: the unflushed seventh mark is lost, the first six are not.
        drop(ledger);
        let reopened = DedupLedger::open(&path, 3).await.unwrap();
        assert_eq!(reopened.len(), 6);
        assert!(!reopened.is_known(&RecordId::raw_only("g6")));
    }

    #[tokio::test]
    async fn corrupt_ledger_is_reported() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let err = DedupLedger::open(&path, 10).await.unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { .. }));
    }
}
