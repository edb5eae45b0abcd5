use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENTRY_LOG_SUFFIX: &str = ".log";
pub const METER_SUFFIX: &str = ".meter";
pub const INDEX_SUFFIX: &str = ".idx";
pub const JOURNAL_SUFFIX: &str = ".txn";
const LAST_MARK_FILE: &str = "lastMark";
const CURRENT_DIR: &str = "current";

/// On-disk layout: one journal directory of `<txnFileId>.txn` files and one
/// or more ledger directories whose `current/` subtree holds entry logs,
/// meter sidecars, hashed index subdirectories, and the `lastMark`.
#[derive(Debug, Clone)]
pub struct BookieLayout {
    journal_dir: PathBuf,
    ledger_dirs: Vec<PathBuf>,
}

impl BookieLayout {
    pub fn new(journal_dir: impl Into<PathBuf>, ledger_dirs: Vec<PathBuf>) -> Self {
        Self {
            journal_dir: journal_dir.into(),
            ledger_dirs,
        }
    }

    pub fn journal_dir(&self) -> &Path {
        &self.journal_dir
    }

    pub fn ledger_dirs(&self) -> &[PathBuf] {
        &self.ledger_dirs
    }

    pub fn current_dirs(&self) -> Vec<PathBuf> {
        self.ledger_dirs
            .iter()
            .map(|dir| dir.join(CURRENT_DIR))
            .collect()
    }

    pub fn ensure(&self) -> Result<(), LayoutError> {
        fs::create_dir_all(&self.journal_dir)?;
        for dir in self.current_dirs() {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Entry logs are written round-robin across ledger directories, keyed by
    /// log id so the placement is stable across restarts.
    pub fn entry_log_dir(&self, log_id: u32) -> PathBuf {
        let slot = log_id as usize % self.ledger_dirs.len();
        self.ledger_dirs[slot].join(CURRENT_DIR)
    }

    pub fn entry_log_path(&self, log_id: u32) -> PathBuf {
        self.entry_log_dir(log_id).join(format!("{log_id}{ENTRY_LOG_SUFFIX}"))
    }

    pub fn meter_path(&self, log_id: u32) -> PathBuf {
        self.entry_log_dir(log_id).join(format!("{log_id}{METER_SUFFIX}"))
    }

    /// Index files live in a two-hex-digit bucket so no directory collects
    /// millions of ledgers.
    pub fn index_path(&self, ledger_id: u64) -> PathBuf {
        let slot = (ledger_id % self.ledger_dirs.len() as u64) as usize;
        let bucket = format!("{:02x}", ledger_id % 256);
        self.ledger_dirs[slot]
            .join(CURRENT_DIR)
            .join(bucket)
            .join(format!("{ledger_id}{INDEX_SUFFIX}"))
    }

    pub fn journal_path(&self, txn_file_id: u64) -> PathBuf {
        self.journal_dir.join(format!("{txn_file_id}{JOURNAL_SUFFIX}"))
    }

    pub fn scan_journal_files(&self) -> Result<Vec<JournalFileRef>, LayoutError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.journal_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(id) = parse_numeric_name(&entry.file_name(), JOURNAL_SUFFIX) {
                files.push(JournalFileRef {
                    file_id: id,
                    path: entry.path(),
                });
            }
        }
        files.sort_by_key(|file| file.file_id);
        Ok(files)
    }

    pub fn scan_entry_logs(&self) -> Result<Vec<EntryLogRef>, LayoutError> {
        let mut logs = Vec::new();
        for dir in self.current_dirs() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                if let Some(id) = parse_numeric_name(&entry.file_name(), ENTRY_LOG_SUFFIX) {
                    logs.push(EntryLogRef {
                        log_id: id as u32,
                        path: entry.path(),
                    });
                }
            }
        }
        logs.sort_by_key(|log| log.log_id);
        Ok(logs)
    }

    /// Walks every hashed index bucket and yields the ledger ids that have an
    /// index file on disk.
    pub fn scan_index_ledgers(&self) -> Result<Vec<u64>, LayoutError> {
        let mut ledgers = Vec::new();
        for dir in self.current_dirs() {
            for bucket in fs::read_dir(&dir)? {
                let bucket = bucket?;
                if !bucket.file_type()?.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(bucket.path())? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    if let Some(id) = parse_numeric_name(&entry.file_name(), INDEX_SUFFIX) {
                        ledgers.push(id);
                    }
                }
            }
        }
        ledgers.sort_unstable();
        Ok(ledgers)
    }

    pub fn mark_store(&self) -> LastMarkStore {
        LastMarkStore {
            paths: self
                .ledger_dirs
                .iter()
                .map(|dir| dir.join(CURRENT_DIR).join(LAST_MARK_FILE))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalFileRef {
    pub file_id: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLogRef {
    pub log_id: u32,
    pub path: PathBuf,
}

/// Last durable checkpoint: everything up to `last_txn_id` is present in the
/// entry log and index, and `last_log_id` was the writable log at that time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastMark {
    pub last_txn_id: u64,
    pub last_log_id: u32,
}

/// Persists the checkpoint mark into every ledger directory; the freshest
/// surviving copy wins on load.
#[derive(Debug, Clone)]
pub struct LastMarkStore {
    paths: Vec<PathBuf>,
}

impl LastMarkStore {
    pub fn load(&self) -> Result<LastMark, LayoutError> {
        let mut best = LastMark::default();
        for path in &self.paths {
            match fs::read(path) {
                Ok(bytes) => {
                    let mark: LastMark = serde_json::from_slice(&bytes)?;
                    if mark.last_txn_id > best.last_txn_id {
                        best = mark;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(LayoutError::Io(err)),
            }
        }
        Ok(best)
    }

    pub fn persist(&self, mark: LastMark) -> Result<(), LayoutError> {
        let payload = serde_json::to_vec_pretty(&mark)?;
        for path in &self.paths {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp_path = path.with_extension("tmp");
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&payload)?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)?;
        }
        Ok(())
    }
}

fn parse_numeric_name(name: &OsStr, suffix: &str) -> Option<u64> {
    let name = name.to_str()?;
    let digits = name.strip_suffix(suffix)?;
    digits.parse().ok()
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(tmp: &TempDir) -> BookieLayout {
        BookieLayout::new(
            tmp.path().join("journal"),
            vec![tmp.path().join("ledgers0"), tmp.path().join("ledgers1")],
        )
    }

    #[test]
    fn ensures_tree() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(&tmp);
        layout.ensure().unwrap();
        assert!(layout.journal_dir().exists());
        for dir in layout.current_dirs() {
            assert!(dir.exists());
        }
    }

    #[test]
    fn discovers_journal_and_entry_logs_in_order() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(&tmp);
        layout.ensure().unwrap();
        fs::write(layout.journal_path(3), b"x").unwrap();
        fs::write(layout.journal_path(1), b"x").unwrap();
        fs::write(layout.entry_log_path(0), b"x").unwrap();
        fs::write(layout.entry_log_path(5), b"x").unwrap();

        let journals = layout.scan_journal_files().unwrap();
        assert_eq!(
            journals.iter().map(|j| j.file_id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        let logs = layout.scan_entry_logs().unwrap();
        assert_eq!(logs.iter().map(|l| l.log_id).collect::<Vec<_>>(), vec![0, 5]);
    }

    #[test]
    fn index_paths_are_bucketed_and_discoverable() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(&tmp);
        layout.ensure().unwrap();
        for ledger in [7u64, 263, 1024] {
            let path = layout.index_path(ledger);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"x").unwrap();
        }
        let ledgers = layout.scan_index_ledgers().unwrap();
        assert_eq!(ledgers, vec![7, 263, 1024]);
    }

    #[test]
    fn last_mark_survives_and_takes_freshest() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(&tmp);
        layout.ensure().unwrap();
        let store = layout.mark_store();
        assert_eq!(store.load().unwrap(), LastMark::default());
        store
            .persist(LastMark {
                last_txn_id: 42,
                last_log_id: 2,
            })
            .unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.last_txn_id, 42);
        assert_eq!(loaded.last_log_id, 2);
    }
}
