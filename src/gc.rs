use crate::entrylog::{EntryLog, EntryLogError};
use crate::index::{IndexError, LedgerIndexCache};
use crate::ledger::LedgerDescriptorTable;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Source of truth for which ledgers still exist cluster-wide. In
/// production this is backed by the external metadata store; tests use
/// `StaticManifest`.
pub trait LedgerManifest: Send + Sync {
    fn active_ledgers(&self) -> Result<HashSet<u64>, ManifestError>;
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("ledger manifest unavailable: {details}")]
    Unavailable { details: String },
}

/// In-process manifest for tests and single-node runs.
#[derive(Debug, Default)]
pub struct StaticManifest {
    ledgers: Mutex<HashSet<u64>>,
}

impl StaticManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ledger_id: u64) {
        self.ledgers.lock().expect("manifest poisoned").insert(ledger_id);
    }

    pub fn remove(&self, ledger_id: u64) {
        self.ledgers.lock().expect("manifest poisoned").remove(&ledger_id);
    }
}

impl LedgerManifest for StaticManifest {
    fn active_ledgers(&self) -> Result<HashSet<u64>, ManifestError> {
        Ok(self.ledgers.lock().expect("manifest poisoned").clone())
    }
}

/// Reclaims space in two stages: ledger GC deletes the index files and meter
/// contributions of ledgers the manifest no longer knows, then compaction
/// rewrites or deletes closed entry logs whose live fraction fell below the
/// active threshold.
pub struct GarbageCollector {
    /// None means no metadata store is reachable; ledger GC is skipped and
    /// only compaction runs.
    manifest: Option<Arc<dyn LedgerManifest>>,
    entrylog: Arc<EntryLog>,
    index: Arc<LedgerIndexCache>,
    ledgers: Arc<LedgerDescriptorTable>,
}

/// Outcome counts for one GC pass, mostly for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcOutcome {
    pub ledgers_deleted: usize,
    pub logs_deleted: usize,
    pub logs_compacted: usize,
    pub descriptors_evicted: usize,
}

impl GarbageCollector {
    pub fn new(
        manifest: Option<Arc<dyn LedgerManifest>>,
        entrylog: Arc<EntryLog>,
        index: Arc<LedgerIndexCache>,
        ledgers: Arc<LedgerDescriptorTable>,
    ) -> Self {
        Self {
            manifest,
            entrylog,
            index,
            ledgers,
        }
    }

    /// Deletes local state for every ledger on disk that the manifest no
    /// longer lists and is not pinned by an in-flight request. Idle
    /// descriptors are dropped first so the table does not grow with every
    /// ledger ever touched.
    pub fn ledger_gc_pass(&self) -> Result<GcOutcome, GcError> {
        let mut outcome = GcOutcome {
            descriptors_evicted: self.ledgers.evict_idle(),
            ..GcOutcome::default()
        };
        let manifest = match &self.manifest {
            Some(manifest) => manifest,
            None => return Ok(outcome),
        };
        let active = manifest.active_ledgers()?;
        for ledger_id in self.index.ledgers_on_disk()? {
            if active.contains(&ledger_id) {
                continue;
            }
            // A request holds the descriptor; the manifest may not list the
            // ledger yet. Leave it for a later pass.
            if self.ledgers.in_use(ledger_id) {
                continue;
            }
            let reclaimed = self.entrylog.retire_ledger(ledger_id)?;
            self.index.delete_ledger(ledger_id)?;
            self.ledgers.forget(ledger_id);
            let bytes: u64 = reclaimed.iter().map(|(_, b)| b).sum();
            info!("event=ledger_gc ledger_id={ledger_id} reclaimed_bytes={bytes}");
            outcome.ledgers_deleted += 1;
        }
        Ok(outcome)
    }

    /// Walks every closed log: deletes those with nothing live, rewrites
    /// those whose live fraction is below `threshold`.
    pub fn compact_pass(&self, threshold: f64) -> Result<GcOutcome, GcError> {
        let mut outcome = GcOutcome::default();
        for stats in self.entrylog.closed_log_stats() {
            if stats.live_bytes == 0 {
                self.entrylog.delete_log(stats.log_id)?;
                info!("event=entrylog_gc log_id={}", stats.log_id);
                outcome.logs_deleted += 1;
            } else if stats.liveness_ratio() < threshold {
                self.compact_log(stats.log_id)?;
                outcome.logs_compacted += 1;
            }
        }
        Ok(outcome)
    }

    /// Rewrites the live entries of one log into the current log and deletes
    /// the old file. An entry is live only while the index still points at
    /// its old offset; anything else in the file is garbage. A crash between
    /// the rewrite and the delete leaves a harmless duplicate frame that the
    /// next pass removes with the file.
    fn compact_log(&self, log_id: u32) -> Result<(), GcError> {
        let mut moved = 0u64;
        let entrylog = &self.entrylog;
        let index = &self.index;
        entrylog.scan_entries(log_id, |scanned| {
            let current = match index.get_entry_offset(scanned.ledger_id, scanned.entry_id) {
                Ok(offset) => offset,
                Err(IndexError::NoSuchLedger { .. }) => return Ok(()),
                Err(err) => {
                    return Err(EntryLogError::Io(std::io::Error::other(err.to_string())))
                }
            };
            if current != scanned.offset {
                return Ok(());
            }
            let new_offset = entrylog.add_entry(scanned.ledger_id, &scanned.payload)?;
            match index.put_entry_offset(scanned.ledger_id, scanned.entry_id, new_offset) {
                Ok(()) => {}
                // Ledger died mid-scan; its frames stop being live.
                Err(IndexError::NoSuchLedger { .. }) => return Ok(()),
                Err(err) => {
                    return Err(EntryLogError::Io(std::io::Error::other(err.to_string())))
                }
            }
            moved += 1;
            Ok(())
        })?;
        // Make the relocated entries durable before the only other copy goes
        // away.
        self.entrylog.flush()?;
        self.index.flush_all()?;
        self.entrylog.delete_log(log_id)?;
        info!("event=entrylog_compacted log_id={log_id} moved_entries={moved}");
        Ok(())
    }
}

/// Cadence settings for the background GC thread.
#[derive(Debug, Clone, Copy)]
pub struct GcSchedule {
    pub gc_wait: Duration,
    /// Negative disables the pass.
    pub minor_interval_secs: i64,
    pub minor_threshold: f64,
    pub major_interval_secs: i64,
    pub major_threshold: f64,
}

/// Background thread: ledger GC every `gc_wait`, compaction when a pass's
/// interval has elapsed. A due major pass subsumes the minor one.
pub struct GcThread {
    shared: Arc<GcShared>,
    handle: Option<thread::JoinHandle<()>>,
}

struct GcShared {
    stop: AtomicBool,
    gate: Mutex<()>,
    cv: Condvar,
}

impl GcThread {
    pub fn spawn(collector: GarbageCollector, schedule: GcSchedule) -> Result<Self, GcError> {
        let shared = Arc::new(GcShared {
            stop: AtomicBool::new(false),
            gate: Mutex::new(()),
            cv: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("gc-thread".into())
            .spawn(move || {
                let mut since_minor = Duration::ZERO;
                let mut since_major = Duration::ZERO;
                while !thread_shared.stop.load(Ordering::Acquire) {
                    {
                        let guard = thread_shared.gate.lock().expect("gc gate poisoned");
                        let _ = thread_shared
                            .cv
                            .wait_timeout(guard, schedule.gc_wait)
                            .expect("gc gate poisoned");
                    }
                    if thread_shared.stop.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = collector.ledger_gc_pass() {
                        warn!("event=ledger_gc_failed error={err}");
                    }
                    since_minor += schedule.gc_wait;
                    since_major += schedule.gc_wait;
                    let major_due = schedule.major_interval_secs >= 0
                        && since_major.as_secs() >= schedule.major_interval_secs as u64;
                    let minor_due = schedule.minor_interval_secs >= 0
                        && since_minor.as_secs() >= schedule.minor_interval_secs as u64;
                    if major_due {
                        since_major = Duration::ZERO;
                        since_minor = Duration::ZERO;
                        if let Err(err) = collector.compact_pass(schedule.major_threshold) {
                            warn!("event=compaction_failed kind=major error={err}");
                        }
                    } else if minor_due {
                        since_minor = Duration::ZERO;
                        if let Err(err) = collector.compact_pass(schedule.minor_threshold) {
                            warn!("event=compaction_failed kind=minor error={err}");
                        }
                    }
                }
            })
            .map_err(GcError::Io)?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Error)]
pub enum GcError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    EntryLog(#[from] EntryLogError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entrylog::{make_payload, offset_log_id};
    use crate::layout::BookieLayout;
    use tempfile::TempDir;

    struct Fixture {
        layout: BookieLayout,
        manifest: Arc<StaticManifest>,
        entrylog: Arc<EntryLog>,
        index: Arc<LedgerIndexCache>,
        ledgers: Arc<LedgerDescriptorTable>,
        collector: GarbageCollector,
    }

    fn fixture(tmp: &TempDir) -> Fixture {
        let layout = BookieLayout::new(tmp.path().join("journal"), vec![tmp.path().join("l0")]);
        layout.ensure().unwrap();
        let manifest = Arc::new(StaticManifest::new());
        let entrylog = Arc::new(EntryLog::open(layout.clone(), 1024 * 1024, 4).unwrap());
        let index = Arc::new(LedgerIndexCache::new(layout.clone(), 256, 16, 4));
        let ledgers = Arc::new(LedgerDescriptorTable::new(index.clone()));
        let collector = GarbageCollector::new(
            Some(manifest.clone()),
            entrylog.clone(),
            index.clone(),
            ledgers.clone(),
        );
        Fixture {
            layout,
            manifest,
            entrylog,
            index,
            ledgers,
            collector,
        }
    }

    fn seed_entry(fixture: &Fixture, ledger: u64, entry: u64) -> u64 {
        if fixture.index.ledger_meta(ledger).unwrap().is_none() {
            fixture.index.create_ledger(ledger, [7u8; 20]).unwrap();
        }
        let payload = make_payload(ledger, entry, b"gc-payload");
        let offset = fixture.entrylog.add_entry(ledger, &payload).unwrap();
        fixture.index.put_entry_offset(ledger, entry, offset).unwrap();
        offset
    }

    #[test]
    fn dead_ledgers_are_deleted_live_ones_kept() {
        let tmp = TempDir::new().unwrap();
        let fixture = fixture(&tmp);
        seed_entry(&fixture, 1, 0);
        seed_entry(&fixture, 2, 0);
        fixture.manifest.insert(1);

        let outcome = fixture.collector.ledger_gc_pass().unwrap();
        assert_eq!(outcome.ledgers_deleted, 1);
        assert!(fixture.index.ledger_meta(2).unwrap().is_none());
        assert!(fixture.index.ledger_meta(1).unwrap().is_some());
    }

    #[test]
    fn referenced_ledger_survives_gc_until_released() {
        let tmp = TempDir::new().unwrap();
        let fixture = fixture(&tmp);
        // A writer touches ledger 9 before the manifest lists it; GC must
        // not tear the ledger out from under the live handle.
        let handle = fixture
            .ledgers
            .acquire_for_write(9, [7u8; 20], false)
            .unwrap();

        let outcome = fixture.collector.ledger_gc_pass().unwrap();
        assert_eq!(outcome.ledgers_deleted, 0);
        assert!(fixture.index.ledger_meta(9).unwrap().is_some());

        drop(handle);
        let outcome = fixture.collector.ledger_gc_pass().unwrap();
        assert_eq!(outcome.ledgers_deleted, 1);
        assert_eq!(outcome.descriptors_evicted, 1);
        assert!(fixture.index.ledger_meta(9).unwrap().is_none());
    }

    #[test]
    fn empty_closed_log_is_deleted_outright() {
        let tmp = TempDir::new().unwrap();
        let fixture = fixture(&tmp);
        seed_entry(&fixture, 5, 0);
        let old_log = fixture.entrylog.current_log_id();
        fixture.entrylog.roll().unwrap();
        // Retire the only ledger; the closed log holds nothing live.
        fixture.collector.ledger_gc_pass().unwrap();

        let outcome = fixture.collector.compact_pass(0.5).unwrap();
        assert_eq!(outcome.logs_deleted, 1);
        assert!(!fixture.layout.entry_log_path(old_log).exists());
    }

    #[test]
    fn compaction_relocates_live_entries() {
        let tmp = TempDir::new().unwrap();
        let fixture = fixture(&tmp);
        fixture.manifest.insert(1);
        let live_offset = seed_entry(&fixture, 1, 0);
        seed_entry(&fixture, 2, 0);
        seed_entry(&fixture, 2, 1);
        seed_entry(&fixture, 2, 2);
        let old_log = fixture.entrylog.current_log_id();
        fixture.entrylog.roll().unwrap();
        // Ledger 2 dies; the closed log is mostly garbage.
        fixture.collector.ledger_gc_pass().unwrap();

        let outcome = fixture.collector.compact_pass(0.9).unwrap();
        assert_eq!(outcome.logs_compacted, 1);
        assert!(!fixture.layout.entry_log_path(old_log).exists());

        let new_offset = fixture.index.get_entry_offset(1, 0).unwrap();
        assert_ne!(new_offset, 0);
        assert_ne!(new_offset, live_offset);
        assert_ne!(offset_log_id(new_offset), old_log);
        let payload = fixture.entrylog.read_entry(1, 0, new_offset).unwrap();
        assert_eq!(payload, make_payload(1, 0, b"gc-payload"));
    }

    #[test]
    fn healthy_log_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let fixture = fixture(&tmp);
        fixture.manifest.insert(3);
        seed_entry(&fixture, 3, 0);
        let old_log = fixture.entrylog.current_log_id();
        fixture.entrylog.roll().unwrap();

        let outcome = fixture.collector.compact_pass(0.5).unwrap();
        assert_eq!(outcome, GcOutcome::default());
        assert!(fixture.layout.entry_log_path(old_log).exists());
    }
}
