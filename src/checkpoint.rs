use crate::entrylog::{EntryLog, EntryLogError};
use crate::index::{IndexError, LedgerIndexCache};
use crate::journal::Journal;
use crate::layout::{LastMark, LastMarkStore, LayoutError};
use log::{info, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Tracks which journal transactions have been applied to the entry log and
/// index. Workers apply transactions out of global order, so the horizon the
/// journal may reclaim behind is `min(inflight) - 1`, not `max(applied)`.
#[derive(Debug, Default)]
pub struct TxnWatermark {
    state: Mutex<WatermarkState>,
}

#[derive(Debug, Default)]
struct WatermarkState {
    applied_max: u64,
    inflight: BTreeSet<u64>,
}

impl TxnWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `txn_id` as queued for apply. Call before the journal ack wait
    /// so the transaction can never be both durable and untracked.
    pub fn begin(&self, txn_id: u64) {
        self.state
            .lock()
            .expect("watermark poisoned")
            .inflight
            .insert(txn_id);
    }

    /// Marks `txn_id` finished, whether the apply succeeded or was abandoned.
    pub fn complete(&self, txn_id: u64) {
        let mut state = self.state.lock().expect("watermark poisoned");
        state.inflight.remove(&txn_id);
        if txn_id > state.applied_max {
            state.applied_max = txn_id;
        }
    }

    /// Highest txn id with no incomplete transaction at or below it.
    pub fn safe_horizon(&self) -> u64 {
        let state = self.state.lock().expect("watermark poisoned");
        match state.inflight.iter().next() {
            Some(&oldest) => oldest.saturating_sub(1),
            None => state.applied_max,
        }
    }

    /// Seeds the watermark after replay so the horizon starts at the last
    /// replayed transaction.
    pub fn reset_applied(&self, txn_id: u64) {
        let mut state = self.state.lock().expect("watermark poisoned");
        if txn_id > state.applied_max {
            state.applied_max = txn_id;
        }
    }
}

/// Periodic flush pipeline: entry log, then index, then the checkpoint mark,
/// then the journal horizon. The ordering is load-bearing: the mark must
/// never claim durability the downstream stores do not yet have.
pub struct FlushOrchestrator {
    entrylog: Arc<EntryLog>,
    index: Arc<LedgerIndexCache>,
    journal: Arc<Journal>,
    watermark: Arc<TxnWatermark>,
    mark_store: LastMarkStore,
}

impl FlushOrchestrator {
    pub fn new(
        entrylog: Arc<EntryLog>,
        index: Arc<LedgerIndexCache>,
        journal: Arc<Journal>,
        watermark: Arc<TxnWatermark>,
        mark_store: LastMarkStore,
    ) -> Self {
        Self {
            entrylog,
            index,
            journal,
            watermark,
            mark_store,
        }
    }

    /// Runs one full checkpoint and returns the mark it persisted.
    pub fn checkpoint(&self) -> Result<LastMark, CheckpointError> {
        let horizon = self.watermark.safe_horizon();
        self.entrylog.flush()?;
        self.index.flush_all()?;
        let mark = LastMark {
            last_txn_id: horizon,
            last_log_id: self.entrylog.current_log_id(),
        };
        self.mark_store.persist(mark)?;
        self.journal.advance_horizon(horizon);
        info!(
            "event=checkpoint last_txn_id={} last_log_id={}",
            mark.last_txn_id, mark.last_log_id
        );
        Ok(mark)
    }
}

/// Background thread driving `checkpoint` on a fixed cadence.
pub struct FlushThread {
    shared: Arc<FlushShared>,
    handle: Option<thread::JoinHandle<()>>,
}

struct FlushShared {
    stop: AtomicBool,
    gate: Mutex<()>,
    cv: Condvar,
}

impl FlushThread {
    pub fn spawn(
        orchestrator: Arc<FlushOrchestrator>,
        interval: Duration,
    ) -> Result<Self, CheckpointError> {
        let shared = Arc::new(FlushShared {
            stop: AtomicBool::new(false),
            gate: Mutex::new(()),
            cv: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("flush-orchestrator".into())
            .spawn(move || {
                while !thread_shared.stop.load(Ordering::Acquire) {
                    {
                        let guard = thread_shared.gate.lock().expect("flush gate poisoned");
                        let _ = thread_shared
                            .cv
                            .wait_timeout(guard, interval)
                            .expect("flush gate poisoned");
                    }
                    if thread_shared.stop.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = orchestrator.checkpoint() {
                        warn!("event=checkpoint_failed error={err}");
                    }
                }
            })
            .map_err(CheckpointError::Io)?;
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

impl Drop for FlushThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("entry log flush failed: {0}")]
    EntryLog(#[from] EntryLogError),
    #[error("index flush failed: {0}")]
    Index(#[from] IndexError),
    #[error("mark persistence failed: {0}")]
    Layout(#[from] LayoutError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
