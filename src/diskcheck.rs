use crate::layout::BookieLayout;
use log::{info, warn};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Filesystem usage for one monitored directory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        1.0 - self.available_bytes as f64 / self.total_bytes as f64
    }
}

pub fn sample_usage(path: &Path) -> io::Result<DiskUsage> {
    Ok(DiskUsage {
        total_bytes: fs2::total_space(path)?,
        available_bytes: fs2::available_space(path)?,
    })
}

/// The node's read-only state, tracked per cause so each owner clears only
/// what it set: operator configuration (never clears), a failed journal
/// fsync (clears only on restart), and a full disk (cleared by the checker
/// once usage recedes).
pub struct ReadOnlyState {
    forced: bool,
    journal_failed: AtomicBool,
    disk_full: AtomicBool,
}

impl ReadOnlyState {
    pub fn new(forced: bool) -> Self {
        Self {
            forced,
            journal_failed: AtomicBool::new(false),
            disk_full: AtomicBool::new(false),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.forced
            || self.journal_failed.load(Ordering::Acquire)
            || self.disk_full.load(Ordering::Acquire)
    }

    pub fn mark_journal_failed(&self) {
        self.journal_failed.store(true, Ordering::Release);
    }

    pub fn set_disk_full(&self, full: bool) {
        self.disk_full.store(full, Ordering::Release);
    }

    pub fn is_disk_full(&self) -> bool {
        self.disk_full.load(Ordering::Acquire)
    }
}

/// Watches the journal and ledger filesystems. When the fullest one crosses
/// `threshold` the bookie flips to read-only; it flips back only after usage
/// falls below `threshold - hysteresis`, so a filesystem hovering at the
/// boundary cannot oscillate. With transitions disabled the checker still
/// samples and logs but never changes the node's mode.
pub struct DiskChecker {
    layout: BookieLayout,
    threshold: f64,
    hysteresis: f64,
    transitions_enabled: bool,
    state: Arc<ReadOnlyState>,
}

impl DiskChecker {
    pub fn new(
        layout: BookieLayout,
        threshold: f64,
        hysteresis: f64,
        transitions_enabled: bool,
        state: Arc<ReadOnlyState>,
    ) -> Self {
        Self {
            layout,
            threshold,
            hysteresis,
            transitions_enabled,
            state,
        }
    }

    pub fn state(&self) -> Arc<ReadOnlyState> {
        self.state.clone()
    }

    /// Samples every monitored directory and returns the worst usage.
    pub fn worst_usage(&self) -> Result<f64, DiskCheckError> {
        let mut worst = 0.0f64;
        let mut dirs = vec![self.layout.journal_dir().to_path_buf()];
        dirs.extend(self.layout.ledger_dirs().iter().cloned());
        for dir in dirs {
            let usage = sample_usage(&dir).map_err(|source| DiskCheckError::Sample {
                dir: dir.display().to_string(),
                source,
            })?;
            worst = worst.max(usage.used_fraction());
        }
        Ok(worst)
    }

    /// One check pass. Sets or clears only the disk-full cause; the forced
    /// and journal-failure causes belong to their owners. Returns the node's
    /// read-only state after the pass.
    pub fn check_once(&self) -> Result<bool, DiskCheckError> {
        let usage = self.worst_usage()?;
        if !self.transitions_enabled {
            if usage >= self.threshold {
                warn!(
                    "event=disk_over_threshold usage={usage:.3} threshold={:.3} transitions=disabled",
                    self.threshold
                );
            }
            return Ok(self.state.is_read_only());
        }
        let disk_full = self.state.is_disk_full();
        if !disk_full && usage >= self.threshold {
            self.state.set_disk_full(true);
            warn!(
                "event=disk_read_only usage={usage:.3} threshold={:.3}",
                self.threshold
            );
        } else if disk_full && usage < self.threshold - self.hysteresis {
            self.state.set_disk_full(false);
            info!(
                "event=disk_writable usage={usage:.3} resume_below={:.3}",
                self.threshold - self.hysteresis
            );
        }
        Ok(self.state.is_read_only())
    }
}

/// Background thread driving `check_once` on a fixed cadence.
pub struct DiskCheckThread {
    shared: Arc<DiskCheckShared>,
    handle: Option<thread::JoinHandle<()>>,
}

struct DiskCheckShared {
    stop: AtomicBool,
    gate: Mutex<()>,
    cv: Condvar,
}

impl DiskCheckThread {
    pub fn spawn(checker: DiskChecker, interval: Duration) -> Result<Self, DiskCheckError> {
        let shared = Arc::new(DiskCheckShared {
            stop: AtomicBool::new(false),
            gate: Mutex::new(()),
            cv: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("disk-checker".into())
            .spawn(move || {
                while !thread_shared.stop.load(Ordering::Acquire) {
                    if let Err(err) = checker.check_once() {
                        warn!("event=disk_check_failed error={err}");
                    }
                    let guard = thread_shared.gate.lock().expect("disk gate poisoned");
                    let _ = thread_shared
                        .cv
                        .wait_timeout(guard, interval)
                        .expect("disk gate poisoned");
                }
            })
            .map_err(DiskCheckError::Io)?;
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

impl Drop for DiskCheckThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Error)]
pub enum DiskCheckError {
    #[error("failed to sample filesystem usage for {dir}: {source}")]
    Sample { dir: String, source: io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
