use crate::layout::BookieLayout;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

const LOG_MAGIC: u32 = 0x424B_4C47; // "BKLG"
const LOG_VERSION: u32 = 1;
const LOG_HEADER_BYTES: u64 = 12;
/// Self-identifying prefix: ledgerId || entryId, big-endian.
pub const ENTRY_PREFIX_BYTES: usize = 16;
/// A stored frame length beyond this is corruption, not an allocation size.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Packs `(logId, positionInLog)` into the index offset encoding. The file
/// header keeps every real position above zero, so offset 0 stays the
/// "no mapping" sentinel.
pub fn pack_offset(log_id: u32, position: u32) -> u64 {
    ((log_id as u64) << 32) | position as u64
}

pub fn offset_log_id(offset: u64) -> u32 {
    (offset >> 32) as u32
}

pub fn offset_position(offset: u64) -> u32 {
    offset as u32
}

/// Sidecar meter for one entry-log file: total framed bytes plus the byte
/// contribution of each resident ledger. Live bytes fall as ledgers die.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogMeter {
    pub total_bytes: u64,
    #[serde(default)]
    pub ledger_bytes: BTreeMap<u64, u64>,
}

impl LogMeter {
    pub fn record(&mut self, ledger_id: u64, bytes: u64) {
        self.total_bytes += bytes;
        *self.ledger_bytes.entry(ledger_id).or_default() += bytes;
    }

    pub fn live_bytes(&self) -> u64 {
        self.ledger_bytes.values().sum()
    }

    pub fn liveness_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.live_bytes() as f64 / self.total_bytes as f64
        }
    }

    /// Drops a dead ledger's contribution; returns the bytes reclaimed.
    pub fn retire_ledger(&mut self, ledger_id: u64) -> u64 {
        self.ledger_bytes.remove(&ledger_id).unwrap_or(0)
    }
}

/// Liveness snapshot of one closed log, consumed by the garbage collector.
#[derive(Debug, Clone, PartialEq)]
pub struct LogStats {
    pub log_id: u32,
    pub total_bytes: u64,
    pub live_bytes: u64,
}

impl LogStats {
    pub fn liveness_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.live_bytes as f64 / self.total_bytes as f64
        }
    }
}

/// One frame scanned out of a closed log during compaction.
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub offset: u64,
    pub payload: Vec<u8>,
}

struct WriterState {
    file: File,
    log_id: u32,
    position: u64,
    meter: LogMeter,
}

/// Bounded cache of read-only handles onto past entry-log files.
struct ReaderCache {
    limit: usize,
    files: HashMap<u32, File>,
    order: VecDeque<u32>,
}

impl ReaderCache {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            files: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, layout: &BookieLayout, log_id: u32) -> Result<File, io::Error> {
        if let Some(file) = self.files.get(&log_id) {
            let handle = file.try_clone()?;
            self.touch(log_id);
            return Ok(handle);
        }
        let path = layout.entry_log_path(log_id);
        let file = File::open(path)?;
        let handle = file.try_clone()?;
        self.files.insert(log_id, file);
        self.order.push_back(log_id);
        while self.files.len() > self.limit {
            if let Some(evicted) = self.order.pop_front() {
                self.files.remove(&evicted);
            }
        }
        Ok(handle)
    }

    fn touch(&mut self, log_id: u32) {
        if let Some(idx) = self.order.iter().position(|&id| id == log_id) {
            self.order.remove(idx);
            self.order.push_back(log_id);
        }
    }

    fn evict(&mut self, log_id: u32) {
        self.files.remove(&log_id);
        if let Some(idx) = self.order.iter().position(|&id| id == log_id) {
            self.order.remove(idx);
        }
    }
}

/// Multiplexed bulk payload store: one writable current file, a pool of
/// read-only past files, and a liveness meter per file.
pub struct EntryLog {
    layout: BookieLayout,
    size_limit: u64,
    writer: Mutex<WriterState>,
    closed_meters: Mutex<BTreeMap<u32, LogMeter>>,
    readers: Mutex<ReaderCache>,
}

impl EntryLog {
    /// Opens the store. Every log already on disk is treated as closed; a
    /// fresh log id (never reused) becomes the writable file. Logs missing
    /// their meter sidecar (crash before close) have it rebuilt by scan.
    pub fn open(
        layout: BookieLayout,
        size_limit: u64,
        open_file_limit: usize,
    ) -> Result<Self, EntryLogError> {
        let existing = layout.scan_entry_logs()?;
        let next_log_id = existing.iter().map(|l| l.log_id + 1).max().unwrap_or(0);
        let mut closed = BTreeMap::new();
        for log in &existing {
            let meter_path = layout.meter_path(log.log_id);
            let meter = match fs::read(&meter_path) {
                Ok(bytes) => serde_json::from_slice(&bytes)?,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    let meter = rebuild_meter(&layout, log.log_id)?;
                    persist_meter(&layout, log.log_id, &meter)?;
                    info!("event=entrylog_meter_rebuilt log_id={}", log.log_id);
                    meter
                }
                Err(err) => return Err(EntryLogError::Io(err)),
            };
            closed.insert(log.log_id, meter);
        }
        let writer = create_log(&layout, next_log_id)?;
        Ok(Self {
            layout,
            size_limit,
            writer: Mutex::new(writer),
            closed_meters: Mutex::new(closed),
            readers: Mutex::new(ReaderCache::new(open_file_limit)),
        })
    }

    /// Frames and appends one entry, returning its packed offset. The payload
    /// must carry the 16-byte `ledgerId || entryId` prefix.
    pub fn add_entry(&self, ledger_id: u64, payload: &[u8]) -> Result<u64, EntryLogError> {
        if payload.len() < ENTRY_PREFIX_BYTES {
            return Err(EntryLogError::PayloadTooShort {
                len: payload.len(),
            });
        }
        let frame_len = 4 + payload.len() as u64;
        let mut writer = self.writer.lock();
        if writer.position + frame_len > self.size_limit && writer.position > LOG_HEADER_BYTES {
            self.roll_locked(&mut writer)?;
        }
        let position = writer.position as u32;
        let log_id = writer.log_id;
        writer
            .file
            .write_all(&(payload.len() as u32).to_be_bytes())?;
        writer.file.write_all(payload)?;
        writer.position += frame_len;
        writer.meter.record(ledger_id, frame_len);
        Ok(pack_offset(log_id, position))
    }

    /// Reads the frame at `offset` and verifies its self-identifying header
    /// against the requested coordinates. A mismatch is corruption and is
    /// never returned as data.
    pub fn read_entry(
        &self,
        ledger_id: u64,
        entry_id: u64,
        offset: u64,
    ) -> Result<Vec<u8>, EntryLogError> {
        let log_id = offset_log_id(offset);
        let position = offset_position(offset) as u64;
        let payload = self.read_frame(ledger_id, entry_id, log_id, position)?;
        if payload.len() < ENTRY_PREFIX_BYTES {
            return Err(EntryLogError::Corrupt {
                ledger_id,
                entry_id,
                log_id,
            });
        }
        let frame_ledger = u64::from_be_bytes(payload[0..8].try_into().expect("sized"));
        let frame_entry = u64::from_be_bytes(payload[8..16].try_into().expect("sized"));
        if frame_ledger != ledger_id || frame_entry != entry_id {
            warn!(
                "event=entrylog_header_mismatch log_id={log_id} position={position} \
                 want_ledger={ledger_id} want_entry={entry_id} \
                 found_ledger={frame_ledger} found_entry={frame_entry}"
            );
            return Err(EntryLogError::Corrupt {
                ledger_id,
                entry_id,
                log_id,
            });
        }
        Ok(payload)
    }

    fn read_frame(
        &self,
        ledger_id: u64,
        entry_id: u64,
        log_id: u32,
        position: u64,
    ) -> Result<Vec<u8>, EntryLogError> {
        let file = {
            let current = self.writer.lock().log_id;
            if log_id == current {
                // Reads of the current log go through a fresh handle; writes
                // are unbuffered so the OS cache makes them visible.
                File::open(self.layout.entry_log_path(log_id))?
            } else {
                self.readers.lock().get(&self.layout, log_id)?
            }
        };
        let mut len_buf = [0u8; 4];
        read_exact_at(&file, &mut len_buf, position)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        // The stored length is untrusted until it has passed this check.
        if len < ENTRY_PREFIX_BYTES || len > MAX_FRAME_BYTES {
            warn!(
                "event=entrylog_bad_frame_length log_id={log_id} position={position} len={len}"
            );
            return Err(EntryLogError::Corrupt {
                ledger_id,
                entry_id,
                log_id,
            });
        }
        let mut payload = vec![0u8; len];
        read_exact_at(&file, &mut payload, position + 4)?;
        Ok(payload)
    }

    /// Streams every frame of a closed log, oldest first, for compaction.
    pub fn scan_entries<F>(&self, log_id: u32, mut on_entry: F) -> Result<(), EntryLogError>
    where
        F: FnMut(ScannedEntry) -> Result<(), EntryLogError>,
    {
        let mut file = File::open(self.layout.entry_log_path(log_id))?;
        let end = file.seek(SeekFrom::End(0))?;
        let mut position = LOG_HEADER_BYTES;
        file.seek(SeekFrom::Start(position))?;
        while position + 4 <= end {
            let mut len_buf = [0u8; 4];
            file.read_exact(&mut len_buf)?;
            let len = u32::from_be_bytes(len_buf) as u64;
            if len < ENTRY_PREFIX_BYTES as u64 || position + 4 + len > end {
                warn!("event=entrylog_scan_truncated log_id={log_id} position={position}");
                break;
            }
            let mut payload = vec![0u8; len as usize];
            file.read_exact(&mut payload)?;
            let ledger_id = u64::from_be_bytes(payload[0..8].try_into().expect("sized"));
            let entry_id = u64::from_be_bytes(payload[8..16].try_into().expect("sized"));
            on_entry(ScannedEntry {
                ledger_id,
                entry_id,
                offset: pack_offset(log_id, position as u32),
                payload,
            })?;
            position += 4 + len;
        }
        Ok(())
    }

    /// Fsyncs the current file.
    pub fn flush(&self) -> Result<(), EntryLogError> {
        let writer = self.writer.lock();
        writer.file.sync_data()?;
        Ok(())
    }

    pub fn current_log_id(&self) -> u32 {
        self.writer.lock().log_id
    }

    /// Closes the current file and opens a fresh one. Exposed for the flush
    /// orchestrator and tests; `add_entry` rolls on its own at the limit.
    pub fn roll(&self) -> Result<u32, EntryLogError> {
        let mut writer = self.writer.lock();
        self.roll_locked(&mut writer)?;
        Ok(writer.log_id)
    }

    fn roll_locked(&self, writer: &mut WriterState) -> Result<(), EntryLogError> {
        writer.file.sync_data()?;
        let meter = std::mem::take(&mut writer.meter);
        persist_meter(&self.layout, writer.log_id, &meter)?;
        info!(
            "event=entrylog_rolled log_id={} bytes={} ledgers={}",
            writer.log_id,
            meter.total_bytes,
            meter.ledger_bytes.len()
        );
        self.closed_meters.lock().insert(writer.log_id, meter);
        *writer = create_log(&self.layout, writer.log_id + 1)?;
        Ok(())
    }

    /// Closed logs and their live fractions, oldest first.
    pub fn closed_log_stats(&self) -> Vec<LogStats> {
        self.closed_meters
            .lock()
            .iter()
            .map(|(&log_id, meter)| LogStats {
                log_id,
                total_bytes: meter.total_bytes,
                live_bytes: meter.live_bytes(),
            })
            .collect()
    }

    /// Removes a dead ledger's contribution from every closed-log meter and
    /// persists the touched sidecars. Returns `(log_id, reclaimed)` pairs.
    pub fn retire_ledger(&self, ledger_id: u64) -> Result<Vec<(u32, u64)>, EntryLogError> {
        let mut reclaimed = Vec::new();
        let mut meters = self.closed_meters.lock();
        for (&log_id, meter) in meters.iter_mut() {
            let bytes = meter.retire_ledger(ledger_id);
            if bytes > 0 {
                persist_meter(&self.layout, log_id, meter)?;
                reclaimed.push((log_id, bytes));
            }
        }
        Ok(reclaimed)
    }

    /// Deletes a closed log file and its meter. The caller must already have
    /// rewritten or abandoned every live entry it held.
    pub fn delete_log(&self, log_id: u32) -> Result<(), EntryLogError> {
        self.closed_meters.lock().remove(&log_id);
        self.readers.lock().evict(log_id);
        for path in [
            self.layout.entry_log_path(log_id),
            self.layout.meter_path(log_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(EntryLogError::Io(err)),
            }
        }
        info!("event=entrylog_deleted log_id={log_id}");
        Ok(())
    }
}

fn create_log(layout: &BookieLayout, log_id: u32) -> Result<WriterState, EntryLogError> {
    let path = layout.entry_log_path(log_id);
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)?;
    file.write_all(&LOG_MAGIC.to_be_bytes())?;
    file.write_all(&LOG_VERSION.to_be_bytes())?;
    file.write_all(&log_id.to_be_bytes())?;
    Ok(WriterState {
        file,
        log_id,
        position: LOG_HEADER_BYTES,
        meter: LogMeter::default(),
    })
}

fn persist_meter(layout: &BookieLayout, log_id: u32, meter: &LogMeter) -> Result<(), EntryLogError> {
    let path = layout.meter_path(log_id);
    let tmp = path.with_extension("meter.tmp");
    let payload = serde_json::to_vec_pretty(meter)?;
    let mut file = File::create(&tmp)?;
    file.write_all(&payload)?;
    file.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn rebuild_meter(layout: &BookieLayout, log_id: u32) -> Result<LogMeter, EntryLogError> {
    let mut meter = LogMeter::default();
    let mut file = File::open(layout.entry_log_path(log_id))?;
    let end = file.seek(SeekFrom::End(0))?;
    let mut position = LOG_HEADER_BYTES;
    file.seek(SeekFrom::Start(position))?;
    while position + 4 <= end {
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as u64;
        if len < ENTRY_PREFIX_BYTES as u64 || position + 4 + len > end {
            break;
        }
        let mut prefix = [0u8; 8];
        file.read_exact(&mut prefix)?;
        let ledger_id = u64::from_be_bytes(prefix);
        file.seek(SeekFrom::Start(position + 4 + len))?;
        meter.record(ledger_id, 4 + len);
        position += 4 + len;
    }
    Ok(meter)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    file.read_exact_at(buf, offset)
}

#[cfg(not(unix))]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[derive(Debug, Error)]
pub enum EntryLogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("layout error: {0}")]
    Layout(#[from] crate::layout::LayoutError),
    #[error("meter serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("entry payload too short ({len} bytes, need the 16-byte prefix)")]
    PayloadTooShort { len: usize },
    #[error("corrupt frame in log {log_id} for ledger {ledger_id} entry {entry_id}")]
    Corrupt {
        ledger_id: u64,
        entry_id: u64,
        log_id: u32,
    },
}

/// Builds the self-identifying wire payload for one entry.
pub fn make_payload(ledger_id: u64, entry_id: u64, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ENTRY_PREFIX_BYTES + body.len());
    payload.extend_from_slice(&ledger_id.to_be_bytes());
    payload.extend_from_slice(&entry_id.to_be_bytes());
    payload.extend_from_slice(body);
    payload
}
