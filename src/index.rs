use crate::layout::BookieLayout;
use log::info;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::sync::Arc;
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom, Write};

const INDEX_MAGIC: u32 = 0x424B_4958; // "BKIX"
const INDEX_VERSION: u32 = 1;
pub const MASTER_KEY_BYTES: usize = 20;
// magic + version + key + fenced + last_entry
const HEADER_USED_BYTES: usize = 4 + 4 + MASTER_KEY_BYTES + 1 + 8;

/// Descriptor metadata persisted in an index file's header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLedgerMeta {
    pub master_key: [u8; MASTER_KEY_BYTES],
    pub fenced: bool,
    pub last_entry_id: u64,
}

struct LedgerState {
    meta: IndexLedgerMeta,
    header_dirty: bool,
}

struct Page {
    slots: Vec<u64>,
    dirty: bool,
}

type PageKey = (u64, u64);

struct PageTable {
    pages: HashMap<PageKey, Arc<RwLock<Page>>>,
    page_lru: VecDeque<PageKey>,
    ledgers: HashMap<u64, LedgerState>,
    files: HashMap<u64, File>,
    file_lru: VecDeque<u64>,
}

/// Paged map `(ledgerId, entryId) -> offset` with per-ledger file backing.
///
/// The resident page set is LRU-bounded; dirty pages are written to their
/// index file before eviction. Each index file opens with a metadata header
/// page (master key, fenced flag, last entry id); data page `i` lives at file
/// offset `(i + 1) * pageSize`, and a zero slot means "no mapping".
pub struct LedgerIndexCache {
    layout: BookieLayout,
    page_size: usize,
    entries_per_page: u64,
    page_limit: usize,
    open_file_limit: usize,
    table: Mutex<PageTable>,
}

impl LedgerIndexCache {
    pub fn new(
        layout: BookieLayout,
        page_size: usize,
        page_limit: usize,
        open_file_limit: usize,
    ) -> Self {
        Self {
            layout,
            page_size,
            entries_per_page: (page_size / 8) as u64,
            page_limit: page_limit.max(4),
            open_file_limit: open_file_limit.max(1),
            table: Mutex::new(PageTable {
                pages: HashMap::new(),
                page_lru: VecDeque::new(),
                ledgers: HashMap::new(),
                files: HashMap::new(),
                file_lru: VecDeque::new(),
            }),
        }
    }

    /// Creates the ledger's index file with its header page, fsynced, binding
    /// the master key durably before any journal record can reference the
    /// ledger. Idempotent for an already-known ledger.
    pub fn create_ledger(
        &self,
        ledger_id: u64,
        master_key: [u8; MASTER_KEY_BYTES],
    ) -> Result<(), IndexError> {
        let mut table = self.table.lock();
        if self.load_ledger(&mut table, ledger_id)?.is_some() {
            return Ok(());
        }
        let meta = IndexLedgerMeta {
            master_key,
            fenced: false,
            last_entry_id: 0,
        };
        {
            let file = self.open_file(&mut table, ledger_id)?;
            write_header(file, self.page_size, &meta)?;
            file.sync_data()?;
        }
        table.ledgers.insert(
            ledger_id,
            LedgerState {
                meta,
                header_dirty: false,
            },
        );
        info!("event=ledger_index_created ledger_id={ledger_id}");
        Ok(())
    }

    /// Header metadata for a ledger, or None if the ledger has no index file.
    pub fn ledger_meta(&self, ledger_id: u64) -> Result<Option<IndexLedgerMeta>, IndexError> {
        let mut table = self.table.lock();
        Ok(self.load_ledger(&mut table, ledger_id)?.map(|s| s.meta))
    }

    pub fn put_entry_offset(
        &self,
        ledger_id: u64,
        entry_id: u64,
        offset: u64,
    ) -> Result<(), IndexError> {
        let page_index = entry_id / self.entries_per_page;
        let slot = (entry_id % self.entries_per_page) as usize;
        let mut table = self.table.lock();
        if self.load_ledger(&mut table, ledger_id)?.is_none() {
            return Err(IndexError::NoSuchLedger { ledger_id });
        }
        let page = self.load_page(&mut table, ledger_id, page_index)?;
        let state = table.ledgers.get_mut(&ledger_id).expect("loaded above");
        if entry_id > state.meta.last_entry_id {
            state.meta.last_entry_id = entry_id;
            state.header_dirty = true;
        }
        drop(table);
        let mut guard = page.write();
        guard.slots[slot] = offset;
        guard.dirty = true;
        Ok(())
    }

    /// Returns the stored offset, or 0 when no entry is mapped (including the
    /// case where the ledger has no index at all).
    pub fn get_entry_offset(&self, ledger_id: u64, entry_id: u64) -> Result<u64, IndexError> {
        let page_index = entry_id / self.entries_per_page;
        let slot = (entry_id % self.entries_per_page) as usize;
        let mut table = self.table.lock();
        if self.load_ledger(&mut table, ledger_id)?.is_none() {
            return Ok(0);
        }
        let page = self.load_page(&mut table, ledger_id, page_index)?;
        drop(table);
        let guard = page.read();
        Ok(guard.slots[slot])
    }

    /// Last entry id whose offset is durable in this bookie's index. This may
    /// trail the writing client's last-add-confirmed.
    pub fn get_last_entry(&self, ledger_id: u64) -> Result<u64, IndexError> {
        let mut table = self.table.lock();
        match self.load_ledger(&mut table, ledger_id)? {
            Some(state) => Ok(state.meta.last_entry_id),
            None => Err(IndexError::NoSuchLedger { ledger_id }),
        }
    }

    /// Durable flip of the fenced bit: returns only after the header page is
    /// rewritten and fsynced.
    pub fn set_fenced(&self, ledger_id: u64) -> Result<(), IndexError> {
        let mut table = self.table.lock();
        match self.load_ledger(&mut table, ledger_id)? {
            Some(_) => {}
            None => return Err(IndexError::NoSuchLedger { ledger_id }),
        }
        let state = table.ledgers.get_mut(&ledger_id).expect("loaded above");
        state.meta.fenced = true;
        let meta = state.meta;
        state.header_dirty = false;
        let page_size = self.page_size;
        let file = self.open_file(&mut table, ledger_id)?;
        write_header(file, page_size, &meta)?;
        file.sync_data()?;
        info!("event=ledger_fenced ledger_id={ledger_id}");
        Ok(())
    }

    pub fn is_fenced(&self, ledger_id: u64) -> Result<bool, IndexError> {
        Ok(self.ledger_meta(ledger_id)?.map(|m| m.fenced).unwrap_or(false))
    }

    /// Flushes every dirty header and page, fsyncing each touched file once.
    pub fn flush_all(&self) -> Result<(), IndexError> {
        let mut table = self.table.lock();
        let mut touched: Vec<u64> = Vec::new();

        let dirty_ledgers: Vec<u64> = table
            .ledgers
            .iter()
            .filter(|(_, s)| s.header_dirty)
            .map(|(&id, _)| id)
            .collect();
        for ledger_id in dirty_ledgers {
            let meta = table.ledgers.get(&ledger_id).expect("listed above").meta;
            let page_size = self.page_size;
            let file = self.open_file(&mut table, ledger_id)?;
            write_header(file, page_size, &meta)?;
            table.ledgers.get_mut(&ledger_id).expect("listed").header_dirty = false;
            touched.push(ledger_id);
        }

        let dirty_pages: Vec<(PageKey, Arc<RwLock<Page>>)> = table
            .pages
            .iter()
            .filter(|(_, p)| p.read().dirty)
            .map(|(&k, p)| (k, p.clone()))
            .collect();
        for ((ledger_id, page_index), page) in dirty_pages {
            self.write_page(&mut table, ledger_id, page_index, &page)?;
            touched.push(ledger_id);
        }

        touched.sort_unstable();
        touched.dedup();
        for ledger_id in touched {
            let file = self.open_file(&mut table, ledger_id)?;
            file.sync_data()?;
        }
        Ok(())
    }

    /// Drops every resident page and the file for a dead ledger, removing the
    /// index file from disk.
    pub fn delete_ledger(&self, ledger_id: u64) -> Result<(), IndexError> {
        let mut table = self.table.lock();
        table.pages.retain(|&(lid, _), _| lid != ledger_id);
        table.page_lru.retain(|&(lid, _)| lid != ledger_id);
        table.ledgers.remove(&ledger_id);
        table.files.remove(&ledger_id);
        table.file_lru.retain(|&lid| lid != ledger_id);
        let path = self.layout.index_path(ledger_id);
        match fs::remove_file(&path) {
            Ok(()) => info!("event=ledger_index_deleted ledger_id={ledger_id}"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(IndexError::Io(err)),
        }
        Ok(())
    }

    /// Ledger ids with an index file on disk (resident or not).
    pub fn ledgers_on_disk(&self) -> Result<Vec<u64>, IndexError> {
        Ok(self.layout.scan_index_ledgers()?)
    }

    fn load_ledger<'a>(
        &self,
        table: &'a mut PageTable,
        ledger_id: u64,
    ) -> Result<Option<&'a LedgerState>, IndexError> {
        if !table.ledgers.contains_key(&ledger_id) {
            let path = self.layout.index_path(ledger_id);
            if !path.is_file() {
                return Ok(None);
            }
            let meta = {
                let file = self.open_file(table, ledger_id)?;
                read_header(file)?
            };
            table.ledgers.insert(
                ledger_id,
                LedgerState {
                    meta,
                    header_dirty: false,
                },
            );
        }
        Ok(table.ledgers.get(&ledger_id))
    }

    // Data page i lives at (i + 1) * pageSize; page 0 of the file is the
    // metadata header. Guard the arithmetic so absurd entry ids fail cleanly.
    fn page_offset(&self, page_index: u64) -> Result<u64, IndexError> {
        page_index
            .checked_add(1)
            .and_then(|n| n.checked_mul(self.page_size as u64))
            .ok_or(IndexError::PageOutOfRange { page_index })
    }

    fn load_page(
        &self,
        table: &mut PageTable,
        ledger_id: u64,
        page_index: u64,
    ) -> Result<Arc<RwLock<Page>>, IndexError> {
        let key = (ledger_id, page_index);
        if let Some(page) = table.pages.get(&key) {
            let page = page.clone();
            promote(&mut table.page_lru, key);
            return Ok(page);
        }
        // Page-in from the backing file; absent regions read as zeroes.
        let offset = self.page_offset(page_index)?;
        let mut raw = vec![0u8; self.page_size];
        {
            let file = self.open_file(table, ledger_id)?;
            read_page_at(file, &mut raw, offset)?;
        }
        let slots = raw
            .chunks_exact(8)
            .map(|chunk| u64::from_be_bytes(chunk.try_into().expect("sized")))
            .collect();
        let page = Arc::new(RwLock::new(Page {
            slots,
            dirty: false,
        }));
        table.pages.insert(key, page.clone());
        table.page_lru.push_back(key);
        while table.pages.len() > self.page_limit {
            self.evict_one(table)?;
        }
        Ok(page)
    }

    fn evict_one(&self, table: &mut PageTable) -> Result<(), IndexError> {
        let Some(victim) = table.page_lru.pop_front() else {
            return Ok(());
        };
        let Some(page) = table.pages.get(&victim).cloned() else {
            return Ok(());
        };
        if page.read().dirty {
            // A dirty page must reach its backing file before leaving memory.
            self.write_page(table, victim.0, victim.1, &page)?;
            let file = self.open_file(table, victim.0)?;
            file.sync_data()?;
        }
        table.pages.remove(&victim);
        Ok(())
    }

    fn write_page(
        &self,
        table: &mut PageTable,
        ledger_id: u64,
        page_index: u64,
        page: &Arc<RwLock<Page>>,
    ) -> Result<(), IndexError> {
        // The write lock is held across snapshot, file write, and the dirty
        // clear: a slot update landing in between must leave the page dirty.
        let mut guard = page.write();
        let mut raw = Vec::with_capacity(self.page_size);
        for &slot in &guard.slots {
            raw.extend_from_slice(&slot.to_be_bytes());
        }
        let offset = self.page_offset(page_index)?;
        {
            let file = self.open_file(table, ledger_id)?;
            write_page_at(file, &raw, offset)?;
        }
        guard.dirty = false;
        Ok(())
    }

    fn open_file<'a>(
        &self,
        table: &'a mut PageTable,
        ledger_id: u64,
    ) -> Result<&'a File, IndexError> {
        if !table.files.contains_key(&ledger_id) {
            let path = self.layout.index_path(ledger_id);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            table.files.insert(ledger_id, file);
            table.file_lru.push_back(ledger_id);
            while table.files.len() > self.open_file_limit {
                if let Some(evicted) = table.file_lru.pop_front() {
                    if evicted == ledger_id {
                        table.file_lru.push_back(evicted);
                        continue;
                    }
                    // Dropping the handle flushes nothing we still need:
                    // dirty pages persist independently on their next flush.
                    if let Some(file) = table.files.remove(&evicted) {
                        let _ = file.sync_data();
                    }
                }
            }
        } else {
            promote(&mut table.file_lru, ledger_id);
        }
        Ok(table.files.get(&ledger_id).expect("inserted above"))
    }
}

fn promote<T: PartialEq + Copy>(lru: &mut VecDeque<T>, key: T) {
    if let Some(idx) = lru.iter().position(|&k| k == key) {
        lru.remove(idx);
        lru.push_back(key);
    }
}

fn write_header(file: &File, page_size: usize, meta: &IndexLedgerMeta) -> Result<(), IndexError> {
    let mut raw = vec![0u8; page_size];
    raw[0..4].copy_from_slice(&INDEX_MAGIC.to_be_bytes());
    raw[4..8].copy_from_slice(&INDEX_VERSION.to_be_bytes());
    raw[8..28].copy_from_slice(&meta.master_key);
    raw[28] = meta.fenced as u8;
    raw[29..37].copy_from_slice(&meta.last_entry_id.to_be_bytes());
    write_page_at(file, &raw, 0)?;
    Ok(())
}

fn read_header(file: &File) -> Result<IndexLedgerMeta, IndexError> {
    let mut raw = [0u8; HEADER_USED_BYTES];
    read_page_at(file, &mut raw, 0)?;
    let magic = u32::from_be_bytes(raw[0..4].try_into().expect("sized"));
    if magic != INDEX_MAGIC {
        return Err(IndexError::CorruptHeader { magic });
    }
    let mut master_key = [0u8; MASTER_KEY_BYTES];
    master_key.copy_from_slice(&raw[8..28]);
    Ok(IndexLedgerMeta {
        master_key,
        fenced: raw[28] != 0,
        last_entry_id: u64::from_be_bytes(raw[29..37].try_into().expect("sized")),
    })
}

/// Reads up to `buf.len()` bytes at `offset`; bytes past EOF stay zero.
fn read_page_at(file: &File, buf: &mut [u8], offset: u64) -> Result<(), IndexError> {
    let len = file.metadata()?.len();
    if offset >= len {
        return Ok(());
    }
    let available = ((len - offset) as usize).min(buf.len());
    #[cfg(unix)]
    {
        file.read_exact_at(&mut buf[..available], offset)?;
    }
    #[cfg(not(unix))]
    {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..available])?;
    }
    Ok(())
}

fn write_page_at(file: &File, buf: &[u8], offset: u64) -> Result<(), IndexError> {
    #[cfg(unix)]
    {
        file.write_all_at(buf, offset)?;
    }
    #[cfg(not(unix))]
    {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("layout error: {0}")]
    Layout(#[from] crate::layout::LayoutError),
    #[error("no such ledger {ledger_id}")]
    NoSuchLedger { ledger_id: u64 },
    #[error("corrupt index header (magic {magic:#010x})")]
    CorruptHeader { magic: u32 },
    #[error("index page {page_index} out of addressable range")]
    PageOutOfRange { page_index: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: [u8; MASTER_KEY_BYTES] = [7u8; MASTER_KEY_BYTES];

    fn cache(tmp: &TempDir, page_limit: usize) -> (BookieLayout, LedgerIndexCache) {
        let layout = BookieLayout::new(tmp.path().join("journal"), vec![tmp.path().join("l0")]);
        layout.ensure().unwrap();
        let cache = LedgerIndexCache::new(layout.clone(), 256, page_limit, 4);
        (layout, cache)
    }

    #[test]
    fn put_get_round_trip_and_zero_means_absent() {
        let tmp = TempDir::new().unwrap();
        let (_, cache) = cache(&tmp, 16);
        cache.create_ledger(1, KEY).unwrap();
        assert_eq!(cache.get_entry_offset(1, 0).unwrap(), 0);
        cache.put_entry_offset(1, 0, 0x0000_0001_0000_000C).unwrap();
        assert_eq!(cache.get_entry_offset(1, 0).unwrap(), 0x0000_0001_0000_000C);
        assert_eq!(cache.get_entry_offset(1, 1).unwrap(), 0);
        // Unknown ledger reads as absent, writes are rejected.
        assert_eq!(cache.get_entry_offset(99, 0).unwrap(), 0);
        assert!(matches!(
            cache.put_entry_offset(99, 0, 1),
            Err(IndexError::NoSuchLedger { .. })
        ));
    }

    #[test]
    fn last_entry_tracks_maximum() {
        let tmp = TempDir::new().unwrap();
        let (_, cache) = cache(&tmp, 16);
        cache.create_ledger(2, KEY).unwrap();
        cache.put_entry_offset(2, 5, 100).unwrap();
        cache.put_entry_offset(2, 3, 101).unwrap();
        assert_eq!(cache.get_last_entry(2).unwrap(), 5);
    }

    #[test]
    fn pages_survive_eviction_through_backing_file() {
        let tmp = TempDir::new().unwrap();
        // 256-byte pages hold 32 slots; a 4-page bound forces eviction.
        let (_, cache) = cache(&tmp, 4);
        cache.create_ledger(3, KEY).unwrap();
        for entry in 0..32u64 * 8 {
            cache.put_entry_offset(3, entry, entry + 1000).unwrap();
        }
        for entry in 0..32u64 * 8 {
            assert_eq!(cache.get_entry_offset(3, entry).unwrap(), entry + 1000);
        }
    }

    #[test]
    fn flush_all_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let (layout, cache) = cache(&tmp, 16);
        cache.create_ledger(4, KEY).unwrap();
        cache.put_entry_offset(4, 0, 42).unwrap();
        cache.put_entry_offset(4, 100, 43).unwrap();
        cache.flush_all().unwrap();
        drop(cache);

        let cache = LedgerIndexCache::new(layout, 256, 16, 4);
        assert_eq!(cache.get_entry_offset(4, 0).unwrap(), 42);
        assert_eq!(cache.get_entry_offset(4, 100).unwrap(), 43);
        assert_eq!(cache.get_last_entry(4).unwrap(), 100);
        let meta = cache.ledger_meta(4).unwrap().unwrap();
        assert_eq!(meta.master_key, KEY);
        assert!(!meta.fenced);
    }

    #[test]
    fn fencing_is_durable() {
        let tmp = TempDir::new().unwrap();
        let (layout, cache) = cache(&tmp, 16);
        cache.create_ledger(5, KEY).unwrap();
        assert!(!cache.is_fenced(5).unwrap());
        cache.set_fenced(5).unwrap();
        assert!(cache.is_fenced(5).unwrap());
        drop(cache);
        let cache = LedgerIndexCache::new(layout, 256, 16, 4);
        assert!(cache.is_fenced(5).unwrap());
    }

    #[test]
    fn delete_removes_file_and_pages() {
        let tmp = TempDir::new().unwrap();
        let (layout, cache) = cache(&tmp, 16);
        cache.create_ledger(6, KEY).unwrap();
        cache.put_entry_offset(6, 0, 7).unwrap();
        cache.flush_all().unwrap();
        assert!(layout.index_path(6).is_file());
        cache.delete_ledger(6).unwrap();
        assert!(!layout.index_path(6).is_file());
        assert_eq!(cache.get_entry_offset(6, 0).unwrap(), 0);
    }

    #[test]
    fn open_file_cap_recycles_handles() {
        let tmp = TempDir::new().unwrap();
        let (_, cache) = cache(&tmp, 64);
        // More ledgers than the 4-handle cap; everything stays readable.
        for ledger in 0..10u64 {
            cache.create_ledger(ledger, KEY).unwrap();
            cache.put_entry_offset(ledger, 0, ledger + 1).unwrap();
        }
        for ledger in 0..10u64 {
            assert_eq!(cache.get_entry_offset(ledger, 0).unwrap(), ledger + 1);
        }
    }

    #[test]
    fn flush_racing_writer_never_loses_offsets() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;

        let tmp = TempDir::new().unwrap();
        // A tight page bound keeps eviction active while a writer and a
        // flusher hammer the same table.
        let (layout, cache) = cache(&tmp, 8);
        let cache = Arc::new(cache);
        cache.create_ledger(7, KEY).unwrap();

        let writer = {
            let cache = cache.clone();
            thread::spawn(move || {
                for entry in 0..2000u64 {
                    cache.put_entry_offset(7, entry, entry + 1).unwrap();
                }
            })
        };
        let done = Arc::new(AtomicBool::new(false));
        let flusher = {
            let cache = cache.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    cache.flush_all().unwrap();
                }
            })
        };
        writer.join().unwrap();
        done.store(true, Ordering::Release);
        flusher.join().unwrap();
        cache.flush_all().unwrap();

        // A fresh cache sees only the backing files; nothing may be missing.
        let fresh = LedgerIndexCache::new(layout, 256, 8, 4);
        for entry in 0..2000u64 {
            assert_eq!(fresh.get_entry_offset(7, entry).unwrap(), entry + 1);
        }
    }

    #[test]
    fn ledgers_on_disk_lists_created_indexes() {
        let tmp = TempDir::new().unwrap();
        let (_, cache) = cache(&tmp, 16);
        for ledger in [11u64, 12, 13] {
            cache.create_ledger(ledger, KEY).unwrap();
        }
        assert_eq!(cache.ledgers_on_disk().unwrap(), vec![11, 12, 13]);
    }
}
