use crate::index::{IndexError, LedgerIndexCache, MASTER_KEY_BYTES};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Per-ledger state interned while any request references the ledger.
#[derive(Debug)]
struct Descriptor {
    ledger_id: u64,
    master_key: [u8; MASTER_KEY_BYTES],
    fenced: AtomicBool,
    refcount: AtomicU32,
}

/// Scoped acquisition of a ledger descriptor; dropping the handle decrements
/// the refcount on every exit path.
#[derive(Debug)]
pub struct LedgerHandle {
    descriptor: Arc<Descriptor>,
}

impl LedgerHandle {
    pub fn ledger_id(&self) -> u64 {
        self.descriptor.ledger_id
    }

    pub fn is_fenced(&self) -> bool {
        self.descriptor.fenced.load(Ordering::Acquire)
    }
}

impl Drop for LedgerHandle {
    fn drop(&mut self) {
        self.descriptor.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Concurrent interned map `ledgerId -> descriptor`, backed by the index
/// file headers. Enforces the master-key binding and the fenced flag.
pub struct LedgerDescriptorTable {
    index: Arc<LedgerIndexCache>,
    descriptors: Mutex<HashMap<u64, Arc<Descriptor>>>,
}

impl LedgerDescriptorTable {
    pub fn new(index: Arc<LedgerIndexCache>) -> Self {
        Self {
            index,
            descriptors: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires the ledger for a write. The first write binds `master_key`
    /// durably; every later write must present the same bytes. A fenced
    /// ledger rejects writes unless `recovery` is set.
    pub fn acquire_for_write(
        &self,
        ledger_id: u64,
        master_key: [u8; MASTER_KEY_BYTES],
        recovery: bool,
    ) -> Result<LedgerHandle, LedgerError> {
        let descriptor = self.intern(ledger_id, Some(master_key))?;
        if descriptor.master_key != master_key {
            return Err(LedgerError::Unauthorized { ledger_id });
        }
        if descriptor.fenced.load(Ordering::Acquire) && !recovery {
            return Err(LedgerError::LedgerFenced { ledger_id });
        }
        descriptor.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(LedgerHandle { descriptor })
    }

    /// Acquires the ledger for a read. Reads require no master key.
    pub fn acquire_for_read(&self, ledger_id: u64) -> Result<LedgerHandle, LedgerError> {
        let descriptor = self.intern(ledger_id, None)?;
        descriptor.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(LedgerHandle { descriptor })
    }

    /// Durably fences the ledger after verifying the master key; monotonic
    /// and idempotent.
    pub fn fence(
        &self,
        ledger_id: u64,
        master_key: [u8; MASTER_KEY_BYTES],
    ) -> Result<(), LedgerError> {
        let descriptor = self.intern(ledger_id, None)?;
        if descriptor.master_key != master_key {
            return Err(LedgerError::Unauthorized { ledger_id });
        }
        if !descriptor.fenced.swap(true, Ordering::AcqRel) {
            self.index.set_fenced(ledger_id)?;
        }
        Ok(())
    }

    /// True while any live handle references the ledger.
    pub fn in_use(&self, ledger_id: u64) -> bool {
        self.descriptors
            .lock()
            .get(&ledger_id)
            .map(|d| d.refcount.load(Ordering::Acquire) > 0)
            .unwrap_or(false)
    }

    /// Drops interned descriptors nobody references and returns how many
    /// were evicted. Their durable state lives in the index header, so
    /// eviction is only a memory concern.
    pub fn evict_idle(&self) -> usize {
        let mut descriptors = self.descriptors.lock();
        let before = descriptors.len();
        descriptors.retain(|_, d| d.refcount.load(Ordering::Acquire) > 0);
        before - descriptors.len()
    }

    /// Forgets a ledger outright (after GC removed its index file).
    pub fn forget(&self, ledger_id: u64) {
        self.descriptors.lock().remove(&ledger_id);
    }

    fn intern(
        &self,
        ledger_id: u64,
        create_key: Option<[u8; MASTER_KEY_BYTES]>,
    ) -> Result<Arc<Descriptor>, LedgerError> {
        let mut descriptors = self.descriptors.lock();
        if let Some(descriptor) = descriptors.get(&ledger_id) {
            return Ok(descriptor.clone());
        }
        let meta = self.index.ledger_meta(ledger_id)?;
        let descriptor = match (meta, create_key) {
            (Some(meta), _) => Arc::new(Descriptor {
                ledger_id,
                master_key: meta.master_key,
                fenced: AtomicBool::new(meta.fenced),
                refcount: AtomicU32::new(0),
            }),
            (None, Some(master_key)) => {
                // First touch by a writer: bind the key durably before any
                // journal record can reference this ledger.
                self.index.create_ledger(ledger_id, master_key)?;
                Arc::new(Descriptor {
                    ledger_id,
                    master_key,
                    fenced: AtomicBool::new(false),
                    refcount: AtomicU32::new(0),
                })
            }
            (None, None) => return Err(LedgerError::NoSuchLedger { ledger_id }),
        };
        descriptors.insert(ledger_id, descriptor.clone());
        Ok(descriptor)
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no such ledger {ledger_id}")]
    NoSuchLedger { ledger_id: u64 },
    #[error("master key mismatch for ledger {ledger_id}")]
    Unauthorized { ledger_id: u64 },
    #[error("ledger {ledger_id} is fenced")]
    LedgerFenced { ledger_id: u64 },
    #[error(transparent)]
    Index(#[from] IndexError),
}
