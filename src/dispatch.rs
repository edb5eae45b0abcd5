use crate::checkpoint::TxnWatermark;
use crate::diskcheck::ReadOnlyState;
use crate::entrylog::{EntryLog, EntryLogError, ENTRY_PREFIX_BYTES};
use crate::errors::{BookieError, ReturnCode};
use crate::index::{IndexError, LedgerIndexCache};
use crate::journal::{Journal, JournalError};
use crate::ledger::{LedgerDescriptorTable, LedgerError};
use crate::wire::{Request, Response, ENTRY_ID_LAST, FLAG_HIGH_PRIORITY, FLAG_RECOVERY_WRITE};
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// Executes one request against the storage stack. Stateless across
/// requests; all ordering comes from the dispatcher routing.
pub struct Pipeline {
    journal: Arc<Journal>,
    entrylog: Arc<EntryLog>,
    index: Arc<LedgerIndexCache>,
    ledgers: Arc<LedgerDescriptorTable>,
    watermark: Arc<TxnWatermark>,
    read_only: Arc<ReadOnlyState>,
    add_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        journal: Arc<Journal>,
        entrylog: Arc<EntryLog>,
        index: Arc<LedgerIndexCache>,
        ledgers: Arc<LedgerDescriptorTable>,
        watermark: Arc<TxnWatermark>,
        read_only: Arc<ReadOnlyState>,
        add_timeout: Duration,
    ) -> Self {
        Self {
            journal,
            entrylog,
            index,
            ledgers,
            watermark,
            read_only,
            add_timeout,
        }
    }

    pub fn execute(&self, request: Request) -> Response {
        match request {
            Request::Add {
                master_key,
                flags,
                payload,
            } => self.add(master_key, flags, payload),
            Request::Read {
                ledger_id,
                entry_id,
                ..
            } => self.read(ledger_id, entry_id),
            Request::ReadFence {
                ledger_id,
                entry_id,
                master_key,
            } => self.read_fence(ledger_id, entry_id, master_key),
        }
    }

    /// Add pipeline: descriptor checks, journal append and group-fsync wait,
    /// entry log append, index update. The client is acknowledged only after
    /// the journal fsync covering the record has returned.
    fn add(&self, master_key: [u8; 20], flags: u32, payload: Vec<u8>) -> Response {
        if payload.len() < ENTRY_PREFIX_BYTES {
            return Response::error(ReturnCode::IoError, 0, 0);
        }
        let ledger_id = u64::from_be_bytes(payload[0..8].try_into().expect("sized"));
        let entry_id = u64::from_be_bytes(payload[8..16].try_into().expect("sized"));
        if entry_id == ENTRY_ID_LAST {
            // Reserved as the "last entry" read sentinel; never storable.
            return Response::error(ReturnCode::IoError, ledger_id, entry_id);
        }
        let recovery = flags & FLAG_RECOVERY_WRITE != 0;
        if self.read_only.is_read_only() {
            return Response::error(ReturnCode::ReadOnly, ledger_id, entry_id);
        }
        let _handle = match self.ledgers.acquire_for_write(ledger_id, master_key, recovery) {
            Ok(handle) => handle,
            Err(err) => return Response::error(ledger_rc(&err), ledger_id, entry_id),
        };
        // The watermark registration runs under the journal batch lock, so
        // the checkpoint horizon can never pass a txn that is already queued
        // for fsync but not yet applied.
        let ticket = match self.journal.append_with(ledger_id, entry_id, &payload, |txn| {
            self.watermark.begin(txn)
        }) {
            Ok(ticket) => ticket,
            Err(err) => return Response::error(journal_rc(&err), ledger_id, entry_id),
        };
        if flags & FLAG_HIGH_PRIORITY != 0 {
            self.journal.request_flush();
        }
        let txn_id = ticket.txn_id();
        if let Err(err) = ticket.wait(self.add_timeout) {
            // The record may still reach disk later; replay repairs the gap.
            self.watermark.complete(txn_id);
            if matches!(err, JournalError::BatchFailed { .. }) {
                // The journal device is failing writes; stop accepting adds.
                self.read_only.mark_journal_failed();
                warn!("event=journal_write_failed action=enter_read_only");
            }
            return Response::error(journal_rc(&err), ledger_id, entry_id);
        }
        let result = self
            .entrylog
            .add_entry(ledger_id, &payload)
            .map_err(|err| {
                warn!("event=add_apply_failed ledger_id={ledger_id} entry_id={entry_id} error={err}");
                ReturnCode::IoError
            })
            .and_then(|offset| {
                self.index
                    .put_entry_offset(ledger_id, entry_id, offset)
                    .map_err(|err| index_rc(&err))
            });
        self.watermark.complete(txn_id);
        match result {
            Ok(()) => Response {
                rc: ReturnCode::Ok,
                ledger_id,
                entry_id,
                payload: None,
            },
            Err(rc) => Response::error(rc, ledger_id, entry_id),
        }
    }

    /// Read pipeline. `ENTRY_ID_LAST` resolves to the last entry this bookie
    /// has indexed before the lookup.
    fn read(&self, ledger_id: u64, entry_id: u64) -> Response {
        let _handle = match self.ledgers.acquire_for_read(ledger_id) {
            Ok(handle) => handle,
            Err(err) => return Response::error(ledger_rc(&err), ledger_id, entry_id),
        };
        let resolved = if entry_id == ENTRY_ID_LAST {
            match self.index.get_last_entry(ledger_id) {
                Ok(last) => last,
                Err(err) => return Response::error(index_rc(&err), ledger_id, entry_id),
            }
        } else {
            entry_id
        };
        let offset = match self.index.get_entry_offset(ledger_id, resolved) {
            Ok(offset) => offset,
            Err(err) => return Response::error(index_rc(&err), ledger_id, resolved),
        };
        if offset == 0 {
            return Response::error(ReturnCode::NoEntry, ledger_id, resolved);
        }
        match self.entrylog.read_entry(ledger_id, resolved, offset) {
            Ok(payload) => Response {
                rc: ReturnCode::Ok,
                ledger_id,
                entry_id: resolved,
                payload: Some(payload),
            },
            Err(err) => Response::error(entrylog_rc(&err), ledger_id, resolved),
        }
    }

    /// Fences durably before serving the read, so the returned entry bounds
    /// what any non-recovery writer can ever have acknowledged here.
    fn read_fence(&self, ledger_id: u64, entry_id: u64, master_key: [u8; 20]) -> Response {
        if let Err(err) = self.ledgers.fence(ledger_id, master_key) {
            return Response::error(ledger_rc(&err), ledger_id, entry_id);
        }
        self.read(ledger_id, entry_id)
    }
}

fn ledger_rc(err: &LedgerError) -> ReturnCode {
    match err {
        LedgerError::NoSuchLedger { ledger_id } => BookieError::NoLedger {
            ledger_id: *ledger_id,
        },
        LedgerError::Unauthorized { ledger_id } => BookieError::Unauthorized {
            ledger_id: *ledger_id,
        },
        LedgerError::LedgerFenced { ledger_id } => BookieError::LedgerFenced {
            ledger_id: *ledger_id,
        },
        LedgerError::Index(err) => return index_rc(err),
    }
    .return_code()
}

fn index_rc(err: &IndexError) -> ReturnCode {
    match err {
        IndexError::NoSuchLedger { ledger_id } => BookieError::NoLedger {
            ledger_id: *ledger_id,
        },
        other => BookieError::Io(std::io::Error::other(other.to_string())),
    }
    .return_code()
}

fn journal_rc(err: &JournalError) -> ReturnCode {
    match err {
        JournalError::FsyncTimeout { .. } => BookieError::Timeout,
        JournalError::Shutdown => BookieError::Shutdown,
        other => BookieError::Journal(std::io::Error::other(other.to_string())),
    }
    .return_code()
}

fn entrylog_rc(err: &EntryLogError) -> ReturnCode {
    match err {
        // A frame that fails its self-check is surfaced as an I/O failure,
        // never as data.
        EntryLogError::Corrupt {
            ledger_id,
            entry_id,
            ..
        } => BookieError::Corruption {
            ledger_id: *ledger_id,
            entry_id: *entry_id,
        },
        other => BookieError::Io(std::io::Error::other(other.to_string())),
    }
    .return_code()
}

struct Job {
    request: Request,
    respond: Box<dyn FnOnce(Response) + Send>,
}

/// Routes each request to one of N workers by `ledgerId % N`, so requests
/// for one ledger execute in arrival order while distinct ledgers proceed in
/// parallel.
pub struct Dispatcher {
    senders: std::sync::Mutex<Vec<mpsc::Sender<Job>>>,
    handles: std::sync::Mutex<Vec<thread::JoinHandle<()>>>,
    workers: usize,
    shutdown: AtomicBool,
}

impl Dispatcher {
    pub fn spawn(pipeline: Arc<Pipeline>, workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (sender, receiver) = mpsc::channel::<Job>();
            let worker_pipeline = pipeline.clone();
            let handle = thread::Builder::new()
                .name(format!("dispatch-{worker_id}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        let response = worker_pipeline.execute(job.request);
                        (job.respond)(response);
                    }
                })?;
            senders.push(sender);
            handles.push(handle);
        }
        Ok(Self {
            senders: std::sync::Mutex::new(senders),
            handles: std::sync::Mutex::new(handles),
            workers,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Enqueues one request. `respond` is invoked exactly once, on the worker
    /// thread, with the outcome.
    pub fn submit(&self, request: Request, respond: Box<dyn FnOnce(Response) + Send>) {
        let ledger_id = request.ledger_id();
        let entry_id = request.entry_id();
        if self.shutdown.load(Ordering::Acquire) {
            respond(Response::error(ReturnCode::Shutdown, ledger_id, entry_id));
            return;
        }
        let slot = (ledger_id % self.workers as u64) as usize;
        let job = Job { request, respond };
        let senders = self.senders.lock().expect("dispatch senders poisoned");
        match senders.get(slot) {
            Some(sender) => {
                if let Err(mpsc::SendError(job)) = sender.send(job) {
                    (job.respond)(Response::error(ReturnCode::Shutdown, ledger_id, entry_id));
                }
            }
            None => (job.respond)(Response::error(ReturnCode::Shutdown, ledger_id, entry_id)),
        }
    }

    /// Stops accepting requests, drains every queued job, and joins the
    /// workers.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.senders
            .lock()
            .expect("dispatch senders poisoned")
            .clear();
        let mut handles = self.handles.lock().expect("dispatch handles poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        Dispatcher::shutdown(self);
    }
}
