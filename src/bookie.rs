use crate::checkpoint::{CheckpointError, FlushOrchestrator, FlushThread, TxnWatermark};
use crate::config::{ConfigError, ServerConfig};
use crate::diskcheck::{DiskCheckError, DiskCheckThread, DiskChecker, ReadOnlyState};
use crate::dispatch::{Dispatcher, Pipeline};
use crate::entrylog::{EntryLog, EntryLogError};
use crate::gc::{GarbageCollector, GcError, GcSchedule, GcThread, LedgerManifest};
use crate::index::{IndexError, LedgerIndexCache};
use crate::journal::{Journal, JournalError};
use crate::layout::{BookieLayout, LayoutError};
use crate::ledger::LedgerDescriptorTable;
use crate::net::{self, NetError, ServerHandle, ServerOptions};
use log::{info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

const ADD_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The assembled storage node: journal, entry log, index, descriptor table,
/// dispatcher, background threads, and the TCP front end.
pub struct Bookie {
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<FlushOrchestrator>,
    read_only: Arc<ReadOnlyState>,
    flush_thread: FlushThread,
    gc_thread: GcThread,
    disk_thread: DiskCheckThread,
    server: Option<ServerHandle>,
}

impl Bookie {
    /// Brings the node up: recovers on-disk state, replays the journal from
    /// the checkpoint mark, then starts the background threads and listener.
    pub fn start(
        config: ServerConfig,
        manifest: Option<Arc<dyn LedgerManifest>>,
    ) -> Result<Self, BookieStartError> {
        config.validate()?;
        let layout = BookieLayout::new(
            config.journal_directory.clone(),
            config.ledger_directories.clone(),
        );
        layout.ensure()?;

        let index = Arc::new(LedgerIndexCache::new(
            layout.clone(),
            config.page_size,
            config.effective_page_limit(),
            config.open_file_limit,
        ));
        let entrylog = Arc::new(EntryLog::open(
            layout.clone(),
            config.entry_log_size_limit,
            config.open_file_limit,
        )?);
        let journal = Arc::new(Journal::open(
            layout.clone(),
            config.journal_max_size_bytes(),
            config.journal_max_backups,
            Duration::from_millis(config.flush_interval_ms),
        )?);
        let watermark = Arc::new(TxnWatermark::new());

        let mark = layout.mark_store().load()?;
        let replayed = replay_journal(&journal, &entrylog, &index, mark.last_txn_id)?;
        watermark.reset_applied(replayed);
        info!(
            "event=bookie_recovered mark_txn={} replayed_to={replayed}",
            mark.last_txn_id
        );

        let ledgers = Arc::new(LedgerDescriptorTable::new(index.clone()));
        let read_only = Arc::new(ReadOnlyState::new(config.force_read_only));

        let pipeline = Arc::new(Pipeline::new(
            journal.clone(),
            entrylog.clone(),
            index.clone(),
            ledgers.clone(),
            watermark.clone(),
            read_only.clone(),
            ADD_TIMEOUT,
        ));
        // One ordered worker per ledger directory, but never fewer than the
        // machine can actually run in parallel.
        let parallelism = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let workers = config.ledger_directories.len().max(parallelism);
        let dispatcher = Arc::new(Dispatcher::spawn(pipeline, workers)?);

        let orchestrator = Arc::new(FlushOrchestrator::new(
            entrylog.clone(),
            index.clone(),
            journal.clone(),
            watermark,
            layout.mark_store(),
        ));
        let flush_thread = FlushThread::spawn(
            orchestrator.clone(),
            Duration::from_millis(config.flush_interval_ms),
        )?;

        let collector = GarbageCollector::new(manifest, entrylog.clone(), index.clone(), ledgers);
        let gc_thread = GcThread::spawn(
            collector,
            GcSchedule {
                gc_wait: Duration::from_millis(config.gc_wait_time_ms),
                minor_interval_secs: config.minor_compaction_interval_secs,
                minor_threshold: config.minor_compaction_threshold,
                major_interval_secs: config.major_compaction_interval_secs,
                major_threshold: config.major_compaction_threshold,
            },
        )?;

        let checker = DiskChecker::new(
            layout,
            config.disk_usage_threshold,
            config.disk_usage_hysteresis,
            config.read_only_mode_enabled,
            read_only.clone(),
        );
        let disk_thread =
            DiskCheckThread::spawn(checker, Duration::from_millis(config.disk_check_interval_ms))?;

        let server = net::serve(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.bookie_port),
            dispatcher.clone(),
            ServerOptions {
                tcp_no_delay: config.server_tcp_no_delay,
                request_timeout: REQUEST_TIMEOUT,
            },
        )?;

        Ok(Self {
            dispatcher,
            orchestrator,
            read_only,
            flush_thread,
            gc_thread,
            disk_thread,
            server: Some(server),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.is_read_only()
    }

    /// Orderly shutdown: stop intake, drain in-flight requests, take a final
    /// checkpoint, then stop the background threads.
    pub fn shutdown(&mut self) {
        if let Some(mut server) = self.server.take() {
            if let Err(err) = server.try_shutdown(Duration::from_secs(10)) {
                warn!("event=server_shutdown_failed error={err}");
            }
        }
        self.dispatcher.shutdown();
        self.flush_thread.shutdown();
        self.gc_thread.shutdown();
        self.disk_thread.shutdown();
        if let Err(err) = self.orchestrator.checkpoint() {
            warn!("event=final_checkpoint_failed error={err}");
        }
        info!("event=bookie_stopped");
    }
}

impl Drop for Bookie {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Applies every journal record past the checkpoint mark. Records already in
/// the index are skipped, so replay after a mid-flush crash is idempotent;
/// records for ledgers with no index file belong to GC-deleted ledgers and
/// are dropped.
fn replay_journal(
    journal: &Journal,
    entrylog: &EntryLog,
    index: &LedgerIndexCache,
    from_txn: u64,
) -> Result<u64, BookieStartError> {
    let mut applied = 0u64;
    let mut skipped = 0u64;
    let replayed_to = journal.replay(from_txn, |record| {
        if index.ledger_meta(record.ledger_id).map_err(replay_io)?.is_none() {
            skipped += 1;
            return Ok(());
        }
        let existing = index
            .get_entry_offset(record.ledger_id, record.entry_id)
            .map_err(replay_io)?;
        if existing != 0 {
            skipped += 1;
            return Ok(());
        }
        let offset = entrylog
            .add_entry(record.ledger_id, &record.payload)
            .map_err(replay_io)?;
        index
            .put_entry_offset(record.ledger_id, record.entry_id, offset)
            .map_err(replay_io)?;
        applied += 1;
        Ok(())
    })?;
    if applied > 0 || skipped > 0 {
        info!("event=journal_replayed applied={applied} skipped={skipped}");
    }
    Ok(replayed_to)
}

fn replay_io(err: impl std::error::Error) -> JournalError {
    JournalError::Io(std::io::Error::other(err.to_string()))
}

#[derive(Debug, Error)]
pub enum BookieStartError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("entry log error: {0}")]
    EntryLog(#[from] EntryLogError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("gc error: {0}")]
    Gc(#[from] GcError),
    #[error("disk check error: {0}")]
    DiskCheck(#[from] DiskCheckError),
    #[error("network error: {0}")]
    Net(#[from] NetError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entrylog::make_payload;
    use crate::errors::ReturnCode;
    use crate::gc::StaticManifest;
    use crate::net::BookieClient;
    use crate::wire::{Request, ENTRY_ID_LAST};
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> ServerConfig {
        ServerConfig {
            bookie_port: 0,
            journal_directory: tmp.path().join("journal"),
            ledger_directories: vec![tmp.path().join("l0"), tmp.path().join("l1")],
            flush_interval_ms: 10,
            gc_wait_time_ms: 50,
            disk_check_interval_ms: 50,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn serves_adds_and_reads_over_tcp() {
        let tmp = TempDir::new().unwrap();
        let manifest = Arc::new(StaticManifest::new());
        manifest.insert(1);
        let mut bookie = Bookie::start(config(&tmp), Some(manifest)).unwrap();
        let addr = bookie.local_addr().unwrap();
        let mut client = BookieClient::connect(addr).unwrap();

        let response = client
            .request(&Request::Add {
                master_key: [5u8; 20],
                flags: 0,
                payload: make_payload(1, 0, b"over the wire"),
            })
            .unwrap();
        assert_eq!(response.rc, ReturnCode::Ok);

        let response = client
            .request(&Request::Read {
                ledger_id: 1,
                entry_id: ENTRY_ID_LAST,
                flags: 0,
            })
            .unwrap();
        assert_eq!(response.rc, ReturnCode::Ok);
        assert_eq!(response.entry_id, 0);
        assert_eq!(response.payload.unwrap(), make_payload(1, 0, b"over the wire"));

        bookie.shutdown();
    }

    #[test]
    fn restart_preserves_entries() {
        let tmp = TempDir::new().unwrap();
        let manifest = Arc::new(StaticManifest::new());
        manifest.insert(3);
        {
            let mut bookie = Bookie::start(config(&tmp), Some(manifest.clone())).unwrap();
            let addr = bookie.local_addr().unwrap();
            let mut client = BookieClient::connect(addr).unwrap();
            for entry in 0..3u64 {
                let response = client
                    .request(&Request::Add {
                        master_key: [1u8; 20],
                        flags: 0,
                        payload: make_payload(3, entry, b"persisted"),
                    })
                    .unwrap();
                assert_eq!(response.rc, ReturnCode::Ok);
            }
            bookie.shutdown();
        }

        let mut bookie = Bookie::start(config(&tmp), Some(manifest)).unwrap();
        let addr = bookie.local_addr().unwrap();
        let mut client = BookieClient::connect(addr).unwrap();
        let response = client
            .request(&Request::Read {
                ledger_id: 3,
                entry_id: 2,
                flags: 0,
            })
            .unwrap();
        assert_eq!(response.rc, ReturnCode::Ok);
        assert_eq!(response.payload.unwrap(), make_payload(3, 2, b"persisted"));
        bookie.shutdown();
    }
}
