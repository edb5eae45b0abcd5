use bookied::entrylog::make_payload;
use bookied::errors::ReturnCode;
use bookied::gc::StaticManifest;
use bookied::journal::Journal;
use bookied::layout::BookieLayout;
use bookied::net::BookieClient;
use bookied::wire::{Request, ENTRY_ID_LAST, FLAG_RECOVERY_WRITE};
use bookied::{Bookie, LedgerIndexCache, ServerConfig};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const KEY: [u8; 20] = [0x42; 20];
const OTHER_KEY: [u8; 20] = [0x43; 20];

fn config(tmp: &TempDir) -> ServerConfig {
    ServerConfig {
        bookie_port: 0,
        journal_directory: tmp.path().join("journal"),
        ledger_directories: vec![tmp.path().join("l0"), tmp.path().join("l1")],
        flush_interval_ms: 10,
        gc_wait_time_ms: 100,
        disk_check_interval_ms: 100,
        ..ServerConfig::default()
    }
}

fn manifest_with(ledgers: &[u64]) -> Arc<StaticManifest> {
    let manifest = Arc::new(StaticManifest::new());
    for &ledger in ledgers {
        manifest.insert(ledger);
    }
    manifest
}

fn start(tmp: &TempDir, ledgers: &[u64]) -> (Bookie, BookieClient) {
    let bookie = Bookie::start(config(tmp), Some(manifest_with(ledgers))).unwrap();
    let client = BookieClient::connect(bookie.local_addr().unwrap()).unwrap();
    (bookie, client)
}

fn add(client: &mut BookieClient, key: [u8; 20], ledger: u64, entry: u64, body: &[u8], flags: u32) -> ReturnCode {
    client
        .request(&Request::Add {
            master_key: key,
            flags,
            payload: make_payload(ledger, entry, body),
        })
        .unwrap()
        .rc
}

fn read(client: &mut BookieClient, ledger: u64, entry: u64) -> (ReturnCode, u64, Option<Vec<u8>>) {
    let response = client
        .request(&Request::Read {
            ledger_id: ledger,
            entry_id: entry,
            flags: 0,
        })
        .unwrap();
    (response.rc, response.entry_id, response.payload)
}

#[test]
fn entries_survive_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let (mut bookie, mut client) = start(&tmp, &[1]);
        for entry in 0..20u64 {
            assert_eq!(add(&mut client, KEY, 1, entry, b"durable", 0), ReturnCode::Ok);
        }
        bookie.shutdown();
    }

    let (mut bookie, mut client) = start(&tmp, &[1]);
    for entry in [0u64, 7, 19] {
        let (rc, _, payload) = read(&mut client, 1, entry);
        assert_eq!(rc, ReturnCode::Ok);
        assert_eq!(payload.unwrap(), make_payload(1, entry, b"durable"));
    }
    let (rc, last, _) = read(&mut client, 1, ENTRY_ID_LAST);
    assert_eq!(rc, ReturnCode::Ok);
    assert_eq!(last, 19);
    bookie.shutdown();
}

#[test]
fn fencing_over_the_wire() {
    let tmp = TempDir::new().unwrap();
    let (mut bookie, mut client) = start(&tmp, &[9]);
    for entry in 0..5u64 {
        assert_eq!(add(&mut client, KEY, 9, entry, b"pre-fence", 0), ReturnCode::Ok);
    }

    // Fence with the wrong key first: refused, ledger stays writable.
    let refused = client
        .request(&Request::ReadFence {
            ledger_id: 9,
            entry_id: ENTRY_ID_LAST,
            master_key: OTHER_KEY,
        })
        .unwrap();
    assert_eq!(refused.rc, ReturnCode::Unauthorized);
    assert_eq!(add(&mut client, KEY, 9, 5, b"still open", 0), ReturnCode::Ok);

    let fenced = client
        .request(&Request::ReadFence {
            ledger_id: 9,
            entry_id: ENTRY_ID_LAST,
            master_key: KEY,
        })
        .unwrap();
    assert_eq!(fenced.rc, ReturnCode::Ok);
    assert_eq!(fenced.entry_id, 5);
    assert_eq!(fenced.payload.unwrap(), make_payload(9, 5, b"still open"));

    // Ordinary writers are locked out; the recovery path is not.
    assert_eq!(add(&mut client, KEY, 9, 6, b"late", 0), ReturnCode::LedgerFenced);
    assert_eq!(
        add(&mut client, KEY, 9, 6, b"recovered", FLAG_RECOVERY_WRITE),
        ReturnCode::Ok
    );
    bookie.shutdown();
}

#[test]
fn fenced_state_survives_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let (mut bookie, mut client) = start(&tmp, &[4]);
        assert_eq!(add(&mut client, KEY, 4, 0, b"x", 0), ReturnCode::Ok);
        let fenced = client
            .request(&Request::ReadFence {
                ledger_id: 4,
                entry_id: 0,
                master_key: KEY,
            })
            .unwrap();
        assert_eq!(fenced.rc, ReturnCode::Ok);
        bookie.shutdown();
    }
    let (mut bookie, mut client) = start(&tmp, &[4]);
    assert_eq!(add(&mut client, KEY, 4, 1, b"y", 0), ReturnCode::LedgerFenced);
    bookie.shutdown();
}

#[test]
fn master_key_is_bound_on_first_write() {
    let tmp = TempDir::new().unwrap();
    let (mut bookie, mut client) = start(&tmp, &[2]);
    assert_eq!(add(&mut client, KEY, 2, 0, b"mine", 0), ReturnCode::Ok);
    assert_eq!(add(&mut client, OTHER_KEY, 2, 1, b"theirs", 0), ReturnCode::Unauthorized);
    // Reads carry no key at all.
    let (rc, _, _) = read(&mut client, 2, 0);
    assert_eq!(rc, ReturnCode::Ok);
    bookie.shutdown();
}

#[test]
fn missing_ledger_and_entry_codes() {
    let tmp = TempDir::new().unwrap();
    let (mut bookie, mut client) = start(&tmp, &[99]);
    assert_eq!(read(&mut client, 99, 0).0, ReturnCode::NoLedger);
    assert_eq!(add(&mut client, KEY, 99, 0, b"x", 0), ReturnCode::Ok);
    assert_eq!(read(&mut client, 99, 5).0, ReturnCode::NoEntry);
    bookie.shutdown();
}

#[test]
fn journal_replay_recovers_unflushed_entries() {
    let tmp = TempDir::new().unwrap();
    let layout = BookieLayout::new(tmp.path().join("journal"), vec![tmp.path().join("l0")]);
    layout.ensure().unwrap();

    // Simulate a crash after journal fsync but before any flush: the entry
    // exists only in the journal and the ledger's index header.
    {
        let index = LedgerIndexCache::new(layout.clone(), 8192, 64, 16);
        index.create_ledger(6, KEY).unwrap();
        let journal =
            Journal::open(layout, 64 * 1024 * 1024, 5, Duration::from_millis(5)).unwrap();
        let ticket = journal
            .append(6, 0, &make_payload(6, 0, b"journal only"))
            .unwrap();
        ticket.wait(Duration::from_secs(5)).unwrap();
    }

    let mut config = config(&tmp);
    config.ledger_directories = vec![tmp.path().join("l0")];
    let mut bookie = Bookie::start(config, Some(manifest_with(&[6]))).unwrap();
    let mut client = BookieClient::connect(bookie.local_addr().unwrap()).unwrap();
    let (rc, _, payload) = read(&mut client, 6, 0);
    assert_eq!(rc, ReturnCode::Ok);
    assert_eq!(payload.unwrap(), make_payload(6, 0, b"journal only"));
    bookie.shutdown();
}

#[test]
fn corrupt_entry_frame_is_never_served() {
    let tmp = TempDir::new().unwrap();
    {
        let (mut bookie, mut client) = start(&tmp, &[8]);
        assert_eq!(add(&mut client, KEY, 8, 0, b"pristine", 0), ReturnCode::Ok);
        bookie.shutdown();
    }

    // Flip a byte of the frame's self-identifying prefix on disk.
    let mut corrupted = false;
    for dir in [tmp.path().join("l0/current"), tmp.path().join("l1/current")] {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().map(|e| e == "log").unwrap_or(false) {
                let mut bytes = fs::read(&path).unwrap();
                // 12-byte file header, 4-byte frame length, then the prefix.
                if bytes.len() > 20 {
                    bytes[20] ^= 0xFF;
                    fs::write(&path, bytes).unwrap();
                    corrupted = true;
                }
            }
        }
    }
    assert!(corrupted);

    let (mut bookie, mut client) = start(&tmp, &[8]);
    assert_eq!(read(&mut client, 8, 0).0, ReturnCode::IoError);
    bookie.shutdown();
}

#[test]
fn read_only_config_rejects_adds() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp);
    config.force_read_only = true;
    let mut bookie = Bookie::start(config, Some(manifest_with(&[1]))).unwrap();
    let mut client = BookieClient::connect(bookie.local_addr().unwrap()).unwrap();
    assert_eq!(add(&mut client, KEY, 1, 0, b"x", 0), ReturnCode::ReadOnly);
    // A couple of disk-checker passes (interval 100ms here) must not clear
    // the operator's read-only mode, however empty the disks are.
    std::thread::sleep(Duration::from_millis(300));
    assert!(bookie.is_read_only());
    assert_eq!(add(&mut client, KEY, 1, 1, b"y", 0), ReturnCode::ReadOnly);
    bookie.shutdown();
}

#[test]
fn gc_removes_ledgers_dropped_from_manifest() {
    let tmp = TempDir::new().unwrap();
    let manifest = Arc::new(StaticManifest::new());
    manifest.insert(1);
    manifest.insert(2);
    let mut bookie = Bookie::start(config(&tmp), Some(manifest.clone())).unwrap();
    let mut client = BookieClient::connect(bookie.local_addr().unwrap()).unwrap();
    assert_eq!(add(&mut client, KEY, 1, 0, b"keep", 0), ReturnCode::Ok);
    assert_eq!(add(&mut client, KEY, 2, 0, b"drop", 0), ReturnCode::Ok);

    manifest.remove(2);
    // gc_wait_time_ms is 100 in the test config.
    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(read(&mut client, 2, 0).0, ReturnCode::NoLedger);
    let (rc, _, payload) = read(&mut client, 1, 0);
    assert_eq!(rc, ReturnCode::Ok);
    assert_eq!(payload.unwrap(), make_payload(1, 0, b"keep"));
    bookie.shutdown();
}
