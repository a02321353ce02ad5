//! Truncated-tail behavior: replay stops cleanly, earlier records survive.

use crate::wal::{Wal, WalRecord, segment_file_name};
use std::fs::{self, OpenOptions};
use tempfile::TempDir;

fn setup(path: &std::path::Path) -> u64 {
    let wal = Wal::open(path).unwrap();
    wal.append(&WalRecord::Put {
        key: b"keep".to_vec(),
        value: b"me".to_vec(),
    })
    .unwrap();
    wal.append(&WalRecord::Put {
        key: b"torn".to_vec(),
        value: b"record".to_vec(),
    })
    .unwrap();
    fs::metadata(path).unwrap().len()
}

fn truncate_to(path: &std::path::Path, len: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(len).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn tail_cut_mid_value_stops_cleanly() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(segment_file_name(1));
    let full = setup(&path);

    truncate_to(&path, full - 3);

    let records: Vec<_> = Wal::replay(&path)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0],
        WalRecord::Put {
            key: b"keep".to_vec(),
            value: b"me".to_vec()
        }
    );
}

#[test]
fn tail_cut_mid_header_stops_cleanly() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(segment_file_name(1));
    let full = setup(&path);

    // Second record frame is 13 + 4 + 6 = 23 bytes; leave 5 bytes of header.
    truncate_to(&path, full - 18);

    let records: Vec<_> = Wal::replay(&path)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[test]
fn tail_cut_exactly_between_records_keeps_all_before() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join(segment_file_name(1));
    let full = setup(&path);

    // Remove the entire second record (23 bytes) — a clean boundary.
    truncate_to(&path, full - 23);

    let records: Vec<_> = Wal::replay(&path)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
}
