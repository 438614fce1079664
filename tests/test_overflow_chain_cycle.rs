//! Damaged overflow chains must surface as corruption instead of looping or
//! returning garbage.

use paged_btree::{Paged, PagedOptions, Value};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use tempfile::TempDir;

const PAGE_SIZE: u64 = 256;
const FILE_HEADER_SIZE: u64 = 128;
const NEXT_PAGE_OFFSET: u64 = 17;
const DATA_LEN_OFFSET: u64 = 9;

fn options() -> PagedOptions {
    PagedOptions {
        page_size: PAGE_SIZE as u32,
        page_count: 2,
        file_header_size: FILE_HEADER_SIZE as u16,
        page_header_size: 32,
        max_key_size: 32,
        ..PagedOptions::default()
    }
}

fn page_offset(page_num: u64) -> u64 {
    FILE_HEADER_SIZE + page_num * PAGE_SIZE
}

/// Writes a three-page value and returns (primary, first overflow, second overflow).
fn write_chain(dir: &TempDir) -> (u64, u64, u64) {
    let paged = Paged::new(dir.path().join("chain.pg"), options()).unwrap();
    paged.create().unwrap();

    let page = paged.get_free_page().unwrap();
    paged.write_value(&page, &Value::from(vec![42u8; 600])).unwrap();

    let first = page.next_page().unwrap();
    let second = paged.get_page(first).unwrap().next_page().unwrap();
    let primary = page.page_num();
    drop(page);

    paged.close().unwrap();
    (primary, first, second)
}

fn patch(dir: &TempDir, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(dir.path().join("chain.pg")).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

fn reopen(dir: &TempDir) -> Paged {
    let paged = Paged::new(dir.path().join("chain.pg"), PagedOptions::default()).unwrap();
    assert!(paged.open().unwrap());
    paged
}

#[test]
fn test_intact_chain_reads_back() {
    let dir = TempDir::new().unwrap();
    let (primary, _, _) = write_chain(&dir);

    let paged = reopen(&dir);
    let page = paged.get_page(primary).unwrap();
    assert_eq!(paged.read_value(&page).unwrap().to_vec(), vec![42u8; 600]);
}

#[test]
fn test_cycle_in_chain_is_detected() {
    let dir = TempDir::new().unwrap();
    let (primary, first, second) = write_chain(&dir);

    // second -> first closes a loop: primary -> first -> second -> first ...
    patch(&dir, page_offset(second) + NEXT_PAGE_OFFSET, &(first as i64).to_be_bytes());

    let paged = reopen(&dir);
    let page = paged.get_page(primary).unwrap();
    let err = paged.read_value(&page).unwrap_err();
    println!("read error: {}", err);
    assert!(err.is_corruption());

    let err = paged.unlink_pages(&page).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_truncated_chain_is_detected() {
    let dir = TempDir::new().unwrap();
    let (primary, first, _) = write_chain(&dir);

    patch(&dir, page_offset(first) + NEXT_PAGE_OFFSET, &(-1i64).to_be_bytes());

    let paged = reopen(&dir);
    let page = paged.get_page(primary).unwrap();
    assert!(paged.read_value(&page).unwrap_err().is_corruption());
}

#[test]
fn test_impossible_data_length_is_detected() {
    let dir = TempDir::new().unwrap();
    let (primary, _, _) = write_chain(&dir);

    patch(&dir, page_offset(primary) + DATA_LEN_OFFSET, &10_000i32.to_be_bytes());

    let paged = reopen(&dir);
    assert!(paged.get_page(primary).unwrap_err().is_corruption());
}
