use paged_btree::{Error, Paged, PagedOptions, PageStatus, Value};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn options() -> PagedOptions {
    PagedOptions {
        page_size: 512,
        page_count: 8,
        file_header_size: 128,
        page_header_size: 32,
        max_key_size: 64,
        ..PagedOptions::default()
    }
}

fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    i64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

#[test]
fn test_header_is_big_endian_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("layout.pg");
    let paged = Paged::new(&path, options()).unwrap();
    paged.create().unwrap();
    paged.set_root_page(3);
    paged.close().unwrap();

    let bytes = fs::read(&path).unwrap();
    assert_eq!(i16::from_be_bytes([bytes[0], bytes[1]]), 128);
    assert_eq!(i32::from_be_bytes(bytes[2..6].try_into().unwrap()), 512);
    assert_eq!(read_i64(&bytes, 6), 8); // pageCount
    assert_eq!(read_i64(&bytes, 14), 8); // totalCount
    assert_eq!(read_i64(&bytes, 22), -1); // firstFreePage
    assert_eq!(read_i64(&bytes, 30), -1); // lastFreePage
    assert_eq!(bytes[38], 32);
    assert_eq!(i16::from_be_bytes([bytes[39], bytes[40]]), 64);
    assert_eq!(read_i64(&bytes, 41), 0); // recordCount
    assert_eq!(read_i64(&bytes, 49), 3); // rootPage
}

#[test]
fn test_free_list_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("free.pg");

    let freed = {
        let paged = Paged::new(&path, options()).unwrap();
        paged.create().unwrap();

        let a = paged.get_free_page().unwrap();
        let b = paged.get_free_page().unwrap();
        paged.write_value(&a, &Value::from("a")).unwrap();
        paged.write_value(&b, &Value::from("b")).unwrap();

        paged.unlink_pages(&b).unwrap();
        paged.unlink_pages(&a).unwrap();
        let order = vec![b.page_num(), a.page_num()];
        paged.close().unwrap();
        order
    };

    let paged = Paged::new(&path, PagedOptions::default()).unwrap();
    assert!(paged.open().unwrap());

    let header = paged.file_header();
    assert_eq!(header.first_free_page, Some(freed[0]));
    assert_eq!(header.last_free_page, Some(freed[1]));
    assert_eq!(paged.get_page(freed[0]).unwrap().status(), PageStatus::Deleted);

    // Oldest free page comes back first.
    assert_eq!(paged.get_free_page().unwrap().page_num(), freed[0]);
    assert_eq!(paged.get_free_page().unwrap().page_num(), freed[1]);
    assert_eq!(paged.file_header().first_free_page, None);
    assert_eq!(paged.get_free_page().unwrap().page_num(), 10);
}

#[test]
fn test_value_grows_and_shrinks_in_place() {
    let dir = TempDir::new().unwrap();
    let paged = Paged::new(dir.path().join("resize.pg"), options()).unwrap();
    paged.create().unwrap();

    let page = paged.get_free_page().unwrap();
    let work = paged.work_size();

    for len in [10, work * 3 + 7, work + 1, work * 5, 0, work * 2] {
        let value = Value::from(vec![(len % 251) as u8; len]);
        paged.write_value(&page, &value).unwrap();
        assert_eq!(paged.read_value(&page).unwrap(), value, "length {}", len);
    }

    // Every overflow page no longer in the chain went to the free list, so
    // the file never grew past the largest chain.
    let header = paged.file_header();
    assert!(header.total_count <= 8 + 1 + 5);
    assert!(header.first_free_page.is_some());
}

#[test]
fn test_page_numbers_in_primary_space_are_usable() {
    let dir = TempDir::new().unwrap();
    let paged = Paged::new(dir.path().join("primary.pg"), options()).unwrap();
    paged.create().unwrap();

    let page = paged.get_page(5).unwrap();
    assert_eq!(page.status(), PageStatus::Unused);
    page.lock().header.status = PageStatus::Leaf;
    paged.write_value(&page, &Value::from(vec![1u8; 1200])).unwrap();

    paged.unlink_pages(&page).unwrap();
    assert_eq!(page.status(), PageStatus::Deleted);
    assert_eq!(page.next_page(), None);

    // Primary pages stay out of the free list, their overflow pages do not.
    let header = paged.file_header();
    let first_free = header.first_free_page.unwrap();
    assert!(first_free >= 8);
}

#[test]
fn test_exclusive_ownership() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("owned.pg");

    let first = Paged::new(&path, options()).unwrap();
    first.create().unwrap();

    let second = Paged::new(&path, options()).unwrap();
    assert!(second.open().is_err());
    assert!(!second.is_opened());

    first.close().unwrap();
    assert!(second.open().unwrap());
}

#[test]
fn test_drop_file_removes_everything() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gone.pg");

    let paged = Paged::new(&path, options()).unwrap();
    paged.create().unwrap();
    let page = paged.get_free_page().unwrap();
    paged.write_value(&page, &Value::from("bye")).unwrap();

    assert!(paged.drop_file().unwrap());
    assert!(!path.exists());
    assert!(matches!(paged.get_page(1), Err(Error::FileClosed)));
}

#[test]
fn test_descriptor_pool_is_bounded() {
    let dir = TempDir::new().unwrap();
    let opts = PagedOptions {
        max_descriptors: 2,
        cache_size: 4,
        ..options()
    };
    let paged = Arc::new(Paged::new(dir.path().join("fds.pg"), opts).unwrap());
    paged.create().unwrap();

    let mut pages = Vec::new();
    for i in 0..32u8 {
        let page = paged.get_free_page().unwrap();
        paged.write_value(&page, &Value::from(vec![i; 100])).unwrap();
        pages.push(page.page_num());
    }
    paged.flush().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let paged = Arc::clone(&paged);
            let pages = pages.clone();
            thread::spawn(move || {
                for (i, &page_num) in pages.iter().enumerate() {
                    let page = paged.get_page(page_num).unwrap();
                    let value = paged.read_value(&page).unwrap();
                    assert_eq!(value.as_bytes(), &vec![i as u8; 100][..]);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(paged.open_descriptors() <= 2);
    println!("metrics: {:?}", paged.metrics());
}

#[test]
fn test_single_descriptor_is_reused() {
    let dir = TempDir::new().unwrap();
    let opts = PagedOptions {
        max_descriptors: 1,
        descriptor_timeout: Some(Duration::from_millis(50)),
        ..options()
    };
    let paged = Paged::new(dir.path().join("single.pg"), opts).unwrap();
    paged.create().unwrap();

    // Loading a page and flushing each borrow the one handle in turn.
    for page_num in 0..6 {
        let page = paged.get_page(page_num).unwrap();
        paged.write_value(&page, &Value::from(vec![7u8; 600])).unwrap();
        paged.flush().unwrap();
    }
    assert_eq!(paged.open_descriptors(), 1);
}
