use std::sync::{Mutex, MutexGuard};

use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::header::{PageHeader, PageStatus};
use crate::core::value::Key;

/// One fixed-size page: a decoded header plus the raw page bytes.
///
/// The page cache hands out the same `Arc<Page>` to every caller while the
/// page is resident, so a mutation made under the lock is seen by all holders.
#[derive(Debug)]
pub struct Page {
    page_num: PageNum,
    state: Mutex<PageState>,
}

#[derive(Debug)]
pub struct PageState {
    pub header: PageHeader,
    data: Vec<u8>,
    header_size: usize,
}

impl Page {
    pub(crate) fn new(page_num: PageNum, header: PageHeader, data: Vec<u8>, header_size: usize) -> Self {
        Self {
            page_num,
            state: Mutex::new(PageState {
                header,
                data,
                header_size,
            }),
        }
    }

    pub fn page_num(&self) -> PageNum {
        self.page_num
    }

    pub fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().recover_poison()
    }

    pub fn header(&self) -> PageHeader {
        self.lock().header.clone()
    }

    pub fn status(&self) -> PageStatus {
        self.lock().header.status
    }

    pub fn next_page(&self) -> Option<PageNum> {
        self.lock().header.next_page
    }

    pub fn set_key(&self, key: &Key) -> Result<()> {
        self.lock().set_key(key)
    }

    pub fn key(&self) -> Option<Key> {
        self.lock().key()
    }

    /// Raw page image with the current header encoded in front.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let state = self.lock();
        let mut buf = state.data.clone();
        state.header.write_into(&mut buf);
        buf
    }
}

impl PageState {
    fn key_start(&self) -> usize {
        self.header_size
    }

    fn data_start(&self) -> usize {
        self.header_size + self.header.key_len as usize
    }

    /// Bytes left for data once the header and key are accounted for.
    pub fn data_capacity(&self) -> usize {
        self.data.len() - self.data_start()
    }

    pub fn set_key(&mut self, key: &Key) -> Result<()> {
        let start = self.key_start();
        if start + key.len() > self.data.len() {
            return Err(Error::KeyTooLarge {
                len: key.len(),
                max: self.data.len() - start,
            });
        }

        self.data[start..start + key.len()].copy_from_slice(key.as_bytes());
        self.header.key_len = key.len() as i32;
        self.header.key_hash = key.hash_code();
        self.header.data_len = self.header.data_len.min(self.data_capacity() as i32);
        Ok(())
    }

    pub fn key(&self) -> Option<Key> {
        if self.header.key_len == 0 {
            return None;
        }
        let start = self.key_start();
        Some(Key::new(&self.data[start..start + self.header.key_len as usize]))
    }

    /// Copies as much of `bytes` as fits into the data region and returns the
    /// number of bytes consumed.
    pub fn stream_from(&mut self, bytes: &[u8]) -> usize {
        let len = bytes.len().min(self.data_capacity());
        let start = self.data_start();
        self.data[start..start + len].copy_from_slice(&bytes[..len]);
        self.header.data_len = len as i32;
        len
    }

    /// Appends the `data_len` bytes of the data region to `out`.
    pub fn stream_to(&self, out: &mut Vec<u8>) {
        let start = self.data_start();
        out.extend_from_slice(&self.data[start..start + self.header.data_len as usize]);
    }

    /// Returns the page to the state of a freshly allocated one.
    pub(crate) fn reset(&mut self) {
        self.header = PageHeader::default();
        self.data.fill(0);
    }
}
