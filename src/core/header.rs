use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::options::PagedOptions;

fn encode_page_ref(page: Option<PageNum>) -> i64 {
    page.map_or(NO_PAGE, |p| p as i64)
}

fn decode_page_ref(raw: i64) -> Option<PageNum> {
    if raw < 0 {
        None
    } else {
        Some(raw as PageNum)
    }
}

fn read_i16(data: &[u8], offset: usize) -> Result<i16> {
    Ok(i16::from_be_bytes(data[offset..offset + 2].try_into()?))
}

fn read_i32(data: &[u8], offset: usize) -> Result<i32> {
    Ok(i32::from_be_bytes(data[offset..offset + 4].try_into()?))
}

fn read_i64(data: &[u8], offset: usize) -> Result<i64> {
    Ok(i64::from_be_bytes(data[offset..offset + 8].try_into()?))
}

/// File header stored at offset 0, including the B-tree root page extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub header_size: u16,
    pub page_size: u32,
    pub page_count: u64,
    pub total_count: u64,
    pub first_free_page: Option<PageNum>,
    pub last_free_page: Option<PageNum>,
    pub page_header_size: u8,
    pub max_key_size: u16,
    pub record_count: u64,
    pub root_page: Option<PageNum>,
    /// Set by every mutation; cleared once the header reaches the disk.
    pub(crate) dirty: bool,
}

impl FileHeader {
    pub fn new(opts: &PagedOptions) -> Self {
        Self {
            header_size: opts.file_header_size,
            page_size: opts.page_size,
            page_count: opts.page_count,
            total_count: opts.page_count,
            first_free_page: None,
            last_free_page: None,
            page_header_size: opts.page_header_size,
            max_key_size: opts.max_key_size,
            record_count: 0,
            root_page: None,
            dirty: true,
        }
    }

    /// Bytes available to key and data on one page.
    pub fn work_size(&self) -> usize {
        self.page_size as usize - self.page_header_size as usize
    }

    pub fn page_offset(&self, page_num: PageNum) -> u64 {
        self.header_size as u64 + page_num * self.page_size as u64
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; FILE_HEADER_LEN];

        buf[FH_HEADER_SIZE..FH_HEADER_SIZE + 2]
            .copy_from_slice(&(self.header_size as i16).to_be_bytes());
        buf[FH_PAGE_SIZE..FH_PAGE_SIZE + 4].copy_from_slice(&(self.page_size as i32).to_be_bytes());
        buf[FH_PAGE_COUNT..FH_PAGE_COUNT + 8]
            .copy_from_slice(&(self.page_count as i64).to_be_bytes());
        buf[FH_TOTAL_COUNT..FH_TOTAL_COUNT + 8]
            .copy_from_slice(&(self.total_count as i64).to_be_bytes());
        buf[FH_FIRST_FREE..FH_FIRST_FREE + 8]
            .copy_from_slice(&encode_page_ref(self.first_free_page).to_be_bytes());
        buf[FH_LAST_FREE..FH_LAST_FREE + 8]
            .copy_from_slice(&encode_page_ref(self.last_free_page).to_be_bytes());
        buf[FH_PAGE_HEADER_SIZE] = self.page_header_size;
        buf[FH_MAX_KEY_SIZE..FH_MAX_KEY_SIZE + 2]
            .copy_from_slice(&(self.max_key_size as i16).to_be_bytes());
        buf[FH_RECORD_COUNT..FH_RECORD_COUNT + 8]
            .copy_from_slice(&(self.record_count as i64).to_be_bytes());
        buf[FH_ROOT_PAGE..FH_ROOT_PAGE + 8]
            .copy_from_slice(&encode_page_ref(self.root_page).to_be_bytes());

        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < FILE_HEADER_LEN {
            return Err(Error::DataCorruption {
                details: format!(
                    "file header truncated: {} bytes, need {}",
                    data.len(),
                    FILE_HEADER_LEN
                ),
            });
        }

        let header_size = read_i16(data, FH_HEADER_SIZE)?;
        let page_size = read_i32(data, FH_PAGE_SIZE)?;
        let page_count = read_i64(data, FH_PAGE_COUNT)?;
        let total_count = read_i64(data, FH_TOTAL_COUNT)?;
        let max_key_size = read_i16(data, FH_MAX_KEY_SIZE)?;
        let record_count = read_i64(data, FH_RECORD_COUNT)?;

        if header_size < FILE_HEADER_LEN as i16
            || page_size <= 0
            || page_count < 0
            || total_count < page_count
            || max_key_size < 0
            || record_count < 0
        {
            return Err(Error::DataCorruption {
                details: format!(
                    "invalid file header: header_size={} page_size={} page_count={} total_count={} max_key_size={} record_count={}",
                    header_size, page_size, page_count, total_count, max_key_size, record_count
                ),
            });
        }

        let header = Self {
            header_size: header_size as u16,
            page_size: page_size as u32,
            page_count: page_count as u64,
            total_count: total_count as u64,
            first_free_page: decode_page_ref(read_i64(data, FH_FIRST_FREE)?),
            last_free_page: decode_page_ref(read_i64(data, FH_LAST_FREE)?),
            page_header_size: data[FH_PAGE_HEADER_SIZE],
            max_key_size: max_key_size as u16,
            record_count: record_count as u64,
            root_page: decode_page_ref(read_i64(data, FH_ROOT_PAGE)?),
            dirty: false,
        };

        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if (self.page_header_size as usize) < PAGE_HEADER_LEN
            || self.page_size as usize <= self.page_header_size as usize
        {
            return Err(Error::DataCorruption {
                details: format!(
                    "page header size {} does not fit page size {}",
                    self.page_header_size, self.page_size
                ),
            });
        }

        for (name, page) in [
            ("first_free_page", self.first_free_page),
            ("last_free_page", self.last_free_page),
            ("root_page", self.root_page),
        ] {
            if let Some(page) = page {
                if page >= self.total_count {
                    return Err(Error::DataCorruption {
                        details: format!(
                            "{} {} is beyond total_count {}",
                            name, page, self.total_count
                        ),
                    });
                }
            }
        }

        if self.first_free_page.is_some() != self.last_free_page.is_some() {
            return Err(Error::DataCorruption {
                details: "free list has only one end set".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageStatus {
    Unused = 0,
    Leaf = 1,
    Branch = 2,
    Overflow = 126,
    Deleted = 127,
}

impl PageStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PageStatus::Unused),
            1 => Some(PageStatus::Leaf),
            2 => Some(PageStatus::Branch),
            126 => Some(PageStatus::Overflow),
            127 => Some(PageStatus::Deleted),
            _ => None,
        }
    }
}

/// Per-page header, including the B-tree `value_count` extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub status: PageStatus,
    pub key_len: i32,
    pub key_hash: i32,
    pub data_len: i32,
    pub record_len: i32,
    pub next_page: Option<PageNum>,
    pub value_count: i16,
}

impl Default for PageHeader {
    fn default() -> Self {
        Self {
            status: PageStatus::Unused,
            key_len: 0,
            key_hash: 0,
            data_len: 0,
            record_len: 0,
            next_page: None,
            value_count: 0,
        }
    }
}

impl PageHeader {
    pub fn write_into(&self, buf: &mut [u8]) {
        buf[PH_STATUS] = self.status as u8;
        buf[PH_KEY_LEN..PH_KEY_LEN + 4].copy_from_slice(&self.key_len.to_be_bytes());
        buf[PH_KEY_HASH..PH_KEY_HASH + 4].copy_from_slice(&self.key_hash.to_be_bytes());
        buf[PH_DATA_LEN..PH_DATA_LEN + 4].copy_from_slice(&self.data_len.to_be_bytes());
        buf[PH_RECORD_LEN..PH_RECORD_LEN + 4].copy_from_slice(&self.record_len.to_be_bytes());
        buf[PH_NEXT_PAGE..PH_NEXT_PAGE + 8]
            .copy_from_slice(&encode_page_ref(self.next_page).to_be_bytes());
        buf[PH_VALUE_COUNT..PH_VALUE_COUNT + 2].copy_from_slice(&self.value_count.to_be_bytes());
    }

    /// Decodes a header read from disk. A page that was never written decodes
    /// as a fresh UNUSED header.
    pub fn read_from(page_num: PageNum, buf: &[u8], work_size: usize) -> Result<Self> {
        let status = PageStatus::from_u8(buf[PH_STATUS]).ok_or_else(|| {
            Error::corrupt(
                "paged",
                page_num,
                format!("invalid page status {}", buf[PH_STATUS]),
            )
        })?;

        if status == PageStatus::Unused && buf[..PAGE_HEADER_LEN].iter().all(|&b| b == 0) {
            return Ok(Self::default());
        }

        let header = Self {
            status,
            key_len: read_i32(buf, PH_KEY_LEN)?,
            key_hash: read_i32(buf, PH_KEY_HASH)?,
            data_len: read_i32(buf, PH_DATA_LEN)?,
            record_len: read_i32(buf, PH_RECORD_LEN)?,
            next_page: decode_page_ref(read_i64(buf, PH_NEXT_PAGE)?),
            value_count: read_i16(buf, PH_VALUE_COUNT)?,
        };

        if header.key_len < 0
            || header.data_len < 0
            || header.record_len < 0
            || header.value_count < 0
            || header.key_len as usize + header.data_len as usize > work_size
        {
            return Err(Error::corrupt(
                "paged",
                page_num,
                format!(
                    "header lengths out of range: key_len={} data_len={} record_len={} value_count={}",
                    header.key_len, header.data_len, header.record_len, header.value_count
                ),
            ));
        }

        Ok(header)
    }
}
