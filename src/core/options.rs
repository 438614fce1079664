use std::time::Duration;

use crate::core::constants::*;
use crate::core::errors::*;

/// Layout and resource settings for a page file.
///
/// The layout fields (`page_size`, `page_count`, `file_header_size`,
/// `page_header_size`, `max_key_size`) only apply when a file is created; an
/// existing file keeps the layout recorded in its header.
#[derive(Debug, Clone)]
pub struct PagedOptions {
    pub page_size: u32,
    /// Pages reserved as primary space at creation.
    pub page_count: u64,
    pub file_header_size: u16,
    pub page_header_size: u8,
    /// Largest value accepted as a B-tree key, in bytes.
    pub max_key_size: u16,
    /// Upper bound on concurrently open file handles.
    pub max_descriptors: usize,
    /// How long a caller waits for a descriptor. `None` waits forever.
    pub descriptor_timeout: Option<Duration>,
    /// Clean pages kept in the read cache.
    pub cache_size: usize,
    /// Dirty pages tolerated before a write forces a flush.
    pub max_dirty_pages: usize,
    pub sync_on_flush: bool,
    pub close_wait_attempts: u32,
    pub close_wait_interval: Duration,
}

impl Default for PagedOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_count: DEFAULT_PAGE_COUNT,
            file_header_size: DEFAULT_FILE_HEADER_SIZE,
            page_header_size: DEFAULT_PAGE_HEADER_SIZE,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
            descriptor_timeout: None,
            cache_size: DEFAULT_CACHE_SIZE,
            max_dirty_pages: DEFAULT_MAX_DIRTY_PAGES,
            sync_on_flush: true,
            close_wait_attempts: DEFAULT_CLOSE_WAIT_ATTEMPTS,
            close_wait_interval: Duration::from_millis(DEFAULT_CLOSE_WAIT_INTERVAL_MS),
        }
    }
}

impl PagedOptions {
    /// Defaults for a B-tree file: a single primary page, every other page
    /// allocated on demand.
    pub fn for_btree() -> Self {
        Self {
            page_count: DEFAULT_BTREE_PAGE_COUNT,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if (self.file_header_size as usize) < FILE_HEADER_LEN {
            return Err(Error::InvalidOptions(format!(
                "file header size {} is smaller than the {} byte header",
                self.file_header_size, FILE_HEADER_LEN
            )));
        }

        if (self.page_header_size as usize) < PAGE_HEADER_LEN {
            return Err(Error::InvalidOptions(format!(
                "page header size {} is smaller than the {} byte header",
                self.page_header_size, PAGE_HEADER_LEN
            )));
        }

        if self.page_size > i32::MAX as u32 {
            return Err(Error::InvalidOptions(format!(
                "page size {} does not fit the header field",
                self.page_size
            )));
        }

        if self.page_size as usize <= self.page_header_size as usize + self.max_key_size as usize {
            return Err(Error::InvalidOptions(format!(
                "page size {} leaves no room for data after a {} byte header and {} byte keys",
                self.page_size, self.page_header_size, self.max_key_size
            )));
        }

        if self.max_key_size as usize > i16::MAX as usize {
            return Err(Error::InvalidOptions(format!(
                "max key size {} exceeds {}",
                self.max_key_size,
                i16::MAX
            )));
        }

        if self.page_count > i64::MAX as u64 {
            return Err(Error::InvalidOptions("page count too large".to_string()));
        }

        if self.max_descriptors == 0 {
            return Err(Error::InvalidOptions(
                "at least one file descriptor is required".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        PagedOptions::default().validate().unwrap();
        PagedOptions::for_btree().validate().unwrap();
        assert_eq!(PagedOptions::for_btree().page_count, 1);
    }

    #[test]
    fn test_rejects_impossible_layouts() {
        let opts = PagedOptions {
            page_header_size: 8,
            ..PagedOptions::default()
        };
        assert!(matches!(opts.validate(), Err(Error::InvalidOptions(_))));

        let opts = PagedOptions {
            page_size: 128,
            ..PagedOptions::default()
        };
        assert!(opts.validate().is_err());

        let opts = PagedOptions {
            max_descriptors: 0,
            ..PagedOptions::default()
        };
        assert!(opts.validate().is_err());

        let opts = PagedOptions {
            file_header_size: 16,
            ..PagedOptions::default()
        };
        assert!(opts.validate().is_err());
    }
}
