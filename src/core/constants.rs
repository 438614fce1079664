pub type PageNum = u64;

/// On-disk marker for "no page" in `nextPage`, free-list and root fields.
pub const NO_PAGE: i64 = -1;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_FILE_HEADER_SIZE: u16 = 4096;
pub const DEFAULT_PAGE_HEADER_SIZE: u8 = 64;
pub const DEFAULT_PAGE_COUNT: u64 = 1024;
pub const DEFAULT_BTREE_PAGE_COUNT: u64 = 1;
pub const DEFAULT_MAX_KEY_SIZE: u16 = 256;

pub const DEFAULT_MAX_DESCRIPTORS: usize = 16;
pub const DEFAULT_CACHE_SIZE: usize = 1000;
pub const DEFAULT_NODE_CACHE_SIZE: usize = 512;
pub const DEFAULT_MAX_DIRTY_PAGES: usize = 1024;
pub const DEFAULT_CLOSE_WAIT_ATTEMPTS: u32 = 50;
pub const DEFAULT_CLOSE_WAIT_INTERVAL_MS: u64 = 100;

// File header field offsets.
pub const FH_HEADER_SIZE: usize = 0;
pub const FH_PAGE_SIZE: usize = 2;
pub const FH_PAGE_COUNT: usize = 6;
pub const FH_TOTAL_COUNT: usize = 14;
pub const FH_FIRST_FREE: usize = 22;
pub const FH_LAST_FREE: usize = 30;
pub const FH_PAGE_HEADER_SIZE: usize = 38;
pub const FH_MAX_KEY_SIZE: usize = 39;
pub const FH_RECORD_COUNT: usize = 41;
pub const FH_ROOT_PAGE: usize = 49;
pub const FILE_HEADER_LEN: usize = 57;

// Page header field offsets.
pub const PH_STATUS: usize = 0;
pub const PH_KEY_LEN: usize = 1;
pub const PH_KEY_HASH: usize = 5;
pub const PH_DATA_LEN: usize = 9;
pub const PH_RECORD_LEN: usize = 13;
pub const PH_NEXT_PAGE: usize = 17;
pub const PH_VALUE_COUNT: usize = 25;
pub const PAGE_HEADER_LEN: usize = 27;

/// Length prefix written before every value in a node body.
pub const NODE_VALUE_LEN_SIZE: usize = 2;
pub const NODE_POINTER_SIZE: usize = 8;

/// Nodes holding this many values or fewer never split; they spill into
/// overflow pages instead.
pub const MIN_SPLIT_VALUES: usize = 4;
