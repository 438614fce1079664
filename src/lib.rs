//! Paged storage with a simple-prefix B+tree index on top.
//!
//! [`Paged`] manages a file of fixed-size pages: a big-endian file header,
//! a free-page list, and values that spill across chained overflow pages.
//! [`BTree`] stores an ordered map from byte-string values to 64-bit
//! pointers in such a file, with shortest-prefix separators in its branch
//! nodes and optional nested trees rooted under a name in a parent tree.

pub mod core;

pub use core::{
    BTree, BTreeCallback, BTreeNode, BTreeRootInfo, FaultCode, IndexQuery, Key, NodeType, Operator, Page, PageStatus,
    Paged, PagedOptions, TreeStats, Value,
};
pub use core::errors::{Error, Result};
pub use core::metrics::MetricsSnapshot;
