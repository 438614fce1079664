pub mod constants;
pub mod errors;
pub mod value;
pub mod options;
pub mod header;
pub mod page;
pub mod lru_cache;
pub mod descriptor_pool;
pub mod metrics;
pub mod paged;
pub mod query;
pub mod btree;

pub use constants::*;
pub use btree::{BTree, BTreeNode, BTreeRootInfo, NodeType, TreeStats};
pub use errors::{Error, FaultCode, Result};
pub use header::{FileHeader, PageHeader, PageStatus};
pub use metrics::{Metrics, MetricsSnapshot};
pub use options::PagedOptions;
pub use page::{Page, PageState};
pub use paged::Paged;
pub use query::{BTreeCallback, IndexQuery, Operator};
pub use value::{Key, Value};
