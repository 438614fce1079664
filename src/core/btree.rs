use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::header::PageStatus;
use crate::core::lru_cache::LRUCache;
use crate::core::options::PagedOptions;
use crate::core::paged::Paged;
use crate::core::query::{BTreeCallback, IndexQuery, Operator};
use crate::core::value::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Descents deeper than this are treated as a cycle in the tree.
const MAX_TREE_DEPTH: usize = 64;

const UNSET_ROOT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Leaf,
    Branch,
}

impl NodeType {
    fn from_status(status: PageStatus) -> Option<Self> {
        match status {
            PageStatus::Leaf => Some(NodeType::Leaf),
            PageStatus::Branch => Some(NodeType::Branch),
            _ => None,
        }
    }

    fn status(self) -> PageStatus {
        match self {
            NodeType::Leaf => PageStatus::Leaf,
            NodeType::Branch => PageStatus::Branch,
        }
    }
}

/// Decoded contents of one tree page.
///
/// Leaves pair `values[i]` with `ptrs[i]`. Branches hold one more pointer
/// than values: `ptrs[i]` leads to values below `values[i]`, `ptrs[i + 1]`
/// to values at or above it.
#[derive(Debug, Clone)]
pub struct BTreeNode {
    page_num: PageNum,
    node_type: NodeType,
    values: Vec<Value>,
    ptrs: Vec<i64>,
}

impl BTreeNode {
    fn new(page_num: PageNum, node_type: NodeType) -> Self {
        Self {
            page_num,
            node_type,
            values: Vec::new(),
            ptrs: Vec::new(),
        }
    }

    pub fn page_num(&self) -> PageNum {
        self.page_num
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn pointers(&self) -> &[i64] {
        &self.ptrs
    }

    /// Index of the child that may hold `value`.
    fn child_index(&self, value: &Value) -> usize {
        match self.values.binary_search(value) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        }
    }

    fn child_page(&self, value: &Value) -> Result<PageNum> {
        match self.ptrs.get(self.child_index(value)) {
            Some(&ptr) if ptr >= 0 => Ok(ptr as PageNum),
            _ => Err(Error::not_found(value.as_bytes())),
        }
    }

    fn encoded_len(&self) -> usize {
        self.values
            .iter()
            .map(|v| NODE_VALUE_LEN_SIZE + v.len())
            .sum::<usize>()
            + self.ptrs.len() * NODE_POINTER_SIZE
    }

    fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.encoded_len());
        for value in &self.values {
            data.extend_from_slice(&(value.len() as i16).to_be_bytes());
            data.extend_from_slice(value.as_bytes());
        }
        for ptr in &self.ptrs {
            data.extend_from_slice(&ptr.to_be_bytes());
        }
        data
    }

    fn deserialize(page_num: PageNum, node_type: NodeType, value_count: usize, data: &[u8]) -> Result<Self> {
        let mut offset = 0;

        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            if offset + NODE_VALUE_LEN_SIZE > data.len() {
                return Err(Error::corrupt("btree", page_num, "insufficient data for value length"));
            }
            let len = i16::from_be_bytes([data[offset], data[offset + 1]]);
            offset += NODE_VALUE_LEN_SIZE;

            if len < 0 {
                return Err(Error::corrupt("btree", page_num, format!("negative value length {}", len)));
            }
            let len = len as usize;
            if offset + len > data.len() {
                return Err(Error::corrupt("btree", page_num, "insufficient data for value"));
            }
            values.push(Value::from(&data[offset..offset + len]));
            offset += len;
        }

        let ptr_count = match node_type {
            NodeType::Leaf => value_count,
            NodeType::Branch => value_count + 1,
        };
        let mut ptrs = Vec::with_capacity(ptr_count);
        for _ in 0..ptr_count {
            if offset + NODE_POINTER_SIZE > data.len() {
                return Err(Error::corrupt("btree", page_num, "insufficient data for pointer"));
            }
            ptrs.push(i64::from_be_bytes(data[offset..offset + NODE_POINTER_SIZE].try_into()?));
            offset += NODE_POINTER_SIZE;
        }

        if values.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::corrupt("btree", page_num, "values out of order"));
        }

        Ok(Self {
            page_num,
            node_type,
            values,
            ptrs,
        })
    }
}

/// Shortest prefix of `right` that still sorts after `left`.
fn separator(left: &Value, right: &Value) -> Value {
    right.prefix(left.mismatch(right) + 1)
}

/// Names a tree inside the file: the top-level tree, or a nested tree whose
/// root page is stored as the pointer of `name` in its parent tree.
#[derive(Debug)]
pub struct BTreeRootInfo {
    parent: Option<Arc<BTreeRootInfo>>,
    name: Option<Value>,
    page: AtomicU64,
}

impl BTreeRootInfo {
    fn top() -> Self {
        Self {
            parent: None,
            name: None,
            page: AtomicU64::new(UNSET_ROOT),
        }
    }

    pub fn parent(&self) -> Option<&Arc<BTreeRootInfo>> {
        self.parent.as_ref()
    }

    pub fn name(&self) -> Option<&Value> {
        self.name.as_ref()
    }

    pub fn page(&self) -> PageNum {
        self.page.load(Ordering::Acquire)
    }

    fn set_page(&self, page_num: PageNum) {
        self.page.store(page_num, Ordering::Release);
    }

    fn name_path(&self) -> Vec<Value> {
        let mut path = Vec::new();
        let mut current = Some(self);
        while let Some(info) = current {
            if let Some(name) = &info.name {
                path.push(name.clone());
            }
            current = info.parent.as_deref();
        }
        path.reverse();
        path
    }
}

/// Shape of a tree as seen by `check_integrity`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Levels from the root down to the leaves, a lone root leaf being 1.
    pub depth: usize,
    pub nodes: usize,
    pub leaves: usize,
    pub values: usize,
}

struct Split {
    left: PageNum,
    separator: Value,
    right: PageNum,
}

type NodeRef = Arc<Mutex<BTreeNode>>;

/// Simple-prefix B+tree mapping byte-string values to 64-bit pointers,
/// stored in a `Paged` file.
///
/// Readers and writers may run from several threads, but writers must be
/// serialized by the caller: a split racing with another insert can route
/// the second value into the wrong sibling. Deleting never merges or
/// rebalances nodes.
///
/// Nodes with four or fewer values never split; when they outgrow a page
/// their body spills into overflow pages instead.
pub struct BTree {
    paged: Paged,
    root: Arc<BTreeRootInfo>,
    nodes: LRUCache<NodeRef>,
    nested: Mutex<HashMap<Vec<Value>, Weak<BTreeRootInfo>>>,
}

impl BTree {
    pub fn new(path: impl AsRef<Path>, options: PagedOptions) -> Result<Self> {
        Self::with_node_cache_size(path, options, DEFAULT_NODE_CACHE_SIZE)
    }

    pub fn with_node_cache_size(path: impl AsRef<Path>, options: PagedOptions, node_cache_size: usize) -> Result<Self> {
        Ok(Self {
            paged: Paged::new(path, options)?,
            root: Arc::new(BTreeRootInfo::top()),
            nodes: LRUCache::new(node_cache_size),
            nested: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying page file.
    pub fn paged(&self) -> &Paged {
        &self.paged
    }

    /// Root of the top-level tree.
    pub fn root_info(&self) -> Arc<BTreeRootInfo> {
        Arc::clone(&self.root)
    }

    fn reset_caches(&self) {
        self.nodes.clear();
        self.nested.lock().recover_poison().clear();
    }

    /// Creates a new file holding an empty tree: a single leaf root.
    pub fn create(&self) -> Result<()> {
        self.paged.create()?;
        self.reset_caches();

        // The first root lives in primary space when the file has any.
        let root = if self.paged.file_header().page_count > 0 {
            self.node_at(0, NodeType::Leaf)
        } else {
            self.create_node(NodeType::Leaf)?
        };
        let page_num = {
            let node = root.lock().recover_poison();
            self.write_node(&node)?;
            node.page_num
        };
        self.paged.set_root_page(page_num);
        self.root.set_page(page_num);
        self.paged.flush()?;

        debug!(path = %self.paged.path().display(), root = page_num, "created btree");
        Ok(())
    }

    /// Opens an existing file. Returns `false` if it does not exist.
    pub fn open(&self) -> Result<bool> {
        if !self.paged.open()? {
            return Ok(false);
        }
        self.reset_caches();

        let root = match self.paged.root_page() {
            Some(root) => root,
            None => {
                let _ = self.paged.close();
                return Err(Error::corrupt("btree", 0, "file header has no root page"));
            }
        };
        self.root.set_page(root);

        debug!(path = %self.paged.path().display(), root, "opened btree");
        Ok(true)
    }

    pub fn close(&self) -> Result<()> {
        self.reset_caches();
        self.paged.close()
    }

    pub fn flush(&self) -> Result<()> {
        self.paged.flush()
    }

    /// Closes and deletes the file.
    pub fn drop_file(&self) -> Result<bool> {
        self.reset_caches();
        self.paged.drop_file()
    }

    pub fn record_count(&self) -> u64 {
        self.paged.record_count()
    }

    fn check_value(&self, value: &Value) -> Result<()> {
        let max = self.paged.max_key_size().min(i16::MAX as usize);
        if value.len() > max {
            return Err(Error::KeyTooLarge { len: value.len(), max });
        }
        Ok(())
    }

    fn get_node(&self, page_num: PageNum) -> Result<NodeRef> {
        self.nodes.get_or_try_insert_with(page_num, || {
            self.load_node(page_num).map(|node| Arc::new(Mutex::new(node)))
        })
    }

    fn load_node(&self, page_num: PageNum) -> Result<BTreeNode> {
        let page = self.paged.get_page(page_num)?;
        let header = page.header();

        let node_type = NodeType::from_status(header.status).ok_or_else(|| {
            Error::corrupt("btree", page_num, format!("page status {:?} is not a tree node", header.status))
        })?;
        if header.value_count < 0 {
            return Err(Error::corrupt("btree", page_num, format!("negative value count {}", header.value_count)));
        }

        let body = self.paged.read_value(&page)?;
        BTreeNode::deserialize(page_num, node_type, header.value_count as usize, body.as_bytes())
    }

    /// Allocates a page for a new, empty node and caches it.
    fn create_node(&self, node_type: NodeType) -> Result<NodeRef> {
        let page = self.paged.get_free_page()?;
        Ok(self.node_at(page.page_num(), node_type))
    }

    fn node_at(&self, page_num: PageNum, node_type: NodeType) -> NodeRef {
        let node = Arc::new(Mutex::new(BTreeNode::new(page_num, node_type)));
        self.nodes.put(page_num, Arc::clone(&node));
        node
    }

    fn write_node(&self, node: &BTreeNode) -> Result<()> {
        if node.values.len() > i16::MAX as usize {
            return Err(Error::BTree {
                fault: FaultCode::GenericError,
                message: format!("node {} holds too many values ({})", node.page_num, node.values.len()),
            });
        }

        let page = self.paged.get_page(node.page_num)?;
        {
            let mut state = page.lock();
            state.header.status = node.node_type.status();
            state.header.value_count = node.values.len() as i16;
        }
        self.paged.write_value(&page, &Value::from(node.serialize()))
    }

    fn needs_split(&self, node: &BTreeNode) -> bool {
        node.values.len() > MIN_SPLIT_VALUES && node.encoded_len() > self.paged.work_size()
    }

    /// Walks from `root` to the leaf responsible for `value`, returning the
    /// leaf and the branch pages passed on the way.
    fn descend(&self, root: &BTreeRootInfo, value: &Value) -> Result<(NodeRef, Vec<PageNum>)> {
        let mut path = Vec::new();
        let mut page_num = root.page();

        loop {
            let node = self.get_node(page_num)?;
            let child = {
                let guard = node.lock().recover_poison();
                match guard.node_type {
                    NodeType::Leaf => None,
                    NodeType::Branch => Some(guard.child_page(value)?),
                }
            };

            match child {
                None => return Ok((node, path)),
                Some(child) => {
                    path.push(page_num);
                    if path.len() > MAX_TREE_DEPTH {
                        return Err(Error::corrupt("btree", page_num, "tree deeper than the depth limit"));
                    }
                    page_num = child;
                }
            }
        }
    }

    pub fn add_value(&self, value: &Value, pointer: i64) -> Result<Option<i64>> {
        let root = Arc::clone(&self.root);
        self.add_value_in(&root, value, pointer)
    }

    /// Associates `pointer` with `value`, returning the pointer it replaced.
    pub fn add_value_in(&self, root: &Arc<BTreeRootInfo>, value: &Value, pointer: i64) -> Result<Option<i64>> {
        self.check_value(value)?;

        let (leaf_ref, path) = self.descend(root, value)?;
        let mut leaf = leaf_ref.lock().recover_poison();

        match leaf.values.binary_search(value) {
            Ok(idx) => {
                let old = std::mem::replace(&mut leaf.ptrs[idx], pointer);
                if old != pointer {
                    self.write_node(&leaf)?;
                }
                Ok(Some(old))
            }
            Err(idx) => {
                leaf.values.insert(idx, value.clone());
                leaf.ptrs.insert(idx, pointer);

                let split = if self.needs_split(&leaf) {
                    Some(self.split(&mut leaf)?)
                } else {
                    self.write_node(&leaf)?;
                    None
                };
                drop(leaf);

                self.paged.adjust_record_count(1);
                if let Some(split) = split {
                    self.promote(root, path, split)?;
                }
                Ok(None)
            }
        }
    }

    /// Moves the upper half of `node` into a new sibling and writes both.
    fn split(&self, node: &mut BTreeNode) -> Result<Split> {
        let pivot = node.values.len() / 2;

        let (values, ptrs, separator) = match node.node_type {
            NodeType::Leaf => {
                let values = node.values.split_off(pivot);
                let ptrs = node.ptrs.split_off(pivot);
                let sep = match (node.values.last(), values.first()) {
                    (Some(left), Some(right)) => separator(left, right),
                    _ => return Err(Error::corrupt("btree", node.page_num, "leaf too small to split")),
                };
                (values, ptrs, sep)
            }
            NodeType::Branch => {
                let values = node.values.split_off(pivot + 1);
                let ptrs = node.ptrs.split_off(pivot + 1);
                let sep = node
                    .values
                    .pop()
                    .ok_or_else(|| Error::corrupt("btree", node.page_num, "branch too small to split"))?;
                (values, ptrs, sep)
            }
        };

        let sibling = self.create_node(node.node_type)?;
        let right = {
            let mut right = sibling.lock().recover_poison();
            right.values = values;
            right.ptrs = ptrs;
            self.write_node(&right)?;
            right.page_num
        };
        self.write_node(node)?;

        self.paged.metrics_handle().node_split();
        debug!(
            left = node.page_num,
            right,
            node_type = ?node.node_type,
            separator_len = separator.len(),
            "split btree node"
        );

        Ok(Split {
            left: node.page_num,
            separator,
            right,
        })
    }

    /// Inserts split separators into the ancestors named by `path`, splitting
    /// them in turn, and grows a new root once the path runs out.
    fn promote(&self, root: &Arc<BTreeRootInfo>, mut path: Vec<PageNum>, mut split: Split) -> Result<()> {
        loop {
            let parent_num = match path.pop() {
                Some(parent_num) => parent_num,
                None => return self.grow_root(root, split),
            };

            let parent_ref = self.get_node(parent_num)?;
            let mut parent = parent_ref.lock().recover_poison();

            if parent.node_type != NodeType::Branch {
                return Err(Error::corrupt("btree", parent_num, "split parent is not a branch"));
            }

            let idx = match parent.values.binary_search(&split.separator) {
                Ok(_) => {
                    return Err(Error::corrupt("btree", parent_num, "separator already present in parent"));
                }
                Err(idx) => idx,
            };
            if parent.ptrs.get(idx) != Some(&(split.left as i64)) {
                return Err(Error::corrupt(
                    "btree",
                    parent_num,
                    format!("split node {} is not child {} of its parent", split.left, idx),
                ));
            }

            parent.values.insert(idx, split.separator.clone());
            parent.ptrs.insert(idx + 1, split.right as i64);

            if self.needs_split(&parent) {
                split = self.split(&mut parent)?;
            } else {
                return self.write_node(&parent);
            }
        }
    }

    fn grow_root(&self, root: &Arc<BTreeRootInfo>, split: Split) -> Result<()> {
        if split.left != root.page() {
            return Err(Error::corrupt(
                "btree",
                split.left,
                format!("split reached the top at page {} but the root is {}", split.left, root.page()),
            ));
        }

        let branch = self.create_node(NodeType::Branch)?;
        let page_num = {
            let mut node = branch.lock().recover_poison();
            node.values = vec![split.separator];
            node.ptrs = vec![split.left as i64, split.right as i64];
            self.write_node(&node)?;
            node.page_num
        };

        self.set_root_node(root, page_num)
    }

    /// Installs `page_num` as the root of `root`. For a nested tree this
    /// rewrites its pointer in the parent tree.
    pub fn set_root_node(&self, root: &Arc<BTreeRootInfo>, page_num: PageNum) -> Result<()> {
        match (&root.parent, &root.name) {
            (Some(parent), Some(name)) => {
                self.add_value_in(parent, name, page_num as i64)?;
            }
            _ => self.paged.set_root_page(page_num),
        }
        root.set_page(page_num);

        debug!(root = page_num, nested = root.parent.is_some(), "installed new btree root");
        Ok(())
    }

    pub fn remove_value(&self, value: &Value) -> Result<i64> {
        let root = Arc::clone(&self.root);
        self.remove_value_in(&root, value)
    }

    /// Removes `value`, returning its pointer.
    pub fn remove_value_in(&self, root: &Arc<BTreeRootInfo>, value: &Value) -> Result<i64> {
        let (leaf_ref, _) = self.descend(root, value)?;
        let mut leaf = leaf_ref.lock().recover_poison();

        let idx = leaf
            .values
            .binary_search(value)
            .map_err(|_| Error::not_found(value.as_bytes()))?;
        leaf.values.remove(idx);
        let ptr = leaf.ptrs.remove(idx);
        self.write_node(&leaf)?;
        drop(leaf);

        self.paged.adjust_record_count(-1);
        Ok(ptr)
    }

    pub fn find_value(&self, value: &Value) -> Result<i64> {
        self.find_value_in(&self.root, value)
    }

    pub fn find_value_in(&self, root: &BTreeRootInfo, value: &Value) -> Result<i64> {
        let (leaf_ref, _) = self.descend(root, value)?;
        let leaf = leaf_ref.lock().recover_poison();

        match leaf.values.binary_search(value) {
            Ok(idx) => Ok(leaf.ptrs[idx]),
            Err(_) => Err(Error::not_found(value.as_bytes())),
        }
    }

    /// Creates an empty nested tree stored under `name` in `parent`.
    pub fn create_btree_root(&self, parent: &Arc<BTreeRootInfo>, name: &Value) -> Result<Arc<BTreeRootInfo>> {
        match self.find_value_in(parent, name) {
            Ok(_) => {
                return Err(Error::BTree {
                    fault: FaultCode::CannotCreate,
                    message: format!("nested tree {:?} already exists", name),
                })
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let leaf = self.create_node(NodeType::Leaf)?;
        let page_num = {
            let node = leaf.lock().recover_poison();
            self.write_node(&node)?;
            node.page_num
        };
        self.add_value_in(parent, name, page_num as i64)?;

        Ok(self.register_root(parent, name, page_num))
    }

    /// Looks up the nested tree stored under `name` in `parent`.
    pub fn find_btree_root(&self, parent: &Arc<BTreeRootInfo>, name: &Value) -> Result<Arc<BTreeRootInfo>> {
        let ptr = self.find_value_in(parent, name)?;
        if ptr < 0 {
            return Err(Error::corrupt("btree", parent.page(), format!("nested tree {:?} has no root", name)));
        }
        Ok(self.register_root(parent, name, ptr as PageNum))
    }

    // Every handle on one nested tree shares a single `BTreeRootInfo`, so a
    // root change made through one is seen by all. The parent's pointer is
    // authoritative: an entry rooted elsewhere belongs to a removed tree.
    fn register_root(&self, parent: &Arc<BTreeRootInfo>, name: &Value, page_num: PageNum) -> Arc<BTreeRootInfo> {
        let mut key = parent.name_path();
        key.push(name.clone());

        let mut nested = self.nested.lock().recover_poison();
        if let Some(existing) = nested.get(&key).and_then(Weak::upgrade) {
            if existing.page() == page_num {
                return existing;
            }
        }

        let info = Arc::new(BTreeRootInfo {
            parent: Some(Arc::clone(parent)),
            name: Some(name.clone()),
            page: AtomicU64::new(page_num),
        });
        nested.retain(|_, weak| weak.strong_count() > 0);
        nested.insert(key, Arc::downgrade(&info));
        info
    }

    /// Runs `query` over the top-level tree. `None` visits every entry.
    pub fn query<C>(&self, query: Option<&IndexQuery>, callback: &mut C) -> Result<()>
    where
        C: BTreeCallback + ?Sized,
    {
        self.query_in(&self.root, query, callback)
    }

    pub fn query_in<C>(&self, root: &BTreeRootInfo, query: Option<&IndexQuery>, callback: &mut C) -> Result<()>
    where
        C: BTreeCallback + ?Sized,
    {
        let query = query.filter(|q| q.operator() != Operator::Any);
        self.query_node(root.page(), query, callback, 0).map(|_| ())
    }

    // Returns false once the callback asks to stop.
    fn query_node<C>(&self, page_num: PageNum, query: Option<&IndexQuery>, callback: &mut C, depth: usize) -> Result<bool>
    where
        C: BTreeCallback + ?Sized,
    {
        if depth > MAX_TREE_DEPTH {
            return Err(Error::corrupt("btree", page_num, "tree deeper than the depth limit"));
        }

        let (node_type, values, ptrs) = {
            let node = self.get_node(page_num)?;
            let guard = node.lock().recover_poison();
            (guard.node_type, guard.values.clone(), guard.ptrs.clone())
        };

        match node_type {
            NodeType::Branch => {
                let children = match query {
                    Some(query) => route(query, &values),
                    None => (0..ptrs.len()).collect(),
                };
                for idx in children {
                    let child = match ptrs.get(idx) {
                        Some(&child) if child >= 0 => child as PageNum,
                        _ => return Err(Error::corrupt("btree", page_num, format!("branch has no child {}", idx))),
                    };
                    if !self.query_node(child, query, callback, depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            NodeType::Leaf => {
                let start = query
                    .and_then(IndexQuery::lower_bound)
                    .map_or(0, |lower| values.partition_point(|v| v < lower));

                for (value, &ptr) in values.iter().zip(&ptrs).skip(start) {
                    if let Some(query) = query {
                        if query.past_upper(value) {
                            break;
                        }
                        if !query.test_value(value) {
                            continue;
                        }
                    }
                    if !callback.index_info(value, ptr) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    pub fn count(&self) -> Result<u64> {
        let mut count = 0;
        self.query(None, &mut |_: &Value, _: i64| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    /// Every entry of the top-level tree in ascending order.
    pub fn entries(&self) -> Result<Vec<(Value, i64)>> {
        self.entries_in(&self.root)
    }

    pub fn entries_in(&self, root: &BTreeRootInfo) -> Result<Vec<(Value, i64)>> {
        let mut entries = Vec::new();
        self.query_in(root, None, &mut |value: &Value, ptr: i64| {
            entries.push((value.clone(), ptr));
            true
        })?;
        Ok(entries)
    }

    /// Snapshot of the node stored at `page_num`.
    pub fn node(&self, page_num: PageNum) -> Result<BTreeNode> {
        let node = self.get_node(page_num)?;
        let guard = node.lock().recover_poison();
        Ok(guard.clone())
    }

    /// Walks the whole tree below `root` checking value order, pointer counts,
    /// separator bounds and that every leaf sits at the same depth.
    pub fn check_integrity(&self, root: &BTreeRootInfo) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        let mut leaf_depth = None;
        self.check_node(root.page(), None, None, 1, &mut leaf_depth, &mut stats)?;
        stats.depth = leaf_depth.unwrap_or(0);
        Ok(stats)
    }

    fn check_node(
        &self,
        page_num: PageNum,
        lower: Option<&Value>,
        upper: Option<&Value>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        stats: &mut TreeStats,
    ) -> Result<()> {
        if depth > MAX_TREE_DEPTH {
            return Err(Error::corrupt("btree", page_num, "tree deeper than the depth limit"));
        }
        let node = self.node(page_num)?;
        stats.nodes += 1;

        let expected_ptrs = match node.node_type {
            NodeType::Leaf => node.values.len(),
            NodeType::Branch => node.values.len() + 1,
        };
        if node.ptrs.len() != expected_ptrs {
            return Err(Error::corrupt(
                "btree",
                page_num,
                format!("{} values but {} pointers", node.values.len(), node.ptrs.len()),
            ));
        }
        if node.values.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::corrupt("btree", page_num, "values out of order"));
        }
        if let (Some(lower), Some(first)) = (lower, node.values.first()) {
            if first < lower {
                return Err(Error::corrupt("btree", page_num, "value below the parent separator"));
            }
        }
        if let (Some(upper), Some(last)) = (upper, node.values.last()) {
            if last >= upper {
                return Err(Error::corrupt("btree", page_num, "value at or above the parent separator"));
            }
        }

        match node.node_type {
            NodeType::Leaf => {
                stats.leaves += 1;
                stats.values += node.values.len();
                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(Error::corrupt(
                            "btree",
                            page_num,
                            format!("leaf at depth {} but others at {}", depth, expected),
                        ));
                    }
                    Some(_) => {}
                }
            }
            NodeType::Branch => {
                for (idx, &child) in node.ptrs.iter().enumerate() {
                    if child < 0 {
                        return Err(Error::corrupt("btree", page_num, format!("branch child {} is unset", idx)));
                    }
                    let child_lower = if idx == 0 { lower } else { node.values.get(idx - 1) };
                    let child_upper = node.values.get(idx).or(upper);
                    self.check_node(child as PageNum, child_lower, child_upper, depth + 1, leaf_depth, stats)?;
                }
            }
        }
        Ok(())
    }
}

/// Children of a branch that can hold matches for `query`, in ascending order.
fn route(query: &IndexQuery, values: &[Value]) -> Vec<usize> {
    let last = values.len();
    let child = |value: &Value| match values.binary_search(value) {
        Ok(idx) => idx + 1,
        Err(idx) => idx,
    };
    let args = query.values();

    match query.operator() {
        Operator::Eq => vec![child(&args[0])],
        Operator::Lt | Operator::Leq => (0..=child(&args[0])).collect(),
        Operator::Gt | Operator::Geq => (child(&args[0])..=last).collect(),
        Operator::Bw | Operator::Bwx | Operator::In => {
            (child(&args[0])..=child(&args[args.len() - 1])).collect()
        }
        Operator::Sw => {
            let end = query.prefix_end().map_or(last, child);
            (child(&args[0])..=end).collect()
        }
        Operator::Nbw | Operator::Nbwx => {
            let left = child(&args[0]);
            let right = child(&args[1]).max(left + 1);
            (0..=left).chain(right..=last).collect()
        }
        Operator::Nsw => {
            let left = child(&args[0]);
            match query.prefix_end() {
                Some(end) => {
                    let right = child(end).max(left + 1);
                    (0..=left).chain(right..=last).collect()
                }
                None => (0..=left).collect(),
            }
        }
        Operator::Neq | Operator::Nin | Operator::Any => (0..=last).collect(),
    }
}
