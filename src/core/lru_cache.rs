use crate::core::errors::*;
use crate::core::PageNum;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Entries referenced outside the cache are pinned and never evicted.
pub trait Pinned {
    fn is_pinned(&self) -> bool;
}

impl<T> Pinned for Arc<T> {
    fn is_pinned(&self) -> bool {
        Arc::strong_count(self) > 1
    }
}

struct Node<V> {
    page_num: PageNum,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

struct LRUCacheInner<V> {
    capacity: usize,
    cache: HashMap<PageNum, usize>, // Maps page_num to index in nodes vec
    nodes: Vec<Option<Node<V>>>,    // Node storage
    head: Option<usize>,
    tail: Option<usize>,
    free_list: Vec<usize>,          // Indices of freed nodes
    failed_evictions: usize,        // Counter for consecutive failed evictions
}

impl<V: Clone + Pinned> LRUCacheInner<V> {
    fn new(capacity: usize) -> Self {
        LRUCacheInner {
            capacity,
            cache: HashMap::new(),
            nodes: Vec::new(),
            head: None,
            tail: None,
            free_list: Vec::new(),
            failed_evictions: 0,
        }
    }

    fn allocate_node(&mut self, page_num: PageNum, value: V) -> usize {
        let node = Node {
            page_num,
            value,
            prev: None,
            next: None,
        };

        if let Some(idx) = self.free_list.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev_idx, next_idx) = match &self.nodes[idx] {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        if Some(idx) == self.head {
            self.head = next_idx;
        }
        if Some(idx) == self.tail {
            self.tail = prev_idx;
        }

        if let Some(prev) = prev_idx {
            if let Some(prev_node) = &mut self.nodes[prev] {
                prev_node.next = next_idx;
            }
        }
        if let Some(next) = next_idx {
            if let Some(next_node) = &mut self.nodes[next] {
                next_node.prev = prev_idx;
            }
        }

        if let Some(node) = &mut self.nodes[idx] {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        if let Some(node) = &mut self.nodes[idx] {
            node.prev = None;
            node.next = self.head;
        }

        if let Some(old_head_idx) = self.head {
            if let Some(old_head) = &mut self.nodes[old_head_idx] {
                old_head.prev = Some(idx);
            }
        }

        self.head = Some(idx);

        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if Some(idx) == self.head {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove_node(&mut self, idx: usize) -> Option<V> {
        self.unlink(idx);
        let node = self.nodes[idx].take();
        self.free_list.push(idx);
        node.map(|n| n.value)
    }

    fn get(&mut self, page_num: PageNum) -> Option<V> {
        let idx = *self.cache.get(&page_num)?;
        self.move_to_front(idx);
        self.nodes[idx].as_ref().map(|node| node.value.clone())
    }

    fn put(&mut self, page_num: PageNum, value: V) {
        if let Some(&idx) = self.cache.get(&page_num) {
            self.move_to_front(idx);
            if let Some(node) = &mut self.nodes[idx] {
                node.value = value;
            }
            return;
        }

        let idx = self.allocate_node(page_num, value);
        self.cache.insert(page_num, idx);
        self.push_front(idx);

        while self.cache.len() > self.capacity {
            if !self.evict() {
                break;
            }
        }
    }

    // Walks from the tail and drops the least recently used unpinned entry.
    fn evict(&mut self) -> bool {
        let mut current = self.tail;

        while let Some(idx) = current {
            let (page_num, prev, pinned) = match &self.nodes[idx] {
                Some(node) => (node.page_num, node.prev, node.value.is_pinned()),
                None => break,
            };

            if !pinned {
                self.cache.remove(&page_num);
                self.remove_node(idx);
                self.failed_evictions = 0;
                return true;
            }

            current = prev;
        }

        self.failed_evictions += 1;
        false
    }

    fn remove(&mut self, page_num: PageNum) -> Option<V> {
        let idx = self.cache.remove(&page_num)?;
        self.remove_node(idx)
    }

    fn clear(&mut self) {
        self.cache.clear();
        self.nodes.clear();
        self.free_list.clear();
        self.head = None;
        self.tail = None;
        self.failed_evictions = 0;
    }
}

/// Bounded least-recently-used map from page number to a shared object.
///
/// Capacity is a soft limit: when every resident entry is pinned the cache
/// grows past it until a later insertion finds something to evict.
pub struct LRUCache<V> {
    inner: Arc<RwLock<LRUCacheInner<V>>>,
}

impl<V: Clone + Pinned> LRUCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { 1000 } else { capacity };

        Self {
            inner: Arc::new(RwLock::new(LRUCacheInner::new(capacity))),
        }
    }

    pub fn get(&self, page_num: PageNum) -> Option<V> {
        let mut inner = self.inner.write()
            .recover_poison();
        inner.get(page_num)
    }

    pub fn put(&self, page_num: PageNum, value: V) {
        let mut inner = self.inner.write()
            .recover_poison();
        inner.put(page_num, value);
    }

    /// Returns the resident entry, or builds one with `load` and inserts it.
    /// The lock is held across `load`, so concurrent callers for the same
    /// page always end up with the same object.
    pub fn get_or_try_insert_with<F>(&self, page_num: PageNum, load: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut inner = self.inner.write()
            .recover_poison();
        if let Some(value) = inner.get(page_num) {
            return Ok(value);
        }
        let value = load()?;
        inner.put(page_num, value.clone());
        Ok(value)
    }

    pub fn remove(&self, page_num: PageNum) -> Option<V> {
        let mut inner = self.inner.write()
            .recover_poison();
        inner.remove(page_num)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write()
            .recover_poison();
        inner.clear();
    }

    pub fn contains(&self, page_num: PageNum) -> bool {
        let inner = self.inner.read()
            .recover_poison();
        inner.cache.contains_key(&page_num)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read()
            .recover_poison();
        inner.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failed_evictions(&self) -> usize {
        let inner = self.inner.read()
            .recover_poison();
        inner.failed_evictions
    }
}
