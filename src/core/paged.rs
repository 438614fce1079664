use crate::core::constants::*;
use crate::core::descriptor_pool::DescriptorPool;
use crate::core::errors::*;
use crate::core::header::{FileHeader, PageHeader, PageStatus};
use crate::core::lru_cache::LRUCache;
use crate::core::metrics::{Metrics, MetricsSnapshot};
use crate::core::options::PagedOptions;
use crate::core::page::Page;
use crate::core::value::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

/// Geometry fixed for as long as the file stays open.
#[derive(Debug, Clone, Copy)]
struct PageLayout {
    header_size: u16,
    page_size: usize,
    page_header_size: usize,
}

impl PageLayout {
    fn from_header(header: &FileHeader) -> Self {
        Self {
            header_size: header.header_size,
            page_size: header.page_size as usize,
            page_header_size: header.page_header_size as usize,
        }
    }

    fn page_offset(&self, page_num: PageNum) -> u64 {
        self.header_size as u64 + page_num * self.page_size as u64
    }

    fn work_size(&self) -> usize {
        self.page_size - self.page_header_size
    }
}

fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> Result<()> {
    let end = offset + bytes.len() as u64;
    if file.metadata()?.len() < end {
        file.set_len(end)?;
    }
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    Ok(())
}

/// Fixed-size page file with a free-page list and multi-page values.
///
/// Lock order: file header, then the dirty map, then the read cache, then
/// individual pages. No page lock is held while calling back into `Paged`.
pub struct Paged {
    path: PathBuf,
    options: PagedOptions,
    header: Mutex<FileHeader>,
    layout: RwLock<PageLayout>,
    descriptors: DescriptorPool,
    dirty: Mutex<HashMap<PageNum, Arc<Page>>>,
    cache: LRUCache<Arc<Page>>,
    lock_file: Mutex<Option<File>>,
    opened: AtomicBool,
    metrics: Arc<Metrics>,
    #[cfg(test)]
    fail_flush_of: Mutex<Option<PageNum>>,
}

impl Paged {
    pub fn new(path: impl AsRef<Path>, options: PagedOptions) -> Result<Self> {
        let path = path.as_ref();

        if path.as_os_str().is_empty() {
            return Err(Error::InvalidPath("page file path cannot be empty".to_string()));
        }

        if path.components().any(|c| c == Component::ParentDir) {
            return Err(Error::InvalidPath(format!(
                "page file path cannot contain '..': {}",
                path.display()
            )));
        }

        options.validate()?;

        let header = FileHeader::new(&options);
        let layout = PageLayout::from_header(&header);

        Ok(Self {
            path: path.to_path_buf(),
            descriptors: DescriptorPool::new(path, options.max_descriptors, options.descriptor_timeout),
            cache: LRUCache::new(options.cache_size),
            header: Mutex::new(header),
            layout: RwLock::new(layout),
            dirty: Mutex::new(HashMap::new()),
            lock_file: Mutex::new(None),
            opened: AtomicBool::new(false),
            metrics: Arc::new(Metrics::new()),
            #[cfg(test)]
            fail_flush_of: Mutex::new(None),
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &PagedOptions {
        &self.options
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    fn check_opened(&self) -> Result<()> {
        if self.is_opened() {
            Ok(())
        } else {
            Err(Error::FileClosed)
        }
    }

    fn header_lock(&self) -> MutexGuard<'_, FileHeader> {
        self.header.lock().recover_poison()
    }

    fn layout(&self) -> PageLayout {
        *self.layout.read().recover_poison()
    }

    /// Creates (or truncates) the file and writes a fresh header.
    pub fn create(&self) -> Result<()> {
        if self.is_opened() {
            return Err(Error::Filer {
                fault: FaultCode::CannotCreate,
                message: format!("{} is already open", self.path.display()),
            });
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        fs2::FileExt::try_lock_exclusive(&file)?;
        file.set_len(0)?;

        let mut header = FileHeader::new(&self.options);
        write_at(&mut file, 0, &header.serialize())?;
        file.sync_all()?;
        header.dirty = false;

        self.install(file, header);
        debug!(path = %self.path.display(), "created page file");
        Ok(())
    }

    /// Opens an existing file. Returns `false` when there is nothing to open.
    pub fn open(&self) -> Result<bool> {
        if self.is_opened() {
            return Ok(true);
        }

        if !self.exists() {
            return Ok(false);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        fs2::FileExt::try_lock_exclusive(&file)?;

        let mut buf = vec![0u8; FILE_HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf).map_err(|e| Error::DataCorruption {
            details: format!("file header unreadable: {}", e),
        })?;
        let header = FileHeader::deserialize(&buf)?;

        debug!(
            path = %self.path.display(),
            page_size = header.page_size,
            total_count = header.total_count,
            "opened page file"
        );
        self.install(file, header);
        Ok(true)
    }

    fn install(&self, lock_file: File, header: FileHeader) {
        *self.layout.write().recover_poison() = PageLayout::from_header(&header);
        *self.header_lock() = header;
        self.dirty.lock().recover_poison().clear();
        self.cache.clear();
        *self.lock_file.lock().recover_poison() = Some(lock_file);
        self.descriptors.reopen();
        self.opened.store(true, Ordering::Release);
    }

    /// Flushes and releases the file. Resources are released even when the
    /// flush fails; the flush error is returned afterwards.
    pub fn close(&self) -> Result<()> {
        if !self.is_opened() {
            return Ok(());
        }

        let flushed = self.flush();

        self.opened.store(false, Ordering::Release);
        self.descriptors
            .close(self.options.close_wait_attempts, self.options.close_wait_interval);
        if let Some(file) = self.lock_file.lock().recover_poison().take() {
            let _ = fs2::FileExt::unlock(&file);
        }
        self.dirty.lock().recover_poison().clear();
        self.cache.clear();

        debug!(path = %self.path.display(), "closed page file");
        flushed
    }

    /// Closes and deletes the file. Returns whether a file was removed.
    pub fn drop_file(&self) -> Result<bool> {
        self.close()?;
        if !self.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)?;
        debug!(path = %self.path.display(), "dropped page file");
        Ok(true)
    }

    /// Returns the resident page object for `page_num`, loading it on first
    /// touch.
    pub fn get_page(&self, page_num: PageNum) -> Result<Arc<Page>> {
        self.check_opened()?;

        let dirty = self.dirty.lock().recover_poison();
        if let Some(page) = dirty.get(&page_num) {
            self.metrics.cache_hit();
            return Ok(Arc::clone(page));
        }

        let mut loaded = false;
        let page = self.cache.get_or_try_insert_with(page_num, || {
            loaded = true;
            self.load_page(page_num).map(Arc::new)
        })?;
        drop(dirty);

        if loaded {
            self.metrics.cache_miss();
        } else {
            self.metrics.cache_hit();
        }
        Ok(page)
    }

    fn load_page(&self, page_num: PageNum) -> Result<Page> {
        let layout = self.layout();
        let offset = layout.page_offset(page_num);
        let mut data = vec![0u8; layout.page_size];

        {
            let mut file = self.descriptors.get()?;
            // Pages past the end of the file have never been written.
            if offset < file.metadata()?.len() {
                file.seek(SeekFrom::Start(offset))?;
                let mut filled = 0;
                while filled < data.len() {
                    let n = file.read(&mut data[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
            }
        }

        let header = PageHeader::read_from(page_num, &data, layout.work_size())?;
        Ok(Page::new(page_num, header, data, layout.page_header_size))
    }

    fn mark_dirty(&self, page: &Arc<Page>) -> usize {
        let mut dirty = self.dirty.lock().recover_poison();
        dirty
            .entry(page.page_num())
            .or_insert_with(|| Arc::clone(page));
        dirty.len()
    }

    fn maybe_flush(&self) -> Result<()> {
        let pending = self.dirty.lock().recover_poison().len();
        if pending > self.options.max_dirty_pages {
            debug!(pending, "dirty page threshold exceeded, flushing");
            self.flush()?;
        }
        Ok(())
    }

    /// Schedules the page for write-back. The caller must not hold the
    /// page's lock.
    pub fn write_page(&self, page: &Arc<Page>) -> Result<()> {
        self.check_opened()?;
        self.mark_dirty(page);
        self.maybe_flush()
    }

    /// Hands out a page for reuse: the head of the free list if there is one,
    /// otherwise a brand-new page at the end of the file.
    pub fn get_free_page(&self) -> Result<Arc<Page>> {
        self.check_opened()?;

        let page = {
            let mut header = self.header_lock();
            match header.first_free_page {
                Some(free) => {
                    let page = self.get_page(free)?;
                    let next = page.next_page();
                    header.first_free_page = next;
                    if next.is_none() {
                        header.last_free_page = None;
                    }
                    header.mark_dirty();
                    self.metrics.page_reused();
                    page
                }
                None => {
                    let page_num = header.total_count;
                    header.total_count += 1;
                    header.mark_dirty();
                    self.metrics.page_allocated();
                    self.get_page(page_num)?
                }
            }
        };

        page.lock().reset();
        Ok(page)
    }

    /// Releases a page and every page chained behind it.
    ///
    /// A primary-space page is only marked DELETED; its chain, and any page
    /// outside primary space, is appended to the tail of the free list.
    pub fn unlink_pages(&self, page: &Arc<Page>) -> Result<()> {
        self.check_opened()?;

        let primary = self.header_lock().page_count;
        let mut first = Arc::clone(page);

        if page.page_num() < primary {
            let next = {
                let mut state = page.lock();
                state.header.status = PageStatus::Deleted;
                state.header.next_page.take()
            };
            self.mark_dirty(page);

            match next {
                Some(next) => first = self.get_page(next)?,
                None => return self.maybe_flush(),
            }
        }

        let first_num = first.page_num();
        let limit = self.total_count();
        let mut freed = 0u64;
        let mut current = first;

        loop {
            freed += 1;
            if freed > limit {
                return Err(Error::corrupt(
                    "paged",
                    first_num,
                    "page chain cycle detected while unlinking",
                ));
            }

            let next = {
                let mut state = current.lock();
                state.header.status = PageStatus::Deleted;
                state.header.next_page
            };
            self.mark_dirty(&current);

            match next {
                Some(next) => current = self.get_page(next)?,
                None => break,
            }
        }

        let last_num = current.page_num();
        {
            let mut header = self.header_lock();
            if let Some(tail) = header.last_free_page {
                let tail_page = self.get_page(tail)?;
                tail_page.lock().header.next_page = Some(first_num);
                self.mark_dirty(&tail_page);
            }
            if header.first_free_page.is_none() {
                header.first_free_page = Some(first_num);
            }
            header.last_free_page = Some(last_num);
            header.mark_dirty();
        }

        self.metrics.pages_freed(freed);
        debug!(first = first_num, last = last_num, freed, "pages added to free list");
        self.maybe_flush()
    }

    /// Reads the full value stored at `page`, following its overflow chain.
    pub fn read_value(&self, page: &Arc<Page>) -> Result<Value> {
        self.check_opened()?;

        let limit = self.total_count();
        let (record_len, mut next, mut out) = {
            let state = page.lock();
            let record_len = state.header.record_len as usize;
            let mut out = Vec::with_capacity(record_len);
            state.stream_to(&mut out);
            (record_len, state.header.next_page, out)
        };

        let mut hops = 0u64;
        while let Some(page_num) = next {
            hops += 1;
            if hops > limit {
                return Err(Error::corrupt(
                    "paged",
                    page.page_num(),
                    "overflow chain cycle detected",
                ));
            }

            let overflow = self.get_page(page_num)?;
            let state = overflow.lock();
            if state.header.status != PageStatus::Overflow {
                return Err(Error::corrupt(
                    "paged",
                    page_num,
                    format!("expected an overflow page, found {:?}", state.header.status),
                ));
            }
            state.stream_to(&mut out);
            next = state.header.next_page;
        }

        if out.len() != record_len {
            return Err(Error::corrupt(
                "paged",
                page.page_num(),
                format!("record length {} but chain holds {} bytes", record_len, out.len()),
            ));
        }

        Ok(Value::from(out))
    }

    /// Stores `value` starting at `page`, reusing the page's existing overflow
    /// chain where possible, extending it when the value grew and freeing the
    /// unused tail when it shrank.
    pub fn write_value(&self, page: &Arc<Page>, value: &Value) -> Result<()> {
        self.check_opened()?;

        let bytes = value.as_bytes();
        if bytes.len() > i32::MAX as usize {
            return Err(Error::Filer {
                fault: FaultCode::CannotWrite,
                message: format!("value of {} bytes is too large", bytes.len()),
            });
        }

        let mut written = {
            let mut state = page.lock();
            state.header.record_len = bytes.len() as i32;
            state.stream_from(bytes)
        };

        let mut current = Arc::clone(page);
        let mut hops = 0u64;

        while written < bytes.len() {
            hops += 1;
            if hops > self.total_count() {
                return Err(Error::corrupt(
                    "paged",
                    page.page_num(),
                    "overflow chain cycle detected while writing",
                ));
            }

            let overflow = match current.next_page() {
                Some(next) => self.get_page(next)?,
                None => {
                    let fresh = self.get_free_page()?;
                    current.lock().header.next_page = Some(fresh.page_num());
                    fresh
                }
            };

            {
                let mut state = overflow.lock();
                state.header.status = PageStatus::Overflow;
                state.header.record_len = 0;
                written += state.stream_from(&bytes[written..]);
            }

            self.mark_dirty(&current);
            current = overflow;
        }

        let stale = current.lock().header.next_page.take();
        self.mark_dirty(&current);

        if let Some(stale) = stale {
            let stale_page = self.get_page(stale)?;
            self.unlink_pages(&stale_page)?;
        }

        self.maybe_flush()
    }

    /// Writes every dirty page and, if it changed, the file header.
    ///
    /// A failing page does not stop the others from being written; the first
    /// failure is reported once all of them have been attempted.
    pub fn flush(&self) -> Result<()> {
        self.check_opened()?;

        // Header and dirty set are taken before the descriptor; allocation
        // holds the header lock while it waits for one.
        let header_bytes = {
            let mut header = self.header_lock();
            if header.dirty {
                header.dirty = false;
                Some(header.serialize())
            } else {
                None
            }
        };

        let mut pages: Vec<Arc<Page>> = {
            let mut dirty = self.dirty.lock().recover_poison();
            dirty.drain().map(|(_, page)| page).collect()
        };
        pages.sort_unstable_by_key(|page| page.page_num());

        let mut file = match self.descriptors.get() {
            Ok(file) => file,
            Err(err) => {
                self.restore_dirty(pages, header_bytes.is_some());
                return Err(err);
            }
        };

        let layout = self.layout();
        let mut failures = 0u64;
        let mut first_error: Option<Error> = None;

        for page in &pages {
            if let Err(err) = self.flush_page(&mut file, &layout, page) {
                warn!(page_num = page.page_num(), error = %err, "failed to flush page");
                failures += 1;
                first_error.get_or_insert(err);
            }
        }

        if let Some(bytes) = &header_bytes {
            if let Err(err) = write_at(&mut file, 0, bytes) {
                warn!(error = %err, "failed to flush file header");
                self.header_lock().mark_dirty();
                failures += 1;
                first_error.get_or_insert(err);
            }
        }

        if self.options.sync_on_flush && (!pages.is_empty() || header_bytes.is_some()) {
            if let Err(err) = file.sync_data() {
                failures += 1;
                first_error.get_or_insert(err.into());
            }
        }
        drop(file);

        let written = (pages.len() as u64).saturating_sub(failures);
        self.metrics.flush_completed(written, failures);
        debug!(pages = pages.len(), failures, "flushed page file");

        match first_error {
            None => Ok(()),
            Some(err) => Err(Error::Filer {
                fault: FaultCode::GenericCritical,
                message: format!("{} write(s) failed during flush, first: {}", failures, err),
            }),
        }
    }

    fn flush_page(&self, file: &mut File, layout: &PageLayout, page: &Page) -> Result<()> {
        #[cfg(test)]
        {
            if *self.fail_flush_of.lock().recover_poison() == Some(page.page_num()) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "simulated write failure").into());
            }
        }
        write_at(file, layout.page_offset(page.page_num()), &page.to_bytes())
    }

    // Puts back work a flush could not start on.
    fn restore_dirty(&self, pages: Vec<Arc<Page>>, header_dirty: bool) {
        if header_dirty {
            self.header_lock().mark_dirty();
        }
        let mut dirty = self.dirty.lock().recover_poison();
        for page in pages {
            dirty.entry(page.page_num()).or_insert(page);
        }
    }

    pub fn file_header(&self) -> FileHeader {
        self.header_lock().clone()
    }

    pub fn total_count(&self) -> u64 {
        self.header_lock().total_count
    }

    pub fn work_size(&self) -> usize {
        self.layout().work_size()
    }

    pub fn max_key_size(&self) -> usize {
        self.header_lock().max_key_size as usize
    }

    pub fn root_page(&self) -> Option<PageNum> {
        self.header_lock().root_page
    }

    pub fn set_root_page(&self, page_num: PageNum) {
        let mut header = self.header_lock();
        header.root_page = Some(page_num);
        header.mark_dirty();
    }

    pub fn record_count(&self) -> u64 {
        self.header_lock().record_count
    }

    pub(crate) fn adjust_record_count(&self, delta: i64) {
        let mut header = self.header_lock();
        header.record_count = header.record_count.saturating_add_signed(delta);
        header.mark_dirty();
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().recover_poison().len()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    pub fn open_descriptors(&self) -> usize {
        self.descriptors.open_count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn metrics_handle(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl Drop for Paged {
    fn drop(&mut self) {
        if self.is_opened() {
            if let Err(err) = self.close() {
                warn!(path = %self.path.display(), error = %err, "failed to close page file on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Key;
    use tempfile::TempDir;

    fn small_options() -> PagedOptions {
        PagedOptions {
            page_size: 256,
            page_count: 4,
            file_header_size: 128,
            page_header_size: 32,
            max_key_size: 32,
            ..PagedOptions::default()
        }
    }

    fn create(dir: &TempDir, opts: PagedOptions) -> Paged {
        let paged = Paged::new(dir.path().join("test.pg"), opts).unwrap();
        paged.create().unwrap();
        paged
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let paged = Paged::new(dir.path().join("missing.pg"), small_options()).unwrap();
        assert!(!paged.open().unwrap());
        assert!(!paged.is_opened());
        assert!(matches!(paged.get_page(0), Err(Error::FileClosed)));
    }

    #[test]
    fn test_rejects_bad_paths() {
        assert!(matches!(
            Paged::new("", PagedOptions::default()),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            Paged::new("/tmp/../etc/pg", PagedOptions::default()),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_create_writes_header() {
        let dir = TempDir::new().unwrap();
        let paged = create(&dir, small_options());

        let header = paged.file_header();
        assert_eq!(header.page_size, 256);
        assert_eq!(header.total_count, 4);
        assert_eq!(header.first_free_page, None);
        assert_eq!(paged.work_size(), 256 - 32);

        let len = fs::metadata(paged.path()).unwrap().len();
        assert_eq!(len, FILE_HEADER_LEN as u64);
    }

    #[test]
    fn test_page_identity() {
        let dir = TempDir::new().unwrap();
        let paged = create(&dir, small_options());

        let a = paged.get_page(2).unwrap();
        let b = paged.get_page(2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.lock().header.status = PageStatus::Leaf;
        assert_eq!(b.status(), PageStatus::Leaf);
    }

    #[test]
    fn test_free_page_grows_then_reuses() {
        let dir = TempDir::new().unwrap();
        let paged = create(&dir, small_options());

        let p1 = paged.get_free_page().unwrap();
        let p2 = paged.get_free_page().unwrap();
        assert_eq!(p1.page_num(), 4);
        assert_eq!(p2.page_num(), 5);
        assert_eq!(paged.total_count(), 6);

        paged.unlink_pages(&p1).unwrap();
        let header = paged.file_header();
        assert_eq!(header.first_free_page, Some(4));
        assert_eq!(header.last_free_page, Some(4));
        assert_eq!(p1.status(), PageStatus::Deleted);

        let reused = paged.get_free_page().unwrap();
        assert_eq!(reused.page_num(), 4);
        assert_eq!(reused.status(), PageStatus::Unused);
        assert_eq!(reused.next_page(), None);

        let header = paged.file_header();
        assert_eq!(header.first_free_page, None);
        assert_eq!(header.last_free_page, None);
        assert_eq!(paged.total_count(), 6);
    }

    #[test]
    fn test_unlink_primary_page_keeps_it_off_free_list() {
        let dir = TempDir::new().unwrap();
        let paged = create(&dir, small_options());

        let primary = paged.get_page(1).unwrap();
        paged.write_value(&primary, &Value::from(vec![5u8; 600])).unwrap();
        let chain_head = primary.next_page().unwrap();

        paged.unlink_pages(&primary).unwrap();
        assert_eq!(primary.status(), PageStatus::Deleted);
        assert_eq!(primary.next_page(), None);

        let header = paged.file_header();
        assert_eq!(header.first_free_page, Some(chain_head));
        assert_ne!(header.last_free_page, Some(1));
    }

    #[test]
    fn test_free_list_appends_at_tail() {
        let dir = TempDir::new().unwrap();
        let paged = create(&dir, small_options());

        let a = paged.get_free_page().unwrap();
        let b = paged.get_free_page().unwrap();
        paged.unlink_pages(&a).unwrap();
        paged.unlink_pages(&b).unwrap();

        let header = paged.file_header();
        assert_eq!(header.first_free_page, Some(a.page_num()));
        assert_eq!(header.last_free_page, Some(b.page_num()));
        assert_eq!(a.next_page(), Some(b.page_num()));

        assert_eq!(paged.get_free_page().unwrap().page_num(), a.page_num());
        assert_eq!(paged.get_free_page().unwrap().page_num(), b.page_num());
    }

    #[test]
    fn test_overflow_round_trip_and_shrink() {
        let dir = TempDir::new().unwrap();
        let paged = create(&dir, small_options());

        let page = paged.get_free_page().unwrap();
        let big: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        paged.write_value(&page, &Value::from(big.clone())).unwrap();

        assert_eq!(page.header().record_len, 1000);
        assert_eq!(paged.read_value(&page).unwrap().as_bytes(), &big[..]);
        // 224 bytes per page: primary + 4 overflow pages
        assert_eq!(paged.total_count(), 4 + 5);

        paged.write_value(&page, &Value::from("tiny")).unwrap();
        assert_eq!(paged.read_value(&page).unwrap(), Value::from("tiny"));
        assert_eq!(page.next_page(), None);

        let header = paged.file_header();
        assert!(header.first_free_page.is_some());

        // The next allocation reuses a freed overflow page instead of growing.
        let total = paged.total_count();
        let reused = paged.get_free_page().unwrap();
        assert!(reused.page_num() < total);
        assert_eq!(paged.total_count(), total);
    }

    #[test]
    fn test_rewrite_reuses_existing_chain() {
        let dir = TempDir::new().unwrap();
        let paged = create(&dir, small_options());

        let page = paged.get_free_page().unwrap();
        paged.write_value(&page, &Value::from(vec![1u8; 700])).unwrap();
        let total = paged.total_count();
        let first_overflow = page.next_page();

        paged.write_value(&page, &Value::from(vec![2u8; 650])).unwrap();
        assert_eq!(paged.total_count(), total);
        assert_eq!(page.next_page(), first_overflow);
        assert_eq!(paged.read_value(&page).unwrap(), Value::from(vec![2u8; 650]));
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reopen.pg");
        let big = Value::from(vec![9u8; 900]);

        let page_num = {
            let paged = Paged::new(&path, small_options()).unwrap();
            paged.create().unwrap();
            let page = paged.get_free_page().unwrap();
            page.set_key(&Key::from("k1")).unwrap();
            paged.write_value(&page, &big).unwrap();
            paged.close().unwrap();
            page.page_num()
        };

        let paged = Paged::new(&path, PagedOptions::default()).unwrap();
        assert!(paged.open().unwrap());
        assert_eq!(paged.work_size(), 224);

        let page = paged.get_page(page_num).unwrap();
        assert_eq!(page.key(), Some(Key::from("k1")));
        assert_eq!(paged.read_value(&page).unwrap(), big);
    }

    #[test]
    fn test_dirty_threshold_triggers_flush() {
        let dir = TempDir::new().unwrap();
        let opts = PagedOptions {
            max_dirty_pages: 3,
            ..small_options()
        };
        let paged = create(&dir, opts);

        for _ in 0..3 {
            let page = paged.get_free_page().unwrap();
            paged.write_value(&page, &Value::from("x")).unwrap();
        }
        assert_eq!(paged.dirty_count(), 3);

        let page = paged.get_free_page().unwrap();
        paged.write_page(&page).unwrap();
        assert_eq!(paged.dirty_count(), 0);
        assert_eq!(paged.metrics().flushes, 1);
    }

    #[test]
    fn test_flush_writes_remaining_pages_after_a_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pg");
        let opts = PagedOptions {
            max_dirty_pages: 64,
            ..small_options()
        };
        let paged = create(&dir, opts.clone());

        let mut pages = Vec::new();
        for i in 0..4u8 {
            let page = paged.get_free_page().unwrap();
            paged.write_value(&page, &Value::from(vec![i + 1; 40])).unwrap();
            pages.push(page.page_num());
        }
        assert_eq!(paged.dirty_count(), 4);

        let failing = pages[1];
        *paged.fail_flush_of.lock().unwrap() = Some(failing);

        match paged.flush() {
            Err(Error::Filer { fault, .. }) => assert_eq!(fault, FaultCode::GenericCritical),
            other => panic!("expected a critical filer error, got {:?}", other),
        }
        assert_eq!(paged.metrics().flush_errors, 1);
        assert_eq!(paged.dirty_count(), 0);

        *paged.fail_flush_of.lock().unwrap() = None;
        paged.close().unwrap();

        let reopened = Paged::new(&path, opts).unwrap();
        assert!(reopened.open().unwrap());
        for (i, &page_num) in pages.iter().enumerate() {
            let page = reopened.get_page(page_num).unwrap();
            if page_num == failing {
                assert_eq!(page.status(), PageStatus::Unused);
            } else {
                assert_eq!(reopened.read_value(&page).unwrap().as_bytes(), &vec![i as u8 + 1; 40][..]);
            }
        }
    }

    #[test]
    fn test_read_detects_cycle() {
        let dir = TempDir::new().unwrap();
        let paged = create(&dir, small_options());

        let page = paged.get_free_page().unwrap();
        paged.write_value(&page, &Value::from(vec![3u8; 600])).unwrap();
        let second = paged.get_page(page.next_page().unwrap()).unwrap();
        let third = paged.get_page(second.next_page().unwrap()).unwrap();
        third.lock().header.next_page = Some(second.page_num());

        let err = paged.read_value(&page).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_second_handle_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.pg");
        let first = Paged::new(&path, small_options()).unwrap();
        first.create().unwrap();

        let second = Paged::new(&path, small_options()).unwrap();
        assert!(second.open().is_err());

        first.close().unwrap();
        assert!(second.open().unwrap());
    }

    #[test]
    fn test_drop_file_removes_it() {
        let dir = TempDir::new().unwrap();
        let paged = create(&dir, small_options());
        let page = paged.get_free_page().unwrap();
        paged.write_value(&page, &Value::from("bye")).unwrap();

        assert!(paged.drop_file().unwrap());
        assert!(!paged.exists());
        assert!(!paged.is_opened());
        assert!(!paged.drop_file().unwrap());
    }

    #[test]
    fn test_close_releases_descriptors() {
        let dir = TempDir::new().unwrap();
        let paged = create(&dir, small_options());
        paged.get_page(3).unwrap();
        assert!(paged.open_descriptors() >= 1);

        paged.close().unwrap();
        assert_eq!(paged.open_descriptors(), 0);
        assert_eq!(paged.cached_count(), 0);
    }
}
