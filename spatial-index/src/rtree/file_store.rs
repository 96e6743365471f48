//! Mutable paged file store.
//!
//! Nodes live in fixed-size pages, read lazily one page at a time and kept
//! in an LRU cache with dirty write-back. Freed pages are chained into an
//! on-disk free list and reused before the file grows.

use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::TreeConfig;
use crate::lock::LockManager;

use super::page_store::PageStore;
use super::rtree_cache::PageCache;
use super::rtree_storage::Storage;
use super::rtree_types::{
    Entry, FileHeader, FreePage, Node, NodeId, SpatialError, SpatialResult, StoreMetadata,
    TreeStats,
};

/// Free-list bookkeeping on top of [`Storage`].
pub struct FreeListManager;

impl FreeListManager {
    /// Allocate a page from the free list or append a new one
    pub fn allocate_page(storage: &Storage, header: &mut FileHeader) -> SpatialResult<NodeId> {
        if header.free_list_head != 0 {
            let free_page_id = header.free_list_head;
            let free_page = storage.read_free_page(free_page_id)?;

            header.free_list_head = free_page.next_free;
            header.free_page_count = header.free_page_count.saturating_sub(1);
            Ok(free_page_id)
        } else {
            let page_id = header.next_page_id;
            header.next_page_id = header.next_page_id.saturating_add(1);
            Ok(page_id)
        }
    }

    /// Push a page onto the free list
    pub fn free_page(
        storage: &Storage,
        header: &mut FileHeader,
        page_id: NodeId,
    ) -> SpatialResult<()> {
        let free_page = FreePage {
            next_free: header.free_list_head,
        };

        storage.write_free_page(page_id, &free_page)?;
        header.free_list_head = page_id;
        header.free_page_count = header.free_page_count.saturating_add(1);
        Ok(())
    }
}

/// A [`PageStore`] over a paged index file.
pub struct FilePageStore {
    inner: Arc<FilePageStoreInner>,
}

struct FilePageStoreInner {
    storage: Storage,
    cache: Mutex<PageCache>,
    header: RwLock<FileHeader>,
    stats: StoreStatistics,
    closed: AtomicBool,
    locks: LockManager,
}

/// Internal statistics tracking
#[derive(Default)]
struct StoreStatistics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

impl FilePageStore {
    /// Create a new index file holding an empty leaf root.
    ///
    /// Every record is written in the configured byte order.
    pub fn create(path: impl AsRef<Path>, config: &TreeConfig) -> SpatialResult<Self> {
        let path = path.as_ref();
        let storage = Storage::create(path, config.page_size(), config.byte_order())?;

        let mut header = FileHeader::new(config.page_size() as u32, config.dimension() as u32);
        let root_page = FreeListManager::allocate_page(&storage, &mut header)?;
        header.root_page = root_page;
        header.depth = 1;

        storage.write_page(root_page, &Node::new(root_page, true, config.dimension()))?;
        storage.write_header(&header)?;
        storage.sync()?;

        log::debug!(
            "Created index file {} (page size {}, {:?})",
            path.display(),
            config.page_size(),
            config.byte_order()
        );
        Ok(Self::from_parts(storage, header, config.cache_pages()))
    }

    /// Open an existing index file. Only the header is read.
    ///
    /// The byte order recorded in the file wins over the configured one.
    pub fn open(path: impl AsRef<Path>, config: &TreeConfig) -> SpatialResult<Self> {
        let path = path.as_ref();
        let (storage, header) = Storage::open(path)?;
        if storage.byte_order() != config.byte_order() {
            log::debug!(
                "Index file {} is {:?}, ignoring configured {:?}",
                path.display(),
                storage.byte_order(),
                config.byte_order()
            );
        }

        log::debug!(
            "Opened index file {} ({} entries, depth {})",
            path.display(),
            header.entry_count,
            header.depth
        );
        Ok(Self::from_parts(storage, header, config.cache_pages()))
    }

    fn from_parts(storage: Storage, header: FileHeader, cache_pages: usize) -> Self {
        Self {
            inner: Arc::new(FilePageStoreInner {
                storage,
                cache: Mutex::new(PageCache::new(cache_pages)),
                header: RwLock::new(header),
                stats: StoreStatistics::default(),
                closed: AtomicBool::new(false),
                locks: LockManager::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        self.inner.storage.path()
    }

    /// Number of pages on the free list
    pub fn free_page_count(&self) -> u64 {
        self.inner.header.read().free_page_count
    }

    fn check_open(&self) -> SpatialResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(SpatialError::Closed)
        } else {
            Ok(())
        }
    }

    /// Marks the store unusable after an I/O or corruption failure.
    fn guard<T>(&self, result: SpatialResult<T>) -> SpatialResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.inner.closed.swap(true, Ordering::AcqRel) {
                log::error!(
                    "Index file {} is unusable after failure: {}",
                    self.inner.storage.path().display(),
                    e
                );
                self.inner.storage.close();
            }
        }
        result
    }

    /// Read a node, first from cache, then from disk.
    fn read_node(&self, page_id: NodeId) -> SpatialResult<Node> {
        {
            let mut cache = self.inner.cache.lock();
            if let Some(node) = cache.get(page_id) {
                self.inner.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(node.clone());
            }
        }

        self.inner.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.disk_reads.fetch_add(1, Ordering::Relaxed);
        let node = self.guard(self.inner.storage.read_page(page_id))?;
        self.cache_node(node.clone(), false)?;
        Ok(node)
    }

    /// Add a node to cache; a dirty page evicted to make room goes to disk.
    fn cache_node(&self, node: Node, dirty: bool) -> SpatialResult<()> {
        let evicted = self.inner.cache.lock().insert(node.id, node, dirty);
        if let Some((evicted_id, evicted_node)) = evicted {
            self.guard(self.inner.storage.write_page(evicted_id, &evicted_node))?;
            self.inner.stats.disk_writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn flush_pages(&self) -> SpatialResult<()> {
        let mut cache = self.inner.cache.lock();
        for page_id in cache.dirty_pages() {
            if let Some(node) = cache.peek(page_id) {
                self.inner.storage.write_page(page_id, node)?;
                self.inner.stats.disk_writes.fetch_add(1, Ordering::Relaxed);
            }
            cache.mark_clean(page_id);
        }
        drop(cache);

        self.inner.storage.write_header(&self.inner.header.read())?;
        self.inner.storage.sync()
    }
}

impl PageStore for FilePageStore {
    fn root(&self) -> SpatialResult<Node> {
        self.check_open()?;
        let root_page = self.inner.header.read().root_page;
        self.read_node(root_page)
    }

    fn set_root(&self, node: &mut Node) -> SpatialResult<()> {
        self.check_open()?;
        node.parent = None;
        self.write_node(node)?;
        let mut header = self.inner.header.write();
        header.root_page = node.id;
        Ok(())
    }

    fn empty_node(&self, leaf: bool) -> SpatialResult<Node> {
        self.check_open()?;
        let mut header = self.inner.header.write();
        let page_id = self.guard(FreeListManager::allocate_page(
            &self.inner.storage,
            &mut header,
        ))?;
        Ok(Node::new(page_id, leaf, header.dimension as usize))
    }

    fn node(&self, entry: &Entry, parent: &Node) -> SpatialResult<Node> {
        self.check_open()?;
        let page_id = entry.child_id().ok_or_else(|| {
            SpatialError::Corrupted(format!("entry in page {} is not a child pointer", parent.id))
        })?;
        let mut node = self.read_node(page_id)?;
        node.parent = Some(parent.id);
        Ok(node)
    }

    fn write_node(&self, node: &Node) -> SpatialResult<()> {
        self.check_open()?;
        // fail fast on nodes that cannot fit their page
        self.inner.storage.encode_page(node.id, node)?;
        self.cache_node(node.clone(), true)
    }

    fn free(&self, node: &Node) -> SpatialResult<()> {
        self.check_open()?;
        self.inner.cache.lock().remove(node.id);
        let mut header = self.inner.header.write();
        self.guard(FreeListManager::free_page(
            &self.inner.storage,
            &mut header,
            node.id,
        ))
    }

    fn flush(&self) -> SpatialResult<()> {
        self.check_open()?;
        self.guard(self.flush_pages())
    }

    fn close(&self) -> SpatialResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            self.inner.storage.close();
            return Ok(());
        }
        let result = self.flush_pages();
        self.inner.closed.store(true, Ordering::Release);
        self.inner.cache.lock().clear();
        self.inner.storage.close();
        result
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn dimension(&self) -> usize {
        self.inner.header.read().dimension as usize
    }

    fn metadata(&self) -> SpatialResult<StoreMetadata> {
        self.check_open()?;
        let header = self.inner.header.read();
        Ok(StoreMetadata {
            entry_count: header.entry_count,
            depth: header.depth,
        })
    }

    fn set_metadata(&self, metadata: StoreMetadata) -> SpatialResult<()> {
        self.check_open()?;
        let mut header = self.inner.header.write();
        header.entry_count = metadata.entry_count;
        header.depth = metadata.depth;
        Ok(())
    }

    fn lock_manager(&self) -> &LockManager {
        &self.inner.locks
    }

    fn node_count(&self) -> SpatialResult<u64> {
        self.check_open()?;
        let header = self.inner.header.read();
        Ok(header
            .next_page_id
            .saturating_sub(1)
            .saturating_sub(header.free_page_count))
    }

    fn stats(&self) -> TreeStats {
        let header = self.inner.header.read();
        TreeStats {
            total_entries: header.entry_count,
            depth: header.depth,
            cached_pages: self.inner.cache.lock().len() as u64,
            cache_hits: self.inner.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.stats.cache_misses.load(Ordering::Relaxed),
            disk_reads: self.inner.stats.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.inner.stats.disk_writes.load(Ordering::Relaxed),
            open_iterators: 0,
        }
    }
}

impl Drop for FilePageStore {
    fn drop(&mut self) {
        // Best effort flush on drop
        if !self.is_closed() {
            if let Err(e) = self.flush_pages() {
                log::warn!("Failed to flush index file on drop: {}", e);
            }
        }
    }
}
