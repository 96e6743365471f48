//! LRU cache for paged R-tree nodes.
//!
//! Pages enter the cache only when first read or written; nothing is
//! preloaded. Dirty pages pushed out by the LRU policy are handed back to the
//! caller so they can be written to disk.

use lru::LruCache;
use std::num::NonZeroUsize;

use super::rtree_types::{Node, NodeId};

/// A cached page with its data and dirty flag
pub struct CachedPage {
    pub node: Node,
    pub dirty: bool,
}

/// LRU cache for R-tree pages
pub struct PageCache {
    pages: LruCache<NodeId, CachedPage>,
}

impl PageCache {
    /// Create a new page cache holding at most `max_pages` pages
    pub fn new(max_pages: usize) -> Self {
        let capacity = NonZeroUsize::new(max_pages).unwrap_or(NonZeroUsize::MIN);
        Self {
            pages: LruCache::new(capacity),
        }
    }

    /// Get a page from cache, marking it most recently used.
    /// Returns None if the page must be loaded from disk.
    pub fn get(&mut self, page_id: NodeId) -> Option<&Node> {
        self.pages.get(&page_id).map(|cached| &cached.node)
    }

    /// Insert a page, returning a dirty page evicted to make room.
    ///
    /// A page that was already dirty stays dirty even when re-inserted clean.
    pub fn insert(&mut self, page_id: NodeId, node: Node, dirty: bool) -> Option<(NodeId, Node)> {
        let dirty = dirty || self.pages.peek(&page_id).is_some_and(|cached| cached.dirty);
        match self.pages.push(page_id, CachedPage { node, dirty }) {
            Some((evicted_id, evicted)) if evicted_id != page_id && evicted.dirty => {
                Some((evicted_id, evicted.node))
            }
            _ => None,
        }
    }

    /// Ids of all dirty pages
    pub fn dirty_pages(&self) -> Vec<NodeId> {
        self.pages
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Look at a page without touching its LRU position
    pub fn peek(&self, page_id: NodeId) -> Option<&Node> {
        self.pages.peek(&page_id).map(|cached| &cached.node)
    }

    /// Mark a page as clean
    pub fn mark_clean(&mut self, page_id: NodeId) {
        if let Some(cached) = self.pages.peek_mut(&page_id) {
            cached.dirty = false;
        }
    }

    /// Remove a page from cache
    pub fn remove(&mut self, page_id: NodeId) -> Option<(Node, bool)> {
        self.pages.pop(&page_id).map(|c| (c.node, c.dirty))
    }

    /// Drop every cached page
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page_id: NodeId) -> bool {
        self.pages.contains(&page_id)
    }
}
