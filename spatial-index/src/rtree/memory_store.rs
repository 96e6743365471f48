use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::lock::LockManager;

use super::page_store::PageStore;
use super::rtree_types::{
    Entry, Node, NodeId, SpatialError, SpatialResult, StoreMetadata, TreeStats,
};

/// A [`PageStore`] keeping every node on the heap, keyed by id.
pub struct MemoryPageStore {
    inner: Arc<MemoryPageStoreInner>,
}

struct MemoryPageStoreInner {
    nodes: RwLock<HashMap<NodeId, Node>>,
    root: AtomicU64,
    next_id: AtomicU64,
    metadata: RwLock<StoreMetadata>,
    dimension: usize,
    closed: AtomicBool,
    locks: LockManager,
}

impl MemoryPageStore {
    pub fn new(dimension: usize) -> MemoryPageStore {
        let root = Node::new(1, true, dimension);
        let mut nodes = HashMap::new();
        nodes.insert(root.id, root);

        MemoryPageStore {
            inner: Arc::new(MemoryPageStoreInner {
                nodes: RwLock::new(nodes),
                root: AtomicU64::new(1),
                next_id: AtomicU64::new(2),
                metadata: RwLock::new(StoreMetadata {
                    entry_count: 0,
                    depth: 1,
                }),
                dimension,
                closed: AtomicBool::new(false),
                locks: LockManager::new(),
            }),
        }
    }

    fn check_open(&self) -> SpatialResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(SpatialError::Closed)
        } else {
            Ok(())
        }
    }

    fn load(&self, id: NodeId) -> SpatialResult<Node> {
        self.inner
            .nodes
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SpatialError::Corrupted(format!("node {} does not exist", id)))
    }
}

impl PageStore for MemoryPageStore {
    fn root(&self) -> SpatialResult<Node> {
        self.check_open()?;
        self.load(self.inner.root.load(Ordering::Acquire))
    }

    fn set_root(&self, node: &mut Node) -> SpatialResult<()> {
        self.check_open()?;
        node.parent = None;
        self.inner.nodes.write().insert(node.id, node.clone());
        self.inner.root.store(node.id, Ordering::Release);
        Ok(())
    }

    fn empty_node(&self, leaf: bool) -> SpatialResult<Node> {
        self.check_open()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        Ok(Node::new(id, leaf, self.inner.dimension))
    }

    fn node(&self, entry: &Entry, parent: &Node) -> SpatialResult<Node> {
        self.check_open()?;
        let id = entry.child_id().ok_or_else(|| {
            SpatialError::Corrupted(format!("entry in node {} is not a child pointer", parent.id))
        })?;
        let mut node = self.load(id)?;
        node.parent = Some(parent.id);
        Ok(node)
    }

    fn write_node(&self, node: &Node) -> SpatialResult<()> {
        self.check_open()?;
        self.inner.nodes.write().insert(node.id, node.clone());
        Ok(())
    }

    fn free(&self, node: &Node) -> SpatialResult<()> {
        self.check_open()?;
        self.inner.nodes.write().remove(&node.id);
        Ok(())
    }

    fn flush(&self) -> SpatialResult<()> {
        self.check_open()
    }

    fn close(&self) -> SpatialResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.nodes.write().clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension
    }

    fn metadata(&self) -> SpatialResult<StoreMetadata> {
        self.check_open()?;
        Ok(*self.inner.metadata.read())
    }

    fn set_metadata(&self, metadata: StoreMetadata) -> SpatialResult<()> {
        self.check_open()?;
        *self.inner.metadata.write() = metadata;
        Ok(())
    }

    fn lock_manager(&self) -> &LockManager {
        &self.inner.locks
    }

    fn node_count(&self) -> SpatialResult<u64> {
        self.check_open()?;
        Ok(self.inner.nodes.read().len() as u64)
    }

    fn stats(&self) -> TreeStats {
        let metadata = *self.inner.metadata.read();
        TreeStats {
            total_entries: metadata.entry_count,
            depth: metadata.depth,
            cached_pages: self.inner.nodes.read().len() as u64,
            ..TreeStats::default()
        }
    }
}
