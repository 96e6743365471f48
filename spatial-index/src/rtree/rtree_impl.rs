//! SpatialTree implementation.

use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ByteOrder, TreeConfig};
use crate::data::DataReader;
use crate::envelope::Envelope;
use crate::mapper::TreeElementMapper;

use super::bulk_load::BulkLoader;
use super::file_store::FilePageStore;
use super::memory_store::MemoryPageStore;
use super::packed_store::{write_packed, IndexKind, PackedFileStore, PackedHeader, PackedNode};
use super::page_store::PageStore;
use super::rtree_types::{
    Entry, EntryKind, Node, Payload, SpatialError, SpatialResult, StoreMetadata, TreeStats,
};
use super::search::{IteratorRegistry, SearchCollection, SearchMode};
use super::split::{policy_for, SplitPolicy};

/// An R-tree over any [`PageStore`].
///
/// Mutations are serialized through the store's
/// [`LockManager`](crate::LockManager); searches are lazy and registered with
/// the tree so [`SpatialTree::close`] can invalidate them.
///
/// # Example
///
/// ```rust
/// use spatial_index::{Envelope, SpatialTree, TreeConfig};
///
/// let tree = SpatialTree::memory(TreeConfig::default()).unwrap();
/// tree.insert_id(1, &Envelope::from_corners(0.0, 0.0, 10.0, 10.0)).unwrap();
/// tree.insert_id(2, &Envelope::from_corners(20.0, 20.0, 30.0, 30.0)).unwrap();
///
/// let hits = tree.search_ids(&Envelope::from_corners(5.0, 5.0, 6.0, 6.0)).unwrap();
/// assert_eq!(hits.len(), 1);
/// tree.close(false).unwrap();
/// ```
pub struct SpatialTree {
    inner: Arc<SpatialTreeInner>,
}

struct SpatialTreeInner {
    store: Arc<dyn PageStore>,
    config: TreeConfig,
    policy: Box<dyn SplitPolicy>,
    kind: IndexKind,
    iterators: IteratorRegistry,
    mapper: RwLock<Option<Arc<dyn TreeElementMapper>>>,
    closed: AtomicBool,
}

/// Entries waiting to be placed, with the level of the node receiving them.
type InsertQueue = VecDeque<(Entry, u32)>;

impl SpatialTree {
    /// Wraps a store. A fresh store yields an empty tree.
    pub fn new(store: Arc<dyn PageStore>, config: TreeConfig) -> SpatialResult<Self> {
        Self::with_kind(store, config, IndexKind::RTree)
    }

    fn with_kind(
        store: Arc<dyn PageStore>,
        config: TreeConfig,
        kind: IndexKind,
    ) -> SpatialResult<Self> {
        if store.dimension() != config.dimension() {
            return Err(SpatialError::DimensionMismatch {
                expected: config.dimension(),
                actual: store.dimension(),
            });
        }

        Ok(SpatialTree {
            inner: Arc::new(SpatialTreeInner {
                policy: policy_for(config.split_strategy()),
                store,
                config,
                kind,
                iterators: IteratorRegistry::new(),
                mapper: RwLock::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Creates an empty tree held entirely in memory.
    pub fn memory(config: TreeConfig) -> SpatialResult<Self> {
        let store = Arc::new(MemoryPageStore::new(config.dimension()));
        Self::new(store, config)
    }

    /// Creates an empty tree in a new paged file, truncating any existing one.
    pub fn create_file(path: impl AsRef<Path>, config: TreeConfig) -> SpatialResult<Self> {
        let store = Arc::new(FilePageStore::create(path, &config)?);
        Self::new(store, config)
    }

    /// Opens a paged file written by [`SpatialTree::create_file`].
    ///
    /// The dimension and byte order recorded in the file take precedence
    /// over `config`.
    pub fn open_file(path: impl AsRef<Path>, config: TreeConfig) -> SpatialResult<Self> {
        let store = Arc::new(FilePageStore::open(path, &config)?);
        let config = config.with_dimension(store.dimension());
        Self::new(store, config)
    }

    /// Opens a packed file read-only.
    pub fn open_packed(path: impl AsRef<Path>) -> SpatialResult<Self> {
        let store = PackedFileStore::open(path)?;
        let kind = store.kind();
        let config = TreeConfig::default().with_dimension(store.dimension());
        Self::with_kind(Arc::new(store), config, kind)
    }

    /// Builds a tree bottom-up from `entries` into an empty store.
    ///
    /// Falls back to one-by-one insertion when the dimension is too large for
    /// Hilbert ordering.
    pub fn bulk_load(
        store: Arc<dyn PageStore>,
        config: TreeConfig,
        entries: impl IntoIterator<Item = (Payload, Envelope)>,
    ) -> SpatialResult<Self> {
        let tree = Self::new(store, config)?;
        tree.check_writable()?;

        let mut items = Vec::new();
        for (payload, envelope) in entries {
            tree.check_envelope(&envelope)?;
            items.push(Entry::data(envelope, payload));
        }

        let store = tree.store();
        let _guard = store.lock_manager().write();
        if store.metadata()?.entry_count != 0 {
            return Err(SpatialError::Indexing(
                "bulk loading needs an empty store".into(),
            ));
        }

        match BulkLoader::new(&tree.inner.config) {
            Ok(loader) => {
                let count = items.len() as u64;
                let previous = store.root()?;
                let root = loader.load(store, items)?;
                store.free(&previous)?;
                store.set_metadata(StoreMetadata {
                    entry_count: count,
                    depth: root.level + 1,
                })?;
            }
            Err(SpatialError::Indexing(reason)) => {
                log::warn!(
                    "Bulk loading unavailable ({}), inserting {} entries one by one",
                    reason,
                    items.len()
                );
                for entry in items {
                    tree.insert_entry(entry)?;
                }
            }
            Err(e) => return Err(e),
        }
        drop(_guard);

        Ok(tree)
    }

    /// Attaches a mapper that records the envelope of every inserted id.
    pub fn with_mapper(self, mapper: Arc<dyn TreeElementMapper>) -> Self {
        *self.inner.mapper.write() = Some(mapper);
        self
    }

    pub fn config(&self) -> &TreeConfig {
        &self.inner.config
    }

    pub fn kind(&self) -> IndexKind {
        self.inner.kind
    }

    pub fn dimension(&self) -> usize {
        self.inner.store.dimension()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.store.is_read_only()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.store.is_closed()
    }

    fn store(&self) -> &dyn PageStore {
        self.inner.store.as_ref()
    }

    fn mapper(&self) -> Option<Arc<dyn TreeElementMapper>> {
        self.inner.mapper.read().clone()
    }

    fn check_open(&self) -> SpatialResult<()> {
        if self.is_closed() {
            return Err(SpatialError::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> SpatialResult<()> {
        self.check_open()?;
        if self.is_read_only() {
            return Err(SpatialError::ReadOnly(format!(
                "{:?} index opened from a packed file",
                self.inner.kind
            )));
        }
        Ok(())
    }

    fn check_dimension(&self, envelope: &Envelope) -> SpatialResult<()> {
        if envelope.dimension() != self.dimension() {
            return Err(SpatialError::DimensionMismatch {
                expected: self.dimension(),
                actual: envelope.dimension(),
            });
        }
        Ok(())
    }

    fn check_envelope(&self, envelope: &Envelope) -> SpatialResult<()> {
        self.check_dimension(envelope)?;
        if envelope.is_null() {
            return Err(SpatialError::InvalidEnvelope(
                "cannot index a null envelope".into(),
            ));
        }
        if envelope.min().iter().chain(envelope.max()).any(|v| !v.is_finite()) {
            return Err(SpatialError::InvalidEnvelope(format!(
                "non-finite coordinate in {}",
                envelope
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts a payload under `envelope`.
    pub fn insert(&self, payload: Payload, envelope: &Envelope) -> SpatialResult<()> {
        self.check_writable()?;
        self.check_envelope(envelope)?;

        let store = self.store();
        let _guard = store.lock_manager().write();
        let id = payload.id();
        let entry = Entry::data(envelope.clone(), payload);
        self.insert_entry(entry.clone())?;

        if let (Some(id), Some(mapper)) = (id, self.mapper()) {
            if let Err(e) = mapper.set_envelope(id, envelope) {
                // the tree must not hold an id the mapper does not know
                if let Err(undo) = self.remove_entry(&entry) {
                    log::error!("Failed to undo insert of id {}: {}", id, undo);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Inserts an identifier under `envelope`.
    pub fn insert_id(&self, id: u64, envelope: &Envelope) -> SpatialResult<()> {
        self.insert(Payload::Id(id), envelope)
    }

    /// Places one new data entry and counts it. The write guard must be held.
    fn insert_entry(&self, entry: Entry) -> SpatialResult<()> {
        let mut queue = InsertQueue::from([(entry, 0)]);
        self.drain_queue(&mut queue)?;

        let store = self.store();
        let mut metadata = store.metadata()?;
        metadata.entry_count += 1;
        store.set_metadata(metadata)
    }

    /// Places queued entries until the queue (including reinsertions it
    /// spawns) is empty. Every level reinserts at most once per drain.
    fn drain_queue(&self, queue: &mut InsertQueue) -> SpatialResult<()> {
        let mut reinserted = HashSet::new();
        while let Some((entry, level)) = queue.pop_front() {
            self.place(entry, level, &mut reinserted, queue)?;
        }
        Ok(())
    }

    fn place(
        &self,
        entry: Entry,
        level: u32,
        reinserted: &mut HashSet<u32>,
        queue: &mut InsertQueue,
    ) -> SpatialResult<()> {
        let store = self.store();
        let mut node = store.root()?;

        if level > node.level {
            // the tree shrank below this entry's height; re-add its data
            let mut data = Vec::new();
            self.dissolve(entry, &node, &mut data)?;
            queue.extend(data.into_iter().map(|entry| (entry, 0)));
            return Ok(());
        }

        let mut path = Vec::new();
        while node.level > level {
            let position = choose_subtree(&node, &entry.envelope).ok_or_else(|| {
                SpatialError::Corrupted(format!("internal node {} has no entries", node.id))
            })?;
            let child = store.node(&node.entries[position], &node)?;
            path.push(node);
            node = child;
        }

        node.add_entry(entry);
        self.settle(node, path, reinserted, queue)
    }

    /// Frees the subtree below `entry`, collecting its data entries.
    fn dissolve(&self, entry: Entry, parent: &Node, data: &mut Vec<Entry>) -> SpatialResult<()> {
        if entry.child_id().is_none() {
            data.push(entry);
            return Ok(());
        }
        let node = self.store().node(&entry, parent)?;
        for child in node.entries.clone() {
            self.dissolve(child, &node, data)?;
        }
        self.store().free(&node)
    }

    /// Resolves overflow of `node` bottom-up, then writes the path back.
    fn settle(
        &self,
        mut node: Node,
        mut path: Vec<Node>,
        reinserted: &mut HashSet<u32>,
        queue: &mut InsertQueue,
    ) -> SpatialResult<()> {
        let store = self.store();
        let policy = &self.inner.policy;
        let max = self.inner.config.max_entries();
        let min = self.inner.config.min_entries();

        loop {
            if node.len() <= max {
                store.write_node(&node)?;
                return self.adjust_path(node, path);
            }

            let is_root = path.is_empty();
            let already = reinserted.contains(&node.level);
            if let Some(positions) = policy.reinsert_candidates(&node, already, is_root, min) {
                reinserted.insert(node.level);
                let level = node.level;

                let mut slots: Vec<Option<Entry>> = node.entries.drain(..).map(Some).collect();
                let removed: Vec<Entry> = positions
                    .into_iter()
                    .filter_map(|position| slots.get_mut(position).and_then(Option::take))
                    .collect();
                node.entries = slots.into_iter().flatten().collect();
                node.recompute_bounds();
                store.write_node(&node)?;
                self.adjust_path(node, path)?;

                // closest of the removed entries goes back first
                queue.extend(removed.into_iter().rev().map(|entry| (entry, level)));
                return Ok(());
            }

            let entries = std::mem::take(&mut node.entries);
            let (left, right) = policy.split(entries, min);
            let mut sibling = store.empty_node(node.leaf)?;
            sibling.level = node.level;
            node.entries = left;
            node.recompute_bounds();
            sibling.entries = right;
            sibling.recompute_bounds();
            store.write_node(&node)?;
            store.write_node(&sibling)?;

            match path.pop() {
                None => {
                    let mut root = store.empty_node(false)?;
                    root.level = node.level + 1;
                    root.add_entry(store.entry_pointing_node(&node));
                    root.add_entry(store.entry_pointing_node(&sibling));
                    store.set_root(&mut root)?;

                    let mut metadata = store.metadata()?;
                    metadata.depth = root.level + 1;
                    store.set_metadata(metadata)?;
                    log::debug!(
                        "Root split, tree height is now {} (root node {})",
                        metadata.depth,
                        root.id
                    );
                    return Ok(());
                }
                Some(mut parent) => {
                    let position = child_position(&parent, &node)?;
                    parent.entries[position] = store.entry_pointing_node(&node);
                    parent.entries.push(store.entry_pointing_node(&sibling));
                    parent.recompute_bounds();
                    node = parent;
                }
            }
        }
    }

    /// Propagates the bounds of a written node up to the root, stopping at
    /// the first ancestor whose entry is already correct.
    fn adjust_path(&self, node: Node, mut path: Vec<Node>) -> SpatialResult<()> {
        let store = self.store();
        let mut child = node;
        while let Some(mut parent) = path.pop() {
            let position = child_position(&parent, &child)?;
            let entry = store.entry_pointing_node(&child);
            if parent.entries[position] == entry {
                return Ok(());
            }
            parent.entries[position] = entry;
            parent.recompute_bounds();
            store.write_node(&parent)?;
            child = parent;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Removes the entry holding exactly `payload` under `envelope`.
    ///
    /// Nodes left under-full are dissolved and their entries reinserted; the
    /// root is replaced by its only child while it has just one.
    pub fn delete(&self, envelope: &Envelope, payload: &Payload) -> SpatialResult<()> {
        self.check_writable()?;
        self.check_envelope(envelope)?;

        let store = self.store();
        let _guard = store.lock_manager().write();
        let target = Entry::data(envelope.clone(), payload.clone());
        if !self.remove_entry(&target)? {
            return Err(SpatialError::EntryNotFound(format!(
                "{:?} at {}",
                payload, envelope
            )));
        }

        if let (Some(id), Some(mapper)) = (payload.id(), self.mapper()) {
            if let Err(e) = mapper.remove(id) {
                if let Err(undo) = self.insert_entry(target) {
                    log::error!("Failed to undo delete of id {}: {}", id, undo);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Removes one data entry and uncounts it. Returns `false` when no leaf
    /// holds it. The write guard must be held.
    fn remove_entry(&self, target: &Entry) -> SpatialResult<bool> {
        let mut path = Vec::new();
        match self.find_leaf(self.store().root()?, target, &mut path)? {
            Some(leaf) => {
                self.condense(leaf, path, target)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes the entry of an identifier.
    ///
    /// The envelope comes from the attached mapper, or from a scan of the
    /// tree when none is attached.
    pub fn delete_id(&self, id: u64) -> SpatialResult<()> {
        self.check_writable()?;
        let envelope = match self.mapper() {
            Some(mapper) => mapper.envelope(id)?,
            None => self.find_envelope(id)?,
        };
        match envelope {
            Some(envelope) => self.delete(&envelope, &Payload::Id(id)),
            None => Err(SpatialError::EntryNotFound(format!("id {}", id))),
        }
    }

    fn find_envelope(&self, id: u64) -> SpatialResult<Option<Envelope>> {
        let store = self.store();
        let _guard = store.lock_manager().read();
        let mut pending = vec![store.root()?];
        while let Some(node) = pending.pop() {
            for entry in &node.entries {
                match &entry.kind {
                    EntryKind::Data(Payload::Id(found)) if *found == id => {
                        return Ok(Some(entry.envelope.clone()));
                    }
                    EntryKind::Child(_) => pending.push(store.node(entry, &node)?),
                    EntryKind::Data(_) => {}
                }
            }
        }
        Ok(None)
    }

    /// Depth-first search for the leaf holding `target`. On success `path`
    /// holds the leaf's ancestors, root first.
    fn find_leaf(
        &self,
        node: Node,
        target: &Entry,
        path: &mut Vec<Node>,
    ) -> SpatialResult<Option<Node>> {
        if node.leaf {
            return Ok(node.entries.contains(target).then_some(node));
        }

        let candidates: Vec<Entry> = node
            .entries
            .iter()
            .filter(|entry| entry.child_id().is_some() && entry.envelope.contains(&target.envelope))
            .cloned()
            .collect();
        path.push(node);
        for candidate in &candidates {
            let child = {
                let parent = &path[path.len() - 1];
                self.store().node(candidate, parent)?
            };
            if let Some(leaf) = self.find_leaf(child, target, path)? {
                return Ok(Some(leaf));
            }
        }
        path.pop();
        Ok(None)
    }

    fn condense(&self, mut node: Node, mut path: Vec<Node>, target: &Entry) -> SpatialResult<()> {
        let store = self.store();
        let min = self.inner.config.min_entries();

        let position = node
            .entries
            .iter()
            .position(|entry| entry == target)
            .ok_or_else(|| SpatialError::Corrupted(format!("entry vanished from node {}", node.id)))?;
        node.entries.remove(position);
        node.recompute_bounds();

        let mut orphans = InsertQueue::new();
        while let Some(mut parent) = path.pop() {
            let position = child_position(&parent, &node)?;
            if node.len() < min {
                parent.entries.remove(position);
                store.free(&node)?;
                let level = node.level;
                orphans.extend(node.entries.into_iter().map(|entry| (entry, level)));
            } else {
                store.write_node(&node)?;
                parent.entries[position] = store.entry_pointing_node(&node);
            }
            parent.recompute_bounds();
            node = parent;
        }

        // node is now the root
        if !node.leaf && node.is_empty() {
            node.leaf = true;
            node.level = 0;
        }
        store.write_node(&node)?;

        let mut metadata = store.metadata()?;
        metadata.entry_count = metadata.entry_count.saturating_sub(1);
        metadata.depth = node.level + 1;
        store.set_metadata(metadata)?;

        if !orphans.is_empty() {
            log::debug!("Reinserting {} orphaned entries", orphans.len());
            self.drain_queue(&mut orphans)?;
        }
        self.shrink_root()
    }

    /// Replaces an internal root holding one child by that child.
    fn shrink_root(&self) -> SpatialResult<()> {
        let store = self.store();
        let mut root = store.root()?;
        while !root.leaf && root.len() == 1 {
            let mut child = store.node(&root.entries[0], &root)?;
            store.set_root(&mut child)?;
            store.free(&root)?;
            root = child;
        }

        let mut metadata = store.metadata()?;
        if metadata.depth != root.level + 1 {
            metadata.depth = root.level + 1;
            store.set_metadata(metadata)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Lazily finds the records whose envelope intersects `query`.
    pub fn search(
        &self,
        reader: Arc<dyn DataReader>,
        query: &Envelope,
    ) -> SpatialResult<SearchCollection> {
        self.search_with(reader, query, SearchMode::Intersects)
    }

    /// Lazily finds the records whose envelope lies inside `query`.
    pub fn search_contained(
        &self,
        reader: Arc<dyn DataReader>,
        query: &Envelope,
    ) -> SpatialResult<SearchCollection> {
        self.search_with(reader, query, SearchMode::Contained)
    }

    fn search_with(
        &self,
        reader: Arc<dyn DataReader>,
        query: &Envelope,
        mode: SearchMode,
    ) -> SpatialResult<SearchCollection> {
        self.check_open()?;
        self.check_dimension(query)?;
        Ok(SearchCollection::new(
            self.inner.store.clone(),
            reader,
            query.clone(),
            mode,
            self.inner.iterators.clone(),
        ))
    }

    /// Payloads of every entry intersecting `query`, collected eagerly.
    pub fn search_ids(&self, query: &Envelope) -> SpatialResult<Vec<Payload>> {
        self.check_open()?;
        self.check_dimension(query)?;

        let store = self.store();
        let _guard = store.lock_manager().read();
        let mut results = Vec::new();
        let root = store.root()?;
        if !root.bounds.intersects(query) {
            return Ok(results);
        }

        let mut pending = vec![root];
        while let Some(node) = pending.pop() {
            for entry in &node.entries {
                if !entry.envelope.intersects(query) {
                    continue;
                }
                match &entry.kind {
                    EntryKind::Data(payload) => results.push(payload.clone()),
                    EntryKind::Child(_) => pending.push(store.node(entry, &node)?),
                }
            }
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Repacks the tree through the bulk loader when that needs fewer nodes.
    ///
    /// Returns `false` without touching anything on read-only stores.
    pub fn trim(&self) -> SpatialResult<bool> {
        self.check_open()?;
        if self.is_read_only() {
            return Ok(false);
        }
        let loader = match BulkLoader::new(&self.inner.config) {
            Ok(loader) => loader,
            Err(_) => return Ok(false),
        };

        let store = self.store();
        let _guard = store.lock_manager().write();
        let metadata = store.metadata()?;
        let before = store.node_count()?;
        if loader.packed_node_count(metadata.entry_count) >= before {
            return Ok(false);
        }

        let mut nodes = Vec::new();
        let mut data = Vec::new();
        let mut pending = vec![store.root()?];
        while let Some(node) = pending.pop() {
            for entry in &node.entries {
                match entry.kind {
                    EntryKind::Data(_) => data.push(entry.clone()),
                    EntryKind::Child(_) => pending.push(store.node(entry, &node)?),
                }
            }
            nodes.push(node);
        }
        let root = loader.load(store, data)?;
        for node in &nodes {
            store.free(node)?;
        }
        store.set_metadata(StoreMetadata {
            entry_count: metadata.entry_count,
            depth: root.level + 1,
        })?;
        log::debug!(
            "Trimmed tree from {} to {} nodes",
            before,
            store.node_count()?
        );
        Ok(true)
    }

    /// Pushes buffered node and mapper state down to storage.
    pub fn flush(&self) -> SpatialResult<()> {
        self.check_open()?;
        if let Some(mapper) = self.mapper() {
            mapper.flush()?;
        }
        if self.is_read_only() {
            return Ok(());
        }
        let _guard = self.store().lock_manager().read();
        self.store().flush()
    }

    /// Writes this tree in the packed format.
    pub fn write_packed(&self, path: impl AsRef<Path>, byte_order: ByteOrder) -> SpatialResult<()> {
        self.check_open()?;
        let store = self.store();
        let _guard = store.lock_manager().read();

        let metadata = store.metadata()?;
        let header = PackedHeader {
            byte_order,
            kind: self.inner.kind,
            dimension: self.dimension(),
            entry_count: i32::try_from(metadata.entry_count).map_err(|_| {
                SpatialError::InvalidData(format!(
                    "{} entries exceed the packed format",
                    metadata.entry_count
                ))
            })?,
            max_depth: metadata.depth as i32,
        };
        let root = self.pack_node(store.root()?)?;
        write_packed(path, &header, &root)
    }

    fn pack_node(&self, node: Node) -> SpatialResult<PackedNode> {
        let mut packed = PackedNode {
            bounds: node.bounds.clone(),
            leaf: node.leaf,
            entries: Vec::new(),
            children: Vec::new(),
        };
        for entry in &node.entries {
            match &entry.kind {
                EntryKind::Data(payload) => {
                    packed.entries.push((entry.envelope.clone(), payload.clone()))
                }
                EntryKind::Child(_) => {
                    let child = self.store().node(entry, &node)?;
                    packed.children.push(self.pack_node(child)?);
                }
            }
        }
        Ok(packed)
    }

    /// Closes the tree, every search iterator it issued, its mapper and its
    /// store. Closing twice is a no-op.
    ///
    /// Pending mapper writes are flushed first when `flush_mapper` is set.
    pub fn close(&self, flush_mapper: bool) -> SpatialResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        let mut record = |result: SpatialResult<()>| {
            if let Err(e) = result {
                log::error!("Error while closing spatial tree: {}", e);
                first_error.get_or_insert(e);
            }
        };

        let mapper = self.inner.mapper.write().take();
        if let (true, Some(mapper)) = (flush_mapper, &mapper) {
            record(mapper.flush());
        }
        self.inner.iterators.close_all();
        if let Some(mapper) = mapper {
            record(mapper.close());
        }

        let store = self.store();
        {
            let _guard = store.lock_manager().write();
            if !store.is_read_only() && !store.is_closed() {
                record(store.flush());
            }
            record(store.close());
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn entry_count(&self) -> SpatialResult<u64> {
        self.check_open()?;
        Ok(self.store().metadata()?.entry_count)
    }

    /// Number of node levels from the root to the leaves.
    pub fn depth(&self) -> SpatialResult<u32> {
        self.check_open()?;
        Ok(self.store().metadata()?.depth)
    }

    pub fn root_bounds(&self) -> SpatialResult<Envelope> {
        self.check_open()?;
        let _guard = self.store().lock_manager().read();
        Ok(self.store().root()?.bounds)
    }

    pub fn stats(&self) -> SpatialResult<TreeStats> {
        self.check_open()?;
        let metadata = self.store().metadata()?;
        Ok(TreeStats {
            total_entries: metadata.entry_count,
            depth: metadata.depth,
            open_iterators: self.inner.iterators.len(),
            ..self.store().stats()
        })
    }

    /// Walks the whole tree and checks its structural invariants.
    ///
    /// Every node's bounds must equal the union of its entries and every
    /// child entry must carry its child's bounds. For R-trees, levels must
    /// decrease by one per step down, only leaves may hold data, and every
    /// non-root node of a mutable tree must hold between `min_entries` and
    /// `max_entries` entries. The number of data entries must match the
    /// recorded count.
    pub fn validate(&self) -> SpatialResult<()> {
        self.check_open()?;
        let store = self.store();
        let _guard = store.lock_manager().read();

        let rtree = self.inner.kind == IndexKind::RTree;
        // packed files do not record the fan-out they were built with
        let check_fill = rtree && !store.is_read_only();
        let max = self.inner.config.max_entries();
        let min = self.inner.config.min_entries();
        let corrupted = |message: String| Err(SpatialError::Corrupted(message));

        let mut count = 0u64;
        let mut pending = vec![(store.root()?, true)];
        while let Some((node, is_root)) = pending.pop() {
            let content = node.compute_bounds();
            if node.bounds != content {
                return corrupted(format!(
                    "node {} has bounds {} but holds {}",
                    node.id, node.bounds, content
                ));
            }
            if rtree {
                if node.leaf != (node.level == 0) {
                    return corrupted(format!(
                        "node {} at level {} has leaf flag {}",
                        node.id, node.level, node.leaf
                    ));
                }
                if check_fill && (node.len() > max || (!is_root && node.len() < min)) {
                    return corrupted(format!(
                        "node {} holds {} entries, allowed {}..={}",
                        node.id,
                        node.len(),
                        min,
                        max
                    ));
                }
            }

            for entry in &node.entries {
                match entry.kind {
                    EntryKind::Data(_) => {
                        if rtree && !node.leaf {
                            return corrupted(format!("internal node {} holds data", node.id));
                        }
                        count += 1;
                    }
                    EntryKind::Child(_) => {
                        if node.leaf {
                            return corrupted(format!("leaf {} has a child", node.id));
                        }
                        let child = store.node(entry, &node)?;
                        if child.bounds != entry.envelope {
                            return corrupted(format!(
                                "entry for node {} is {} but the node covers {}",
                                child.id, entry.envelope, child.bounds
                            ));
                        }
                        if rtree && child.level + 1 != node.level {
                            return corrupted(format!(
                                "node {} at level {} under node {} at level {}",
                                child.id, child.level, node.id, node.level
                            ));
                        }
                        pending.push((child, false));
                    }
                }
            }
        }

        let expected = store.metadata()?.entry_count;
        if count != expected {
            return corrupted(format!(
                "tree holds {} entries but records {}",
                count, expected
            ));
        }
        Ok(())
    }
}

/// The entry whose envelope grows least to cover `envelope`, ties broken by
/// the smaller area.
fn choose_subtree(node: &Node, envelope: &Envelope) -> Option<usize> {
    let mut best: Option<(usize, f64, f64)> = None;
    for (position, entry) in node.entries.iter().enumerate() {
        let enlargement = entry.envelope.enlargement(envelope);
        let area = entry.envelope.area();
        let better = match best {
            None => true,
            Some((_, best_enlargement, best_area)) => {
                enlargement < best_enlargement
                    || (enlargement == best_enlargement && area < best_area)
            }
        };
        if better {
            best = Some((position, enlargement, area));
        }
    }
    best.map(|(position, _, _)| position)
}

fn child_position(parent: &Node, child: &Node) -> SpatialResult<usize> {
    parent.child_position(child.id).ok_or_else(|| {
        SpatialError::Corrupted(format!(
            "node {} is not a child of node {}",
            child.id, parent.id
        ))
    })
}

impl Drop for SpatialTree {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Some(mapper) = self.mapper() {
            if let Err(e) = mapper.flush() {
                log::warn!("Failed to flush element mapper on drop: {}", e);
            }
        }
        if !self.is_read_only() {
            let store = self.store();
            let _guard = store.lock_manager().read();
            if let Err(e) = store.flush() {
                log::warn!("Failed to flush spatial tree on drop: {}", e);
            }
        }
    }
}
