//! Lazy search results.
//!
//! A search returns a [`SearchCollection`] without touching the tree. Each
//! [`SearchIterator`] drawn from it walks the tree depth first, one node at a
//! time, and resolves leaf identifiers through a [`DataReader`] in one batch
//! per node. Iterators are registered with the tree so closing the tree can
//! invalidate every iterator still alive.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::data::{Data, DataReader};
use crate::envelope::Envelope;

use super::page_store::PageStore;
use super::rtree_types::{EntryKind, Node, Payload, SpatialError, SpatialResult};

/// Which entries a search reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Entries whose envelope intersects the query
    Intersects,
    /// Entries whose envelope lies inside the query
    Contained,
}

impl SearchMode {
    fn matches(self, query: &Envelope, envelope: &Envelope) -> bool {
        match self {
            SearchMode::Intersects => query.intersects(envelope),
            SearchMode::Contained => query.contains(envelope),
        }
    }
}

/// Shared flags of one live iterator.
#[derive(Default)]
pub(crate) struct IteratorState {
    /// Closed by its owner; the iterator just ends
    closed: AtomicBool,
    /// The owning tree was closed; the iterator reports it once
    tree_closed: AtomicBool,
}

/// Live iterators of one tree, keyed by iterator id.
#[derive(Clone, Default)]
pub struct IteratorRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    live: HashMap<u64, Arc<IteratorState>>,
    closed: bool,
}

impl IteratorRegistry {
    pub fn new() -> Self {
        IteratorRegistry::default()
    }

    /// Registers a new iterator. After [`IteratorRegistry::close_all`] the
    /// returned state is already marked as belonging to a closed tree.
    pub(crate) fn register(&self) -> (u64, Arc<IteratorState>) {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let state = Arc::new(IteratorState::default());
        if inner.closed {
            state.tree_closed.store(true, Ordering::Release);
        } else {
            inner.live.insert(id, state.clone());
        }
        (id, state)
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.inner.lock().live.remove(&id);
    }

    /// Invalidates every live iterator and refuses new ones.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for (_, state) in inner.live.drain() {
            state.tree_closed.store(true, Ordering::Release);
        }
    }

    /// Number of iterators currently alive.
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The result of a search: a re-iterable, closeable view over the matches.
pub struct SearchCollection {
    store: Arc<dyn PageStore>,
    reader: Arc<dyn DataReader>,
    query: Envelope,
    mode: SearchMode,
    registry: IteratorRegistry,
    owned: Mutex<HashMap<u64, Arc<IteratorState>>>,
    closed: AtomicBool,
}

impl SearchCollection {
    pub(crate) fn new(
        store: Arc<dyn PageStore>,
        reader: Arc<dyn DataReader>,
        query: Envelope,
        mode: SearchMode,
        registry: IteratorRegistry,
    ) -> Self {
        SearchCollection {
            store,
            reader,
            query,
            mode,
            registry,
            owned: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn query(&self) -> &Envelope {
        &self.query
    }

    pub fn mode(&self) -> SearchMode {
        self.mode
    }

    /// Starts a fresh walk over the matches.
    ///
    /// Once the collection is closed the iterator is empty; once the tree is
    /// closed it yields [`SpatialError::Closed`] once.
    pub fn iter(&self) -> SearchIterator {
        let (id, state) = self.registry.register();
        if self.store.is_closed() {
            state.tree_closed.store(true, Ordering::Release);
        }
        if self.closed.load(Ordering::Acquire) {
            state.closed.store(true, Ordering::Release);
        } else {
            self.owned.lock().insert(id, state.clone());
        }

        SearchIterator {
            id,
            state,
            registry: self.registry.clone(),
            store: Some(self.store.clone()),
            reader: self.reader.clone(),
            query: self.query.clone(),
            mode: self.mode,
            generation: self.store.lock_manager().generation(),
            frames: Vec::new(),
            buffer: VecDeque::new(),
            started: false,
            finished: false,
        }
    }

    /// Counts the matches by draining a fresh iterator.
    pub fn size(&self) -> SpatialResult<usize> {
        let mut iter = self.iter();
        let mut count = 0;
        let result = iter.by_ref().try_for_each(|item| item.map(|_| count += 1));
        self.close_iterator(&mut iter);
        result.map(|_| count)
    }

    /// True when no entry matches.
    pub fn is_empty(&self) -> SpatialResult<bool> {
        let mut iter = self.iter();
        let first = iter.next();
        self.close_iterator(&mut iter);
        match first {
            None => Ok(true),
            Some(Ok(_)) => Ok(false),
            Some(Err(e)) => Err(e),
        }
    }

    /// Closes one iterator drawn from this collection. Idempotent.
    pub fn close_iterator(&self, iter: &mut SearchIterator) {
        self.owned.lock().remove(&iter.id);
        iter.close();
    }

    /// Closes the collection and every iterator drawn from it. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (id, state) in self.owned.lock().drain() {
            state.closed.store(true, Ordering::Release);
            self.registry.deregister(id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for SearchCollection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SearchCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchCollection")
            .field("query", &self.query)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Lazy depth-first walk over the entries matching a query.
///
/// Yields [`SpatialError::ConcurrentModification`] if the tree is modified
/// after the iterator was created, and [`SpatialError::Closed`] once if the
/// tree is closed while the iterator is live. Either error ends the
/// iteration.
pub struct SearchIterator {
    id: u64,
    state: Arc<IteratorState>,
    registry: IteratorRegistry,
    store: Option<Arc<dyn PageStore>>,
    reader: Arc<dyn DataReader>,
    query: Envelope,
    mode: SearchMode,
    generation: u64,
    /// Nodes being walked and the position of their next entry
    frames: Vec<(Node, usize)>,
    buffer: VecDeque<Data>,
    started: bool,
    finished: bool,
}

impl SearchIterator {
    /// Ends the iteration and releases the store. Idempotent.
    pub fn close(&mut self) {
        self.state.closed.store(true, Ordering::Release);
        self.release();
    }

    pub fn is_closed(&self) -> bool {
        self.finished
    }

    fn release(&mut self) {
        if self.store.take().is_some() {
            self.registry.deregister(self.id);
        }
        self.finished = true;
        self.frames.clear();
        self.buffer.clear();
    }

    fn fail(&mut self, error: SpatialError) -> Option<SpatialResult<Data>> {
        self.release();
        Some(Err(error))
    }

    /// Queues the matching data entries of a node and schedules its children.
    fn visit(&mut self, node: Node) -> SpatialResult<()> {
        let mut ids = Vec::new();
        let mut slots: Vec<Option<Data>> = Vec::new();
        for entry in &node.entries {
            if let EntryKind::Data(payload) = &entry.kind {
                if self.mode.matches(&self.query, &entry.envelope) {
                    match payload {
                        Payload::Id(id) => {
                            ids.push(*id);
                            slots.push(None);
                        }
                        Payload::Inline(data) => slots.push(Some(data.clone())),
                    }
                }
            }
        }

        if ids.is_empty() {
            self.buffer.extend(slots.into_iter().flatten());
        } else {
            let mut resolved = Vec::with_capacity(ids.len());
            self.reader.read_batch(&ids, &mut resolved)?;
            let mut resolved = resolved.into_iter();
            for slot in slots {
                let data = match slot {
                    Some(data) => data,
                    None => resolved.next().ok_or_else(|| {
                        SpatialError::InvalidData("data reader returned too few records".into())
                    })?,
                };
                self.buffer.push_back(data);
            }
        }

        if !node.leaf {
            self.frames.push((node, 0));
        }
        Ok(())
    }

    /// Advances the walk until something is buffered or the tree is exhausted.
    fn fill(&mut self, store: &dyn PageStore) -> SpatialResult<()> {
        if !self.started {
            self.started = true;
            let root = store.root()?;
            if root.bounds.intersects(&self.query) {
                self.visit(root)?;
            }
        }

        while self.buffer.is_empty() {
            let Some((node, position)) = self.frames.last_mut() else {
                return Ok(());
            };
            let Some(entry) = node.entries.get(*position) else {
                self.frames.pop();
                continue;
            };
            *position += 1;

            if entry.child_id().is_some() && entry.envelope.intersects(&self.query) {
                let child = store.node(entry, node)?;
                self.visit(child)?;
            }
        }
        Ok(())
    }
}

impl Iterator for SearchIterator {
    type Item = SpatialResult<Data>;

    fn next(&mut self) -> Option<SpatialResult<Data>> {
        if self.finished {
            return None;
        }
        if self.state.tree_closed.load(Ordering::Acquire) {
            return self.fail(SpatialError::Closed);
        }
        if self.state.closed.load(Ordering::Acquire) {
            self.release();
            return None;
        }

        let store = self.store.clone()?;
        if store.is_closed() {
            return self.fail(SpatialError::Closed);
        }

        let locks = store.lock_manager();
        let _guard = locks.read();
        if locks.generation() != self.generation {
            return self.fail(SpatialError::ConcurrentModification);
        }

        if self.buffer.is_empty() {
            if let Err(e) = self.fill(store.as_ref()) {
                return self.fail(e);
            }
        }

        match self.buffer.pop_front() {
            Some(data) => Some(Ok(data)),
            None => {
                self.release();
                None
            }
        }
    }
}

impl Drop for SearchIterator {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

impl fmt::Debug for SearchIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchIterator")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("finished", &self.finished)
            .finish()
    }
}
