//! Bottom-up tree construction along the Hilbert curve.
//!
//! Entries are sorted by the Hilbert index of their centre (normalized into
//! the grid spanned by the global bounds), packed into leaves in runs of
//! `max_entries`, and the resulting nodes are grouped the same way level by
//! level until a single root remains.

use crate::config::TreeConfig;
use crate::envelope::Envelope;
use crate::hilbert::{grid_cell, hilbert_index, HilbertCurve, MAX_CURVE_BITS};

use super::page_store::PageStore;
use super::rtree_constants::DEFAULT_HILBERT_ORDER;
use super::rtree_types::{Entry, Node, NodeId, SpatialResult};

/// Packs entries into a [`PageStore`] bottom-up.
#[derive(Debug, Clone)]
pub struct BulkLoader {
    dimension: usize,
    order: u32,
    max_entries: usize,
    min_entries: usize,
}

impl BulkLoader {
    /// Creates a loader for the configured dimension.
    ///
    /// Fails with [`SpatialError::Indexing`](super::SpatialError::Indexing)
    /// when no Hilbert grid fits the dimension; callers then fall back to
    /// one-by-one insertion.
    pub fn new(config: &TreeConfig) -> SpatialResult<BulkLoader> {
        let dimension = config.dimension();
        let per_axis = MAX_CURVE_BITS / u32::try_from(dimension).unwrap_or(u32::MAX).max(1);
        let order = per_axis.min(DEFAULT_HILBERT_ORDER);
        HilbertCurve::new(dimension, order)?;

        Ok(BulkLoader {
            dimension,
            order,
            max_entries: config.max_entries(),
            min_entries: config.min_entries(),
        })
    }

    /// Grid order used for sorting.
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Sorts entries along the Hilbert curve. Ties keep their input order.
    pub fn sort(&self, entries: Vec<Entry>) -> SpatialResult<Vec<Entry>> {
        let mut bounds = Envelope::null(self.dimension);
        for entry in &entries {
            bounds.expand_to_include(&entry.envelope);
        }

        let mut keyed = entries
            .into_iter()
            .map(|entry| {
                let cell = grid_cell(&entry.envelope.center(), &bounds, self.order);
                hilbert_index(&cell, self.order).map(|key| (key, entry))
            })
            .collect::<SpatialResult<Vec<_>>>()?;
        keyed.sort_by_key(|(key, _)| *key);
        Ok(keyed.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Splits entries into runs of `max_entries`; the last run borrows from
    /// the one before it so it holds at least `min_entries`.
    pub fn pack(&self, entries: Vec<Entry>) -> Vec<Vec<Entry>> {
        let mut runs: Vec<Vec<Entry>> = Vec::with_capacity(entries.len() / self.max_entries + 1);
        let mut iter = entries.into_iter().peekable();
        while iter.peek().is_some() {
            runs.push(iter.by_ref().take(self.max_entries).collect());
        }

        let count = runs.len();
        if count >= 2 && runs[count - 1].len() < self.min_entries {
            let missing = self.min_entries - runs[count - 1].len();
            let previous = &mut runs[count - 2];
            let moved: Vec<Entry> = previous.drain(previous.len() - missing..).collect();
            let last = &mut runs[count - 1];
            let mut rebalanced = moved;
            rebalanced.append(last);
            *last = rebalanced;
        }
        runs
    }

    /// Builds a tree holding `entries` and installs its root in `store`.
    ///
    /// The store's previous nodes are left untouched; callers free them once
    /// the load succeeded. On failure every node allocated by the load is
    /// released again and the previous root stays installed.
    pub fn load(&self, store: &dyn PageStore, entries: Vec<Entry>) -> SpatialResult<Node> {
        let mut allocated = Vec::new();
        let result = self.build(store, entries, &mut allocated);
        if result.is_err() {
            for id in allocated {
                let node = Node::new(id, true, self.dimension);
                if let Err(e) = store.free(&node) {
                    log::warn!("Failed to release node {} after aborted bulk load: {}", id, e);
                }
            }
        }
        result
    }

    fn build(
        &self,
        store: &dyn PageStore,
        entries: Vec<Entry>,
        allocated: &mut Vec<NodeId>,
    ) -> SpatialResult<Node> {
        let total = entries.len();
        if entries.is_empty() {
            let mut root = store.empty_node(true)?;
            allocated.push(root.id);
            store.set_root(&mut root)?;
            return Ok(root);
        }

        let mut current = self.sort(entries)?;
        let mut level = 0u32;
        loop {
            let runs = self.pack(current);
            let single = runs.len() == 1;
            let mut parents = Vec::with_capacity(runs.len());

            for run in runs {
                let mut node = store.empty_node(level == 0)?;
                allocated.push(node.id);
                node.level = level;
                node.entries = run;
                node.recompute_bounds();

                if single {
                    store.set_root(&mut node)?;
                    log::debug!(
                        "Bulk loaded {} entries into {} levels",
                        total,
                        level + 1
                    );
                    return Ok(node);
                }
                store.write_node(&node)?;
                parents.push(store.entry_pointing_node(&node));
            }

            current = parents;
            level += 1;
        }
    }

    /// Number of nodes [`BulkLoader::load`] creates for `entry_count` entries.
    pub fn packed_node_count(&self, entry_count: u64) -> u64 {
        let max = self.max_entries as u64;
        let mut count = entry_count;
        let mut nodes = 0;
        loop {
            let level_nodes = count.div_ceil(max).max(1);
            nodes += level_nodes;
            if level_nodes == 1 {
                return nodes;
            }
            count = level_nodes;
        }
    }
}
