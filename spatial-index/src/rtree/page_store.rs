//! The storage seam between the tree algorithms and where nodes live.

use crate::lock::LockManager;

use super::rtree_types::{Entry, Node, SpatialResult, StoreMetadata, TreeStats};

/// Node storage used by [`SpatialTree`](crate::SpatialTree).
///
/// Nodes are handed out as owned copies; a modified node only becomes
/// visible after [`PageStore::write_node`] (or [`PageStore::set_root`]).
/// A freshly created store always holds an empty leaf root.
///
/// Every method fails with [`SpatialError::Closed`](super::SpatialError::Closed)
/// once the store is closed, and read-only stores fail every mutation with
/// [`SpatialError::ReadOnly`](super::SpatialError::ReadOnly).
pub trait PageStore: Send + Sync {
    /// Loads the current root node.
    fn root(&self) -> SpatialResult<Node>;

    /// Makes `node` the root, writing it and clearing its parent link.
    fn set_root(&self, node: &mut Node) -> SpatialResult<()>;

    /// Allocates a new, empty node at level 0. The node is not stored until
    /// it is written.
    fn empty_node(&self, leaf: bool) -> SpatialResult<Node>;

    /// Resolves the child an entry points to, linking it to `parent`.
    fn node(&self, entry: &Entry, parent: &Node) -> SpatialResult<Node>;

    /// Builds the entry a parent uses to reference `node`.
    fn entry_pointing_node(&self, node: &Node) -> Entry {
        Entry::child(node.bounds.clone(), node.id)
    }

    /// Stores the current state of a node.
    fn write_node(&self, node: &Node) -> SpatialResult<()>;

    /// Releases a node's storage for reuse.
    fn free(&self, node: &Node) -> SpatialResult<()>;

    /// Pushes buffered state down to the backing medium.
    fn flush(&self) -> SpatialResult<()>;

    /// Closes the store. Closing twice is a no-op.
    fn close(&self) -> SpatialResult<()>;

    fn is_closed(&self) -> bool;

    fn is_read_only(&self) -> bool {
        false
    }

    /// Number of coordinates per envelope.
    fn dimension(&self) -> usize;

    fn metadata(&self) -> SpatialResult<StoreMetadata>;

    fn set_metadata(&self, metadata: StoreMetadata) -> SpatialResult<()>;

    /// The lock coordinating readers and writers of this store.
    fn lock_manager(&self) -> &LockManager;

    /// Number of live nodes.
    fn node_count(&self) -> SpatialResult<u64>;

    fn stats(&self) -> TreeStats {
        TreeStats::default()
    }
}
