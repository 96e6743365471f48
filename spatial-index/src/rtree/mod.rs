//! R-tree implementation over pluggable page stores.
//!
//! This module provides:
//! - The [`PageStore`] seam with memory, paged-file and packed-file stores
//! - An LRU page cache and checksummed pages for the paged file
//! - Quadratic and forced-reinsert overflow treatment
//! - Hilbert-ordered bulk loading
//! - Lazy, registered search iterators
//!
//! Nodes are loaded on demand; neither file store ever materializes the
//! whole tree.

pub mod bulk_load;
pub mod file_store;
pub mod memory_store;
pub mod packed_store;
pub mod page_store;
pub mod rtree_cache;
pub mod rtree_constants;
pub mod rtree_storage;
pub mod rtree_types;
pub mod search;
pub mod split;
mod rtree_impl;

pub use bulk_load::BulkLoader;
pub use file_store::FilePageStore;
pub use memory_store::MemoryPageStore;
pub use packed_store::{write_packed, IndexKind, PackedFileStore, PackedHeader, PackedNode};
pub use page_store::PageStore;
pub use rtree_constants::{DEFAULT_CACHE_PAGES, PAGE_SIZE};
pub use rtree_impl::SpatialTree;
pub use rtree_types::{
    Entry, EntryKind, FileHeader, Node, NodeId, Payload, SpatialError, SpatialResult,
    StoreMetadata, TreeStats,
};
pub use search::{IteratorRegistry, SearchCollection, SearchIterator, SearchMode};
pub use split::{ForcedReinsertSplit, QuadraticSplit, SplitPolicy};
