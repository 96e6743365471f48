//! # Spatial Index - Bounding-box indexing over pluggable page stores
//!
//! This crate provides an n-dimensional R-tree and an immutable 2-D quadtree
//! for indexing records by their axis-aligned bounding envelope.
//!
//! ## Features
//!
//! - **Pluggable Storage**: nodes live in memory, in a mutable paged file or
//!   in an immutable packed file read through a memory map
//! - **Lazy Loading**: file-backed nodes are read on demand behind an LRU cache
//! - **Split Policies**: Guttman's quadratic split or R*-style forced reinsertion
//! - **Bulk Loading**: balanced trees built bottom-up along a Hilbert curve
//! - **Lazy Search**: closeable, registered iterators resolving leaf ids in batches
//! - **Element Mappers**: id to envelope associations in memory, in a flat
//!   file or in SQLite
//! - **Thread Safe**: a read-write lock per store serializes mutations
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use spatial_index::{Data, DataReader, Envelope, MemoryDataReader, SpatialTree, TreeConfig, Value};
//!
//! # fn main() -> Result<(), spatial_index::SpatialError> {
//! let tree = SpatialTree::memory(TreeConfig::default())?;
//! tree.insert_id(1, &Envelope::from_corners(0.0, 0.0, 10.0, 10.0))?;
//! tree.insert_id(2, &Envelope::from_corners(50.0, 50.0, 60.0, 60.0))?;
//!
//! let reader = MemoryDataReader::new();
//! reader.insert(1, Data::from_values(vec![Value::Text("harbour".into())]));
//! reader.insert(2, Data::from_values(vec![Value::Text("airport".into())]));
//! let reader: Arc<dyn DataReader> = Arc::new(reader);
//!
//! let hits = tree.search(reader, &Envelope::from_corners(5.0, 5.0, 15.0, 15.0))?;
//! assert_eq!(hits.size()?, 1);
//! for record in hits.iter() {
//!     println!("{:?}", record?);
//! }
//!
//! tree.close(false)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod envelope;
pub mod hilbert;
pub mod lock;
pub mod mapper;
pub mod quadtree;
pub mod rtree;

pub use config::{ByteOrder, SplitStrategy, TreeConfig, TreeConfigBuilder};
pub use data::{Data, DataDefinition, DataReader, FieldKind, MemoryDataReader, Value};
pub use envelope::Envelope;
pub use hilbert::HilbertCurve;
pub use lock::LockManager;
pub use mapper::{FileElementMapper, MemoryElementMapper, TreeElementMapper};
#[cfg(feature = "sqlite")]
pub use mapper::SqlElementMapper;
pub use quadtree::QuadTreeBuilder;
pub use rtree::{
    IndexKind, PageStore, Payload, SearchCollection, SearchIterator, SpatialError,
    SpatialResult, SpatialTree, TreeStats,
};
