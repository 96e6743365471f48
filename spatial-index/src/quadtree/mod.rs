//! Offline quadtree construction.
//!
//! Quadtrees are built in memory with [`QuadTreeBuilder`] and written once in
//! the packed format. Reading goes through
//! [`SpatialTree::open_packed`](crate::SpatialTree::open_packed), which
//! yields a read-only tree.

mod builder;

pub use builder::QuadTreeBuilder;
