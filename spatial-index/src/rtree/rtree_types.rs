//! Core types and data structures shared by every page store.
//!
//! This module defines:
//! - Error types and result types
//! - Entries, payloads and nodes
//! - Statistics structures
//! - File header and page wrappers for the paged file store

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::data::Data;
use crate::envelope::Envelope;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur in spatial indexing operations
#[derive(Debug, Error)]
pub enum SpatialError {
    #[error("I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted index: {0}")]
    Corrupted(String),

    #[error("Store already closed")]
    Closed,

    #[error("Read-only index: {0}")]
    ReadOnly(String),

    #[error("Index was modified while a search was in progress")]
    ConcurrentModification,

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Node {page} too large: {size} bytes (max {max})")]
    NodeTooLarge { page: NodeId, size: usize, max: usize },

    #[error("Indexing error: {0}")]
    Indexing(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[cfg(feature = "sqlite")]
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),
}

impl SpatialError {
    /// Wraps an I/O error with the operation and node it happened on.
    pub fn io(context: impl Into<String>, source: io::Error) -> SpatialError {
        SpatialError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for failures that leave a store unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SpatialError::Io { .. } | SpatialError::Corrupted(_))
    }
}

/// Result type for spatial operations
pub type SpatialResult<T> = Result<T, SpatialError>;

/// Node identifier. Page number for the paged file store, byte offset for
/// the packed store, heap slot for the memory store.
pub type NodeId = u64;

// ============================================================================
// Entries and Nodes
// ============================================================================

/// What a leaf entry carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// An identifier resolved through a data reader or element mapper
    Id(u64),
    /// A record stored directly inside the leaf
    Inline(Data),
}

impl Payload {
    pub fn id(&self) -> Option<u64> {
        match self {
            Payload::Id(id) => Some(*id),
            Payload::Inline(_) => None,
        }
    }
}

/// The target of an entry: a child node or a data payload, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryKind {
    Child(NodeId),
    Data(Payload),
}

/// An envelope plus either a child pointer or a leaf payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub envelope: Envelope,
    pub kind: EntryKind,
}

impl Entry {
    pub fn data(envelope: Envelope, payload: Payload) -> Entry {
        Entry {
            envelope,
            kind: EntryKind::Data(payload),
        }
    }

    pub fn child(envelope: Envelope, node_id: NodeId) -> Entry {
        Entry {
            envelope,
            kind: EntryKind::Child(node_id),
        }
    }

    pub fn child_id(&self) -> Option<NodeId> {
        match self.kind {
            EntryKind::Child(id) => Some(id),
            EntryKind::Data(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.kind {
            EntryKind::Data(payload) => Some(payload),
            EntryKind::Child(_) => None,
        }
    }
}

/// A bounded container of entries.
///
/// `bounds` is kept equal to the union of the entry envelopes; every
/// mutation of `entries` inside the crate is followed by
/// [`Node::recompute_bounds`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Height above the leaves (leaves are 0)
    pub level: u32,
    pub leaf: bool,
    pub bounds: Envelope,
    pub entries: Vec<Entry>,
    /// Not persisted; set when the node is resolved through its parent
    #[serde(skip)]
    pub parent: Option<NodeId>,
}

impl Node {
    pub fn new(id: NodeId, leaf: bool, dimension: usize) -> Node {
        Node {
            id,
            level: 0,
            leaf,
            bounds: Envelope::null(dimension),
            entries: Vec::new(),
            parent: None,
        }
    }

    /// Compute the union of the entry envelopes
    pub fn compute_bounds(&self) -> Envelope {
        let mut bounds = Envelope::null(self.bounds.dimension());
        for entry in &self.entries {
            bounds.expand_to_include(&entry.envelope);
        }
        bounds
    }

    pub fn recompute_bounds(&mut self) {
        self.bounds = self.compute_bounds();
    }

    pub fn add_entry(&mut self, entry: Entry) {
        self.bounds.expand_to_include(&entry.envelope);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of the entry pointing at `child`.
    pub fn child_position(&self, child: NodeId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.child_id() == Some(child))
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics about tree and store operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeStats {
    pub total_entries: u64,
    pub depth: u32,
    pub cached_pages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    pub open_iterators: usize,
}

/// Tree-level facts a store persists alongside its nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetadata {
    pub entry_count: u64,
    /// Number of node levels from root to leaves (1 for a lone leaf root)
    pub depth: u32,
}

// ============================================================================
// Free List Page
// ============================================================================

/// A free page in the free list chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreePage {
    /// Next free page in the chain (0 = end of chain)
    pub next_free: NodeId,
}

// ============================================================================
// Page with Checksum
// ============================================================================

/// A node wrapped with a CRC-32 checksum for corruption detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWithChecksum {
    pub checksum: u32,
    pub node: Node,
}

impl PageWithChecksum {
    pub fn new(node: Node, node_bytes: &[u8]) -> Self {
        Self {
            checksum: crc32(node_bytes),
            node,
        }
    }

    /// Verify checksum against the node's own encoding and return the node
    pub fn into_node(self, node_bytes: &[u8]) -> SpatialResult<Node> {
        let expected = crc32(node_bytes);
        if self.checksum != expected {
            return Err(SpatialError::Corrupted(format!(
                "page {} checksum mismatch (expected: {:x}, got: {:x})",
                self.node.id, expected, self.checksum
            )));
        }
        Ok(self.node)
    }
}

/// CRC-32/MPEG-2.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    const POLY: u32 = 0x04C11DB7;

    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x80000000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }

    crc ^ 0xFFFFFFFF
}

// ============================================================================
// File Header
// ============================================================================

/// Header stored in page 0 of a paged index file, after the byte-order marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub dimension: u32,
    pub root_page: NodeId,
    pub next_page_id: NodeId,
    pub entry_count: u64,
    pub depth: u32,
    pub free_list_head: NodeId,
    pub free_page_count: u64,
}

impl FileHeader {
    pub fn new(page_size: u32, dimension: u32) -> Self {
        Self {
            magic: super::rtree_constants::MAGIC,
            version: super::rtree_constants::VERSION,
            page_size,
            dimension,
            root_page: 0,
            next_page_id: 1,
            entry_count: 0,
            depth: 0,
            free_list_head: 0,
            free_page_count: 0,
        }
    }

    pub fn validate(&self) -> SpatialResult<()> {
        if self.magic != super::rtree_constants::MAGIC {
            return Err(SpatialError::Corrupted(
                "invalid file format (bad magic)".into(),
            ));
        }
        if self.version != super::rtree_constants::VERSION {
            return Err(SpatialError::Corrupted(format!(
                "unsupported file format version {}",
                self.version
            )));
        }
        Ok(())
    }
}
