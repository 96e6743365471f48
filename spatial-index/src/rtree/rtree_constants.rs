//! Constants for the R-tree page stores and file formats.

/// Default page size (16KB) - balances I/O efficiency and memory usage
pub const PAGE_SIZE: usize = 16384;

/// Smallest page size a paged file may use
pub const MIN_PAGE_SIZE: usize = 512;

/// Maximum number of entries per node
pub const DEFAULT_MAX_ENTRIES: usize = 64;

/// Minimum entries before underflow (typically 40% of max)
pub const DEFAULT_MIN_ENTRIES: usize = 25;

/// Share of an overflowing node's entries removed by forced reinsertion
pub const DEFAULT_REINSERT_FRACTION: f64 = 0.3;

/// Default cache size in number of pages (16MB with 16KB pages)
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Magic number for paged file identification
pub const MAGIC: u32 = 0x53504958; // "SPIX"

/// Paged file format version
pub const VERSION: u32 = 1;

/// Magic prefix of the packed (immutable) format
pub const PACKED_MAGIC: &[u8; 3] = b"SPX";

/// Packed file format version
pub const PACKED_VERSION: u8 = 1;

/// Size of the fixed packed-file header preceding the root node
pub const PACKED_HEADER_LEN: usize = 16;

/// Grid order used to sort entries along the Hilbert curve during bulk loads
pub const DEFAULT_HILBERT_ORDER: u32 = 16;
