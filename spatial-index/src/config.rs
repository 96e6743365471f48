use std::sync::Arc;

use crate::rtree::rtree_constants::{
    DEFAULT_CACHE_PAGES, DEFAULT_MAX_ENTRIES, DEFAULT_MIN_ENTRIES, DEFAULT_REINSERT_FRACTION,
    MIN_PAGE_SIZE, PAGE_SIZE,
};
use crate::rtree::{SpatialError, SpatialResult};

/// Byte order of every multi-byte record an index writes.
///
/// The order is declared by the caller when a file is created and recorded
/// in the file itself, so readers never guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    BigEndian,
    #[default]
    LittleEndian,
}

impl ByteOrder {
    /// Marker byte stored at the front of every index file.
    pub fn marker(self) -> u8 {
        match self {
            ByteOrder::LittleEndian => 1,
            ByteOrder::BigEndian => 2,
        }
    }

    pub fn from_marker(marker: u8) -> SpatialResult<ByteOrder> {
        match marker {
            1 => Ok(ByteOrder::LittleEndian),
            2 => Ok(ByteOrder::BigEndian),
            other => Err(SpatialError::Corrupted(format!(
                "unknown byte order marker {}",
                other
            ))),
        }
    }

    pub fn native() -> ByteOrder {
        if cfg!(target_endian = "big") {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }
}

/// How an overflowing node is treated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SplitStrategy {
    /// Guttman's quadratic split.
    Quadratic,
    /// R*-style forced reinsertion of `fraction` of the entries on the first
    /// overflow of each level, quadratic split afterwards.
    ForcedReinsert { fraction: f64 },
}

impl Default for SplitStrategy {
    fn default() -> Self {
        SplitStrategy::Quadratic
    }
}

#[derive(Clone, Debug)]
/// Tree configuration.
///
/// A cloneable, immutable holder for the tuning parameters of a
/// [`SpatialTree`](crate::SpatialTree). Uses `Arc<TreeConfigInner>` so every
/// store, policy and iterator can share the same instance.
///
/// Create via [`TreeConfig::builder()`] or take [`TreeConfig::default()`].
pub struct TreeConfig {
    inner: Arc<TreeConfigInner>,
}

#[derive(Debug)]
struct TreeConfigInner {
    dimension: usize,
    max_entries: usize,
    min_entries: usize,
    split_strategy: SplitStrategy,
    page_size: usize,
    cache_pages: usize,
    byte_order: ByteOrder,
}

impl TreeConfig {
    /// Starts a builder populated with the defaults.
    pub fn builder() -> TreeConfigBuilder {
        TreeConfigBuilder::new()
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.inner.dimension
    }

    /// Maximum number of entries a node may hold.
    #[inline]
    pub fn max_entries(&self) -> usize {
        self.inner.max_entries
    }

    /// Minimum number of entries a non-root node must hold.
    #[inline]
    pub fn min_entries(&self) -> usize {
        self.inner.min_entries
    }

    #[inline]
    pub fn split_strategy(&self) -> SplitStrategy {
        self.inner.split_strategy
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    #[inline]
    pub fn cache_pages(&self) -> usize {
        self.inner.cache_pages
    }

    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.inner.byte_order
    }

    /// Returns a copy of this configuration with a different dimension.
    pub(crate) fn with_dimension(&self, dimension: usize) -> TreeConfig {
        TreeConfig {
            inner: Arc::new(TreeConfigInner {
                dimension,
                max_entries: self.inner.max_entries,
                min_entries: self.inner.min_entries,
                split_strategy: self.inner.split_strategy,
                page_size: self.inner.page_size,
                cache_pages: self.inner.cache_pages,
                byte_order: self.inner.byte_order,
            }),
        }
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            inner: Arc::new(TreeConfigInner {
                dimension: 2,
                max_entries: DEFAULT_MAX_ENTRIES,
                min_entries: DEFAULT_MIN_ENTRIES,
                split_strategy: SplitStrategy::Quadratic,
                page_size: PAGE_SIZE,
                cache_pages: DEFAULT_CACHE_PAGES,
                byte_order: ByteOrder::default(),
            }),
        }
    }
}

/// Builder for [`TreeConfig`].
///
/// ```rust
/// use spatial_index::{SplitStrategy, TreeConfig};
///
/// let config = TreeConfig::builder()
///     .dimension(3)
///     .max_entries(16)
///     .min_entries(6)
///     .split_strategy(SplitStrategy::ForcedReinsert { fraction: 0.3 })
///     .build()
///     .unwrap();
/// assert_eq!(config.dimension(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct TreeConfigBuilder {
    dimension: usize,
    max_entries: usize,
    min_entries: usize,
    split_strategy: SplitStrategy,
    page_size: usize,
    cache_pages: usize,
    byte_order: ByteOrder,
}

impl TreeConfigBuilder {
    pub fn new() -> TreeConfigBuilder {
        TreeConfigBuilder {
            dimension: 2,
            max_entries: DEFAULT_MAX_ENTRIES,
            min_entries: DEFAULT_MIN_ENTRIES,
            split_strategy: SplitStrategy::Quadratic,
            page_size: PAGE_SIZE,
            cache_pages: DEFAULT_CACHE_PAGES,
            byte_order: ByteOrder::default(),
        }
    }

    /// R*-style preset: forced reinsertion of 30 % of an overflowing node.
    pub fn star_preset(self) -> Self {
        self.split_strategy(SplitStrategy::ForcedReinsert {
            fraction: DEFAULT_REINSERT_FRACTION,
        })
    }

    pub fn dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn min_entries(mut self, min_entries: usize) -> Self {
        self.min_entries = min_entries;
        self
    }

    pub fn split_strategy(mut self, split_strategy: SplitStrategy) -> Self {
        self.split_strategy = split_strategy;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn cache_pages(mut self, cache_pages: usize) -> Self {
        self.cache_pages = cache_pages;
        self
    }

    pub fn byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Validates the parameters and freezes them into a [`TreeConfig`].
    pub fn build(self) -> SpatialResult<TreeConfig> {
        if self.dimension == 0 {
            return Err(SpatialError::InvalidConfig(
                "dimension must be at least 1".into(),
            ));
        }
        if self.max_entries < 4 {
            return Err(SpatialError::InvalidConfig(format!(
                "max_entries must be at least 4, got {}",
                self.max_entries
            )));
        }
        if self.min_entries == 0 || self.min_entries > self.max_entries / 2 {
            return Err(SpatialError::InvalidConfig(format!(
                "min_entries must be in 1..={}, got {}",
                self.max_entries / 2,
                self.min_entries
            )));
        }
        if let SplitStrategy::ForcedReinsert { fraction } = self.split_strategy {
            if !(fraction > 0.0 && fraction < 1.0) {
                return Err(SpatialError::InvalidConfig(format!(
                    "reinsert fraction must be in (0, 1), got {}",
                    fraction
                )));
            }
        }
        if self.page_size < MIN_PAGE_SIZE {
            return Err(SpatialError::InvalidConfig(format!(
                "page_size must be at least {}, got {}",
                MIN_PAGE_SIZE, self.page_size
            )));
        }
        if self.cache_pages == 0 {
            return Err(SpatialError::InvalidConfig(
                "cache_pages must be at least 1".into(),
            ));
        }

        Ok(TreeConfig {
            inner: Arc::new(TreeConfigInner {
                dimension: self.dimension,
                max_entries: self.max_entries,
                min_entries: self.min_entries,
                split_strategy: self.split_strategy,
                page_size: self.page_size,
                cache_pages: self.cache_pages,
                byte_order: self.byte_order,
            }),
        })
    }
}

impl Default for TreeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
