//! Tree element mappers.
//!
//! A mapper associates opaque leaf identifiers with their envelopes outside
//! of the tree's own node storage, so other components can resolve an id
//! without walking the tree. Three backends are provided:
//! - [`MemoryElementMapper`] keeps the association on the heap
//! - [`FileElementMapper`] persists it as a flat file of fixed-width records
//! - [`SqlElementMapper`] stores it in a SQLite schema derived from the index path

mod file;
mod memory;
#[cfg(feature = "sqlite")]
mod sql;

pub use file::FileElementMapper;
pub use memory::MemoryElementMapper;
#[cfg(feature = "sqlite")]
pub use sql::{schema_name, SqlElementMapper};

use crate::envelope::Envelope;
use crate::rtree::SpatialResult;

/// Association between leaf identifiers and envelopes.
///
/// Implementations fail every operation with
/// [`SpatialError::Closed`](crate::SpatialError::Closed) after [`close`](TreeElementMapper::close).
pub trait TreeElementMapper: Send + Sync {
    /// The envelope recorded for `id`, if any.
    fn envelope(&self, id: u64) -> SpatialResult<Option<Envelope>>;

    /// Records (or replaces) the envelope of `id`.
    fn set_envelope(&self, id: u64, envelope: &Envelope) -> SpatialResult<()>;

    /// Forgets `id`. Removing an unknown id is not an error.
    fn remove(&self, id: u64) -> SpatialResult<()>;

    /// Durably persists pending associations.
    fn flush(&self) -> SpatialResult<()>;

    /// Releases backing resources. Closing twice is a no-op.
    fn close(&self) -> SpatialResult<()>;

    /// Number of recorded associations.
    fn len(&self) -> SpatialResult<usize>;

    fn is_empty(&self) -> SpatialResult<bool> {
        Ok(self.len()? == 0)
    }
}
