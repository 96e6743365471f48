use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::envelope::Envelope;
use crate::rtree::{SpatialError, SpatialResult};

use super::TreeElementMapper;

/// Heap-backed [`TreeElementMapper`]. Nothing survives the process.
#[derive(Default)]
pub struct MemoryElementMapper {
    envelopes: RwLock<HashMap<u64, Envelope>>,
    closed: AtomicBool,
}

impl MemoryElementMapper {
    pub fn new() -> MemoryElementMapper {
        MemoryElementMapper::default()
    }

    fn check_open(&self) -> SpatialResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(SpatialError::Closed)
        } else {
            Ok(())
        }
    }
}

impl TreeElementMapper for MemoryElementMapper {
    fn envelope(&self, id: u64) -> SpatialResult<Option<Envelope>> {
        self.check_open()?;
        Ok(self.envelopes.read().get(&id).cloned())
    }

    fn set_envelope(&self, id: u64, envelope: &Envelope) -> SpatialResult<()> {
        self.check_open()?;
        self.envelopes.write().insert(id, envelope.clone());
        Ok(())
    }

    fn remove(&self, id: u64) -> SpatialResult<()> {
        self.check_open()?;
        self.envelopes.write().remove(&id);
        Ok(())
    }

    fn flush(&self) -> SpatialResult<()> {
        self.check_open()
    }

    fn close(&self) -> SpatialResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.envelopes.write().clear();
        }
        Ok(())
    }

    fn len(&self) -> SpatialResult<usize> {
        self.check_open()?;
        Ok(self.envelopes.read().len())
    }
}
