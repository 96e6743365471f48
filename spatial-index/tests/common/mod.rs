//! Shared fixtures for the integration tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spatial_index::{
    Data, DataReader, Envelope, MemoryDataReader, Payload, SpatialResult, TreeConfig, Value,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Runs `test` against a fresh context, then `after`, reporting the first
/// failure as a panic.
pub fn run_test<B, T, A>(before: B, test: T, after: A)
where
    B: Fn() -> SpatialResult<TestContext>,
    T: Fn(TestContext) -> SpatialResult<()>,
    A: Fn(TestContext) -> SpatialResult<()>,
{
    let ctx = match before() {
        Ok(ctx) => ctx,
        Err(e) => panic!("Before run failed: {:?}", e),
    };
    let result = test(ctx.clone());
    let cleanup = after(ctx);
    if let Err(e) = result {
        panic!("Test failed: {:?}", e);
    }
    if let Err(e) = cleanup {
        panic!("After run failed: {:?}", e);
    }
}

#[derive(Clone)]
pub struct TestContext {
    dir: Arc<TempDir>,
}

impl TestContext {
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn create_test_context() -> SpatialResult<TestContext> {
    let dir = tempfile::tempdir()
        .map_err(|e| spatial_index::SpatialError::io("create temp dir", e))?;
    Ok(TestContext { dir: Arc::new(dir) })
}

pub fn cleanup(_ctx: TestContext) -> SpatialResult<()> {
    Ok(())
}

pub fn small_config() -> TreeConfig {
    TreeConfig::builder()
        .max_entries(8)
        .min_entries(3)
        .build()
        .unwrap()
}

pub fn env(x1: f64, y1: f64, x2: f64, y2: f64) -> Envelope {
    Envelope::from_corners(x1, y1, x2, y2)
}

/// `count` seeded rectangles inside `[0, extent)` on both axes, each side at
/// most `max_side` long.
pub fn random_envelopes(seed: u64, count: usize, extent: f64, max_side: f64) -> Vec<Envelope> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let x = rng.gen_range(0.0..extent);
            let y = rng.gen_range(0.0..extent);
            let w = rng.gen_range(0.0..max_side);
            let h = rng.gen_range(0.0..max_side);
            env(x, y, x + w, y + h)
        })
        .collect()
}

/// Ids of the envelopes intersecting `query`, sorted.
pub fn brute_force(envelopes: &[Envelope], query: &Envelope) -> Vec<u64> {
    envelopes
        .iter()
        .enumerate()
        .filter(|(_, e)| e.intersects(query))
        .map(|(id, _)| id as u64)
        .collect()
}

/// Ids of the envelopes lying inside `query`, sorted.
pub fn brute_force_contained(envelopes: &[Envelope], query: &Envelope) -> Vec<u64> {
    envelopes
        .iter()
        .enumerate()
        .filter(|(_, e)| query.contains(e))
        .map(|(id, _)| id as u64)
        .collect()
}

pub fn sorted_ids(payloads: Vec<Payload>) -> Vec<u64> {
    let mut ids: Vec<u64> = payloads.iter().filter_map(Payload::id).collect();
    ids.sort_unstable();
    ids
}

/// A reader returning `Long(id)` for every id below `count`.
pub fn id_reader(count: usize) -> Arc<dyn DataReader> {
    let reader = MemoryDataReader::new();
    for id in 0..count as u64 {
        reader.insert(id, Data::from_values(vec![Value::Long(id as i64)]));
    }
    Arc::new(reader)
}

/// Drains search results produced by [`id_reader`] back into sorted ids.
pub fn record_ids(records: Vec<Data>) -> Vec<u64> {
    let mut ids: Vec<u64> = records
        .iter()
        .map(|record| match record.value(0) {
            Some(Value::Long(id)) => *id as u64,
            other => panic!("unexpected record value {:?}", other),
        })
        .collect();
    ids.sort_unstable();
    ids
}

pub fn random_queries(seed: u64, count: usize, extent: f64) -> Vec<Envelope> {
    random_envelopes(seed, count, extent, extent / 5.0)
}
