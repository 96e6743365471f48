use crate::common::{
    brute_force, brute_force_contained, cleanup, create_test_context, id_reader, random_envelopes,
    random_queries, record_ids, run_test, small_config, sorted_ids,
};
use spatial_index::rtree::MemoryPageStore;
use spatial_index::{Envelope, Payload, SpatialResult, SpatialTree, SplitStrategy, TreeConfig};
use std::sync::Arc;

fn check_queries(tree: &SpatialTree, envelopes: &[Envelope], seed: u64) -> SpatialResult<()> {
    let reader = id_reader(envelopes.len());
    for query in random_queries(seed, 25, 1000.0) {
        let expected = brute_force(envelopes, &query);
        assert_eq!(sorted_ids(tree.search_ids(&query)?), expected, "query {}", query);

        let hits = tree.search(reader.clone(), &query)?;
        let records = hits.iter().collect::<SpatialResult<Vec<_>>>()?;
        assert_eq!(record_ids(records), expected, "lazy query {}", query);
        assert_eq!(hits.size()?, expected.len());
        assert_eq!(hits.is_empty()?, expected.is_empty());
        hits.close();

        let contained = tree.search_contained(reader.clone(), &query)?;
        let records = contained.iter().collect::<SpatialResult<Vec<_>>>()?;
        assert_eq!(record_ids(records), brute_force_contained(envelopes, &query));
    }
    Ok(())
}

#[test]
fn test_quadratic_tree_matches_brute_force() {
    run_test(
        create_test_context,
        |_ctx| {
            let envelopes = random_envelopes(42, 1500, 1000.0, 30.0);
            let tree = SpatialTree::memory(small_config())?;
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }
            check_queries(&tree, &envelopes, 1)
        },
        cleanup,
    );
}

#[test]
fn test_forced_reinsert_tree_matches_brute_force() {
    run_test(
        create_test_context,
        |_ctx| {
            let config = TreeConfig::builder()
                .max_entries(10)
                .min_entries(4)
                .split_strategy(SplitStrategy::ForcedReinsert { fraction: 0.3 })
                .build()?;
            let envelopes = random_envelopes(43, 1500, 1000.0, 30.0);
            let tree = SpatialTree::memory(config)?;
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }
            tree.validate()?;
            check_queries(&tree, &envelopes, 2)
        },
        cleanup,
    );
}

#[test]
fn test_bulk_loaded_tree_matches_brute_force() {
    run_test(
        create_test_context,
        |_ctx| {
            let config = small_config();
            let envelopes = random_envelopes(44, 2000, 1000.0, 30.0);
            let store = Arc::new(MemoryPageStore::new(config.dimension()));
            let tree = SpatialTree::bulk_load(
                store,
                config,
                envelopes
                    .iter()
                    .enumerate()
                    .map(|(id, e)| (Payload::Id(id as u64), e.clone())),
            )?;
            tree.validate()?;
            assert_eq!(tree.entry_count()?, 2000);
            check_queries(&tree, &envelopes, 3)
        },
        cleanup,
    );
}

#[test]
fn test_queries_survive_mixed_updates() {
    run_test(
        create_test_context,
        |_ctx| {
            let envelopes = random_envelopes(45, 800, 1000.0, 30.0);
            let tree = SpatialTree::memory(small_config())?;
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }
            // delete every third entry
            let mut live = Vec::new();
            for id in 0..envelopes.len() {
                if id % 3 == 0 {
                    tree.delete_id(id as u64)?;
                } else {
                    live.push(id as u64);
                }
            }
            tree.validate()?;

            for query in random_queries(4, 25, 1000.0) {
                let expected: Vec<u64> = brute_force(&envelopes, &query)
                    .into_iter()
                    .filter(|id| id % 3 != 0)
                    .collect();
                assert_eq!(sorted_ids(tree.search_ids(&query)?), expected);
            }
            assert_eq!(tree.entry_count()?, live.len() as u64);
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_three_dimensional_queries() {
    run_test(
        create_test_context,
        |_ctx| {
            let config = TreeConfig::builder()
                .dimension(3)
                .max_entries(6)
                .min_entries(2)
                .build()?;
            let tree = SpatialTree::memory(config)?;
            let mut boxes = Vec::new();
            for i in 0..200u64 {
                let base = [(i % 7) as f64, ((i / 7) % 7) as f64, (i / 49) as f64];
                let max: Vec<f64> = base.iter().map(|v| v + 0.5).collect();
                let envelope = Envelope::new(base.to_vec(), max)?;
                tree.insert_id(i, &envelope)?;
                boxes.push(envelope);
            }
            tree.validate()?;

            let query = Envelope::new(vec![1.0, 1.0, 1.0], vec![2.2, 2.2, 2.2])?;
            let expected: Vec<u64> = boxes
                .iter()
                .enumerate()
                .filter(|(_, b)| b.intersects(&query))
                .map(|(id, _)| id as u64)
                .collect();
            assert_eq!(expected.len(), 8);
            assert_eq!(sorted_ids(tree.search_ids(&query)?), expected);
            Ok(())
        },
        cleanup,
    );
}
