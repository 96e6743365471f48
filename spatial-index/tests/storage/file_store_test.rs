use crate::common::{
    brute_force, cleanup, create_test_context, random_envelopes, random_queries, run_test,
    small_config, sorted_ids,
};
use spatial_index::{ByteOrder, Payload, SpatialError, SpatialTree, TreeConfig};

fn config(byte_order: ByteOrder) -> TreeConfig {
    TreeConfig::builder()
        .max_entries(8)
        .min_entries(3)
        .cache_pages(16)
        .byte_order(byte_order)
        .build()
        .unwrap()
}

#[test]
fn test_file_tree_round_trip() {
    run_test(
        create_test_context,
        |ctx| {
            for byte_order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
                let path = ctx.path(&format!("round_trip_{:?}.idx", byte_order));
                let envelopes = random_envelopes(21, 1200, 1000.0, 20.0);

                let tree = SpatialTree::create_file(&path, config(byte_order))?;
                for (id, envelope) in envelopes.iter().enumerate() {
                    tree.insert_id(id as u64, envelope)?;
                }
                let depth = tree.depth()?;
                let bounds = tree.root_bounds()?;
                tree.close(false)?;

                // the file's byte order wins over the one configured here
                let reopened = SpatialTree::open_file(&path, small_config())?;
                assert_eq!(reopened.entry_count()?, 1200);
                assert_eq!(reopened.depth()?, depth);
                assert_eq!(reopened.root_bounds()?, bounds);
                reopened.validate()?;
                for query in random_queries(5, 20, 1000.0) {
                    assert_eq!(
                        sorted_ids(reopened.search_ids(&query)?),
                        brute_force(&envelopes, &query)
                    );
                }
                reopened.close(false)?;
            }
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_reopened_file_accepts_updates() {
    run_test(
        create_test_context,
        |ctx| {
            let path = ctx.path("updates.idx");
            let envelopes = random_envelopes(22, 600, 1000.0, 20.0);

            let tree = SpatialTree::create_file(&path, small_config())?;
            for (id, envelope) in envelopes.iter().enumerate().take(300) {
                tree.insert_id(id as u64, envelope)?;
            }
            tree.close(false)?;

            let tree = SpatialTree::open_file(&path, small_config())?;
            for (id, envelope) in envelopes.iter().enumerate().skip(300) {
                tree.insert_id(id as u64, envelope)?;
            }
            for id in (0..600).step_by(2) {
                tree.delete(&envelopes[id], &Payload::Id(id as u64))?;
            }
            tree.validate()?;
            tree.close(false)?;

            let tree = SpatialTree::open_file(&path, small_config())?;
            assert_eq!(tree.entry_count()?, 300);
            tree.validate()?;
            for query in random_queries(6, 20, 1000.0) {
                let expected: Vec<u64> = brute_force(&envelopes, &query)
                    .into_iter()
                    .filter(|id| id % 2 == 1)
                    .collect();
                assert_eq!(sorted_ids(tree.search_ids(&query)?), expected);
            }
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_small_cache_still_serves_queries() {
    run_test(
        create_test_context,
        |ctx| {
            let path = ctx.path("cache.idx");
            let config = TreeConfig::builder()
                .max_entries(8)
                .min_entries(3)
                .cache_pages(2)
                .build()?;
            let envelopes = random_envelopes(23, 500, 1000.0, 20.0);

            let tree = SpatialTree::create_file(&path, config)?;
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }
            tree.flush()?;
            for query in random_queries(7, 10, 1000.0) {
                assert_eq!(
                    sorted_ids(tree.search_ids(&query)?),
                    brute_force(&envelopes, &query)
                );
            }

            let stats = tree.stats()?;
            assert!(stats.cached_pages <= 2);
            assert!(stats.disk_reads > 0);
            assert_eq!(stats.total_entries, 500);
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_trim_file_tree() {
    run_test(
        create_test_context,
        |ctx| {
            let path = ctx.path("trim.idx");
            let envelopes = random_envelopes(24, 800, 1000.0, 20.0);
            let tree = SpatialTree::create_file(&path, small_config())?;
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }

            assert!(tree.trim()?);
            tree.validate()?;
            tree.close(false)?;

            let tree = SpatialTree::open_file(&path, small_config())?;
            assert_eq!(tree.entry_count()?, 800);
            tree.validate()?;
            for query in random_queries(8, 10, 1000.0) {
                assert_eq!(
                    sorted_ids(tree.search_ids(&query)?),
                    brute_force(&envelopes, &query)
                );
            }
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_garbage_file_is_rejected() {
    run_test(
        create_test_context,
        |ctx| {
            let path = ctx.path("garbage.idx");
            let mut bytes = vec![0u8; 4096];
            bytes[0] = ByteOrder::LittleEndian.marker();
            std::fs::write(&path, &bytes).map_err(|e| SpatialError::io("write garbage", e))?;

            assert!(matches!(
                SpatialTree::open_file(&path, small_config()),
                Err(SpatialError::Corrupted(_))
            ));
            assert!(matches!(
                SpatialTree::open_file(ctx.path("missing.idx"), small_config()),
                Err(SpatialError::Io { .. })
            ));
            Ok(())
        },
        cleanup,
    );
}
