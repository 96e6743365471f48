use crate::common::{
    brute_force, cleanup, create_test_context, env, id_reader, random_envelopes, random_queries,
    record_ids, run_test, small_config, sorted_ids,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spatial_index::{
    ByteOrder, Envelope, IndexKind, Payload, QuadTreeBuilder, SpatialError, SpatialResult,
    SpatialTree,
};

/// 3602 shapes over the Iberian peninsula. Two of them pin the corners of
/// the union, every other one lies strictly inside it.
fn iberia() -> Vec<Envelope> {
    let mut rng = StdRng::seed_from_u64(1984);
    let mut shapes = Vec::with_capacity(3602);
    shapes.push(env(-8.8696, 36.1139, -8.8, 36.2));
    shapes.push(env(3.1, 43.5, 3.1880, 43.5597));
    while shapes.len() < 3602 {
        let x = rng.gen_range(-8.8..3.1);
        let y = rng.gen_range(36.2..43.5);
        let w = rng.gen_range(0.0..0.05);
        let h = rng.gen_range(0.0..0.05);
        shapes.push(env(x, y, x + w, y + h));
    }
    shapes
}

fn write_quadtree(shapes: &[Envelope], path: &std::path::Path) -> SpatialResult<()> {
    let mut builder = QuadTreeBuilder::new(env(-10.0, 35.0, 5.0, 45.0), 10)?;
    for (id, shape) in shapes.iter().enumerate() {
        builder.insert(id as u64, shape)?;
    }
    assert_eq!(builder.len(), 3602);
    builder.write(path, ByteOrder::BigEndian)
}

#[test]
fn test_packed_quadtree_fixture() {
    run_test(
        create_test_context,
        |ctx| {
            let path = ctx.path("iberia.sqt");
            let shapes = iberia();
            write_quadtree(&shapes, &path)?;

            let tree = SpatialTree::open_packed(&path)?;
            assert_eq!(tree.kind(), IndexKind::QuadTree);
            assert!(tree.is_read_only());
            assert_eq!(tree.entry_count()?, 3602);
            assert_eq!(tree.depth()?, 10);
            assert_eq!(
                tree.root_bounds()?,
                env(-8.8696, 36.1139, 3.1880, 43.5597)
            );
            tree.validate()?;

            let reader = id_reader(shapes.len());
            for query in [
                env(-4.0, 40.0, -3.0, 41.0),
                env(-9.0, 36.0, -8.8, 36.2),
                env(2.0, 42.0, 4.0, 44.0),
                env(-10.0, 35.0, 5.0, 45.0),
            ] {
                let expected = brute_force(&shapes, &query);
                assert_eq!(sorted_ids(tree.search_ids(&query)?), expected);
                let hits = tree.search(reader.clone(), &query)?;
                let records = hits.iter().collect::<SpatialResult<Vec<_>>>()?;
                assert_eq!(record_ids(records), expected);
            }
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_packed_quadtree_is_immutable() {
    run_test(
        create_test_context,
        |ctx| {
            let path = ctx.path("immutable.sqt");
            let shapes = iberia();
            write_quadtree(&shapes, &path)?;
            let before = std::fs::read(&path).map_err(|e| SpatialError::io("read", e))?;

            let tree = SpatialTree::open_packed(&path)?;
            assert!(matches!(
                tree.insert_id(9999, &env(0.0, 40.0, 0.1, 40.1)),
                Err(SpatialError::ReadOnly(_))
            ));
            assert!(matches!(
                tree.delete(&shapes[0], &Payload::Id(0)),
                Err(SpatialError::ReadOnly(_))
            ));
            assert!(!tree.trim()?);
            tree.flush()?;
            assert_eq!(tree.entry_count()?, 3602);
            tree.close(true)?;

            let after = std::fs::read(&path).map_err(|e| SpatialError::io("read", e))?;
            assert_eq!(before, after);
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_packed_rtree_round_trip() {
    run_test(
        create_test_context,
        |ctx| {
            let envelopes = random_envelopes(31, 1000, 1000.0, 20.0);
            let tree = SpatialTree::memory(small_config())?;
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }

            for byte_order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
                let path = ctx.path(&format!("rtree_{:?}.spx", byte_order));
                tree.write_packed(&path, byte_order)?;

                let packed = SpatialTree::open_packed(&path)?;
                assert_eq!(packed.kind(), IndexKind::RTree);
                assert_eq!(packed.entry_count()?, tree.entry_count()?);
                assert_eq!(packed.depth()?, tree.depth()?);
                assert_eq!(packed.root_bounds()?, tree.root_bounds()?);
                packed.validate()?;
                for query in random_queries(9, 20, 1000.0) {
                    assert_eq!(
                        sorted_ids(packed.search_ids(&query)?),
                        brute_force(&envelopes, &query)
                    );
                }
                packed.close(false)?;
            }
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_truncated_packed_file_is_corrupted() {
    run_test(
        create_test_context,
        |ctx| {
            let path = ctx.path("truncated.spx");
            let tree = SpatialTree::memory(small_config())?;
            for (id, envelope) in random_envelopes(32, 50, 100.0, 5.0).iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }
            tree.write_packed(&path, ByteOrder::LittleEndian)?;

            let bytes = std::fs::read(&path).map_err(|e| SpatialError::io("read", e))?;
            std::fs::write(&path, &bytes[..bytes.len() / 2])
                .map_err(|e| SpatialError::io("write", e))?;

            let packed = SpatialTree::open_packed(&path)?;
            assert!(matches!(packed.root_bounds(), Err(SpatialError::Corrupted(_))));

            std::fs::write(&path, b"not an index").map_err(|e| SpatialError::io("write", e))?;
            assert!(matches!(
                SpatialTree::open_packed(&path),
                Err(SpatialError::Corrupted(_))
            ));
            Ok(())
        },
        cleanup,
    );
}
