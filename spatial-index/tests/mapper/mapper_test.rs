use crate::common::{cleanup, create_test_context, random_envelopes, run_test, small_config};
use spatial_index::{
    ByteOrder, FileElementMapper, MemoryElementMapper, SpatialError, SpatialTree,
    TreeElementMapper,
};
use std::sync::Arc;

#[test]
fn test_file_mapper_persists_with_tree() {
    run_test(
        create_test_context,
        |ctx| {
            let index = ctx.path("mapped.idx");
            let elements = ctx.path("mapped.elements");
            let envelopes = random_envelopes(51, 300, 1000.0, 20.0);

            let mapper = Arc::new(FileElementMapper::open(&elements, ByteOrder::BigEndian)?);
            let tree = SpatialTree::create_file(&index, small_config())?.with_mapper(mapper);
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }
            tree.close(true)?;

            // the file's byte order is kept even when asked for another one
            let mapper = Arc::new(FileElementMapper::open(&elements, ByteOrder::LittleEndian)?);
            assert_eq!(mapper.byte_order(), ByteOrder::BigEndian);
            assert_eq!(mapper.len()?, 300);
            assert_eq!(mapper.envelope(42)?, Some(envelopes[42].clone()));

            let tree = SpatialTree::open_file(&index, small_config())?.with_mapper(mapper.clone());
            for id in 0..100u64 {
                tree.delete_id(id)?;
            }
            assert_eq!(tree.entry_count()?, 200);
            assert_eq!(mapper.len()?, 200);
            assert_eq!(mapper.envelope(5)?, None);
            assert!(matches!(tree.delete_id(5), Err(SpatialError::EntryNotFound(_))));
            tree.close(true)?;
            assert!(matches!(mapper.len(), Err(SpatialError::Closed)));

            let reopened = FileElementMapper::open(&elements, ByteOrder::BigEndian)?;
            assert_eq!(reopened.len()?, 200);
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_unflushed_file_mapper_is_discarded() {
    run_test(
        create_test_context,
        |ctx| {
            let elements = ctx.path("discarded.elements");
            let mapper = Arc::new(FileElementMapper::open(&elements, ByteOrder::LittleEndian)?);
            let tree = SpatialTree::memory(small_config())?.with_mapper(mapper);
            for (id, envelope) in random_envelopes(52, 20, 100.0, 5.0).iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }
            tree.close(false)?;

            let reopened = FileElementMapper::open(&elements, ByteOrder::LittleEndian)?;
            assert!(reopened.is_empty()?);
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_memory_mapper_tracks_tree() {
    run_test(
        create_test_context,
        |_ctx| {
            let envelopes = random_envelopes(53, 100, 100.0, 5.0);
            let mapper = Arc::new(MemoryElementMapper::new());
            let tree = SpatialTree::memory(small_config())?.with_mapper(mapper.clone());
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }
            assert_eq!(mapper.len()?, 100);

            // re-recording an id replaces its envelope
            tree.delete_id(7)?;
            tree.insert_id(7, &envelopes[8])?;
            assert_eq!(mapper.envelope(7)?, Some(envelopes[8].clone()));
            assert_eq!(mapper.len()?, 100);

            tree.close(false)?;
            assert!(matches!(mapper.envelope(7), Err(SpatialError::Closed)));
            Ok(())
        },
        cleanup,
    );
}

#[cfg(feature = "sqlite")]
#[test]
fn test_sql_mappers_share_a_database() {
    use spatial_index::mapper::schema_name;
    use spatial_index::SqlElementMapper;

    run_test(
        create_test_context,
        |ctx| {
            let database = ctx.path("mappers.db");
            let roads = ctx.path("roads.idx");
            let rivers = ctx.path("rivers.idx");
            let envelopes = random_envelopes(54, 200, 1000.0, 20.0);

            let roads_mapper = Arc::new(SqlElementMapper::open(&database, &roads)?);
            let rivers_mapper = Arc::new(SqlElementMapper::open(&database, &rivers)?);
            assert_eq!(roads_mapper.schema(), schema_name(&roads));
            assert_ne!(roads_mapper.schema(), rivers_mapper.schema());

            let roads_tree = SpatialTree::memory(small_config())?.with_mapper(roads_mapper);
            let rivers_tree = SpatialTree::memory(small_config())?.with_mapper(rivers_mapper);
            for (id, envelope) in envelopes.iter().enumerate() {
                if id % 4 == 0 {
                    rivers_tree.insert_id(id as u64, envelope)?;
                } else {
                    roads_tree.insert_id(id as u64, envelope)?;
                }
            }
            roads_tree.close(true)?;
            rivers_tree.close(true)?;

            // reopening finds the existing schemas
            let roads_mapper = SqlElementMapper::open(&database, &roads)?;
            let rivers_mapper = SqlElementMapper::open(&database, &rivers)?;
            assert_eq!(roads_mapper.len()?, 150);
            assert_eq!(rivers_mapper.len()?, 50);
            assert_eq!(rivers_mapper.envelope(8)?, Some(envelopes[8].clone()));
            assert_eq!(roads_mapper.envelope(8)?, None);
            roads_mapper.close()?;
            rivers_mapper.close()?;
            Ok(())
        },
        cleanup,
    );
}
