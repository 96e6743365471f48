use crate::common::{cleanup, create_test_context, env, id_reader, run_test, small_config};
use spatial_index::{ByteOrder, SpatialError, SpatialResult, SpatialTree, TreeConfig};
use std::path::Path;

fn fill_grid(tree: &SpatialTree) -> SpatialResult<()> {
    for i in 0..100u64 {
        let x = (i % 10) as f64;
        let y = (i / 10) as f64;
        tree.insert_id(i, &env(x, y, x + 0.5, y + 0.5))?;
    }
    Ok(())
}

fn grid_tree(config: TreeConfig) -> SpatialResult<SpatialTree> {
    let tree = SpatialTree::memory(config)?;
    fill_grid(&tree)?;
    Ok(tree)
}

/// Descriptors of this process that point at `path`.
#[cfg(target_os = "linux")]
fn open_handles(path: &Path) -> usize {
    let target = std::fs::canonicalize(path).unwrap();
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        .filter(|link| *link == target)
        .count()
}

#[cfg(not(target_os = "linux"))]
fn open_handles(_path: &Path) -> usize {
    0
}

#[cfg(target_os = "linux")]
fn is_mapped(path: &Path) -> bool {
    let target = std::fs::canonicalize(path).unwrap();
    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    maps.lines()
        .any(|line| line.ends_with(target.to_string_lossy().as_ref()))
}

#[cfg(not(target_os = "linux"))]
fn is_mapped(_path: &Path) -> bool {
    false
}

#[test]
fn test_closing_tree_fails_live_iterators_once() {
    run_test(
        create_test_context,
        |_ctx| {
            let tree = grid_tree(small_config())?;
            let hits = tree.search(id_reader(100), &env(0.0, 0.0, 10.0, 10.0))?;
            let mut iter = hits.iter();
            assert!(iter.next().transpose()?.is_some());
            assert_eq!(tree.stats()?.open_iterators, 1);

            tree.close(false)?;
            assert!(matches!(iter.next(), Some(Err(SpatialError::Closed))));
            assert!(iter.next().is_none());
            assert!(iter.next().is_none());
            assert!(iter.is_closed());

            // iterators drawn after the close report it the same way
            let mut late = hits.iter();
            assert!(matches!(late.next(), Some(Err(SpatialError::Closed))));
            assert!(late.next().is_none());
            assert!(matches!(hits.size(), Err(SpatialError::Closed)));

            hits.close();
            hits.close();
            assert!(hits.is_closed());
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_tree_operations_fail_after_close() {
    run_test(
        create_test_context,
        |_ctx| {
            let tree = grid_tree(small_config())?;
            tree.close(false)?;
            tree.close(true)?;
            assert!(tree.is_closed());

            let query = env(0.0, 0.0, 1.0, 1.0);
            assert!(matches!(tree.search_ids(&query), Err(SpatialError::Closed)));
            assert!(matches!(
                tree.search(id_reader(1), &query),
                Err(SpatialError::Closed)
            ));
            assert!(matches!(tree.insert_id(500, &query), Err(SpatialError::Closed)));
            assert!(matches!(tree.delete_id(1), Err(SpatialError::Closed)));
            assert!(matches!(tree.entry_count(), Err(SpatialError::Closed)));
            assert!(matches!(tree.trim(), Err(SpatialError::Closed)));
            assert!(matches!(tree.flush(), Err(SpatialError::Closed)));
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_collection_close_ends_its_iterators() {
    run_test(
        create_test_context,
        |_ctx| {
            let tree = grid_tree(small_config())?;
            let hits = tree.search(id_reader(100), &env(0.0, 0.0, 10.0, 10.0))?;
            let mut first = hits.iter();
            let mut second = hits.iter();
            assert!(first.next().transpose()?.is_some());
            assert_eq!(tree.stats()?.open_iterators, 2);

            hits.close();
            assert!(first.next().is_none());
            assert!(second.next().is_none());
            assert_eq!(tree.stats()?.open_iterators, 0);

            // a closed collection only hands out empty iterators
            assert_eq!(hits.iter().count(), 0);
            assert_eq!(hits.size()?, 0);
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_iterators_release_their_registration() {
    run_test(
        create_test_context,
        |_ctx| {
            let tree = grid_tree(small_config())?;
            let hits = tree.search(id_reader(100), &env(2.0, 2.0, 4.0, 4.0))?;

            assert_eq!(hits.size()?, 9);
            assert!(!hits.is_empty()?);
            assert_eq!(tree.stats()?.open_iterators, 0);

            {
                let mut iter = hits.iter();
                let _ = iter.next();
                assert_eq!(tree.stats()?.open_iterators, 1);
            }
            assert_eq!(tree.stats()?.open_iterators, 0);

            let mut iter = hits.iter();
            hits.close_iterator(&mut iter);
            hits.close_iterator(&mut iter);
            assert!(iter.next().is_none());
            assert_eq!(tree.stats()?.open_iterators, 0);

            // exhausted iterators let go too
            let mut drained = hits.iter();
            assert_eq!(drained.by_ref().count(), 9);
            assert_eq!(tree.stats()?.open_iterators, 0);
            assert!(drained.next().is_none());

            drop(hits);
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_empty_results() {
    run_test(
        create_test_context,
        |_ctx| {
            let tree = grid_tree(small_config())?;
            let hits = tree.search(id_reader(100), &env(50.0, 50.0, 60.0, 60.0))?;
            assert!(hits.is_empty()?);
            assert_eq!(hits.size()?, 0);
            assert_eq!(hits.iter().count(), 0);

            let three_d = spatial_index::Envelope::new(vec![0.0; 3], vec![1.0; 3])?;
            assert!(matches!(
                tree.search(id_reader(1), &three_d),
                Err(SpatialError::DimensionMismatch { .. })
            ));
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_closing_file_tree_releases_the_file() {
    run_test(
        create_test_context,
        |ctx| {
            let path = ctx.path("resources.sidx");
            let tree = SpatialTree::create_file(&path, small_config())?;
            fill_grid(&tree)?;
            if cfg!(target_os = "linux") {
                assert_eq!(open_handles(&path), 1);
            }

            let hits = tree.search(id_reader(100), &env(0.0, 0.0, 10.0, 10.0))?;
            let mut iter = hits.iter();
            assert!(iter.next().transpose()?.is_some());

            tree.close(false)?;
            assert!(matches!(iter.next(), Some(Err(SpatialError::Closed))));
            assert!(iter.next().is_none());
            assert_eq!(open_handles(&path), 0);
            assert!(matches!(
                tree.search_ids(&env(0.0, 0.0, 1.0, 1.0)),
                Err(SpatialError::Closed)
            ));

            // nothing of the closed tree lingers in the file
            let reopened = SpatialTree::open_file(&path, small_config())?;
            assert_eq!(reopened.entry_count()?, 100);
            reopened.validate()?;
            reopened.close(false)?;
            assert_eq!(open_handles(&path), 0);
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_closing_packed_tree_unmaps_the_file() {
    run_test(
        create_test_context,
        |ctx| {
            let source = grid_tree(small_config())?;
            let path = ctx.path("resources.spx");
            source.write_packed(&path, ByteOrder::LittleEndian)?;
            source.close(false)?;

            let packed = SpatialTree::open_packed(&path)?;
            assert_eq!(open_handles(&path), 0);
            if cfg!(target_os = "linux") {
                assert!(is_mapped(&path));
            }
            let hits = packed.search(id_reader(100), &env(0.0, 0.0, 10.0, 10.0))?;
            let mut iter = hits.iter();
            assert!(iter.next().transpose()?.is_some());

            packed.close(false)?;
            assert!(matches!(iter.next(), Some(Err(SpatialError::Closed))));
            assert!(!is_mapped(&path));
            Ok(())
        },
        cleanup,
    );
}
