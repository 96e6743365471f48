use crate::common::{
    brute_force, cleanup, create_test_context, env, id_reader, random_envelopes, run_test,
    small_config, sorted_ids,
};
use spatial_index::{SpatialError, SpatialResult, SpatialTree};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn test_modification_invalidates_iterators() {
    run_test(
        create_test_context,
        |_ctx| {
            let tree = SpatialTree::memory(small_config())?;
            for i in 0..50u64 {
                let p = i as f64;
                tree.insert_id(i, &env(p, p, p + 1.0, p + 1.0))?;
            }

            let hits = tree.search(id_reader(100), &env(0.0, 0.0, 100.0, 100.0))?;
            let mut iter = hits.iter();
            assert!(iter.next().transpose()?.is_some());

            tree.insert_id(50, &env(50.0, 50.0, 51.0, 51.0))?;
            assert!(matches!(
                iter.next(),
                Some(Err(SpatialError::ConcurrentModification))
            ));
            assert!(iter.next().is_none());

            // a fresh iterator sees the new entry
            assert_eq!(hits.size()?, 51);

            // failed mutations leave iterators alone
            let mut iter = hits.iter();
            assert!(tree.insert_id(99, &spatial_index::Envelope::null(2)).is_err());
            assert_eq!(iter.by_ref().count(), 51);
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_parallel_readers_with_one_writer() {
    run_test(
        create_test_context,
        |_ctx| {
            let envelopes = random_envelopes(77, 2000, 1000.0, 20.0);
            let tree = SpatialTree::memory(small_config())?;
            for (id, envelope) in envelopes.iter().enumerate().take(1000) {
                tree.insert_id(id as u64, envelope)?;
            }

            let queries = random_envelopes(78, 40, 1000.0, 200.0);
            let reads = AtomicUsize::new(0);
            let (tree, envelopes, queries, reads) = (&tree, &envelopes, &queries, &reads);
            thread::scope(|scope| -> SpatialResult<()> {
                let writer = scope.spawn(move || -> SpatialResult<()> {
                    for (id, envelope) in envelopes.iter().enumerate().skip(1000) {
                        tree.insert_id(id as u64, envelope)?;
                    }
                    Ok(())
                });

                let readers: Vec<_> = (0..4)
                    .map(|_| {
                        scope.spawn(move || -> SpatialResult<()> {
                            for query in queries {
                                // every snapshot holds at least the first thousand
                                let found = sorted_ids(tree.search_ids(query)?);
                                let settled: Vec<u64> = brute_force(&envelopes[..1000], query);
                                assert!(settled.iter().all(|id| found.binary_search(id).is_ok()));
                                reads.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(())
                        })
                    })
                    .collect();

                for reader in readers {
                    reader.join().expect("reader thread panicked")?;
                }
                writer.join().expect("writer thread panicked")
            })?;

            assert_eq!(reads.load(Ordering::Relaxed), 160);
            assert_eq!(tree.entry_count()?, 2000);
            tree.validate()?;
            for query in queries {
                assert_eq!(
                    sorted_ids(tree.search_ids(query)?),
                    brute_force(envelopes, query)
                );
            }
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_file_tree_is_shared_across_threads() {
    run_test(
        create_test_context,
        |ctx| {
            let envelopes = random_envelopes(79, 1200, 1000.0, 20.0);
            let tree = SpatialTree::create_file(ctx.path("shared.idx"), small_config())?;

            thread::scope(|scope| -> SpatialResult<()> {
                let writers: Vec<_> = envelopes
                    .chunks(300)
                    .enumerate()
                    .map(|(chunk, slice)| {
                        let tree = &tree;
                        scope.spawn(move || -> SpatialResult<()> {
                            for (offset, envelope) in slice.iter().enumerate() {
                                tree.insert_id((chunk * 300 + offset) as u64, envelope)?;
                            }
                            Ok(())
                        })
                    })
                    .collect();
                for writer in writers {
                    writer.join().expect("writer thread panicked")?;
                }
                Ok(())
            })?;

            assert_eq!(tree.entry_count()?, 1200);
            tree.validate()?;
            let everything = env(0.0, 0.0, 2000.0, 2000.0);
            assert_eq!(
                sorted_ids(tree.search_ids(&everything)?),
                (0..1200).collect::<Vec<u64>>()
            );
            tree.close(false)?;
            Ok(())
        },
        cleanup,
    );
}
