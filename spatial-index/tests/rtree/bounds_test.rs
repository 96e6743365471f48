use crate::common::{
    cleanup, create_test_context, env, random_envelopes, run_test, small_config,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use spatial_index::{Envelope, Payload, SpatialTree};

fn union(envelopes: &[Envelope]) -> Envelope {
    let mut bounds = Envelope::null(2);
    for envelope in envelopes {
        bounds.expand_to_include(envelope);
    }
    bounds
}

#[test]
fn test_bounds_hold_through_inserts() {
    run_test(
        create_test_context,
        |_ctx| {
            let envelopes = random_envelopes(7, 600, 1000.0, 25.0);
            let tree = SpatialTree::memory(small_config())?;
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
                if id % 50 == 0 {
                    tree.validate()?;
                }
            }
            tree.validate()?;
            assert_eq!(tree.entry_count()?, 600);
            assert_eq!(tree.root_bounds()?, union(&envelopes));
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_bounds_hold_through_deletes() {
    run_test(
        create_test_context,
        |_ctx| {
            let envelopes = random_envelopes(11, 400, 500.0, 10.0);
            let tree = SpatialTree::memory(small_config())?;
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }

            let mut order: Vec<usize> = (0..envelopes.len()).collect();
            order.shuffle(&mut StdRng::seed_from_u64(3));
            let (removed, kept) = order.split_at(300);
            for (step, &id) in removed.iter().enumerate() {
                tree.delete(&envelopes[id], &Payload::Id(id as u64))?;
                if step % 25 == 0 {
                    tree.validate()?;
                }
            }

            tree.validate()?;
            assert_eq!(tree.entry_count()?, 100);
            let remaining: Vec<Envelope> = kept.iter().map(|&id| envelopes[id].clone()).collect();
            assert_eq!(tree.root_bounds()?, union(&remaining));
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_deleting_everything_leaves_an_empty_root() {
    run_test(
        create_test_context,
        |_ctx| {
            let envelopes = random_envelopes(5, 120, 100.0, 5.0);
            let tree = SpatialTree::memory(small_config())?;
            for (id, envelope) in envelopes.iter().enumerate() {
                tree.insert_id(id as u64, envelope)?;
            }
            assert!(tree.depth()? > 1);

            for (id, envelope) in envelopes.iter().enumerate().rev() {
                tree.delete(envelope, &Payload::Id(id as u64))?;
            }

            tree.validate()?;
            assert_eq!(tree.entry_count()?, 0);
            assert_eq!(tree.depth()?, 1);
            assert!(tree.root_bounds()?.is_null());
            assert!(tree.search_ids(&env(0.0, 0.0, 200.0, 200.0))?.is_empty());
            Ok(())
        },
        cleanup,
    );
}

#[test]
fn test_duplicate_envelopes_are_kept_apart() {
    run_test(
        create_test_context,
        |_ctx| {
            let tree = SpatialTree::memory(small_config())?;
            let same = env(1.0, 1.0, 2.0, 2.0);
            for id in 0..40 {
                tree.insert_id(id, &same)?;
            }
            tree.validate()?;
            assert_eq!(tree.search_ids(&same)?.len(), 40);

            tree.delete(&same, &Payload::Id(17))?;
            let ids = crate::common::sorted_ids(tree.search_ids(&same)?);
            assert_eq!(ids.len(), 39);
            assert!(!ids.contains(&17));
            Ok(())
        },
        cleanup,
    );
}
