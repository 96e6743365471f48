//! Overflow treatment for R-tree nodes.
//!
//! A [`SplitPolicy`] decides what happens when an insertion leaves a node
//! with more than `max_entries` entries: either some entries are removed and
//! reinserted from the root, or the node is split in two.

use crate::config::SplitStrategy;
use crate::envelope::Envelope;

use super::rtree_types::{Entry, Node};

pub trait SplitPolicy: Send + Sync {
    /// Divides an overflowing set of entries into two groups, each holding at
    /// least `min_entries` entries.
    fn split(&self, entries: Vec<Entry>, min_entries: usize) -> (Vec<Entry>, Vec<Entry>);

    /// Entries to remove from an overflowing node for reinsertion, or `None`
    /// to split it instead.
    ///
    /// `already_reinserted` is true when this level already went through
    /// reinsertion during the current top-level insert. Returned positions
    /// are ordered farthest from the node centre first.
    fn reinsert_candidates(
        &self,
        _node: &Node,
        _already_reinserted: bool,
        _is_root: bool,
        _min_entries: usize,
    ) -> Option<Vec<usize>> {
        None
    }
}

/// Returns the policy implementing a configured strategy.
pub fn policy_for(strategy: SplitStrategy) -> Box<dyn SplitPolicy> {
    match strategy {
        SplitStrategy::Quadratic => Box::new(QuadraticSplit),
        SplitStrategy::ForcedReinsert { fraction } => Box::new(ForcedReinsertSplit::new(fraction)),
    }
}

/// Guttman's quadratic split.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuadraticSplit;

impl QuadraticSplit {
    /// The pair of entries wasting the most area when grouped together.
    fn pick_seeds(entries: &[Entry]) -> (usize, usize) {
        let mut seeds = (0, 1);
        let mut worst = f64::NEG_INFINITY;
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let waste = entries[i].envelope.dead_space(&entries[j].envelope);
                if waste > worst {
                    worst = waste;
                    seeds = (i, j);
                }
            }
        }
        seeds
    }

    /// The remaining entry with the strongest preference for one group.
    fn pick_next(remaining: &[Entry], first: &Envelope, second: &Envelope) -> usize {
        let mut best = 0;
        let mut best_difference = f64::NEG_INFINITY;
        for (position, entry) in remaining.iter().enumerate() {
            let d1 = first.enlargement(&entry.envelope);
            let d2 = second.enlargement(&entry.envelope);
            let difference = (d1 - d2).abs();
            if difference > best_difference {
                best_difference = difference;
                best = position;
            }
        }
        best
    }
}

impl SplitPolicy for QuadraticSplit {
    fn split(&self, entries: Vec<Entry>, min_entries: usize) -> (Vec<Entry>, Vec<Entry>) {
        if entries.len() < 2 {
            return (entries, Vec::new());
        }

        let (seed_a, seed_b) = Self::pick_seeds(&entries);
        let mut remaining = Vec::with_capacity(entries.len() - 2);
        let mut group_a = Vec::with_capacity(entries.len());
        let mut group_b = Vec::with_capacity(entries.len());
        for (position, entry) in entries.into_iter().enumerate() {
            if position == seed_a {
                group_a.push(entry);
            } else if position == seed_b {
                group_b.push(entry);
            } else {
                remaining.push(entry);
            }
        }

        let mut bounds_a = group_a[0].envelope.clone();
        let mut bounds_b = group_b[0].envelope.clone();

        while !remaining.is_empty() {
            // one group must take everything left to reach the minimum
            if group_a.len() + remaining.len() <= min_entries {
                group_a.append(&mut remaining);
                break;
            }
            if group_b.len() + remaining.len() <= min_entries {
                group_b.append(&mut remaining);
                break;
            }

            let next = Self::pick_next(&remaining, &bounds_a, &bounds_b);
            let entry = remaining.swap_remove(next);

            let growth_a = bounds_a.enlargement(&entry.envelope);
            let growth_b = bounds_b.enlargement(&entry.envelope);
            let to_a = if growth_a != growth_b {
                growth_a < growth_b
            } else if bounds_a.area() != bounds_b.area() {
                bounds_a.area() < bounds_b.area()
            } else {
                group_a.len() <= group_b.len()
            };

            if to_a {
                bounds_a.expand_to_include(&entry.envelope);
                group_a.push(entry);
            } else {
                bounds_b.expand_to_include(&entry.envelope);
                group_b.push(entry);
            }
        }

        (group_a, group_b)
    }
}

/// R*-style overflow treatment.
///
/// The first time a non-root level overflows during one top-level insert,
/// `ceil(fraction * len)` entries farthest from the node centre are removed
/// and reinserted. Every other overflow is handled by [`QuadraticSplit`].
#[derive(Debug, Clone, Copy)]
pub struct ForcedReinsertSplit {
    fraction: f64,
}

impl ForcedReinsertSplit {
    pub fn new(fraction: f64) -> ForcedReinsertSplit {
        ForcedReinsertSplit { fraction }
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }
}

impl SplitPolicy for ForcedReinsertSplit {
    fn split(&self, entries: Vec<Entry>, min_entries: usize) -> (Vec<Entry>, Vec<Entry>) {
        QuadraticSplit.split(entries, min_entries)
    }

    fn reinsert_candidates(
        &self,
        node: &Node,
        already_reinserted: bool,
        is_root: bool,
        min_entries: usize,
    ) -> Option<Vec<usize>> {
        if is_root || already_reinserted {
            return None;
        }

        let len = node.len();
        let wanted = (self.fraction * len as f64).ceil() as usize;
        let count = wanted.min(len.saturating_sub(min_entries));
        if count == 0 {
            return None;
        }

        let center = node.compute_bounds();
        let mut by_distance: Vec<(usize, f64)> = node
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (position, entry.envelope.center_distance_sq(&center)))
            .collect();
        by_distance.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        Some(by_distance.into_iter().take(count).map(|(i, _)| i).collect())
    }
}
