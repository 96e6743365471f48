use std::path::Path;

use crate::config::ByteOrder;
use crate::envelope::Envelope;
use crate::rtree::{
    write_packed, IndexKind, PackedHeader, PackedNode, Payload, SpatialError, SpatialResult,
};

/// One quadrant. `bounds` always covers the node's content; it starts out
/// as the quadrant region and only [`QuadTreeBuilder::trim`] shrinks it.
#[derive(Debug, Clone)]
struct QuadNode {
    region: Envelope,
    bounds: Envelope,
    entries: Vec<(Envelope, Payload)>,
    /// South-west, south-east, north-west, north-east
    children: [Option<Box<QuadNode>>; 4],
}

impl QuadNode {
    fn new(region: Envelope) -> QuadNode {
        QuadNode {
            bounds: region.clone(),
            region,
            entries: Vec::new(),
            children: Default::default(),
        }
    }

    fn quadrant_region(&self, quadrant: usize) -> Envelope {
        let (min_x, min_y) = (self.region.min_at(0), self.region.min_at(1));
        let (max_x, max_y) = (self.region.max_at(0), self.region.max_at(1));
        let center = self.region.center();
        let (x1, x2) = if quadrant & 1 == 0 {
            (min_x, center[0])
        } else {
            (center[0], max_x)
        };
        let (y1, y2) = if quadrant & 2 == 0 {
            (min_y, center[1])
        } else {
            (center[1], max_y)
        };
        Envelope::from_corners(x1, y1, x2, y2)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.children.iter().all(Option::is_none)
    }

    /// Shrinks bounds to content and drops empty quadrants, bottom-up.
    fn trim(&mut self) -> bool {
        let mut changed = false;
        let mut bounds = Envelope::null(2);

        for slot in self.children.iter_mut() {
            if let Some(child) = slot {
                changed |= child.trim();
                if child.is_empty() {
                    *slot = None;
                    changed = true;
                } else {
                    bounds.expand_to_include(&child.bounds);
                }
            }
        }
        for (envelope, _) in &self.entries {
            bounds.expand_to_include(envelope);
        }

        if bounds != self.bounds {
            self.bounds = bounds;
            changed = true;
        }
        changed
    }

    fn pack(&self) -> PackedNode {
        let children: Vec<PackedNode> = self
            .children
            .iter()
            .flatten()
            .map(|child| child.pack())
            .collect();
        PackedNode {
            bounds: self.bounds.clone(),
            leaf: children.is_empty(),
            entries: self.entries.clone(),
            children,
        }
    }
}

/// Builds an immutable 2-D quadtree and writes it in the packed format.
///
/// Each entry lands in the deepest quadrant that fully contains it, down to
/// `max_depth` levels (the root is level 1). Entries not contained in the
/// builder's bounds stay in the root.
///
/// ```rust,no_run
/// use spatial_index::{ByteOrder, Envelope, QuadTreeBuilder, SpatialTree};
///
/// let mut builder = QuadTreeBuilder::new(Envelope::from_corners(0.0, 0.0, 100.0, 100.0), 8)?;
/// builder.insert(1, &Envelope::from_corners(10.0, 10.0, 11.0, 11.0))?;
/// builder.write("/tmp/shapes.sqt", ByteOrder::BigEndian)?;
///
/// let tree = SpatialTree::open_packed("/tmp/shapes.sqt")?;
/// assert_eq!(tree.entry_count()?, 1);
/// # Ok::<(), spatial_index::SpatialError>(())
/// ```
#[derive(Debug, Clone)]
pub struct QuadTreeBuilder {
    root: QuadNode,
    max_depth: u32,
    count: usize,
}

impl QuadTreeBuilder {
    pub fn new(bounds: Envelope, max_depth: u32) -> SpatialResult<QuadTreeBuilder> {
        if bounds.dimension() != 2 {
            return Err(SpatialError::DimensionMismatch {
                expected: 2,
                actual: bounds.dimension(),
            });
        }
        if bounds.is_null() {
            return Err(SpatialError::InvalidEnvelope(
                "quadtree bounds must not be null".into(),
            ));
        }
        if max_depth == 0 {
            return Err(SpatialError::InvalidConfig(
                "quadtree depth must be at least 1".into(),
            ));
        }

        Ok(QuadTreeBuilder {
            root: QuadNode::new(bounds),
            max_depth,
            count: 0,
        })
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current bounds of the root: the builder's region until trimmed.
    pub fn bounds(&self) -> &Envelope {
        &self.root.bounds
    }

    pub fn insert(&mut self, id: u64, envelope: &Envelope) -> SpatialResult<()> {
        self.insert_payload(Payload::Id(id), envelope)
    }

    pub fn insert_payload(&mut self, payload: Payload, envelope: &Envelope) -> SpatialResult<()> {
        if envelope.dimension() != 2 {
            return Err(SpatialError::DimensionMismatch {
                expected: 2,
                actual: envelope.dimension(),
            });
        }
        if envelope.is_null()
            || envelope
                .min()
                .iter()
                .chain(envelope.max())
                .any(|v| !v.is_finite())
        {
            return Err(SpatialError::InvalidEnvelope(format!(
                "cannot index {}",
                envelope
            )));
        }

        let mut node = &mut self.root;
        let mut depth = 1;
        while depth < self.max_depth && node.region.contains(envelope) {
            node.bounds.expand_to_include(envelope);
            let quadrant =
                (0..4).find(|&quadrant| node.quadrant_region(quadrant).contains(envelope));
            let Some(quadrant) = quadrant else {
                break;
            };
            let region = node.quadrant_region(quadrant);
            node = node.children[quadrant]
                .get_or_insert_with(|| Box::new(QuadNode::new(region)))
                .as_mut();
            depth += 1;
        }

        node.bounds.expand_to_include(envelope);
        node.entries.push((envelope.clone(), payload));
        self.count += 1;
        Ok(())
    }

    /// Shrinks every node's bounds to its content and prunes empty
    /// quadrants. Returns whether anything changed.
    pub fn trim(&mut self) -> bool {
        self.root.trim()
    }

    /// Trims the tree, then writes it as a packed quadtree file.
    pub fn write(&mut self, path: impl AsRef<Path>, byte_order: ByteOrder) -> SpatialResult<()> {
        self.trim();
        let header = PackedHeader {
            byte_order,
            kind: IndexKind::QuadTree,
            dimension: 2,
            entry_count: i32::try_from(self.count).map_err(|_| {
                SpatialError::InvalidData(format!(
                    "{} entries exceed the packed format",
                    self.count
                ))
            })?,
            max_depth: i32::try_from(self.max_depth).map_err(|_| {
                SpatialError::InvalidConfig(format!("depth {} too large", self.max_depth))
            })?,
        };
        write_packed(path.as_ref(), &header, &self.root.pack())?;
        log::debug!(
            "Wrote quadtree with {} entries to {}",
            self.count,
            path.as_ref().display()
        );
        Ok(())
    }
}
