//! The immutable packed index format.
//!
//! A packed file is written once by a bulk loader (or the quadtree builder)
//! and only ever read afterwards, through a memory map. Layout:
//!
//! ```text
//! 0   3  magic "SPX"
//! 3   1  byte order marker (1 = little endian, 2 = big endian)
//! 4   1  format version
//! 5   1  index kind (1 = R-tree, 2 = quadtree)
//! 6   2  dimension (u16)
//! 8   4  entry count (i32)
//! 12  4  max depth (i32)
//! 16  .. root node
//!
//! node := i32 length of the rest of the node
//!         f64 * 2d bounds (mins, then maxes)
//!         u8 leaf flag
//!         i32 data entry count, then per entry:
//!             f64 * 2d envelope, u8 payload tag,
//!             tag 1: i64 id | tag 2: inline record
//!         i32 child count, then every child node, depth first
//!
//! record := i32 value count, then per value: u8 field kind tag, value
//! ```
//!
//! A node's id is its byte offset in the file. Child offsets are recovered
//! at read time by skipping over the preceding siblings' lengths.

use byteorder::{BigEndian, ByteOrder as Endian, LittleEndian, WriteBytesExt};
use memmap2::Mmap;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::ByteOrder;
use crate::data::{Data, FieldKind, Value};
use crate::envelope::Envelope;
use crate::lock::LockManager;

use super::page_store::PageStore;
use super::rtree_constants::{PACKED_HEADER_LEN, PACKED_MAGIC, PACKED_VERSION};
use super::rtree_types::{
    Entry, Node, NodeId, Payload, SpatialError, SpatialResult, StoreMetadata, TreeStats,
};

const PAYLOAD_ID: u8 = 1;
const PAYLOAD_INLINE: u8 = 2;

/// Which structure produced a packed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    RTree,
    QuadTree,
}

impl IndexKind {
    fn tag(self) -> u8 {
        match self {
            IndexKind::RTree => 1,
            IndexKind::QuadTree => 2,
        }
    }

    fn from_tag(tag: u8) -> SpatialResult<IndexKind> {
        match tag {
            1 => Ok(IndexKind::RTree),
            2 => Ok(IndexKind::QuadTree),
            other => Err(SpatialError::Corrupted(format!("unknown index kind {}", other))),
        }
    }
}

/// Fixed header of a packed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedHeader {
    pub byte_order: ByteOrder,
    pub kind: IndexKind,
    pub dimension: usize,
    pub entry_count: i32,
    pub max_depth: i32,
}

/// In-memory form of one node handed to [`write_packed`].
#[derive(Debug, Clone, PartialEq)]
pub struct PackedNode {
    pub bounds: Envelope,
    pub leaf: bool,
    pub entries: Vec<(Envelope, Payload)>,
    pub children: Vec<PackedNode>,
}

/// Writes a complete packed file.
pub fn write_packed(
    path: impl AsRef<Path>,
    header: &PackedHeader,
    root: &PackedNode,
) -> SpatialResult<()> {
    let path = path.as_ref();
    let dimension = u16::try_from(header.dimension).map_err(|_| {
        SpatialError::InvalidConfig(format!("dimension {} too large", header.dimension))
    })?;

    let mut body = Vec::new();
    match header.byte_order {
        ByteOrder::LittleEndian => encode_node::<LittleEndian>(&mut body, root, header.dimension)?,
        ByteOrder::BigEndian => encode_node::<BigEndian>(&mut body, root, header.dimension)?,
    }

    let mut out = Vec::with_capacity(PACKED_HEADER_LEN + body.len());
    out.extend_from_slice(PACKED_MAGIC);
    out.push(header.byte_order.marker());
    out.push(PACKED_VERSION);
    out.push(header.kind.tag());
    let counts = match header.byte_order {
        ByteOrder::LittleEndian => write_counts::<LittleEndian>(&mut out, dimension, header),
        ByteOrder::BigEndian => write_counts::<BigEndian>(&mut out, dimension, header),
    };
    counts.map_err(|e| SpatialError::io("encode packed header", e))?;
    out.extend(body);

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| SpatialError::io(format!("create {}", path.display()), e))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(&out)
        .and_then(|_| writer.flush())
        .map_err(|e| SpatialError::io(format!("write {}", path.display()), e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| SpatialError::io(format!("sync {}", path.display()), e))?;

    log::debug!(
        "Wrote packed {:?} index {} ({} entries, depth {}, {} bytes)",
        header.kind,
        path.display(),
        header.entry_count,
        header.max_depth,
        out.len()
    );
    Ok(())
}

fn write_counts<B: Endian>(
    out: &mut Vec<u8>,
    dimension: u16,
    header: &PackedHeader,
) -> std::io::Result<()> {
    out.write_u16::<B>(dimension)?;
    out.write_i32::<B>(header.entry_count)?;
    out.write_i32::<B>(header.max_depth)
}

fn to_i32(value: usize, what: &str) -> SpatialResult<i32> {
    i32::try_from(value).map_err(|_| SpatialError::Indexing(format!("{} {} exceeds i32", what, value)))
}

fn encode_node<B: Endian>(out: &mut Vec<u8>, node: &PackedNode, dimension: usize) -> SpatialResult<()> {
    let mut body = Vec::new();
    let io = |e: std::io::Error| SpatialError::io("encode packed node", e);

    encode_envelope::<B>(&mut body, &node.bounds, dimension)?;
    body.write_u8(node.leaf as u8).map_err(io)?;

    body.write_i32::<B>(to_i32(node.entries.len(), "entry count")?)
        .map_err(io)?;
    for (envelope, payload) in &node.entries {
        encode_envelope::<B>(&mut body, envelope, dimension)?;
        match payload {
            Payload::Id(id) => {
                body.write_u8(PAYLOAD_ID).map_err(io)?;
                body.write_i64::<B>(*id as i64).map_err(io)?;
            }
            Payload::Inline(data) => {
                body.write_u8(PAYLOAD_INLINE).map_err(io)?;
                encode_data::<B>(&mut body, data)?;
            }
        }
    }

    body.write_i32::<B>(to_i32(node.children.len(), "child count")?)
        .map_err(io)?;
    for child in &node.children {
        encode_node::<B>(&mut body, child, dimension)?;
    }

    out.write_i32::<B>(to_i32(body.len(), "node length")?)
        .map_err(io)?;
    out.extend(body);
    Ok(())
}

fn encode_envelope<B: Endian>(
    out: &mut Vec<u8>,
    envelope: &Envelope,
    dimension: usize,
) -> SpatialResult<()> {
    if envelope.dimension() != dimension {
        return Err(SpatialError::DimensionMismatch {
            expected: dimension,
            actual: envelope.dimension(),
        });
    }
    let io = |e: std::io::Error| SpatialError::io("encode envelope", e);
    for value in envelope.min().iter().chain(envelope.max()) {
        out.write_f64::<B>(*value).map_err(io)?;
    }
    Ok(())
}

fn encode_data<B: Endian>(out: &mut Vec<u8>, data: &Data) -> SpatialResult<()> {
    let io = |e: std::io::Error| SpatialError::io("encode record", e);
    out.write_i32::<B>(to_i32(data.values().len(), "value count")?)
        .map_err(io)?;
    for value in data.values() {
        out.write_u8(value.kind().tag()).map_err(io)?;
        let written = match value {
            Value::Int(v) => out.write_i32::<B>(*v),
            Value::Long(v) => out.write_i64::<B>(*v),
            Value::Float(v) => out.write_f32::<B>(*v),
            Value::Double(v) => out.write_f64::<B>(*v),
            Value::Bool(v) => out.write_u8(*v as u8),
            Value::Text(v) => {
                out.write_i32::<B>(to_i32(v.len(), "text length")?)
                    .and_then(|_| out.write_all(v.as_bytes()))
            }
        };
        written.map_err(io)?;
    }
    Ok(())
}

/// Bounds-checked reader over the mapped bytes.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], pos: usize, order: ByteOrder) -> Self {
        Cursor { bytes, pos, order }
    }

    fn take(&mut self, len: usize) -> SpatialResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(SpatialError::Corrupted(format!(
                "packed file truncated at offset {}",
                self.pos
            ))),
        }
    }

    fn u8(&mut self) -> SpatialResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> SpatialResult<u16> {
        let bytes = self.take(2)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => LittleEndian::read_u16(bytes),
            ByteOrder::BigEndian => BigEndian::read_u16(bytes),
        })
    }

    fn i32(&mut self) -> SpatialResult<i32> {
        let bytes = self.take(4)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => LittleEndian::read_i32(bytes),
            ByteOrder::BigEndian => BigEndian::read_i32(bytes),
        })
    }

    fn count(&mut self) -> SpatialResult<usize> {
        let value = self.i32()?;
        usize::try_from(value)
            .map_err(|_| SpatialError::Corrupted(format!("negative count {}", value)))
    }

    fn i64(&mut self) -> SpatialResult<i64> {
        let bytes = self.take(8)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => LittleEndian::read_i64(bytes),
            ByteOrder::BigEndian => BigEndian::read_i64(bytes),
        })
    }

    fn f32(&mut self) -> SpatialResult<f32> {
        let bytes = self.take(4)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => LittleEndian::read_f32(bytes),
            ByteOrder::BigEndian => BigEndian::read_f32(bytes),
        })
    }

    fn f64(&mut self) -> SpatialResult<f64> {
        let bytes = self.take(8)?;
        Ok(match self.order {
            ByteOrder::LittleEndian => LittleEndian::read_f64(bytes),
            ByteOrder::BigEndian => BigEndian::read_f64(bytes),
        })
    }

    fn envelope(&mut self, dimension: usize) -> SpatialResult<Envelope> {
        let mut min = Vec::with_capacity(dimension);
        let mut max = Vec::with_capacity(dimension);
        for _ in 0..dimension {
            min.push(self.f64()?);
        }
        for _ in 0..dimension {
            max.push(self.f64()?);
        }
        Ok(Envelope::from_raw(min, max))
    }

    fn data(&mut self) -> SpatialResult<Data> {
        let count = self.count()?;
        let mut values = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let kind = FieldKind::from_tag(self.u8()?)?;
            values.push(match kind {
                FieldKind::Int => Value::Int(self.i32()?),
                FieldKind::Long => Value::Long(self.i64()?),
                FieldKind::Float => Value::Float(self.f32()?),
                FieldKind::Double => Value::Double(self.f64()?),
                FieldKind::Bool => Value::Bool(self.u8()? != 0),
                FieldKind::Text => {
                    let len = self.count()?;
                    let bytes = self.take(len)?;
                    Value::Text(String::from_utf8(bytes.to_vec()).map_err(|e| {
                        SpatialError::Corrupted(format!("invalid text value: {}", e))
                    })?)
                }
            });
        }
        Ok(Data::from_values(values))
    }
}

/// A read-only [`PageStore`] over a packed file.
pub struct PackedFileStore {
    inner: Arc<PackedFileStoreInner>,
}

struct PackedFileStoreInner {
    map: RwLock<Option<Mmap>>,
    header: PackedHeader,
    nodes_decoded: AtomicU64,
    closed: AtomicBool,
    locks: LockManager,
}

impl PackedFileStore {
    /// Maps a packed file and validates its header.
    pub fn open(path: impl AsRef<Path>) -> SpatialResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| SpatialError::io(format!("open {}", path.display()), e))?;
        // SAFETY: packed files are never modified after being written
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| SpatialError::io(format!("map {}", path.display()), e))?;

        let header = Self::read_header(&map)?;
        log::debug!(
            "Opened packed {:?} index {} ({} entries, depth {}, {:?})",
            header.kind,
            path.display(),
            header.entry_count,
            header.max_depth,
            header.byte_order
        );

        Ok(Self {
            inner: Arc::new(PackedFileStoreInner {
                map: RwLock::new(Some(map)),
                header,
                nodes_decoded: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                locks: LockManager::new(),
            }),
        })
    }

    fn read_header(bytes: &[u8]) -> SpatialResult<PackedHeader> {
        if bytes.len() < PACKED_HEADER_LEN || &bytes[0..3] != PACKED_MAGIC {
            return Err(SpatialError::Corrupted(
                "invalid packed file format (bad magic)".into(),
            ));
        }
        let byte_order = ByteOrder::from_marker(bytes[3])?;
        if bytes[4] != PACKED_VERSION {
            return Err(SpatialError::Corrupted(format!(
                "unsupported packed format version {}",
                bytes[4]
            )));
        }
        let kind = IndexKind::from_tag(bytes[5])?;

        let mut cursor = Cursor::new(bytes, 6, byte_order);
        let dimension = cursor.u16()? as usize;
        let entry_count = cursor.i32()?;
        let max_depth = cursor.i32()?;
        if dimension == 0 || entry_count < 0 || max_depth < 0 {
            return Err(SpatialError::Corrupted("invalid packed header".into()));
        }

        Ok(PackedHeader {
            byte_order,
            kind,
            dimension,
            entry_count,
            max_depth,
        })
    }

    pub fn header(&self) -> &PackedHeader {
        &self.inner.header
    }

    pub fn kind(&self) -> IndexKind {
        self.inner.header.kind
    }

    fn check_open(&self) -> SpatialResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(SpatialError::Closed)
        } else {
            Ok(())
        }
    }

    fn read_only<T>(&self, operation: &str) -> SpatialResult<T> {
        self.check_open()?;
        Err(SpatialError::ReadOnly(format!(
            "{} on a packed index",
            operation
        )))
    }

    /// Decodes the node at `offset`, listing its children as child entries.
    fn decode_node(&self, offset: NodeId, level: u32) -> SpatialResult<Node> {
        let guard = self.inner.map.read();
        let bytes: &[u8] = guard.as_ref().ok_or(SpatialError::Closed)?;
        let header = &self.inner.header;
        let dimension = header.dimension;

        let start = usize::try_from(offset)
            .map_err(|_| SpatialError::Corrupted(format!("offset {} out of range", offset)))?;
        let mut cursor = Cursor::new(bytes, start, header.byte_order);
        let length = cursor.count()?;
        let end = cursor.pos + length;
        if end > bytes.len() {
            return Err(SpatialError::Corrupted(format!(
                "node at {} overruns the file",
                offset
            )));
        }

        let bounds = cursor.envelope(dimension)?;
        let leaf = cursor.u8()? != 0;

        let data_count = cursor.count()?;
        let mut entries = Vec::with_capacity(data_count.min(1024));
        for _ in 0..data_count {
            let envelope = cursor.envelope(dimension)?;
            let payload = match cursor.u8()? {
                PAYLOAD_ID => Payload::Id(cursor.i64()? as u64),
                PAYLOAD_INLINE => Payload::Inline(cursor.data()?),
                other => {
                    return Err(SpatialError::Corrupted(format!(
                        "unknown payload tag {} in node at {}",
                        other, offset
                    )))
                }
            };
            entries.push(Entry::data(envelope, payload));
        }

        let child_count = cursor.count()?;
        for _ in 0..child_count {
            let child_offset = cursor.pos;
            let child_length = cursor.count()?;
            let mut probe = Cursor::new(bytes, cursor.pos, header.byte_order);
            let child_bounds = probe.envelope(dimension)?;
            cursor.take(child_length)?;
            entries.push(Entry::child(child_bounds, child_offset as NodeId));
        }
        if cursor.pos != end {
            return Err(SpatialError::Corrupted(format!(
                "node at {} has inconsistent length",
                offset
            )));
        }

        self.inner.nodes_decoded.fetch_add(1, Ordering::Relaxed);
        Ok(Node {
            id: offset,
            level,
            leaf,
            bounds,
            entries,
            parent: None,
        })
    }

    fn root_level(&self) -> u32 {
        (self.inner.header.max_depth.max(1) - 1) as u32
    }
}

impl PageStore for PackedFileStore {
    fn root(&self) -> SpatialResult<Node> {
        self.check_open()?;
        self.decode_node(PACKED_HEADER_LEN as NodeId, self.root_level())
    }

    fn set_root(&self, _node: &mut Node) -> SpatialResult<()> {
        self.read_only("set_root")
    }

    fn empty_node(&self, _leaf: bool) -> SpatialResult<Node> {
        self.read_only("empty_node")
    }

    fn node(&self, entry: &Entry, parent: &Node) -> SpatialResult<Node> {
        self.check_open()?;
        let offset = entry.child_id().ok_or_else(|| {
            SpatialError::Corrupted(format!("entry in node {} is not a child pointer", parent.id))
        })?;
        let mut node = self.decode_node(offset, parent.level.saturating_sub(1))?;
        node.parent = Some(parent.id);
        Ok(node)
    }

    fn write_node(&self, _node: &Node) -> SpatialResult<()> {
        self.read_only("write_node")
    }

    fn free(&self, _node: &Node) -> SpatialResult<()> {
        self.read_only("free")
    }

    fn flush(&self) -> SpatialResult<()> {
        self.check_open()
    }

    fn close(&self) -> SpatialResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.map.write().take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn dimension(&self) -> usize {
        self.inner.header.dimension
    }

    fn metadata(&self) -> SpatialResult<StoreMetadata> {
        self.check_open()?;
        Ok(StoreMetadata {
            entry_count: self.inner.header.entry_count as u64,
            depth: self.inner.header.max_depth as u32,
        })
    }

    fn set_metadata(&self, _metadata: StoreMetadata) -> SpatialResult<()> {
        self.read_only("set_metadata")
    }

    fn lock_manager(&self) -> &LockManager {
        &self.inner.locks
    }

    fn node_count(&self) -> SpatialResult<u64> {
        let mut count = 0u64;
        let mut pending = vec![self.root()?];
        while let Some(node) = pending.pop() {
            count += 1;
            for entry in &node.entries {
                if entry.child_id().is_some() {
                    pending.push(self.node(entry, &node)?);
                }
            }
        }
        Ok(count)
    }

    fn stats(&self) -> TreeStats {
        TreeStats {
            total_entries: self.inner.header.entry_count as u64,
            depth: self.inner.header.max_depth as u32,
            disk_reads: self.inner.nodes_decoded.load(Ordering::Relaxed),
            ..TreeStats::default()
        }
    }
}
