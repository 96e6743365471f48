//! Disk storage layer for the paged R-tree file.
//!
//! Reads and writes individual pages. Nothing is preloaded: every
//! `read_page` call is exactly one seek and one read.
//!
//! Layout: page 0 starts with the byte-order marker followed by the bincode
//! [`FileHeader`]; every other page holds either a [`PageWithChecksum`] or a
//! [`FreePage`], zero padded to the page size.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::ByteOrder;

use super::rtree_constants::MIN_PAGE_SIZE;
use super::rtree_types::{
    FileHeader, FreePage, Node, NodeId, PageWithChecksum, SpatialError, SpatialResult,
};

/// Encodes a value with bincode in the given byte order.
pub(crate) fn encode<T: Serialize>(value: &T, order: ByteOrder) -> SpatialResult<Vec<u8>> {
    let result = match order {
        ByteOrder::LittleEndian => {
            bincode::serde::encode_to_vec(value, bincode::config::legacy())
        }
        ByteOrder::BigEndian => bincode::serde::encode_to_vec(
            value,
            bincode::config::legacy().with_big_endian(),
        ),
    };
    result.map_err(|e| SpatialError::Serialization(e.to_string()))
}

/// Decodes a bincode value written by [`encode`] in the same byte order.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8], order: ByteOrder) -> SpatialResult<T> {
    let result = match order {
        ByteOrder::LittleEndian => {
            bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
        }
        ByteOrder::BigEndian => bincode::serde::decode_from_slice(
            bytes,
            bincode::config::legacy().with_big_endian(),
        ),
    };
    result
        .map(|(value, _)| value)
        .map_err(|e| SpatialError::Serialization(e.to_string()))
}

/// Handles reading/writing individual pages of an index file.
pub struct Storage {
    /// `None` once closed
    file: Mutex<Option<File>>,
    path: PathBuf,
    page_size: usize,
    byte_order: ByteOrder,
}

impl Storage {
    /// Create (or truncate) a storage file
    pub fn create(path: &Path, page_size: usize, byte_order: ByteOrder) -> SpatialResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SpatialError::io(format!("create {}", path.display()), e))?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path: path.to_path_buf(),
            page_size,
            byte_order,
        })
    }

    /// Open an existing storage file, reading only its header page.
    pub fn open(path: &Path) -> SpatialResult<(Self, FileHeader)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SpatialError::io(format!("open {}", path.display()), e))?;

        let mut prefix = Vec::with_capacity(MIN_PAGE_SIZE);
        (&mut file)
            .take(MIN_PAGE_SIZE as u64)
            .read_to_end(&mut prefix)
            .map_err(|e| SpatialError::io("read header", e))?;
        let (marker, header_bytes) = prefix
            .split_first()
            .ok_or_else(|| SpatialError::Corrupted("empty index file".into()))?;

        let byte_order = ByteOrder::from_marker(*marker)?;
        let header: FileHeader = decode(header_bytes, byte_order)?;
        header.validate()?;

        let storage = Self {
            file: Mutex::new(Some(file)),
            path: path.to_path_buf(),
            page_size: header.page_size as usize,
            byte_order,
        };
        Ok((storage, header))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Write header to page 0
    pub fn write_header(&self, header: &FileHeader) -> SpatialResult<()> {
        let mut page = Vec::with_capacity(self.page_size);
        page.push(self.byte_order.marker());
        page.extend(encode(header, self.byte_order)?);
        page.resize(self.page_size, 0);
        self.write_at(0, &page, "write header")
    }

    /// Read a single node (one seek + one read), verifying its checksum.
    pub fn read_page(&self, page_id: NodeId) -> SpatialResult<Node> {
        let buffer = self.read_raw(page_id)?;
        let page: PageWithChecksum = decode(&buffer, self.byte_order)?;
        let node_bytes = encode(&page.node, self.byte_order)?;
        let mut node = page.into_node(&node_bytes)?;
        node.id = page_id;
        Ok(node)
    }

    /// Encode a node into its padded on-disk page, failing when it does not fit.
    pub fn encode_page(&self, page_id: NodeId, node: &Node) -> SpatialResult<Vec<u8>> {
        let node_bytes = encode(node, self.byte_order)?;
        let page = PageWithChecksum::new(node.clone(), &node_bytes);
        let mut bytes = encode(&page, self.byte_order)?;

        if bytes.len() > self.page_size {
            return Err(SpatialError::NodeTooLarge {
                page: page_id,
                size: bytes.len(),
                max: self.page_size,
            });
        }
        bytes.resize(self.page_size, 0);
        Ok(bytes)
    }

    /// Write a single node with checksum
    pub fn write_page(&self, page_id: NodeId, node: &Node) -> SpatialResult<()> {
        Self::check_page(page_id)?;
        let bytes = self.encode_page(page_id, node)?;
        self.write_at(page_id, &bytes, "write page")
    }

    /// Read a free-list page
    pub fn read_free_page(&self, page_id: NodeId) -> SpatialResult<FreePage> {
        let buffer = self.read_raw(page_id)?;
        decode(&buffer, self.byte_order)
    }

    /// Write a free-list page
    pub fn write_free_page(&self, page_id: NodeId, free_page: &FreePage) -> SpatialResult<()> {
        Self::check_page(page_id)?;
        let mut bytes = encode(free_page, self.byte_order)?;
        bytes.resize(self.page_size, 0);
        self.write_at(page_id, &bytes, "write free page")
    }

    /// Sync file to disk
    pub fn sync(&self) -> SpatialResult<()> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(SpatialError::Closed)?;
        file.sync_all().map_err(|e| SpatialError::io("sync", e))
    }

    /// Releases the file handle. Every later page access fails with
    /// [`SpatialError::Closed`].
    pub fn close(&self) {
        if self.file.lock().take().is_some() {
            log::debug!("Released index file {}", self.path.display());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }

    fn check_page(page_id: NodeId) -> SpatialResult<()> {
        if page_id == 0 {
            return Err(SpatialError::Corrupted(
                "page 0 is reserved for the header".into(),
            ));
        }
        Ok(())
    }

    fn read_raw(&self, page_id: NodeId) -> SpatialResult<Vec<u8>> {
        Self::check_page(page_id)?;
        let offset = page_id * self.page_size as u64;
        let mut buffer = vec![0u8; self.page_size];

        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(SpatialError::Closed)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buffer))
            .map_err(|e| SpatialError::io(format!("read page {}", page_id), e))?;
        Ok(buffer)
    }

    fn write_at(&self, page_id: NodeId, bytes: &[u8], what: &str) -> SpatialResult<()> {
        let offset = page_id * self.page_size as u64;
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(SpatialError::Closed)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(bytes))
            .map_err(|e| SpatialError::io(format!("{} {}", what, page_id), e))
    }
}
