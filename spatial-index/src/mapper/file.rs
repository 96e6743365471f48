//! Flat-file element mapper.
//!
//! Layout: one byte-order marker byte, then one record per id:
//!
//! ```text
//! u64 id | u32 dimension | f64 * dimension mins | f64 * dimension maxes
//! ```
//!
//! The whole file is loaded on open and rewritten on flush through a
//! temporary file that replaces the original with a rename.

use byteorder::{BigEndian, ByteOrder as Endian, LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ByteOrder;
use crate::envelope::Envelope;
use crate::rtree::{SpatialError, SpatialResult};

use super::TreeElementMapper;

/// [`TreeElementMapper`] persisted as a flat file of fixed-width records.
pub struct FileElementMapper {
    path: PathBuf,
    byte_order: ByteOrder,
    envelopes: RwLock<HashMap<u64, Envelope>>,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl FileElementMapper {
    /// Opens the mapper file at `path`, loading every record.
    ///
    /// A missing file starts an empty mapper that is written with
    /// `byte_order` on the first flush. An existing file keeps its own
    /// byte order.
    pub fn open(path: impl AsRef<Path>, byte_order: ByteOrder) -> SpatialResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (byte_order, envelopes) = match fs::read(&path) {
            Ok(bytes) => Self::parse(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => (byte_order, HashMap::new()),
            Err(e) => return Err(SpatialError::io(format!("read {}", path.display()), e)),
        };

        log::debug!(
            "Opened element mapper {} with {} records",
            path.display(),
            envelopes.len()
        );
        Ok(FileElementMapper {
            path,
            byte_order,
            envelopes: RwLock::new(envelopes),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn parse(bytes: &[u8]) -> SpatialResult<(ByteOrder, HashMap<u64, Envelope>)> {
        let (marker, records) = bytes
            .split_first()
            .ok_or_else(|| SpatialError::Corrupted("empty element mapper file".into()))?;
        let byte_order = ByteOrder::from_marker(*marker)?;
        let envelopes = match byte_order {
            ByteOrder::LittleEndian => read_records::<LittleEndian>(records),
            ByteOrder::BigEndian => read_records::<BigEndian>(records),
        }
        .map_err(|e| SpatialError::Corrupted(format!("truncated element mapper record: {}", e)))?;
        Ok((byte_order, envelopes))
    }

    fn check_open(&self) -> SpatialResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(SpatialError::Closed)
        } else {
            Ok(())
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn write_file(&self) -> SpatialResult<()> {
        let temp = self.temp_path();
        let file = File::create(&temp)
            .map_err(|e| SpatialError::io(format!("create {}", temp.display()), e))?;
        let mut writer = BufWriter::new(file);

        let envelopes = self.envelopes.read();
        let mut ids: Vec<&u64> = envelopes.keys().collect();
        ids.sort_unstable();
        let records = ids.into_iter().map(|id| (*id, &envelopes[id]));

        let written = match self.byte_order {
            ByteOrder::LittleEndian => {
                write_records::<LittleEndian, _>(&mut writer, self.byte_order, records)
            }
            ByteOrder::BigEndian => {
                write_records::<BigEndian, _>(&mut writer, self.byte_order, records)
            }
        };
        written
            .and_then(|_| writer.flush())
            .and_then(|_| writer.get_ref().sync_all())
            .map_err(|e| SpatialError::io(format!("write {}", temp.display()), e))?;
        drop(writer);

        fs::rename(&temp, &self.path)
            .map_err(|e| SpatialError::io(format!("replace {}", self.path.display()), e))
    }
}

fn read_records<B: Endian>(mut bytes: &[u8]) -> io::Result<HashMap<u64, Envelope>> {
    let mut envelopes = HashMap::new();
    while !bytes.is_empty() {
        let id = bytes.read_u64::<B>()?;
        let dimension = bytes.read_u32::<B>()? as usize;
        if dimension.saturating_mul(16) > bytes.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let mut coords = vec![0.0; dimension * 2];
        bytes.read_f64_into::<B>(&mut coords)?;
        let max = coords.split_off(dimension);
        envelopes.insert(id, Envelope::from_raw(coords, max));
    }
    Ok(envelopes)
}

fn write_records<'a, B: Endian, I>(
    out: &mut impl Write,
    byte_order: ByteOrder,
    records: I,
) -> io::Result<()>
where
    I: Iterator<Item = (u64, &'a Envelope)>,
{
    out.write_u8(byte_order.marker())?;
    for (id, envelope) in records {
        out.write_u64::<B>(id)?;
        out.write_u32::<B>(envelope.dimension() as u32)?;
        for value in envelope.min().iter().chain(envelope.max()) {
            out.write_f64::<B>(*value)?;
        }
    }
    Ok(())
}

impl TreeElementMapper for FileElementMapper {
    fn envelope(&self, id: u64) -> SpatialResult<Option<Envelope>> {
        self.check_open()?;
        Ok(self.envelopes.read().get(&id).cloned())
    }

    fn set_envelope(&self, id: u64, envelope: &Envelope) -> SpatialResult<()> {
        self.check_open()?;
        self.envelopes.write().insert(id, envelope.clone());
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn remove(&self, id: u64) -> SpatialResult<()> {
        self.check_open()?;
        if self.envelopes.write().remove(&id).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn flush(&self) -> SpatialResult<()> {
        self.check_open()?;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.write_file() {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        log::debug!("Flushed element mapper {}", self.path.display());
        Ok(())
    }

    fn close(&self) -> SpatialResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.dirty.load(Ordering::Acquire) {
            log::warn!(
                "Element mapper {} closed with unflushed records",
                self.path.display()
            );
        }
        self.envelopes.write().clear();
        Ok(())
    }

    fn len(&self) -> SpatialResult<usize> {
        self.check_open()?;
        Ok(self.envelopes.read().len())
    }
}
