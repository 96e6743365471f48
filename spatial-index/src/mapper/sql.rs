//! SQLite-backed element mapper.
//!
//! Every index gets its own table set named after a schema derived from the
//! index path, so several indexes can share one database. Statements are
//! kept as templates with `{schema}` and `{path}` tokens substituted before
//! execution. Writes are buffered and applied in one transaction on flush.

use byteorder::{ByteOrder as Endian, LittleEndian};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use crate::envelope::Envelope;
use crate::rtree::rtree_types::crc32;
use crate::rtree::{SpatialError, SpatialResult};

use super::TreeElementMapper;

const REGISTRY_DDL: &str = "CREATE TABLE IF NOT EXISTS sidx_registry (\
     schema_name TEXT PRIMARY KEY, \
     index_path TEXT NOT NULL)";

const SCHEMA_EXISTS: &str =
    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '{schema}_envelopes'";

const SCHEMA_DDL: &str = "CREATE TABLE IF NOT EXISTS {schema}_envelopes (\
     id INTEGER PRIMARY KEY, \
     dimension INTEGER NOT NULL, \
     bounds BLOB NOT NULL)";

const REGISTER_SCHEMA: &str =
    "INSERT OR IGNORE INTO sidx_registry (schema_name, index_path) VALUES ('{schema}', '{path}')";

const SELECT_ENVELOPE: &str = "SELECT dimension, bounds FROM {schema}_envelopes WHERE id = ?1";
const UPSERT_ENVELOPE: &str =
    "INSERT OR REPLACE INTO {schema}_envelopes (id, dimension, bounds) VALUES (?1, ?2, ?3)";
const DELETE_ENVELOPE: &str = "DELETE FROM {schema}_envelopes WHERE id = ?1";
const COUNT_ENVELOPES: &str = "SELECT COUNT(*) FROM {schema}_envelopes";

/// Derives the schema name of the index stored at `index_path`.
///
/// The name is `sidx_<stem>_<crc>` where `stem` is the file stem reduced to
/// lowercase ASCII alphanumerics and `crc` is the CRC-32 of the full path in
/// hex, so equal paths always map to the same schema.
pub fn schema_name(index_path: impl AsRef<Path>) -> String {
    let path = index_path.as_ref();
    let stem: String = path
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let checksum = crc32(path.to_string_lossy().as_bytes());
    format!("sidx_{}_{:08x}", stem, checksum)
}

/// [`TreeElementMapper`] storing envelopes in a SQLite database.
pub struct SqlElementMapper {
    connection: Mutex<Option<Connection>>,
    schema: String,
    index_path: String,
    /// Writes not yet flushed; `None` marks a removal
    pending: Mutex<HashMap<u64, Option<Envelope>>>,
}

impl SqlElementMapper {
    /// Opens (or creates) the database at `database` and bootstraps the
    /// schema of the index stored at `index_path`.
    pub fn open(database: impl AsRef<Path>, index_path: impl AsRef<Path>) -> SpatialResult<Self> {
        let connection = Connection::open(database.as_ref())?;
        Self::with_connection(connection, index_path)
    }

    /// Uses a private in-memory database.
    pub fn in_memory(index_path: impl AsRef<Path>) -> SpatialResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, index_path)
    }

    /// Bootstraps the index schema on an existing connection.
    ///
    /// Bootstrapping is check-then-create: an existing schema of the same
    /// name is reused as is.
    pub fn with_connection(
        connection: Connection,
        index_path: impl AsRef<Path>,
    ) -> SpatialResult<Self> {
        let mapper = SqlElementMapper {
            connection: Mutex::new(None),
            schema: schema_name(index_path.as_ref()),
            index_path: index_path.as_ref().to_string_lossy().into_owned(),
            pending: Mutex::new(HashMap::new()),
        };

        connection.execute(REGISTRY_DDL, [])?;
        let existing: i64 =
            connection.query_row(&mapper.render(SCHEMA_EXISTS), [], |row| row.get(0))?;
        if existing == 0 {
            connection.execute(&mapper.render(SCHEMA_DDL), [])?;
            log::debug!("Created element mapper schema {}", mapper.schema);
        } else {
            log::debug!("Reusing element mapper schema {}", mapper.schema);
        }
        connection.execute(&mapper.render(REGISTER_SCHEMA), [])?;

        *mapper.connection.lock() = Some(connection);
        Ok(mapper)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Substitutes the `{schema}` and `{path}` tokens of a statement template.
    fn render(&self, template: &str) -> String {
        template
            .replace("{schema}", &self.schema)
            .replace("{path}", &self.index_path.replace('\'', "''"))
    }

    fn with_connection_ref<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> SpatialResult<T>,
    ) -> SpatialResult<T> {
        let mut guard = self.connection.lock();
        let connection = guard.as_mut().ok_or(SpatialError::Closed)?;
        f(connection)
    }

    fn write_pending(&self, connection: &mut Connection) -> SpatialResult<usize> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Ok(0);
        }

        let tx = connection.transaction()?;
        {
            let mut upsert = tx.prepare_cached(&self.render(UPSERT_ENVELOPE))?;
            let mut delete = tx.prepare_cached(&self.render(DELETE_ENVELOPE))?;
            for (id, envelope) in pending.iter() {
                match envelope {
                    Some(envelope) => {
                        upsert.execute(params![
                            *id as i64,
                            envelope.dimension() as i64,
                            encode_bounds(envelope)
                        ])?;
                    }
                    None => {
                        delete.execute(params![*id as i64])?;
                    }
                }
            }
        }
        tx.commit()?;

        let written = pending.len();
        pending.clear();
        Ok(written)
    }
}

fn encode_bounds(envelope: &Envelope) -> Vec<u8> {
    let coords: Vec<f64> = envelope.min().iter().chain(envelope.max()).copied().collect();
    let mut bytes = vec![0u8; coords.len() * 8];
    LittleEndian::write_f64_into(&coords, &mut bytes);
    bytes
}

fn decode_bounds(dimension: i64, bytes: &[u8]) -> SpatialResult<Envelope> {
    let dimension = usize::try_from(dimension)
        .map_err(|_| SpatialError::Corrupted(format!("negative dimension {}", dimension)))?;
    if dimension.checked_mul(16) != Some(bytes.len()) {
        return Err(SpatialError::Corrupted(format!(
            "bounds blob of {} bytes for dimension {}",
            bytes.len(),
            dimension
        )));
    }
    let mut coords = vec![0.0; dimension * 2];
    LittleEndian::read_f64_into(bytes, &mut coords);
    let max = coords.split_off(dimension);
    Ok(Envelope::from_raw(coords, max))
}

impl TreeElementMapper for SqlElementMapper {
    fn envelope(&self, id: u64) -> SpatialResult<Option<Envelope>> {
        self.with_connection_ref(|connection| {
            if let Some(pending) = self.pending.lock().get(&id) {
                return Ok(pending.clone());
            }

            let row: Option<(i64, Vec<u8>)> = connection
                .query_row(&self.render(SELECT_ENVELOPE), params![id as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?;
            row.map(|(dimension, bytes)| decode_bounds(dimension, &bytes))
                .transpose()
        })
    }

    fn set_envelope(&self, id: u64, envelope: &Envelope) -> SpatialResult<()> {
        self.with_connection_ref(|_| {
            self.pending.lock().insert(id, Some(envelope.clone()));
            Ok(())
        })
    }

    fn remove(&self, id: u64) -> SpatialResult<()> {
        self.with_connection_ref(|_| {
            self.pending.lock().insert(id, None);
            Ok(())
        })
    }

    fn flush(&self) -> SpatialResult<()> {
        self.with_connection_ref(|connection| {
            let written = self.write_pending(connection)?;
            if written > 0 {
                log::debug!("Flushed {} element mapper rows to {}", written, self.schema);
            }
            Ok(())
        })
    }

    fn close(&self) -> SpatialResult<()> {
        let Some(connection) = self.connection.lock().take() else {
            return Ok(());
        };
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            log::warn!(
                "Element mapper {} closed with {} unflushed rows",
                self.schema,
                pending.len()
            );
            pending.clear();
        }
        connection.close().map_err(|(_, e)| SpatialError::from(e))
    }

    /// Counts the stored rows, flushing pending writes first.
    fn len(&self) -> SpatialResult<usize> {
        self.with_connection_ref(|connection| {
            self.write_pending(connection)?;
            let count: i64 =
                connection.query_row(&self.render(COUNT_ENVELOPES), [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}
