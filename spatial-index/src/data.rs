//! Records returned by searches and the readers that produce them.
//!
//! A leaf entry either stores its record inline or stores an identifier that
//! a [`DataReader`] resolves while a search iterator walks the tree.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::rtree::{SpatialError, SpatialResult};

/// Kind of a single field in a [`DataDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Int,
    Long,
    Float,
    Double,
    Bool,
    Text,
}

impl FieldKind {
    /// Tag used by the packed file format.
    pub(crate) fn tag(self) -> u8 {
        match self {
            FieldKind::Int => 1,
            FieldKind::Long => 2,
            FieldKind::Float => 3,
            FieldKind::Double => 4,
            FieldKind::Bool => 5,
            FieldKind::Text => 6,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> SpatialResult<FieldKind> {
        Ok(match tag {
            1 => FieldKind::Int,
            2 => FieldKind::Long,
            3 => FieldKind::Float,
            4 => FieldKind::Double,
            5 => FieldKind::Bool,
            6 => FieldKind::Text,
            other => {
                return Err(SpatialError::Corrupted(format!(
                    "unknown field kind tag {}",
                    other
                )))
            }
        })
    }
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Text(String),
}

impl Value {
    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Int(_) => FieldKind::Int,
            Value::Long(_) => FieldKind::Long,
            Value::Float(_) => FieldKind::Float,
            Value::Double(_) => FieldKind::Double,
            Value::Bool(_) => FieldKind::Bool,
            Value::Text(_) => FieldKind::Text,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
        }
    }
}

/// Ordered list of field kinds a [`Data`] record must follow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataDefinition {
    fields: Vec<FieldKind>,
}

impl DataDefinition {
    pub fn new(fields: Vec<FieldKind>) -> DataDefinition {
        DataDefinition { fields }
    }

    pub fn field(mut self, kind: FieldKind) -> Self {
        self.fields.push(kind);
        self
    }

    pub fn fields(&self) -> &[FieldKind] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A record built against a [`DataDefinition`].
///
/// ```rust
/// use spatial_index::{Data, DataDefinition, FieldKind, Value};
///
/// let definition = DataDefinition::default()
///     .field(FieldKind::Long)
///     .field(FieldKind::Text);
///
/// let mut data = Data::new(&definition);
/// data.add_value(Value::Long(7)).unwrap()
///     .add_value(Value::Text("harbour".into())).unwrap();
/// assert!(data.is_valid());
///
/// // kinds are checked in field order
/// assert!(Data::new(&definition).add_value(Value::Bool(true)).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    definition: DataDefinition,
    values: Vec<Value>,
}

impl Data {
    pub fn new(definition: &DataDefinition) -> Data {
        Data {
            definition: definition.clone(),
            values: Vec::with_capacity(definition.len()),
        }
    }

    /// Builds a record whose definition is inferred from the values.
    pub fn from_values(values: Vec<Value>) -> Data {
        let definition = DataDefinition::new(values.iter().map(Value::kind).collect());
        Data { definition, values }
    }

    /// Appends the value for the next field.
    ///
    /// Fails with [`SpatialError::InvalidData`] when the record is already
    /// complete or the value's kind differs from the field's kind.
    pub fn add_value(&mut self, value: Value) -> SpatialResult<&mut Data> {
        let position = self.values.len();
        let expected = self.definition.fields.get(position).copied().ok_or_else(|| {
            SpatialError::InvalidData(format!(
                "record already holds all {} fields",
                self.definition.len()
            ))
        })?;
        if value.kind() != expected {
            return Err(SpatialError::InvalidData(format!(
                "field {} expects {:?}, got {:?}",
                position,
                expected,
                value.kind()
            )));
        }
        self.values.push(value);
        Ok(self)
    }

    /// True when every field of the definition has a value.
    pub fn is_valid(&self) -> bool {
        self.values.len() == self.definition.len()
    }

    pub fn definition(&self) -> &DataDefinition {
        &self.definition
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

/// Resolves leaf identifiers into records for search iterators.
pub trait DataReader: Send + Sync {
    fn read(&self, id: u64) -> SpatialResult<Data>;

    /// Reads several records at once, appending them to `out` in id order.
    fn read_batch(&self, ids: &[u64], out: &mut Vec<Data>) -> SpatialResult<()> {
        for id in ids {
            out.push(self.read(*id)?);
        }
        Ok(())
    }

    fn close(&self) -> SpatialResult<()> {
        Ok(())
    }
}

/// A [`DataReader`] over an in-memory table.
#[derive(Default)]
pub struct MemoryDataReader {
    records: RwLock<HashMap<u64, Data>>,
    closed: AtomicBool,
}

impl MemoryDataReader {
    pub fn new() -> MemoryDataReader {
        MemoryDataReader::default()
    }

    pub fn insert(&self, id: u64, data: Data) {
        self.records.write().insert(id, data);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl FromIterator<(u64, Data)> for MemoryDataReader {
    fn from_iter<T: IntoIterator<Item = (u64, Data)>>(iter: T) -> Self {
        MemoryDataReader {
            records: RwLock::new(iter.into_iter().collect()),
            closed: AtomicBool::new(false),
        }
    }
}

impl DataReader for MemoryDataReader {
    fn read(&self, id: u64) -> SpatialResult<Data> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SpatialError::Closed);
        }
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SpatialError::EntryNotFound(format!("no record for id {}", id)))
    }

    fn read_batch(&self, ids: &[u64], out: &mut Vec<Data>) -> SpatialResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SpatialError::Closed);
        }
        let records = self.records.read();
        for id in ids {
            let data = records
                .get(id)
                .cloned()
                .ok_or_else(|| SpatialError::EntryNotFound(format!("no record for id {}", id)))?;
            out.push(data);
        }
        Ok(())
    }

    fn close(&self) -> SpatialResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
