//! Column chunk: a bounded columnar buffer of rows, its permutation index and its side buffer.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{self, AtomicU64, AtomicUsize};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::buffer::{SideBuffer, VarRef};
use crate::compare::DataError;
use crate::sort::SortError;
use crate::status::Status;

/// Index entry that compares greater than any real row.
pub const SENTINEL: u32 = u32::MAX;

/// Largest supported chunk capacity. Merges address two chunks through one
/// virtual index space, so twice the padded capacity must stay below [`SENTINEL`].
pub const MAX_CHUNK_CAPACITY: usize = 1 << 30;

static NEXT_CHUNK_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide unique chunk identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl ChunkId {
    fn next() -> Self {
        ChunkId(NEXT_CHUNK_ID.fetch_add(1, atomic::Ordering::Relaxed))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int64,
    Float64,
    /// Variable-length bytes stored in the side buffer.
    VarLen,
}

/// Owned upstream value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int64(i64),
    Float64(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_datum(&self) -> Datum<'_> {
        match self {
            Value::Null => Datum::Null,
            Value::Int64(v) => Datum::Int64(*v),
            Value::Float64(v) => Datum::Float64(*v),
            Value::Bytes(v) => Datum::Bytes(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(v.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Borrowed view of a single value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Datum<'a> {
    Null,
    Int64(i64),
    Float64(f64),
    Bytes(&'a [u8]),
}

impl<'a> Datum<'a> {
    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Int64(_) => "int64",
            Datum::Float64(_) => "float64",
            Datum::Bytes(_) => "bytes",
        }
    }

    pub fn to_value(&self) -> Value {
        match *self {
            Datum::Null => Value::Null,
            Datum::Int64(v) => Value::Int64(v),
            Datum::Float64(v) => Value::Float64(v),
            Datum::Bytes(v) => Value::Bytes(v.to_vec()),
        }
    }

    fn mismatch(&self, column: usize, expected: ColumnType) -> DataError {
        DataError::TypeMismatch {
            column,
            expected,
            found: self.type_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Column {
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    VarLen(Vec<Option<VarRef>>),
}

impl Column {
    fn new(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::Int64 => Column::Int64(vec![None; capacity]),
            ColumnType::Float64 => Column::Float64(vec![None; capacity]),
            ColumnType::VarLen => Column::VarLen(vec![None; capacity]),
        }
    }
}

/// Fixed-capacity columnar row data plus the identifier column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnStore {
    schema: Vec<ColumnType>,
    columns: Vec<Column>,
    /// Globally unique row identifiers: source batch in the high half, offset in the low half.
    ids: Vec<u64>,
}

impl ColumnStore {
    fn new(schema: &[ColumnType], capacity: usize) -> Self {
        ColumnStore {
            schema: schema.to_vec(),
            columns: schema.iter().map(|t| Column::new(*t, capacity)).collect(),
            ids: vec![0; capacity],
        }
    }

    pub fn schema(&self) -> &[ColumnType] {
        &self.schema
    }

    fn datum<'a>(&'a self, side: &'a SideBuffer, row: usize, column: usize) -> Result<Datum<'a>, DataError> {
        let data = self.columns.get(column).ok_or(DataError::ColumnOutOfRange {
            column,
            columns: self.columns.len(),
        })?;
        let rows = self.ids.len();
        let out_of_range = DataError::RowOutOfRange { row, rows };

        return Ok(match data {
            Column::Int64(values) => values.get(row).ok_or(out_of_range)?.map_or(Datum::Null, Datum::Int64),
            Column::Float64(values) => values.get(row).ok_or(out_of_range)?.map_or(Datum::Null, Datum::Float64),
            Column::VarLen(values) => match values.get(row).ok_or(out_of_range)? {
                Some(var) => Datum::Bytes(side.get(*var)?),
                None => Datum::Null,
            },
        });
    }
}

/// Comparator-visible reference to one row: its chunk data, side buffer and row slot.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    store: &'a ColumnStore,
    side: &'a SideBuffer,
    row: usize,
}

impl<'a> Record<'a> {
    pub(crate) fn new(store: &'a ColumnStore, side: &'a SideBuffer, row: usize) -> Self {
        Record { store, side, row }
    }

    /// Row slot within the owning chunk.
    pub fn row(&self) -> usize {
        self.row
    }

    pub fn id(&self) -> u64 {
        self.store.ids[self.row]
    }

    pub fn datum(&self, column: usize) -> Result<Datum<'a>, DataError> {
        self.store.datum(self.side, self.row, column)
    }

    pub fn store(&self) -> &'a ColumnStore {
        self.store
    }

    pub fn side(&self) -> &'a SideBuffer {
        self.side
    }
}

/// Row-wise input for filling chunk slots. Row numbers are relative to the start of the source.
pub(crate) trait RowSource: Sync {
    fn datum(&self, row: usize, column: usize) -> Result<Datum<'_>, DataError>;

    fn id(&self, row: usize) -> u64;
}

impl<'a> RowSource for [Record<'a>] {
    fn datum(&self, row: usize, column: usize) -> Result<Datum<'_>, DataError> {
        self[row].datum(column)
    }

    fn id(&self, row: usize) -> u64 {
        self[row].id()
    }
}

/// Checks a source row against the schema and returns its payload size in bytes.
pub(crate) fn payload_size<S>(schema: &[ColumnType], source: &S, row: usize) -> Result<usize, DataError>
where
    S: RowSource + ?Sized,
{
    let mut size = 0;
    for (column, column_type) in schema.iter().enumerate() {
        match (column_type, source.datum(row, column)?) {
            (_, Datum::Null) => {}
            (ColumnType::Int64, Datum::Int64(_)) | (ColumnType::Float64, Datum::Float64(_)) => {}
            (ColumnType::VarLen, Datum::Bytes(bytes)) => size += bytes.len(),
            (expected, datum) => return Err(datum.mismatch(column, *expected)),
        }
    }

    return Ok(size);
}

/// Bounded columnar buffer of rows.
///
/// Row data is written once, at load or merge time, and never moves afterwards;
/// sorting only permutes the index array. The index array is padded to the next
/// power of two of the capacity and every entry at or past the row count holds
/// [`SENTINEL`].
#[derive(Debug)]
pub struct ColumnChunk {
    id: ChunkId,
    store: ColumnStore,
    side: SideBuffer,
    index: Vec<u32>,
    nrows: AtomicUsize,
    capacity: usize,
    status: Status,
}

impl ColumnChunk {
    pub(crate) fn new(schema: &[ColumnType], capacity: usize, side: SideBuffer) -> Self {
        ColumnChunk {
            id: ChunkId::next(),
            store: ColumnStore::new(schema, capacity),
            side,
            index: vec![SENTINEL; capacity.next_power_of_two()],
            nrows: AtomicUsize::new(0),
            capacity,
            status: Status::Success,
        }
    }

    pub(crate) fn from_parts(
        id: ChunkId,
        store: ColumnStore,
        side: SideBuffer,
        index: Vec<u32>,
        rows: usize,
        capacity: usize,
        status: Status,
    ) -> Self {
        ColumnChunk {
            id,
            store,
            side,
            index,
            nrows: AtomicUsize::new(rows),
            capacity,
            status,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn rows(&self) -> usize {
        self.nrows.load(atomic::Ordering::Acquire)
    }

    pub fn free_rows(&self) -> usize {
        self.capacity - self.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn schema(&self) -> &[ColumnType] {
        self.store.schema()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn store(&self) -> &ColumnStore {
        &self.store
    }

    pub fn side(&self) -> &SideBuffer {
        &self.side
    }

    /// Permutation index: sorted position to row slot.
    pub fn index(&self) -> &[u32] {
        &self.index
    }

    /// Returns a record by row slot.
    pub fn record(&self, row: usize) -> Option<Record<'_>> {
        (row < self.rows()).then(|| Record::new(&self.store, &self.side, row))
    }

    /// Returns a value by row slot and column.
    pub fn datum(&self, row: usize, column: usize) -> Result<Datum<'_>, DataError> {
        if row >= self.rows() {
            return Err(DataError::RowOutOfRange { row, rows: self.rows() });
        }
        self.store.datum(&self.side, row, column)
    }

    /// Returns records in index order.
    pub fn sorted_records(&self) -> impl Iterator<Item = Record<'_>> + '_ {
        self.index[..self.rows()]
            .iter()
            .map(move |row| Record::new(&self.store, &self.side, *row as usize))
    }

    /// Returns row identifiers in index order.
    pub fn sorted_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.sorted_records().map(|record| record.id())
    }

    /// Reserves up to `wanted` contiguous row slots. The reservation is bounded by the
    /// capacity, so concurrent callers always receive disjoint ranges.
    pub fn reserve(&self, wanted: usize) -> Range<usize> {
        let capacity = self.capacity;
        let start = match self
            .nrows
            .fetch_update(atomic::Ordering::AcqRel, atomic::Ordering::Acquire, |nrows| {
                Some(nrows + wanted.min(capacity - nrows))
            }) {
            Ok(prev) | Err(prev) => prev,
        };

        return start..start + wanted.min(capacity - start);
    }

    /// Drops every row, leaving an empty chunk that can be filled again.
    /// Used for merge inputs, whose index no longer describes their rows.
    pub(crate) fn clear(&mut self) {
        self.nrows.store(0, atomic::Ordering::Release);
        self.index.clear();
        self.index.resize(self.capacity.next_power_of_two(), SENTINEL);
        self.side.clear();
    }

    pub(crate) fn parts_mut(&mut self) -> (&ColumnStore, &SideBuffer, &mut Vec<u32>) {
        (&self.store, &self.side, &mut self.index)
    }

    pub(crate) fn into_parts(self) -> (ChunkId, ColumnStore, SideBuffer, Vec<u32>, usize, usize, Status) {
        let rows = self.rows();
        (
            self.id,
            self.store,
            self.side,
            self.index,
            rows,
            self.capacity,
            self.status,
        )
    }

    /// Copies `count` source rows into the reserved slots starting at `start` and points
    /// their index entries at themselves. Fixed-width columns are written one lane per slot.
    pub(crate) fn fill<S>(&mut self, start: usize, count: usize, source: &S) -> Result<(), DataError>
    where
        S: RowSource + ?Sized,
    {
        let end = start + count;
        let ColumnChunk { store, side, index, .. } = self;

        for (column, data) in store.columns.iter_mut().enumerate() {
            match data {
                Column::Int64(values) => {
                    values[start..end]
                        .par_iter_mut()
                        .enumerate()
                        .try_for_each(|(row, slot)| {
                            *slot = match source.datum(row, column)? {
                                Datum::Null => None,
                                Datum::Int64(v) => Some(v),
                                other => return Err(other.mismatch(column, ColumnType::Int64)),
                            };
                            Ok(())
                        })?
                }
                Column::Float64(values) => {
                    values[start..end]
                        .par_iter_mut()
                        .enumerate()
                        .try_for_each(|(row, slot)| {
                            *slot = match source.datum(row, column)? {
                                Datum::Null => None,
                                Datum::Float64(v) => Some(v),
                                other => return Err(other.mismatch(column, ColumnType::Float64)),
                            };
                            Ok(())
                        })?
                }
                Column::VarLen(values) => {
                    // payload offsets depend on every previous row
                    for (row, slot) in values[start..end].iter_mut().enumerate() {
                        *slot = match source.datum(row, column)? {
                            Datum::Null => None,
                            Datum::Bytes(bytes) => Some(side.push(bytes).ok_or(DataError::SideBufferFull {
                                needed: bytes.len(),
                                remaining: side.remaining(),
                            })?),
                            other => return Err(other.mismatch(column, ColumnType::VarLen)),
                        };
                    }
                }
            }
        }

        store.ids[start..end]
            .par_iter_mut()
            .enumerate()
            .for_each(|(row, id)| *id = source.id(row));
        index[start..end]
            .par_iter_mut()
            .enumerate()
            .for_each(|(row, slot)| *slot = (start + row) as u32);

        return Ok(());
    }

    /// Copies the first row in index order into a new single-row chunk.
    pub fn head(&self) -> Result<Option<ColumnChunk>, DataError> {
        let first = match self.sorted_records().next() {
            Some(record) => record,
            None => return Ok(None),
        };

        let mut head = ColumnChunk::new(self.schema(), 1, SideBuffer::unbounded());
        let slots = head.reserve(1);
        head.fill(slots.start, slots.len(), &[first][..])?;

        return Ok(Some(head));
    }
}

/// Creates empty chunks of one sort job.
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    schema: Vec<ColumnType>,
    capacity: usize,
    side_limit: usize,
}

impl ChunkBuilder {
    /// Creates a builder for chunks holding up to `capacity` rows of the given schema.
    pub fn new(schema: Vec<ColumnType>, capacity: usize) -> Result<Self, SortError> {
        if capacity == 0 || capacity > MAX_CHUNK_CAPACITY {
            return Err(SortError::ContractViolation(format!(
                "chunk capacity must be within 1..={} (got {})",
                MAX_CHUNK_CAPACITY, capacity
            )));
        }

        return Ok(ChunkBuilder {
            schema,
            capacity,
            side_limit: usize::MAX,
        });
    }

    /// Limits the side buffer of every chunk to `limit` bytes.
    pub fn with_side_buffer_limit(mut self, limit: usize) -> Self {
        self.side_limit = limit;
        return self;
    }

    pub fn schema(&self) -> &[ColumnType] {
        &self.schema
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Creates a new empty chunk.
    pub fn build(&self) -> ColumnChunk {
        ColumnChunk::new(&self.schema, self.capacity, SideBuffer::new(self.side_limit))
    }

    /// Creates a merge destination. Its side buffer is unbounded since merged
    /// payloads may be spread over destinations unevenly.
    pub fn build_destination(&self) -> ColumnChunk {
        ColumnChunk::new(&self.schema, self.capacity, SideBuffer::unbounded())
    }
}
