//! Chunk loader.
//!
//! Converts upstream record batches into the columnar layout of a [`ColumnChunk`].
//! A batch that does not fit is loaded partially: the prefix that fits is placed,
//! the call reports [`Status::NoSpace`] together with the number of consumed rows and
//! the caller routes the remainder to a fresh chunk with [`ChunkLoader::load_from`].
//!
//! The loader can be restricted to a projection of the batch columns, and batches
//! may mark rows as junk. Junk rows are consumed without being placed.

use rayon::prelude::*;

use crate::chunk::{payload_size, ColumnChunk, Datum, RowSource, Value};
use crate::compare::DataError;
use crate::sort::SortError;
use crate::status::Status;

/// Largest number of rows in one batch. Row identifiers keep the row number in their low 32 bits.
pub const MAX_BATCH_ROWS: u64 = 1 << 32;

/// Upstream batch of logical rows.
pub trait BatchSource: Sync {
    /// Source batch number, stamped into the high half of every row identifier.
    fn batch_id(&self) -> u32;

    fn num_rows(&self) -> usize;

    fn num_columns(&self) -> usize;

    fn value(&self, row: usize, column: usize) -> Result<Datum<'_>, DataError>;

    /// Returns `false` for junk rows, which take no part in the sort.
    fn is_visible(&self, _row: usize) -> bool {
        true
    }
}

/// Row-oriented batch.
#[derive(Debug, Clone)]
pub struct RowBatch {
    batch_id: u32,
    num_columns: usize,
    rows: Vec<Vec<Value>>,
    visible: Option<Vec<bool>>,
}

impl RowBatch {
    pub fn new(batch_id: u32, num_columns: usize, rows: Vec<Vec<Value>>) -> Self {
        RowBatch {
            batch_id,
            num_columns,
            rows,
            visible: None,
        }
    }

    /// Marks rows whose mask entry is `false` as junk. Rows past the end of the mask stay visible.
    pub fn with_visibility(mut self, mask: Vec<bool>) -> Self {
        self.visible = Some(mask);
        return self;
    }
}

impl BatchSource for RowBatch {
    fn batch_id(&self) -> u32 {
        self.batch_id
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn num_columns(&self) -> usize {
        self.num_columns
    }

    fn value(&self, row: usize, column: usize) -> Result<Datum<'_>, DataError> {
        let values = self.rows.get(row).ok_or(DataError::RowOutOfRange {
            row,
            rows: self.rows.len(),
        })?;
        values.get(column).map(Value::as_datum).ok_or(DataError::ColumnOutOfRange {
            column,
            columns: values.len(),
        })
    }

    fn is_visible(&self, row: usize) -> bool {
        is_visible(self.visible.as_deref(), row)
    }
}

/// Column-oriented batch. All columns must have the same length.
#[derive(Debug, Clone)]
pub struct ColumnBatch {
    batch_id: u32,
    columns: Vec<Vec<Value>>,
    visible: Option<Vec<bool>>,
}

impl ColumnBatch {
    pub fn new(batch_id: u32, columns: Vec<Vec<Value>>) -> Self {
        ColumnBatch {
            batch_id,
            columns,
            visible: None,
        }
    }

    /// Marks rows whose mask entry is `false` as junk. Rows past the end of the mask stay visible.
    pub fn with_visibility(mut self, mask: Vec<bool>) -> Self {
        self.visible = Some(mask);
        return self;
    }
}

impl BatchSource for ColumnBatch {
    fn batch_id(&self) -> u32 {
        self.batch_id
    }

    fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    fn num_columns(&self) -> usize {
        self.columns.len()
    }

    fn value(&self, row: usize, column: usize) -> Result<Datum<'_>, DataError> {
        let values = self.columns.get(column).ok_or(DataError::ColumnOutOfRange {
            column,
            columns: self.columns.len(),
        })?;
        values.get(row).map(Value::as_datum).ok_or(DataError::RowOutOfRange {
            row,
            rows: values.len(),
        })
    }

    fn is_visible(&self, row: usize) -> bool {
        is_visible(self.visible.as_deref(), row)
    }
}

fn is_visible(mask: Option<&[bool]>, row: usize) -> bool {
    mask.and_then(|mask| mask.get(row).copied()).unwrap_or(true)
}

/// Selected rows of a batch, seen through the loader projection.
struct BatchRows<'a, B: BatchSource> {
    batch: &'a B,
    rows: &'a [usize],
    projection: Option<&'a [usize]>,
}

impl<'a, B: BatchSource> RowSource for BatchRows<'a, B> {
    fn datum(&self, row: usize, column: usize) -> Result<Datum<'_>, DataError> {
        let source_row = *self.rows.get(row).ok_or(DataError::RowOutOfRange {
            row,
            rows: self.rows.len(),
        })?;
        let source_column = match self.projection {
            Some(projection) => *projection.get(column).ok_or(DataError::ColumnOutOfRange {
                column,
                columns: projection.len(),
            })?,
            None => column,
        };
        self.batch.value(source_row, source_column)
    }

    fn id(&self, row: usize) -> u64 {
        (self.batch.batch_id() as u64) << 32 | self.rows[row] as u64
    }
}

/// Result of a single load call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    /// [`Status::Success`] if the whole remainder was consumed, [`Status::NoSpace`] otherwise.
    pub status: Status,
    /// Number of rows placed by this call.
    pub loaded: usize,
    /// Number of junk rows passed over by this call.
    pub skipped: usize,
    /// Number of batch rows left for a fresh chunk.
    pub remaining: usize,
}

impl LoadOutcome {
    /// Number of batch rows this call moved past. The next load of the batch starts that many rows later.
    pub fn consumed(&self) -> usize {
        self.loaded + self.skipped
    }
}

/// Moves batches into column chunks.
#[derive(Debug, Clone, Default)]
pub struct ChunkLoader {
    /// Batch column feeding each chunk column. All batch columns in order if not set.
    projection: Option<Vec<usize>>,
}

impl ChunkLoader {
    pub fn new() -> Self {
        ChunkLoader::default()
    }

    /// Loads only the given batch columns: chunk column `i` is taken from batch column `columns[i]`.
    pub fn with_projection(mut self, columns: Vec<usize>) -> Self {
        self.projection = Some(columns);
        return self;
    }

    pub fn projection(&self) -> Option<&[usize]> {
        self.projection.as_deref()
    }

    /// Loads a whole batch into the chunk.
    pub fn load<B: BatchSource>(&self, chunk: &mut ColumnChunk, batch: &B) -> Result<LoadOutcome, SortError> {
        self.load_from(chunk, batch, 0)
    }

    /// Loads batch rows starting at `offset` into the chunk.
    ///
    /// Junk rows are passed over and never reach the chunk. Rows are checked against
    /// the chunk schema before any slot is reserved, so a fault never leaves a
    /// partially written range behind. On a fault the chunk is flagged with
    /// [`Status::Fault`].
    pub fn load_from<B: BatchSource>(
        &self,
        chunk: &mut ColumnChunk,
        batch: &B,
        offset: usize,
    ) -> Result<LoadOutcome, SortError> {
        let total = batch.num_rows();
        if offset > total {
            return Err(SortError::ContractViolation(format!(
                "load offset {} past the end of batch {} ({} rows)",
                offset,
                batch.batch_id(),
                total
            )));
        }
        if total as u64 > MAX_BATCH_ROWS {
            return Err(SortError::ContractViolation(format!(
                "batch {} has {} rows, at most {} rows fit into row identifiers",
                batch.batch_id(),
                total,
                MAX_BATCH_ROWS
            )));
        }

        self.check_columns(chunk, batch)?;

        // visible rows that may still fit into the chunk
        let free_rows = chunk.free_rows();
        let mut candidates = Vec::with_capacity(free_rows.min(total - offset));
        let mut cursor = offset;
        while cursor < total && candidates.len() < free_rows {
            if batch.is_visible(cursor) {
                candidates.push(cursor);
            }
            cursor += 1;
        }

        let rows = BatchRows {
            batch,
            rows: &candidates,
            projection: self.projection(),
        };
        let sizes = (0..candidates.len())
            .into_par_iter()
            .map(|row| payload_size(chunk.schema(), &rows, row))
            .collect::<Result<Vec<_>, _>>();
        let sizes = match sizes {
            Ok(sizes) => sizes,
            Err(err) => return Err(Self::fault(chunk, err)),
        };

        let mut free_bytes = chunk.side().remaining();
        let mut fitting = 0;
        for size in sizes {
            if size > free_bytes {
                break;
            }
            free_bytes -= size;
            fitting += 1;
        }

        let slots = chunk.reserve(fitting);
        if let Err(err) = chunk.fill(slots.start, slots.len(), &rows) {
            return Err(Self::fault(chunk, err));
        }
        let loaded = slots.len();

        let mut next = candidates.get(loaded).copied().unwrap_or(cursor);
        while next < total && !batch.is_visible(next) {
            next += 1;
        }

        let status = if next == total {
            Status::Success
        } else {
            Status::NoSpace
        };
        chunk.set_status(status);

        let outcome = LoadOutcome {
            status,
            loaded,
            skipped: next - offset - loaded,
            remaining: total - next,
        };
        log::trace!(
            "loaded {} of {} rows of batch {} into {} ({} junk rows skipped, {:?})",
            loaded,
            total - offset,
            batch.batch_id(),
            chunk.id(),
            outcome.skipped,
            status
        );

        return Ok(outcome);
    }

    /// Checks that the batch, seen through the projection, matches the chunk width.
    fn check_columns<B: BatchSource>(&self, chunk: &mut ColumnChunk, batch: &B) -> Result<(), SortError> {
        let columns = batch.num_columns();
        let width = match self.projection() {
            Some(projection) => {
                if let Some(column) = projection.iter().copied().find(|column| *column >= columns) {
                    return Err(Self::fault(chunk, DataError::ColumnOutOfRange { column, columns }));
                }
                projection.len()
            }
            None => columns,
        };

        if width != chunk.schema().len() {
            return Err(Self::fault(
                chunk,
                DataError::ColumnOutOfRange {
                    column: chunk.schema().len(),
                    columns: width,
                },
            ));
        }

        return Ok(());
    }

    fn fault(chunk: &mut ColumnChunk, error: DataError) -> SortError {
        chunk.set_status(Status::Fault);
        SortError::Fault {
            chunk: chunk.id(),
            row: None,
            error,
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use rstest::*;

    use super::{BatchSource, ChunkLoader, ColumnBatch, RowBatch, MAX_BATCH_ROWS};
    use crate::chunk::{ChunkBuilder, ColumnType, Datum, Value};
    use crate::compare::DataError;
    use crate::sort::SortError;
    use crate::status::Status;

    fn int_batch(batch_id: u32, values: impl IntoIterator<Item = i64>) -> RowBatch {
        RowBatch::new(
            batch_id,
            1,
            values.into_iter().map(|v| vec![Value::Int64(v)]).collect(),
        )
    }

    #[fixture]
    fn builder() -> ChunkBuilder {
        ChunkBuilder::new(vec![ColumnType::Int64], 6).unwrap()
    }

    #[rstest]
    fn test_backpressure(builder: ChunkBuilder) {
        let batch = int_batch(7, 0..10);
        let loader = ChunkLoader::new();

        let mut first = builder.build();
        let outcome = loader.load(&mut first, &batch).unwrap();
        assert_eq!(outcome.status, Status::NoSpace);
        assert_eq!(outcome.loaded, 6);
        assert_eq!(outcome.remaining, 4);
        assert_eq!(first.rows(), 6);
        assert_eq!(first.status(), Status::NoSpace);

        let mut second = builder.build();
        let outcome = loader.load_from(&mut second, &batch, outcome.consumed()).unwrap();
        assert_eq!(outcome.status, Status::Success);
        assert_eq!(outcome.loaded, 4);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(second.rows(), 4);

        let mut values = Vec::new();
        let mut ids = HashSet::new();
        for chunk in [&first, &second] {
            for row in 0..chunk.rows() {
                match chunk.datum(row, 0).unwrap() {
                    Datum::Int64(v) => values.push(v),
                    other => panic!("unexpected datum {:?}", other),
                }
                assert!(ids.insert(chunk.record(row).unwrap().id()));
            }
        }
        assert_eq!(values, Vec::from_iter(0..10));
        assert_eq!(ids, HashSet::from_iter((0..10).map(|offset| 7u64 << 32 | offset)));
    }

    #[rstest]
    fn test_identity_index(builder: ChunkBuilder) {
        let mut chunk = builder.build();
        ChunkLoader::new().load(&mut chunk, &int_batch(0, [5, 3])).unwrap();
        ChunkLoader::new().load(&mut chunk, &int_batch(1, [4])).unwrap();

        assert_eq!(&chunk.index()[..3], &[0, 1, 2]);
        assert!(chunk.index()[3..].iter().all(|entry| *entry == crate::chunk::SENTINEL));
        assert_eq!(Vec::from_iter(chunk.sorted_ids()), vec![0, 1, 1 << 32]);
    }

    #[rstest]
    fn test_full_chunk_loads_nothing(builder: ChunkBuilder) {
        let mut chunk = builder.build();
        ChunkLoader::new().load(&mut chunk, &int_batch(0, 0..6)).unwrap();

        let outcome = ChunkLoader::new().load(&mut chunk, &int_batch(1, 0..2)).unwrap();
        assert_eq!(outcome.status, Status::NoSpace);
        assert_eq!(outcome.loaded, 0);
        assert_eq!(outcome.remaining, 2);
    }

    #[test]
    fn test_side_buffer_backpressure() {
        let builder = ChunkBuilder::new(vec![ColumnType::VarLen], 10)
            .unwrap()
            .with_side_buffer_limit(8);
        let batch = RowBatch::new(
            0,
            1,
            vec![vec!["abc".into()], vec![Value::Null], vec!["defg".into()], vec!["hi".into()]],
        );

        let mut chunk = builder.build();
        let outcome = ChunkLoader::new().load(&mut chunk, &batch).unwrap();
        assert_eq!(outcome.status, Status::NoSpace);
        assert_eq!(outcome.loaded, 3);
        assert_eq!(chunk.side().len(), 7);
        assert_eq!(chunk.datum(0, 0).unwrap(), Datum::Bytes(b"abc"));
        assert_eq!(chunk.datum(1, 0).unwrap(), Datum::Null);
        assert_eq!(chunk.datum(2, 0).unwrap(), Datum::Bytes(b"defg"));
    }

    #[rstest]
    fn test_type_mismatch_is_fault(builder: ChunkBuilder) {
        let batch = RowBatch::new(0, 1, vec![vec![Value::Int64(1)], vec!["oops".into()]]);

        let mut chunk = builder.build();
        let result = ChunkLoader::new().load(&mut chunk, &batch);

        match result {
            Err(SortError::Fault { chunk: id, .. }) => assert_eq!(id, chunk.id()),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(chunk.status(), Status::Fault);
        assert_eq!(chunk.rows(), 0);
    }

    #[rstest]
    fn test_column_count_mismatch_is_fault(builder: ChunkBuilder) {
        let batch = RowBatch::new(0, 2, vec![vec![Value::Int64(1), Value::Int64(2)]]);

        let mut chunk = builder.build();
        assert!(matches!(
            ChunkLoader::new().load(&mut chunk, &batch),
            Err(SortError::Fault { .. })
        ));
    }

    #[test]
    fn test_column_batch() {
        let builder = ChunkBuilder::new(vec![ColumnType::Int64, ColumnType::VarLen], 4).unwrap();
        let batch = ColumnBatch::new(
            3,
            vec![
                vec![Value::Int64(1), Value::Int64(2)],
                vec!["one".into(), "two".into()],
            ],
        );
        assert_eq!(batch.num_rows(), 2);

        let mut chunk = builder.build();
        let outcome = ChunkLoader::new().load(&mut chunk, &batch).unwrap();
        assert_eq!(outcome.status, Status::Success);
        assert_eq!(chunk.datum(1, 0).unwrap(), Datum::Int64(2));
        assert_eq!(chunk.datum(1, 1).unwrap(), Datum::Bytes(b"two"));
        assert_eq!(chunk.record(1).unwrap().id(), 3u64 << 32 | 1);
    }

    #[test]
    fn test_projection() {
        let builder = ChunkBuilder::new(vec![ColumnType::VarLen, ColumnType::Int64], 4).unwrap();
        let batch = RowBatch::new(
            2,
            3,
            vec![
                vec![Value::Int64(10), "unused".into(), "a".into()],
                vec![Value::Int64(20), "unused too".into(), "b".into()],
            ],
        );
        let loader = ChunkLoader::new().with_projection(vec![2, 0]);

        let mut chunk = builder.build();
        let outcome = loader.load(&mut chunk, &batch).unwrap();

        assert_eq!(outcome.status, Status::Success);
        assert_eq!(chunk.datum(0, 0).unwrap(), Datum::Bytes(b"a"));
        assert_eq!(chunk.datum(0, 1).unwrap(), Datum::Int64(10));
        assert_eq!(chunk.datum(1, 0).unwrap(), Datum::Bytes(b"b"));
        assert_eq!(chunk.datum(1, 1).unwrap(), Datum::Int64(20));
        // projected-out payloads never reach the side buffer
        assert_eq!(chunk.side().len(), 2);
    }

    #[rstest]
    #[case(vec![1, 0])]
    #[case(vec![0, 3])]
    fn test_invalid_projection_is_fault(#[case] projection: Vec<usize>) {
        let builder = ChunkBuilder::new(vec![ColumnType::Int64], 4).unwrap();
        let batch = RowBatch::new(0, 3, vec![vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)]]);

        let mut chunk = builder.build();
        let result = ChunkLoader::new().with_projection(projection).load(&mut chunk, &batch);

        assert!(matches!(result, Err(SortError::Fault { .. })));
        assert_eq!(chunk.status(), Status::Fault);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_junk_rows_are_skipped() {
        let builder = ChunkBuilder::new(vec![ColumnType::Int64], 2).unwrap();
        let batch = int_batch(5, 0..6).with_visibility(vec![true, false, true, false, true, true]);
        let loader = ChunkLoader::new();

        let mut first = builder.build();
        let outcome = loader.load(&mut first, &batch).unwrap();
        assert_eq!(outcome.status, Status::NoSpace);
        assert_eq!(outcome.loaded, 2);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.remaining, 2);
        assert_eq!(outcome.consumed(), 4);

        let mut second = builder.build();
        let outcome = loader.load_from(&mut second, &batch, outcome.consumed()).unwrap();
        assert_eq!(outcome.status, Status::Success);
        assert_eq!(outcome.loaded, 2);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.remaining, 0);

        let ids = Vec::from_iter(first.sorted_ids().chain(second.sorted_ids()));
        assert_eq!(ids, Vec::from_iter([0u64, 2, 4, 5].iter().map(|row| 5 << 32 | row)));
        let values = Vec::from_iter([&first, &second].iter().flat_map(|chunk| {
            (0..chunk.rows()).map(|row| match chunk.datum(row, 0).unwrap() {
                Datum::Int64(v) => v,
                other => panic!("unexpected datum {:?}", other),
            })
        }));
        assert_eq!(values, vec![0, 2, 4, 5]);
    }

    #[rstest]
    fn test_trailing_junk_completes_batch(builder: ChunkBuilder) {
        let batch = ColumnBatch::new(0, vec![vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)]])
            .with_visibility(vec![true, false, false]);

        let mut chunk = builder.build();
        let outcome = ChunkLoader::new().load(&mut chunk, &batch).unwrap();

        assert_eq!(outcome.status, Status::Success);
        assert_eq!(outcome.loaded, 1);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(chunk.rows(), 1);
    }

    #[rstest]
    fn test_all_junk_batch_into_full_chunk(builder: ChunkBuilder) {
        let mut chunk = builder.build();
        ChunkLoader::new().load(&mut chunk, &int_batch(0, 0..6)).unwrap();

        let batch = int_batch(1, 0..3).with_visibility(vec![false; 3]);
        let outcome = ChunkLoader::new().load(&mut chunk, &batch).unwrap();

        assert_eq!(outcome.status, Status::Success);
        assert_eq!(outcome.consumed(), 3);
        assert_eq!(chunk.rows(), 6);
    }

    #[cfg(target_pointer_width = "64")]
    struct OversizedBatch;

    #[cfg(target_pointer_width = "64")]
    impl BatchSource for OversizedBatch {
        fn batch_id(&self) -> u32 {
            9
        }

        fn num_rows(&self) -> usize {
            (MAX_BATCH_ROWS + 1) as usize
        }

        fn num_columns(&self) -> usize {
            1
        }

        fn value(&self, _row: usize, _column: usize) -> Result<Datum<'_>, DataError> {
            Ok(Datum::Int64(0))
        }
    }

    #[cfg(target_pointer_width = "64")]
    #[rstest]
    fn test_batch_too_large_for_row_ids(builder: ChunkBuilder) {
        let mut chunk = builder.build();
        let result = ChunkLoader::new().load(&mut chunk, &OversizedBatch);

        assert!(matches!(result, Err(SortError::ContractViolation(_))));
        assert!(chunk.is_empty());
    }
}
