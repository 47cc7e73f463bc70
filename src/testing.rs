//! Helpers shared by unit tests.

use std::cmp::Ordering;

use crate::chunk::{ChunkBuilder, ColumnChunk, ColumnType, Datum, Record, Value};
use crate::compare::DataError;
use crate::loader::{ChunkLoader, RowBatch};

pub(crate) fn int_batch(batch_id: u32, values: &[i64]) -> RowBatch {
    RowBatch::new(batch_id, 1, values.iter().map(|v| vec![Value::Int64(*v)]).collect())
}

/// Loads `values` into a new single-column chunk, unsorted.
pub(crate) fn int_chunk(capacity: usize, values: &[i64]) -> ColumnChunk {
    let mut chunk = ChunkBuilder::new(vec![ColumnType::Int64], capacity).unwrap().build();
    let outcome = ChunkLoader::new().load(&mut chunk, &int_batch(0, values)).unwrap();
    assert_eq!(outcome.loaded, values.len());
    chunk
}

pub(crate) fn int_comparator() -> impl Fn(&Record<'_>, &Record<'_>) -> Result<Ordering, DataError> + Sync + Copy {
    |a: &Record<'_>, b: &Record<'_>| match (a.datum(0)?, b.datum(0)?) {
        (Datum::Int64(a), Datum::Int64(b)) => Ok(a.cmp(&b)),
        (a, b) => Err(DataError::Comparator(format!(
            "cannot compare {} with {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// Values of the first column in index order.
pub(crate) fn sorted_ints(chunk: &ColumnChunk) -> Vec<i64> {
    chunk
        .sorted_records()
        .map(|record| match record.datum(0).unwrap() {
            Datum::Int64(v) => v,
            other => panic!("unexpected datum {:?}", other),
        })
        .collect()
}
