//! Inter-chunk window merger.
//!
//! Merges two individually sorted chunks `x` and `y` into two destination chunks
//! `z0` and `z1` using only those four chunks as working memory. The index arrays of
//! `x` and `y` are treated as one virtual sequence of `2 * half` slots, `half` being
//! the next power of two of the larger input: virtual entries `[0, half)` address
//! rows of `x`, entries `[half, 2 * half)` address rows of `y` shifted by `half`, and
//! padding holds [`SENTINEL`]. A bitonic merge network orders the virtual sequence,
//! then every surviving entry is copied into `z0` while `z0` has room and into `z1`
//! afterwards.
//!
//! Time complexity is *n* \* log(*n*) compares spread over log(*n*) passes.

use std::cmp::Ordering;
use std::ops::Range;

use rayon::prelude::*;

use crate::bitonic::{compare_exchange, merge_schedule, run_pass, LaneFault};
use crate::chunk::{payload_size, ColumnChunk, Record, SENTINEL};
use crate::compare::{charges_right, Comparator, DataError};
use crate::sort::SortError;
use crate::status::Status;

/// Merges sorted chunks `x` and `y` into the empty destinations `z0` and `z1`.
///
/// On success `z0` followed by `z1` holds every row of `x` and `y` in comparator
/// order, `z0` being filled up to its capacity first. Each destination's row count
/// is the number of non-sentinel merge positions mapped into it. Rows comparing equal
/// keep `x` before `y`. The inputs are consumed: they are left empty, with
/// [`Status::Success`], and can be loaded again.
///
/// Destinations that cannot hold both inputs are a contract violation, reported
/// before any input is touched. Destination side buffers too small for the merged
/// payloads are a contract violation as well, reported before anything is copied and
/// with both inputs restored. A comparator fault is charged to the row it names,
/// flags all four chunks with [`Status::Fault`] and leaves the inputs empty.
pub fn merge_chunks<C>(
    x: &mut ColumnChunk,
    y: &mut ColumnChunk,
    z0: &mut ColumnChunk,
    z1: &mut ColumnChunk,
    comparator: &C,
) -> Result<(), SortError>
where
    C: Comparator + ?Sized,
{
    check_layout(x, y, z0, z1)?;

    let (x_rows, y_rows) = (x.rows(), y.rows());
    let half = x_rows.max(y_rows).next_power_of_two();
    let (x_id, y_id) = (x.id(), y.id());
    let (x_len, y_len) = (x.index().len(), y.index().len());

    let result = {
        let (x_store, x_side, x_index) = x.parts_mut();
        let (y_store, y_side, y_index) = y.parts_mut();

        renumber(x_index, x_rows, half, 0);
        renumber(y_index, y_rows, half, half as u32);

        let resolve = |entry: u32| {
            let entry = entry as usize;
            if entry < half {
                Record::new(x_store, x_side, entry)
            } else {
                Record::new(y_store, y_side, entry - half)
            }
        };
        let locate = |entry: u32| {
            let entry = entry as usize;
            if entry < half {
                (x_id, entry)
            } else {
                (y_id, entry - half)
            }
        };

        let network = if x_rows > 0 && y_rows > 0 {
            let exchange = |a: u32, b: u32| -> Result<bool, LaneFault> {
                if b == SENTINEL {
                    return Ok(false);
                }
                if a == SENTINEL {
                    return Ok(true);
                }
                let (left, right) = (resolve(a), resolve(b));
                let ordering = comparator.compare(&left, &right).map_err(|error| LaneFault {
                    entry: if charges_right(comparator, &left, &right) { b } else { a },
                    error,
                })?;
                // ties go to x, whose entries sit below `half`
                Ok(ordering.then((a as usize >= half).cmp(&(b as usize >= half))) == Ordering::Greater)
            };
            merge_network(x_index, y_index, &exchange)
        } else {
            // an exhausted input leaves the other one as it is
            Ok(())
        };

        match network {
            Err(LaneFault { entry, error }) => {
                let (chunk, row) = locate(entry);
                Err(SortError::Fault {
                    chunk,
                    row: Some(row),
                    error,
                })
            }
            Ok(()) => {
                let merged: Vec<u32> = x_index
                    .par_iter()
                    .chain(y_index.par_iter())
                    .copied()
                    .filter(|entry| *entry != SENTINEL)
                    .collect();
                let records: Vec<Record<'_>> = merged.par_iter().map(|entry| resolve(*entry)).collect();
                let (low, high) = records.split_at(z0.capacity().min(records.len()));

                match check_payloads(z0, z1, &records, low.len()) {
                    Ok(()) => copy_rows(z0, low).and_then(|_| copy_rows(z1, high)),
                    Err(PayloadError::Unreadable(position, error)) => {
                        let (chunk, row) = locate(merged[position]);
                        Err(SortError::Fault {
                            chunk,
                            row: Some(row),
                            error,
                        })
                    }
                    Err(PayloadError::Overflow(msg)) => {
                        restore_index(x_index, &merged, 0..half, x_len);
                        restore_index(y_index, &merged, half..2 * half, y_len);
                        Err(SortError::ContractViolation(msg))
                    }
                }
            }
        }
    };

    match result {
        Ok(()) => {
            log::debug!(
                "merged {} and {} into {} ({} rows) and {} ({} rows)",
                x_id,
                y_id,
                z0.id(),
                z0.rows(),
                z1.id(),
                z1.rows()
            );
            for input in [x, y] {
                input.clear();
                input.set_status(Status::Success);
            }
            Ok(())
        }
        // inputs are restored and destinations untouched
        Err(err @ SortError::ContractViolation(_)) => Err(err),
        Err(err) => {
            log::debug!("merging {} and {} failed: {}", x_id, y_id, err);
            x.clear();
            y.clear();
            for chunk in [x, y, z0, z1] {
                chunk.set_status(Status::Fault);
            }
            Err(err)
        }
    }
}

fn check_layout(x: &ColumnChunk, y: &ColumnChunk, z0: &ColumnChunk, z1: &ColumnChunk) -> Result<(), SortError> {
    if [y, z0, z1].iter().any(|chunk| chunk.schema() != x.schema()) {
        return Err(SortError::ContractViolation(format!(
            "merge of {} and {} over mismatching schemas",
            x.id(),
            y.id()
        )));
    }

    if let Some(faulted) = [x, y].iter().find(|chunk| chunk.status().is_fault()) {
        return Err(SortError::ContractViolation(format!(
            "{} is faulted and cannot be merged",
            faulted.id()
        )));
    }

    if !z0.is_empty() || !z1.is_empty() {
        return Err(SortError::ContractViolation(format!(
            "merge destinations {} and {} must be empty",
            z0.id(),
            z1.id()
        )));
    }

    if x.rows() + y.rows() > z0.capacity() + z1.capacity() {
        return Err(SortError::ContractViolation(format!(
            "merge destinations hold {} + {} rows, inputs have {} + {} rows",
            z0.capacity(),
            z1.capacity(),
            x.rows(),
            y.rows()
        )));
    }

    return Ok(());
}

/// Maps an input index array onto its half of the virtual sequence.
fn renumber(index: &mut Vec<u32>, rows: usize, half: usize, offset: u32) {
    index.resize(half, SENTINEL);
    index.par_iter_mut().enumerate().for_each(|(pos, entry)| {
        *entry = if pos < rows { *entry + offset } else { SENTINEL };
    });
}

/// Runs the bitonic merge network over the virtual sequence `x_index ++ y_index`.
/// Only the first pass crosses the two halves, later passes work inside each half.
fn merge_network<F>(x_index: &mut [u32], y_index: &mut [u32], exchange: &F) -> Result<(), LaneFault>
where
    F: Fn(u32, u32) -> Result<bool, LaneFault> + Sync,
{
    let half = x_index.len();
    let mut passes = merge_schedule(2 * half);

    if passes.next().is_some() {
        x_index
            .par_iter_mut()
            .zip(y_index.par_iter_mut().rev())
            .try_for_each(|(a, b)| compare_exchange(a, b, exchange))?;
    }

    for pass in passes {
        let (x_result, y_result) = rayon::join(
            || run_pass(x_index, pass, half, exchange),
            || run_pass(y_index, pass, half, exchange),
        );
        x_result?;
        y_result?;
    }

    Ok(())
}

enum PayloadError {
    /// A merged record could not be read, at its position in merge order.
    Unreadable(usize, DataError),
    Overflow(String),
}

/// Checks that the payloads of `records[..split]` fit into `z0` and the rest into `z1`.
fn check_payloads(
    z0: &ColumnChunk,
    z1: &ColumnChunk,
    records: &[Record<'_>],
    split: usize,
) -> Result<(), PayloadError> {
    let schema = z0.schema();
    let sizes = (0..records.len())
        .into_par_iter()
        .map(|position| payload_size(schema, records, position).map_err(|error| (position, error)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|(position, error)| PayloadError::Unreadable(position, error))?;

    let (low, high) = sizes.split_at(split);
    for (dst, bytes) in [(z0, low.iter().sum::<usize>()), (z1, high.iter().sum())] {
        if bytes > dst.side().remaining() {
            return Err(PayloadError::Overflow(format!(
                "merge destination {} has {} free side buffer bytes, {} needed",
                dst.id(),
                dst.side().remaining(),
                bytes
            )));
        }
    }

    return Ok(());
}

/// Rebuilds an input index from the merged order of its part of the virtual sequence.
fn restore_index(index: &mut Vec<u32>, merged: &[u32], part: Range<usize>, len: usize) {
    let start = part.start as u32;
    index.clear();
    index.extend(
        merged
            .iter()
            .filter(|entry| part.contains(&(**entry as usize)))
            .map(|entry| entry - start),
    );
    index.resize(len, SENTINEL);
}

fn copy_rows(dst: &mut ColumnChunk, rows: &[Record<'_>]) -> Result<(), SortError> {
    let slots = dst.reserve(rows.len());
    if let Err(error) = dst.fill(slots.start, slots.len(), rows) {
        return Err(SortError::Fault {
            chunk: dst.id(),
            row: None,
            error,
        });
    }
    dst.set_status(Status::Success);

    return Ok(());
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;
    use std::collections::HashSet;

    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::merge_chunks;
    use crate::bitonic::sort_chunk;
    use crate::chunk::{ChunkBuilder, ColumnChunk, ColumnType, Datum, Record, Value, SENTINEL};
    use crate::compare::{DataError, KeyComparator, SortKey};
    use crate::loader::{ChunkLoader, RowBatch};
    use crate::sort::SortError;
    use crate::status::Status;
    use crate::testing::{int_batch, int_chunk, int_comparator, sorted_ints};

    fn sorted_chunk(capacity: usize, batch_id: u32, values: &[i64]) -> ColumnChunk {
        let mut chunk = ChunkBuilder::new(vec![ColumnType::Int64], capacity).unwrap().build();
        ChunkLoader::new().load(&mut chunk, &int_batch(batch_id, values)).unwrap();
        sort_chunk(&mut chunk, &int_comparator()).unwrap();
        chunk
    }

    fn destinations(capacity: usize) -> (ColumnChunk, ColumnChunk) {
        let builder = ChunkBuilder::new(vec![ColumnType::Int64], capacity).unwrap();
        (builder.build(), builder.build())
    }

    #[test]
    fn test_merge_splits_at_destination_capacity() {
        let mut x = sorted_chunk(3, 0, &[7, 3]);
        let mut y = sorted_chunk(3, 1, &[9, 1, 5]);
        let (mut z0, mut z1) = destinations(3);

        merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &int_comparator()).unwrap();

        assert_eq!(sorted_ints(&z0), vec![1, 3, 5]);
        assert_eq!(sorted_ints(&z1), vec![7, 9]);
        assert_eq!((z0.rows(), z1.rows()), (3, 2));
        assert_eq!(z0.status(), Status::Success);
        assert_eq!(z1.status(), Status::Success);
        assert_eq!(&z0.index()[..3], &[0, 1, 2]);
    }

    #[rstest]
    #[case(1, 1, 1)]
    #[case(5, 3, 8)]
    #[case(8, 8, 8)]
    #[case(13, 2, 16)]
    #[case(100, 77, 100)]
    #[case(250, 250, 256)]
    fn test_merge(#[case] x_rows: usize, #[case] y_rows: usize, #[case] capacity: usize) {
        let mut rng = rand::thread_rng();
        let x_values = Vec::from_iter((0..x_rows).map(|_| rng.gen_range(-50..50)));
        let y_values = Vec::from_iter((0..y_rows).map(|_| rng.gen_range(-50..50)));

        let mut x = sorted_chunk(capacity, 0, &x_values);
        let mut y = sorted_chunk(capacity, 1, &y_values);
        let mut expected_ids = HashSet::<u64>::from_iter(x.sorted_ids());
        expected_ids.extend(y.sorted_ids());
        let (mut z0, mut z1) = destinations(capacity);

        merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &int_comparator()).unwrap();

        let mut expected = x_values.clone();
        expected.extend(&y_values);
        expected.sort();

        let mut actual = sorted_ints(&z0);
        actual.extend(sorted_ints(&z1));
        assert_eq!(actual, expected);
        assert_eq!(z0.rows(), capacity.min(x_rows + y_rows));
        assert_eq!(z0.rows() + z1.rows(), x_rows + y_rows);

        let actual_ids = HashSet::from_iter(z0.sorted_ids().chain(z1.sorted_ids()));
        assert_eq!(actual_ids, expected_ids);
    }

    #[rstest]
    #[case(vec![], vec![4, 2, 8], 2, vec![2, 4], vec![8])]
    #[case(vec![4, 2, 8], vec![], 2, vec![2, 4], vec![8])]
    #[case(vec![], vec![4, 2, 8], 4, vec![2, 4, 8], vec![])]
    #[case(vec![4, 2, 8], vec![], 3, vec![2, 4, 8], vec![])]
    #[case(vec![], vec![], 2, vec![], vec![])]
    fn test_merge_with_exhausted_input(
        #[case] x_values: Vec<i64>,
        #[case] y_values: Vec<i64>,
        #[case] capacity: usize,
        #[case] low: Vec<i64>,
        #[case] high: Vec<i64>,
    ) {
        let mut x = sorted_chunk(4, 0, &x_values);
        let mut y = sorted_chunk(4, 1, &y_values);
        let (mut z0, mut z1) = destinations(capacity);

        // a plain copy never consults the comparator
        let failing = |_: &Record<'_>, _: &Record<'_>| -> Result<Ordering, DataError> {
            Err(DataError::Comparator("unexpected compare".into()))
        };
        merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &failing).unwrap();

        assert_eq!(sorted_ints(&z0), low);
        assert_eq!(sorted_ints(&z1), high);
        assert_eq!((z0.rows(), z1.rows()), (low.len(), high.len()));
    }

    #[test]
    fn test_merged_inputs_are_consumed() {
        let mut x = sorted_chunk(4, 0, &[6, 2, 4]);
        let mut y = sorted_chunk(4, 1, &[5, 1]);
        let (mut z0, mut z1) = destinations(4);

        merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &int_comparator()).unwrap();

        for input in [&x, &y] {
            assert_eq!(input.rows(), 0);
            assert_eq!(input.status(), Status::Success);
            assert_eq!(input.sorted_ids().count(), 0);
            assert!(sorted_ints(input).is_empty());
            assert!(input.index().iter().all(|entry| *entry == SENTINEL));
            assert!(input.head().unwrap().is_none());
        }

        // a consumed input takes new rows
        ChunkLoader::new().load(&mut x, &int_batch(2, &[9, 8])).unwrap();
        sort_chunk(&mut x, &int_comparator()).unwrap();
        assert_eq!(sorted_ints(&x), vec![8, 9]);
    }

    #[test]
    fn test_ties_prefer_first_input() {
        let mut x = sorted_chunk(4, 0, &[2, 1, 1]);
        let mut y = sorted_chunk(4, 1, &[1, 2]);
        let (mut z0, mut z1) = destinations(4);

        merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &int_comparator()).unwrap();

        let batches = Vec::from_iter(z0.sorted_ids().chain(z1.sorted_ids()).map(|id| id >> 32));
        assert_eq!(sorted_ints(&z0), vec![1, 1, 1, 2]);
        assert_eq!(sorted_ints(&z1), vec![2]);
        assert_eq!(batches, vec![0, 0, 1, 0, 1]);
    }

    #[test]
    fn test_undersized_destinations() {
        let mut x = sorted_chunk(4, 0, &[3, 1, 2]);
        let mut y = sorted_chunk(4, 1, &[5, 4]);
        let x_index = x.index().to_vec();
        let (mut z0, mut z1) = destinations(2);

        let result = merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &int_comparator());

        assert!(matches!(result, Err(SortError::ContractViolation(_))));
        assert_eq!(x.index(), &x_index[..]);
        assert!(z0.is_empty() && z1.is_empty());
    }

    #[test]
    fn test_comparator_fault() {
        let mut x = sorted_chunk(4, 0, &[1, 2]);
        let mut y = sorted_chunk(4, 1, &[3]);
        let (mut z0, mut z1) = destinations(4);
        let failing = |_: &Record<'_>, _: &Record<'_>| -> Result<Ordering, DataError> {
            Err(DataError::Comparator("broken".into()))
        };

        let result = merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &failing);

        match result {
            Err(SortError::Fault { chunk, row, .. }) => {
                assert_eq!(chunk, x.id());
                assert_eq!(row, Some(1));
            }
            other => panic!("unexpected result {:?}", other),
        }
        for chunk in [&x, &y, &z0, &z1] {
            assert_eq!(chunk.status(), Status::Fault);
        }
        assert!(x.is_empty() && y.is_empty());
    }

    #[rstest]
    #[case(vec![1, 2], vec![3, 13], false, 1)]
    #[case(vec![13, 1], vec![2, 3], true, 0)]
    fn test_fault_charged_to_unreadable_row(
        #[case] x_values: Vec<i64>,
        #[case] y_values: Vec<i64>,
        #[case] in_x: bool,
        #[case] row: usize,
    ) {
        let mut x = sorted_chunk(4, 0, &x_values);
        let mut y = sorted_chunk(4, 1, &y_values);
        let (mut z0, mut z1) = destinations(4);
        let picky = |a: &Record<'_>, b: &Record<'_>| -> Result<Ordering, DataError> {
            if a.datum(0)? == Datum::Int64(13) || b.datum(0)? == Datum::Int64(13) {
                return Err(DataError::Comparator("unreadable".into()));
            }
            int_comparator()(a, b)
        };
        let expected = if in_x { x.id() } else { y.id() };

        match merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &picky) {
            Err(SortError::Fault { chunk, row: Some(faulted), .. }) => {
                assert_eq!(chunk, expected);
                assert_eq!(faulted, row);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_destination_side_budgets_checked_before_copy() {
        let schema = vec![ColumnType::VarLen];
        let inputs = ChunkBuilder::new(schema.clone(), 2).unwrap();
        let comparator = KeyComparator::new([SortKey::asc(0)]);
        let words = |batch_id: u32, words: &[&str]| {
            RowBatch::new(batch_id, 1, words.iter().map(|w| vec![Value::from(*w)]).collect())
        };

        let mut x = inputs.build();
        let mut y = inputs.build();
        ChunkLoader::new().load(&mut x, &words(0, &["fig", "apple"])).unwrap();
        ChunkLoader::new().load(&mut y, &words(1, &["watermelon", "kiwi"])).unwrap();
        sort_chunk(&mut x, &comparator).unwrap();
        sort_chunk(&mut y, &comparator).unwrap();
        let x_ids = Vec::from_iter(x.sorted_ids());
        let y_ids = Vec::from_iter(y.sorted_ids());

        // "apple" and "fig" fit into z0, "kiwi" and "watermelon" overflow z1
        let destinations = ChunkBuilder::new(schema, 2).unwrap().with_side_buffer_limit(8);
        let mut z0 = destinations.build();
        let mut z1 = destinations.build();
        z1.set_status(Status::NoSpace);

        let result = merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &comparator);

        assert!(matches!(result, Err(SortError::ContractViolation(_))));
        assert!(z0.is_empty() && z1.is_empty());
        assert!(z0.side().is_empty() && z1.side().is_empty());
        assert_eq!(z1.status(), Status::NoSpace);
        assert_eq!(Vec::from_iter(x.sorted_ids()), x_ids);
        assert_eq!(Vec::from_iter(y.sorted_ids()), y_ids);
        assert_eq!(x.status(), Status::Success);
    }

    #[test]
    fn test_merge_copies_payloads() {
        let schema = vec![ColumnType::VarLen, ColumnType::Float64];
        let builder = ChunkBuilder::new(schema, 4).unwrap();
        let comparator = KeyComparator::new([SortKey::asc(0)]);

        let mut words = Vec::from_iter(["pear", "apple", "fig", "kiwi", "banana", "cherry", "date"]);
        words.shuffle(&mut rand::thread_rng());
        let rows = Vec::from_iter(words.iter().map(|w| vec![Value::from(*w), Value::Float64(w.len() as f64)]));

        let mut x = builder.build();
        let mut y = builder.build();
        let outcome = ChunkLoader::new().load(&mut x, &RowBatch::new(0, 2, rows.clone())).unwrap();
        ChunkLoader::new()
            .load_from(&mut y, &RowBatch::new(0, 2, rows), outcome.consumed())
            .unwrap();
        sort_chunk(&mut x, &comparator).unwrap();
        sort_chunk(&mut y, &comparator).unwrap();

        let mut z0 = builder.build();
        let mut z1 = builder.build();
        merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &comparator).unwrap();

        let merged = Vec::from_iter(z0.sorted_records().chain(z1.sorted_records()).map(|record| {
            match (record.datum(0).unwrap(), record.datum(1).unwrap()) {
                (Datum::Bytes(word), Datum::Float64(len)) => {
                    assert_eq!(word.len() as f64, len);
                    String::from_utf8(word.to_vec()).unwrap()
                }
                other => panic!("unexpected data {:?}", other),
            }
        }));
        assert_eq!(
            merged,
            vec!["apple", "banana", "cherry", "date", "fig", "kiwi", "pear"]
        );
    }

    #[test]
    fn test_merge_mixed_capacities() {
        let mut x = int_chunk(16, &[2, 4]);
        sort_chunk(&mut x, &int_comparator()).unwrap();
        let mut y = sorted_chunk(2, 1, &[3, 1]);
        let (mut z0, mut z1) = destinations(3);

        merge_chunks(&mut x, &mut y, &mut z0, &mut z1, &int_comparator()).unwrap();

        assert_eq!(sorted_ints(&z0), vec![1, 2, 3]);
        assert_eq!(sorted_ints(&z1), vec![4]);
    }
}
