//! `window-sort` is a chunked, memory-bounded sort engine for columnar records.
//!
//! Records arrive in upstream batches and are loaded into fixed-capacity column chunks. Each chunk is
//! ordered in place by a data-parallel bitonic network that permutes a row index instead of moving rows.
//! Sorted chunks are then merged pairwise in tournament rounds, every merge using only its two inputs and
//! two destination chunks as working memory. At no point more than a fixed window of chunks takes part in
//! dispatched work, and idle chunks may be spilled to a temporary directory.
//!
//! # Overview
//!
//! `window-sort` supports the following features:
//!
//! * **Columnar records:**
//!   fixed-width integer and float columns plus variable-length columns whose payload lives in a per-chunk
//!   side buffer.
//! * **Pluggable ordering:**
//!   any [`Comparator`] implementation, plain closures included, or the multi-key [`KeyComparator`].
//! * **Backpressure:**
//!   a chunk that runs out of rows or payload bytes reports `NoSpace` and the sorter continues loading into a
//!   new chunk.
//! * **Column projection and junk rows:**
//!   the loader can take a subset of the batch columns, and rows a batch marks as junk are skipped.
//! * **Multithreading support:**
//!   lanes of every network pass run on a `rayon` thread pool.
//! * **Bounded residency:**
//!   a window of resident chunks limits concurrent merges; waiting chunks can be spilled to disk.
//!
//! # Example
//!
//! ```no_run
//! use std::path;
//!
//! use window_sort::{ChunkSorterBuilder, ColumnType, KeyComparator, RowBatch, SortKey, Value};
//!
//! fn main() {
//!     let sorter = ChunkSorterBuilder::new()
//!         .with_schema(vec![ColumnType::Int64, ColumnType::VarLen])
//!         .with_chunk_capacity(1024)
//!         .with_window(8)
//!         .with_tmp_dir(path::Path::new("./"))
//!         .build()
//!         .unwrap();
//!
//!     let batch = RowBatch::new(
//!         0,
//!         2,
//!         vec![
//!             vec![Value::from(3i64), Value::from("three")],
//!             vec![Value::from(1i64), Value::from("one")],
//!         ],
//!     );
//!     let comparator = KeyComparator::new([SortKey::asc(0)]);
//!
//!     let sorted = sorter.sort_by(vec![batch], &comparator).unwrap();
//!
//!     for chunk in sorted.into_chunks().unwrap() {
//!         for record in chunk.sorted_records() {
//!             println!("{:?}", record.datum(1).unwrap());
//!         }
//!     }
//! }
//! ```

pub mod bitonic;
pub mod buffer;
pub mod chunk;
pub mod compare;
pub mod loader;
pub mod merger;
pub mod sort;
pub mod spill;
pub mod status;
pub mod window;

#[cfg(test)]
mod testing;

pub use bitonic::sort_chunk;
pub use chunk::{ChunkBuilder, ChunkId, ColumnChunk, ColumnType, Datum, Record, Value};
pub use compare::{Comparator, DataError, KeyComparator, SortKey};
pub use loader::{BatchSource, ChunkLoader, ColumnBatch, LoadOutcome, RowBatch, MAX_BATCH_ROWS};
pub use merger::merge_chunks;
pub use sort::{ChunkSorter, ChunkSorterBuilder, MergeStats, SortError, SortedRun};
pub use status::Status;
