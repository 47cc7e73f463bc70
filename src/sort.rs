//! Chunk sorter.
//!
//! Drives a sort job from upstream batches to one globally ordered sequence of
//! chunks. Batches are loaded into fixed-capacity chunks, every chunk is ordered
//! by the in-chunk bitonic sorter, and the sorted chunks are merged pairwise in
//! tournament rounds. No more than a fixed window of chunks is resident in a
//! dispatched operation at any time.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::io;
use std::mem;
use std::path::Path;
use std::sync::atomic::{self, AtomicUsize};

use rayon::prelude::*;

use crate::bitonic::sort_chunk;
use crate::chunk::{ChunkBuilder, ChunkId, ColumnChunk, ColumnType, Record};
use crate::compare::{charges_right, Comparator, DataError};
use crate::loader::{BatchSource, ChunkLoader};
use crate::merger::merge_chunks;
use crate::spill::SpilledChunk;
use crate::window::{Window, CHUNKS_PER_MERGE};

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Comparator or data access failure. Aborts the sort job owning the chunk.
    /// `row` is the row slot of the record the failure is charged to, when known.
    Fault {
        chunk: ChunkId,
        row: Option<usize>,
        error: DataError,
    },
    /// Caller or scheduler defect, such as mis-sized merge destinations.
    ContractViolation(String),
    /// Spill directory or file creation error.
    TempDir(io::Error),
    /// Lane thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Spilled chunk serialization error.
    SerializationError(rmp_serde::encode::Error),
    /// Spilled chunk deserialization error.
    DeserializationError(rmp_serde::decode::Error),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::Fault { error, .. } => Some(error),
            SortError::ContractViolation(_) => None,
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::SerializationError(err) => Some(err),
            SortError::DeserializationError(err) => Some(err),
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Fault {
                chunk,
                row: Some(row),
                error,
            } => write!(f, "{} faulted at row {}: {}", chunk, row, error),
            SortError::Fault { chunk, row: None, error } => write!(f, "{} faulted: {}", chunk, error),
            SortError::ContractViolation(msg) => write!(f, "contract violation: {}", msg),
            SortError::TempDir(err) => write!(f, "spill directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::SerializationError(err) => write!(f, "chunk serialization error: {}", err),
            SortError::DeserializationError(err) => write!(f, "chunk deserialization error: {}", err),
        }
    }
}

/// Chunk sorter builder. Provides methods for [`ChunkSorter`] initialization.
#[derive(Debug, Clone)]
pub struct ChunkSorterBuilder {
    /// Number of threads running the lanes of a pass.
    threads_number: Option<usize>,
    /// Directory to spill idle chunks to. Chunks stay in memory if not set.
    tmp_dir: Option<Box<Path>>,
    /// Spill file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Column types of the sorted records.
    schema: Vec<ColumnType>,
    /// Rows per chunk.
    chunk_capacity: usize,
    /// Variable-length payload bytes per loaded chunk.
    side_buffer_capacity: usize,
    /// Maximum number of resident chunks.
    window: usize,
    /// Batch columns loaded into the chunk columns.
    projection: Option<Vec<usize>>,
}

impl ChunkSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ChunkSorterBuilder::default()
    }

    /// Builds a [`ChunkSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ChunkSorter, SortError> {
        let chunk_builder = ChunkBuilder::new(self.schema, self.chunk_capacity)?
            .with_side_buffer_limit(self.side_buffer_capacity);
        let loader = match self.projection {
            Some(columns) => ChunkLoader::new().with_projection(columns),
            None => ChunkLoader::new(),
        };

        ChunkSorter::new(
            self.threads_number,
            self.tmp_dir.as_deref(),
            chunk_builder,
            loader,
            self.window,
            self.rw_buf_size,
        )
    }

    /// Sets number of threads running the lanes of a pass.
    pub fn with_threads_number(mut self, threads_number: usize) -> ChunkSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to spill chunks waiting for a merge.
    pub fn with_tmp_dir(mut self, path: &Path) -> ChunkSorterBuilder {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets spill file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ChunkSorterBuilder {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets record column types.
    pub fn with_schema(mut self, schema: Vec<ColumnType>) -> ChunkSorterBuilder {
        self.schema = schema;
        return self;
    }

    /// Sets number of rows per chunk.
    pub fn with_chunk_capacity(mut self, capacity: usize) -> ChunkSorterBuilder {
        self.chunk_capacity = capacity;
        return self;
    }

    /// Sets variable-length payload bytes per loaded chunk.
    pub fn with_side_buffer_capacity(mut self, bytes: usize) -> ChunkSorterBuilder {
        self.side_buffer_capacity = bytes;
        return self;
    }

    /// Sets the maximum number of chunks resident at once.
    pub fn with_window(mut self, window: usize) -> ChunkSorterBuilder {
        self.window = window;
        return self;
    }

    /// Loads only the given batch columns, one per schema column and in schema order.
    pub fn with_projection(mut self, columns: Vec<usize>) -> ChunkSorterBuilder {
        self.projection = Some(columns);
        return self;
    }
}

impl Default for ChunkSorterBuilder {
    fn default() -> Self {
        ChunkSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            schema: Vec::new(),
            chunk_capacity: 1 << 16,
            side_buffer_capacity: usize::MAX,
            window: CHUNKS_PER_MERGE,
            projection: None,
        }
    }
}

/// Merge statistics of a sort job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Number of non-empty sorted chunks the merge started from.
    pub chunks: usize,
    /// Number of tournament rounds.
    pub rounds: usize,
    /// Number of pairwise chunk merges.
    pub merges: usize,
    /// Largest number of chunks resident at once.
    pub peak_resident: usize,
}

enum Residency {
    Resident(ColumnChunk),
    Spilled(SpilledChunk),
}

/// Sorted chunk owned by a sort job, either in memory or spilled.
pub struct ChunkHandle {
    /// Copy of the first record of a spilled chunk.
    head: Option<ColumnChunk>,
    residency: Residency,
}

impl ChunkHandle {
    pub fn rows(&self) -> usize {
        match &self.residency {
            Residency::Resident(chunk) => chunk.rows(),
            Residency::Spilled(spilled) => spilled.rows(),
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.residency, Residency::Spilled(_))
    }

    /// First record in sorted order.
    fn first(&self) -> Option<Record<'_>> {
        match (&self.residency, &self.head) {
            (Residency::Resident(chunk), _) => chunk.sorted_records().next(),
            (Residency::Spilled(_), Some(head)) => head.sorted_records().next(),
            (Residency::Spilled(_), None) => None,
        }
    }

    fn load(self) -> Result<ColumnChunk, SortError> {
        match self.residency {
            Residency::Resident(chunk) => Ok(chunk),
            Residency::Spilled(spilled) => spilled.restore(),
        }
    }

    fn visit<R>(&self, f: impl FnOnce(&ColumnChunk) -> R) -> Result<R, SortError> {
        match &self.residency {
            Residency::Resident(chunk) => Ok(f(chunk)),
            Residency::Spilled(spilled) => Ok(f(&spilled.restore()?)),
        }
    }
}

impl Debug for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("rows", &self.rows())
            .field("spilled", &self.is_spilled())
            .finish()
    }
}

/// Globally sorted result: chunks in order, each one sorted by its index.
#[derive(Debug)]
pub struct SortedRun {
    chunks: Vec<ChunkHandle>,
    stats: MergeStats,
}

impl SortedRun {
    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    pub fn rows(&self) -> usize {
        self.chunks.iter().map(ChunkHandle::rows).sum()
    }

    pub fn chunks(&self) -> &[ChunkHandle] {
        &self.chunks
    }

    /// Returns the chunks in order, restoring spilled ones.
    pub fn into_chunks(self) -> Result<Vec<ColumnChunk>, SortError> {
        self.stream().collect()
    }

    /// Returns an iterator over the chunks in order. Spilled chunks are restored one at a time.
    pub fn stream(self) -> impl Iterator<Item = Result<ColumnChunk, SortError>> {
        self.chunks.into_iter().map(ChunkHandle::load)
    }

    /// Returns row identifiers in global sorted order.
    pub fn ids(&self) -> Result<Vec<u64>, SortError> {
        let mut ids = Vec::with_capacity(self.rows());
        for handle in &self.chunks {
            handle.visit(|chunk| ids.extend(chunk.sorted_ids()))?;
        }

        return Ok(ids);
    }
}

/// Chunk sorter.
pub struct ChunkSorter {
    /// Lane thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to spill idle chunks to.
    tmp_dir: Option<tempfile::TempDir>,
    /// Spill file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Builder of loaded chunks and merge destinations.
    chunk_builder: ChunkBuilder,
    /// Maximum number of resident chunks per job.
    window: usize,
    /// Moves batch rows into chunks.
    loader: ChunkLoader,
}

impl ChunkSorter {
    /// Creates a new chunk sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Directory to spill chunks to while they wait for a merge. If the parameter is [`None`]
    ///   chunks stay in memory.
    /// * `chunk_builder` - Builder of the chunks batches are loaded into.
    /// * `loader` - Batch loader, possibly restricted to a column projection that matches the chunk schema.
    /// * `window` - Maximum number of chunks resident at once, at least four.
    /// * `rw_buf_size` - Spill file read/write buffer size.
    pub fn new(
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        chunk_builder: ChunkBuilder,
        loader: ChunkLoader,
        window: usize,
        rw_buf_size: Option<usize>,
    ) -> Result<Self, SortError> {
        if window < CHUNKS_PER_MERGE {
            return Err(SortError::ContractViolation(format!(
                "window must hold at least {} chunks (got {})",
                CHUNKS_PER_MERGE, window
            )));
        }
        if let Some(projection) = loader.projection() {
            if projection.len() != chunk_builder.schema().len() {
                return Err(SortError::ContractViolation(format!(
                    "projection selects {} columns, schema has {}",
                    projection.len(),
                    chunk_builder.schema().len()
                )));
            }
        }

        return Ok(ChunkSorter {
            rw_buf_size,
            chunk_builder,
            window,
            loader,
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: Self::init_tmp_directory(tmp_path)?,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing lane thread pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing lane thread pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<Option<tempfile::TempDir>, SortError> {
        let tmp_path = match tmp_path {
            Some(tmp_path) => tmp_path,
            None => {
                log::info!("chunk spilling disabled");
                return Ok(None);
            }
        };

        let tmp_dir = tempfile::tempdir_in(tmp_path).map_err(|err| SortError::TempDir(err))?;
        log::info!("spilling chunks to {}", tmp_dir.path().display());

        return Ok(Some(tmp_dir));
    }

    pub fn chunk_builder(&self) -> &ChunkBuilder {
        &self.chunk_builder
    }

    /// Sorts the rows of the input batches.
    ///
    /// # Arguments
    /// * `batches` - Upstream batches, each with a distinct batch id
    /// * `comparator` - Total order of the records
    pub fn sort_by<I, B, C>(&self, batches: I, comparator: &C) -> Result<SortedRun, SortError>
    where
        I: IntoIterator<Item = B>,
        B: BatchSource,
        C: Comparator + ?Sized,
    {
        let job = SortJob::new(self, comparator);
        let mut sorted = Vec::new();
        let mut chunk = self.chunk_builder.build();

        for batch in batches.into_iter() {
            let mut offset = 0;
            loop {
                let outcome = self.loader.load_from(&mut chunk, &batch, offset)?;
                offset += outcome.consumed();
                if outcome.status.is_success() {
                    break;
                }

                if chunk.is_empty() {
                    return Err(SortError::ContractViolation(format!(
                        "row {} of batch {} does not fit into an empty chunk",
                        offset,
                        batch.batch_id()
                    )));
                }
                let full = mem::replace(&mut chunk, self.chunk_builder.build());
                sorted.push(job.seal(full)?);
            }
        }

        if !chunk.is_empty() {
            sorted.push(job.seal(chunk)?);
        }

        log::debug!("chunk sort phase done ({} chunks)", sorted.len());

        return job.merge(sorted);
    }

    /// Merges chunks that are already sorted into one global order.
    ///
    /// # Arguments
    /// * `chunks` - Sorted chunks of this sorter's schema, none holding more rows than the chunk capacity
    /// * `comparator` - Total order the chunks are sorted by
    pub fn merge_by<C>(&self, chunks: Vec<ColumnChunk>, comparator: &C) -> Result<SortedRun, SortError>
    where
        C: Comparator + ?Sized,
    {
        let job = SortJob::new(self, comparator);

        let mut sorted = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.schema() != self.chunk_builder.schema() || chunk.rows() > self.chunk_builder.capacity() {
                return Err(SortError::ContractViolation(format!(
                    "{} does not match the sorter chunk layout",
                    chunk.id()
                )));
            }
            if chunk.status().is_fault() {
                return Err(SortError::ContractViolation(format!("{} is faulted", chunk.id())));
            }
            sorted.push(job.park(chunk)?);
        }

        return job.merge(sorted);
    }
}

/// State of a single sort job. A fault aborts the job without touching other jobs.
struct SortJob<'s, C: ?Sized> {
    sorter: &'s ChunkSorter,
    comparator: &'s C,
    window: Window,
    merges: AtomicUsize,
}

impl<'s, C> SortJob<'s, C>
where
    C: Comparator + ?Sized,
{
    fn new(sorter: &'s ChunkSorter, comparator: &'s C) -> Self {
        SortJob {
            sorter,
            comparator,
            window: Window::new(sorter.window),
            merges: AtomicUsize::new(0),
        }
    }

    /// Sorts a loaded chunk and parks it.
    fn seal(&self, mut chunk: ColumnChunk) -> Result<ChunkHandle, SortError> {
        {
            let _lease = self.window.lease(1)?;
            self.sorter
                .thread_pool
                .install(|| sort_chunk(&mut chunk, self.comparator))?;
        }

        self.park(chunk)
    }

    /// Wraps a sorted chunk into a handle, spilling it if a temporary directory is configured.
    fn park(&self, chunk: ColumnChunk) -> Result<ChunkHandle, SortError> {
        let tmp_dir = match &self.sorter.tmp_dir {
            Some(tmp_dir) => tmp_dir,
            None => {
                return Ok(ChunkHandle {
                    head: None,
                    residency: Residency::Resident(chunk),
                })
            }
        };

        let head = chunk.head().map_err(|error| SortError::Fault {
            chunk: chunk.id(),
            row: None,
            error,
        })?;
        let spilled = SpilledChunk::spill(tmp_dir, chunk, self.sorter.rw_buf_size)?;

        return Ok(ChunkHandle {
            head,
            residency: Residency::Spilled(spilled),
        });
    }

    /// Merges sorted chunks in tournament rounds until a single run is left.
    fn merge(self, chunks: Vec<ChunkHandle>) -> Result<SortedRun, SortError> {
        let mut runs = Vec::from_iter(chunks.into_iter().filter(|chunk| chunk.rows() > 0).map(|chunk| vec![chunk]));
        let mut stats = MergeStats {
            chunks: runs.len(),
            ..MergeStats::default()
        };

        while runs.len() > 1 {
            stats.rounds += 1;

            let mut pending = runs.into_iter();
            let mut pairs = Vec::new();
            let mut leftover = None;
            while let Some(first) = pending.next() {
                match pending.next() {
                    Some(second) => pairs.push((first, second)),
                    None => leftover = Some(first),
                }
            }

            let mut merged = Vec::with_capacity(pairs.len() + 1);
            let slots = self.window.merge_slots();
            while !pairs.is_empty() {
                let dispatched = Vec::from_iter(pairs.drain(..slots.min(pairs.len())));
                let outputs = self.sorter.thread_pool.install(|| {
                    dispatched
                        .into_par_iter()
                        .map(|(x, y)| self.merge_runs(x, y))
                        .collect::<Result<Vec<_>, _>>()
                })?;
                merged.extend(outputs);
            }
            // an unmatched run is already sorted and waits for the next round
            merged.extend(leftover);

            log::debug!(
                "merge round {} done ({} runs left, {} of {} chunks resident at peak)",
                stats.rounds,
                merged.len(),
                self.window.peak(),
                self.window.limit()
            );
            runs = merged;
        }

        stats.merges = self.merges.load(atomic::Ordering::Acquire);
        stats.peak_resident = self.window.peak();

        let chunks = runs.pop().unwrap_or_default();
        let result = SortedRun { chunks, stats };

        log::info!(
            "sorted {} rows ({} chunks, {} rounds, {} merges)",
            result.rows(),
            stats.chunks,
            stats.rounds,
            stats.merges
        );

        return Ok(result);
    }

    /// Merges two sorted runs of chunks.
    ///
    /// Chunks of both runs are visited in order of their first record and folded into a
    /// carry: each step merges the carry with the next chunk, emits the low destination
    /// once it is full and keeps the rest as the new carry. Every chunk of a run except
    /// the last one is full, which guarantees that an emitted chunk never holds a row
    /// greater than a row still to be visited.
    fn merge_runs(&self, x: Vec<ChunkHandle>, y: Vec<ChunkHandle>) -> Result<Vec<ChunkHandle>, SortError> {
        let mut order = self.plan(x, y)?.into_iter();
        let mut carry = match order.next() {
            Some(first) => first.load()?,
            None => return Ok(Vec::new()),
        };

        let capacity = self.sorter.chunk_builder.capacity();
        let mut output = Vec::new();
        for next in order {
            let _lease = self.window.lease(CHUNKS_PER_MERGE)?;
            let mut next = next.load()?;
            let mut low = self.sorter.chunk_builder.build_destination();
            let mut high = self.sorter.chunk_builder.build_destination();

            merge_chunks(&mut carry, &mut next, &mut low, &mut high, self.comparator)?;
            self.merges.fetch_add(1, atomic::Ordering::AcqRel);

            if low.rows() == capacity {
                output.push(self.park(low)?);
                carry = high;
            } else {
                carry = low;
            }
        }

        if !carry.is_empty() {
            output.push(self.park(carry)?);
        }

        return Ok(output);
    }

    /// Orders the chunks of two runs by their first record, `x` first on ties.
    fn plan(&self, x: Vec<ChunkHandle>, y: Vec<ChunkHandle>) -> Result<Vec<ChunkHandle>, SortError> {
        let mut order = Vec::with_capacity(x.len() + y.len());
        let mut x = x.into_iter().peekable();
        let mut y = y.into_iter().peekable();

        loop {
            let take_y = match (x.peek(), y.peek()) {
                (Some(a), Some(b)) => self.compare_heads(a, b)? == Ordering::Greater,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (None, None) => break,
            };

            let next = if take_y { y.next() } else { x.next() };
            order.extend(next);
        }

        return Ok(order);
    }

    fn compare_heads(&self, a: &ChunkHandle, b: &ChunkHandle) -> Result<Ordering, SortError> {
        match (a.first(), b.first()) {
            (Some(first_a), Some(first_b)) => self.comparator.compare(&first_a, &first_b).map_err(|error| {
                let (handle, record) = if charges_right(self.comparator, &first_a, &first_b) {
                    (b, first_b)
                } else {
                    (a, first_a)
                };
                SortError::Fault {
                    chunk: Self::handle_id(handle),
                    // a spilled head is a copy, its row slot says nothing about the chunk
                    row: if handle.is_spilled() { None } else { Some(record.row()) },
                    error,
                }
            }),
            // empty chunks never reach a merge
            _ => Ok(Ordering::Equal),
        }
    }

    fn handle_id(handle: &ChunkHandle) -> ChunkId {
        match &handle.residency {
            Residency::Resident(chunk) => chunk.id(),
            Residency::Spilled(spilled) => spilled.descriptor().chunk_id,
        }
    }
}
