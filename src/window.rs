//! Residency window: the budget of chunks that may take part in dispatched operations at once.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sort::SortError;

/// Number of chunks a single merge step holds: two inputs and two destinations.
pub const CHUNKS_PER_MERGE: usize = 4;

/// Counts resident chunks and remembers the peak.
#[derive(Debug)]
pub struct Window {
    limit: usize,
    resident: AtomicUsize,
    peak: AtomicUsize,
}

impl Window {
    pub fn new(limit: usize) -> Self {
        Window {
            limit,
            resident: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn resident(&self) -> usize {
        self.resident.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Number of merge steps that fit into the window simultaneously.
    pub fn merge_slots(&self) -> usize {
        (self.limit / CHUNKS_PER_MERGE).max(1)
    }

    /// Makes `chunks` chunks resident until the lease is dropped.
    /// Going over the limit means the scheduler planned too much work and is a contract violation.
    pub fn lease(&self, chunks: usize) -> Result<WindowLease<'_>, SortError> {
        let limit = self.limit;
        let acquired = self
            .resident
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |resident| {
                (resident + chunks <= limit).then(|| resident + chunks)
            });

        match acquired {
            Ok(prev) => {
                self.peak.fetch_max(prev + chunks, Ordering::AcqRel);
                Ok(WindowLease { window: self, chunks })
            }
            Err(resident) => Err(SortError::ContractViolation(format!(
                "window of {} chunks exceeded ({} resident, {} requested)",
                limit, resident, chunks
            ))),
        }
    }
}

/// Chunks held resident in a [`Window`].
#[derive(Debug)]
pub struct WindowLease<'a> {
    window: &'a Window,
    chunks: usize,
}

impl<'a> Drop for WindowLease<'a> {
    fn drop(&mut self) {
        self.window.resident.fetch_sub(self.chunks, Ordering::AcqRel);
    }
}
