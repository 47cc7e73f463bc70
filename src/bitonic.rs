//! In-chunk bitonic sorter.
//!
//! Orders the permutation index of one resident chunk with a bitonic sorting network
//! over the padded, power-of-two index array. Each pass is a set of independent
//! compare-and-swap lanes, one per pair of index slots, and passes run strictly one
//! after another. Only index entries move, row data stays where the loader put it.
//!
//! Lanes share the chunk data, its side buffer and the comparator read-only; each
//! lane owns the two index slots it exchanges, which is what makes a pass
//! synchronization-free.

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::chunk::{ColumnChunk, Record, SENTINEL};
use crate::compare::{charges_right, Comparator, DataError};
use crate::sort::SortError;
use crate::status::Status;

/// One compare-and-swap pass of a bitonic network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    /// Size of the blocks the pass works in, a power of two.
    pub unit: usize,
    /// Mirror pass: slot `i` of a block is paired with slot `unit - 1 - i`.
    /// Otherwise slot `i` is paired with `i + unit / 2`.
    pub reversing: bool,
}

impl Pass {
    pub fn forward(unit: usize) -> Self {
        Pass {
            unit,
            reversing: false,
        }
    }

    pub fn reversing(unit: usize) -> Self {
        Pass { unit, reversing: true }
    }

    /// Encodes the pass as a launch parameter: log2 of the unit size, negative for reversing passes.
    pub fn encode(&self) -> i32 {
        let shift = self.unit.trailing_zeros() as i32;
        if self.reversing {
            -shift
        } else {
            shift
        }
    }

    pub fn decode(param: i32) -> Self {
        Pass {
            unit: 1 << param.unsigned_abs(),
            reversing: param < 0,
        }
    }

    /// Returns the pair of index slots handled by a lane.
    pub fn partner(&self, lane: usize) -> (usize, usize) {
        let half = self.unit / 2;
        let mask = self.unit - 1;

        let idx0 = (lane / half) * self.unit + lane % half;
        let idx1 = if self.reversing {
            (idx0 & !mask) | (!idx0 & mask)
        } else {
            idx0 + half
        };

        (idx0, idx1)
    }
}

/// Passes that sort an index array of `len` slots, `len` being a power of two.
/// There are `log2(len) * (log2(len) + 1) / 2` of them.
pub fn sort_schedule(len: usize) -> impl Iterator<Item = Pass> {
    let stages = len.max(1).trailing_zeros() as usize;

    (1..=stages).flat_map(|stage| {
        std::iter::once(Pass::reversing(1 << stage)).chain((1..stage).rev().map(|step| Pass::forward(1 << step)))
    })
}

/// Passes that merge two ascending halves of an index array of `len` slots.
pub fn merge_schedule(len: usize) -> impl Iterator<Item = Pass> {
    let stages = len.max(1).trailing_zeros() as usize;

    std::iter::once(len)
        .filter(|len| *len >= 2)
        .map(Pass::reversing)
        .chain((1..stages).rev().map(|step| Pass::forward(1 << step)))
}

/// Comparator failure inside a lane, charged to one of the two index entries.
#[derive(Debug)]
pub(crate) struct LaneFault {
    pub entry: u32,
    pub error: DataError,
}

/// Single lane: swaps the entries if `exchange` says they are out of order.
pub(crate) fn compare_exchange<F, E>(lo: &mut u32, hi: &mut u32, exchange: &F) -> Result<(), E>
where
    F: Fn(u32, u32) -> Result<bool, E>,
{
    if exchange(*lo, *hi)? {
        std::mem::swap(lo, hi);
    }
    Ok(())
}

/// Runs one pass over `index`. Lanes whose upper slot, as given by [`Pass::partner`],
/// is at or past `live` are no-ops.
pub(crate) fn run_pass<F, E>(index: &mut [u32], pass: Pass, live: usize, exchange: &F) -> Result<(), E>
where
    F: Fn(u32, u32) -> Result<bool, E> + Sync,
    E: Send,
{
    let unit = pass.unit;
    let half = unit / 2;

    log::trace!("running pass {:?} (live: {})", pass, live);

    index
        .par_chunks_mut(unit)
        .enumerate()
        .try_for_each(|(block, slots)| {
            let base = block * unit;
            if base + half >= live {
                return Ok(());
            }

            let first_lane = block * half;
            let exchange_lane = |lane: usize, a: &mut u32, b: &mut u32| {
                let (_, upper) = pass.partner(first_lane + lane);
                if upper < live {
                    compare_exchange(a, b, exchange)
                } else {
                    Ok(())
                }
            };

            let (lo, hi) = slots.split_at_mut(half);
            if pass.reversing {
                lo.par_iter_mut()
                    .zip(hi.par_iter_mut().rev())
                    .enumerate()
                    .try_for_each(|(lane, (a, b))| exchange_lane(lane, a, b))
            } else {
                lo.par_iter_mut()
                    .zip(hi.par_iter_mut())
                    .enumerate()
                    .try_for_each(|(lane, (a, b))| exchange_lane(lane, a, b))
            }
        })
}

/// Sorts the chunk's permutation index in place.
///
/// On success the index prefix `[0, rows)` is a permutation of the row slots ordered
/// by the comparator and the chunk status is [`Status::Success`]. A comparator fault
/// stops the remaining passes, flags the chunk with [`Status::Fault`] and must be
/// treated as a lost chunk.
pub fn sort_chunk<C>(chunk: &mut ColumnChunk, comparator: &C) -> Result<(), SortError>
where
    C: Comparator + ?Sized,
{
    let rows = chunk.rows();
    let id = chunk.id();

    let result = {
        let (store, side, index) = chunk.parts_mut();
        let exchange = |a: u32, b: u32| -> Result<bool, LaneFault> {
            if b == SENTINEL {
                return Ok(false);
            }
            if a == SENTINEL {
                return Ok(true);
            }
            let (left, right) = (Record::new(store, side, a as usize), Record::new(store, side, b as usize));
            let ordering = comparator.compare(&left, &right).map_err(|error| LaneFault {
                entry: if charges_right(comparator, &left, &right) { b } else { a },
                error,
            })?;
            Ok(ordering == Ordering::Greater)
        };

        sort_schedule(index.len()).try_for_each(|pass| run_pass(&mut index[..], pass, rows, &exchange))
    };

    if let Err(LaneFault { entry, error }) = result {
        log::debug!("sorting {} failed at row {}: {}", id, entry, error);
        chunk.set_status(Status::Fault);
        return Err(SortError::Fault {
            chunk: id,
            row: Some(entry as usize),
            error,
        });
    }

    chunk.set_status(Status::Success);
    log::debug!("sorted {} ({} rows)", id, rows);

    return Ok(());
}
