//! Comparator contract.
//!
//! A comparator defines the total order of a sort job. It sees two records, each
//! addressed by its chunk, the chunk's side buffer and a row slot, and may fail
//! when the referenced data cannot be read. A failure aborts the job owning the
//! chunks being compared.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::chunk::{ColumnType, Datum, Record};

/// Data access failure raised while reading or comparing records.
#[derive(Debug, Clone, PartialEq)]
pub enum DataError {
    /// Column number is outside of the chunk schema.
    ColumnOutOfRange { column: usize, columns: usize },
    /// Row slot is outside of the chunk.
    RowOutOfRange { row: usize, rows: usize },
    /// Value type differs from the column type.
    TypeMismatch {
        column: usize,
        expected: ColumnType,
        found: &'static str,
    },
    /// Payload reference points outside of the side buffer.
    SideBufferOutOfRange { offset: usize, len: usize, size: usize },
    /// Payload does not fit into the side buffer.
    SideBufferFull { needed: usize, remaining: usize },
    /// Failure reported by a comparator implementation.
    Comparator(String),
}

impl Error for DataError {}

impl Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            DataError::ColumnOutOfRange { column, columns } => {
                write!(f, "column {} out of range (columns: {})", column, columns)
            }
            DataError::RowOutOfRange { row, rows } => write!(f, "row {} out of range (rows: {})", row, rows),
            DataError::TypeMismatch {
                column,
                expected,
                found,
            } => write!(f, "column {} expects {:?}, found {}", column, expected, found),
            DataError::SideBufferOutOfRange { offset, len, size } => write!(
                f,
                "side buffer reference {}+{} out of range (size: {})",
                offset, len, size
            ),
            DataError::SideBufferFull { needed, remaining } => {
                write!(f, "side buffer full (needed: {}, remaining: {})", needed, remaining)
            }
            DataError::Comparator(msg) => write!(f, "comparator failure: {}", msg),
        }
    }
}

/// Total order over records of a sort job.
///
/// Implementations must be pure: the same pair of records always yields the same
/// result, and a compare never mutates anything. Ties are allowed, the engine does
/// not promise stability beyond what the comparator encodes.
pub trait Comparator: Sync {
    fn compare(&self, a: &Record<'_>, b: &Record<'_>) -> Result<Ordering, DataError>;
}

impl<F> Comparator for F
where
    F: Fn(&Record<'_>, &Record<'_>) -> Result<Ordering, DataError> + Sync,
{
    fn compare(&self, a: &Record<'_>, b: &Record<'_>) -> Result<Ordering, DataError> {
        self(a, b)
    }
}

/// Tells which operand a failed comparison is charged to: `b` if it cannot be
/// compared with itself while `a` can, `a` otherwise.
pub(crate) fn charges_right<C>(comparator: &C, a: &Record<'_>, b: &Record<'_>) -> bool
where
    C: Comparator + ?Sized,
{
    comparator.compare(a, a).is_ok() && comparator.compare(b, b).is_err()
}

/// Single sort key of a [`KeyComparator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        SortKey {
            column,
            descending: false,
            nulls_first: false,
        }
    }

    pub fn desc(column: usize) -> Self {
        SortKey {
            column,
            descending: true,
            nulls_first: false,
        }
    }

    pub fn with_nulls_first(mut self) -> Self {
        self.nulls_first = true;
        return self;
    }
}

/// Lexicographic comparator over a list of column keys.
/// Floats are ordered by [`f64::total_cmp`], payloads bytewise.
#[derive(Debug, Clone)]
pub struct KeyComparator {
    keys: Vec<SortKey>,
}

impl KeyComparator {
    pub fn new(keys: impl IntoIterator<Item = SortKey>) -> Self {
        KeyComparator {
            keys: Vec::from_iter(keys),
        }
    }

    fn compare_key(key: &SortKey, a: Datum<'_>, b: Datum<'_>) -> Result<Ordering, DataError> {
        let nulls = if key.nulls_first {
            Ordering::Less
        } else {
            Ordering::Greater
        };

        let ordering = match (a, b) {
            (Datum::Null, Datum::Null) => return Ok(Ordering::Equal),
            (Datum::Null, _) => return Ok(nulls),
            (_, Datum::Null) => return Ok(nulls.reverse()),
            (Datum::Int64(a), Datum::Int64(b)) => a.cmp(&b),
            (Datum::Float64(a), Datum::Float64(b)) => a.total_cmp(&b),
            (Datum::Bytes(a), Datum::Bytes(b)) => a.cmp(b),
            (a, b) => {
                return Err(DataError::Comparator(format!(
                    "column {} holds incomparable values {} and {}",
                    key.column,
                    a.type_name(),
                    b.type_name()
                )))
            }
        };

        return Ok(if key.descending { ordering.reverse() } else { ordering });
    }
}

impl Comparator for KeyComparator {
    fn compare(&self, a: &Record<'_>, b: &Record<'_>) -> Result<Ordering, DataError> {
        for key in &self.keys {
            let ordering = Self::compare_key(key, a.datum(key.column)?, b.datum(key.column)?)?;
            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }

        return Ok(Ordering::Equal);
    }
}
