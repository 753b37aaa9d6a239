//! Atomic Updater Module
//!
//! In-place numeric mutation of a stored value. The set of operations is
//! closed; each one runs against the resident `i64` while the caller holds
//! the shard's write lock, so no reader ever sees a half-applied update.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{CacheError, Result};

/// An in-place update of a stored integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    /// Add `step`, wrapping on overflow
    Increment(i64),
    /// Subtract `step`, wrapping on overflow
    Decrement(i64),
    /// Replace `expected` with `new`
    CompareAndSwap { expected: i64, new: i64 },
}

impl UpdateOp {
    /// Applies the operation to `cell` and returns the stored result.
    ///
    /// A compare-and-swap whose expectation does not hold leaves the cell
    /// untouched and reports a type mismatch for `key`.
    pub(crate) fn apply(&self, key: &str, cell: &AtomicI64) -> Result<i64> {
        match *self {
            UpdateOp::Increment(step) => {
                Ok(cell.fetch_add(step, Ordering::SeqCst).wrapping_add(step))
            }
            UpdateOp::Decrement(step) => {
                Ok(cell.fetch_sub(step, Ordering::SeqCst).wrapping_sub(step))
            }
            UpdateOp::CompareAndSwap { expected, new } => cell
                .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
                .map(|_| new)
                .map_err(|found| {
                    CacheError::TypeMismatch(format!(
                        "{}: expected {} but found {}",
                        key, expected, found
                    ))
                }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UpdateOp::Increment(_) => "inc",
            UpdateOp::Decrement(_) => "dec",
            UpdateOp::CompareAndSwap { .. } => "cas",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_decrement() {
        let cell = AtomicI64::new(10);
        assert_eq!(UpdateOp::Increment(5).apply("k", &cell).unwrap(), 15);
        assert_eq!(UpdateOp::Decrement(20).apply("k", &cell).unwrap(), -5);
        assert_eq!(cell.load(Ordering::SeqCst), -5);
    }

    #[test]
    fn test_increment_wraps() {
        let cell = AtomicI64::new(i64::MAX);
        assert_eq!(UpdateOp::Increment(1).apply("k", &cell).unwrap(), i64::MIN);
    }

    #[test]
    fn test_cas_only_swaps_on_match() {
        let cell = AtomicI64::new(3);
        let miss = UpdateOp::CompareAndSwap { expected: 4, new: 9 };
        assert!(matches!(miss.apply("k", &cell), Err(CacheError::TypeMismatch(_))));
        assert_eq!(cell.load(Ordering::SeqCst), 3);

        let hit = UpdateOp::CompareAndSwap { expected: 3, new: 9 };
        assert_eq!(hit.apply("k", &cell).unwrap(), 9);
        assert_eq!(cell.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_names() {
        assert_eq!(UpdateOp::Increment(1).name(), "inc");
        assert_eq!(UpdateOp::CompareAndSwap { expected: 1, new: 2 }.name(), "cas");
    }
}
