//! Readiness checking for candidate files.
//!
//! A file is only corrected once it has not been modified for a configurable
//! quiescence period, so files still being written by the instrument are left
//! alone until a later sweep.

use std::time::{Duration, SystemTime};

/// Result of a readiness check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The file has been quiet for at least the quiescence period.
    Ready,
    /// The file changed too recently.
    Settling {
        /// Time left until the file becomes ready, as of the check.
        remaining: Duration,
    },
}

/// True iff at least `quiescence` has elapsed between `modified` and `now`.
///
/// The boundary is inclusive. A modification time in the future is never ready.
#[inline]
pub fn is_quiescent(modified: SystemTime, now: SystemTime, quiescence: Duration) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age >= quiescence,
        Err(_) => false,
    }
}

/// Pure readiness decision, extracted for property testing.
pub fn readiness_at(modified: SystemTime, now: SystemTime, quiescence: Duration) -> Readiness {
    if is_quiescent(modified, now, quiescence) {
        return Readiness::Ready;
    }
    let remaining = match now.duration_since(modified) {
        Ok(age) => quiescence.saturating_sub(age),
        // Clock skew: the whole period plus the distance into the future
        Err(e) => quiescence.saturating_add(e.duration()),
    };
    Readiness::Settling { remaining }
}
