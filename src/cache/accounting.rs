//! Provides deterministic size estimation and budget tracking for the cache.
//!
//! The cache needs to know "how much room is this taking" for every entry it stores. We do not
//! ask the allocator for this, as such numbers are neither portable nor reproducible. Instead
//! each cached value implements [ByteEstimate] which derives an approximation from the payload
//! length plus a fixed per-value overhead. The estimate is not byte-accurate, but it is
//! **consistent**: the same logical content always yields the same number. This is the
//! property the accounting actually relies on, as every eviction must credit exactly what the
//! corresponding insertion charged - otherwise the occupancy counter would drift over time.

use bytes::Bytes;

/// Returns the estimated memory footprint in bytes.
pub trait ByteEstimate {
    /// Returns the approximate amount of memory occupied by this value.
    ///
    /// Note that most probably this is an approximation and not the exact byte value. However,
    /// it should represent the "largest" part of an instance and it must be stable: equal
    /// content yields equal estimates, independent of how the value was built.
    fn estimated_size(&self) -> usize;
}

impl ByteEstimate for str {
    fn estimated_size(&self) -> usize {
        self.len() + std::mem::size_of::<String>()
    }
}

impl ByteEstimate for String {
    fn estimated_size(&self) -> usize {
        self.as_str().estimated_size()
    }
}

impl ByteEstimate for Bytes {
    fn estimated_size(&self) -> usize {
        self.len() + std::mem::size_of::<Bytes>()
    }
}

/// Tracks the estimated cache occupancy against the configured memory budget.
///
/// The accountant itself is a passive counter: the cache orchestrator decides what to charge
/// and what to credit, the accountant only keeps the running total and answers how much head
/// room is left.
///
/// # Examples
/// ```
/// # use mercury::cache::accounting::SizeAccountant;
/// let mut accountant = SizeAccountant::new(1000);
/// assert_eq!(accountant.remaining(), 1000);
///
/// accountant.charge(400);
/// assert_eq!(accountant.occupancy(), 400);
/// assert_eq!(accountant.remaining(), 600);
///
/// accountant.credit(400);
/// assert_eq!(accountant.occupancy(), 0);
/// ```
pub struct SizeAccountant {
    budget: usize,
    occupancy: usize,
}

impl SizeAccountant {
    /// Creates a new accountant for the given budget in bytes.
    pub fn new(budget: usize) -> Self {
        SizeAccountant {
            budget,
            occupancy: 0,
        }
    }

    /// Returns the configured memory budget in bytes.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Returns the estimated number of bytes currently occupied by the cache.
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    /// Returns the remaining head room in bytes.
    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.occupancy)
    }

    /// Records that the given number of bytes has been added to the cache.
    pub fn charge(&mut self, bytes: usize) {
        self.occupancy += bytes;
    }

    /// Records that the given number of bytes has been removed from the cache.
    ///
    /// An attempt to credit more than is currently occupied indicates a bookkeeping defect
    /// upstream. We clamp to zero (so that subsequent operations remain sane) and report the
    /// incident to the caller.
    pub fn credit(&mut self, bytes: usize) -> bool {
        if bytes > self.occupancy {
            self.occupancy = 0;
            false
        } else {
            self.occupancy -= bytes;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::accounting::{ByteEstimate, SizeAccountant};
    use bytes::Bytes;

    #[test]
    fn estimates_are_consistent() {
        // Equal content yields equal estimates, independent of how the value was built...
        let direct = "hello world".to_owned();
        let mut assembled = String::with_capacity(1024);
        assembled.push_str("hello ");
        assembled.push_str("world");

        assert_eq!(direct.estimated_size(), assembled.estimated_size());
        assert_eq!(
            Bytes::from_static(b"payload").estimated_size(),
            Bytes::from(b"payload".to_vec()).estimated_size()
        );
    }

    #[test]
    fn estimates_are_monotone() {
        assert_eq!(
            "a".estimated_size() < "a very much longer string".estimated_size(),
            true
        );
        assert_eq!(
            Bytes::from_static(b"a").estimated_size()
                < Bytes::from_static(b"a longer payload").estimated_size(),
            true
        );
    }

    #[test]
    fn charges_and_credits_cancel_out() {
        let mut accountant = SizeAccountant::new(10_000);

        let sizes = ["foo".estimated_size(), "some longer entry".estimated_size()];
        for size in sizes {
            accountant.charge(size);
        }
        for size in sizes {
            assert_eq!(accountant.credit(size), true);
        }

        assert_eq!(accountant.occupancy(), 0);
        assert_eq!(accountant.remaining(), 10_000);
    }

    #[test]
    fn underflow_is_detected_and_clamped() {
        let mut accountant = SizeAccountant::new(100);
        accountant.charge(10);

        assert_eq!(accountant.credit(50), false);
        assert_eq!(accountant.occupancy(), 0);
    }
}
