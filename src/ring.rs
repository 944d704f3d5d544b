// SPDX-License-Identifier: MIT

//! A thin wrapper around an `io_uring` instance built with `IORING_SETUP_SQE128`
//! and `IORING_SETUP_CQE32`, the ring shape both the control path and the queue
//! I/O path require for `URING_CMD`.
//!
//! Grounded on `control::UblkCtrl::new`'s `IoUring::generic_builder().build(32)`
//! construction and `control::sys::CtrlCmd::submit_and_wait`'s submit-then-drain
//! sequencing, generalised into a standalone type the queue runner can reuse
//! without duplicating the submit/wait/drain bookkeeping.

use crate::error::RingError;
use io_uring::{cqueue, squeue, IoUring};
use std::os::unix::io::RawFd;

/// An `io_uring` instance shaped for ublk's `URING_CMD` traffic: 128-byte SQEs
/// (room for the 80-byte control cmd payload or a queue's fetch/commit cmd),
/// 32-byte CQEs (room for the extra result word ublk's CQEs carry).
pub struct Ring {
    io_uring: IoUring<squeue::Entry128, cqueue::Entry32>,
}

impl Ring {
    /// Creates a ring with room for `entries` in-flight submissions.
    ///
    /// `entries` must be a nonzero power of two; the kernel itself enforces
    /// this, but rejecting it here turns a confusing `EINVAL` from the kernel
    /// into an explicit [`RingError::InvalidArgument`] before any syscall runs.
    pub fn create(entries: u32) -> Result<Self, RingError> {
        if entries == 0 || !entries.is_power_of_two() {
            return Err(RingError::InvalidArgument);
        }

        let io_uring = IoUring::generic_builder()
            .build(entries)
            .map_err(RingError::from_setup_errno)?;

        Ok(Self { io_uring })
    }

    /// Registers a fixed file table so submitted entries can reference file
    /// descriptors by index (`Fixed(i)`) instead of paying the fd-lookup cost
    /// on every `URING_CMD`.
    pub fn register_files(&self, fds: &[RawFd]) -> Result<(), RingError> {
        self.io_uring
            .submitter()
            .register_files(fds)
            .map_err(RingError::from_setup_errno)
    }

    /// Pushes one entry onto the local submission queue without entering the
    /// kernel.
    ///
    /// # Safety
    ///
    /// The caller must ensure any buffer the entry references remains valid
    /// until the corresponding completion is observed.
    pub unsafe fn push(&mut self, entry: &squeue::Entry128) -> Result<(), RingError> {
        self.io_uring.submission().push(entry).map_err(RingError::from)
    }

    /// Submits every pending entry without waiting for completions.
    pub fn submit(&self) -> Result<usize, RingError> {
        self.io_uring.submit().map_err(RingError::from_enter_errno)
    }

    /// Submits every pending entry and blocks until at least `want`
    /// completions are available.
    pub fn submit_and_wait(&self, want: usize) -> Result<usize, RingError> {
        self.io_uring
            .submit_and_wait(want)
            .map_err(RingError::from_enter_errno)
    }

    /// Copies up to `max` currently available completions into `out`,
    /// returning how many were copied.
    ///
    /// Only the entries actually consumed advance the ring's shared head;
    /// anything beyond `max` stays queued in the kernel's completion ring for
    /// a later call, matching the ring's "copy up to `min(len(out), tail -
    /// head)`" contract rather than draining everything unconditionally.
    pub fn copy_cqes(&mut self, out: &mut Vec<cqueue::Entry32>, max: usize) -> usize {
        let mut cq = self.io_uring.completion();
        cq.sync();
        let before = out.len();
        out.extend(cq.by_ref().take(max));
        out.len() - before
    }

    /// Number of completions currently available without entering the kernel.
    ///
    /// Matches the ring's own wrap-safe `tail.wrapping_sub(head)` convention:
    /// the counters are free-running `u32`s that wrap rather than reset, so a
    /// plain subtraction would misreport the count once either counter wraps
    /// past `u32::MAX`.
    #[must_use]
    pub fn cq_ready(&self) -> u32 {
        self.io_uring.completion().len() as u32
    }

    /// Raw file descriptor backing this ring, for registration with another
    /// ring or for diagnostics.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.io_uring.as_raw_fd()
    }
}

/// Wrap-safe distance between a ring's tail and head counters, exposed
/// separately from [`Ring::cq_ready`] so it can be exercised without a real
/// kernel ring.
#[must_use]
pub(crate) const fn wrapping_distance(tail: u32, head: u32) -> u32 {
    tail.wrapping_sub(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_distance_handles_the_ordinary_case() {
        assert_eq!(wrapping_distance(10, 3), 7);
        assert_eq!(wrapping_distance(5, 5), 0);
    }

    #[test]
    fn wrapping_distance_handles_counter_wraparound() {
        // tail has wrapped past u32::MAX while head has not yet caught up.
        assert_eq!(wrapping_distance(2, u32::MAX - 2), 5);
        assert_eq!(wrapping_distance(0, u32::MAX), 1);
    }

    #[test]
    fn create_rejects_non_power_of_two_entries() {
        assert!(matches!(Ring::create(0), Err(RingError::InvalidArgument)));
        assert!(matches!(Ring::create(3), Err(RingError::InvalidArgument)));
        assert!(matches!(Ring::create(17), Err(RingError::InvalidArgument)));
    }
}
