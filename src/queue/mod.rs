// SPDX-License-Identifier: MIT

//! The per-queue FETCH/COMMIT I/O runner.
//!
//! Grounded on `csweichel-libublk-rs`'s `UblkQueue` (mmap sizing via
//! `cmd_buf_sz`/`round_up`, `ublk_alloc_buf`, `build_user_data`/
//! `user_data_to_tag`, `submit_fetch_commands`, `handle_cqe`/`complete_io`),
//! adapted from its default-size ring and free-form `dyn UblkQueueImpl` to
//! this crate's SQE128/CQE32 [`crate::ring::Ring`] and generic
//! [`crate::backend::Backend`].

mod sys;

use crate::backend::Backend;
use crate::error::QueueError;
use crate::ring::Ring;
use crate::uapi::{decode_op_flags, IoOp};
use io_uring::opcode::UringCmd80;
use io_uring::types::Fixed;
use io_uring::{cqueue, squeue};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use sys::Descriptor;

/// Maximum number of completions drained from the ring per
/// [`Queue::process_completions`] call, matching the reference queue
/// runner's batch size.
const MAX_COMPLETIONS_PER_BATCH: usize = 64;

/// High bit of `user_data`: set for a COMMIT_AND_FETCH_REQ completion, clear
/// for a FETCH_REQ completion.
const USER_DATA_COMMIT_BIT: u64 = 1 << 63;

fn encode_user_data(q_id: u16, tag: u16, is_commit: bool) -> u64 {
    let base = u64::from(tag) | (u64::from(q_id) << 16);
    if is_commit {
        base | USER_DATA_COMMIT_BIT
    } else {
        base
    }
}

fn decode_user_data(user_data: u64) -> (u16, u16) {
    let tag = (user_data & 0xFFFF) as u16;
    let q_id = ((user_data >> 16) & 0xFFFF) as u16;
    (q_id, tag)
}

fn round_up(val: u32, rnd: u32) -> u32 {
    (val + rnd - 1) & !(rnd - 1)
}

fn page_size() -> u32 {
    // SAFETY: `_SC_PAGESIZE` is always a supported sysconf name.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u32 }
}

/// State of one tag within a [`Queue`]. Read and written only by the queue's
/// owning thread — no synchronization needed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TagState {
    /// A FETCH_REQ is outstanding; no request has arrived for this tag yet.
    InFlightFetch,
    /// A descriptor arrived; the backend is running or about to run.
    Owned,
    /// A COMMIT_AND_FETCH_REQ is outstanding; the kernel has not yet
    /// acknowledged the reported result.
    InFlightCommit,
    /// The kernel reported a negative result for this tag's outstanding
    /// command (e.g. `UBLK_IO_RES_ABORT` on shutdown); the backend was not
    /// invoked and no further command is outstanding for the tag.
    Errored,
}

/// An anonymous, page-aligned read/write mapping owning `len` bytes.
struct AnonMap {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is exclusively owned by the `Queue` that holds it, and
// `Queue` itself requires `B: Send + Sync` to be `Send`.
unsafe impl Send for AnonMap {}

impl AnonMap {
    fn new(len: usize) -> Result<Self, QueueError> {
        // SAFETY: `len` is nonzero-checked by the caller's sizing; flags
        // request an anonymous, process-private mapping with no backing fd.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(QueueError::Mmap(std::io::Error::last_os_error()));
        }
        Ok(Self { ptr: ptr.cast(), len })
    }
}

impl Drop for AnonMap {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe exactly the region `mmap` returned.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// A read-only mapping of the character device's descriptor region.
struct DescriptorMap {
    ptr: *const u8,
    len: usize,
}

// SAFETY: same reasoning as `AnonMap`; exclusively owned by its `Queue`.
unsafe impl Send for DescriptorMap {}

impl DescriptorMap {
    fn new(fd: &File, offset: i64, len: usize) -> Result<Self, QueueError> {
        // SAFETY: `fd` is a valid, open character device file descriptor for
        // the duration of this call.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(QueueError::Mmap(std::io::Error::last_os_error()));
        }
        Ok(Self { ptr: ptr.cast(), len })
    }

    /// # Safety
    ///
    /// `tag` must be `< depth`, matching the size this map was created with.
    unsafe fn descriptor_at(&self, tag: u16) -> *const Descriptor {
        // SAFETY: forwarded from the caller's contract; `self.ptr` is valid
        // for `len` bytes, which covers `depth` descriptors.
        unsafe { self.ptr.cast::<Descriptor>().add(tag as usize) }
    }
}

impl Drop for DescriptorMap {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe exactly the region `mmap` returned.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// One hardware queue's I/O runner: owns `/dev/ublkcN`'s fd, its own
/// SQE128/CQE32 ring, its descriptor and buffer mmaps, and the per-tag state
/// array.
pub struct Queue<B: Backend> {
    q_id: u16,
    depth: u16,
    per_tag_bytes: u32,
    ring: Ring,
    _cdev: File,
    descriptors: DescriptorMap,
    buffers: AnonMap,
    tag_states: Vec<TagState>,
    backend: Arc<B>,
    stop: Arc<AtomicBool>,
}

impl<B: Backend> Queue<B> {
    fn cmd_buf_sz(depth: u16) -> u32 {
        round_up(u32::from(depth) * 24, page_size())
    }

    /// Opens queue `q_id`'s character device (`cdev_path`, typically
    /// `/dev/ublkcN`), builds its ring, and maps its descriptor and buffer
    /// regions.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the character device cannot be opened, the
    /// ring cannot be created, or either mapping fails.
    pub fn new(
        q_id: u16,
        cdev_path: &std::path::Path,
        depth: u16,
        per_tag_bytes: u32,
        backend: Arc<B>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, QueueError> {
        let cdev = OpenOptions::new().read(true).write(true).open(cdev_path)?;

        let ring = Ring::create(u32::from(depth).next_power_of_two())?;
        ring.register_files(&[cdev.as_raw_fd()])?;

        let descriptor_bytes = Self::cmd_buf_sz(depth);
        let offset = i64::from(q_id) * i64::from(descriptor_bytes);
        let descriptors = DescriptorMap::new(&cdev, offset, descriptor_bytes as usize)?;

        let buffers = AnonMap::new(depth as usize * per_tag_bytes as usize)?;

        Ok(Self {
            q_id,
            depth,
            per_tag_bytes,
            ring,
            _cdev: cdev,
            descriptors,
            buffers,
            tag_states: vec![TagState::InFlightFetch; depth as usize],
            backend,
            stop,
        })
    }

    /// This queue's id.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.q_id
    }

    /// Current state of one tag.
    #[must_use]
    pub fn tag_state(&self, tag: u16) -> TagState {
        self.tag_states[tag as usize]
    }

    fn buffer_addr(&self, tag: u16) -> u64 {
        // SAFETY: just pointer arithmetic for an address value; no access.
        (self.buffers.ptr as u64) + u64::from(tag) * u64::from(self.per_tag_bytes)
    }

    /// Returns a mutable slice over tag `tag`'s buffer.
    ///
    /// Takes `&self` rather than `&mut self` so it can be used alongside
    /// `self.backend` in the same expression: the aliasing is sound because
    /// each tag's region is exclusively owned by whichever call is currently
    /// in [`TagState::Owned`] for that tag, enforced by the completion
    /// loop's single-threaded, one-tag-at-a-time dispatch.
    fn buffer_slice_mut(&self, tag: u16) -> &mut [u8] {
        let offset = tag as usize * self.per_tag_bytes as usize;
        // SAFETY: `offset + per_tag_bytes` is within `buffers`'s mapped
        // length by construction.
        unsafe {
            std::slice::from_raw_parts_mut(self.buffers.ptr.add(offset), self.per_tag_bytes as usize)
        }
    }

    fn push_fetch_like(
        &mut self,
        tag: u16,
        op: IoOp,
        result: i32,
        is_commit: bool,
    ) -> Result<(), QueueError> {
        let cmd = sys::IoCmd {
            q_id: self.q_id,
            tag,
            result,
            addr: self.buffer_addr(tag),
        };

        let mut cmd_bytes = [0u8; 80];
        // SAFETY: `cmd_bytes` is valid for writes and `IoCmd` fits within it.
        unsafe {
            cmd_bytes.as_mut_ptr().cast::<sys::IoCmd>().write_unaligned(cmd);
        }

        let entry: squeue::Entry128 = UringCmd80::new(Fixed(0), op.encoded())
            .cmd(cmd_bytes)
            .build()
            .user_data(encode_user_data(self.q_id, tag, is_commit));

        // SAFETY: `cmd`'s `addr` points into `self.buffers`, which outlives
        // this submission (it is only unmapped when `Queue` is dropped, and
        // the corresponding tag will not be reused until this command
        // completes).
        unsafe { self.ring.push(&entry) }?;
        Ok(())
    }

    /// Arms every tag with a FETCH_REQ and flushes them in a single submit.
    ///
    /// Must be called before the orchestrator issues START_DEV: the kernel
    /// only considers a queue ready once every tag has an outstanding fetch
    /// and the owning thread is blocked inside `io_uring_enter`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if a submission cannot be queued or flushed.
    pub fn prime(&mut self) -> Result<(), QueueError> {
        for tag in 0..self.depth {
            self.push_fetch_like(tag, IoOp::FetchReq, -1, false)?;
            self.tag_states[tag as usize] = TagState::InFlightFetch;
        }
        self.ring.submit()?;
        Ok(())
    }

    /// Runs one batch of the completion loop: blocks until at least one
    /// completion is available, processes up to
    /// [`MAX_COMPLETIONS_PER_BATCH`] of them, and flushes any
    /// COMMIT_AND_FETCH_REQ submissions accumulated along the way.
    ///
    /// Returns the number of completions handled, so a caller can meter
    /// throughput or decide whether to keep looping.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if waiting on the ring or dispatching to the
    /// backend's result through the ring fails.
    pub fn process_completions(&mut self) -> Result<usize, QueueError> {
        self.ring.submit_and_wait(1)?;

        let mut cqes: Vec<cqueue::Entry32> = Vec::new();
        let n = self.ring.copy_cqes(&mut cqes, MAX_COMPLETIONS_PER_BATCH);

        for cqe in &cqes {
            let (_q_id, tag) = decode_user_data(cqe.user_data());
            let res = cqe.result();

            if res < 0 {
                // Terminal kernel-reported error for this tag (e.g. device
                // shutting down): mark it errored and skip. There is no
                // valid in-flight request to report a result for, so no
                // COMMIT_AND_FETCH_REQ is submitted and the backend is not
                // invoked.
                self.tag_states[tag as usize] = TagState::Errored;
                continue;
            }

            // SAFETY: `tag < depth`, matching the descriptor map's sizing.
            let desc = unsafe {
                Descriptor::read_volatile_at(self.descriptors.descriptor_at(tag))
            };

            if desc.is_keep_alive() {
                self.push_fetch_like(tag, IoOp::CommitAndFetchReq, 0, true)?;
                continue;
            }

            self.tag_states[tag as usize] = TagState::Owned;
            let decoded = decode_op_flags(desc.op_flags);
            let buf_len = (desc.nr_sectors as usize * 512).min(self.per_tag_bytes as usize);
            let offset = desc.start_sector * 512;

            // Step 6: on success the runner commits the byte count the
            // request covered (`nr_sectors * 512`), not the backend's own
            // return value; on failure it commits the backend's negative
            // errno unchanged.
            let bytes_transferred = (desc.nr_sectors as i64 * 512) as i32;
            let result: std::io::Result<()> = {
                let buf = &mut self.buffer_slice_mut(tag)[..buf_len];
                match decoded.op {
                    None => Err(std::io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
                    Some(crate::uapi::BlockOp::Read) => self.backend.read_at(offset, buf),
                    Some(crate::uapi::BlockOp::Write) => self.backend.write_at(offset, buf),
                    Some(crate::uapi::BlockOp::Flush) => self.backend.flush(),
                    Some(crate::uapi::BlockOp::Discard | crate::uapi::BlockOp::WriteZeroes) => self
                        .backend
                        .discard_range(offset, u64::from(desc.nr_sectors) * 512),
                    Some(_) => Err(std::io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
                }
            };

            let commit_result = match result {
                Ok(()) => bytes_transferred,
                Err(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            };

            self.tag_states[tag as usize] = TagState::InFlightCommit;
            self.push_fetch_like(tag, IoOp::CommitAndFetchReq, commit_result, true)?;
        }

        self.ring.submit()?;
        Ok(n)
    }

    /// Whether the orchestrator has asked this queue's thread to stop.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Runs [`Queue::process_completions`] in a loop until
    /// [`Queue::should_stop`] observes the stop flag.
    ///
    /// # Errors
    ///
    /// Returns the first [`QueueError`] encountered.
    pub fn run(&mut self) -> Result<(), QueueError> {
        while !self.should_stop() {
            self.process_completions()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_round_trips_tag_and_queue_id() {
        let encoded = encode_user_data(3, 42, false);
        let (q_id, tag) = decode_user_data(encoded);
        assert_eq!(q_id, 3);
        assert_eq!(tag, 42);
        assert_eq!(encoded & USER_DATA_COMMIT_BIT, 0);
    }

    #[test]
    fn user_data_commit_bit_is_set_only_for_commits() {
        let fetch = encode_user_data(1, 5, false);
        let commit = encode_user_data(1, 5, true);
        assert_eq!(fetch & USER_DATA_COMMIT_BIT, 0);
        assert_ne!(commit & USER_DATA_COMMIT_BIT, 0);

        let (q_id, tag) = decode_user_data(commit);
        assert_eq!((q_id, tag), (1, 5));
    }

    #[test]
    fn cmd_buf_sz_rounds_up_to_a_page() {
        let sz = Queue::<crate::backend::tests::NullBackend>::cmd_buf_sz(7);
        assert_eq!(sz % page_size(), 0);
        assert!(sz >= 7 * 24);
    }

    #[test]
    fn round_up_matches_reference_values() {
        assert_eq!(round_up(10, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }
}
