// SPDX-License-Identifier: MIT

use std::io;
use thiserror::Error;

/// Errors returned while creating, submitting to, or draining a ring.
#[derive(Error, Debug)]
pub enum RingError {
    /// `entries` was not a nonzero power of two, or the kernel rejected the
    /// requested ring size.
    #[error("invalid argument creating io_uring instance")]
    InvalidArgument,

    /// The calling process has reached its open file descriptor limit.
    #[error("per-process file descriptor limit reached")]
    ProcessFdQuota,

    /// The system-wide open file descriptor limit has been reached.
    #[error("system-wide file descriptor limit reached")]
    SystemFdQuota,

    /// The kernel could not allocate the memory backing the ring.
    #[error("insufficient resources to create io_uring instance")]
    InsufficientResources,

    /// The caller lacks permission to create an `io_uring` instance.
    #[error("permission denied creating io_uring instance")]
    PermissionDenied,

    /// The running kernel does not support `IORING_SETUP_SINGLE_MMAP`.
    #[error("kernel too old: IORING_SETUP_SINGLE_MMAP is not supported")]
    KernelTooOld,

    /// The local SQE area has no free slot (`local_tail - shared_head > depth`).
    #[error("submission queue is full")]
    SubmissionQueueFull,

    /// `io_uring_enter` rejected the target file descriptor.
    #[error("bad file descriptor")]
    BadFd,

    /// The completion queue would overflow.
    #[error("completion queue overcommitted")]
    CompletionOvercommit,

    /// The kernel rejected a prepared SQE.
    #[error("invalid submission queue entry")]
    InvalidSqe,

    /// A buffer referenced by an SQE faulted.
    #[error("buffer fault")]
    BufferFault,

    /// Local SQE push failed because the local ring was already full.
    #[error("io_uring full submission queue")]
    FullSubmissionQueue(#[from] io_uring::squeue::PushError),

    /// Any other I/O error surfaced by the ring's underlying syscalls.
    #[error("io_uring: {0}")]
    Io(#[source] io::Error),
}

impl RingError {
    /// Maps an `io_uring_setup` failure to a [`RingError`] variant.
    pub(crate) fn from_setup_errno(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINVAL) => Self::InvalidArgument,
            Some(libc::EMFILE) => Self::ProcessFdQuota,
            Some(libc::ENFILE) => Self::SystemFdQuota,
            Some(libc::ENOMEM) => Self::InsufficientResources,
            Some(libc::EPERM) | Some(libc::EACCES) => Self::PermissionDenied,
            Some(libc::ENOSYS) => Self::KernelTooOld,
            _ => Self::Io(err),
        }
    }

    /// Maps an `io_uring_enter` failure to a [`RingError`] variant.
    pub(crate) fn from_enter_errno(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EBADF) | Some(libc::EBADFD) => Self::BadFd,
            Some(libc::EBUSY) => Self::CompletionOvercommit,
            Some(libc::EINVAL) => Self::InvalidSqe,
            Some(libc::EFAULT) => Self::BufferFault,
            Some(libc::EAGAIN) => Self::SubmissionQueueFull,
            _ => Self::Io(err),
        }
    }
}

/// One variant per ublk device-lifecycle command; each wraps the kernel's
/// negative `res` converted with [`io::Error::from_raw_os_error`].
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// `ADD_DEV` failed.
    #[error("ADD_DEV failed: {0}")]
    AddDeviceFailed(#[source] io::Error),

    /// `DEL_DEV` failed.
    #[error("DEL_DEV failed: {0}")]
    DeleteDeviceFailed(#[source] io::Error),

    /// `START_DEV` failed.
    #[error("START_DEV failed: {0}")]
    StartDeviceFailed(#[source] io::Error),

    /// `STOP_DEV` failed.
    #[error("STOP_DEV failed: {0}")]
    StopDeviceFailed(#[source] io::Error),

    /// `SET_PARAMS` failed.
    #[error("SET_PARAMS failed: {0}")]
    SetParamsFailed(#[source] io::Error),

    /// `GET_PARAMS` failed.
    #[error("GET_PARAMS failed: {0}")]
    GetParamsFailed(#[source] io::Error),

    /// `GET_DEV_INFO` failed.
    #[error("GET_DEV_INFO failed: {0}")]
    GetDeviceInfoFailed(#[source] io::Error),

    /// `GET_QUEUE_AFFINITY` failed.
    #[error("GET_QUEUE_AFFINITY failed: {0}")]
    GetQueueAffinityFailed(#[source] io::Error),
}

/// Errors raised while running a queue's FETCH/COMMIT completion loop.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A ring-level failure (submission queue full, bad fd, ...).
    #[error(transparent)]
    Ring(#[from] RingError),

    /// `submit_and_wait` returned successfully but no completion materialised.
    #[error("submit_and_wait returned with no completions")]
    NoCompletion,

    /// Mapping the descriptor or buffer region into the process failed.
    #[error("mmap failed: {0}")]
    Mmap(#[source] io::Error),

    /// Any other I/O error (opening the character device, ...).
    #[error("Io: {0}")]
    Io(#[from] io::Error),
}

/// The crate's top-level error type.
///
/// The library never logs (see the crate-level error handling design): every
/// fallible operation returns one of these variants instead.
#[derive(Error, Debug)]
pub enum Error {
    /// A ring-level failure.
    #[error(transparent)]
    Ring(#[from] RingError),

    /// A device-lifecycle command failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// A queue-runner failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Any other I/O error (opening a character device, ...).
    #[error("Io: {0}")]
    Io(#[from] io::Error),
}

/// This crate's `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;
