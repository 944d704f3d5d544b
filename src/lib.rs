// SPDX-License-Identifier: MIT

//! Rust friendly library for the userspace side of the Linux ublk protocol
//! (`/dev/ublk-control`, `/dev/ublkcN`, `/dev/ublkbN`).
//!
//! This library allows the implementation of generic userspace block devices
//! on top of a caller-supplied [`backend::Backend`], driving the device
//! lifecycle and per-queue FETCH/COMMIT I/O loop over `io_uring`'s
//! `URING_CMD` opcode.
//!
//! ublk-core aims to be minimal and misuse-resistant: it never logs (see
//! [`error`]) and never spawns daemons or forks; callers own the process and
//! thread model.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rustdoc::missing_crate_level_docs, missing_docs)]
#![warn(
    clippy::missing_errors_doc,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

/// Fixed-layout kernel ABI pieces shared by the control and queue paths.
pub mod uapi;

/// Device parameter records and their kernel wire framing.
pub mod params;

/// The SQE128/CQE32 `io_uring` ring both the control and queue paths use.
pub mod ring;

/// The control path: device lifecycle commands and metadata.
pub mod control;

/// The per-queue FETCH/COMMIT I/O runner.
pub mod queue;

/// The trait a caller implements to serve block I/O.
pub mod backend;

/// The multi-queue device orchestrator.
pub mod device;

/// Library errors.
pub mod error;
pub use error::{Error, Result};
