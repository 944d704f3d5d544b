// SPDX-License-Identifier: MIT

use crate::error::RingError;
use crate::ring::Ring;
use crate::uapi::CtrlOp;
use io_uring::cqueue;
use io_uring::opcode::UringCmd80;
use io_uring::types::Fixed;
use std::marker::PhantomData;
use std::{io, mem};

// Since the ring is built with IORING_SETUP_SQE128, it supports 80 bytes of
// arbitrary command data.
const IOURING_CMD_DATA_SIZE: usize = 80;
type IoUringCmdData = [u8; IOURING_CMD_DATA_SIZE];

// Control command data (to be sent into UringCmd80::cmd).
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct CmdData {
    // destination device
    dev_id: u32,
    // destination queue (unused)
    _queue_id: u16,
    // cmd op IN/OUT buffer
    len: u16,
    addr: u64,
    // cmd op inline data
    data: [u64; 2],
}

const _: () = assert!(mem::size_of::<CmdData>() == 32, "invalid size");
const _: () = assert!(
    mem::size_of::<CmdData>() <= mem::size_of::<IoUringCmdData>(),
    "invalid size"
);

impl From<CmdData> for IoUringCmdData {
    fn from(cmd_data: CmdData) -> Self {
        let mut data = [0_u8; IOURING_CMD_DATA_SIZE];
        // SAFETY: `data` is valid for writes and `CmdData` fits into `data`.
        unsafe {
            data.as_mut_ptr().cast::<CmdData>().write_unaligned(cmd_data);
        }
        data
    }
}

/// Failure mode of [`CtrlCmd::submit_and_wait`]: a ring-level failure (pushing
/// or entering the kernel) versus the kernel rejecting the command itself.
/// Kept distinct so callers in `control::mod` can attach the right
/// [`crate::error::LifecycleError`] variant to an errno while letting a ring
/// failure propagate as-is.
pub(crate) enum CtrlSubmitError {
    Ring(RingError),
    Errno(io::Error),
}

impl From<RingError> for CtrlSubmitError {
    fn from(err: RingError) -> Self {
        Self::Ring(err)
    }
}

// Control command.
//
// It uses the standard Rust lifetime specification to make most use-after-free
// errors fail to compile. The `CtrlCmd` is pinned to the lifetime of the
// backing buffer (if any) so the following won't compile:
//
// ```
//  let mut info = DevInfo::new();
//  let cmd = CtrlCmd::new(CtrlOp::GetDevInfo, 0).buffer(&mut info);
//
//  drop(info);
//  cmd.submit_and_wait(uniq, &mut ring);
// ```
#[derive(Debug, Copy, Clone)]
pub struct CtrlCmd<'a> {
    op: CtrlOp,
    lifetime: PhantomData<&'a mut ()>,
    cmd_data: CmdData,
}

impl<'a> CtrlCmd<'a> {
    // Special value to indicate that the command is not intended for a queue,
    // it'll be interpreted as '(u16)-1' by the kernel driver.
    const QUEUE_IGNORE_ID: u16 = u16::MAX;

    #[inline]
    pub fn new(op: CtrlOp, dev_id: u32) -> Self {
        Self {
            op,
            lifetime: PhantomData,
            cmd_data: CmdData {
                dev_id,
                _queue_id: Self::QUEUE_IGNORE_ID,
                len: 0,
                addr: 0,
                data: [0, 0],
            },
        }
    }

    #[inline]
    pub fn buffer<T>(mut self, buf: &'a mut T) -> Self {
        self.cmd_data.addr = buf as *mut T as u64;
        self.cmd_data.len = mem::size_of::<T>() as u16;
        self
    }

    #[inline]
    pub fn data(mut self, data: u64) -> Self {
        self.cmd_data.data = [data, 0];
        self
    }

    pub(crate) fn submit_and_wait(
        &self,
        uniq: u64,
        ring: &mut Ring,
    ) -> Result<(), CtrlSubmitError> {
        let cmd = UringCmd80::new(Fixed(0), self.op.encoded())
            .cmd(self.cmd_data.into())
            .build()
            .user_data(uniq);

        // SAFETY: the command buffer (if any) is held alive for the duration
        // of this call by `&'a mut T` in `buffer`, and we block until the
        // completion carrying `uniq` arrives before returning.
        unsafe { ring.push(&cmd) }?;
        ring.submit_and_wait(1)?;

        let mut cqes: Vec<cqueue::Entry32> = Vec::with_capacity(1);
        ring.copy_cqes(&mut cqes, 1);
        let cqe = cqes.first().ok_or(CtrlSubmitError::Ring(RingError::Io(
            io::Error::new(io::ErrorKind::Other, "submit_and_wait returned with no completion"),
        )))?;
        assert_eq!(uniq, cqe.user_data());

        let res = cqe.result();
        if res == 0 {
            Ok(())
        } else {
            Err(CtrlSubmitError::Errno(io::Error::from_raw_os_error(-res)))
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DevInfo {
    nr_hw_queues: u16,
    queue_depth: u16,
    state: u16,
    _pad0: u16,
    max_io_buf_bytes: u32,
    dev_id: u32,
    ublksrv_pid: i32,
    _pad1: u32,
    flags: u64,        // feature flags
    _unused: [u64; 4], // reserved
}

const _: () = assert!(mem::size_of::<DevInfo>() == 64, "invalid size");

impl DevInfo {
    // Signals to the kernel to provide a device id.
    pub const NEW_DEV_ID: u32 = u32::MAX; // interpreted as '-1' by the kernel driver

    #[allow(unused)]
    const STATE_DEV_DEAD: u16 = 0;
    const STATE_DEV_LIVE: u16 = 1;

    // zero copy requires 4k block size, and can remap ublk driver's io
    // request into ublksrv's vm space. Kernel driver is not ready to
    // support zero copy.
    pub const SUPPORT_ZERO_COPY: u64 = 1 << 0;

    // Force to complete io cmd via io_uring_cmd_complete_in_task so that
    // performance comparison is done easily with task_work_add.
    pub const URING_CMD_COMP_IN_TASK: u64 = 1 << 1;

    // User should issue io cmd again for write requests to set io buffer
    // address and copy data from bio vectors to the userspace io buffer.
    pub const NEED_GET_DATA: u64 = 1 << 2;

    // Command numbers passed to URING_CMD are ioctl-encoded rather than raw.
    // Required on kernel >= 6.11 for every command this crate issues.
    pub const CMD_IOCTL_ENCODE: u64 = 1 << 6;

    pub const MAX_BUF_SIZE: u32 = 1024 << 10;
    pub const MAX_NR_HW_QUEUES: u16 = 32;
    pub const MAX_QUEUE_DEPTH: u16 = 1024;

    pub const DEFAULT_BUF_SIZE: u32 = 512 << 10;
    pub const DEFAULT_NR_HW_QUEUES: u16 = 1;
    pub const DEFAULT_QUEUE_DEPTH: u16 = 256;

    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn dev_id(mut self, dev_id: u32) -> Self {
        self.dev_id = dev_id;
        self
    }

    pub const fn nr_hw_queues(mut self, nr_hw_queues: u16) -> Self {
        self.nr_hw_queues = nr_hw_queues;
        self
    }

    pub const fn queue_depth(mut self, queue_depth: u16) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub const fn max_io_buf_bytes(mut self, max_io_buf_bytes: u32) -> Self {
        self.max_io_buf_bytes = max_io_buf_bytes;
        self
    }

    pub const fn flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    pub fn dev_id_value(&self) -> u32 {
        self.dev_id
    }

    pub fn is_live(&self) -> bool {
        self.state == Self::STATE_DEV_LIVE
    }
}

impl From<DevInfo> for crate::control::DeviceInfo {
    fn from(info: DevInfo) -> Self {
        Self {
            dev_id: info.dev_id,
            srv_pid: info.ublksrv_pid,
            active: info.is_live(),
            nr_hw_queues: info.nr_hw_queues,
            queue_depth: info.queue_depth,
            max_io_buf_bytes: info.max_io_buf_bytes,
            flags: crate::control::DeviceFlags::from_bits_truncate(info.flags),
        }
    }
}
