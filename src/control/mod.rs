// SPDX-License-Identifier: MIT

//! The control path: `/dev/ublk-control`, device lifecycle commands, and
//! device/queue metadata.

mod sys;

use crate::error::{Error, LifecycleError, Result};
use crate::params::sys::DevParams;
use crate::ring::Ring;
use crate::uapi::CtrlOp;
use bitflags::bitflags;
use std::fs::OpenOptions;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd};

pub use crate::params::{
    DeviceAttr, DeviceParamDevt, DeviceParamDiscard, DeviceParamZoned, DeviceParams,
};

/// Number of in-flight control commands the ring can hold. One dev/server
/// process issues control commands sequentially, so this only needs to cover
/// the rare case of a pipelined `get_all_queues_affinity` sweep.
const CTRL_RING_ENTRIES: u32 = 32;

fn map_submit_err(
    err: sys::CtrlSubmitError,
    on_errno: fn(std::io::Error) -> LifecycleError,
) -> Error {
    match err {
        sys::CtrlSubmitError::Ring(ring) => Error::Ring(ring),
        sys::CtrlSubmitError::Errno(io) => Error::Lifecycle(on_errno(io)),
    }
}

/// A connection to `/dev/ublk-control`, used to create, configure, start,
/// stop, and delete ublk devices.
pub struct Controller {
    ring: Ring,
    uniq: u64,
    _ctrl_dev: OwnedFd,
}

impl Controller {
    /// Path to the ublk control character device.
    pub const CTRL_DEV_PATH: &'static str = "/dev/ublk-control";

    /// Opens `/dev/ublk-control` and builds the SQE128/CQE32 ring used to
    /// issue control commands over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the control device cannot be opened, or if the
    /// underlying ring cannot be created or the device registered with it.
    pub fn new() -> Result<Self> {
        let ring = Ring::create(CTRL_RING_ENTRIES)?;

        let ctrl_dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::CTRL_DEV_PATH)?;

        ring.register_files(&[ctrl_dev.as_raw_fd()])?;

        Ok(Self {
            ring,
            uniq: 0,
            _ctrl_dev: ctrl_dev.into(),
        })
    }

    /// Registers a new device, returning the kernel-assigned [`DeviceInfo`].
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AddDeviceFailed`] if the kernel rejects the
    /// request (invalid queue count/depth, resource limits, ...).
    pub fn add_device(&mut self, options: &DeviceOptions) -> Result<DeviceInfo> {
        self.uniq += 1;

        // Every command this crate issues — control and I/O alike — is
        // ioctl-encoded (`uapi::ioctl_encode`), so the device must always be
        // created with `IOCTL_ENCODE` regardless of what the caller asked
        // for: without it the kernel decodes FETCH/COMMIT_AND_FETCH against
        // the pre-6.11 raw command numbers and every queue submission fails.
        let flags = options.flags | DeviceFlags::IoctlEncode;

        let mut info = sys::DevInfo::new()
            .dev_id(options.dev_id)
            .max_io_buf_bytes(options.max_io_buf_bytes)
            .nr_hw_queues(options.nr_hw_queues)
            .queue_depth(options.queue_depth)
            .flags(flags.bits());

        sys::CtrlCmd::new(CtrlOp::AddDev, options.dev_id)
            .buffer(&mut info)
            .submit_and_wait(self.uniq, &mut self.ring)
            .map_err(|e| map_submit_err(e, LifecycleError::AddDeviceFailed))?;

        Ok(info.into())
    }

    /// Deletes a previously added device.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DeleteDeviceFailed`] if the kernel rejects
    /// the request (unknown device id, device still live, ...).
    pub fn delete_device(&mut self, dev_id: u32) -> Result<()> {
        self.uniq += 1;

        sys::CtrlCmd::new(CtrlOp::DelDev, dev_id)
            .submit_and_wait(self.uniq, &mut self.ring)
            .map_err(|e| map_submit_err(e, LifecycleError::DeleteDeviceFailed))?;

        Ok(())
    }

    /// Starts a configured device, exposing `/dev/ublkbN` to the system.
    ///
    /// The caller must have already primed every queue (one fetch command
    /// per tag submitted to `/dev/ublkcN`) before calling this: the kernel
    /// will not consider the device ready until each queue has a pending
    /// fetch for every tag.
    ///
    /// Retries automatically on `EINTR`: a signal arriving while the kernel
    /// is still validating the fully-primed queues should not surface as a
    /// device-start failure.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StartDeviceFailed`] for any other failure.
    pub fn start_device(&mut self, dev_id: u32, pid: u64) -> Result<()> {
        loop {
            self.uniq += 1;

            match sys::CtrlCmd::new(CtrlOp::StartDev, dev_id)
                .data(pid)
                .submit_and_wait(self.uniq, &mut self.ring)
            {
                Ok(()) => return Ok(()),
                Err(sys::CtrlSubmitError::Errno(io))
                    if io.raw_os_error() == Some(libc::EINTR) =>
                {
                    continue;
                }
                Err(e) => return Err(map_submit_err(e, LifecycleError::StartDeviceFailed)),
            }
        }
    }

    /// Stops a running device and tears down `/dev/ublkbN`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StopDeviceFailed`] if the kernel rejects the
    /// request.
    pub fn stop_device(&mut self, dev_id: u32) -> Result<()> {
        self.uniq += 1;

        sys::CtrlCmd::new(CtrlOp::StopDev, dev_id)
            .submit_and_wait(self.uniq, &mut self.ring)
            .map_err(|e| map_submit_err(e, LifecycleError::StopDeviceFailed))?;

        Ok(())
    }

    /// Sets a device's parameters. Only valid while the device is not yet
    /// live (before [`Controller::start_device`]).
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::SetParamsFailed`] if the kernel rejects the
    /// parameters or the device is already live.
    pub fn set_device_parameters(&mut self, dev_id: u32, params: &DeviceParams) -> Result<()> {
        self.uniq += 1;

        let mut wire: DevParams = params.into();

        sys::CtrlCmd::new(CtrlOp::SetParams, dev_id)
            .buffer(&mut wire)
            .submit_and_wait(self.uniq, &mut self.ring)
            .map_err(|e| map_submit_err(e, LifecycleError::SetParamsFailed))?;

        Ok(())
    }

    /// Reads back a device's current parameters.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::GetParamsFailed`] if the kernel rejects the
    /// request.
    pub fn get_device_parameters(&mut self, dev_id: u32) -> Result<DeviceParams> {
        self.uniq += 1;

        let mut wire = DevParams::empty();

        sys::CtrlCmd::new(CtrlOp::GetParams, dev_id)
            .buffer(&mut wire)
            .submit_and_wait(self.uniq, &mut self.ring)
            .map_err(|e| map_submit_err(e, LifecycleError::GetParamsFailed))?;

        Ok(wire.into())
    }

    /// Reads the CPU affinity mask the kernel assigned to one queue.
    ///
    /// Useful for pinning that queue's runner thread to the same CPUs the
    /// kernel's own interrupt/softirq handling for the hardware queue runs on.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::GetQueueAffinityFailed`] if the kernel
    /// rejects the request (unknown device id or out-of-range queue).
    pub fn get_queue_affinity(&mut self, dev_id: u32, queue: u16) -> Result<libc::cpu_set_t> {
        self.uniq += 1;

        // SAFETY: an all-zero byte pattern is a valid `libc::cpu_set_t`.
        let mut cpu_set: libc::cpu_set_t = unsafe { mem::zeroed() };

        sys::CtrlCmd::new(CtrlOp::GetQueueAffinity, dev_id)
            .buffer(&mut cpu_set)
            .data(u64::from(queue))
            .submit_and_wait(self.uniq, &mut self.ring)
            .map_err(|e| map_submit_err(e, LifecycleError::GetQueueAffinityFailed))?;

        Ok(cpu_set)
    }

    /// Reads the CPU affinity mask for every queue of a device, in queue-id
    /// order.
    ///
    /// # Errors
    ///
    /// Returns the first [`LifecycleError::GetQueueAffinityFailed`] hit.
    pub fn get_all_queues_affinity(
        &mut self,
        dev_id: u32,
        nr_queues: u16,
    ) -> Result<Vec<libc::cpu_set_t>> {
        let mut set = Vec::with_capacity(nr_queues as usize);

        for queue in 0..nr_queues {
            set.push(self.get_queue_affinity(dev_id, queue)?);
        }

        Ok(set)
    }

    /// Reads back a device's current info (id, pid, queue geometry, flags).
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::GetDeviceInfoFailed`] if the kernel rejects
    /// the request.
    pub fn get_device_info(&mut self, dev_id: u32) -> Result<DeviceInfo> {
        self.uniq += 1;

        let mut info = sys::DevInfo::new();

        sys::CtrlCmd::new(CtrlOp::GetDevInfo, dev_id)
            .buffer(&mut info)
            .submit_and_wait(self.uniq, &mut self.ring)
            .map_err(|e| map_submit_err(e, LifecycleError::GetDeviceInfoFailed))?;

        Ok(info.into())
    }
}

/// Device information as reported by the kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device id.
    pub dev_id: u32,
    /// Userspace server PID the kernel associates with this device.
    pub srv_pid: i32,
    /// Whether the device is currently live (started).
    pub active: bool,
    /// Number of hardware queues.
    pub nr_hw_queues: u16,
    /// Queue depth (tags per queue).
    pub queue_depth: u16,
    /// Maximum size, in bytes, of a single I/O buffer.
    pub max_io_buf_bytes: u32,
    /// Negotiated feature flags.
    pub flags: DeviceFlags,
}

bitflags! {
    /// Feature flags negotiated with the kernel and echoed back in
    /// [`DeviceInfo::flags`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceFlags: u64 {
        /// Zero-copy I/O. Requires a 4 KiB block size; not implemented by
        /// this crate's queue runner (see the backend trait's Non-goals).
        const ZeroCopy = sys::DevInfo::SUPPORT_ZERO_COPY;

        /// Complete I/O commands via `io_uring_cmd_complete_in_task`.
        const ForceIouCmdCompleteInTask = sys::DevInfo::URING_CMD_COMP_IN_TASK;

        /// The kernel wants a second I/O command to fetch write-request data
        /// (the zero-copy write path); not implemented.
        const NeedGetData = sys::DevInfo::NEED_GET_DATA;

        /// Command numbers are ioctl-encoded (`uapi::ioctl_encode`) rather
        /// than raw. Required on kernel >= 6.11; [`Controller::add_device`]
        /// always sets this since every command this crate submits is
        /// already ioctl-encoded.
        const IoctlEncode = sys::DevInfo::CMD_IOCTL_ENCODE;
    }
}

/// Options used to configure a new device in [`Controller::add_device`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    dev_id: u32,
    nr_hw_queues: u16,
    queue_depth: u16,
    max_io_buf_bytes: u32,
    flags: DeviceFlags,
}

impl DeviceOptions {
    /// Maximum request-buffer size, in bytes.
    pub const MAX_BUF_SIZE: u32 = sys::DevInfo::MAX_BUF_SIZE;
    /// Maximum number of hardware queues.
    pub const MAX_NR_HW_QUEUES: u16 = sys::DevInfo::MAX_NR_HW_QUEUES;
    /// Maximum queue depth.
    pub const MAX_QUEUE_DEPTH: u16 = sys::DevInfo::MAX_QUEUE_DEPTH;

    /// Default request-buffer size, in bytes.
    pub const DEFAULT_BUF_SIZE: u32 = sys::DevInfo::DEFAULT_BUF_SIZE;
    /// Default number of hardware queues.
    pub const DEFAULT_NR_HW_QUEUES: u16 = sys::DevInfo::DEFAULT_NR_HW_QUEUES;
    /// Default queue depth.
    pub const DEFAULT_QUEUE_DEPTH: u16 = sys::DevInfo::DEFAULT_QUEUE_DEPTH;

    /// Builds the default options: a new device id assigned by the kernel, a
    /// single hardware queue, default queue depth, default buffer size, no
    /// feature flags.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dev_id: sys::DevInfo::NEW_DEV_ID,
            nr_hw_queues: Self::DEFAULT_NR_HW_QUEUES,
            queue_depth: Self::DEFAULT_QUEUE_DEPTH,
            max_io_buf_bytes: Self::DEFAULT_BUF_SIZE,
            flags: DeviceFlags::empty(),
        }
    }

    /// Requests a specific device id instead of letting the kernel assign one.
    #[must_use]
    pub const fn device_id(mut self, dev_id: u32) -> Self {
        self.dev_id = dev_id;
        self
    }

    /// Sets the number of hardware queues, clamped to
    /// [`DeviceOptions::MAX_NR_HW_QUEUES`].
    #[must_use]
    pub const fn nr_hw_queues(mut self, nr_hw_queues: u16) -> Self {
        self.nr_hw_queues = if nr_hw_queues <= Self::MAX_NR_HW_QUEUES {
            nr_hw_queues
        } else {
            Self::MAX_NR_HW_QUEUES
        };
        self
    }

    /// Sets the queue depth, clamped to [`DeviceOptions::MAX_QUEUE_DEPTH`].
    #[must_use]
    pub const fn queue_depth(mut self, queue_depth: u16) -> Self {
        self.queue_depth = if queue_depth <= Self::MAX_QUEUE_DEPTH {
            queue_depth
        } else {
            Self::MAX_QUEUE_DEPTH
        };
        self
    }

    /// Sets the maximum I/O buffer size, clamped to
    /// [`DeviceOptions::MAX_BUF_SIZE`].
    #[must_use]
    pub const fn max_io_buf_bytes(mut self, max_io_buf_bytes: u32) -> Self {
        self.max_io_buf_bytes = if max_io_buf_bytes <= Self::MAX_BUF_SIZE {
            max_io_buf_bytes
        } else {
            Self::MAX_BUF_SIZE
        };
        self
    }

    /// Sets the requested feature flags.
    #[must_use]
    pub const fn flags(mut self, flags: DeviceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Device id this builder requests (`DevInfo::NEW_DEV_ID` for "assign one").
    #[must_use]
    pub const fn dev_id_requested(&self) -> u32 {
        self.dev_id
    }

    /// Number of hardware queues this builder requests.
    #[must_use]
    pub const fn nr_hw_queues_requested(&self) -> u16 {
        self.nr_hw_queues
    }

    /// Queue depth this builder requests.
    #[must_use]
    pub const fn queue_depth_requested(&self) -> u16 {
        self.queue_depth
    }
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_options_clamp_to_kernel_maxima() {
        let opts = DeviceOptions::new()
            .nr_hw_queues(u16::MAX)
            .queue_depth(u16::MAX)
            .max_io_buf_bytes(u32::MAX);

        assert_eq!(opts.nr_hw_queues_requested(), DeviceOptions::MAX_NR_HW_QUEUES);
        assert_eq!(opts.queue_depth_requested(), DeviceOptions::MAX_QUEUE_DEPTH);
    }

    #[test]
    fn device_options_default_requests_a_new_device_id() {
        let opts = DeviceOptions::new();
        assert_eq!(opts.dev_id_requested(), sys::DevInfo::NEW_DEV_ID);
        assert_eq!(opts.nr_hw_queues_requested(), DeviceOptions::DEFAULT_NR_HW_QUEUES);
    }
}
