// SPDX-License-Identifier: MIT

//! The multi-queue device orchestrator.
//!
//! Grounded on `csweichel-libublk-rs`'s `UblkCtrl::create_queue_handler`
//! (spawns one thread per queue, waiting on a `(Mutex<i32>, Condvar)` "ready"
//! handshake before moving to the next) and `ublk_tgt_worker`'s add →
//! create_queue_handler → start_dev → join → stop_dev sequencing, composed
//! here with this crate's own [`crate::control::Controller`] and
//! [`crate::queue::Queue`] rather than the teacher's JSON-exporting
//! `UblkCtrl`.

use crate::backend::Backend;
use crate::control::{Controller, DeviceInfo, DeviceOptions, DeviceParams};
use crate::error::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::queue::Queue;

/// Linear lifecycle of a [`Device`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceState {
    /// Registered with the kernel (`ADD_DEV` succeeded), not yet configured.
    Created,
    /// Parameters set (`SET_PARAMS` succeeded).
    Configured,
    /// Queues are being primed and the device is about to be started.
    Starting,
    /// `START_DEV` succeeded; `/dev/ublkbN` is live.
    Running,
    /// `STOP_DEV` has been issued; queue threads are being joined.
    Stopping,
    /// Queue threads joined and `DEL_DEV` issued (or never started).
    Stopped,
}

/// Configuration for [`Device::start`] beyond the device's own parameters.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Character-device path template; `{}` is replaced with the device id,
    /// e.g. `/dev/ublkc{}`.
    pub cdev_path_prefix: String,
    /// How long to sleep after every queue is primed but before issuing
    /// `START_DEV`, giving the kernel time to observe each queue's thread
    /// blocked inside `io_uring_enter`. 500 ms is a defensive default; kernels
    /// the caller has validated against a shorter settle time may lower it.
    pub arm_settle_delay: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cdev_path_prefix: "/dev/ublkc".to_string(),
            arm_settle_delay: Duration::from_millis(500),
        }
    }
}

/// Outcome a queue thread reports back through its [`ReadySignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyState {
    Pending,
    Primed,
    Failed,
}

struct QueueHandle {
    thread: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Ready handshake one queue thread uses to tell the orchestrator it has
/// finished priming and is blocked inside its completion loop (or that
/// construction/priming failed).
type ReadySignal = Arc<(Mutex<ReadyState>, Condvar)>;

/// Orchestrates a single ublk device: registers it with the kernel, spawns
/// one runner thread per hardware queue (primed strictly sequentially), then
/// issues `START_DEV`. Owns the spawned threads and tears them down on
/// [`Device::stop`] or [`Drop`].
pub struct Device<'ctrl, B: Backend> {
    ctrl: &'ctrl mut Controller,
    dev_id: u32,
    info: DeviceInfo,
    state: DeviceState,
    queues: Vec<QueueHandle>,
    backend: Arc<B>,
}

impl<'ctrl, B: Backend + 'static> Device<'ctrl, B> {
    /// Registers a new device with the kernel via `ADD_DEV`.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::error::LifecycleError::AddDeviceFailed`].
    pub fn create(ctrl: &'ctrl mut Controller, options: &DeviceOptions, backend: Arc<B>) -> Result<Self> {
        let info = ctrl.add_device(options)?;

        Ok(Self {
            ctrl,
            dev_id: info.dev_id,
            info,
            state: DeviceState::Created,
            queues: Vec::new(),
            backend,
        })
    }

    /// The kernel-assigned device id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.dev_id
    }

    /// The device's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// The device info returned by the kernel at creation.
    #[must_use]
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Sets the device's parameters. Only valid in [`DeviceState::Created`].
    ///
    /// # Errors
    ///
    /// Propagates [`crate::error::LifecycleError::SetParamsFailed`].
    pub fn configure(&mut self, params: &DeviceParams) -> Result<()> {
        self.ctrl.set_device_parameters(self.dev_id, params)?;
        self.state = DeviceState::Configured;
        Ok(())
    }

    /// Primes every queue (sequentially, waiting for each to signal ready
    /// before starting the next) and issues `START_DEV`.
    ///
    /// On any failure partway through, every already-spawned thread is
    /// signalled to stop, joined, and `DEL_DEV` is attempted before returning
    /// the error.
    ///
    /// # Errors
    ///
    /// Propagates queue-construction failures and
    /// [`crate::error::LifecycleError::StartDeviceFailed`].
    pub fn start(&mut self, config: &DeviceConfig) -> Result<()> {
        self.state = DeviceState::Starting;

        if let Err(err) = self.spawn_and_prime_queues(config) {
            self.teardown_queues();
            let _ = self.ctrl.delete_device(self.dev_id);
            self.state = DeviceState::Stopped;
            return Err(err);
        }

        std::thread::sleep(config.arm_settle_delay);

        let pid = std::process::id() as u64;
        if let Err(err) = self.ctrl.start_device(self.dev_id, pid) {
            self.teardown_queues();
            let _ = self.ctrl.delete_device(self.dev_id);
            self.state = DeviceState::Stopped;
            return Err(err);
        }

        self.state = DeviceState::Running;
        Ok(())
    }

    fn spawn_and_prime_queues(&mut self, config: &DeviceConfig) -> Result<()> {
        for q_id in 0..self.info.nr_hw_queues {
            let ready: ReadySignal = Arc::new((Mutex::new(ReadyState::Pending), Condvar::new()));
            let stop = Arc::new(AtomicBool::new(false));

            let cdev_path = PathBuf::from(format!(
                "{}{}",
                config.cdev_path_prefix, self.dev_id
            ));
            let depth = self.info.queue_depth;
            let per_tag_bytes = self.info.max_io_buf_bytes;
            let backend = Arc::clone(&self.backend);
            let thread_stop = Arc::clone(&stop);
            let thread_ready = Arc::clone(&ready);

            let thread = std::thread::Builder::new()
                .name(format!("ublk-q{q_id}"))
                .spawn(move || {
                    run_queue_thread(
                        q_id,
                        &cdev_path,
                        depth,
                        per_tag_bytes,
                        backend,
                        thread_stop,
                        thread_ready,
                    );
                })?;

            self.queues.push(QueueHandle { thread, stop });

            let (lock, cvar) = &*ready;
            let mut state = lock.lock().unwrap();
            while *state == ReadyState::Pending {
                state = cvar.wait(state).unwrap();
            }
            let failed = *state == ReadyState::Failed;
            drop(state);

            if failed {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("queue {q_id} failed to construct or prime"),
                )
                .into());
            }
        }

        Ok(())
    }

    fn teardown_queues(&mut self) {
        for handle in &self.queues {
            handle.stop.store(true, Ordering::Release);
        }
        for handle in self.queues.drain(..) {
            let _ = handle.thread.join();
        }
    }

    /// Stops the device: issues `STOP_DEV` (which unblocks every queue
    /// thread's `io_uring_enter`), joins every thread, then issues `DEL_DEV`.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::error::LifecycleError::StopDeviceFailed`] or
    /// [`crate::error::LifecycleError::DeleteDeviceFailed`].
    pub fn stop(&mut self) -> Result<()> {
        if self.state != DeviceState::Running {
            return Ok(());
        }

        self.state = DeviceState::Stopping;
        for handle in &self.queues {
            handle.stop.store(true, Ordering::Release);
        }
        self.ctrl.stop_device(self.dev_id)?;
        self.teardown_queues();
        self.ctrl.delete_device(self.dev_id)?;
        self.state = DeviceState::Stopped;
        Ok(())
    }
}

impl<B: Backend> Drop for Device<'_, B> {
    fn drop(&mut self) {
        if self.state == DeviceState::Running || self.state == DeviceState::Starting {
            for handle in &self.queues {
                handle.stop.store(true, Ordering::Release);
            }
            let _ = self.ctrl.stop_device(self.dev_id);
            self.teardown_queues();
        }
        if self.state != DeviceState::Stopped {
            let _ = self.ctrl.delete_device(self.dev_id);
        }
    }
}

fn run_queue_thread<B: Backend + 'static>(
    q_id: u16,
    cdev_path: &std::path::Path,
    depth: u16,
    per_tag_bytes: u32,
    backend: Arc<B>,
    stop: Arc<AtomicBool>,
    ready: ReadySignal,
) {
    let signal = |state: ReadyState, ready: &ReadySignal| {
        let (lock, cvar) = &**ready;
        *lock.lock().unwrap() = state;
        cvar.notify_one();
    };

    let mut queue = match Queue::new(q_id, cdev_path, depth, per_tag_bytes, backend, Arc::clone(&stop)) {
        Ok(queue) => queue,
        Err(_) => {
            signal(ReadyState::Failed, &ready);
            return;
        }
    };

    if queue.prime().is_err() {
        signal(ReadyState::Failed, &ready);
        return;
    }

    signal(ReadyState::Primed, &ready);

    let _ = queue.run();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_default_matches_conventional_geometry() {
        let config = DeviceConfig::default();
        assert_eq!(config.arm_settle_delay, Duration::from_millis(500));
        assert_eq!(config.cdev_path_prefix, "/dev/ublkc");
    }
}
