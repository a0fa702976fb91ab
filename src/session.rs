//! Per-device acquisition session.
//!
//! A session owns one open device, its buffer pool and its capture loop, and
//! walks the lifecycle `Idle -> Running <-> Stopped -> Destroyed`. Cloned
//! sessions share the same underlying state, which is how the registry can
//! tear down sessions that clients still hold.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capture::{CaptureCounters, CaptureLoop, LoopExit, SessionStats};
use crate::config::AcquisitionConfig;
use crate::error::{AcquireError, CaptureError, Result};
use crate::pool::{BufferPool, FetchHandle, PoolStats, WaitError};
use crate::traits::{DeviceHandle, DeviceInfo};

/// How often a bounded join checks whether the capture thread finished.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle state of an [`AcquisitionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, never started.
    Idle,
    /// Capture loop active; `fetch` allowed.
    Running,
    /// Capture loop finished, by `stop` or by a fatal device failure.
    Stopped,
    /// Terminal; device closed and pool released.
    Destroyed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

enum Driver {
    /// Dedicated thread capturing continuously.
    Background(JoinHandle<LoopExit>),
    /// Capture on the fetching thread. `None` once the session took the device back.
    OnDemand(Arc<Mutex<Option<CaptureLoop>>>),
}

struct Control {
    state: SessionState,
    device: Option<Box<dyn DeviceHandle>>,
    pool: Option<Arc<BufferPool>>,
    driver: Option<Driver>,
    fault: Option<CaptureError>,
    /// Why `device` is gone while the session is not destroyed.
    device_lost: Option<&'static str>,
}

struct SessionInner {
    info: DeviceInfo,
    config: AcquisitionConfig,
    counters: Arc<CaptureCounters>,
    control: Mutex<Control>,
}

/// Acquisition session bound to one device.
#[derive(Clone)]
pub struct AcquisitionSession {
    inner: Arc<SessionInner>,
}

impl AcquisitionSession {
    /// Wrap an opened device in an idle session.
    pub fn new(info: DeviceInfo, device: Box<dyn DeviceHandle>, config: AcquisitionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                info,
                config,
                counters: Arc::new(CaptureCounters::default()),
                control: Mutex::new(Control {
                    state: SessionState::Idle,
                    device: Some(device),
                    pool: None,
                    driver: None,
                    fault: None,
                    device_lost: None,
                }),
            }),
        }
    }

    /// Descriptor of the device this session was created for.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    /// Current state. A loop that died of a fatal error reports `Stopped`.
    pub fn state(&self) -> SessionState {
        let mut control = self.inner.control.lock();
        self.reap(&mut control);
        control.state
    }

    /// Fault recorded by the last fatal device failure, if any.
    pub fn fault(&self) -> Option<CaptureError> {
        let mut control = self.inner.control.lock();
        self.reap(&mut control);
        control.fault.clone()
    }

    /// Capture counters.
    pub fn stats(&self) -> SessionStats {
        self.inner.counters.snapshot()
    }

    /// Occupancy of the current pool, if one is allocated.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.inner.control.lock().pool.as_ref().map(|pool| pool.stats())
    }

    /// Whether a background capture thread is alive.
    pub fn is_worker_running(&self) -> bool {
        matches!(
            &self.inner.control.lock().driver,
            Some(Driver::Background(handle)) if !handle.is_finished()
        )
    }

    /// Allocate a fresh pool and start capturing.
    ///
    /// With `background` the loop runs on its own thread; otherwise frames
    /// are captured inside [`fetch`](Self::fetch). Starting a running
    /// session is a no-op.
    pub fn start(&self, background: bool) -> Result<()> {
        let mut control = self.inner.control.lock();
        self.reap(&mut control);

        match control.state {
            SessionState::Running => return Ok(()),
            SessionState::Destroyed => {
                return Err(AcquireError::SessionState {
                    operation: "start",
                    state: SessionState::Destroyed,
                })
            }
            SessionState::Idle | SessionState::Stopped => {}
        }

        let config = &self.inner.config;
        config.validate()?;
        let pool = BufferPool::new(config.pool_capacity, config.slot_bytes)?;

        let Some(device) = control.device.take() else {
            let cause = control.device_lost.unwrap_or("the device was never handed back");
            return Err(AcquireError::DeviceUnreachable {
                device: self.inner.info.id.clone(),
                reason: format!("device handle lost: {cause}; destroy this session"),
            });
        };
        let capture = CaptureLoop::new(
            self.inner.info.id.clone(),
            device,
            Arc::clone(&pool),
            Arc::clone(&self.inner.counters),
            config.retry_backoff,
        );

        let driver = if background {
            let spawned = thread::Builder::new()
                .name(format!("capture-{}", self.inner.info.id))
                .spawn(move || capture.run());
            match spawned {
                Ok(handle) => Driver::Background(handle),
                Err(err) => {
                    control.device_lost = Some("the capture thread could not be spawned");
                    return Err(err.into());
                }
            }
        } else {
            Driver::OnDemand(Arc::new(Mutex::new(Some(capture))))
        };

        control.pool = Some(pool);
        control.driver = Some(driver);
        control.fault = None;
        control.state = SessionState::Running;
        info!(
            device = %self.inner.info.id,
            background,
            capacity = config.pool_capacity,
            "acquisition started"
        );
        Ok(())
    }

    /// Wait for the next frame.
    ///
    /// `None` waits until a frame arrives or the session is stopped. Frames
    /// are delivered in capture order. The returned handle gives its slot
    /// back to the pool when dropped.
    pub fn fetch(&self, timeout: Option<Duration>) -> Result<FetchHandle> {
        let (pool, on_demand) = {
            let mut control = self.inner.control.lock();
            self.reap(&mut control);
            match (control.state, &control.fault) {
                (SessionState::Running, _) => {}
                (SessionState::Stopped, Some(fault)) => return Err(fault.clone().into()),
                (state, _) => {
                    return Err(AcquireError::SessionState {
                        operation: "fetch",
                        state,
                    })
                }
            }
            let Some(pool) = control.pool.clone() else {
                return Err(AcquireError::SessionState {
                    operation: "fetch",
                    state: control.state,
                });
            };
            let on_demand = match &control.driver {
                Some(Driver::OnDemand(capture)) => Some(Arc::clone(capture)),
                _ => None,
            };
            (pool, on_demand)
        };

        // A timeout past the end of the clock waits forever.
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let result = match on_demand {
            Some(capture) => Self::fetch_on_demand(&pool, &capture, deadline),
            None => pool.take_filled(deadline),
        };

        match result {
            Ok(handle) => {
                self.inner.counters.record_delivery();
                Ok(handle)
            }
            Err(WaitError::TimedOut) => Err(AcquireError::Timeout(timeout.unwrap_or_default())),
            Err(WaitError::Faulted(err)) => Err(err.into()),
            Err(WaitError::Closed) => Err(AcquireError::SessionState {
                operation: "fetch",
                state: self.state(),
            }),
        }
    }

    fn fetch_on_demand(
        pool: &Arc<BufferPool>,
        capture: &Mutex<Option<CaptureLoop>>,
        deadline: Option<Instant>,
    ) -> std::result::Result<FetchHandle, WaitError> {
        loop {
            match pool.take_filled(Some(Instant::now())) {
                Err(WaitError::TimedOut) => {}
                other => return other,
            }
            // Another fetcher may be capturing; wait for it only until our deadline.
            let mut capture = match deadline {
                Some(deadline) => capture.try_lock_until(deadline).ok_or(WaitError::TimedOut)?,
                None => capture.lock(),
            };
            let Some(capture) = capture.as_mut() else {
                return Err(WaitError::Closed);
            };
            capture.capture_on_demand(deadline)?;
        }
    }

    /// Stop capturing and wait for the loop to finish.
    ///
    /// Blocked fetchers wake up with a `SessionState` error; handles already
    /// fetched stay valid. Stopping a session that is not running is a no-op.
    pub fn stop(&self) -> Result<()> {
        let mut control = self.inner.control.lock();
        self.reap(&mut control);
        match control.state {
            SessionState::Running => self.shutdown(&mut control),
            SessionState::Idle | SessionState::Stopped => Ok(()),
            SessionState::Destroyed => Err(AcquireError::SessionState {
                operation: "stop",
                state: SessionState::Destroyed,
            }),
        }
    }

    /// Stop if running, release the pool and close the device.
    ///
    /// Idempotent. An error means the worker had to be abandoned; the session
    /// is destroyed regardless.
    pub fn destroy(&self) -> Result<()> {
        let mut control = self.inner.control.lock();
        if control.state == SessionState::Destroyed {
            return Ok(());
        }
        self.reap(&mut control);

        let result = if control.state == SessionState::Running {
            self.shutdown(&mut control)
        } else {
            Ok(())
        };

        control.pool = None;
        if let Some(mut device) = control.device.take() {
            device.close();
        }
        control.state = SessionState::Destroyed;
        info!(device = %self.inner.info.id, "session destroyed");
        result
    }

    /// Close the pool, join the loop and take the device back.
    fn shutdown(&self, control: &mut Control) -> Result<()> {
        if let Some(pool) = &control.pool {
            pool.close();
        }

        let result = match control.driver.take() {
            Some(Driver::Background(handle)) => {
                let waited = self.inner.config.join_timeout;
                match join_within(handle, waited) {
                    Some(Ok(exit)) => {
                        control.device = Some(exit.device);
                        if exit.fault.is_some() {
                            control.fault = exit.fault;
                        }
                        Ok(())
                    }
                    Some(Err(_)) => {
                        warn!(device = %self.inner.info.id, "capture worker panicked");
                        control.device_lost = Some("the capture worker panicked");
                        Err(AcquireError::WorkerPanicked {
                            device: self.inner.info.id.clone(),
                        })
                    }
                    None => {
                        warn!(device = %self.inner.info.id, ?waited, "capture worker detached");
                        control.device_lost = Some("the capture worker did not stop in time");
                        Err(AcquireError::WorkerUnresponsive {
                            device: self.inner.info.id.clone(),
                            waited,
                        })
                    }
                }
            }
            Some(Driver::OnDemand(capture)) => {
                control.device = capture.lock().take().map(CaptureLoop::into_device);
                Ok(())
            }
            None => Ok(()),
        };

        control.state = SessionState::Stopped;
        debug!(device = %self.inner.info.id, "acquisition stopped");
        result
    }

    /// Move a session whose loop died of a fatal error to `Stopped`.
    fn reap(&self, control: &mut Control) {
        if control.state != SessionState::Running {
            return;
        }
        // Only a fatal failure closes the pool of a running session.
        let pool_closed = control.pool.as_ref().is_some_and(|pool| pool.is_closed());
        let faulted = pool_closed
            || matches!(&control.driver, Some(Driver::Background(handle)) if handle.is_finished());
        if faulted {
            if let Err(err) = self.shutdown(control) {
                warn!(device = %self.inner.info.id, error = %err, "failed to reap capture loop");
            }
            if control.fault.is_none() {
                control.fault = control
                    .pool
                    .as_ref()
                    .and_then(|pool| pool.fault())
                    .or_else(|| self.inner.counters.snapshot().last_error.filter(CaptureError::is_fatal));
            }
        }
    }
}

impl fmt::Debug for AcquisitionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionSession")
            .field("device", &self.inner.info.id)
            .field("state", &self.inner.control.lock().state)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        if control.state == SessionState::Destroyed {
            return;
        }
        if let Some(pool) = &control.pool {
            pool.close();
        }
        match control.driver.take() {
            Some(Driver::Background(handle)) => {
                if let Some(Ok(exit)) = join_within(handle, self.config.join_timeout) {
                    control.device = Some(exit.device);
                }
            }
            Some(Driver::OnDemand(capture)) => {
                control.device = capture.lock().take().map(CaptureLoop::into_device);
            }
            None => {}
        }
        if let Some(mut device) = control.device.take() {
            device.close();
        }
        debug!(device = %self.info.id, "session dropped without destroy");
    }
}

/// Join the capture thread if it finishes within `timeout`, otherwise detach it.
fn join_within(handle: JoinHandle<LoopExit>, timeout: Duration) -> Option<thread::Result<LoopExit>> {
    let deadline = Instant::now().checked_add(timeout);
    while !handle.is_finished() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return None;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    Some(handle.join())
}
