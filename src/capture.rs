//! Per-session capture loop.
//!
//! The loop claims a free slot (blocking when the pool is exhausted), asks the
//! device to fill it and publishes it to the delivery queue. Transient device
//! failures are counted and retried; a fatal failure faults the pool and ends
//! the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::CaptureError;
use crate::pool::{BufferPool, ClaimedSlot, WaitError};
use crate::traits::DeviceHandle;

/// Counters shared between a session and its capture loop.
///
/// Frame ids come from here so they keep increasing across stop/start.
#[derive(Debug, Default)]
pub(crate) struct CaptureCounters {
    next_frame_id: AtomicU64,
    frames_captured: AtomicU64,
    frames_delivered: AtomicU64,
    transient_failures: AtomicU64,
    last_error: Mutex<Option<CaptureError>>,
}

impl CaptureCounters {
    pub(crate) fn record_delivery(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Capture statistics of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Buffers successfully filled by the device.
    pub frames_captured: u64,
    /// Buffers handed out by `fetch`.
    pub frames_delivered: u64,
    /// Capture attempts that failed and were retried.
    pub transient_failures: u64,
    /// Most recent capture failure, transient or fatal.
    pub last_error: Option<CaptureError>,
}

/// What a finished background loop hands back to its session.
/// Faults the pool if the capture thread unwinds, so blocked fetchers wake up.
struct PanicGuard(Arc<BufferPool>);

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0
                .fail(CaptureError::Fatal("capture worker panicked".to_owned()));
        }
    }
}

pub(crate) struct LoopExit {
    pub(crate) device: Box<dyn DeviceHandle>,
    pub(crate) fault: Option<CaptureError>,
}

pub(crate) struct CaptureLoop {
    device_id: String,
    device: Box<dyn DeviceHandle>,
    pool: Arc<BufferPool>,
    counters: Arc<CaptureCounters>,
    retry_backoff: Duration,
}

impl CaptureLoop {
    pub(crate) fn new(
        device_id: String,
        device: Box<dyn DeviceHandle>,
        pool: Arc<BufferPool>,
        counters: Arc<CaptureCounters>,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            device_id,
            device,
            pool,
            counters,
            retry_backoff,
        }
    }

    /// Run until the pool is closed or the device fails fatally.
    pub(crate) fn run(mut self) -> LoopExit {
        info!(device = %self.device_id, "capture loop started");
        let _guard = PanicGuard(Arc::clone(&self.pool));

        let fault = loop {
            let slot = match self.pool.claim_free(None) {
                Ok(slot) => slot,
                Err(WaitError::Faulted(err)) => break Some(err),
                Err(WaitError::Closed | WaitError::TimedOut) => break None,
            };
            match self.capture_into(slot) {
                Ok(_) => {}
                Err(err) if err.is_fatal() => {
                    self.pool.fail(err.clone());
                    break Some(err);
                }
                Err(_) => {
                    if self.pool.wait_closed(self.retry_backoff) {
                        break None;
                    }
                }
            }
        };

        match &fault {
            Some(err) => error!(device = %self.device_id, error = %err, "capture loop terminated"),
            None => info!(device = %self.device_id, "capture loop stopped"),
        }
        LoopExit {
            device: self.device,
            fault,
        }
    }

    /// Fill one slot on the calling thread.
    ///
    /// Retries transient failures until `deadline`.
    pub(crate) fn capture_on_demand(&mut self, deadline: Option<Instant>) -> Result<(), WaitError> {
        loop {
            let slot = self.pool.claim_free(deadline)?;
            match self.capture_into(slot) {
                Ok(_) => return Ok(()),
                Err(err) if err.is_fatal() => {
                    self.pool.fail(err.clone());
                    return Err(WaitError::Faulted(err));
                }
                Err(_) => {
                    let backoff = match deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return Err(WaitError::TimedOut);
                            }
                            remaining.min(self.retry_backoff)
                        }
                        None => self.retry_backoff,
                    };
                    if self.pool.wait_closed(backoff) {
                        return Err(WaitError::Closed);
                    }
                }
            }
        }
    }

    pub(crate) fn into_device(self) -> Box<dyn DeviceHandle> {
        self.device
    }

    fn capture_into(&mut self, mut slot: ClaimedSlot) -> Result<u64, CaptureError> {
        match self.device.fill_buffer(slot.buffer_mut()) {
            Ok(()) => {
                let frame_id = self.counters.next_frame_id.fetch_add(1, Ordering::Relaxed);
                slot.publish(frame_id);
                self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                trace!(device = %self.device_id, frame_id, "frame published");
                Ok(frame_id)
            }
            Err(err) => {
                // Dropping the claim puts the slot back to Free.
                drop(slot);
                if err.is_fatal() {
                    error!(device = %self.device_id, error = %err, "fatal capture failure");
                } else {
                    let failures = self.counters.transient_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures.is_power_of_two() {
                        warn!(device = %self.device_id, error = %err, failures, "transient capture failure");
                    } else {
                        debug!(device = %self.device_id, error = %err, failures, "transient capture failure");
                    }
                }
                *self.counters.last_error.lock() = Some(err.clone());
                Err(err)
            }
        }
    }
}
