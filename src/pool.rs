//! Fixed-capacity buffer slot pool and the scoped [`FetchHandle`].
//!
//! Every slot is in exactly one of three states:
//!
//! - `Free`: available to the capture loop. While the loop fills it, the
//!   payload is checked out as a [`ClaimedSlot`] and the slot stays `Free`.
//! - `Filled`: holds a frame and sits in the FIFO delivery queue.
//! - `InUse`: payload lent to a consumer through a [`FetchHandle`].
//!
//! All transitions happen under one mutex. Payloads move by value between the
//! pool, the capture loop and consumers, so a buffer is never reachable from
//! two owners at once.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{AcquireError, CaptureError};
use crate::traits::{FrameBuffer, FrameMetadata};

/// Default number of slots per session.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Lifecycle state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available for (re)filling.
    Free,
    /// Holds a frame waiting to be fetched.
    Filled,
    /// Lent to a consumer.
    InUse,
}

/// Occupancy snapshot. `free + filled + in_use == capacity` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total slots.
    pub capacity: usize,
    /// Slots in `Free` (including any currently being filled).
    pub free: usize,
    /// Slots waiting in the delivery queue.
    pub filled: usize,
    /// Slots lent to consumers.
    pub in_use: usize,
}

/// Why a wait on the pool ended without a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitError {
    /// The deadline passed.
    TimedOut,
    /// The pool was closed by stop/destroy.
    Closed,
    /// The capture loop hit a fatal device error.
    Faulted(CaptureError),
}

struct Slot {
    state: SlotState,
    buffer: Option<FrameBuffer>,
}

struct PoolState {
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    filled: VecDeque<usize>,
    closed: bool,
    fault: Option<CaptureError>,
}

/// Bounded pool of frame buffers with a FIFO delivery queue.
pub struct BufferPool {
    state: Mutex<PoolState>,
    slot_freed: Condvar,
    slot_filled: Condvar,
    capacity: usize,
}

impl BufferPool {
    /// Allocate `capacity` slots, each pre-reserving `slot_bytes`.
    ///
    /// A pool needs at least one slot.
    pub fn new(capacity: usize, slot_bytes: usize) -> crate::error::Result<Arc<Self>> {
        if capacity == 0 {
            return Err(AcquireError::Config(
                "pool capacity must be greater than 0".to_owned(),
            ));
        }

        let slots = (0..capacity)
            .map(|_| Slot {
                state: SlotState::Free,
                buffer: Some(FrameBuffer::with_capacity(slot_bytes)),
            })
            .collect();

        Ok(Arc::new(Self {
            state: Mutex::new(PoolState {
                slots,
                free: (0..capacity).collect(),
                filled: VecDeque::with_capacity(capacity),
                closed: false,
                fault: None,
            }),
            slot_freed: Condvar::new(),
            slot_filled: Condvar::new(),
            capacity,
        }))
    }

    /// Number of slots.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            capacity: self.capacity,
            ..PoolStats::default()
        };
        for slot in &state.slots {
            match slot.state {
                SlotState::Free => stats.free += 1,
                SlotState::Filled => stats.filled += 1,
                SlotState::InUse => stats.in_use += 1,
            }
        }
        stats
    }

    /// Whether `close` or `fail` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Fatal error recorded by `fail`, if any.
    pub(crate) fn fault(&self) -> Option<CaptureError> {
        self.state.lock().fault.clone()
    }

    /// Stop handing out slots and wake every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            debug!(capacity = self.capacity, "closing buffer pool");
        }
        state.closed = true;
        drop(state);
        self.slot_freed.notify_all();
        self.slot_filled.notify_all();
    }

    /// Close the pool and record the fatal error waiters will observe.
    pub(crate) fn fail(&self, err: CaptureError) {
        let mut state = self.state.lock();
        state.fault = Some(err);
        state.closed = true;
        drop(state);
        self.slot_freed.notify_all();
        self.slot_filled.notify_all();
    }

    /// Check out a `Free` slot's payload for filling.
    ///
    /// Blocks while every slot is `Filled` or `InUse`.
    pub(crate) fn claim_free(
        self: &Arc<Self>,
        deadline: Option<Instant>,
    ) -> Result<ClaimedSlot, WaitError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(WaitError::Closed);
            }
            if let Some(index) = state.free.pop_front() {
                let buffer = state
                    .slots
                    .get_mut(index)
                    .and_then(|slot| slot.buffer.take())
                    .unwrap_or_default();
                return Ok(ClaimedSlot {
                    pool: Arc::clone(self),
                    index,
                    buffer,
                    published: false,
                });
            }
            if deadline_passed(deadline) {
                return Err(WaitError::TimedOut);
            }
            wait(&self.slot_freed, &mut state, deadline);
        }
    }

    /// Take the oldest `Filled` slot, blocking until one is queued.
    ///
    /// Returns `TimedOut` only once `deadline` has been reached.
    pub(crate) fn take_filled(
        self: &Arc<Self>,
        deadline: Option<Instant>,
    ) -> Result<FetchHandle, WaitError> {
        let mut state = self.state.lock();
        loop {
            if let Some(fault) = &state.fault {
                return Err(WaitError::Faulted(fault.clone()));
            }
            if state.closed {
                return Err(WaitError::Closed);
            }
            if let Some(index) = state.filled.pop_front() {
                let buffer = state
                    .slots
                    .get_mut(index)
                    .and_then(|slot| {
                        slot.state = SlotState::InUse;
                        slot.buffer.take()
                    })
                    .unwrap_or_default();
                return Ok(FetchHandle {
                    pool: Arc::clone(self),
                    index,
                    buffer,
                });
            }
            if deadline_passed(deadline) {
                return Err(WaitError::TimedOut);
            }
            wait(&self.slot_filled, &mut state, deadline);
        }
    }

    /// Sleep for up to `timeout`, returning early if the pool closes.
    /// Returns whether the pool is closed.
    ///
    /// A `timeout` past the end of the clock waits for the close.
    pub(crate) fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while !state.closed && !deadline_passed(deadline) {
            wait(&self.slot_freed, &mut state, deadline);
        }
        state.closed
    }

    fn publish(&self, index: usize, buffer: FrameBuffer) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            slot.state = SlotState::Filled;
            slot.buffer = Some(buffer);
        }
        state.filled.push_back(index);
        drop(state);
        self.slot_filled.notify_one();
    }

    fn unclaim(&self, index: usize, mut buffer: FrameBuffer) {
        buffer.clear();
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            slot.buffer = Some(buffer);
        }
        // Front of the queue so the same slot is retried next.
        state.free.push_front(index);
        drop(state);
        self.slot_freed.notify_all();
    }

    fn release(&self, index: usize, mut buffer: FrameBuffer) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(index) else {
            warn!(index, "release of unknown slot ignored");
            return;
        };
        if slot.state != SlotState::InUse {
            warn!(index, state = ?slot.state, "release of slot that is not in use ignored");
            return;
        }
        buffer.clear();
        slot.state = SlotState::Free;
        slot.buffer = Some(buffer);
        state.free.push_back(index);
        drop(state);
        self.slot_freed.notify_all();
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

fn wait(condvar: &Condvar, guard: &mut MutexGuard<'_, PoolState>, deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            condvar.wait_until(guard, deadline);
        }
        None => condvar.wait(guard),
    }
}

/// A `Free` slot checked out to the capture loop.
///
/// Dropping it without [`ClaimedSlot::publish`] puts the slot back in the
/// free queue, so a failed or abandoned capture never leaks a slot.
pub(crate) struct ClaimedSlot {
    pool: Arc<BufferPool>,
    index: usize,
    buffer: FrameBuffer,
    published: bool,
}

impl ClaimedSlot {
    /// Payload to fill.
    pub(crate) fn buffer_mut(&mut self) -> &mut FrameBuffer {
        &mut self.buffer
    }

    /// Stamp `frame_id` and queue the slot for delivery (Free -> Filled).
    pub(crate) fn publish(mut self, frame_id: u64) {
        self.buffer.metadata.frame_id = frame_id;
        let buffer = std::mem::take(&mut self.buffer);
        self.published = true;
        self.pool.publish(self.index, buffer);
    }
}

impl Drop for ClaimedSlot {
    fn drop(&mut self) {
        if !self.published {
            let buffer = std::mem::take(&mut self.buffer);
            self.pool.unclaim(self.index, buffer);
        }
    }
}

/// Scoped ownership of one fetched frame.
///
/// The slot returns to `Free` when the handle is dropped or
/// [`released`](FetchHandle::release), whichever comes first; the handle
/// cannot be cloned, so this happens exactly once.
pub struct FetchHandle {
    pool: Arc<BufferPool>,
    index: usize,
    buffer: FrameBuffer,
}

impl FetchHandle {
    /// Index of the slot backing this handle.
    pub const fn slot_index(&self) -> usize {
        self.index
    }

    /// Session-assigned frame id.
    pub const fn frame_id(&self) -> u64 {
        self.buffer.metadata.frame_id
    }

    /// Frame metadata.
    pub const fn metadata(&self) -> &FrameMetadata {
        &self.buffer.metadata
    }

    /// Return the slot to the pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for FetchHandle {
    type Target = FrameBuffer;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.release(self.index, buffer);
    }
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("index", &self.index)
            .field("metadata", &self.buffer.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fill(pool: &Arc<BufferPool>, frame_id: u64) {
        let mut slot = pool.claim_free(None).expect("claim should succeed");
        slot.buffer_mut().data.extend_from_slice(&frame_id.to_le_bytes());
        slot.buffer_mut().metadata.bytes_used = 8;
        slot.publish(frame_id);
    }

    fn assert_accounted(pool: &BufferPool) {
        let stats = pool.stats();
        assert_eq!(stats.free + stats.filled + stats.in_use, stats.capacity);
    }

    #[test]
    fn test_new_pool_is_all_free() {
        let pool = BufferPool::new(4, 64).expect("pool");
        assert_eq!(
            pool.stats(),
            PoolStats {
                capacity: 4,
                free: 4,
                filled: 0,
                in_use: 0
            }
        );
    }

    #[test]
    fn test_slot_lifecycle_accounting() {
        let pool = BufferPool::new(3, 0).expect("pool");

        fill(&pool, 1);
        fill(&pool, 2);
        assert_accounted(&pool);
        assert_eq!(pool.stats().filled, 2);

        let handle = pool.take_filled(None).expect("take should succeed");
        assert_eq!(handle.frame_id(), 1);
        assert_eq!(handle.bytes(), &1u64.to_le_bytes());
        assert_eq!(pool.stats().in_use, 1);
        assert_accounted(&pool);

        handle.release();
        let stats = pool.stats();
        assert_eq!(stats.free, 2);
        assert_eq!(stats.filled, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn test_delivery_is_fifo() {
        let pool = BufferPool::new(4, 0).expect("pool");
        for id in 10..14 {
            fill(&pool, id);
        }
        let ids: Vec<u64> = (0..4)
            .map(|_| pool.take_filled(None).expect("take").frame_id())
            .collect();
        assert_eq!(ids, vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_abandoned_claim_returns_slot() {
        let pool = BufferPool::new(2, 0).expect("pool");
        let slot = pool.claim_free(None).expect("claim");
        assert_accounted(&pool);
        drop(slot);
        assert_eq!(pool.stats().free, 2);
        assert!(pool
            .take_filled(Some(Instant::now()))
            .is_err_and(|err| err == WaitError::TimedOut));
    }

    #[test]
    fn test_claim_blocks_when_exhausted() {
        let pool = BufferPool::new(2, 0).expect("pool");
        fill(&pool, 1);
        fill(&pool, 2);

        let deadline = Instant::now() + Duration::from_millis(30);
        let result = pool.claim_free(Some(deadline));
        assert!(matches!(result, Err(WaitError::TimedOut)));
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_take_times_out_not_before_deadline() {
        let pool = BufferPool::new(2, 0).expect("pool");
        let start = Instant::now();
        let result = pool.take_filled(Some(start + Duration::from_millis(50)));
        assert!(matches!(result, Err(WaitError::TimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_release_wakes_blocked_claim() {
        let pool = BufferPool::new(1, 0).expect("pool");
        fill(&pool, 1);
        let handle = pool.take_filled(None).expect("take");

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.claim_free(None).map(|slot| slot.index))
        };
        thread::sleep(Duration::from_millis(20));
        handle.release();

        let index = waiter.join().expect("waiter thread");
        assert_eq!(index, Ok(0));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let pool = BufferPool::new(1, 0).expect("pool");
        let fetcher = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.take_filled(None).map(|handle| handle.frame_id()))
        };
        thread::sleep(Duration::from_millis(20));
        pool.close();

        assert_eq!(fetcher.join().expect("fetcher thread"), Err(WaitError::Closed));
        assert!(matches!(pool.claim_free(None), Err(WaitError::Closed)));
    }

    #[test]
    fn test_fault_is_reported_to_fetchers() {
        let pool = BufferPool::new(1, 0).expect("pool");
        pool.fail(CaptureError::Fatal("unplugged".to_owned()));
        let result = pool.take_filled(None).map(|handle| handle.frame_id());
        assert_eq!(
            result,
            Err(WaitError::Faulted(CaptureError::Fatal("unplugged".to_owned())))
        );
    }

    #[test]
    fn test_handle_outlives_close() {
        let pool = BufferPool::new(2, 0).expect("pool");
        fill(&pool, 7);
        let handle = pool.take_filled(None).expect("take");
        pool.close();

        assert_eq!(handle.frame_id(), 7);
        drop(handle);
        assert_eq!(pool.stats().free, 2);
    }

    #[test]
    fn test_wait_closed_returns_early() {
        let pool = BufferPool::new(1, 0).expect("pool");
        let closer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                pool.close();
            })
        };
        let start = Instant::now();
        assert!(pool.wait_closed(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
        closer.join().expect("closer thread");
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(BufferPool::new(0, 64), Err(AcquireError::Config(_))));
    }

    #[test]
    fn test_wait_closed_with_unbounded_timeout() {
        let pool = BufferPool::new(1, 0).expect("pool");
        let closer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                pool.close();
            })
        };
        assert!(pool.wait_closed(Duration::MAX));
        closer.join().expect("closer thread");
    }
}
