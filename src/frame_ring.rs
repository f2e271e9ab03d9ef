// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded queue of decoded frames waiting to be consumed.
//!
//! The ring owns a pool of output buffers, one per slot. The display path fills a free slot and
//! queues it; [`FrameRing::drain`] then hands every queued slot to the consumer as a
//! [`FrameLease`], and the slot only becomes reusable once the lease is unlocked. The ring is the
//! only structure of a session that may be touched from another thread, so all its state lives
//! behind a single mutex.
//!
//! When the frame size changes, buffers of the previous size are dropped as they come back
//! instead of being reused. Frames queued or leased before the change stay valid, and are not
//! counted against the capacity of the new size: until they all come back, up to
//! [`FrameRing::num_stale`] more buffers than the capacity exist.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use crate::session::DecodeError;

/// What to do when a frame must be queued and every slot is taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait until the consumer unlocks a lease, for at most `timeout` if set. Only useful if
    /// leases are unlocked from another thread than the one decoding.
    Block { timeout: Option<Duration> },
    /// Fail immediately.
    Fail,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::Block { timeout: None }
    }
}

impl FromStr for BackpressurePolicy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(BackpressurePolicy::Block { timeout: None }),
            "fail" => Ok(BackpressurePolicy::Fail),
            _ => Err("unrecognized backpressure policy. Valid values: block, fail"),
        }
    }
}

struct ReadyFrame {
    buffer: Vec<u8>,
    generation: u64,
    timestamp: i64,
    picture_index: u32,
}

#[derive(Default)]
struct RingState {
    capacity: usize,
    frame_size: usize,
    /// Bumped whenever `frame_size` changes. Buffers from older generations are not reused.
    generation: u64,
    free: Vec<Vec<u8>>,
    ready: VecDeque<ReadyFrame>,
    /// Buffers of the current generation, whether free, queued or leased.
    allocated: usize,
    /// Leases of the current generation not unlocked yet, including leaked ones.
    leased: usize,
    /// Buffers of previous generations still queued or leased.
    stale: usize,
    allocations: u64,
    leaked: u64,
}

impl RingState {
    fn can_acquire(&self) -> bool {
        !self.free.is_empty() || self.allocated < self.capacity
    }

    /// Whether a slot may still be freed by the consumer. If every slot of the current
    /// generation is queued, nothing will ever be unlocked.
    fn can_be_freed(&self) -> bool {
        self.leased > 0
    }

    fn acquire(&mut self) -> Option<Vec<u8>> {
        if let Some(buffer) = self.free.pop() {
            return Some(buffer);
        }

        if self.allocated < self.capacity {
            self.allocated += 1;
            self.allocations += 1;
            return Some(vec![0u8; self.frame_size]);
        }

        None
    }

    /// Takes back a buffer of `generation` that is not used anymore.
    fn recycle(&mut self, buffer: Vec<u8>, generation: u64) {
        if generation != self.generation {
            log::debug!("Dropping stale frame buffer of {} bytes", buffer.len());
            self.stale = self.stale.saturating_sub(1);
            return;
        }

        if self.allocated > self.capacity {
            self.allocated -= 1;
        } else {
            self.free.push(buffer);
        }
    }
}

struct Shared {
    state: Mutex<RingState>,
    slot_freed: Condvar,
}

impl Shared {
    /// Locks the ring state. A consumer thread panicking while holding the lock leaves the state
    /// consistent, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, buffer: Vec<u8>, generation: u64) {
        let mut state = self.lock();
        if generation == state.generation {
            state.leased = state.leased.saturating_sub(1);
        }
        state.recycle(buffer, generation);
        drop(state);

        self.slot_freed.notify_one();
    }

    fn leak(&self) {
        let mut state = self.lock();
        // The slot stays accounted as leased and is never given back.
        state.leaked += 1;
        log::warn!(
            "Frame lease dropped without being unlocked, {} slot(s) lost",
            state.leaked
        );
    }
}

/// A decoded frame handed to the consumer.
///
/// The frame's slot stays unavailable until the lease is given back with [`FrameLease::unlock`]
/// or [`crate::session::Session::unlock_frames`]. Dropping a lease without unlocking it leaks
/// the slot for the lifetime of the session.
#[must_use = "frame leases must be unlocked to give their slot back"]
pub struct FrameLease {
    buffer: Option<Vec<u8>>,
    generation: u64,
    timestamp: i64,
    picture_index: u32,
    shared: Arc<Shared>,
}

impl FrameLease {
    pub fn data(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Presentation timestamp of the frame.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Decode surface the frame was produced from.
    pub fn picture_index(&self) -> u32 {
        self.picture_index
    }

    /// CRC32 of the frame data.
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(self.data())
    }

    /// Gives the frame's slot back to its ring.
    pub fn unlock(mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.shared.release(buffer, self.generation);
        }
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("timestamp", &self.timestamp)
            .field("picture_index", &self.picture_index)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if self.buffer.take().is_some() {
            self.shared.leak();
        }
    }
}

/// Bounded pool of output frames shared between the display path and the consumer.
pub struct FrameRing {
    shared: Arc<Shared>,
    policy: BackpressurePolicy,
}

impl FrameRing {
    /// Creates an empty ring. No frame can be queued until [`FrameRing::configure`] is called.
    pub fn new(policy: BackpressurePolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Default::default(),
                slot_freed: Condvar::new(),
            }),
            policy,
        }
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Sets the number of slots and the size of the frames they hold.
    ///
    /// Free buffers of a different size are released immediately. Queued and leased frames are
    /// untouched.
    pub fn configure(&self, capacity: usize, frame_size: usize) {
        let mut state = self.shared.lock();

        if frame_size != state.frame_size {
            state.stale += state.allocated.saturating_sub(state.free.len());
            state.generation += 1;
            state.frame_size = frame_size;
            state.free.clear();
            state.allocated = 0;
            state.leased = 0;
        }
        state.capacity = capacity;
        while state.allocated > state.capacity && state.free.pop().is_some() {
            state.allocated -= 1;
        }

        log::debug!(
            "Frame ring configured with {} slots of {} bytes",
            capacity,
            frame_size
        );
        drop(state);

        // Waiters may now be able to allocate.
        self.shared.slot_freed.notify_all();
    }

    /// Queues a frame, filling its buffer with `fill`.
    ///
    /// `fill` runs with the ring locked. If it fails, the slot is given back and nothing is
    /// queued.
    pub fn push_with<F>(&self, timestamp: i64, picture_index: u32, fill: F) -> Result<(), DecodeError>
    where
        F: FnOnce(&mut [u8]) -> Result<(), DecodeError>,
    {
        let mut state = self.shared.lock();

        let acquired = state.acquire();
        let mut buffer = match acquired {
            Some(buffer) => buffer,
            None => {
                state = self.wait_for_slot(state, timestamp, picture_index)?;
                let capacity = state.capacity;
                state.acquire().ok_or(DecodeError::OutOfFrameSlots {
                    capacity,
                    picture_index,
                    timestamp,
                })?
            }
        };

        let generation = state.generation;
        if let Err(e) = fill(&mut buffer) {
            state.recycle(buffer, generation);
            return Err(e);
        }

        state.ready.push_back(ReadyFrame {
            buffer,
            generation,
            timestamp,
            picture_index,
        });

        Ok(())
    }

    fn wait_for_slot<'a>(
        &self,
        state: MutexGuard<'a, RingState>,
        timestamp: i64,
        picture_index: u32,
    ) -> Result<MutexGuard<'a, RingState>, DecodeError> {
        let out_of_slots = |state: &RingState| DecodeError::OutOfFrameSlots {
            capacity: state.capacity,
            picture_index,
            timestamp,
        };

        let timeout = match self.policy {
            BackpressurePolicy::Fail => return Err(out_of_slots(&state)),
            BackpressurePolicy::Block { .. } if !state.can_be_freed() => {
                log::debug!("All frame slots are queued, waiting would never end");
                return Err(out_of_slots(&state));
            }
            BackpressurePolicy::Block { timeout } => timeout,
        };

        log::debug!("Waiting for a frame slot to be unlocked");
        let state = match timeout {
            None => self
                .shared
                .slot_freed
                .wait_while(state, |s| !s.can_acquire())
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (state, result) = self
                    .shared
                    .slot_freed
                    .wait_timeout_while(state, timeout, |s| !s.can_acquire())
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() {
                    log::debug!("Timed out waiting for a frame slot");
                    return Err(out_of_slots(&state));
                }
                state
            }
        };

        Ok(state)
    }

    /// Hands all queued frames to the consumer, in the order they were queued.
    pub fn drain(&self) -> Vec<FrameLease> {
        let mut state = self.shared.lock();
        let ready = std::mem::take(&mut state.ready);
        let current = state.generation;
        state.leased += ready.iter().filter(|f| f.generation == current).count();
        drop(state);

        ready
            .into_iter()
            .map(|f| FrameLease {
                buffer: Some(f.buffer),
                generation: f.generation,
                timestamp: f.timestamp,
                picture_index: f.picture_index,
                shared: Arc::clone(&self.shared),
            })
            .collect()
    }

    /// Drops all queued frames, giving their slots back. Returns the number of frames dropped.
    pub fn discard_ready(&self) -> usize {
        let mut state = self.shared.lock();
        let ready = std::mem::take(&mut state.ready);
        let count = ready.len();
        for frame in ready {
            state.recycle(frame.buffer, frame.generation);
        }
        drop(state);

        self.shared.slot_freed.notify_all();
        count
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    pub fn frame_size(&self) -> usize {
        self.shared.lock().frame_size
    }

    /// Number of frames queued and not drained yet.
    pub fn num_ready(&self) -> usize {
        self.shared.lock().ready.len()
    }

    /// Number of current slots held by the consumer, leaked ones included.
    pub fn num_leased(&self) -> usize {
        self.shared.lock().leased
    }

    /// Number of allocated buffers waiting to be reused.
    pub fn num_free(&self) -> usize {
        self.shared.lock().free.len()
    }

    /// Number of buffers of the current frame size in existence.
    pub fn num_allocated(&self) -> usize {
        self.shared.lock().allocated
    }

    /// Total number of buffer allocations since creation.
    pub fn allocations(&self) -> u64 {
        self.shared.lock().allocations
    }

    /// Number of buffers of a previous frame size still queued or leased. They exist on top of
    /// [`FrameRing::capacity`] until they are given back.
    pub fn num_stale(&self) -> usize {
        self.shared.lock().stale
    }

    /// Number of leases dropped without being unlocked.
    pub fn leaked(&self) -> u64 {
        self.shared.lock().leaked
    }
}
