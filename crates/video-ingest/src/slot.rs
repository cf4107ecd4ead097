//! Single-slot, most-recent-wins handoff between the frame source and the detector.
//!
//! The slot holds at most one pending frame. Publishing overwrites (and thereby recycles)
//! whatever frame has not been claimed yet, and a frame can only be claimed while no other
//! claim is being processed. The claim, the completion and the check for a fresher frame
//! all happen under one lock, which is what keeps a single detection in flight.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::types::Frame;

struct SlotState {
    pending: Option<Frame>,
    in_flight: bool,
    active: bool,
    stats: SlotStats,
}

/// Counters describing how frames moved through the slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub published: u64,
    pub overwritten: u64,
    pub claimed: u64,
}

pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: None,
                in_flight: false,
                active: true,
                stats: SlotStats::default(),
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `frame` as the newest frame, recycling any frame nobody claimed.
    ///
    /// Never blocks on the consumer. Frames published after [`shutdown`](Self::shutdown)
    /// are recycled immediately.
    pub fn publish(&self, frame: Frame) {
        let stale = {
            let mut state = self.lock();
            if !state.active {
                Some(frame)
            } else {
                state.stats.published += 1;
                metrics::counter!("v2v_frames_published_total").increment(1);
                let stale = state.pending.replace(frame);
                if let Some(stale) = stale.as_ref() {
                    state.stats.overwritten += 1;
                    metrics::counter!("v2v_frames_dropped_total").increment(1);
                    trace!(frame = stale.sequence, "overwriting unclaimed frame");
                }
                stale
            }
        };
        self.ready.notify_all();
        drop(stale);
    }

    /// Claim the pending frame if no earlier claim is still being processed.
    pub fn claim_if_idle(&self) -> Option<Frame> {
        let mut state = self.lock();
        Self::claim_locked(&mut state)
    }

    /// Block until a frame can be claimed. Returns `None` once the slot is shut down.
    pub fn wait_claim(&self) -> Option<Frame> {
        let mut state = self.lock();
        loop {
            if !state.active {
                return None;
            }
            if let Some(frame) = Self::claim_locked(&mut state) {
                return Some(frame);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Mark the current claim as finished and atomically claim a fresher frame, if one
    /// arrived while the previous one was being processed.
    pub fn complete(&self) -> Option<Frame> {
        let mut state = self.lock();
        state.in_flight = false;
        let next = Self::claim_locked(&mut state);
        drop(state);
        self.ready.notify_all();
        next
    }

    /// Stop handing out frames, recycle the pending one and wake every waiter.
    pub fn shutdown(&self) {
        let pending = {
            let mut state = self.lock();
            state.active = false;
            state.pending.take()
        };
        self.ready.notify_all();
        drop(pending);
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn stats(&self) -> SlotStats {
        self.lock().stats
    }

    fn claim_locked(state: &mut SlotState) -> Option<Frame> {
        if state.in_flight || !state.active {
            return None;
        }
        let frame = state.pending.take()?;
        state.in_flight = true;
        state.stats.claimed += 1;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;
    use crate::{
        pool::BufferPool,
        types::{FrameFormat, Rotation},
    };

    fn frame(pool: &BufferPool, sequence: u64) -> Frame {
        Frame {
            data: pool.acquire().expect("pool has a free buffer"),
            width: 4,
            height: 4,
            rotation: Rotation::Deg0,
            timestamp_ms: sequence as i64,
            sequence,
            format: FrameFormat::Nv21,
        }
    }

    #[test]
    fn overwritten_frames_go_back_to_the_pool() {
        let pool = BufferPool::new(24, 4);
        let slot = FrameSlot::new();
        slot.publish(frame(&pool, 1));
        slot.publish(frame(&pool, 2));
        slot.publish(frame(&pool, 3));

        assert_eq!(pool.returned_total(), 2);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(slot.stats().overwritten, 2);

        let claimed = slot.claim_if_idle().expect("newest frame");
        assert_eq!(claimed.sequence, 3);
    }

    #[test]
    fn claim_is_refused_while_a_frame_is_in_flight() {
        let pool = BufferPool::new(24, 4);
        let slot = FrameSlot::new();
        slot.publish(frame(&pool, 1));
        let first = slot.claim_if_idle().expect("first claim");

        slot.publish(frame(&pool, 2));
        assert!(slot.claim_if_idle().is_none());
        assert!(slot.has_pending());

        drop(first);
        let next = slot.complete().expect("fresher frame picked up on completion");
        assert_eq!(next.sequence, 2);
        assert!(slot.is_in_flight());
        assert!(slot.complete().is_none());
        assert!(!slot.is_in_flight());
    }

    #[test]
    fn shutdown_wakes_a_blocked_consumer() {
        let slot = Arc::new(FrameSlot::new());
        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.wait_claim().map(|frame| frame.sequence))
        };
        thread::sleep(Duration::from_millis(20));
        slot.shutdown();
        assert_eq!(waiter.join().expect("waiter thread"), None);
    }

    #[test]
    fn frames_published_after_shutdown_are_recycled() {
        let pool = BufferPool::new(24, 2);
        let slot = FrameSlot::new();
        slot.shutdown();
        slot.publish(frame(&pool, 1));
        assert_eq!(pool.outstanding(), 0);
        assert!(slot.claim_if_idle().is_none());
    }
}
