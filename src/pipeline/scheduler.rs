//! Single-slot admission control in front of the detector
//!
//! At most one frame is in flight to the detector and at most one more waits
//! behind it. A submission that arrives while a frame is in flight replaces
//! whatever was waiting, so the frame taken up next is always the newest one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use tracing::trace;

use crate::capture::CorrectedFrame;

/// Where admitted frames go
pub trait FrameSink: Send + Sync {
    fn dispatch(&self, frame: CorrectedFrame);
}

/// What `submit` did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Handed straight to the sink
    Dispatched,
    /// Parked in the empty pending slot
    Queued,
    /// Parked, evicting an older pending frame
    Replaced,
    /// Scheduler closed; frame dropped
    Closed,
}

/// Pending slot and in-flight flag, always updated together
#[derive(Debug, Default)]
struct SlotState {
    in_flight: bool,
    pending: Option<CorrectedFrame>,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    superseded: AtomicU64,
}

/// Point-in-time scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub superseded: u64,
}

pub struct FrameScheduler<S> {
    slot: Mutex<SlotState>,
    sink: S,
    stats: CachePadded<Stats>,
}

impl<S: FrameSink> FrameScheduler<S> {
    pub fn new(sink: S) -> Self {
        Self {
            slot: Mutex::new(SlotState::default()),
            sink,
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a frame. Never blocks beyond the slot update.
    pub fn submit(&self, frame: CorrectedFrame) -> Admission {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let superseded = {
            let mut slot = self.lock();
            if slot.closed {
                return Admission::Closed;
            }
            if !slot.in_flight {
                slot.in_flight = true;
                drop(slot);
                self.send(frame);
                return Admission::Dispatched;
            }
            slot.pending.replace(frame)
        };

        match superseded {
            Some(stale) => {
                self.stats.superseded.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_superseded").increment(1);
                trace!(seq = stale.info().sequence, "pending frame superseded");
                drop(stale);
                Admission::Replaced
            }
            None => Admission::Queued,
        }
    }

    /// Called once the in-flight frame is finished with, whatever the outcome.
    /// Dispatches the pending frame if there is one, otherwise goes idle.
    pub fn complete(&self) {
        let next = {
            let mut slot = self.lock();
            let next = slot.pending.take();
            if next.is_none() {
                slot.in_flight = false;
            }
            next
        };

        if let Some(frame) = next {
            self.send(frame);
        }
    }

    /// Stop admitting frames and drop the pending one
    pub fn close(&self) {
        let pending = {
            let mut slot = self.lock();
            slot.closed = true;
            slot.pending.take()
        };
        drop(pending);
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            superseded: self.stats.superseded.load(Ordering::Relaxed),
        }
    }

    fn send(&self, frame: CorrectedFrame) {
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_dispatched").increment(1);
        trace!(seq = frame.info().sequence, "dispatching frame");
        self.sink.dispatch(frame);
    }
}
