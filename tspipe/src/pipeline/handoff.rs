//! Boundary handoff between two adjacent stages.
//!
//! A handoff carries the count of packets offered by the upstream stage and
//! not yet taken downstream. The chain of handoffs is circular: the output
//! stage's released slots are offered back to the input stage as writable
//! slots. Cursor updates happen under the boundary mutex; the condition
//! variable wakes the downstream waiter.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

struct HandoffState {
    /// Ring index of the first offered slot.
    head: usize,
    /// Number of offered slots not yet taken.
    count: usize,
    /// A flush boundary is pending: wake the waiter below its minimum.
    flush: bool,
    /// Upstream has finished; no further offers will come.
    closed: bool,
}

/// Result of a [`Handoff::wait`] call.
#[derive(Debug, Clone, Copy)]
pub struct Take {
    /// Ring index of the first taken slot.
    pub start: usize,
    /// Number of slots taken (possibly zero).
    pub count: usize,
    /// No packets were taken and none will ever come: upstream closed and
    /// the boundary is drained.
    pub end_of_stream: bool,
}

/// One boundary between adjacent stages.
pub struct Handoff {
    capacity: usize,
    state: Mutex<HandoffState>,
    ready: Condvar,
}

impl Handoff {
    /// Create a boundary over a ring of `capacity` slots, with `initial`
    /// slots already offered starting at index 0. The boundary in front of
    /// the input stage starts with the whole ring; every other boundary
    /// starts empty.
    pub fn new(capacity: usize, initial: usize) -> Self {
        Handoff {
            capacity,
            state: Mutex::new(HandoffState {
                head: 0,
                count: initial,
                flush: false,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Offer `count` slots to the downstream stage. With `flush`, the
    /// waiter is released even below its minimum threshold.
    pub fn offer(&self, count: usize, flush: bool) {
        if count == 0 && !flush {
            return;
        }
        let mut state = self.state.lock();
        state.count += count;
        debug_assert!(state.count <= self.capacity);
        state.flush |= flush;
        self.ready.notify_all();
    }

    /// Signal that no further offers will come.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    /// Wake the waiter so it can re-check the stop flag.
    pub fn kick(&self) {
        let _state = self.state.lock();
        self.ready.notify_all();
    }

    /// Block until at least `min` slots are offered (or the boundary is
    /// flushed, closed, or `stop` is raised), then take up to `max` slots.
    /// The take never crosses the ring's physical end; callers loop on
    /// wraps.
    pub fn wait(&self, min: usize, max: usize, stop: &AtomicBool) -> Take {
        let mut state = self.state.lock();
        loop {
            if state.count >= min.max(1) || state.flush || state.closed {
                break;
            }
            if stop.load(Ordering::Acquire) {
                // Shutdown in progress: the upstream close is imminent.
                // A bounded wait keeps the drain loop from spinning.
                let timeout = std::time::Duration::from_millis(10);
                if self.ready.wait_for(&mut state, timeout).timed_out() {
                    break;
                }
            } else {
                self.ready.wait(&mut state);
            }
        }

        let n = state
            .count
            .min(max)
            .min(self.capacity - state.head);
        let start = state.head;
        state.head = (state.head + n) % self.capacity;
        state.count -= n;
        if state.count == 0 {
            state.flush = false;
        }

        Take {
            start,
            count: n,
            end_of_stream: n == 0 && state.count == 0 && state.closed,
        }
    }
}
