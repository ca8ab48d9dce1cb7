//! Joint termination coordinator.
//!
//! Stages may opt in to "joint termination": each declares itself done when
//! its own work is finished while continuing to pass packets through. The
//! pipeline ends once every opted-in stage has declared itself done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

#[derive(Default)]
struct JtState {
    opted_in: usize,
    done: usize,
}

/// Tracks opted-in stages and their completion.
pub struct JointTermination {
    ignore: bool,
    state: Mutex<JtState>,
    complete: AtomicBool,
}

impl JointTermination {
    /// Create a coordinator. With `ignore` set, completion is never
    /// reported (the `--ignore-joint-termination` behaviour).
    pub fn new(ignore: bool) -> Arc<Self> {
        Arc::new(JointTermination {
            ignore,
            state: Mutex::new(JtState::default()),
            complete: AtomicBool::new(false),
        })
    }

    /// Opt one stage in. Returns the handle through which the stage later
    /// declares itself done.
    pub fn opt_in(self: &Arc<Self>) -> JointHandle {
        self.state.lock().opted_in += 1;
        JointHandle {
            coordinator: Arc::clone(self),
            done: false,
        }
    }

    /// True once every opted-in stage has declared itself done (and at
    /// least one stage opted in).
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    fn declare_done(&self) {
        let mut state = self.state.lock();
        state.done += 1;
        debug!(
            "joint termination: {}/{} stages done",
            state.done, state.opted_in
        );
        if !self.ignore && state.opted_in > 0 && state.done >= state.opted_in {
            self.complete.store(true, Ordering::Release);
        }
    }
}

/// One stage's joint-termination handle.
pub struct JointHandle {
    coordinator: Arc<JointTermination>,
    done: bool,
}

impl JointHandle {
    /// Declare this stage done. Idempotent.
    pub fn terminate(&mut self) {
        if !self.done {
            self.done = true;
            self.coordinator.declare_done();
        }
    }

    /// True when this stage has already declared itself done.
    pub fn is_done(&self) -> bool {
        self.done
    }
}
