//! The pipeline engine: shared ring, boundary handoffs, stage workers and
//! the controller that wires them together.
//!
//! Thread model: one OS thread per stage (input, each processor, output).
//! The ring buffer is the only packet channel; each boundary between
//! adjacent stages is a [`Handoff`]. The chain of boundaries is circular,
//! so slots released by the output stage become writable slots for the
//! input stage.

mod controller;
mod handoff;
mod joint;
mod ring;
mod worker;

pub use controller::{run_pipeline, Pipeline, PipelineConfig};
pub use handoff::{Handoff, Take};
pub use joint::{JointHandle, JointTermination};
pub use ring::{PacketRing, SlotMeta};
pub use worker::StuffingConfig;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bitrate::BitrateCell;
use crate::error::{PipelineError, StageError};

/// State shared by every worker thread of one pipeline run.
pub struct PipelineShared {
    /// Cooperative stop flag, observed at every handoff.
    pub stop: AtomicBool,
    /// Published TS bitrate.
    pub bitrate: BitrateCell,
    /// Joint termination coordinator.
    pub joint: Arc<JointTermination>,
    /// First error recorded by any stage.
    error: Mutex<Option<PipelineError>>,
    /// Every boundary, for stop-flag wakeups.
    handoffs: Mutex<Vec<Arc<Handoff>>>,
}

impl PipelineShared {
    /// Create the shared state for one run.
    pub fn new(ignore_joint_termination: bool) -> Arc<Self> {
        Arc::new(PipelineShared {
            stop: AtomicBool::new(false),
            bitrate: BitrateCell::new(),
            joint: JointTermination::new(ignore_joint_termination),
            error: Mutex::new(None),
            handoffs: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn register_handoff(&self, handoff: Arc<Handoff>) {
        self.handoffs.lock().push(handoff);
    }

    /// Raise the stop flag and wake every blocked worker.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        for handoff in self.handoffs.lock().iter() {
            handoff.kick();
        }
    }

    /// True once a stop has been requested.
    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Record a stage error (first one wins) and request a stop.
    pub fn record_error(&self, stage: &str, err: StageError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(PipelineError::new(stage, err));
        }
        drop(slot);
        self.request_stop();
    }

    /// Take the recorded error, if any.
    pub fn take_error(&self) -> Option<PipelineError> {
        self.error.lock().take()
    }
}
