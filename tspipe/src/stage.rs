//! The stage contract: lifecycle, the three stage kinds, and the per-stage
//! link to shared pipeline services.

use std::sync::Arc;

use log::error;

use crate::error::StageError;
use crate::pipeline::{JointHandle, PipelineShared};
use crate::ts::TsPacket;

/// Per-packet verdict of a processor stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Keep the packet.
    Ok,
    /// Replace the packet with stuffing.
    Null,
    /// Replace the packet with stuffing; downstream stages may skip it.
    /// At the wire level this is identical to [`Status::Null`].
    Drop,
    /// Terminate the whole pipeline cleanly after this packet.
    End,
}

/// Per-packet in/out flags exchanged between a processor and its worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketContext {
    /// Out: deliver this packet and everything before it promptly.
    pub flush: bool,
    /// In/out: the published TS bitrate changed at this packet.
    pub bitrate_changed: bool,
}

/// A stage's view of the shared pipeline services.
///
/// Cloned per stage; stages keep it from `start()` on.
#[derive(Clone)]
pub struct StageLink {
    shared: Arc<PipelineShared>,
    name: Arc<str>,
    realtime: bool,
}

impl StageLink {
    pub(crate) fn new(shared: Arc<PipelineShared>, name: &str, realtime: bool) -> Self {
        StageLink {
            shared,
            name: Arc::from(name),
            realtime,
        }
    }

    /// Name of the stage this link belongs to.
    pub fn stage_name(&self) -> &str {
        &self.name
    }

    /// Current TS bitrate in b/s, 0 when unknown.
    pub fn bitrate(&self) -> u64 {
        self.shared.bitrate.get()
    }

    /// True when the pipeline runs with real-time defaults.
    pub fn realtime(&self) -> bool {
        self.realtime
    }

    /// Opt this stage in to joint termination.
    pub fn opt_in_joint_termination(&self) -> JointHandle {
        self.shared.joint.opt_in()
    }

    /// Record a fatal stage error. The first recorded error becomes the
    /// pipeline's exit error; the stage should then return
    /// [`Status::End`] (or an `Err`) to stop the pipeline.
    pub fn fail(&self, err: StageError) {
        error!("{}: {err}", self.name);
        self.shared.record_error(&self.name, err);
    }
}

/// Lifecycle shared by every stage kind.
pub trait Stage: Send {
    /// Configure the stage. Runs before any packet flows; a failure aborts
    /// the pipeline before startup completes.
    fn start(&mut self, link: &StageLink) -> Result<(), StageError>;

    /// Flush buffers and release resources. Runs after the stage's worker
    /// has drained.
    fn stop(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

/// A packet source.
pub trait InputStage: Stage {
    /// Fill `buf` with packets. Returns the number produced, at most
    /// `buf.len()`; zero means end of stream.
    fn receive(&mut self, buf: &mut [TsPacket]) -> Result<usize, StageError>;
}

/// An in-place packet transformer.
pub trait ProcessorStage: Stage {
    /// Inspect or mutate one packet.
    fn process(&mut self, pkt: &mut TsPacket, ctx: &mut PacketContext) -> Status;
}

/// A packet sink.
pub trait OutputStage: Stage {
    /// Write one batch of packets.
    fn send(&mut self, pkts: &[TsPacket]) -> Result<(), StageError>;
}

/// A constructed stage, ready to be placed in the chain.
pub enum Plugin {
    /// Packet source.
    Input(Box<dyn InputStage>),
    /// In-place transformer.
    Processor(Box<dyn ProcessorStage>),
    /// Packet sink.
    Output(Box<dyn OutputStage>),
}

impl Plugin {
    /// Kind name used in listings and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Plugin::Input(_) => "input",
            Plugin::Processor(_) => "packet",
            Plugin::Output(_) => "output",
        }
    }
}
