//! `pass` processor stage: forwards every packet unchanged.
//!
//! Doubles as the template for new processor stages and as the no-op
//! placeholder when an option combination leaves a stage with nothing to
//! do.

use clap::Parser;

use crate::error::StageError;
use crate::stage::{PacketContext, ProcessorStage, Stage, StageLink, Status};
use crate::ts::TsPacket;

/// Pass packets through unchanged
#[derive(Debug, Parser)]
#[command(name = "pass", version, about = "Pass packets through unchanged")]
pub struct PassArgs {}

/// The `pass` processor stage.
pub struct Pass;

impl Pass {
    /// Build the stage from parsed options.
    pub fn new(_args: PassArgs) -> Self {
        Pass
    }
}

impl Stage for Pass {
    fn start(&mut self, _link: &StageLink) -> Result<(), StageError> {
        Ok(())
    }
}

impl ProcessorStage for Pass {
    fn process(&mut self, _pkt: &mut TsPacket, _ctx: &mut PacketContext) -> Status {
        Status::Ok
    }
}
