//! `drop` output stage: discards every packet.

use clap::Parser;

use crate::error::StageError;
use crate::stage::{OutputStage, Stage, StageLink};
use crate::ts::TsPacket;

/// Discard all packets
#[derive(Debug, Parser)]
#[command(name = "drop", version, about = "Discard all packets")]
pub struct DropArgs {}

/// The `drop` output stage.
pub struct DropOutput;

impl DropOutput {
    /// Build the stage from parsed options.
    pub fn new(_args: DropArgs) -> Self {
        DropOutput
    }
}

impl Stage for DropOutput {
    fn start(&mut self, _link: &StageLink) -> Result<(), StageError> {
        Ok(())
    }
}

impl OutputStage for DropOutput {
    fn send(&mut self, _pkts: &[TsPacket]) -> Result<(), StageError> {
        Ok(())
    }
}
