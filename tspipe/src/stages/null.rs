//! `null` input stage: generates stuffing packets.

use clap::Parser;

use crate::error::StageError;
use crate::pipeline::JointHandle;
use crate::stage::{InputStage, Stage, StageLink};
use crate::ts::TsPacket;

/// Generate null packets
#[derive(Debug, Parser)]
#[command(name = "null", version, about = "Generate null packets")]
pub struct NullArgs {
    /// Number of null packets to generate; endless when omitted
    #[arg(value_name = "COUNT")]
    pub count: Option<u64>,

    /// Declare joint termination instead of ending when the count is
    /// reached
    #[arg(short = 'j', long)]
    pub joint_termination: bool,
}

/// The `null` input stage.
pub struct NullInput {
    args: NullArgs,
    max_count: u64,
    count: u64,
    joint: Option<JointHandle>,
}

impl NullInput {
    /// Build the stage from parsed options.
    pub fn new(args: NullArgs) -> Self {
        NullInput {
            args,
            max_count: 0,
            count: 0,
            joint: None,
        }
    }
}

impl Stage for NullInput {
    fn start(&mut self, link: &StageLink) -> Result<(), StageError> {
        self.max_count = self.args.count.unwrap_or(u64::MAX);
        self.count = 0;
        if self.args.joint_termination {
            self.joint = Some(link.opt_in_joint_termination());
        }
        Ok(())
    }
}

impl InputStage for NullInput {
    fn receive(&mut self, buf: &mut [TsPacket]) -> Result<usize, StageError> {
        // When the count is reached with joint termination, declare done
        // and keep generating until the rest of the pipeline completes.
        if self.count >= self.max_count {
            if let Some(joint) = self.joint.as_mut() {
                joint.terminate();
                self.max_count = u64::MAX;
            }
        }

        let mut n = 0;
        while n < buf.len() && self.count < self.max_count {
            buf[n] = TsPacket::null();
            n += 1;
            self.count += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineShared;
    use std::sync::Arc;

    fn link() -> StageLink {
        StageLink::new(PipelineShared::new(false), "null", false)
    }

    #[test]
    fn test_bounded_count() {
        let args = NullArgs::try_parse_from(["null", "1000"]).unwrap();
        let mut stage = NullInput::new(args);
        stage.start(&link()).unwrap();

        let mut buf = vec![TsPacket::null(); 600];
        assert_eq!(stage.receive(&mut buf).unwrap(), 600);
        assert_eq!(stage.receive(&mut buf).unwrap(), 400);
        assert_eq!(stage.receive(&mut buf).unwrap(), 0);
        assert!(buf[0].is_null());
    }

    #[test]
    fn test_joint_termination_keeps_producing() {
        let shared = PipelineShared::new(false);
        let link = StageLink::new(Arc::clone(&shared), "null", false);
        let args = NullArgs::try_parse_from(["null", "-j", "10"]).unwrap();
        let mut stage = NullInput::new(args);
        stage.start(&link).unwrap();

        let mut buf = vec![TsPacket::null(); 10];
        assert_eq!(stage.receive(&mut buf).unwrap(), 10);
        assert!(!shared.joint.is_complete());
        // The count is exhausted: the stage declares done but stays alive.
        assert_eq!(stage.receive(&mut buf).unwrap(), 10);
        assert!(shared.joint.is_complete());
    }

    #[test]
    fn test_endless_by_default() {
        let args = NullArgs::try_parse_from(["null"]).unwrap();
        let mut stage = NullInput::new(args);
        stage.start(&link()).unwrap();

        let mut buf = vec![TsPacket::null(); 100];
        assert_eq!(stage.receive(&mut buf).unwrap(), 100);
    }
}
