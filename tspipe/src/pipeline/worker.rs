//! Stage worker loops.
//!
//! Each worker drives one stage on its own thread: it acquires a slot run
//! from its upstream boundary, lets the stage produce/transform/consume the
//! packets, and passes the run to the downstream boundary. Workers exit
//! when their upstream boundary is closed and drained, or after their stage
//! ends the pipeline; every exit path closes the downstream boundary so
//! termination cascades around the ring.

use std::sync::Arc;

use log::{debug, trace};

use super::handoff::Handoff;
use super::ring::PacketRing;
use super::PipelineShared;
use crate::bitrate::BitrateMonitor;
use crate::stage::{InputStage, OutputStage, PacketContext, ProcessorStage, Status};
use crate::ts::TsPacket;

/// Input stuffing configuration (the `-a` / `--add-*-stuffing` options).
#[derive(Debug, Clone, Copy, Default)]
pub struct StuffingConfig {
    /// Insert `nullpkt` null packets every `inpkt` input packets.
    pub nullpkt: u64,
    /// See `nullpkt`; zero disables inter-packet stuffing.
    pub inpkt: u64,
    /// Null packets prepended before the first input packet.
    pub start: u64,
    /// Null packets appended after the end of input.
    pub stop: u64,
}

/// Worker around the input stage.
pub struct InputWorker {
    pub shared: Arc<PipelineShared>,
    pub ring: Arc<PacketRing>,
    /// Free slots recycled from the output stage.
    pub free: Arc<Handoff>,
    /// Packets offered to the first downstream stage.
    pub downstream: Arc<Handoff>,
    pub stage: Box<dyn InputStage>,
    pub name: String,
    pub monitor: BitrateMonitor,
    pub max_input_pkt: usize,
    pub stuffing: StuffingConfig,
}

impl InputWorker {
    pub fn run(mut self) {
        let mut start_left = self.stuffing.start;
        let mut stuff_pending = 0u64;
        let mut until_stuff = self.stuffing.inpkt;
        let mut eof = false;

        'outer: while !eof {
            let take = self
                .free
                .wait(1, self.max_input_pkt, &self.shared.stop);
            if self.shared.stopping() {
                break;
            }
            if take.count == 0 {
                if take.end_of_stream {
                    break;
                }
                continue;
            }

            // The coordinator completing is observed here as end of stream.
            if self.shared.joint.is_complete() {
                debug!("{}: joint termination complete", self.name);
                eof = true;
            }

            let slots = unsafe { self.ring.packets_mut(take.start, take.count) };
            let mut produced = 0;

            while produced < slots.len() && !eof {
                // Stuffing packets synthesised ahead of real input.
                if start_left > 0 || stuff_pending > 0 {
                    slots[produced] = TsPacket::null();
                    if start_left > 0 {
                        start_left -= 1;
                    } else {
                        stuff_pending -= 1;
                    }
                    produced += 1;
                    continue;
                }

                let mut want = slots.len() - produced;
                if self.stuffing.inpkt > 0 {
                    want = want.min(until_stuff as usize);
                }
                let n = match self.stage.receive(&mut slots[produced..produced + want]) {
                    Ok(n) => n,
                    Err(err) => {
                        self.shared.record_error(&self.name, err);
                        break 'outer;
                    }
                };
                if n == 0 {
                    eof = true;
                    break;
                }
                produced += n;
                if self.stuffing.inpkt > 0 {
                    until_stuff -= n as u64;
                    if until_stuff == 0 {
                        stuff_pending = self.stuffing.nullpkt;
                        until_stuff = self.stuffing.inpkt;
                    }
                }
            }

            for i in 0..produced {
                let index = take.start + i;
                let changed = {
                    let pkt = unsafe { self.ring.packet_mut(index) };
                    self.monitor.feed(pkt, &self.shared.bitrate)
                };
                let meta = unsafe { self.ring.meta_mut(index) };
                meta.flush = false;
                meta.bitrate_changed = changed;
            }

            // Unused tail of the take stays ours; at end of stream it is
            // simply abandoned with the rest of the ring.
            self.downstream.offer(produced, eof);
            trace!("{}: produced {produced} packets", self.name);
        }

        if eof {
            self.append_stop_stuffing();
        }
        self.downstream.close();
        if let Err(err) = self.stage.stop() {
            self.shared.record_error(&self.name, err);
        }
        debug!("{}: input worker done", self.name);
    }

    fn append_stop_stuffing(&mut self) {
        let mut left = self.stuffing.stop;
        while left > 0 && !self.shared.stopping() {
            let take = self.free.wait(1, left as usize, &self.shared.stop);
            if take.count == 0 {
                if take.end_of_stream {
                    return;
                }
                continue;
            }
            let slots = unsafe { self.ring.packets_mut(take.start, take.count) };
            for (i, slot) in slots.iter_mut().enumerate() {
                *slot = TsPacket::null();
                let meta = unsafe { self.ring.meta_mut(take.start + i) };
                meta.flush = false;
                meta.bitrate_changed = false;
            }
            left -= take.count as u64;
            self.downstream.offer(take.count, false);
        }
    }
}

/// Worker around one processor stage.
pub struct ProcessorWorker {
    pub shared: Arc<PipelineShared>,
    pub ring: Arc<PacketRing>,
    pub upstream: Arc<Handoff>,
    pub downstream: Arc<Handoff>,
    pub stage: Box<dyn ProcessorStage>,
    pub name: String,
    pub max_flush_pkt: usize,
}

impl ProcessorWorker {
    pub fn run(mut self) {
        'outer: loop {
            let take = self
                .upstream
                .wait(1, self.max_flush_pkt, &self.shared.stop);
            if take.count == 0 {
                if take.end_of_stream {
                    break;
                }
                // Stop requested while upstream is still open: its close
                // is on the way, keep draining.
                continue;
            }

            let mut offered = 0;
            for i in 0..take.count {
                let index = take.start + i;
                let pkt = unsafe { self.ring.packet_mut(index) };
                let meta = unsafe { self.ring.meta_mut(index) };
                let mut ctx = PacketContext {
                    flush: false,
                    bitrate_changed: meta.bitrate_changed,
                };

                let status = self.stage.process(pkt, &mut ctx);
                meta.flush = ctx.flush;
                meta.bitrate_changed = ctx.bitrate_changed;

                match status {
                    Status::Ok => {}
                    Status::Null | Status::Drop => *pkt = TsPacket::null(),
                    Status::End => {
                        self.downstream.offer(i + 1 - offered, true);
                        self.shared.request_stop();
                        break 'outer;
                    }
                }

                if ctx.flush {
                    self.downstream.offer(i + 1 - offered, true);
                    offered = i + 1;
                }
            }
            if take.count > offered {
                self.downstream.offer(take.count - offered, false);
            }
        }

        self.downstream.close();
        if let Err(err) = self.stage.stop() {
            self.shared.record_error(&self.name, err);
        }
        debug!("{}: processor worker done", self.name);
    }
}

/// Worker around the output stage.
pub struct OutputWorker {
    pub shared: Arc<PipelineShared>,
    pub ring: Arc<PacketRing>,
    pub upstream: Arc<Handoff>,
    /// Consumed slots recycled to the input stage.
    pub free: Arc<Handoff>,
    pub stage: Box<dyn OutputStage>,
    pub name: String,
    pub max_flush_pkt: usize,
}

impl OutputWorker {
    pub fn run(mut self) {
        loop {
            let take = self
                .upstream
                .wait(1, self.max_flush_pkt, &self.shared.stop);
            if take.count == 0 {
                if take.end_of_stream {
                    break;
                }
                continue;
            }

            let pkts = unsafe { self.ring.packets_mut(take.start, take.count) };
            if let Err(err) = self.stage.send(pkts) {
                self.shared.record_error(&self.name, err);
                break;
            }
            self.free.offer(take.count, false);
        }

        self.free.close();
        if let Err(err) = self.stage.stop() {
            self.shared.record_error(&self.name, err);
        }
        debug!("{}: output worker done", self.name);
    }
}
