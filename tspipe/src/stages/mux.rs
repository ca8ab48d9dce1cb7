//! `mux` processor stage: inserts packets from an auxiliary file into the
//! stuffing of the live stream.

use std::path::PathBuf;

use clap::Parser;
use log::debug;

use super::file::TsFileReader;
use super::parse_pid;
use crate::error::StageError;
use crate::pipeline::JointHandle;
use crate::stage::{PacketContext, ProcessorStage, Stage, StageLink, Status};
use crate::ts::{pid, TsPacket, CC_MASK, PID_MAX, PKT_SIZE, SYSTEM_CLOCK_SUBFACTOR};
use crate::ts::PidSet;

/// Insert packets from a file into stuffing
#[derive(Debug, Parser)]
#[command(
    name = "mux",
    version,
    about = "Insert TS packets from a file in the transport stream"
)]
pub struct MuxArgs {
    /// Binary file containing 188-byte transport packets
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Bitrate for the inserted packets, in bits/second; by default every
    /// stuffing packet is replaced
    #[arg(short, long, conflicts_with_all = ["inter_packet", "inter_time"])]
    pub bitrate: Option<u64>,

    /// Start reading the file at this byte offset
    #[arg(long, conflicts_with = "packet_offset")]
    pub byte_offset: Option<u64>,

    /// Number of TS packets between two inserted packets
    #[arg(short, long, conflicts_with = "inter_time")]
    pub inter_packet: Option<u64>,

    /// Minimum milliseconds between insertions, gated by the PTS clock of
    /// --pts-pid
    #[arg(long)]
    pub inter_time: Option<u64>,

    /// Declare joint termination when the file insertion completes
    #[arg(short = 'j', long, conflicts_with = "terminate")]
    pub joint_termination: bool,

    /// Stop inserting after this number of packets
    #[arg(long)]
    pub max_insert_count: Option<u64>,

    /// Stop inserting when this PTS time has passed on --pts-pid
    #[arg(long)]
    pub max_pts: Option<u64>,

    /// Start inserting when this PTS time has passed on --pts-pid
    #[arg(long)]
    pub min_pts: Option<u64>,

    /// Do not rewrite continuity counters in the inserted packets
    #[arg(long)]
    pub no_continuity_update: bool,

    /// Do not abort when an inserted PID already exists in the stream
    #[arg(long)]
    pub no_pid_conflict_check: bool,

    /// Start reading the file at this packet index
    #[arg(long)]
    pub packet_offset: Option<u64>,

    /// Force the PID value of all inserted packets
    #[arg(short, long, value_parser = parse_pid)]
    pub pid: Option<u16>,

    /// PID carrying the PCR or PTS clock for --min-pts, --max-pts and
    /// --inter-time; latched to the first PCR-bearing PID when omitted
    #[arg(long, value_parser = parse_pid)]
    pub pts_pid: Option<u16>,

    /// Repeat the file playout this number of times; endless by default
    #[arg(short, long)]
    pub repeat: Option<u64>,

    /// Terminate the pipeline when the file insertion completes
    #[arg(short, long)]
    pub terminate: bool,
}

/// The `mux` processor stage.
pub struct Mux {
    args: MuxArgs,
    link: Option<StageLink>,
    joint: Option<JointHandle>,
    file: Option<TsFileReader>,
    ts_pids: PidSet,
    cc: Vec<u8>,
    inter_pkt: u64,
    pid_next_pkt: u64,
    packet_count: u64,
    inter_time: u64,
    pts_pid: Option<u16>,
    pts_range_ok: bool,
    inserted_packet_count: u64,
    youngest_pts: u64,
    pts_last_inserted: u64,
}

impl Mux {
    /// Build the stage from parsed options.
    pub fn new(args: MuxArgs) -> Self {
        Mux {
            args,
            link: None,
            joint: None,
            file: None,
            ts_pids: PidSet::new(),
            cc: vec![0; PID_MAX],
            inter_pkt: 0,
            pid_next_pkt: 0,
            packet_count: 0,
            inter_time: 0,
            pts_pid: None,
            pts_range_ok: true,
            inserted_packet_count: 0,
            youngest_pts: 0,
            pts_last_inserted: 0,
        }
    }

    // End-of-file policy: declare joint termination, end the pipeline, or
    // become transparent.
    fn on_file_exhausted(&mut self) -> Status {
        if self.args.joint_termination {
            if let Some(joint) = self.joint.as_mut() {
                joint.terminate();
            }
            Status::Ok
        } else if self.args.terminate {
            Status::End
        } else {
            Status::Ok
        }
    }
}

impl Stage for Mux {
    fn start(&mut self, link: &StageLink) -> Result<(), StageError> {
        self.link = Some(link.clone());
        if self.args.joint_termination {
            self.joint = Some(link.opt_in_joint_termination());
        }

        self.ts_pids.reset();
        self.cc.fill(0);
        self.packet_count = 0;
        self.pid_next_pkt = 0;
        self.inserted_packet_count = 0;
        self.youngest_pts = 0;
        self.pts_last_inserted = 0;
        self.inter_pkt = self.args.inter_packet.unwrap_or(0);
        self.inter_time = self.args.inter_time.unwrap_or(0) * 90;
        self.pts_pid = self.args.pts_pid;

        // Insertion is enabled by default; a --min-pts window starts closed
        // until the window opens.
        self.pts_range_ok = self.args.min_pts.is_none();

        let offset = self
            .args
            .byte_offset
            .or(self.args.packet_offset.map(|p| p * PKT_SIZE as u64))
            .unwrap_or(0);
        self.file = Some(TsFileReader::open(
            &self.args.file,
            self.args.repeat.unwrap_or(0),
            offset,
        )?);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StageError> {
        debug!("inserted {} packets", self.inserted_packet_count);
        self.file = None;
        Ok(())
    }
}

impl ProcessorStage for Mux {
    fn process(&mut self, pkt: &mut TsPacket, _ctx: &mut PacketContext) -> Status {
        let link = match self.link.as_ref() {
            Some(link) => link.clone(),
            None => return Status::End,
        };

        // Compute the packet interval from the TS bitrate, once.
        if self.packet_count == 0 {
            if let Some(bitrate) = self.args.bitrate {
                let ts_bitrate = link.bitrate();
                if ts_bitrate < bitrate {
                    link.fail(StageError::Runtime(
                        "input bitrate unknown or too low, specify --inter-packet instead of --bitrate"
                            .into(),
                    ));
                    return Status::End;
                }
                self.inter_pkt = ts_bitrate / bitrate;
                debug!(
                    "transport bitrate: {ts_bitrate} b/s, packet interval: {}",
                    self.inter_pkt
                );
            }
        }

        self.packet_count += 1;
        let mut current_pid = pkt.pid();
        let mut current_pts = 0u64;

        // Track the reference clock: PTS on the reference PID, or PCR/300
        // on the first PCR-bearing PID when no reference was given.
        if self.pts_pid == Some(current_pid) && pkt.has_pts() {
            current_pts = pkt.pts();
        } else if (self.pts_pid.is_none() || self.pts_pid == Some(current_pid))
            && pkt.has_pcr()
            && current_pid != pid::NULL
        {
            self.pts_pid = Some(current_pid);
            current_pts = pkt.pcr() / SYSTEM_CLOCK_SUBFACTOR;
        }

        if current_pts > 0 {
            self.youngest_pts = current_pts;

            if let Some(min_pts) = self.args.min_pts {
                if current_pts > min_pts && self.args.max_pts.map_or(true, |max| current_pts < max)
                {
                    if !self.pts_range_ok {
                        debug!("PTS window open at {current_pts}, enabling packet insertion");
                    }
                    self.pts_range_ok = true;
                }
            }

            // The inter-time gate reopens once enough PTS time has passed
            // since the last insertion.
            if self.inter_time != 0 && self.pts_last_inserted != 0 {
                self.pts_range_ok = self.youngest_pts > self.pts_last_inserted + self.inter_time;
            }

            if let Some(max_pts) = self.args.max_pts {
                if current_pts > max_pts {
                    debug!("max PTS {max_pts} passed at {current_pts}, disabling packet insertion");
                    self.pts_range_ok = false;
                }
            }
        }

        // Non-stuffing is transparently passed.
        if current_pid != pid::NULL {
            self.ts_pids.set(current_pid);
            return Status::Ok;
        }

        // Not yet time to insert: transmit the stuffing unchanged.
        if self.packet_count < self.pid_next_pkt {
            return Status::Ok;
        }
        if !self.pts_range_ok {
            return Status::Ok;
        }
        if let Some(max) = self.args.max_insert_count {
            if self.inserted_packet_count >= max {
                return Status::Ok;
            }
        }

        // Overwrite the stuffing slot with the next file packet.
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Status::End,
        };
        match file.read(std::slice::from_mut(pkt)) {
            Ok(0) => return self.on_file_exhausted(),
            Ok(_) => {}
            Err(err) => {
                link.fail(err);
                return Status::End;
            }
        }

        self.inserted_packet_count += 1;
        self.pts_last_inserted = self.youngest_pts;
        if self.inter_time != 0 {
            self.pts_range_ok = false;
        }

        if let Some(forced) = self.args.pid {
            pkt.set_pid(forced);
        }
        current_pid = pkt.pid();
        if !self.args.no_pid_conflict_check && self.ts_pids.test(current_pid) {
            link.fail(StageError::Runtime(format!(
                "PID {current_pid} (0x{current_pid:04X}) already exists in TS, specify --pid with another value, aborting"
            )));
            return Status::End;
        }
        if !self.args.no_continuity_update {
            pkt.set_cc(self.cc[current_pid as usize]);
            self.cc[current_pid as usize] = (self.cc[current_pid as usize] + 1) & CC_MASK;
        }

        self.pid_next_pkt = self.packet_count + self.inter_pkt;
        Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineShared;
    use crate::ts::test_support::{data_packet, pcr_packet, pes_packet};
    use std::path::Path;
    use std::sync::Arc;

    fn write_side_file(path: &Path, count: usize, pid: u16) {
        let mut bytes = Vec::new();
        for i in 0..count {
            bytes.extend_from_slice(data_packet(pid, i as u8 % 16).bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn temp_side_file(tag: &str, count: usize, pid: u16) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tspipe-mux-test-{tag}-{}",
            std::process::id()
        ));
        write_side_file(&path, count, pid);
        path
    }

    fn start_mux(argv: &[&str]) -> (Mux, Arc<PipelineShared>) {
        let shared = PipelineShared::new(false);
        let link = StageLink::new(Arc::clone(&shared), "mux", false);
        let mut mux = Mux::new(MuxArgs::try_parse_from(argv).unwrap());
        mux.start(&link).unwrap();
        (mux, shared)
    }

    fn ctx() -> PacketContext {
        PacketContext::default()
    }

    #[test]
    fn test_fixed_interval_insertion() {
        let path = temp_side_file("interval", 10, 0x200);
        let (mut mux, _shared) =
            start_mux(&["mux", path.to_str().unwrap(), "--inter-packet", "100", "--repeat", "1"]);

        let mut inserted_at = Vec::new();
        for i in 0..1000u64 {
            let mut pkt = TsPacket::null();
            assert_eq!(mux.process(&mut pkt, &mut ctx()), Status::Ok);
            if !pkt.is_null() {
                assert_eq!(pkt.pid(), 0x200);
                inserted_at.push(i);
            }
        }
        // First insertion on the first stuffing slot, then every 100.
        assert_eq!(inserted_at, vec![0, 100, 200, 300, 400, 500, 600, 700, 800, 900]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_continuity_counters_rewritten() {
        let path = temp_side_file("cc", 32, 0x200);
        let (mut mux, _shared) = start_mux(&["mux", path.to_str().unwrap(), "--repeat", "1"]);

        let mut ccs = Vec::new();
        for _ in 0..32 {
            let mut pkt = TsPacket::null();
            mux.process(&mut pkt, &mut ctx());
            if !pkt.is_null() {
                ccs.push(pkt.cc());
            }
        }
        let expected: Vec<u8> = (0..32).map(|i| (i % 16) as u8).collect();
        assert_eq!(ccs, expected);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_pid_conflict_aborts() {
        let path = temp_side_file("conflict", 4, 0x200);
        let (mut mux, shared) = start_mux(&["mux", path.to_str().unwrap()]);

        // The stream already carries PID 0x200.
        let mut pkt = data_packet(0x200, 0);
        assert_eq!(mux.process(&mut pkt, &mut ctx()), Status::Ok);

        let mut stuffing = TsPacket::null();
        assert_eq!(mux.process(&mut stuffing, &mut ctx()), Status::End);
        assert!(shared.take_error().is_some());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_forced_pid_and_no_conflict_check() {
        let path = temp_side_file("force", 4, 0x200);
        let (mut mux, shared) = start_mux(&[
            "mux",
            path.to_str().unwrap(),
            "--pid",
            "0x300",
            "--no-pid-conflict-check",
        ]);

        let mut pkt = data_packet(0x300, 0);
        mux.process(&mut pkt, &mut ctx());
        let mut stuffing = TsPacket::null();
        assert_eq!(mux.process(&mut stuffing, &mut ctx()), Status::Ok);
        assert_eq!(stuffing.pid(), 0x300);
        assert!(shared.take_error().is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_max_insert_count() {
        let path = temp_side_file("maxcount", 16, 0x200);
        let (mut mux, _shared) =
            start_mux(&["mux", path.to_str().unwrap(), "--max-insert-count", "3"]);

        let mut inserted = 0;
        for _ in 0..100 {
            let mut pkt = TsPacket::null();
            mux.process(&mut pkt, &mut ctx());
            if !pkt.is_null() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 3);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_terminate_on_eof() {
        let path = temp_side_file("term", 2, 0x200);
        let (mut mux, _shared) =
            start_mux(&["mux", path.to_str().unwrap(), "--repeat", "1", "--terminate"]);

        let mut ended = false;
        for _ in 0..10 {
            let mut pkt = TsPacket::null();
            if mux.process(&mut pkt, &mut ctx()) == Status::End {
                ended = true;
                break;
            }
        }
        assert!(ended);
    }

    #[test]
    fn test_joint_termination_on_eof() {
        let path = temp_side_file("joint", 2, 0x200);
        let shared = PipelineShared::new(false);
        let link = StageLink::new(Arc::clone(&shared), "mux", false);
        let mut mux = Mux::new(
            MuxArgs::try_parse_from(&[
                "mux",
                path.to_str().unwrap(),
                "--repeat",
                "1",
                "--joint-termination",
            ])
            .unwrap(),
        );
        mux.start(&link).unwrap();

        for _ in 0..10 {
            let mut pkt = TsPacket::null();
            assert_eq!(mux.process(&mut pkt, &mut ctx()), Status::Ok);
        }
        assert!(shared.joint.is_complete());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_min_max_pts_window() {
        let path = temp_side_file("ptswin", 16, 0x200);
        let (mut mux, _shared) = start_mux(&[
            "mux",
            path.to_str().unwrap(),
            "--min-pts",
            "1000",
            "--max-pts",
            "5000",
            "--pts-pid",
            "0x100",
        ]);

        // Below the window: no insertion.
        let mut reference = pes_packet(0x100, 500, None);
        mux.process(&mut reference, &mut ctx());
        let mut stuffing = TsPacket::null();
        mux.process(&mut stuffing, &mut ctx());
        assert!(stuffing.is_null());

        // Inside the window: insertion enabled.
        let mut reference = pes_packet(0x100, 2000, None);
        mux.process(&mut reference, &mut ctx());
        let mut stuffing = TsPacket::null();
        mux.process(&mut stuffing, &mut ctx());
        assert!(!stuffing.is_null());

        // Past the window: insertion disabled again.
        let mut reference = pes_packet(0x100, 6000, None);
        mux.process(&mut reference, &mut ctx());
        let mut stuffing = TsPacket::null();
        mux.process(&mut stuffing, &mut ctx());
        assert!(stuffing.is_null());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_pcr_latch_ignores_null_pid() {
        let path = temp_side_file("latch", 4, 0x200);
        let (mut mux, _shared) = start_mux(&["mux", path.to_str().unwrap(), "--min-pts", "10"]);

        // A PCR on a real PID latches the reference and opens the window
        // (PCR/300 > min-pts).
        let mut reference = pcr_packet(0x101, 2_000_000 * 300);
        mux.process(&mut reference, &mut ctx());
        assert_eq!(mux.pts_pid, Some(0x101));

        let mut stuffing = TsPacket::null();
        mux.process(&mut stuffing, &mut ctx());
        assert!(!stuffing.is_null());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bitrate_requires_known_ts_bitrate() {
        let path = temp_side_file("bitrate", 4, 0x200);
        let (mut mux, shared) = start_mux(&["mux", path.to_str().unwrap(), "--bitrate", "100000"]);

        // No bitrate published yet: the stage must end with an error.
        let mut pkt = TsPacket::null();
        assert_eq!(mux.process(&mut pkt, &mut ctx()), Status::End);
        assert!(shared.take_error().is_some());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bitrate_schedule() {
        let path = temp_side_file("brsched", 64, 0x200);
        let shared = PipelineShared::new(false);
        shared.bitrate.set(1_000_000);
        let link = StageLink::new(Arc::clone(&shared), "mux", false);
        let mut mux = Mux::new(
            MuxArgs::try_parse_from(&["mux", path.to_str().unwrap(), "--bitrate", "10000"])
                .unwrap(),
        );
        mux.start(&link).unwrap();

        let mut inserted_at = Vec::new();
        for i in 0..500u64 {
            let mut pkt = TsPacket::null();
            mux.process(&mut pkt, &mut ctx());
            if !pkt.is_null() {
                inserted_at.push(i);
            }
        }
        // 1_000_000 / 10_000 = one insertion every 100 packets.
        assert_eq!(inserted_at, vec![0, 100, 200, 300, 400]);
        std::fs::remove_file(&path).ok();
    }
}
