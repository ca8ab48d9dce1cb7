//! `pcrextract` processor stage: per-PID PCR/OPCR/PTS/DTS accounting with
//! CSV or log reporting.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use log::info;

use super::parse_pid;
use crate::error::StageError;
use crate::stage::{PacketContext, ProcessorStage, Stage, StageLink, Status};
use crate::ts::{
    sequenced_pts, PidSet, TsPacket, SYSTEM_CLOCK_FREQ, SYSTEM_CLOCK_SUBFACTOR,
    SYSTEM_CLOCK_SUBFREQ,
};

const DEFAULT_SEPARATOR: &str = ";";

/// Extract PCR, OPCR, PTS, DTS from TS packets
#[derive(Debug, Parser)]
#[command(
    name = "pcrextract",
    version,
    about = "Extract PCR, OPCR, PTS, DTS from TS packets for analysis"
)]
pub struct PcrExtractArgs {
    /// Report in CSV format (the default)
    #[arg(short, long)]
    pub csv: bool,

    /// Report Decoding Time Stamps; without any of --pcr, --opcr, --pts,
    /// --dts, all four are reported
    #[arg(short, long)]
    pub dts: bool,

    /// Keep only PTS greater than the previous good PTS, eliminating
    /// out-of-sequence B-frame timestamps
    #[arg(short, long)]
    pub good_pts_only: bool,

    /// Report through the logging system instead of CSV, in hexadecimal
    #[arg(short, long)]
    pub log: bool,

    /// Do not output the initial CSV header line
    #[arg(short, long)]
    pub noheader: bool,

    /// Report Original Program Clock References
    #[arg(long)]
    pub opcr: bool,

    /// Output file for CSV reporting; standard error by default
    #[arg(short, long)]
    pub output_file: Option<PathBuf>,

    /// Report Program Clock References
    #[arg(long)]
    pub pcr: bool,

    /// PID to analyze; may be repeated, all PIDs by default
    #[arg(short, long, value_parser = parse_pid)]
    pub pid: Vec<u16>,

    /// Report Presentation Time Stamps
    #[arg(long)]
    pub pts: bool,

    /// Field separator in CSV output
    #[arg(short, long, default_value = DEFAULT_SEPARATOR)]
    pub separator: String,
}

#[derive(Default)]
struct PidContext {
    packet_count: u64,
    pcr_count: u64,
    opcr_count: u64,
    pts_count: u64,
    dts_count: u64,
    first_pcr: u64,
    first_opcr: u64,
    first_pts: u64,
    last_good_pts: u64,
    first_dts: u64,
}

enum ReportSink {
    Stderr(io::Stderr),
    File(BufWriter<File>),
}

impl Write for ReportSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ReportSink::Stderr(w) => w.write(buf),
            ReportSink::File(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ReportSink::Stderr(w) => w.flush(),
            ReportSink::File(w) => w.flush(),
        }
    }
}

/// The `pcrextract` processor stage.
pub struct PcrExtract {
    args: PcrExtractArgs,
    link: Option<StageLink>,
    pids: PidSet,
    get_pcr: bool,
    get_opcr: bool,
    get_pts: bool,
    get_dts: bool,
    csv_format: bool,
    log_format: bool,
    output: Option<ReportSink>,
    packet_count: u64,
    stats: HashMap<u16, PidContext>,
}

impl PcrExtract {
    /// Build the stage from parsed options.
    pub fn new(args: PcrExtractArgs) -> Self {
        PcrExtract {
            args,
            link: None,
            pids: PidSet::new(),
            get_pcr: false,
            get_opcr: false,
            get_pts: false,
            get_dts: false,
            csv_format: false,
            log_format: false,
            output: None,
            packet_count: 0,
            stats: HashMap::new(),
        }
    }

    fn write_row(&mut self, row: String) -> Result<(), StageError> {
        if let Some(out) = self.output.as_mut() {
            writeln!(out, "{row}")?;
        }
        Ok(())
    }

    // Log-format report: hex values, 11 digits for PCR (42 bits), 9 for
    // PTS/DTS (33 bits).
    fn log_value(&self, kind: &str, pid: u16, value: u64, since_start: u64, frequency: u64) {
        if self.log_format {
            let width = if frequency == SYSTEM_CLOCK_FREQ { 11 } else { 9 };
            info!(
                "PID: 0x{pid:X} ({pid}), {kind}: 0x{value:0width$X}, (0x{since_start:0width$X}, {} ms from start of PID)",
                since_start * 1000 / frequency,
            );
        }
    }
}

impl Stage for PcrExtract {
    fn start(&mut self, link: &StageLink) -> Result<(), StageError> {
        self.link = Some(link.clone());
        self.packet_count = 0;
        self.stats.clear();

        self.pids = if self.args.pid.is_empty() {
            (0..crate::ts::PID_MAX as u16).collect()
        } else {
            self.args.pid.iter().copied().collect()
        };

        self.get_pcr = self.args.pcr;
        self.get_opcr = self.args.opcr;
        self.get_pts = self.args.pts;
        self.get_dts = self.args.dts;
        if !self.get_pcr && !self.get_opcr && !self.get_pts && !self.get_dts {
            // Report them all by default.
            self.get_pcr = true;
            self.get_opcr = true;
            self.get_pts = true;
            self.get_dts = true;
        }

        self.csv_format = self.args.csv || self.args.output_file.is_some();
        self.log_format = self.args.log;
        if !self.csv_format && !self.log_format {
            self.csv_format = true;
        }

        self.output = if self.csv_format {
            Some(match &self.args.output_file {
                Some(path) => {
                    let file = File::create(path).map_err(|e| {
                        StageError::Options(format!("cannot create {}: {e}", path.display()))
                    })?;
                    ReportSink::File(BufWriter::new(file))
                }
                None => ReportSink::Stderr(io::stderr()),
            })
        } else {
            None
        };

        if self.csv_format && !self.args.noheader {
            let s = self.args.separator.clone();
            self.write_row(format!(
                "PID{s}Packet index in TS{s}Packet index in PID{s}Type{s}Count in PID{s}Value{s}Value offset in PID{s}Offset from PCR"
            ))?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StageError> {
        if let Some(out) = self.output.as_mut() {
            out.flush()?;
        }
        Ok(())
    }
}

impl ProcessorStage for PcrExtract {
    fn process(&mut self, pkt: &mut TsPacket, _ctx: &mut PacketContext) -> Status {
        let pid = pkt.pid();
        if !self.pids.test(pid) {
            self.packet_count += 1;
            return Status::Ok;
        }

        let has_pcr = pkt.has_pcr();
        let pcr = pkt.pcr();
        let s = self.args.separator.clone();
        let ts_index = self.packet_count;
        let mut rows = Vec::new();

        {
            let pc = self.stats.entry(pid).or_default();
            let pid_index = pc.packet_count;

            if has_pcr {
                pc.pcr_count += 1;
                if pc.pcr_count == 1 {
                    pc.first_pcr = pcr;
                }
                if self.get_pcr {
                    rows.push((
                        format!(
                            "{pid}{s}{ts_index}{s}{pid_index}{s}PCR{s}{count}{s}{pcr}{s}{offset}{s}",
                            count = pc.pcr_count,
                            offset = pcr - pc.first_pcr,
                        ),
                        ("PCR", pcr, pcr - pc.first_pcr, SYSTEM_CLOCK_FREQ),
                    ));
                }
            }

            if pkt.has_opcr() {
                let opcr = pkt.opcr();
                pc.opcr_count += 1;
                if pc.opcr_count == 1 {
                    pc.first_opcr = opcr;
                }
                if self.get_opcr {
                    let from_pcr = if has_pcr {
                        (opcr as i64 - pcr as i64).to_string()
                    } else {
                        String::new()
                    };
                    rows.push((
                        format!(
                            "{pid}{s}{ts_index}{s}{pid_index}{s}OPCR{s}{count}{s}{opcr}{s}{offset}{s}{from_pcr}",
                            count = pc.opcr_count,
                            offset = opcr - pc.first_opcr,
                        ),
                        ("OPCR", opcr, opcr - pc.first_opcr, SYSTEM_CLOCK_FREQ),
                    ));
                }
            }

            if pkt.has_pts() {
                let pts = pkt.pts();
                pc.pts_count += 1;
                if pc.pts_count == 1 {
                    pc.first_pts = pts;
                    pc.last_good_pts = pts;
                }
                // A "good" PTS moves forward from the last good one,
                // modulo the 2^33 wrap.
                let good_pts = sequenced_pts(pc.last_good_pts, pts);
                if good_pts {
                    pc.last_good_pts = pts;
                }
                if self.get_pts && (good_pts || !self.args.good_pts_only) {
                    let from_pcr = if has_pcr {
                        (pts as i64 - (pcr / SYSTEM_CLOCK_SUBFACTOR) as i64).to_string()
                    } else {
                        String::new()
                    };
                    rows.push((
                        format!(
                            "{pid}{s}{ts_index}{s}{pid_index}{s}PTS{s}{count}{s}{pts}{s}{offset}{s}{from_pcr}",
                            count = pc.pts_count,
                            offset = pts.wrapping_sub(pc.first_pts),
                        ),
                        ("PTS", pts, pts.wrapping_sub(pc.first_pts), SYSTEM_CLOCK_SUBFREQ),
                    ));
                }
            }

            if pkt.has_dts() {
                let dts = pkt.dts();
                pc.dts_count += 1;
                if pc.dts_count == 1 {
                    pc.first_dts = dts;
                }
                if self.get_dts {
                    let from_pcr = if has_pcr {
                        (dts as i64 - (pcr / SYSTEM_CLOCK_SUBFACTOR) as i64).to_string()
                    } else {
                        String::new()
                    };
                    rows.push((
                        format!(
                            "{pid}{s}{ts_index}{s}{pid_index}{s}DTS{s}{count}{s}{dts}{s}{offset}{s}{from_pcr}",
                            count = pc.dts_count,
                            offset = dts.wrapping_sub(pc.first_dts),
                        ),
                        ("DTS", dts, dts.wrapping_sub(pc.first_dts), SYSTEM_CLOCK_SUBFREQ),
                    ));
                }
            }

            pc.packet_count += 1;
        }

        for (row, (kind, value, since_start, frequency)) in rows {
            if self.csv_format {
                if let Err(err) = self.write_row(row) {
                    if let Some(link) = self.link.as_ref() {
                        link.fail(err);
                    }
                    return Status::End;
                }
            }
            self.log_value(kind, pid, value, since_start, frequency);
        }

        self.packet_count += 1;
        Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineShared;
    use crate::ts::test_support::{data_packet, pcr_packet, pes_packet};
    use crate::ts::PTS_DTS_SCALE;
    use std::sync::Arc;

    fn run_extractor(argv: &[&str], packets: &[TsPacket]) -> Vec<String> {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "tspipe-pcrextract-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        let mut argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        argv.push("--output-file".into());
        argv.push(path.to_str().unwrap().into());

        let link = StageLink::new(PipelineShared::new(false), "pcrextract", false);
        let mut stage = PcrExtract::new(PcrExtractArgs::try_parse_from(&argv).unwrap());
        stage.start(&link).unwrap();
        for pkt in packets {
            let mut pkt = *pkt;
            assert_eq!(
                stage.process(&mut pkt, &mut PacketContext::default()),
                Status::Ok
            );
        }
        stage.stop().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        text.lines().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_csv_header() {
        let lines = run_extractor(&["pcrextract", "--pcr", "--csv"], &[]);
        assert_eq!(
            lines[0],
            "PID;Packet index in TS;Packet index in PID;Type;Count in PID;Value;Value offset in PID;Offset from PCR"
        );
    }

    #[test]
    fn test_noheader_and_separator() {
        let packets = [pcr_packet(0x100, 1000)];
        let lines = run_extractor(
            &["pcrextract", "--pcr", "--noheader", "--separator", ","],
            &packets,
        );
        assert_eq!(lines, vec!["256,0,0,PCR,1,1000,0,"]);
    }

    #[test]
    fn test_pcr_rows() {
        let packets = [
            pcr_packet(0x100, 3000),
            data_packet(0x100, 1),
            pcr_packet(0x100, 4500),
        ];
        let lines = run_extractor(&["pcrextract", "--pcr", "--noheader"], &packets);
        assert_eq!(
            lines,
            vec!["256;0;0;PCR;1;3000;0;", "256;2;2;PCR;2;4500;1500;"]
        );
    }

    #[test]
    fn test_pts_offset_from_pcr() {
        // One packet with both PCR and nothing else; one with a PTS.
        let packets = [pes_packet(0x101, 9000, None)];
        let lines = run_extractor(&["pcrextract", "--pts", "--noheader"], &packets);
        // No PCR in the packet: the last field stays empty.
        assert_eq!(lines, vec!["257;0;0;PTS;1;9000;0;"]);
    }

    #[test]
    fn test_good_pts_filter_drops_out_of_order() {
        let packets = [
            pes_packet(0x101, 1000, None),
            pes_packet(0x101, 3000, None),
            pes_packet(0x101, 2000, None), // B-frame, out of order
            pes_packet(0x101, 4000, None),
        ];
        let lines = run_extractor(
            &["pcrextract", "--pts", "--good-pts-only", "--noheader"],
            &packets,
        );
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| !l.contains(";2000;")));
    }

    #[test]
    fn test_good_pts_filter_survives_wrap() {
        let near_wrap = PTS_DTS_SCALE - 500;
        let packets = [
            pes_packet(0x101, near_wrap, None),
            pes_packet(0x101, 100, None), // wrapped, still "good"
        ];
        let lines = run_extractor(
            &["pcrextract", "--pts", "--good-pts-only", "--noheader"],
            &packets,
        );
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_pid_filter() {
        let packets = [pcr_packet(0x100, 1000), pcr_packet(0x200, 2000)];
        let lines = run_extractor(
            &["pcrextract", "--pcr", "--noheader", "--pid", "0x200"],
            &packets,
        );
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("512;"));
    }

    #[test]
    fn test_dts_reported() {
        let packets = [pes_packet(0x101, 5000, Some(4000))];
        let lines = run_extractor(&["pcrextract", "--noheader"], &packets);
        // Default reports all kinds: PTS and DTS rows for this packet.
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(";PTS;"));
        assert!(lines[1].contains(";DTS;"));
    }
}
