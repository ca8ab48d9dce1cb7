//! `scrambler` processor stage: scrambles a service or a PID list,
//! schedules crypto periods, inserts ECMs and patches the PMT.
//!
//! Crypto-period dynamics: two [`CryptoPeriod`] slots hold the
//! previous/current or current/next periods. During cp(N), scrambling uses
//! CW(N); around each period boundary, for a window of `|delay_start|`
//! milliseconds, the ECM being broadcast refers to the adjacent period:
//! ECM(N-1) at the start of cp(N) when `delay_start > 0`, ECM(N+1) before
//! the end of cp(N) when `delay_start < 0`.
//!
//! Degraded mode: a transition CW(N) -> CW(N+1) or ECM(N) -> ECM(N+1)
//! requires ECM(N+1) to be ready. When the asynchronous ECMG lags, the
//! stage refuses transitions and keeps the current CW and ECM. At each ECM
//! insertion point it re-checks; on arrival it immediately performs the
//! postponed transition and reschedules the other one `|delay_start|` away,
//! on the side given by the sign.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{debug, info, warn};

use super::crypto_period::{CryptoPeriod, EcmContext};
use super::{parse_hex_bytes, parse_pid, parse_u16_value, parse_u32_value};
use crate::ecmg::{EcmGenerator, EcmgClient, EcmgClientConfig};
use crate::error::StageError;
use crate::scramble::{TsScrambling, SCRAMBLING_MODE_CISSA};
use crate::service::ServiceDiscovery;
use crate::stage::{PacketContext, ProcessorStage, Stage, StageLink, Status};
use crate::ts::{
    packet_distance, pid, CaDescriptor, CyclingPacketizer, PidSet, PmtTable,
    ScramblingDescriptor, TsPacket,
};
use tspipe_simulcrypt::ProtocolVersion;

const DEFAULT_ECM_BITRATE: u64 = 30_000;

/// DVB scrambler
#[derive(Debug, Parser)]
#[command(
    name = "scrambler",
    version,
    about = "Scramble a service or a list of PIDs"
)]
pub struct ScramblerArgs {
    /// Service id to scramble (decimal or 0xHHHH); without a service, a
    /// list of --pid options and a fixed --cw must be given
    #[arg(value_name = "SERVICE", value_parser = parse_u16_value)]
    pub service: Option<u16>,

    /// Access criteria sent to the ECMG, as hexadecimal digits
    #[arg(short = 'a', long)]
    pub access_criteria: Option<String>,

    /// Bitrate of the ECM PID in bits/second
    #[arg(short = 'b', long, default_value_t = DEFAULT_ECM_BITRATE)]
    pub bitrate_ecm: u64,

    /// DVB SimulCrypt ECM_channel_id
    #[arg(long, default_value_t = 1)]
    pub channel_id: u16,

    /// Add CA descriptors at component level instead of program level
    #[arg(long)]
    pub component_level: bool,

    /// Crypto-period duration in seconds
    #[arg(short = 'd', long, default_value_t = 10)]
    pub cp_duration: u64,

    /// Fixed control word as hexadecimal digits; disables crypto-period
    /// rotation and ECM insertion
    #[arg(long)]
    pub cw: Option<String>,

    /// DVB SimulCrypt ECM_id
    #[arg(short = 'i', long, default_value_t = 1)]
    pub ecm_id: u16,

    /// ECM generator address, host:port
    #[arg(short = 'e', long)]
    pub ecmg: Option<String>,

    /// ECMG <-> SCS protocol version (2 or 3)
    #[arg(short = 'v', long, default_value_t = 2)]
    pub ecmg_scs_version: u8,

    /// Pass through packets which are already scrambled instead of
    /// aborting
    #[arg(long)]
    pub ignore_scrambled: bool,

    /// Do not scramble audio components
    #[arg(long)]
    pub no_audio: bool,

    /// Do not scramble video components
    #[arg(long)]
    pub no_video: bool,

    /// Scramble one packet out of this many eligible packets
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub partial_scrambling: u64,

    /// Scramble this PID; may be repeated
    #[arg(short = 'p', long, value_parser = parse_pid)]
    pub pid: Vec<u16>,

    /// ECM PID; the first unused PID after the PMT PID by default
    #[arg(long, value_parser = parse_pid)]
    pub pid_ecm: Option<u16>,

    /// Private data of the CA descriptor, as hexadecimal digits
    #[arg(long)]
    pub private_data: Option<String>,

    /// DVB SimulCrypt ECM_stream_id
    #[arg(long, default_value_t = 1)]
    pub stream_id: u16,

    /// Scramble subtitle components
    #[arg(long)]
    pub subtitles: bool,

    /// DVB SimulCrypt Super_CAS_Id (required with --ecmg)
    #[arg(short = 's', long, value_parser = parse_u32_value)]
    pub super_cas_id: Option<u32>,

    /// Generate ECMs synchronously; always on in offline mode
    #[arg(long)]
    pub synchronous: bool,
}

/// The `scrambler` processor stage.
pub struct Scrambler {
    args: ScramblerArgs,
    link: Option<StageLink>,

    // Resolved configuration, constant after start().
    use_service: bool,
    synchronous_ecmg: bool,
    need_cp: bool,
    need_ecm: bool,
    access_criteria: Vec<u8>,
    ca_desc_private: Vec<u8>,
    cp_duration_ms: i64,
    delay_start_ms: i64,
    ecm_pid: Option<u16>,
    update_pmt: bool,

    // Runtime state.
    service: Option<ServiceDiscovery>,
    ecmg: Option<Box<dyn EcmGenerator>>,
    abort: Arc<AtomicBool>,
    degraded_mode: bool,
    packet_count: i64,
    scrambled_count: u64,
    partial_clear: u64,
    pkt_insert_ecm: i64,
    pkt_change_cw: i64,
    pkt_change_ecm: i64,
    ts_bitrate: u64,
    ecm_cc: u8,
    scrambled_pids: PidSet,
    conflict_pids: PidSet,
    input_pids: PidSet,
    cp: [CryptoPeriod; 2],
    current_cw: usize,
    current_ecm: usize,
    scrambling: TsScrambling,
    pzer_pmt: Option<CyclingPacketizer>,
}

impl Scrambler {
    /// Build the stage from parsed options.
    pub fn new(args: ScramblerArgs) -> Self {
        Scrambler {
            args,
            link: None,
            use_service: false,
            synchronous_ecmg: false,
            need_cp: false,
            need_ecm: false,
            access_criteria: Vec::new(),
            ca_desc_private: Vec::new(),
            cp_duration_ms: 0,
            delay_start_ms: 0,
            ecm_pid: None,
            update_pmt: false,
            service: None,
            ecmg: None,
            abort: Arc::new(AtomicBool::new(false)),
            degraded_mode: false,
            packet_count: 0,
            scrambled_count: 0,
            partial_clear: 0,
            pkt_insert_ecm: 0,
            pkt_change_cw: 0,
            pkt_change_ecm: 0,
            ts_bitrate: 0,
            ecm_cc: 0,
            scrambled_pids: PidSet::new(),
            conflict_pids: PidSet::new(),
            input_pids: PidSet::new(),
            cp: [CryptoPeriod::new(), CryptoPeriod::new()],
            current_cw: 0,
            current_ecm: 0,
            scrambling: TsScrambling::new(),
            pzer_pmt: None,
        }
    }

    /// Use an already-constructed ECM generator instead of connecting to a
    /// network ECMG. Must be called before `start()`.
    pub fn with_ecmg(mut self, ecmg: Box<dyn EcmGenerator>) -> Self {
        self.ecmg = Some(ecmg);
        self
    }

    fn cp_duration_100ms(&self) -> u16 {
        (self.cp_duration_ms / 100) as u16
    }

    fn next_ecm_ready(&self) -> bool {
        self.cp[(self.current_ecm + 1) & 1].ecm_ready()
    }

    // Check if we are in degraded mode, entering it when the next ECM is
    // late.
    fn in_degraded_mode(&mut self) -> bool {
        if !self.need_ecm {
            false
        } else if self.degraded_mode {
            true
        } else if self.next_ecm_ready() {
            false
        } else {
            warn!("Next ECM not ready, entering degraded mode");
            self.degraded_mode = true;
            true
        }
    }

    // Try to exit from degraded mode. False means unrecoverable error.
    fn try_exit_degraded_mode(&mut self, link: &StageLink) -> bool {
        if !self.degraded_mode {
            return true;
        }
        if !self.next_ecm_ready() {
            return true;
        }

        info!("Next ECM ready, exiting from degraded mode");
        self.degraded_mode = false;

        if self.delay_start_ms < 0 {
            // Start broadcasting the next ECM now; the CW changes
            // |delay_start| later.
            self.change_ecm(link);
            self.pkt_change_cw =
                self.packet_count + packet_distance(self.ts_bitrate, -self.delay_start_ms);
        } else {
            // Change the CW now; the next ECM starts |delay_start| later.
            if !self.change_cw(link) {
                return false;
            }
            self.pkt_change_ecm =
                self.packet_count + packet_distance(self.ts_bitrate, self.delay_start_ms);
        }
        true
    }

    // CW transition. False means unrecoverable error.
    fn change_cw(&mut self, link: &StageLink) -> bool {
        if self.in_degraded_mode() {
            return true;
        }

        self.current_cw ^= 1;
        let cp_number = self.cp[self.current_cw].cp_number();
        if self.need_ecm {
            let cw = self.cp[self.current_cw].cw_current().to_vec();
            if let Err(err) = self.scrambling.set_cw(&cw, cp_number) {
                link.fail(err);
                return false;
            }
        }
        self.scrambling.set_encrypt_parity(cp_number);

        if self.need_cp {
            self.pkt_change_cw =
                self.packet_count + packet_distance(self.ts_bitrate, self.cp_duration_ms);
        }

        // When ECM(N) is in use during cp(N), cp(N+1) can be prepared.
        if self.need_ecm && self.current_ecm == self.current_cw {
            self.generate_next_cp(link);
        }
        true
    }

    // ECM transition.
    fn change_ecm(&mut self, link: &StageLink) {
        if self.need_ecm && !self.in_degraded_mode() {
            self.current_ecm ^= 1;
            self.pkt_change_ecm =
                self.packet_count + packet_distance(self.ts_bitrate, self.cp_duration_ms);
            if self.current_ecm == self.current_cw {
                self.generate_next_cp(link);
            }
        }
    }

    // Start generating the crypto period following the current one, in the
    // other slot.
    fn generate_next_cp(&mut self, link: &StageLink) {
        let previous = self.cp[self.current_cw].chain_data();
        let Some(ecmg) = self.ecmg.as_mut() else {
            return;
        };
        let mut ctx = EcmContext {
            ecmg: ecmg.as_mut(),
            synchronous: self.synchronous_ecmg,
            access_criteria: &self.access_criteria,
            cp_duration: ((self.cp_duration_ms / 100) as u16).max(1),
            abort: &self.abort,
            link,
        };
        self.cp[self.current_cw ^ 1].init_next(previous, &mut ctx);
    }

    // The service's PMT is available (first time or a new version).
    fn handle_pmt(&mut self, mut pmt: PmtTable, link: &StageLink) {
        // Packet-count scheduling needs a known bitrate.
        if self.ts_bitrate == 0 && (self.need_cp || self.need_ecm) {
            link.fail(StageError::Runtime(
                "unknown bitrate, cannot schedule crypto-periods".into(),
            ));
            self.abort.store(true, Ordering::Release);
            return;
        }

        // Collect the PIDs to scramble from the component list.
        self.scrambled_pids.reset();
        for stream in &pmt.streams {
            let es_pid = stream.elementary_pid;
            self.input_pids.set(es_pid);
            if (!self.args.no_audio && stream.is_audio())
                || (!self.args.no_video && stream.is_video())
                || (self.args.subtitles && stream.is_subtitles())
            {
                self.scrambled_pids.set(es_pid);
                debug!("starting scrambling PID 0x{es_pid:04X}");
            }
        }
        if self.scrambled_pids.none() {
            link.fail(StageError::Runtime("no PID to scramble in service".into()));
            self.abort.store(true, Ordering::Release);
            return;
        }

        // Allocate an ECM PID when none was given: the first unused PID
        // after the PMT PID.
        let pmt_pid = self.service.as_ref().and_then(|s| s.pmt_pid());
        if self.need_ecm && self.ecm_pid.is_none() {
            let mut candidate = pmt_pid.map(|p| p + 1).unwrap_or(pid::LAST_RESERVED + 1);
            while candidate < pid::NULL && self.input_pids.test(candidate) {
                candidate += 1;
            }
            if candidate >= pid::NULL {
                link.fail(StageError::Runtime(
                    "cannot find an unused PID for ECM, try --pid-ecm".into(),
                ));
                self.abort.store(true, Ordering::Release);
                return;
            }
            debug!("using PID {candidate} (0x{candidate:04X}) for ECM");
            self.ecm_pid = Some(candidate);
        }

        // The cipher is not DVB-CSA2: advertise it in the PMT.
        self.update_pmt = true;
        pmt.add_program_descriptor(
            &ScramblingDescriptor {
                scrambling_mode: SCRAMBLING_MODE_CISSA,
            }
            .encode(),
        );

        if self.need_ecm {
            let ca_desc = CaDescriptor {
                ca_system_id: ((self.args.super_cas_id.unwrap_or(0) >> 16) & 0xFFFF) as u16,
                ca_pid: self.ecm_pid.unwrap_or(pid::NULL),
                private_data: self.ca_desc_private.clone(),
            };
            if self.args.component_level {
                for stream in &mut pmt.streams {
                    if self.scrambled_pids.test(stream.elementary_pid) {
                        stream.add_descriptor(&ca_desc.encode());
                    }
                }
            } else {
                pmt.add_program_descriptor(&ca_desc.encode());
            }
        }

        // Re-emit the patched table continuously on the PMT PID.
        if let Some(pmt_pid) = pmt_pid {
            let pzer = self
                .pzer_pmt
                .get_or_insert_with(|| CyclingPacketizer::new(pmt_pid));
            pzer.set_section(pmt.build_section());
        }

        // Schedule the transitions relative to the current packet.
        if self.need_cp {
            self.pkt_change_cw =
                self.packet_count + packet_distance(self.ts_bitrate, self.cp_duration_ms);
        }
        if self.need_ecm {
            // Insert current ECM packets as soon as possible; the next ECM
            // change leads or trails the CW change by delay_start.
            self.pkt_insert_ecm = self.packet_count;
            self.pkt_change_ecm =
                self.pkt_change_cw + packet_distance(self.ts_bitrate, self.delay_start_ms);
        }
    }
}

impl Stage for Scrambler {
    fn start(&mut self, link: &StageLink) -> Result<(), StageError> {
        self.link = Some(link.clone());
        self.abort.store(false, Ordering::Release);
        self.degraded_mode = false;
        self.packet_count = 0;
        self.scrambled_count = 0;
        self.partial_clear = 0;
        self.pkt_insert_ecm = 0;
        self.pkt_change_cw = 0;
        self.pkt_change_ecm = 0;
        self.ts_bitrate = 0;
        self.ecm_cc = 0;
        self.update_pmt = false;
        self.conflict_pids.reset();
        self.current_cw = 0;
        self.current_ecm = 0;

        self.use_service = self.args.service.is_some();
        self.synchronous_ecmg = self.args.synchronous || !link.realtime();
        self.access_criteria = match &self.args.access_criteria {
            Some(hex) => parse_hex_bytes(hex).map_err(StageError::Options)?,
            None => Vec::new(),
        };
        self.ca_desc_private = match &self.args.private_data {
            Some(hex) => parse_hex_bytes(hex).map_err(StageError::Options)?,
            None => Vec::new(),
        };
        let fixed_cw = match &self.args.cw {
            Some(hex) => Some(parse_hex_bytes(hex).map_err(StageError::Options)?),
            None => None,
        };
        self.cp_duration_ms = (self.args.cp_duration * 1000) as i64;
        self.ecm_pid = self.args.pid_ecm;
        self.scrambled_pids = self.args.pid.iter().copied().collect();

        // Scramble either a service or an explicit PID list, not both.
        if self.use_service == self.scrambled_pids.any() {
            return Err(StageError::Options(
                "specify either a service or a list of PIDs".into(),
            ));
        }
        // An explicit PID list loses the random CWs: a fixed CW is needed.
        if self.scrambled_pids.any() && fixed_cw.is_none() {
            return Err(StageError::Options(
                "specify a fixed control word to scramble an explicit list of PIDs".into(),
            ));
        }

        self.need_cp = fixed_cw.is_none();
        self.need_ecm = self.use_service && fixed_cw.is_none();

        if let Some(cw) = &fixed_cw {
            self.scrambling.set_cw(cw, 0)?;
            self.scrambling.set_encrypt_parity(0);
        }

        let version = ProtocolVersion::from_value(self.args.ecmg_scs_version).ok_or_else(|| {
            StageError::Options(format!(
                "invalid ECMG <-> SCS version {}, use 2 or 3",
                self.args.ecmg_scs_version
            ))
        })?;

        if self.need_ecm {
            if self.args.super_cas_id.is_none() {
                return Err(StageError::Options(
                    "--super-cas-id is required to generate ECMs".into(),
                ));
            }
            if self.ecmg.is_none() {
                let addr = self.args.ecmg.clone().ok_or_else(|| {
                    StageError::Options("specify either --cw or --ecmg".into())
                })?;
                let client = EcmgClient::connect(EcmgClientConfig {
                    addr,
                    super_cas_id: self.args.super_cas_id.unwrap_or(0),
                    channel_id: self.args.channel_id,
                    stream_id: self.args.stream_id,
                    ecm_id: self.args.ecm_id,
                    cp_duration: self.cp_duration_100ms().max(1),
                    version,
                })?;
                self.ecmg = Some(Box::new(client));
            }

            // delay_start is bounded to half the crypto period.
            let delay = self.ecmg.as_ref().map(|e| e.delay_start()).unwrap_or(0) as i64;
            if delay.abs() > self.cp_duration_ms / 2 {
                return Err(StageError::Options(format!(
                    "crypto-period too short for this CAS, must be at least {} ms",
                    2 * delay.abs()
                )));
            }
            self.delay_start_ms = delay;
            debug!(
                "crypto-period duration: {} ms, delay start: {} ms",
                self.cp_duration_ms, self.delay_start_ms
            );

            // First two crypto periods; the first CW keys the cipher now.
            let Some(ecmg) = self.ecmg.as_mut() else {
                return Err(StageError::Ecmg("no ECM generator".into()));
            };
            let mut ctx = EcmContext {
                ecmg: ecmg.as_mut(),
                synchronous: self.synchronous_ecmg,
                access_criteria: &self.access_criteria,
                cp_duration: ((self.cp_duration_ms / 100) as u16).max(1),
                abort: &self.abort,
                link,
            };
            self.cp[0].init_cycle(0, &mut ctx);
            let chain = self.cp[0].chain_data();
            self.cp[1].init_next(chain, &mut ctx);

            let cw = self.cp[0].cw_current().to_vec();
            self.scrambling.set_cw(&cw, 0)?;
            self.scrambling.set_encrypt_parity(0);
        }

        if self.use_service {
            self.service = Some(ServiceDiscovery::new(self.args.service));
        }

        // Reserved PIDs can never carry scrambled content or ECMs.
        self.input_pids.reset();
        self.input_pids.set(pid::NULL);
        for reserved in 0..=pid::LAST_RESERVED {
            self.input_pids.set(reserved);
        }

        if self.abort.load(Ordering::Acquire) {
            return Err(StageError::Ecmg("ECM generation failed during startup".into()));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StageError> {
        self.ecmg = None;
        debug!(
            "scrambled {} packets in {} PIDs",
            self.scrambled_count,
            self.scrambled_pids.count()
        );
        Ok(())
    }
}

impl ProcessorStage for Scrambler {
    fn process(&mut self, pkt: &mut TsPacket, _ctx: &mut PacketContext) -> Status {
        let link = match self.link.as_ref() {
            Some(link) => link.clone(),
            None => return Status::End,
        };

        self.packet_count += 1;
        let packet_pid = pkt.pid();
        self.input_pids.set(packet_pid);

        // Maintain the bitrate, keeping the previous value when unknown.
        let bitrate = link.bitrate();
        if bitrate != 0 {
            self.ts_bitrate = bitrate;
        }

        // Watch PSI to discover the service.
        if let Some(service) = self.service.as_mut() {
            if let Some(pmt) = service.feed(pkt) {
                self.handle_pmt(pmt, &link);
            }
        }

        if self.abort.load(Ordering::Acquire) {
            return Status::End;
        }
        if let Some(service) = self.service.as_ref() {
            if service.nonexistent_service() {
                link.fail(StageError::Runtime("service not found in PAT".into()));
                return Status::End;
            }
        }

        // The allocated ECM PID must stay free in the input stream.
        if self.ecm_pid == Some(packet_pid) {
            link.fail(StageError::Runtime(format!(
                "ECM PID conflict, 0x{packet_pid:04X} found as input PID, try another --pid-ecm"
            )));
            return Status::End;
        }

        // Until the PIDs to scramble are known, nullify everything.
        if self.scrambled_pids.none() {
            return Status::Null;
        }

        // Replace packets of the PMT PID with the patched table.
        if self.update_pmt {
            if let Some(pzer) = self.pzer_pmt.as_mut() {
                if pzer.pid() == packet_pid {
                    *pkt = pzer.next_packet();
                    return Status::Ok;
                }
            }
        }

        // Crypto-period transitions.
        if self.need_cp && self.packet_count >= self.pkt_change_cw && !self.change_cw(&link) {
            return Status::End;
        }
        if self.need_ecm && self.packet_count >= self.pkt_change_ecm {
            self.change_ecm(&link);
        }

        // ECM insertion: replace stuffing at the ECM cadence.
        if self.need_ecm && packet_pid == pid::NULL && self.packet_count >= self.pkt_insert_ecm {
            self.pkt_insert_ecm += (self.ts_bitrate / self.args.bitrate_ecm.max(1)) as i64;

            if !self.try_exit_degraded_mode(&link) {
                return Status::End;
            }

            if let Some(ecm_pid) = self.ecm_pid {
                *pkt = self.cp[self.current_ecm].next_ecm_packet(ecm_pid, &mut self.ecm_cc);
            }
            return Status::Ok;
        }

        // Nothing to do for payload-less packets and foreign PIDs.
        if !pkt.has_payload() || !self.scrambled_pids.test(packet_pid) {
            return Status::Ok;
        }

        // Already-scrambled input: abort, or ignore per configuration.
        if pkt.is_scrambled() {
            if self.args.ignore_scrambled {
                if !self.conflict_pids.test(packet_pid) {
                    debug!(
                        "found input scrambled packets in PID {packet_pid} (0x{packet_pid:04X}), ignored"
                    );
                    self.conflict_pids.set(packet_pid);
                }
                return Status::Ok;
            }
            link.fail(StageError::Runtime(format!(
                "packet already scrambled in PID {packet_pid} (0x{packet_pid:04X})"
            )));
            return Status::End;
        }

        // Partial scrambling: keep a countdown of clear packets.
        if self.partial_clear > 0 {
            self.partial_clear -= 1;
            return Status::Ok;
        }
        self.partial_clear = self.args.partial_scrambling - 1;

        if let Err(err) = self.scrambling.encrypt(pkt) {
            link.fail(err);
            return Status::End;
        }
        self.scrambled_count += 1;
        Status::Ok
    }
}
