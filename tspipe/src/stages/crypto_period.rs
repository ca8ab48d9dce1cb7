//! Crypto periods for the scrambler.
//!
//! Two `CryptoPeriod` slots are maintained concurrently: previous/current
//! or current/next. Each holds the current and next control words and the
//! packetized ECM for the period. ECM generation may complete
//! asynchronously: the ECMG callback fills the packet vector, then
//! publishes the `ecm_ok` flag with release ordering; the packet loop reads
//! it with acquire ordering, so the vector is fully visible once the flag
//! is true.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::ecmg::{EcmGenerator, EcmRequest};
use crate::error::StageError;
use crate::scramble::CW_SIZE;
use crate::stage::StageLink;
use crate::ts::{pid, OneShotPacketizer, TsPacket, CC_MASK, PKT_SIZE};

/// Shared state the scrambler needs while generating an ECM.
pub struct EcmContext<'a> {
    /// The ECM source.
    pub ecmg: &'a mut dyn EcmGenerator,
    /// Generate synchronously instead of through the callback.
    pub synchronous: bool,
    /// Access criteria forwarded to the ECMG.
    pub access_criteria: &'a [u8],
    /// Crypto-period duration in 100 ms units.
    pub cp_duration: u16,
    /// Scrambler abort flag, raised by asynchronous error paths.
    pub abort: &'a Arc<AtomicBool>,
    /// Stage link for error reporting from the callback.
    pub link: &'a StageLink,
}

#[derive(Default)]
struct EcmPackets {
    packets: Vec<TsPacket>,
    next: usize,
}

struct CpShared {
    ecm_ok: AtomicBool,
    ecm: Mutex<EcmPackets>,
}

/// One crypto period: number, CW pair and its packetized ECM.
pub struct CryptoPeriod {
    cp_number: u16,
    cw_current: Vec<u8>,
    cw_next: Vec<u8>,
    shared: Arc<CpShared>,
}

impl CryptoPeriod {
    /// An empty crypto period.
    pub fn new() -> Self {
        CryptoPeriod {
            cp_number: 0,
            cw_current: Vec::new(),
            cw_next: Vec::new(),
            shared: Arc::new(CpShared {
                ecm_ok: AtomicBool::new(false),
                ecm: Mutex::new(EcmPackets::default()),
            }),
        }
    }

    /// Initialize the first crypto period: two fresh random control words,
    /// then start ECM generation.
    pub fn init_cycle(&mut self, cp_number: u16, ctx: &mut EcmContext<'_>) {
        self.cp_number = cp_number;
        self.cw_current = random_cw();
        self.cw_next = random_cw();
        self.generate_ecm(ctx);
    }

    /// Initialize the crypto period following `previous`: its next CW
    /// becomes our current one.
    pub fn init_next(&mut self, previous: (u16, Vec<u8>), ctx: &mut EcmContext<'_>) {
        let (prev_number, prev_cw_next) = previous;
        self.cp_number = prev_number.wrapping_add(1);
        self.cw_current = prev_cw_next;
        self.cw_next = random_cw();
        self.generate_ecm(ctx);
    }

    /// Crypto-period number.
    pub fn cp_number(&self) -> u16 {
        self.cp_number
    }

    /// Control word in force during this period.
    pub fn cw_current(&self) -> &[u8] {
        &self.cw_current
    }

    /// Handle for [`CryptoPeriod::init_next`] on the other slot.
    pub fn chain_data(&self) -> (u16, Vec<u8>) {
        (self.cp_number, self.cw_next.clone())
    }

    /// True once the ECM for this period has arrived.
    pub fn ecm_ready(&self) -> bool {
        self.shared.ecm_ok.load(Ordering::Acquire)
    }

    /// Next ECM packet of the cycle, retagged onto the ECM PID with the
    /// given continuity counter. A null packet when the ECM is not ready.
    pub fn next_ecm_packet(&self, ecm_pid: u16, cc: &mut u8) -> TsPacket {
        if !self.ecm_ready() {
            return TsPacket::null();
        }
        let mut ecm = self.shared.ecm.lock();
        if ecm.packets.is_empty() {
            return TsPacket::null();
        }
        let mut pkt = ecm.packets[ecm.next];
        ecm.next = (ecm.next + 1) % ecm.packets.len();
        pkt.set_pid(ecm_pid);
        pkt.set_cc(*cc);
        *cc = (*cc + 1) & CC_MASK;
        pkt
    }

    // Request the ECM for this period from the ECMG. The result lands in
    // the shared slot, directly or from the client's receiver thread.
    fn generate_ecm(&mut self, ctx: &mut EcmContext<'_>) {
        self.shared.ecm_ok.store(false, Ordering::Release);
        self.shared.ecm.lock().packets.clear();

        let request = EcmRequest {
            cp_number: self.cp_number,
            cw_current: self.cw_current.clone(),
            cw_next: self.cw_next.clone(),
            access_criteria: ctx.access_criteria.to_vec(),
            cp_duration: ctx.cp_duration,
        };
        let tspkt_flag = ctx.ecmg.section_tspkt_flag();

        if ctx.synchronous {
            match ctx.ecmg.generate_ecm(request) {
                Ok(datagram) => store_ecm(
                    &self.shared,
                    tspkt_flag,
                    self.cp_number,
                    datagram,
                    ctx.link,
                    ctx.abort,
                ),
                Err(err) => {
                    ctx.link.fail(err);
                    ctx.abort.store(true, Ordering::Release);
                }
            }
        } else {
            let shared = Arc::clone(&self.shared);
            let abort = Arc::clone(ctx.abort);
            let link = ctx.link.clone();
            let cp_number = self.cp_number;
            let result = ctx.ecmg.submit_ecm(
                request,
                Box::new(move |result| match result {
                    Ok(datagram) => {
                        store_ecm(&shared, tspkt_flag, cp_number, datagram, &link, &abort)
                    }
                    Err(msg) => {
                        link.fail(StageError::Ecmg(msg));
                        abort.store(true, Ordering::Release);
                    }
                }),
            );
            if let Err(err) = result {
                ctx.link.fail(err);
                ctx.abort.store(true, Ordering::Release);
            }
        }
    }
}

impl Default for CryptoPeriod {
    fn default() -> Self {
        CryptoPeriod::new()
    }
}

fn random_cw() -> Vec<u8> {
    let mut cw = vec![0u8; CW_SIZE];
    OsRng.fill_bytes(&mut cw);
    cw
}

// Packetize and publish a received ECM datagram.
fn store_ecm(
    shared: &Arc<CpShared>,
    tspkt_flag: bool,
    cp_number: u16,
    datagram: Vec<u8>,
    link: &StageLink,
    abort: &Arc<AtomicBool>,
) {
    let packets = if !tspkt_flag {
        // Section form: a short-form private section, length-validated and
        // packetized here. The PID is rewritten at insertion time.
        if datagram.len() < 3
            || 3 + (((datagram[1] as usize & 0x0F) << 8) | datagram[2] as usize) != datagram.len()
        {
            link.fail(StageError::Ecmg(format!(
                "ECMG returned an invalid ECM section ({} bytes)",
                datagram.len()
            )));
            abort.store(true, Ordering::Release);
            return;
        }
        OneShotPacketizer::new(pid::NULL).packetize(&datagram)
    } else {
        if datagram.is_empty() || datagram.len() % PKT_SIZE != 0 {
            link.fail(StageError::Ecmg(format!(
                "invalid ECM size ({} bytes), not a multiple of {PKT_SIZE}",
                datagram.len()
            )));
            abort.store(true, Ordering::Release);
            return;
        }
        datagram
            .chunks_exact(PKT_SIZE)
            .map(|chunk| {
                let mut bytes = [0u8; PKT_SIZE];
                bytes.copy_from_slice(chunk);
                TsPacket::from_bytes(bytes)
            })
            .collect()
    };

    debug!(
        "got ECM for crypto period {cp_number}, {} packets",
        packets.len()
    );

    {
        let mut ecm = shared.ecm.lock();
        ecm.packets = packets;
        ecm.next = 0;
    }
    // Last store: readiness is published after the packets are in place.
    shared.ecm_ok.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineShared;
    use crate::ts::psi::MAX_SECTION_SIZE;

    struct InstantEcmg {
        tspkt: bool,
    }

    impl EcmGenerator for InstantEcmg {
        fn delay_start(&self) -> i16 {
            0
        }

        fn section_tspkt_flag(&self) -> bool {
            self.tspkt
        }

        fn generate_ecm(&mut self, request: EcmRequest) -> Result<Vec<u8>, StageError> {
            if self.tspkt {
                Ok(TsPacket::null().bytes().to_vec())
            } else {
                // A short-form private section embedding the CP number.
                let body = vec![request.cp_number as u8; 16];
                let mut section = vec![0x80, 0x00, body.len() as u8];
                section.extend_from_slice(&body);
                assert!(section.len() <= MAX_SECTION_SIZE);
                Ok(section)
            }
        }

        fn submit_ecm(
            &mut self,
            request: EcmRequest,
            callback: crate::ecmg::EcmCallback,
        ) -> Result<(), StageError> {
            let result = self.generate_ecm(request).map_err(|e| e.to_string());
            callback(result);
            Ok(())
        }
    }

    fn test_ctx_parts() -> (Arc<AtomicBool>, StageLink) {
        (
            Arc::new(AtomicBool::new(false)),
            StageLink::new(PipelineShared::new(false), "scrambler", false),
        )
    }

    #[test]
    fn test_init_cycle_and_chain() {
        let mut ecmg = InstantEcmg { tspkt: false };
        let (abort, link) = test_ctx_parts();
        let mut ctx = EcmContext {
            ecmg: &mut ecmg,
            synchronous: true,
            access_criteria: &[],
            cp_duration: 100,
            abort: &abort,
            link: &link,
        };

        let mut cp0 = CryptoPeriod::new();
        cp0.init_cycle(0, &mut ctx);
        assert_eq!(cp0.cp_number(), 0);
        assert_eq!(cp0.cw_current().len(), CW_SIZE);
        assert!(cp0.ecm_ready());

        let mut cp1 = CryptoPeriod::new();
        cp1.init_next(cp0.chain_data(), &mut ctx);
        assert_eq!(cp1.cp_number(), 1);
        // CW chaining: next of cp0 is current of cp1.
        assert_eq!(cp1.cw_current(), &cp0.cw_next[..]);
        assert!(!abort.load(Ordering::Acquire));
    }

    #[test]
    fn test_ecm_packet_cycle() {
        let mut ecmg = InstantEcmg { tspkt: false };
        let (abort, link) = test_ctx_parts();
        let mut ctx = EcmContext {
            ecmg: &mut ecmg,
            synchronous: true,
            access_criteria: &[],
            cp_duration: 100,
            abort: &abort,
            link: &link,
        };

        let mut cp = CryptoPeriod::new();
        cp.init_cycle(5, &mut ctx);

        let mut cc = 0u8;
        let first = cp.next_ecm_packet(0x0101, &mut cc);
        assert_eq!(first.pid(), 0x0101);
        assert_eq!(first.cc(), 0);
        assert_eq!(cc, 1);
        // Single-packet ECM cycles onto itself, CC keeps counting.
        let second = cp.next_ecm_packet(0x0101, &mut cc);
        assert_eq!(second.cc(), 1);
        assert_eq!(second.payload(), first.payload());
    }

    #[test]
    fn test_not_ready_yields_null() {
        let cp = CryptoPeriod::new();
        let mut cc = 3u8;
        let pkt = cp.next_ecm_packet(0x0101, &mut cc);
        assert!(pkt.is_null());
        assert_eq!(cc, 3);
    }

    #[test]
    fn test_packet_form_ecm() {
        let mut ecmg = InstantEcmg { tspkt: true };
        let (abort, link) = test_ctx_parts();
        let mut ctx = EcmContext {
            ecmg: &mut ecmg,
            synchronous: true,
            access_criteria: &[],
            cp_duration: 100,
            abort: &abort,
            link: &link,
        };

        let mut cp = CryptoPeriod::new();
        cp.init_cycle(0, &mut ctx);
        assert!(cp.ecm_ready());
        assert!(!abort.load(Ordering::Acquire));
    }

    #[test]
    fn test_malformed_section_raises_abort() {
        struct BadEcmg;
        impl EcmGenerator for BadEcmg {
            fn delay_start(&self) -> i16 {
                0
            }
            fn section_tspkt_flag(&self) -> bool {
                false
            }
            fn generate_ecm(&mut self, _request: EcmRequest) -> Result<Vec<u8>, StageError> {
                Ok(vec![0x80, 0x00]) // truncated
            }
            fn submit_ecm(
                &mut self,
                _request: EcmRequest,
                _callback: crate::ecmg::EcmCallback,
            ) -> Result<(), StageError> {
                unreachable!()
            }
        }

        let mut ecmg = BadEcmg;
        let (abort, link) = test_ctx_parts();
        let mut ctx = EcmContext {
            ecmg: &mut ecmg,
            synchronous: true,
            access_criteria: &[],
            cp_duration: 100,
            abort: &abort,
            link: &link,
        };

        let mut cp = CryptoPeriod::new();
        cp.init_cycle(0, &mut ctx);
        assert!(!cp.ecm_ready());
        assert!(abort.load(Ordering::Acquire));
    }
}
