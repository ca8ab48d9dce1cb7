//! Transport stream bitrate estimation and publication.
//!
//! The input worker feeds every packet through a [`BitrateMonitor`]; the
//! monitor estimates the TS bitrate from PCR deltas on a reference PID and
//! publishes it to a shared [`BitrateCell`] at the configured interval.
//! Every stage reads the cell before packet-count-based schedule
//! computations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::ts::{TsPacket, PKT_SIZE, SYSTEM_CLOCK_FREQ};

/// Shared TS bitrate in bits per second. Single producer, many readers;
/// zero means "not yet known".
pub struct BitrateCell(AtomicU64);

impl BitrateCell {
    /// Create a cell holding "unknown".
    pub fn new() -> Self {
        BitrateCell(AtomicU64::new(0))
    }

    /// Publish a new bitrate.
    pub fn set(&self, bitrate: u64) {
        self.0.store(bitrate, Ordering::Release);
    }

    /// Read the current bitrate, 0 when unknown.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for BitrateCell {
    fn default() -> Self {
        BitrateCell::new()
    }
}

/// Estimates the TS bitrate from PCR deltas and publishes it periodically.
pub struct BitrateMonitor {
    /// Fixed override from `--bitrate`; published once, never re-estimated.
    fixed: Option<u64>,
    adjust_interval: Duration,
    last_publish: Instant,
    published: u64,
    // PCR reference state.
    ref_pid: Option<u16>,
    last_pcr: Option<(u64, u64)>, // (pcr, packet index)
    estimate: u64,
    packet_index: u64,
    first_publish_done: bool,
}

impl BitrateMonitor {
    /// Create a monitor. `fixed` comes from the `--bitrate` override.
    pub fn new(fixed: Option<u64>, adjust_interval: Duration) -> Self {
        BitrateMonitor {
            fixed,
            adjust_interval,
            last_publish: Instant::now(),
            published: 0,
            ref_pid: None,
            last_pcr: None,
            estimate: 0,
            packet_index: 0,
            first_publish_done: false,
        }
    }

    /// Feed one input packet. Returns true when the published bitrate
    /// changed, so the caller can set the packet's bitrate-changed bit.
    pub fn feed(&mut self, pkt: &TsPacket, cell: &BitrateCell) -> bool {
        let index = self.packet_index;
        self.packet_index += 1;

        if let Some(fixed) = self.fixed {
            if !self.first_publish_done {
                self.first_publish_done = true;
                self.published = fixed;
                cell.set(fixed);
                info!("input bitrate forced to {fixed} b/s");
                return true;
            }
            return false;
        }

        if pkt.has_pcr() {
            let pid = pkt.pid();
            if self.ref_pid.is_none() {
                self.ref_pid = Some(pid);
            }
            if self.ref_pid == Some(pid) {
                let pcr = pkt.pcr();
                if let Some((prev_pcr, prev_index)) = self.last_pcr {
                    if pcr > prev_pcr && index > prev_index {
                        let bits = (index - prev_index) * PKT_SIZE as u64 * 8;
                        self.estimate = bits * SYSTEM_CLOCK_FREQ / (pcr - prev_pcr);
                    } else {
                        // PCR wrap or discontinuity: restart the delta.
                        debug!("PCR discontinuity on PID 0x{pid:04X}, restarting bitrate estimate");
                    }
                }
                self.last_pcr = Some((pcr, index));
            }
        }

        if self.estimate == 0 {
            return false;
        }

        // First estimate is published immediately, later ones at the
        // adjustment interval.
        let due = !self.first_publish_done || self.last_publish.elapsed() >= self.adjust_interval;
        if !due {
            return false;
        }
        self.last_publish = Instant::now();
        self.first_publish_done = true;

        if self.estimate != self.published {
            self.published = self.estimate;
            cell.set(self.estimate);
            debug!("TS bitrate estimate: {} b/s", self.estimate);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::test_support::{data_packet, pcr_packet};

    #[test]
    fn test_fixed_bitrate_published_once() {
        let cell = BitrateCell::new();
        let mut monitor = BitrateMonitor::new(Some(5_000_000), Duration::from_secs(5));

        let pkt = data_packet(0x100, 0);
        assert!(monitor.feed(&pkt, &cell));
        assert_eq!(cell.get(), 5_000_000);
        assert!(!monitor.feed(&pkt, &cell));
        assert_eq!(cell.get(), 5_000_000);
    }

    #[test]
    fn test_pcr_estimate() {
        let cell = BitrateCell::new();
        let mut monitor = BitrateMonitor::new(None, Duration::from_secs(5));

        // 100 packets between two PCRs one second apart:
        // 100 * 188 * 8 = 150_400 b/s.
        assert!(!monitor.feed(&pcr_packet(0x100, 0), &cell));
        for _ in 0..99 {
            assert!(!monitor.feed(&data_packet(0x100, 0), &cell));
        }
        let changed = monitor.feed(&pcr_packet(0x100, SYSTEM_CLOCK_FREQ), &cell);
        assert!(changed);
        assert_eq!(cell.get(), 150_400);
    }

    #[test]
    fn test_other_pid_pcr_ignored() {
        let cell = BitrateCell::new();
        let mut monitor = BitrateMonitor::new(None, Duration::from_secs(5));

        monitor.feed(&pcr_packet(0x100, 0), &cell);
        // PCRs on another PID must not disturb the reference delta.
        monitor.feed(&pcr_packet(0x200, 999), &cell);
        for _ in 0..98 {
            monitor.feed(&data_packet(0x100, 0), &cell);
        }
        assert!(monitor.feed(&pcr_packet(0x100, SYSTEM_CLOCK_FREQ), &cell));
        assert_eq!(cell.get(), 150_400);
    }

    #[test]
    fn test_unknown_until_two_pcrs() {
        let cell = BitrateCell::new();
        let mut monitor = BitrateMonitor::new(None, Duration::from_secs(5));
        assert!(!monitor.feed(&pcr_packet(0x100, 1000), &cell));
        assert_eq!(cell.get(), 0);
    }
}
