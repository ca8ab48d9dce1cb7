//! Section-to-packet emitters.
//!
//! `OneShotPacketizer` turns one section into a packet vector once (ECMs);
//! `CyclingPacketizer` re-emits a table continuously on a PID, replacing
//! packets in the stream as they flow through (the patched PMT).

use super::packet::{TsPacket, PKT_SIZE, SYNC_BYTE};
use super::CC_MASK;

/// Payload capacity of a TS packet without adaptation field.
const PAYLOAD_CAPACITY: usize = PKT_SIZE - 4;

/// Build the packet holding `chunk` at the current cycle position.
fn section_packet(pid: u16, cc: u8, unit_start: bool, chunk: &[u8]) -> TsPacket {
    let mut b = [0xFFu8; PKT_SIZE];
    b[0] = SYNC_BYTE;
    b[1] = ((pid >> 8) & 0x1F) as u8 | if unit_start { 0x40 } else { 0 };
    b[2] = (pid & 0xFF) as u8;
    b[3] = 0x10 | (cc & CC_MASK);
    let mut offset = 4;
    if unit_start {
        b[4] = 0; // pointer_field
        offset = 5;
    }
    b[offset..offset + chunk.len()].copy_from_slice(chunk);
    TsPacket::from_bytes(b)
}

/// Packetizes one section into TS packets, once.
pub struct OneShotPacketizer {
    pid: u16,
}

impl OneShotPacketizer {
    /// Create a packetizer bound to `pid`.
    pub fn new(pid: u16) -> Self {
        OneShotPacketizer { pid }
    }

    /// Produce the packets carrying `section`, starting at continuity
    /// counter zero. The caller rewrites CC at insertion time.
    pub fn packetize(&self, section: &[u8]) -> Vec<TsPacket> {
        let mut packets = Vec::new();
        let mut offset = 0;
        let mut cc = 0u8;

        while offset < section.len() {
            let unit_start = offset == 0;
            let capacity = if unit_start {
                PAYLOAD_CAPACITY - 1
            } else {
                PAYLOAD_CAPACITY
            };
            let chunk = &section[offset..(offset + capacity).min(section.len())];
            packets.push(section_packet(self.pid, cc, unit_start, chunk));
            offset += chunk.len();
            cc = (cc + 1) & CC_MASK;
        }

        packets
    }
}

/// Re-emits a table continuously on one PID.
///
/// Every call to [`CyclingPacketizer::next_packet`] returns the next packet
/// of the current cycle; when the section is exhausted a new cycle starts.
/// Each section begins on a fresh packet and the tail is stuffed with 0xFF,
/// so a cycle is always a whole number of packets. The continuity counter
/// runs across cycles and table updates.
pub struct CyclingPacketizer {
    pid: u16,
    section: Vec<u8>,
    offset: usize,
    cc: u8,
}

impl CyclingPacketizer {
    /// Create a packetizer bound to `pid` with no table yet.
    pub fn new(pid: u16) -> Self {
        CyclingPacketizer {
            pid,
            section: Vec::new(),
            offset: 0,
            cc: 0,
        }
    }

    /// PID this packetizer emits on.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Replace the emitted table. The current cycle restarts; the
    /// continuity counter is preserved.
    pub fn set_section(&mut self, section: Vec<u8>) {
        self.section = section;
        self.offset = 0;
    }

    /// True when a table has been loaded.
    pub fn has_section(&self) -> bool {
        !self.section.is_empty()
    }

    /// Produce the next packet of the cycle. Returns a null packet when no
    /// table has been loaded yet.
    pub fn next_packet(&mut self) -> TsPacket {
        if self.section.is_empty() {
            return TsPacket::null();
        }

        let unit_start = self.offset == 0;
        let capacity = if unit_start {
            PAYLOAD_CAPACITY - 1
        } else {
            PAYLOAD_CAPACITY
        };
        let end = (self.offset + capacity).min(self.section.len());
        let pkt = section_packet(self.pid, self.cc, unit_start, &self.section[self.offset..end]);

        self.cc = (self.cc + 1) & CC_MASK;
        self.offset = if end >= self.section.len() { 0 } else { end };
        pkt
    }
}
