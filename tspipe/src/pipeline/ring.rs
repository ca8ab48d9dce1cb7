//! The shared packet ring: a fixed circular array of packet slots plus
//! per-slot metadata, shared by every stage thread.
//!
//! The ring itself performs no synchronisation. Exclusive access to slot
//! ranges is transferred between stages through the boundary handoffs
//! (`handoff.rs`); at any instant every slot belongs to exactly one stage,
//! so the raw accessors below never alias.

use std::cell::UnsafeCell;

use crate::ts::{TsPacket, PKT_SIZE};

/// Per-slot metadata word.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotMeta {
    /// The packet closes a batch: downstream is woken even below its
    /// minimum threshold.
    pub flush: bool,
    /// The published TS bitrate changed at this packet.
    pub bitrate_changed: bool,
}

/// Fixed-capacity ring of TS packet slots.
pub struct PacketRing {
    pkts: Box<[UnsafeCell<TsPacket>]>,
    meta: Box<[UnsafeCell<SlotMeta>]>,
}

impl PacketRing {
    /// Allocate a ring of `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be at least one packet");
        let pkts = (0..capacity)
            .map(|_| UnsafeCell::new(TsPacket::null()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let meta = (0..capacity)
            .map(|_| UnsafeCell::new(SlotMeta::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        PacketRing { pkts, meta }
    }

    /// Ring capacity from a buffer size in mebibytes.
    pub fn capacity_for_mb(size_mb: usize) -> usize {
        (size_mb * 1024 * 1024 / PKT_SIZE).max(1)
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.pkts.len()
    }

    /// Mutable access to one packet slot.
    ///
    /// # Safety
    /// The caller must own `index` through the handoff protocol: the slot
    /// is inside a region the caller acquired and has not yet passed on.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn packet_mut(&self, index: usize) -> &mut TsPacket {
        &mut *self.pkts[index].get()
    }

    /// Mutable access to a contiguous run of packet slots.
    ///
    /// # Safety
    /// Same ownership requirement as [`PacketRing::packet_mut`], for the
    /// whole range; `start + count` must not exceed the capacity (the
    /// handoffs only hand out runs that stop at the ring's physical end).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn packets_mut(&self, start: usize, count: usize) -> &mut [TsPacket] {
        debug_assert!(start + count <= self.pkts.len());
        std::slice::from_raw_parts_mut(self.pkts[start].get(), count)
    }

    /// Mutable access to one metadata slot.
    ///
    /// # Safety
    /// Same ownership requirement as [`PacketRing::packet_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn meta_mut(&self, index: usize) -> &mut SlotMeta {
        &mut *self.meta[index].get()
    }
}

// Safety: slots are plain bytes; cross-thread exclusion is provided by the
// handoff protocol, which transfers ownership of disjoint slot ranges with
// the boundary mutex establishing the happens-before edge.
unsafe impl Send for PacketRing {}
unsafe impl Sync for PacketRing {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_for_mb() {
        assert_eq!(PacketRing::capacity_for_mb(16), 16 * 1024 * 1024 / 188);
        // Degenerate size still yields a usable ring.
        assert_eq!(PacketRing::capacity_for_mb(0), 1);
    }

    #[test]
    fn test_slot_access() {
        let ring = PacketRing::new(8);
        unsafe {
            ring.packet_mut(3).set_pid(0x0123);
            ring.meta_mut(3).flush = true;
        }
        unsafe {
            assert_eq!(ring.packet_mut(3).pid(), 0x0123);
            assert!(ring.meta_mut(3).flush);
            assert!(!ring.meta_mut(4).flush);
        }
    }

    #[test]
    fn test_contiguous_slice() {
        let ring = PacketRing::new(8);
        unsafe {
            let slots = ring.packets_mut(2, 4);
            assert_eq!(slots.len(), 4);
            for (i, slot) in slots.iter_mut().enumerate() {
                slot.set_pid(0x100 + i as u16);
            }
            assert_eq!(ring.packet_mut(5).pid(), 0x103);
        }
    }
}
