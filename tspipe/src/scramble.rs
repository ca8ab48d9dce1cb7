//! Payload scrambling: a keyed block cipher over TS packet payloads with
//! even/odd control-word slots.
//!
//! The cipher is AES-128 in CBC mode with a zero IV (the DVB-CISSA
//! construction); a trailing payload block shorter than 16 bytes is left in
//! the clear. The transport_scrambling_control bits carry the key parity:
//! `10` for the even slot, `11` for the odd slot.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::StageError;
use crate::ts::TsPacket;

/// Control word size in bytes (AES-128 key).
pub const CW_SIZE: usize = 16;

/// DVB-CISSA version 1 value for the scrambling_descriptor.
pub const SCRAMBLING_MODE_CISSA: u8 = 0x10;

const BLOCK: usize = 16;

/// The packet scrambler: two key slots selected by crypto-period parity.
pub struct TsScrambling {
    keys: [Option<Aes128>; 2],
    encrypt_parity: usize,
}

impl TsScrambling {
    /// A scrambler with no keys loaded.
    pub fn new() -> Self {
        TsScrambling {
            keys: [None, None],
            encrypt_parity: 0,
        }
    }

    /// Load a control word into the slot given by the crypto-period
    /// number's parity.
    pub fn set_cw(&mut self, cw: &[u8], cp_number: u16) -> Result<(), StageError> {
        if cw.len() != CW_SIZE {
            return Err(StageError::Options(format!(
                "invalid control word size: {} bytes, expected {CW_SIZE}",
                cw.len()
            )));
        }
        self.keys[(cp_number & 1) as usize] = Some(Aes128::new(GenericArray::from_slice(cw)));
        Ok(())
    }

    /// Select the slot used by [`TsScrambling::encrypt`] from the
    /// crypto-period number.
    pub fn set_encrypt_parity(&mut self, cp_number: u16) {
        self.encrypt_parity = (cp_number & 1) as usize;
    }

    /// True when at least one key slot is loaded.
    pub fn has_key(&self) -> bool {
        self.keys.iter().any(|k| k.is_some())
    }

    /// Scramble the packet payload in place and tag the scrambling control
    /// bits with the current parity.
    pub fn encrypt(&self, pkt: &mut TsPacket) -> Result<(), StageError> {
        let parity = self.encrypt_parity;
        let cipher = self.keys[parity]
            .as_ref()
            .ok_or_else(|| StageError::Runtime(format!("no control word in slot {parity}")))?;

        let mut prev = [0u8; BLOCK];
        for chunk in pkt.payload_mut().chunks_exact_mut(BLOCK) {
            for (byte, p) in chunk.iter_mut().zip(prev.iter()) {
                *byte ^= p;
            }
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
            prev.copy_from_slice(chunk);
        }

        pkt.set_scrambling_control(0b10 | parity as u8);
        Ok(())
    }

    /// Descramble a packet in place, selecting the key slot from the
    /// packet's scrambling control bits.
    pub fn decrypt(&self, pkt: &mut TsPacket) -> Result<(), StageError> {
        let sc = pkt.scrambling_control();
        if sc & 0b10 == 0 {
            return Ok(());
        }
        let parity = (sc & 1) as usize;
        let cipher = self.keys[parity]
            .as_ref()
            .ok_or_else(|| StageError::Runtime(format!("no control word in slot {parity}")))?;

        let mut prev = [0u8; BLOCK];
        for chunk in pkt.payload_mut().chunks_exact_mut(BLOCK) {
            let mut ct = [0u8; BLOCK];
            ct.copy_from_slice(chunk);
            cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
            for (byte, p) in chunk.iter_mut().zip(prev.iter()) {
                *byte ^= p;
            }
            prev = ct;
        }

        pkt.set_scrambling_control(0);
        Ok(())
    }
}

impl Default for TsScrambling {
    fn default() -> Self {
        TsScrambling::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::test_support::{data_packet, pcr_packet};

    fn cw(seed: u8) -> [u8; CW_SIZE] {
        let mut cw = [0u8; CW_SIZE];
        for (i, byte) in cw.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
        cw
    }

    #[test]
    fn test_encrypt_decrypt_identity() {
        let mut scrambling = TsScrambling::new();
        scrambling.set_cw(&cw(0x11), 0).unwrap();
        scrambling.set_encrypt_parity(0);

        let clear = data_packet(0x100, 5);
        let mut pkt = clear;
        scrambling.encrypt(&mut pkt).unwrap();
        assert!(pkt.is_scrambled());
        assert_eq!(pkt.scrambling_control(), 0b10);
        assert_ne!(pkt.payload(), clear.payload());
        // Header untouched.
        assert_eq!(pkt.pid(), 0x100);
        assert_eq!(pkt.cc(), 5);

        scrambling.decrypt(&mut pkt).unwrap();
        assert!(!pkt.is_scrambled());
        assert_eq!(pkt.bytes(), clear.bytes());
    }

    #[test]
    fn test_parity_follows_cp_number() {
        let mut scrambling = TsScrambling::new();
        scrambling.set_cw(&cw(0x11), 2).unwrap(); // even slot
        scrambling.set_cw(&cw(0x22), 3).unwrap(); // odd slot

        let mut pkt = data_packet(0x100, 0);
        scrambling.set_encrypt_parity(3);
        scrambling.encrypt(&mut pkt).unwrap();
        assert_eq!(pkt.scrambling_control(), 0b11);

        scrambling.decrypt(&mut pkt).unwrap();
        assert_eq!(pkt.bytes(), data_packet(0x100, 0).bytes());
    }

    #[test]
    fn test_short_residue_left_clear() {
        // Payload of 176 bytes after a 7-byte adaptation field: exactly
        // 11 blocks. A packet with a 184-byte payload has a 8-byte
        // residue past 11 blocks.
        let mut scrambling = TsScrambling::new();
        scrambling.set_cw(&cw(0x33), 0).unwrap();

        let clear = pcr_packet(0x100, 42);
        let mut pkt = clear;
        let residue_len = pkt.payload().len() % 16;
        scrambling.encrypt(&mut pkt).unwrap();
        if residue_len > 0 {
            let len = pkt.payload().len();
            assert_eq!(
                &pkt.payload()[len - residue_len..],
                &clear.payload()[len - residue_len..],
            );
        }
        scrambling.decrypt(&mut pkt).unwrap();
        assert_eq!(pkt.bytes(), clear.bytes());
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let scrambling = TsScrambling::new();
        let mut pkt = data_packet(0x100, 0);
        assert!(scrambling.encrypt(&mut pkt).is_err());
    }

    #[test]
    fn test_rejects_bad_cw_size() {
        let mut scrambling = TsScrambling::new();
        assert!(scrambling.set_cw(&[0u8; 8], 0).is_err());
    }
}
