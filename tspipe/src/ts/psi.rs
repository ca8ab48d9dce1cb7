//! PSI section handling: reassembly from TS packets, parsing and building.

use crc::{Crc, CRC_32_MPEG_2};

/// CRC-32/MPEG-2, used by every PSI section.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Longest legal PSI section (private section limit).
pub const MAX_SECTION_SIZE: usize = 4096;

/// Parsed header of a long-form PSI section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsiHeader {
    /// Table ID.
    pub table_id: u8,
    /// Section syntax indicator.
    pub section_syntax_indicator: bool,
    /// Section length (bytes following the length field).
    pub section_length: usize,
    /// Table ID extension (program number for a PMT).
    pub table_id_extension: u16,
    /// Version number.
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next_indicator: bool,
    /// Section number.
    pub section_number: u8,
    /// Last section number.
    pub last_section_number: u8,
}

/// A parsed PSI section: header, body and validated CRC.
#[derive(Debug, Clone)]
pub struct PsiSection<'a> {
    /// Parsed section header.
    pub header: PsiHeader,
    /// Section body, between the header and the CRC.
    pub data: &'a [u8],
    /// CRC-32 value carried by the section.
    pub crc32: u32,
}

impl<'a> PsiSection<'a> {
    /// Parse a complete section, validating length and CRC.
    pub fn parse(buf: &'a [u8]) -> Result<Self, &'static str> {
        if buf.len() < 12 {
            return Err("section too short");
        }

        let table_id = buf[0];
        let section_syntax_indicator = buf[1] & 0x80 != 0;
        let section_length = ((buf[1] as usize & 0x0F) << 8) | buf[2] as usize;
        if 3 + section_length > MAX_SECTION_SIZE {
            return Err("section too long");
        }
        let total = 3 + section_length;
        if buf.len() < total {
            return Err("truncated section");
        }
        if !section_syntax_indicator {
            return Err("short-form section");
        }

        let header = PsiHeader {
            table_id,
            section_syntax_indicator,
            section_length,
            table_id_extension: ((buf[3] as u16) << 8) | buf[4] as u16,
            version_number: (buf[5] >> 1) & 0x1F,
            current_next_indicator: buf[5] & 0x01 != 0,
            section_number: buf[6],
            last_section_number: buf[7],
        };

        let crc32 = u32::from_be_bytes([buf[total - 4], buf[total - 3], buf[total - 2], buf[total - 1]]);
        if CRC32.checksum(&buf[..total - 4]) != crc32 {
            return Err("bad section CRC");
        }

        Ok(PsiSection {
            header,
            data: &buf[8..total - 4],
            crc32,
        })
    }
}

/// Build a complete long-form section: header, `data` body, CRC.
pub fn build_section(table_id: u8, table_id_extension: u16, version: u8, data: &[u8]) -> Vec<u8> {
    // 5 bytes of post-length header + data + 4 bytes of CRC.
    let section_length = 5 + data.len() + 4;
    debug_assert!(3 + section_length <= MAX_SECTION_SIZE);

    let mut out = Vec::with_capacity(3 + section_length);
    out.push(table_id);
    out.push(0xB0 | ((section_length >> 8) & 0x0F) as u8);
    out.push((section_length & 0xFF) as u8);
    out.push((table_id_extension >> 8) as u8);
    out.push((table_id_extension & 0xFF) as u8);
    out.push(0xC1 | ((version & 0x1F) << 1));
    out.push(0); // section_number
    out.push(0); // last_section_number
    out.extend_from_slice(data);
    let crc = CRC32.checksum(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// Reassembles PSI sections from TS packet payloads on one PID.
///
/// Only the first section starting in a payload unit is collected; the
/// stages using this collector watch tables that are re-broadcast
/// continuously, so skipped sections are seen again on the next cycle.
#[derive(Default)]
pub struct SectionCollector {
    buf: Vec<u8>,
    expected: Option<usize>,
    last_cc: Option<u8>,
    complete: bool,
}

impl SectionCollector {
    /// Feed one packet's payload.
    ///
    /// Returns true when a complete section is available via
    /// [`SectionCollector::section`].
    pub fn add_data(&mut self, payload: &[u8], cc: u8, payload_unit_start: bool) -> bool {
        if self.complete {
            return true;
        }

        if payload_unit_start {
            if payload.is_empty() {
                return false;
            }
            let pointer = payload[0] as usize;
            if 1 + pointer >= payload.len() {
                self.reset_partial();
                return false;
            }
            self.buf.clear();
            self.buf.extend_from_slice(&payload[1 + pointer..]);
            self.expected = None;
            self.last_cc = Some(cc);
        } else {
            match self.last_cc {
                // Continuation must follow the previous packet directly.
                Some(prev) if (prev + 1) & 0x0F == cc => {
                    self.last_cc = Some(cc);
                    self.buf.extend_from_slice(payload);
                }
                _ => {
                    self.reset_partial();
                    return false;
                }
            }
        }

        if self.expected.is_none() && self.buf.len() >= 3 {
            let len = ((self.buf[1] as usize & 0x0F) << 8) | self.buf[2] as usize;
            if 3 + len > MAX_SECTION_SIZE {
                self.reset_partial();
                return false;
            }
            self.expected = Some(3 + len);
        }

        if let Some(expected) = self.expected {
            if self.buf.len() >= expected {
                self.buf.truncate(expected);
                self.complete = true;
            }
        }

        self.complete
    }

    /// The complete section bytes, if one has been assembled.
    pub fn section(&self) -> Option<&[u8]> {
        self.complete.then_some(self.buf.as_slice())
    }

    /// Discard the assembled section and start over.
    pub fn clear(&mut self) {
        self.reset_partial();
    }

    fn reset_partial(&mut self) {
        self.buf.clear();
        self.expected = None;
        self.last_cc = None;
        self.complete = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_parse_roundtrip() {
        let data = vec![0xE1, 0x00, 0xF0, 0x00];
        let section = build_section(0x02, 0x0101, 3, &data);
        let parsed = PsiSection::parse(&section).unwrap();
        assert_eq!(parsed.header.table_id, 0x02);
        assert_eq!(parsed.header.table_id_extension, 0x0101);
        assert_eq!(parsed.header.version_number, 3);
        assert!(parsed.header.current_next_indicator);
        assert_eq!(parsed.data, &data[..]);
    }

    #[test]
    fn test_parse_rejects_bad_crc() {
        let mut section = build_section(0x00, 1, 0, &[0x00, 0x01, 0xE0, 0x20]);
        let last = section.len() - 1;
        section[last] ^= 0xFF;
        assert!(matches!(PsiSection::parse(&section), Err("bad section CRC")));
    }

    #[test]
    fn test_collector_single_packet() {
        let section = build_section(0x00, 1, 0, &[0x00, 0x01, 0xE0, 0x20]);
        let mut payload = vec![0u8]; // pointer_field
        payload.extend_from_slice(&section);

        let mut collector = SectionCollector::default();
        assert!(collector.add_data(&payload, 0, true));
        assert_eq!(collector.section().unwrap(), &section[..]);
    }

    #[test]
    fn test_collector_multi_packet() {
        let body = vec![0xABu8; 300];
        let section = build_section(0x02, 7, 1, &body);
        let mut first = vec![0u8];
        first.extend_from_slice(&section[..183]);

        let mut collector = SectionCollector::default();
        assert!(!collector.add_data(&first, 5, true));
        assert!(collector.add_data(&section[183..], 6, false));
        assert_eq!(collector.section().unwrap(), &section[..]);
    }

    #[test]
    fn test_collector_cc_discontinuity_discards() {
        let body = vec![0xCDu8; 300];
        let section = build_section(0x02, 7, 1, &body);
        let mut first = vec![0u8];
        first.extend_from_slice(&section[..183]);

        let mut collector = SectionCollector::default();
        assert!(!collector.add_data(&first, 5, true));
        // CC jumps from 5 to 7: the partial section must be dropped.
        assert!(!collector.add_data(&section[183..], 7, false));
        assert!(collector.section().is_none());
    }
}
