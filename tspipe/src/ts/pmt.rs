//! PMT (Program Map Table) parsing and rebuilding.
//!
//! Unlike the other tables, the PMT must be writable: the scrambler patches
//! CA and scrambling descriptors into it and re-emits the result.

use super::psi::{build_section, PsiSection};
use super::{descriptor_tag, table_id};

/// Stream type constants.
pub mod stream_type {
    /// MPEG-1 Video.
    pub const MPEG1_VIDEO: u8 = 0x01;
    /// MPEG-2 Video.
    pub const MPEG2_VIDEO: u8 = 0x02;
    /// MPEG-1 Audio.
    pub const MPEG1_AUDIO: u8 = 0x03;
    /// MPEG-2 Audio.
    pub const MPEG2_AUDIO: u8 = 0x04;
    /// MPEG-2 PES Private Data (DVB subtitles travel here).
    pub const PES_PRIVATE_DATA: u8 = 0x06;
    /// AAC Audio (ADTS).
    pub const AAC_AUDIO: u8 = 0x0F;
    /// AAC Audio (LATM).
    pub const AAC_LATM: u8 = 0x11;
    /// MPEG-4 Video (H.264/AVC).
    pub const H264_VIDEO: u8 = 0x1B;
    /// HEVC Video (H.265).
    pub const H265_VIDEO: u8 = 0x24;
}

/// DVB subtitling descriptor tag, looked for inside PES private data streams.
const SUBTITLING_DESCRIPTOR: u8 = 0x59;

/// A CA descriptor advertising an ECM PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaDescriptor {
    /// CA system identifier.
    pub ca_system_id: u16,
    /// PID carrying the ECMs.
    pub ca_pid: u16,
    /// CAS-private trailing bytes.
    pub private_data: Vec<u8>,
}

impl CaDescriptor {
    /// Serialise as tag, length, body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.private_data.len());
        out.push(descriptor_tag::CA);
        out.push((4 + self.private_data.len()) as u8);
        out.extend_from_slice(&self.ca_system_id.to_be_bytes());
        out.push(0xE0 | ((self.ca_pid >> 8) & 0x1F) as u8);
        out.push((self.ca_pid & 0xFF) as u8);
        out.extend_from_slice(&self.private_data);
        out
    }
}

/// A DVB scrambling descriptor naming the scrambling algorithm in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScramblingDescriptor {
    /// Scrambling mode value.
    pub scrambling_mode: u8,
}

impl ScramblingDescriptor {
    /// Serialise as tag, length, body.
    pub fn encode(&self) -> Vec<u8> {
        vec![descriptor_tag::SCRAMBLING, 1, self.scrambling_mode]
    }
}

/// A single elementary stream entry in the PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    /// Stream type.
    pub stream_type: u8,
    /// Elementary PID.
    pub elementary_pid: u16,
    /// ES info descriptors, raw.
    pub descriptors: Vec<u8>,
}

impl PmtStream {
    /// Check if this is a video stream.
    pub fn is_video(&self) -> bool {
        matches!(
            self.stream_type,
            stream_type::MPEG1_VIDEO
                | stream_type::MPEG2_VIDEO
                | stream_type::H264_VIDEO
                | stream_type::H265_VIDEO
        )
    }

    /// Check if this is an audio stream.
    pub fn is_audio(&self) -> bool {
        matches!(
            self.stream_type,
            stream_type::MPEG1_AUDIO
                | stream_type::MPEG2_AUDIO
                | stream_type::AAC_AUDIO
                | stream_type::AAC_LATM
        )
    }

    /// Check if this is a subtitle stream (private data carrying a DVB
    /// subtitling descriptor).
    pub fn is_subtitles(&self) -> bool {
        self.stream_type == stream_type::PES_PRIVATE_DATA
            && descriptor_tags(&self.descriptors).any(|t| t == SUBTITLING_DESCRIPTOR)
    }

    /// Append a descriptor to the ES info loop.
    pub fn add_descriptor(&mut self, encoded: &[u8]) {
        self.descriptors.extend_from_slice(encoded);
    }
}

/// Parsed PMT (Program Map Table).
#[derive(Debug, Clone, Default)]
pub struct PmtTable {
    /// Program number (service ID).
    pub program_number: u16,
    /// Version number.
    pub version_number: u8,
    /// PCR PID.
    pub pcr_pid: u16,
    /// Program info descriptors, raw.
    pub program_info: Vec<u8>,
    /// Elementary streams.
    pub streams: Vec<PmtStream>,
}

impl PmtTable {
    /// Parse a PMT from a PSI section.
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        if section.header.table_id != table_id::PMT {
            return Err("Not a PMT section");
        }

        let data = section.data;
        if data.len() < 4 {
            return Err("PMT data too short");
        }

        let pcr_pid = ((data[0] as u16 & 0x1F) << 8) | data[1] as u16;
        let program_info_length = ((data[2] as usize & 0x0F) << 8) | data[3] as usize;

        if data.len() < 4 + program_info_length {
            return Err("Invalid program info length");
        }

        let program_info = data[4..4 + program_info_length].to_vec();

        let mut pmt = PmtTable {
            program_number: section.header.table_id_extension,
            version_number: section.header.version_number,
            pcr_pid,
            program_info,
            streams: Vec::new(),
        };

        // Parse elementary stream loop
        let mut offset = 4 + program_info_length;
        while offset + 5 <= data.len() {
            let stream_type = data[offset];
            let elementary_pid = ((data[offset + 1] as u16 & 0x1F) << 8) | data[offset + 2] as u16;
            let es_info_length = ((data[offset + 3] as usize & 0x0F) << 8) | data[offset + 4] as usize;

            offset += 5;

            if offset + es_info_length > data.len() {
                break;
            }

            let descriptors = data[offset..offset + es_info_length].to_vec();
            offset += es_info_length;

            pmt.streams.push(PmtStream {
                stream_type,
                elementary_pid,
                descriptors,
            });
        }

        Ok(pmt)
    }

    /// Append a descriptor to the program info loop.
    pub fn add_program_descriptor(&mut self, encoded: &[u8]) {
        self.program_info.extend_from_slice(encoded);
    }

    /// Serialise the PMT back into a complete section, CRC included.
    pub fn build_section(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(0xE0 | ((self.pcr_pid >> 8) & 0x1F) as u8);
        body.push((self.pcr_pid & 0xFF) as u8);
        body.push(0xF0 | ((self.program_info.len() >> 8) & 0x0F) as u8);
        body.push((self.program_info.len() & 0xFF) as u8);
        body.extend_from_slice(&self.program_info);

        for stream in &self.streams {
            body.push(stream.stream_type);
            body.push(0xE0 | ((stream.elementary_pid >> 8) & 0x1F) as u8);
            body.push((stream.elementary_pid & 0xFF) as u8);
            body.push(0xF0 | ((stream.descriptors.len() >> 8) & 0x0F) as u8);
            body.push((stream.descriptors.len() & 0xFF) as u8);
            body.extend_from_slice(&stream.descriptors);
        }

        build_section(
            table_id::PMT,
            self.program_number,
            self.version_number,
            &body,
        )
    }

    /// Get all elementary PIDs.
    pub fn all_pids(&self) -> Vec<u16> {
        self.streams.iter().map(|s| s.elementary_pid).collect()
    }
}

/// Iterate over the descriptor tags in a raw descriptor loop.
fn descriptor_tags(raw: &[u8]) -> impl Iterator<Item = u8> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        if offset + 2 > raw.len() {
            return None;
        }
        let tag = raw[offset];
        let len = raw[offset + 1] as usize;
        offset += 2 + len;
        if offset > raw.len() {
            return None;
        }
        Some(tag)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pmt() -> PmtTable {
        PmtTable {
            program_number: 0x0101,
            version_number: 1,
            pcr_pid: 0x0100,
            program_info: vec![],
            streams: vec![
                PmtStream {
                    stream_type: stream_type::H264_VIDEO,
                    elementary_pid: 0x0100,
                    descriptors: vec![],
                },
                PmtStream {
                    stream_type: stream_type::AAC_AUDIO,
                    elementary_pid: 0x0110,
                    descriptors: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_build_parse_roundtrip() {
        let pmt = sample_pmt();
        let raw = pmt.build_section();
        let section = PsiSection::parse(&raw).unwrap();
        let parsed = PmtTable::parse(&section).unwrap();

        assert_eq!(parsed.program_number, 0x0101);
        assert_eq!(parsed.pcr_pid, 0x0100);
        assert_eq!(parsed.streams, pmt.streams);
        assert!(parsed.streams[0].is_video());
        assert!(parsed.streams[1].is_audio());
    }

    #[test]
    fn test_ca_descriptor_roundtrip() {
        let mut pmt = sample_pmt();
        let ca = CaDescriptor {
            ca_system_id: 0x4ADF,
            ca_pid: 0x0101,
            private_data: vec![0xDE, 0xAD],
        };
        pmt.add_program_descriptor(&ca.encode());
        pmt.streams[0].add_descriptor(&ScramblingDescriptor { scrambling_mode: 0x10 }.encode());

        let raw = pmt.build_section();
        let section = PsiSection::parse(&raw).unwrap();
        let parsed = PmtTable::parse(&section).unwrap();

        assert_eq!(parsed.program_info, ca.encode());
        assert_eq!(parsed.streams[0].descriptors, vec![0x65, 1, 0x10]);
    }

    #[test]
    fn test_subtitles_detection() {
        let sub = PmtStream {
            stream_type: stream_type::PES_PRIVATE_DATA,
            elementary_pid: 0x0120,
            descriptors: vec![0x59, 0x08, b'f', b'r', b'a', 0x10, 0x00, 0x01, 0x00, 0x02],
        };
        assert!(sub.is_subtitles());
        assert!(!sub.is_video());

        let teletext = PmtStream {
            stream_type: stream_type::PES_PRIVATE_DATA,
            elementary_pid: 0x0121,
            descriptors: vec![0x56, 0x05, b'f', b'r', b'a', 0x10, 0x00],
        };
        assert!(!teletext.is_subtitles());
    }
}
