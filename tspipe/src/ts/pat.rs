//! PAT (Program Association Table) parsing.

use super::psi::PsiSection;
use super::table_id;

/// One program entry in the PAT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatEntry {
    /// Program number (service ID).
    pub program_number: u16,
    /// PID of the program's PMT.
    pub pid: u16,
}

/// Parsed PAT (Program Association Table).
#[derive(Debug, Clone, Default)]
pub struct PatTable {
    /// Transport stream ID.
    pub transport_stream_id: u16,
    /// Version number.
    pub version_number: u8,
    /// Program entries.
    pub programs: Vec<PatEntry>,
    /// NIT PID, when the PAT announces one (program number 0).
    pub nit_pid: Option<u16>,
}

impl PatTable {
    /// Parse a PAT from a PSI section.
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        if section.header.table_id != table_id::PAT {
            return Err("Not a PAT section");
        }

        let mut pat = PatTable {
            transport_stream_id: section.header.table_id_extension,
            version_number: section.header.version_number,
            programs: Vec::new(),
            nit_pid: None,
        };

        let data = section.data;
        let mut offset = 0;
        while offset + 4 <= data.len() {
            let program_number = ((data[offset] as u16) << 8) | data[offset + 1] as u16;
            let pid = ((data[offset + 2] as u16 & 0x1F) << 8) | data[offset + 3] as u16;
            offset += 4;

            if program_number == 0 {
                pat.nit_pid = Some(pid);
            } else {
                pat.programs.push(PatEntry {
                    program_number,
                    pid,
                });
            }
        }

        Ok(pat)
    }

    /// Get the PMT PID for a program number.
    pub fn pmt_pid(&self, program_number: u16) -> Option<u16> {
        self.programs
            .iter()
            .find(|e| e.program_number == program_number)
            .map(|e| e.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::psi::build_section;

    #[test]
    fn test_parse_pat() {
        // NIT on 0x0010, program 0x0101 -> PMT 0x0100, program 0x0102 -> 0x0200.
        let data = [
            0x00, 0x00, 0xE0, 0x10, //
            0x01, 0x01, 0xE1, 0x00, //
            0x01, 0x02, 0xE2, 0x00,
        ];
        let raw = build_section(0x00, 0x7FE1, 2, &data);
        let section = PsiSection::parse(&raw).unwrap();
        let pat = PatTable::parse(&section).unwrap();

        assert_eq!(pat.transport_stream_id, 0x7FE1);
        assert_eq!(pat.version_number, 2);
        assert_eq!(pat.nit_pid, Some(0x0010));
        assert_eq!(pat.programs.len(), 2);
        assert_eq!(pat.pmt_pid(0x0101), Some(0x0100));
        assert_eq!(pat.pmt_pid(0x0102), Some(0x0200));
        assert_eq!(pat.pmt_pid(0x0103), None);
    }
}
