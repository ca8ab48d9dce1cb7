//! Service discovery: watches the PAT and the service's PMT in the packet
//! flow and reports each new PMT version.

use log::{debug, warn};

use crate::ts::{pid, table_id, PatTable, PmtTable, PsiSection, SectionCollector, TsPacket};

/// Watches PSI tables to locate one service and track its PMT.
pub struct ServiceDiscovery {
    /// Wanted service id; the PAT's first service when `None`.
    service_id: Option<u16>,
    resolved_id: Option<u16>,
    pmt_pid: Option<u16>,
    pmt_version: Option<u8>,
    nonexistent: bool,
    pat_collector: SectionCollector,
    pmt_collector: SectionCollector,
}

impl ServiceDiscovery {
    /// Watch for `service_id`, or for the first service announced by the
    /// PAT when `None`.
    pub fn new(service_id: Option<u16>) -> Self {
        ServiceDiscovery {
            service_id,
            resolved_id: None,
            pmt_pid: None,
            pmt_version: None,
            nonexistent: false,
            pat_collector: SectionCollector::default(),
            pmt_collector: SectionCollector::default(),
        }
    }

    /// PID of the service's PMT, once the PAT has been seen.
    pub fn pmt_pid(&self) -> Option<u16> {
        self.pmt_pid
    }

    /// Service id, once resolved against the PAT.
    pub fn service_id(&self) -> Option<u16> {
        self.resolved_id
    }

    /// True when the PAT was seen and the wanted service is not in it.
    pub fn nonexistent_service(&self) -> bool {
        self.nonexistent
    }

    /// Feed one packet. Returns the parsed PMT when a new version of the
    /// service's PMT becomes complete.
    pub fn feed(&mut self, pkt: &TsPacket) -> Option<PmtTable> {
        if !pkt.has_payload() {
            return None;
        }
        let packet_pid = pkt.pid();

        if packet_pid == pid::PAT {
            if self
                .pat_collector
                .add_data(pkt.payload(), pkt.cc(), pkt.payload_unit_start())
            {
                let section = self.pat_collector.section().map(|s| s.to_vec());
                self.pat_collector.clear();
                if let Some(section) = section {
                    self.handle_pat(&section);
                }
            }
            return None;
        }

        if Some(packet_pid) == self.pmt_pid
            && self
                .pmt_collector
                .add_data(pkt.payload(), pkt.cc(), pkt.payload_unit_start())
        {
            let section = self.pmt_collector.section().map(|s| s.to_vec());
            self.pmt_collector.clear();
            if let Some(section) = section {
                return self.handle_pmt_section(&section);
            }
        }
        None
    }

    fn handle_pat(&mut self, section: &[u8]) {
        let parsed = match PsiSection::parse(section) {
            Ok(s) => s,
            Err(err) => {
                warn!("invalid PAT section: {err}");
                return;
            }
        };
        if parsed.header.table_id != table_id::PAT || !parsed.header.current_next_indicator {
            return;
        }
        let pat = match PatTable::parse(&parsed) {
            Ok(pat) => pat,
            Err(err) => {
                warn!("cannot parse PAT: {err}");
                return;
            }
        };

        let entry = match self.service_id {
            Some(id) => pat.programs.iter().find(|e| e.program_number == id),
            None => pat.programs.first(),
        };
        match entry {
            Some(entry) => {
                if self.pmt_pid != Some(entry.pid) {
                    debug!(
                        "service 0x{:04X}: PMT on PID 0x{:04X}",
                        entry.program_number, entry.pid
                    );
                    self.pmt_pid = Some(entry.pid);
                    self.pmt_version = None;
                    self.pmt_collector.clear();
                }
                self.resolved_id = Some(entry.program_number);
                self.nonexistent = false;
            }
            None => {
                self.nonexistent = true;
            }
        }
    }

    fn handle_pmt_section(&mut self, section: &[u8]) -> Option<PmtTable> {
        let parsed = match PsiSection::parse(section) {
            Ok(s) => s,
            Err(err) => {
                warn!("invalid PMT section: {err}");
                return None;
            }
        };
        if parsed.header.table_id != table_id::PMT || !parsed.header.current_next_indicator {
            return None;
        }
        if Some(parsed.header.table_id_extension) != self.resolved_id {
            return None;
        }
        if self.pmt_version == Some(parsed.header.version_number) {
            return None;
        }
        match PmtTable::parse(&parsed) {
            Ok(pmt) => {
                self.pmt_version = Some(pmt.version_number);
                Some(pmt)
            }
            Err(err) => {
                warn!("cannot parse PMT: {err}");
                None
            }
        }
    }
}
