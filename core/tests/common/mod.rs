#![allow(dead_code)]
//! Shared test plumbing: in-memory PHY implementations for both bus roles
//!
//! `HostPhy` plays the initiator against our target engine: tests queue up
//! a selection, identify message and CDB, run `Bus::poll()` once and
//! inspect what the target drove onto the wire. `TargetSimPhy` is the
//! opposite: a scriptable emulated drive for exercising the initiator
//! engine.

use std::collections::{HashSet, VecDeque};

use sleet_core::scsi::bus::Bus;
use sleet_core::scsi::phy::{
    BusWidth, PhyError, PhyResult, ScsiPhase, ScsiPhy, Selection, SyncParams,
};

/// Simulated host: feeds selections, messages and CDB/data bytes to the
/// target engine and records everything the target sends back
#[derive(Default)]
pub struct HostPhy {
    pub selection: Option<Selection>,
    pub msg_out: VecDeque<u8>,
    pub to_target: VecDeque<u8>,
    pub from_target: Vec<u8>,
    pub messages_in: Vec<u8>,
    pub status: Option<u8>,
    pub phases: Vec<ScsiPhase>,
    pub reset: bool,
    cur_phase: Option<ScsiPhase>,
    sync: Option<SyncParams>,
    width: BusWidth,
}

impl ScsiPhy for HostPhy {
    fn wait_selection(&mut self) -> Option<Selection> {
        self.selection.take()
    }

    fn select(&mut self, _target_id: u8, _initiator_id: u8) -> bool {
        false
    }

    fn get_phase(&mut self) -> ScsiPhase {
        self.cur_phase.unwrap_or(ScsiPhase::BusFree)
    }

    fn set_phase(&mut self, phase: ScsiPhase) {
        self.cur_phase = Some(phase);
        self.phases.push(phase);
    }

    fn read(&mut self, buf: &mut [u8]) -> PhyResult<usize> {
        let source = if self.cur_phase == Some(ScsiPhase::MessageOut) {
            &mut self.msg_out
        } else {
            &mut self.to_target
        };
        for b in buf.iter_mut() {
            *b = source.pop_front().ok_or(PhyError::Timeout)?;
        }
        Ok(buf.len())
    }

    fn write(&mut self, buf: &[u8]) -> PhyResult<usize> {
        match self.cur_phase {
            Some(ScsiPhase::Status) => self.status = Some(buf[0]),
            Some(ScsiPhase::MessageIn) => self.messages_in.extend_from_slice(buf),
            _ => self.from_target.extend_from_slice(buf),
        }
        Ok(buf.len())
    }

    fn take_parity_error(&mut self) -> bool {
        false
    }

    fn atn(&self) -> bool {
        !self.msg_out.is_empty()
    }

    fn set_sync(&mut self, params: SyncParams) {
        self.sync = Some(params);
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        self.width = width;
    }

    fn bus_width(&self) -> BusWidth {
        self.width
    }

    fn assert_rst(&mut self) {
        self.reset = true;
    }

    fn release(&mut self) {
        self.cur_phase = None;
    }

    fn reset_flag(&self) -> bool {
        self.reset
    }

    fn clear_reset_flag(&mut self) {
        self.reset = false;
    }
}

/// Runs a single command transaction against the bus, returning the status
/// byte and any DATA IN payload
pub fn run_command(bus: &mut Bus<HostPhy>, id: u8, cdb: &[u8], data_out: &[u8]) -> (u8, Vec<u8>) {
    {
        let phy = bus.phy_mut();
        phy.selection = Some(Selection {
            target_id: id,
            initiator_id: 7,
            atn: true,
        });
        phy.msg_out = VecDeque::from(vec![0x80]);
        phy.to_target.clear();
        phy.to_target.extend(cdb.iter().copied());
        phy.to_target.extend(data_out.iter().copied());
        phy.from_target.clear();
        phy.messages_in.clear();
        phy.status = None;
    }
    assert!(bus.poll(), "no transaction ran");
    let phy = bus.phy_mut();
    (
        phy.status.expect("no status byte was sent"),
        std::mem::take(&mut phy.from_target),
    )
}

/// Fetches and parses the 18-byte sense after a CHECK CONDITION
pub fn request_sense(bus: &mut Bus<HostPhy>, id: u8) -> (u8, u8, u8) {
    let (status, data) = run_command(bus, id, &[0x03, 0, 0, 0, 18, 0], &[]);
    assert_eq!(status, 0x00);
    (data[2] & 0x0F, data[12], data[13])
}

/// Simulated target drive for initiator tests: an in-memory disk behind a
/// minimal phase machine
pub struct TargetSimPhy {
    pub own_id: u8,
    pub disk: Vec<u8>,
    pub sector_size: usize,
    /// Sectors whose reads always fail with CHECK CONDITION
    pub bad_sectors: HashSet<u32>,
    phase: ScsiPhase,
    data_in: VecDeque<u8>,
    status: u8,
    reset: bool,
}

impl TargetSimPhy {
    pub fn new(own_id: u8, disk: Vec<u8>, sector_size: usize) -> Self {
        Self {
            own_id,
            disk,
            sector_size,
            bad_sectors: HashSet::new(),
            phase: ScsiPhase::BusFree,
            data_in: VecDeque::new(),
            status: 0,
            reset: false,
        }
    }

    fn sector_count(&self) -> u32 {
        (self.disk.len() / self.sector_size) as u32
    }

    fn handle_cdb(&mut self, cdb: &[u8]) {
        self.status = 0;
        match cdb[0] {
            // TEST UNIT READY / START STOP / REQUEST SENSE handled as GOOD
            0x00 | 0x1B => {
                self.phase = ScsiPhase::Status;
            }
            0x03 => {
                self.data_in = VecDeque::from(vec![0u8; 18]);
                self.phase = ScsiPhase::DataIn;
            }
            0x12 => {
                let mut inq = vec![0u8; 36];
                inq[1] = 0x00;
                inq[2] = 0x02;
                inq[4] = 31;
                inq[8..16].copy_from_slice(b"SIMDRIVE");
                inq[16..32].copy_from_slice(b"INTEGRATION DISK");
                inq[32..36].copy_from_slice(b"1.0 ");
                self.data_in = VecDeque::from(inq);
                self.phase = ScsiPhase::DataIn;
            }
            0x25 => {
                let mut data = vec![0u8; 8];
                data[0..4].copy_from_slice(&(self.sector_count() - 1).to_be_bytes());
                data[4..8].copy_from_slice(&(self.sector_size as u32).to_be_bytes());
                self.data_in = VecDeque::from(data);
                self.phase = ScsiPhase::DataIn;
            }
            0x08 | 0x28 => {
                let (lba, count) = if cdb[0] == 0x08 {
                    let lba = u32::from_be_bytes([0, cdb[1] & 0x1F, cdb[2], cdb[3]]);
                    let count = if cdb[4] == 0 { 256 } else { u32::from(cdb[4]) };
                    (lba, count)
                } else {
                    (
                        u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]),
                        u32::from(u16::from_be_bytes([cdb[7], cdb[8]])),
                    )
                };
                if (lba..lba + count).any(|s| self.bad_sectors.contains(&s)) {
                    self.status = 0x02;
                    self.phase = ScsiPhase::Status;
                    return;
                }
                let begin = lba as usize * self.sector_size;
                let end = (lba + count) as usize * self.sector_size;
                if end > self.disk.len() {
                    self.status = 0x02;
                    self.phase = ScsiPhase::Status;
                    return;
                }
                self.data_in = self.disk[begin..end].iter().copied().collect();
                self.phase = ScsiPhase::DataIn;
            }
            _ => {
                self.status = 0x02;
                self.phase = ScsiPhase::Status;
            }
        }
    }
}

impl ScsiPhy for TargetSimPhy {
    fn wait_selection(&mut self) -> Option<Selection> {
        None
    }

    fn select(&mut self, target_id: u8, _initiator_id: u8) -> bool {
        if target_id == self.own_id {
            self.phase = ScsiPhase::Command;
            true
        } else {
            false
        }
    }

    fn get_phase(&mut self) -> ScsiPhase {
        self.phase
    }

    fn set_phase(&mut self, _phase: ScsiPhase) {}

    fn read(&mut self, buf: &mut [u8]) -> PhyResult<usize> {
        match self.phase {
            ScsiPhase::DataIn => {
                for b in buf.iter_mut() {
                    *b = self.data_in.pop_front().ok_or(PhyError::Timeout)?;
                }
                if self.data_in.is_empty() {
                    self.phase = ScsiPhase::Status;
                }
                Ok(buf.len())
            }
            ScsiPhase::Status => {
                buf[0] = self.status;
                self.phase = ScsiPhase::MessageIn;
                Ok(1)
            }
            ScsiPhase::MessageIn => {
                buf[0] = 0x00;
                self.phase = ScsiPhase::BusFree;
                Ok(1)
            }
            _ => Err(PhyError::PhaseChange),
        }
    }

    fn write(&mut self, buf: &[u8]) -> PhyResult<usize> {
        match self.phase {
            ScsiPhase::Command => {
                let cdb = buf.to_vec();
                self.handle_cdb(&cdb);
                Ok(buf.len())
            }
            _ => Ok(buf.len()),
        }
    }

    fn take_parity_error(&mut self) -> bool {
        false
    }

    fn atn(&self) -> bool {
        false
    }

    fn set_sync(&mut self, _params: SyncParams) {}

    fn set_bus_width(&mut self, _width: BusWidth) {}

    fn bus_width(&self) -> BusWidth {
        BusWidth::Narrow
    }

    fn assert_rst(&mut self) {
        self.phase = ScsiPhase::BusFree;
    }

    fn release(&mut self) {
        self.phase = ScsiPhase::BusFree;
    }

    fn reset_flag(&self) -> bool {
        self.reset
    }

    fn clear_reset_flag(&mut self) {
        self.reset = false;
    }
}
