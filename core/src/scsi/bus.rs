//! Bus state machine, target side
//!
//! Owns the PHY, the card and up to eight targets, and runs one full
//! transaction per selection: MESSAGE OUT (identify and negotiation), the
//! CDB, the data phase (buffered or streamed through the pipeline), STATUS
//! and MESSAGE IN. Exactly one target is borrowed for the duration of one
//! selection; nothing else on the bus can be in flight at the same time.

use arrayvec::ArrayVec;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::*;

use crate::pipeline;
use crate::settings::{SystemSettings, NUM_SCSI_IDS};
use crate::storage::sd::SdCard;

use super::phy::{BusWidth, ScsiPhase, ScsiPhy, Selection, SyncParams};
use super::sense::*;
use super::target::Target;
use super::toolbox::Toolbox;
use super::{
    scsi_cdb_len, DataOutAction, ScsiCmdResult, EXTMSG_SYNC_TRANSFER, EXTMSG_WIDE_TRANSFER,
    MSG_ABORT, MSG_BUS_DEVICE_RESET, MSG_COMMAND_COMPLETE, MSG_EXTENDED, MSG_IDENTIFY,
    MSG_REJECT, STATUS_CHECK_CONDITION, STATUS_GOOD, TOOLBOX_OPCODE_FIRST, TOOLBOX_OPCODE_LAST,
};

/// Largest REQ/ACK offset this implementation offers in synchronous mode
const MAX_SYNC_OFFSET: u8 = 15;

/// DATA OUT collection chunk; reset checks happen between chunks
const DATA_OUT_CHUNK: usize = 4096;

pub struct Bus<P: ScsiPhy> {
    phy: P,
    card: SdCard,
    sys: SystemSettings,
    targets: [Option<Target>; NUM_SCSI_IDS],
    toolbox: Toolbox,
    eject_rx: Option<Receiver<u8>>,
    /// Called at natural boundaries so UI/USB/logging make progress
    poll_hook: Option<Box<dyn FnMut()>>,
}

impl<P: ScsiPhy> Bus<P> {
    pub fn new(phy: P, card: SdCard, sys: SystemSettings) -> Self {
        Self {
            phy,
            card,
            sys,
            targets: std::array::from_fn(|_| None),
            toolbox: Toolbox::new(None),
            eject_rx: None,
            poll_hook: None,
        }
    }

    pub fn attach_target(&mut self, target: Target) {
        let id = target.id() as usize;
        assert!(id < NUM_SCSI_IDS);
        self.targets[id] = Some(target);
    }

    pub fn detach_target(&mut self, id: u8) {
        self.targets[id as usize] = None;
    }

    pub fn target(&self, id: u8) -> Option<&Target> {
        self.targets[id as usize].as_ref()
    }

    pub fn target_mut(&mut self, id: u8) -> Option<&mut Target> {
        self.targets[id as usize].as_mut()
    }

    pub fn card(&self) -> &SdCard {
        &self.card
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub fn set_shared_dir(&mut self, dir: Option<std::path::PathBuf>) {
        self.toolbox.set_shared_dir(dir);
    }

    pub fn set_poll_hook(&mut self, hook: Box<dyn FnMut()>) {
        self.poll_hook = Some(hook);
    }

    /// Channel for physical eject button events; each message is a button
    /// bitmask. The ISR side holds the sender.
    pub fn eject_button_channel(&mut self) -> Sender<u8> {
        let (tx, rx) = bounded(8);
        self.eject_rx = Some(rx);
        tx
    }

    fn platform_poll(&mut self) {
        if let Some(hook) = &mut self.poll_hook {
            hook();
        }
    }

    /// Services button events, reset flags and at most one selection.
    /// Returns true when a transaction ran.
    pub fn poll(&mut self) -> bool {
        self.platform_poll();

        if let Some(rx) = &self.eject_rx {
            let masks: Vec<u8> = rx.try_iter().collect();
            for mask in masks {
                for target in self.targets.iter_mut().flatten() {
                    target.eject_button(&self.card, mask);
                }
            }
        }

        if self.phy.reset_flag() {
            self.handle_bus_reset();
            return false;
        }

        let Some(selection) = self.phy.wait_selection() else {
            return false;
        };
        self.run_transaction(selection);
        true
    }

    /// RST seen or watchdog fired: all targets to bus free with a pending
    /// unit attention
    pub fn handle_bus_reset(&mut self) {
        info!("Bus reset");
        self.phy.clear_reset_flag();
        for target in self.targets.iter_mut().flatten() {
            target.bus_reset(&self.card);
        }
        self.phy.set_bus_width(BusWidth::Narrow);
        self.phy.set_sync(SyncParams::default());
        self.phy.release();
    }

    fn run_transaction(&mut self, selection: Selection) {
        trace!(
            "Selected as ID {} by initiator {} (atn={})",
            selection.target_id,
            selection.initiator_id,
            selection.atn
        );

        let mut lun = 0u8;
        if selection.atn && !self.message_out(selection.target_id, &mut lun) {
            self.phy.release();
            return;
        }

        // An identify LUN can address a different image when LUN mapping is
        // on; otherwise nonzero LUNs surface an error at the first command
        let mut target_id = selection.target_id;
        let mut bad_lun = false;
        if lun != 0 {
            if self.sys.map_luns_to_ids {
                target_id = lun;
            } else {
                bad_lun = true;
            }
        }

        // COMMAND phase: opcode first, the group length determines the rest
        self.phy.set_phase(ScsiPhase::Command);
        let mut cdb: ArrayVec<u8, 16> = ArrayVec::new();
        let mut op = [0u8];
        if self.phy.read(&mut op).is_err() {
            self.phy.release();
            return;
        }
        cdb.push(op[0]);
        let len = scsi_cdb_len(op[0]).unwrap_or_else(|| {
            error!("Command length unknown for {:02X}", op[0]);
            6
        });
        let mut rest = [0u8; 15];
        if self.phy.read(&mut rest[..len - 1]).is_err() {
            self.phy.release();
            return;
        }
        cdb.try_extend_from_slice(&rest[..len - 1]).unwrap();

        let parity_error = self.sys.enable_parity && self.phy.take_parity_error();

        if self.targets[target_id as usize].is_none() {
            // Nothing behind this ID; a real target would never have
            // answered selection
            warn!("Command to detached target ID {}", target_id);
            self.phy.release();
            return;
        }

        let result = if parity_error {
            warn!("Parity error in command bytes");
            let target = self.targets[target_id as usize].as_mut().unwrap();
            target.check(SenseKey::AbortedCommand, ASC_NO_ADDITIONAL_SENSE_INFORMATION)
        } else if bad_lun {
            debug!("Command to unsupported LUN {}", lun);
            let target = self.targets[target_id as usize].as_mut().unwrap();
            target.check(SenseKey::IllegalRequest, ASC_LOGICAL_UNIT_NOT_SUPPORTED)
        } else if (TOOLBOX_OPCODE_FIRST..=TOOLBOX_OPCODE_LAST).contains(&op[0]) {
            // Toolbox commands bypass the target dispatcher but still
            // supersede a latched sense
            if let Some(target) = self.targets[target_id as usize].as_mut() {
                target.sense.clear();
            }
            self.toolbox
                .handle_command(&cdb, target_id, &mut self.targets, &self.card)
        } else {
            let target = self.targets[target_id as usize].as_mut().unwrap();
            target.command(&self.card, &cdb)
        };

        self.platform_poll();
        self.execute(target_id, result);
    }

    /// MESSAGE OUT processing after selection with ATN. Returns false when
    /// the transaction should be abandoned.
    fn message_out(&mut self, target_id: u8, lun: &mut u8) -> bool {
        while self.phy.atn() {
            self.phy.set_phase(ScsiPhase::MessageOut);
            let mut msg = [0u8];
            if self.phy.read(&mut msg).is_err() {
                return false;
            }
            match msg[0] {
                m if m & MSG_IDENTIFY != 0 => {
                    *lun = m & 0x07;
                }
                MSG_EXTENDED => {
                    if !self.extended_message() {
                        return false;
                    }
                }
                MSG_ABORT => {
                    debug!("ABORT message");
                    return false;
                }
                MSG_BUS_DEVICE_RESET => {
                    debug!("BUS DEVICE RESET message");
                    if let Some(target) = self.targets[target_id as usize].as_mut() {
                        target.set_unit_attention(ASC_RESET_OCCURRED);
                    }
                    return false;
                }
                m => {
                    debug!("Unsupported message {:02X}", m);
                    self.send_message(&[MSG_REJECT]);
                }
            }
        }
        true
    }

    fn extended_message(&mut self) -> bool {
        let mut header = [0u8; 2];
        if self.phy.read(&mut header).is_err() {
            return false;
        }
        let ext_len = header[0] as usize;
        let code = header[1];
        if ext_len == 0 {
            self.send_message(&[MSG_REJECT]);
            return true;
        }
        let mut body = [0u8; 6];
        let body_len = (ext_len - 1).min(body.len());
        if ext_len > 1 && self.phy.read(&mut body[..body_len]).is_err() {
            return false;
        }

        if !self.sys.enable_scsi2 {
            // SCSI-1 hosts never see negotiation succeed
            self.send_message(&[MSG_REJECT]);
            return true;
        }

        match code {
            EXTMSG_SYNC_TRANSFER => {
                let req_period = body[0];
                let req_offset = body[1];
                let (offset, period) = self.negotiate_sync(req_period, req_offset);
                debug!(
                    "Sync negotiation: requested {}/{}, answering {}/{}",
                    req_period, req_offset, period, offset
                );
                self.send_message(&[
                    MSG_EXTENDED,
                    0x03,
                    EXTMSG_SYNC_TRANSFER,
                    period,
                    offset,
                ]);
                self.phy.set_sync(SyncParams { offset, period });
            }
            EXTMSG_WIDE_TRANSFER => {
                let req = body[0];
                let width = req.min(self.sys.max_bus_width);
                debug!("Wide negotiation: requested {}, answering {}", req, width);
                self.send_message(&[MSG_EXTENDED, 0x02, EXTMSG_WIDE_TRANSFER, width]);
                self.phy.set_bus_width(BusWidth::from_exponent(width));
            }
            code => {
                debug!("Unsupported extended message {:02X}", code);
                self.send_message(&[MSG_REJECT]);
            }
        }
        true
    }

    /// Offset is capped by what we can queue, period by what the platform
    /// can clock
    fn negotiate_sync(&self, req_period: u8, req_offset: u8) -> (u8, u8) {
        if self.sys.max_sync_speed == 0 {
            return (0, req_period);
        }
        // Period is in 4 ns units; max_sync_speed in MB/s
        let min_period = (250 / self.sys.max_sync_speed) as u8;
        (req_offset.min(MAX_SYNC_OFFSET), req_period.max(min_period))
    }

    fn send_message(&mut self, msg: &[u8]) {
        self.phy.set_phase(ScsiPhase::MessageIn);
        let _ = self.phy.write(msg);
    }

    /// Runs the data phase(s) for a decoded command and closes out with
    /// STATUS / MESSAGE IN
    fn execute(&mut self, target_id: u8, result: ScsiCmdResult) {
        match result {
            ScsiCmdResult::Status(status) => self.finish(status),
            ScsiCmdResult::DataIn(data) => {
                if !data.is_empty() {
                    self.phy.set_phase(ScsiPhase::DataIn);
                    if self.phy.write(&data).is_err() {
                        self.phy.release();
                        return;
                    }
                }
                // Tape reads deliver data and flag filemark/EOM/ILI in the
                // same command
                let pending = self.targets[target_id as usize]
                    .as_ref()
                    .is_some_and(|t| t.sense.is_pending());
                self.finish(if pending {
                    STATUS_CHECK_CONDITION
                } else {
                    STATUS_GOOD
                });
            }
            ScsiCmdResult::DataOut(len, action) => {
                let Some(data) = self.collect_data_out(len) else {
                    self.phy.release();
                    return;
                };
                let follow_up = match action {
                    DataOutAction::ToolboxFilePrep | DataOutAction::ToolboxFileData { .. } => {
                        self.toolbox.handle_data_out(action, &data)
                    }
                    _ => {
                        let Some(target) = self.targets[target_id as usize].as_mut() else {
                            self.phy.release();
                            return;
                        };
                        target.handle_data_out(&self.card, action, &data)
                    }
                };
                self.execute(target_id, follow_up);
            }
            ScsiCmdResult::ReadBlocks { lba, blocks } => self.stream_read(target_id, lba, blocks),
            ScsiCmdResult::WriteBlocks { lba, blocks } => {
                self.stream_write(target_id, lba, blocks);
            }
        }
    }

    fn collect_data_out(&mut self, len: usize) -> Option<Vec<u8>> {
        self.phy.set_phase(ScsiPhase::DataOut);
        let mut data = vec![0u8; len];
        let mut done = 0;
        while done < len {
            if self.phy.reset_flag() {
                return None;
            }
            let chunk = (len - done).min(DATA_OUT_CHUNK);
            if self.phy.read(&mut data[done..done + chunk]).is_err() {
                return None;
            }
            done += chunk;
            self.platform_poll();
        }
        Some(data)
    }

    fn stream_read(&mut self, target_id: u8, lba: u64, blocks: u32) {
        let Self {
            phy,
            targets,
            ..
        } = self;
        let target = targets[target_id as usize].as_mut().unwrap();
        let block_size = target.block_size();

        // Consume the prefetch cache if it covers the start of this read
        let prefetch = target.prefetch.take();
        let store = target.store.as_mut().unwrap();

        phy.set_phase(ScsiPhase::DataIn);
        match pipeline::stream_read(store, phy, lba, blocks, block_size, prefetch.as_ref()) {
            Ok(()) => {
                // Read ahead for the next sequential request
                target.prefetch = pipeline::refill_prefetch(
                    target.store.as_mut().unwrap(),
                    lba + u64::from(blocks),
                    block_size,
                    target.settings.prefetch_bytes,
                );
                self.finish(STATUS_GOOD);
            }
            Err(e) => {
                error!("Read transfer failed: {}", e);
                target.sense.set(SenseKey::MediumError, ASC_NO_ADDITIONAL_SENSE_INFORMATION);
                self.finish(STATUS_CHECK_CONDITION);
            }
        }
    }

    fn stream_write(&mut self, target_id: u8, lba: u64, blocks: u32) {
        let Self {
            phy,
            targets,
            ..
        } = self;
        let target = targets[target_id as usize].as_mut().unwrap();
        let block_size = target.block_size();
        let store = target.store.as_mut().unwrap();

        phy.set_phase(ScsiPhase::DataOut);
        let result = pipeline::stream_write(store, phy, lba, blocks, block_size)
            .and_then(|()| store.flush().map_err(Into::into));
        match result {
            // GOOD is only reported once every chunk reached the card
            Ok(()) => self.finish(STATUS_GOOD),
            Err(e) => {
                error!("Write transfer failed: {}", e);
                target.sense.set(SenseKey::MediumError, ASC_NO_ADDITIONAL_SENSE_INFORMATION);
                self.finish(STATUS_CHECK_CONDITION);
            }
        }
    }

    fn finish(&mut self, status: u8) {
        self.phy.set_phase(ScsiPhase::Status);
        let _ = self.phy.write(&[status]);
        self.phy.set_phase(ScsiPhase::MessageIn);
        let _ = self.phy.write(&[MSG_COMMAND_COMPLETE]);
        self.phy.release();
        self.platform_poll();
    }
}
