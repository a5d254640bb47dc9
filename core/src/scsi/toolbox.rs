//! Toolbox vendor command side-channel
//!
//! A small vendor-specific opcode window (0xD0..0xDA) gives hosts a file
//! browser over a shared directory on the card, staged file upload, CD
//! image switching and a capability report. Hosts drive it with plain
//! DATA IN/DATA OUT phases; errors surface as standard sense.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::*;

use crate::settings::NUM_SCSI_IDS;
use crate::storage::sd::SdCard;

use super::target::Target;
use super::{DataOutAction, ScsiCmdResult, STATUS_CHECK_CONDITION, STATUS_GOOD};

pub const TOOLBOX_LIST_FILES: u8 = 0xD0;
pub const TOOLBOX_GET_FILE: u8 = 0xD1;
pub const TOOLBOX_COUNT_FILES: u8 = 0xD2;
pub const TOOLBOX_SEND_FILE_PREP: u8 = 0xD3;
pub const TOOLBOX_SEND_FILE_10: u8 = 0xD4;
pub const TOOLBOX_SEND_FILE_END: u8 = 0xD5;
pub const TOOLBOX_TOGGLE_DEBUG: u8 = 0xD6;
pub const TOOLBOX_LIST_CDS: u8 = 0xD7;
pub const TOOLBOX_SET_NEXT_CD: u8 = 0xD8;
pub const TOOLBOX_METADATA: u8 = 0xD9;
pub const TOOLBOX_COUNT_CDS: u8 = 0xDA;

/// 0xD9 subcommands
const SUBCMD_LIST_DEVICES: u8 = 0x00;
const SUBCMD_GET_CAPABILITIES: u8 = 0x01;

/// Capability flags
const CAP_LARGE_TRANSFERS: u8 = 0x01;
const CAP_SEND_FILE_32K: u8 = 0x02;

pub const TOOLBOX_API_VERSION: u8 = 0;

/// Longest file name a listing entry can carry
const MAX_FILE_NAME: usize = 32;
/// One listing entry: index, flags, name, size
const ENTRY_SIZE: usize = 40;
/// Chunk unit for GET FILE
const GET_FILE_CHUNK: usize = 4096;

pub struct Toolbox {
    shared_dir: Option<PathBuf>,
    /// Open transfer of a staged upload or chunked download
    file: Option<File>,
    debug: bool,
}

impl Toolbox {
    pub fn new(shared_dir: Option<PathBuf>) -> Self {
        Self {
            shared_dir,
            file: None,
            debug: false,
        }
    }

    pub fn set_shared_dir(&mut self, dir: Option<PathBuf>) {
        self.shared_dir = dir;
        self.file = None;
    }

    /// Entry point from the bus; `target_id` is the ID the command was
    /// addressed to
    pub fn handle_command(
        &mut self,
        cdb: &[u8],
        target_id: u8,
        targets: &mut [Option<Target>; NUM_SCSI_IDS],
        _card: &SdCard,
    ) -> ScsiCmdResult {
        if self.debug {
            debug!("Toolbox command: {:02X?}", cdb);
        }
        match cdb[0] {
            TOOLBOX_LIST_FILES => self.list_files(),
            TOOLBOX_GET_FILE => self.get_file(cdb),
            TOOLBOX_COUNT_FILES => self.count_files(),
            TOOLBOX_SEND_FILE_PREP => {
                ScsiCmdResult::DataOut(MAX_FILE_NAME + 1, DataOutAction::ToolboxFilePrep)
            }
            TOOLBOX_SEND_FILE_10 => {
                let length = u16::from_be_bytes([cdb[1], cdb[2]]);
                let offset_blocks =
                    u32::from_be_bytes([0, cdb[3], cdb[4], cdb[5]]);
                ScsiCmdResult::DataOut(
                    length as usize,
                    DataOutAction::ToolboxFileData {
                        offset_blocks,
                        length,
                    },
                )
            }
            TOOLBOX_SEND_FILE_END => self.send_file_end(),
            TOOLBOX_TOGGLE_DEBUG => self.toggle_debug(cdb),
            TOOLBOX_LIST_CDS => Self::list_images(targets, target_id),
            TOOLBOX_SET_NEXT_CD => Self::set_next_image(targets, target_id, cdb),
            TOOLBOX_COUNT_CDS => Self::count_images(targets, target_id),
            TOOLBOX_METADATA => match cdb[1] {
                SUBCMD_LIST_DEVICES => Self::list_devices(targets),
                SUBCMD_GET_CAPABILITIES => ScsiCmdResult::DataIn(vec![
                    TOOLBOX_API_VERSION,
                    CAP_LARGE_TRANSFERS | CAP_SEND_FILE_32K,
                ]),
                sub => {
                    error!("Unknown Toolbox metadata subcommand: {:02X}", sub);
                    ScsiCmdResult::Status(STATUS_CHECK_CONDITION)
                }
            },
            op => {
                error!("Unknown Toolbox command: {:02X}", op);
                ScsiCmdResult::Status(STATUS_CHECK_CONDITION)
            }
        }
    }

    /// Completion of a Toolbox DATA OUT phase
    pub fn handle_data_out(&mut self, action: DataOutAction, data: &[u8]) -> ScsiCmdResult {
        match action {
            DataOutAction::ToolboxFilePrep => self.send_file_prep(data),
            DataOutAction::ToolboxFileData { offset_blocks, length } => {
                self.send_file_data(offset_blocks, &data[..length as usize])
            }
            _ => ScsiCmdResult::Status(STATUS_CHECK_CONDITION),
        }
    }

    fn toggle_debug(&mut self, cdb: &[u8]) -> ScsiCmdResult {
        if cdb[1] == 0 {
            self.debug = cdb[2] != 0;
            debug!("Set Toolbox debug logs to: {}", self.debug);
            ScsiCmdResult::Status(STATUS_GOOD)
        } else {
            debug!("Get Toolbox debug logs state: {}", self.debug);
            ScsiCmdResult::DataIn(vec![u8::from(self.debug)])
        }
    }

    /// Visible entries of the shared directory, dotfiles excluded
    fn dir_entries(&self) -> Option<Vec<(String, bool, u64)>> {
        let shared_dir = self.shared_dir.as_ref()?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(shared_dir).ok()?.flatten() {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().ok();
            let is_dir = meta.as_ref().is_some_and(|m| m.is_dir());
            let size = meta.map(|m| m.len()).unwrap_or(0);
            entries.push((name, is_dir, size));
        }
        entries.sort();
        Some(entries)
    }

    fn count_files(&self) -> ScsiCmdResult {
        let Some(entries) = self.dir_entries() else {
            return ScsiCmdResult::Status(STATUS_CHECK_CONDITION);
        };
        ScsiCmdResult::DataIn(vec![entries.len() as u8])
    }

    fn list_files(&self) -> ScsiCmdResult {
        let Some(entries) = self.dir_entries() else {
            return ScsiCmdResult::Status(STATUS_CHECK_CONDITION);
        };

        let mut data = Vec::new();
        for (index, (name, is_dir, size)) in entries.iter().enumerate() {
            let mut entry = [0u8; ENTRY_SIZE];
            entry[0] = index as u8;
            entry[1] = u8::from(!is_dir);
            let name_bytes = name.as_bytes();
            let len = name_bytes.len().min(MAX_FILE_NAME);
            entry[2..2 + len].copy_from_slice(&name_bytes[..len]);
            entry[36..40].copy_from_slice(&(*size as u32).to_be_bytes());
            data.extend_from_slice(&entry);
        }
        ScsiCmdResult::DataIn(data)
    }

    fn path_for_index(&self, index: u8) -> Option<PathBuf> {
        let entries = self.dir_entries()?;
        let (name, _, _) = entries.get(index as usize)?;
        Some(self.shared_dir.as_ref()?.join(name))
    }

    /// Chunked file download; offset counts chunks, not bytes
    fn get_file(&mut self, cdb: &[u8]) -> ScsiCmdResult {
        let index = cdb[1];
        let offset = u64::from(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]));

        if offset == 0 {
            self.file = self.path_for_index(index).and_then(|p| File::open(p).ok());
        }

        if let Some(file) = &mut self.file {
            let mut buffer = vec![0; GET_FILE_CHUNK];
            if file
                .seek(SeekFrom::Start(offset * GET_FILE_CHUNK as u64))
                .is_ok()
            {
                if let Ok(bytes_read) = file.read(&mut buffer) {
                    buffer.truncate(bytes_read);
                    if bytes_read == 0 {
                        self.file = None;
                    }
                    return ScsiCmdResult::DataIn(buffer);
                }
            }
        }
        ScsiCmdResult::Status(STATUS_CHECK_CONDITION)
    }

    /// Staged upload: the DATA OUT block carries the zero-terminated name
    fn send_file_prep(&mut self, data: &[u8]) -> ScsiCmdResult {
        let Some(shared_dir) = &self.shared_dir else {
            return ScsiCmdResult::Status(STATUS_CHECK_CONDITION);
        };
        let Some(pos) = data.iter().position(|&b| b == 0) else {
            return ScsiCmdResult::Status(STATUS_CHECK_CONDITION);
        };
        let Ok(name) = std::str::from_utf8(&data[..pos]) else {
            return ScsiCmdResult::Status(STATUS_CHECK_CONDITION);
        };
        // The name must stay inside the shared directory
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return ScsiCmdResult::Status(STATUS_CHECK_CONDITION);
        }
        match File::create(shared_dir.join(name)) {
            Ok(f) => {
                self.file = Some(f);
                ScsiCmdResult::Status(STATUS_GOOD)
            }
            Err(e) => {
                error!("Failed to create file: {}", e);
                ScsiCmdResult::Status(STATUS_CHECK_CONDITION)
            }
        }
    }

    fn send_file_data(&mut self, offset_blocks: u32, data: &[u8]) -> ScsiCmdResult {
        if let Some(file) = &mut self.file {
            if file
                .seek(SeekFrom::Start(u64::from(offset_blocks) * 512))
                .is_ok()
                && file.write_all(data).is_ok()
            {
                return ScsiCmdResult::Status(STATUS_GOOD);
            }
        }
        ScsiCmdResult::Status(STATUS_CHECK_CONDITION)
    }

    fn send_file_end(&mut self) -> ScsiCmdResult {
        if let Some(file) = self.file.take() {
            if file.sync_all().is_ok() {
                return ScsiCmdResult::Status(STATUS_GOOD);
            }
        }
        ScsiCmdResult::Status(STATUS_CHECK_CONDITION)
    }

    /// Image rotation list of the addressed target, one listing entry per
    /// image
    fn list_images(
        targets: &mut [Option<Target>; NUM_SCSI_IDS],
        target_id: u8,
    ) -> ScsiCmdResult {
        let Some(target) = targets[target_id as usize].as_ref() else {
            return ScsiCmdResult::Status(STATUS_CHECK_CONDITION);
        };
        let mut data = Vec::new();
        for (index, image) in target.images().iter().enumerate() {
            let mut entry = [0u8; ENTRY_SIZE];
            entry[0] = index as u8;
            entry[1] = 0x01;
            let name = image.as_bytes();
            let len = name.len().min(MAX_FILE_NAME);
            entry[2..2 + len].copy_from_slice(&name[..len]);
            data.extend_from_slice(&entry);
        }
        ScsiCmdResult::DataIn(data)
    }

    fn count_images(
        targets: &mut [Option<Target>; NUM_SCSI_IDS],
        target_id: u8,
    ) -> ScsiCmdResult {
        let Some(target) = targets[target_id as usize].as_ref() else {
            return ScsiCmdResult::Status(STATUS_CHECK_CONDITION);
        };
        ScsiCmdResult::DataIn(vec![target.images().len() as u8])
    }

    /// Stages the next image; it mounts on the next eject/load cycle
    fn set_next_image(
        targets: &mut [Option<Target>; NUM_SCSI_IDS],
        target_id: u8,
        cdb: &[u8],
    ) -> ScsiCmdResult {
        let Some(target) = targets[target_id as usize].as_mut() else {
            return ScsiCmdResult::Status(STATUS_CHECK_CONDITION);
        };
        let index = cdb[1] as usize;
        if index >= target.images().len() {
            return ScsiCmdResult::Status(STATUS_CHECK_CONDITION);
        }
        info!("Toolbox staged image {} for SCSI ID {}", index, target_id);
        target.set_next_image(index);
        ScsiCmdResult::Status(STATUS_GOOD)
    }

    /// One byte per SCSI ID: the device type, or 0xFF for an empty slot
    fn list_devices(targets: &[Option<Target>; NUM_SCSI_IDS]) -> ScsiCmdResult {
        let data = targets
            .iter()
            .map(|t| {
                t.as_ref()
                    .map(|t| t.device_type().peripheral_type())
                    .unwrap_or(0xFF)
            })
            .collect();
        ScsiCmdResult::DataIn(data)
    }
}
