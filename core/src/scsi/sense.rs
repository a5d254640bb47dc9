//! Sense data latching
//!
//! Each target carries one pending sense record, latched when a command
//! fails with CHECK CONDITION. REQUEST SENSE consumes it through
//! [`SenseData::take`]; any other command clears it at dispatch through a
//! single helper, never implicitly.

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

/// Sense keys
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive, Serialize, Deserialize,
    strum::IntoStaticStr,
)]
pub enum SenseKey {
    #[default]
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    AbortedCommand = 0xB,
}

/// Additional sense code + qualifier packed as `asc << 8 | ascq`
pub const ASC_NO_ADDITIONAL_SENSE_INFORMATION: u16 = 0x0000;
pub const ASC_END_OF_DATA_DETECTED: u16 = 0x0005;
pub const ASC_LOGICAL_UNIT_NOT_READY: u16 = 0x0400;
pub const ASC_INVALID_COMMAND_OPERATION_CODE: u16 = 0x2000;
pub const ASC_LBA_OUT_OF_RANGE: u16 = 0x2100;
pub const ASC_INVALID_FIELD_IN_CDB: u16 = 0x2400;
pub const ASC_LOGICAL_UNIT_NOT_SUPPORTED: u16 = 0x2500;
pub const ASC_WRITE_PROTECTED: u16 = 0x2700;
pub const ASC_MEDIUM_CHANGED: u16 = 0x2800;
pub const ASC_RESET_OCCURRED: u16 = 0x2900;
pub const ASC_PARAMETERS_CHANGED: u16 = 0x2A00;
pub const ASC_MEDIUM_NOT_PRESENT: u16 = 0x3A00;

/// Fixed-format sense payload length
pub const SENSE_LENGTH: usize = 18;

/// Pending sense state of one target
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SenseData {
    pub key: SenseKey,
    pub asc: u16,
    /// Information field (residual counts for tape ILI)
    pub info: u32,
    pub filemark: bool,
    pub eom: bool,
    pub ili: bool,
}

impl SenseData {
    /// Latches a fault
    pub fn set(&mut self, key: SenseKey, asc: u16) {
        self.key = key;
        self.asc = asc;
    }

    pub const fn is_pending(&self) -> bool {
        !matches!(self.key, SenseKey::NoSense) || self.filemark || self.eom || self.ili
    }

    /// Clears everything; the single entry point for commands superseding a
    /// latched sense
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Clears the tape flag bits at tape command start
    pub fn clear_tape_flags(&mut self) {
        self.filemark = false;
        self.eom = false;
        self.ili = false;
        self.info = 0;
    }

    /// Consumes the pending sense, returning the 18-byte fixed-format
    /// payload for REQUEST SENSE
    pub fn take(&mut self) -> [u8; SENSE_LENGTH] {
        let mut data = [0u8; SENSE_LENGTH];
        // Current error, fixed format; valid bit when the information field
        // is meaningful
        data[0] = 0x70 | if self.info != 0 { 0x80 } else { 0 };
        data[2] = (self.key as u8)
            | if self.filemark { 0x80 } else { 0 }
            | if self.eom { 0x40 } else { 0 }
            | if self.ili { 0x20 } else { 0 };
        data[3..7].copy_from_slice(&self.info.to_be_bytes());
        // Additional sense length
        data[7] = (SENSE_LENGTH - 8) as u8;
        data[12] = (self.asc >> 8) as u8;
        data[13] = (self.asc & 0xFF) as u8;

        self.clear();
        data
    }
}
