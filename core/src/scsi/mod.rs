//! SCSI target and initiator engines
//!
//! ## Bus phases and transitions (target mode)
//! ```mermaid
//! stateDiagram-v2
//!     [*] --> BusFree
//!
//!     BusFree --> Selection : Host asserts SEL with our ID
//!     Selection --> MessageOut : ATN asserted (identify, negotiation)
//!     Selection --> Command : Assert C/D, REQ
//!     MessageOut --> Command
//!     Command --> DataIn : Assert I/O, REQ
//!     Command --> DataOut
//!     Command --> Status
//!     DataIn --> Status
//!     DataOut --> Status
//!     Status --> MessageIn : COMMAND COMPLETE
//!     MessageIn --> BusFree : Release BSY
//! ```

pub mod bus;
pub mod disk;
pub mod initiator;
pub mod phy;
pub mod sense;
pub mod tape;
pub mod target;
pub mod toolbox;

/// SCSI status codes
pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;
pub const STATUS_BUSY: u8 = 0x08;

/// Message bytes
pub const MSG_COMMAND_COMPLETE: u8 = 0x00;
pub const MSG_EXTENDED: u8 = 0x01;
pub const MSG_ABORT: u8 = 0x06;
pub const MSG_REJECT: u8 = 0x07;
pub const MSG_BUS_DEVICE_RESET: u8 = 0x0C;
pub const MSG_IDENTIFY: u8 = 0x80;

/// Extended message codes
pub const EXTMSG_SYNC_TRANSFER: u8 = 0x01;
pub const EXTMSG_WIDE_TRANSFER: u8 = 0x03;

/// Vendor opcode window for the Toolbox side-channel
pub const TOOLBOX_OPCODE_FIRST: u8 = 0xD0;
pub const TOOLBOX_OPCODE_LAST: u8 = 0xDA;

/// Length of a CDB by opcode group. Toolbox vendor commands use 10-byte
/// CDBs.
pub const fn scsi_cdb_len(opcode: u8) -> Option<usize> {
    if opcode >= TOOLBOX_OPCODE_FIRST && opcode <= TOOLBOX_OPCODE_LAST {
        return Some(10);
    }
    match opcode >> 5 {
        // Group 0: 6-byte commands
        0 => Some(6),
        // Group 1 and 2: 10-byte commands
        1 | 2 => Some(10),
        // Group 4: 16-byte commands
        4 => Some(16),
        // Group 5: 12-byte commands
        5 => Some(12),
        _ => None,
    }
}

/// Follow-up work for a completed DATA OUT phase: what the collected bytes
/// mean to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutAction {
    /// Append one tape record (or `length / block_size` fixed blocks)
    TapeWrite { fixed: bool },
    /// MODE SELECT parameter list; accepted, mostly ignored
    ModeSelect,
    /// Toolbox: filename block for a staged upload
    ToolboxFilePrep,
    /// Toolbox: file data chunk at `offset_blocks * 512`
    ToolboxFileData { offset_blocks: u32, length: u16 },
}

/// Result of decoding and pre-validating one command
pub enum ScsiCmdResult {
    /// Immediately report this status (sense already latched on CHECK
    /// CONDITION)
    Status(u8),
    /// Return buffered data to the initiator, then report GOOD
    DataIn(Vec<u8>),
    /// Collect this many bytes from the initiator, then apply the action
    DataOut(usize, DataOutAction),
    /// Stream blocks from the backing store through the transfer pipeline
    ReadBlocks { lba: u64, blocks: u32 },
    /// Stream blocks from the wire into the backing store
    WriteBlocks { lba: u64, blocks: u32 },
}
