//! Physical bus contract
//!
//! The PHY abstracts the wire: data lines, REQ/ACK handshake and the
//! control signals. Microcontroller ports implement this with whatever
//! DMA/PIO acceleration they have; the emulated-bus implementations used in
//! tests bit-bang it in memory. The engine above never touches timing, it
//! only requires that implementations meet the SCSI-2 setup/hold windows
//! and honor [`ScsiPhy::reset_flag`] inside their handshake loops.

use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;
use thiserror::Error;

/// Discrete bus phases, decoded from CD/IO/MSG (information transfer) and
/// BSY/SEL (arbitration/selection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, Serialize, Deserialize)]
pub enum ScsiPhase {
    BusFree,
    BusBusy,
    Arbitration,
    Selection,
    Command,
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    Status,
    MessageIn,
    MessageOut,
}

bitfield! {
    /// Control signal levels as one word, for ports that latch them together
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct ControlSignals(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        pub bsy: bool @ 0,
        pub sel: bool @ 1,
        pub cd: bool @ 2,
        pub io: bool @ 3,
        pub msg: bool @ 4,
        pub atn: bool @ 5,
        pub rst: bool @ 6,
        pub req: bool @ 7,
        pub ack: bool @ 8,
    }
}

/// Data bus width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BusWidth {
    #[default]
    Narrow,
    Wide,
}

impl BusWidth {
    /// Width exponent as used in WDTR negotiation (8 << exp bits)
    pub const fn exponent(self) -> u8 {
        match self {
            Self::Narrow => 0,
            Self::Wide => 1,
        }
    }

    pub const fn from_exponent(exp: u8) -> Self {
        match exp {
            0 => Self::Narrow,
            _ => Self::Wide,
        }
    }

    pub const fn bits(self) -> u8 {
        8 << self.exponent()
    }
}

/// Synchronous transfer agreement; `offset == 0` means asynchronous
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncParams {
    /// REQ/ACK offset
    pub offset: u8,
    /// Transfer period in 4 ns units
    pub period: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhyError {
    /// The reset flag was raised while a transfer was in flight
    #[error("bus reset during transfer")]
    Reset,

    /// The other side stopped handshaking inside the bounded wait
    #[error("handshake timeout")]
    Timeout,

    /// Bus phase changed under a running transfer
    #[error("unexpected phase change")]
    PhaseChange,
}

pub type PhyResult<T> = Result<T, PhyError>;

/// A selection observed in target mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub target_id: u8,
    /// Decoded from the second bit on the data lines during selection
    pub initiator_id: u8,
    /// ATN asserted: a MESSAGE OUT phase follows
    pub atn: bool,
}

/// The physical bus port.
///
/// `read`/`write` block on the REQ/ACK handshake and must poll
/// `reset_flag()` every iteration so a watchdog reset can abort a wedged
/// transfer. Parity is computed per byte on write; on read a parity check
/// accumulates across the whole transfer and is fetched once with
/// [`Self::take_parity_error`]. An even number of flipped bits cancels out
/// in that check; that limitation is inherent and accepted.
pub trait ScsiPhy {
    /// Target mode: waits (bounded) for selection with an attached ID.
    /// Returns `None` if nothing selected us within the poll window.
    fn wait_selection(&mut self) -> Option<Selection>;

    /// Initiator mode: arbitrates and selects a target, true if the target
    /// answered within the selection timeout
    fn select(&mut self, target_id: u8, initiator_id: u8) -> bool;

    /// Current bus phase as driven by the other side (initiator mode)
    fn get_phase(&mut self) -> ScsiPhase;

    /// Target mode: asserts CD/IO/MSG for the given phase
    fn set_phase(&mut self, phase: ScsiPhase);

    fn read(&mut self, buf: &mut [u8]) -> PhyResult<usize>;
    fn write(&mut self, buf: &[u8]) -> PhyResult<usize>;

    /// Whether the initiator currently holds ATN (more message bytes
    /// follow)
    fn atn(&self) -> bool;

    /// Accumulated parity check since the last call
    fn take_parity_error(&mut self) -> bool;

    /// Switches to synchronous mode after negotiation
    fn set_sync(&mut self, params: SyncParams);

    fn set_bus_width(&mut self, width: BusWidth);
    fn bus_width(&self) -> BusWidth;

    /// Asserts RST, forcing every device to bus free
    fn assert_rst(&mut self);

    /// Releases all signals; bus free
    fn release(&mut self);

    /// Watchdog/incoming-RST abort flag, polled inside handshake loops
    fn reset_flag(&self) -> bool;
    fn clear_reset_flag(&mut self);
}

/// Odd parity bit for one data byte: the nine wire bits always carry an odd
/// number of ones
pub const fn parity_bit(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}
