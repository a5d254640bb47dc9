//! SCSI peripheral emulator core
//!
//! This crate is the platform-independent heart of a SCSI storage emulator:
//! the target-side bus state machine and command sets, the image backing
//! stores (including copy-on-write overlays and SIMH tape containers), the
//! streaming transfer pipeline and the initiator engine used for imaging
//! physical drives. A platform layer supplies the physical bus through the
//! [`scsi::phy::ScsiPhy`] contract and the storage medium through
//! [`storage::sd::SdCard`].

pub mod pipeline;
pub mod scsi;
pub mod settings;
pub mod storage;
