//! ROM drive: an image embedded in MCU flash
//!
//! The flash region starts with a 64-byte header followed by the raw image
//! payload, aligned to a flash page:
//!
//! ```text
//! magic[8] = "ZULUROM\0" || image_size u64 LE || block_size u32 LE || reserved
//! ```

use anyhow::{bail, Result};

use super::{StorageError, StorageResult};

pub const ROM_MAGIC: &[u8; 8] = b"ZULUROM\0";
pub const ROM_HEADER_SIZE: usize = 64;

/// Parsed ROM drive header
#[derive(Debug, Clone, Copy)]
pub struct RomHeader {
    pub image_size: u64,
    pub block_size: u32,
}

impl RomHeader {
    pub fn parse(flash: &[u8]) -> Option<Self> {
        if flash.len() < ROM_HEADER_SIZE || &flash[0..8] != ROM_MAGIC {
            return None;
        }
        Some(Self {
            image_size: u64::from_le_bytes(flash[8..16].try_into().unwrap()),
            block_size: u32::from_le_bytes(flash[16..20].try_into().unwrap()),
        })
    }
}

/// Read-only image served from flash
pub struct RomStore {
    header: RomHeader,
    data: Vec<u8>,
    pos: u64,
}

impl RomStore {
    pub fn new(flash: &[u8]) -> Result<Self> {
        let Some(header) = RomHeader::parse(flash) else {
            bail!("No ROM drive present in flash");
        };
        let payload = &flash[ROM_HEADER_SIZE..];
        if (payload.len() as u64) < header.image_size {
            bail!(
                "ROM drive header claims {} bytes but only {} present",
                header.image_size,
                payload.len()
            );
        }
        Ok(Self {
            header,
            data: payload[..header.image_size as usize].to_vec(),
            pos: 0,
        })
    }

    pub fn header(&self) -> RomHeader {
        self.header
    }

    pub fn size(&self) -> u64 {
        self.header.image_size
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) -> StorageResult<()> {
        if pos > self.size() {
            return Err(StorageError::OutOfRange {
                offset: pos,
                size: self.size(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let end = self.pos + buf.len() as u64;
        if end > self.size() {
            return Err(StorageError::OutOfRange {
                offset: end,
                size: self.size(),
            });
        }
        buf.copy_from_slice(&self.data[self.pos as usize..end as usize]);
        self.pos = end;
        Ok(buf.len())
    }
}

/// Builds a flash image from header fields and payload, for platforms that
/// program the ROM drive region and for tests
pub fn build_flash_image(payload: &[u8], block_size: u32) -> Vec<u8> {
    let mut flash = vec![0u8; ROM_HEADER_SIZE + payload.len()];
    flash[0..8].copy_from_slice(ROM_MAGIC);
    flash[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    flash[16..20].copy_from_slice(&block_size.to_le_bytes());
    flash[ROM_HEADER_SIZE..].copy_from_slice(payload);
    flash
}
