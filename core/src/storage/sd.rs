//! SD card model
//!
//! The firmware sees the card in two ways at once: as a filesystem holding
//! image files and as a flat array of 512-byte sectors. Both views are
//! needed; raw-range images and the contiguous fastpath talk sectors while
//! everything else goes through files. The platform layer decides what
//! actually backs them.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// SD card sector size is always 512 bytes
pub const SD_SECTOR_SIZE: usize = 512;

/// Contiguous allocation extent of a file on the card, as reported by the
/// filesystem driver. `sector_count` covers the full allocation, which may
/// exceed the file length when the last cluster is partially used.
#[derive(Debug, Clone, Copy)]
pub struct AllocExtent {
    pub begin_sector: u32,
    pub sector_count: u32,
}

/// One SD card: a filesystem root, an optional raw sector view and the card
/// identification data used for inquiry serial defaults.
pub struct SdCard {
    root: PathBuf,
    raw_device: Option<PathBuf>,
    sector_count: u32,
    serial: u32,
    exfat: bool,
    extents: HashMap<PathBuf, AllocExtent>,
}

impl SdCard {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            bail!("SD root {} is not a directory", root.display());
        }
        Ok(Self {
            root: root.to_path_buf(),
            raw_device: None,
            sector_count: 0,
            serial: 0,
            exfat: true,
            extents: HashMap::new(),
        })
    }

    /// Attaches the raw sector view of the card
    pub fn with_raw_device(mut self, device: &Path) -> Result<Self> {
        let len = std::fs::metadata(device)
            .with_context(|| format!("Failed to stat raw device {}", device.display()))?
            .len();
        self.sector_count = (len / SD_SECTOR_SIZE as u64) as u32;
        self.raw_device = Some(device.to_path_buf());
        Ok(self)
    }

    /// Card serial number from the CID register
    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Whether the card filesystem is exFAT. FAT32 cannot hold files of
    /// 4 GiB and preallocation on it can expose stale data after an
    /// interrupted write.
    pub fn set_exfat(&mut self, exfat: bool) {
        self.exfat = exfat;
    }

    pub fn is_exfat(&self) -> bool {
        self.exfat
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    /// Resolves a card-relative image path
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Registers the contiguous allocation extent of a file, enabling the
    /// fastpath for it
    pub fn register_extent(&mut self, path: &Path, extent: AllocExtent) {
        self.extents.insert(self.resolve(path), extent);
    }

    pub fn extent_for(&self, path: &Path) -> Option<AllocExtent> {
        self.extents.get(&self.resolve(path)).copied()
    }

    /// Opens an independent handle onto the raw sector view
    pub fn open_raw(&self) -> Result<File> {
        let Some(dev) = &self.raw_device else {
            bail!("No raw device attached to SD card");
        };
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(dev)
            .with_context(|| format!("Failed to open raw device {}", dev.display()))
    }

    pub fn has_raw_device(&self) -> bool {
        self.raw_device.is_some()
    }
}

/// Sector-granular I/O on a raw card handle
pub fn read_sectors(dev: &mut File, sector: u32, buf: &mut [u8]) -> std::io::Result<()> {
    debug_assert!(buf.len() % SD_SECTOR_SIZE == 0);
    dev.seek(SeekFrom::Start(u64::from(sector) * SD_SECTOR_SIZE as u64))?;
    dev.read_exact(buf)
}

pub fn write_sectors(dev: &mut File, sector: u32, buf: &[u8]) -> std::io::Result<()> {
    debug_assert!(buf.len() % SD_SECTOR_SIZE == 0);
    dev.seek(SeekFrom::Start(u64::from(sector) * SD_SECTOR_SIZE as u64))?;
    dev.write_all(buf)
}
