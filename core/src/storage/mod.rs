//! Image backing stores
//!
//! Access layer between the SCSI targets and whatever actually holds the
//! image bytes. Supported storage modes:
//!
//! - Regular files on the card filesystem, with a contiguous-sector fastpath
//! - Raw sector ranges of the card (`RAW:begin:end`)
//! - ROM drives embedded in MCU flash (`ROM:`)
//! - Folders holding a `.cue` sheet and its `.bin` tracks
//! - Copy-on-write overlays of read-only base images (`*.cow`)
//!
//! All variants are enumerable at compile time, so this is a tagged enum
//! rather than a trait object.

pub mod cow;
pub mod cue;
pub mod rom;
pub mod sd;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::*;
use thiserror::Error;

use crate::settings::DeviceSettings;
use cow::CowStore;
use cue::FolderStore;
use rom::RomStore;
use sd::{SdCard, SD_SECTOR_SIZE};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on backing store")]
    Io(#[from] std::io::Error),

    #[error("access beyond end of image: offset {offset}, size {size}")]
    OutOfRange { offset: u64, size: u64 },

    #[error("write to read-only backing store")]
    ReadOnly,

    #[error("unaligned access to sector-granular store")]
    Unaligned,
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Where a target's image lives, parsed from the configured image name.
/// Special formats: `RAW:begin:end` for raw sector ranges, `ROM:` for the
/// flash ROM drive, anything else is a path on the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    File(PathBuf),
    Raw { begin: u32, end: u32 },
    Rom,
}

impl ImageSource {
    pub fn parse(name: &str) -> Result<Self> {
        if let Some(range) = name
            .strip_prefix("RAW:")
            .or_else(|| name.strip_prefix("raw:"))
        {
            let Some((begin, end)) = range.split_once(':') else {
                bail!("Invalid format for raw image name: {}", name);
            };
            return Ok(Self::Raw {
                begin: begin.parse().context("Invalid raw begin sector")?,
                end: end.parse().context("Invalid raw end sector")?,
            });
        }
        if name.eq_ignore_ascii_case("ROM:") {
            return Ok(Self::Rom);
        }
        Ok(Self::File(PathBuf::from(name)))
    }
}

/// Uniform storage interface over the supported image modes
pub enum BackingStore {
    File(FileStore),
    RawRange(RawStore),
    Rom(RomStore),
    Folder(FolderStore),
    Cow(CowStore),
}

impl BackingStore {
    /// Opens a backing store for the given image source. Copy-on-write mode
    /// is selected by the `.cow` file extension; folders are detected from
    /// the filesystem.
    pub fn open(
        card: &SdCard,
        source: &ImageSource,
        block_size: u32,
        settings: &DeviceSettings,
    ) -> Result<Self> {
        match source {
            ImageSource::Raw { begin, end } => {
                Ok(Self::RawRange(RawStore::open(card, *begin, *end, block_size)?))
            }
            ImageSource::Rom => bail!("ROM drive must be opened with open_rom()"),
            ImageSource::File(path) => {
                let resolved = card.resolve(path);
                if resolved
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case("cow"))
                {
                    match CowStore::open(&resolved, block_size, settings)? {
                        Some(cow) => return Ok(Self::Cow(cow)),
                        None => {
                            // Bitmap budget exhausted: serve the base image
                            // read-only instead
                            warn!(
                                "COW unavailable for {}, opening read-only",
                                resolved.display()
                            );
                            let mut file =
                                FileStore::open(card, path, settings.use_fat_alloc_size)?;
                            file.set_read_only();
                            return Ok(Self::File(file));
                        }
                    }
                }
                if resolved.is_dir() {
                    return Ok(Self::Folder(FolderStore::open(&resolved)?));
                }
                Ok(Self::File(FileStore::open(card, path, settings.use_fat_alloc_size)?))
            }
        }
    }

    /// Opens the flash ROM drive from its raw flash bytes
    pub fn open_rom(flash: &[u8]) -> Result<Self> {
        Ok(Self::Rom(RomStore::new(flash)?))
    }

    pub fn is_writable(&self) -> bool {
        match self {
            Self::File(f) => !f.read_only,
            Self::RawRange(_) => true,
            // Writes to a COW image always land in the overlay
            Self::Cow(_) => true,
            Self::Rom(_) | Self::Folder(_) => false,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::File(f) => f.size(),
            Self::RawRange(r) => r.size(),
            Self::Rom(r) => r.size(),
            Self::Folder(f) => f.size(),
            Self::Cow(c) => c.size(),
        }
    }

    pub fn seek(&mut self, pos: u64) -> StorageResult<()> {
        match self {
            Self::File(f) => f.seek(pos),
            Self::RawRange(r) => r.seek(pos),
            Self::Rom(r) => r.seek(pos),
            Self::Folder(f) => f.seek(pos),
            Self::Cow(c) => c.seek(pos),
        }
    }

    pub fn position(&self) -> u64 {
        match self {
            Self::File(f) => f.position(),
            Self::RawRange(r) => r.position(),
            Self::Rom(r) => r.position(),
            Self::Folder(f) => f.position(),
            Self::Cow(c) => c.position(),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        match self {
            Self::File(f) => f.read(buf),
            Self::RawRange(r) => r.read(buf),
            Self::Rom(r) => r.read(buf),
            Self::Folder(f) => f.read(buf),
            Self::Cow(c) => c.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        match self {
            Self::File(f) => f.write(buf),
            Self::RawRange(r) => r.write(buf),
            Self::Rom(_) | Self::Folder(_) => Err(StorageError::ReadOnly),
            Self::Cow(c) => c.write(buf),
        }
    }

    pub fn flush(&mut self) -> StorageResult<()> {
        match self {
            Self::File(f) => f.flush(),
            Self::RawRange(r) => r.flush(),
            Self::Rom(_) | Self::Folder(_) => Ok(()),
            Self::Cow(c) => c.flush(),
        }
    }

    /// Reports the raw sector range backing this image when it is directly
    /// addressable on the card
    pub fn contiguous_range(&self) -> Option<(u32, u32)> {
        match self {
            Self::File(f) => f.contiguous_range(),
            Self::RawRange(r) => Some((r.begin_sector, r.end_sector)),
            _ => None,
        }
    }

    /// Switches the active file inside a folder image (cue/bin track change,
    /// multi-file tape segments)
    pub fn select_file(&mut self, index: usize) -> StorageResult<()> {
        match self {
            Self::Folder(f) => f.select_file(index),
            _ => {
                warn!("select_file() on a backing store that is not a folder");
                Err(StorageError::Unaligned)
            }
        }
    }

    /// Truncates the image; only file-backed images support this (tape
    /// erase)
    pub fn truncate(&mut self, len: u64) -> StorageResult<()> {
        match self {
            Self::File(f) => f.truncate(len),
            _ => Err(StorageError::ReadOnly),
        }
    }

    /// Path of the backing file, for format detection on file-backed images
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::File(f) => Some(f.path()),
            Self::Cow(c) => Some(c.base_path()),
            Self::Folder(f) => Some(f.folder()),
            _ => None,
        }
    }
}

/// Contiguous fastpath state of a file-backed image
struct Fastpath {
    dev: File,
    begin_sector: u32,
    /// Allocation length in sectors, may exceed the file length
    alloc_sectors: u32,
}

/// Regular image file on the card filesystem.
///
/// When the filesystem driver reports the file as a single contiguous run of
/// sectors, sector-aligned I/O bypasses the filesystem and goes straight to
/// the card. The first unaligned access permanently demotes the store to
/// filesystem access; both paths never interleave.
pub struct FileStore {
    file: File,
    path: PathBuf,
    read_only: bool,
    reported_size: u64,
    pos: u64,
    fastpath: Option<Fastpath>,
}

impl FileStore {
    pub fn open(card: &SdCard, path: &Path, use_fat_alloc_size: bool) -> Result<Self> {
        let resolved = card.resolve(path);
        let meta = std::fs::metadata(&resolved)
            .with_context(|| format!("Failed to stat image {}", resolved.display()))?;
        let read_only = meta.permissions().readonly();
        if read_only {
            logmsg_image(&resolved, "read-only, writes disabled");
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&resolved)
            .with_context(|| format!("Failed to open image {}", resolved.display()))?;

        let mut reported_size = meta.len();
        let mut fastpath = None;
        if let Some(extent) = card.extent_for(path) {
            if card.has_raw_device() {
                let file_sectors = meta.len().div_ceil(SD_SECTOR_SIZE as u64) as u32;
                if extent.sector_count >= file_sectors {
                    fastpath = Some(Fastpath {
                        dev: card.open_raw()?,
                        begin_sector: extent.begin_sector,
                        alloc_sectors: extent.sector_count,
                    });
                    if use_fat_alloc_size && extent.sector_count != file_sectors {
                        // Compatibility with images formatted under firmware
                        // that reported the FAT allocation length
                        reported_size = u64::from(extent.sector_count) * SD_SECTOR_SIZE as u64;
                    }
                }
            }
        }

        Ok(Self {
            file,
            path: resolved,
            read_only,
            reported_size,
            pos: 0,
            fastpath,
        })
    }

    pub fn size(&self) -> u64 {
        self.reported_size
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_contiguous(&self) -> bool {
        self.fastpath.is_some()
    }

    pub fn contiguous_range(&self) -> Option<(u32, u32)> {
        self.fastpath
            .as_ref()
            .map(|f| (f.begin_sector, f.begin_sector + f.alloc_sectors - 1))
    }

    fn demote_if_unaligned(&mut self, len: usize) {
        if self.fastpath.is_some()
            && (self.pos % SD_SECTOR_SIZE as u64 != 0 || len % SD_SECTOR_SIZE != 0)
        {
            debug!("Unaligned access to image, falling back to filesystem access");
            self.fastpath = None;
        }
    }

    /// Seeking past the end is allowed on writable files; a following write
    /// extends the image (tape containers grow this way). Reads past the
    /// end still fail.
    pub fn seek(&mut self, pos: u64) -> StorageResult<()> {
        if self.read_only && pos > self.reported_size {
            return Err(StorageError::OutOfRange {
                offset: pos,
                size: self.reported_size,
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub(crate) fn set_read_only(&mut self) {
        self.read_only = true;
    }

    pub fn truncate(&mut self, len: u64) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        self.file.set_len(len)?;
        self.reported_size = len;
        self.pos = self.pos.min(len);
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        self.demote_if_unaligned(buf.len());
        if let Some(fp) = &mut self.fastpath {
            let sector = fp.begin_sector + (self.pos / SD_SECTOR_SIZE as u64) as u32;
            sd::read_sectors(&mut fp.dev, sector, buf)?;
        } else {
            self.file.seek(SeekFrom::Start(self.pos))?;
            self.file.read_exact(buf)?;
        }
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    pub fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        if self.read_only {
            error!("Attempted write to a read-only image");
            return Err(StorageError::ReadOnly);
        }
        self.demote_if_unaligned(buf.len());
        if let Some(fp) = &mut self.fastpath {
            let sector = fp.begin_sector + (self.pos / SD_SECTOR_SIZE as u64) as u32;
            sd::write_sectors(&mut fp.dev, sector, buf)?;
        } else {
            self.file.seek(SeekFrom::Start(self.pos))?;
            self.file.write_all(buf)?;
        }
        self.pos += buf.len() as u64;
        self.reported_size = self.reported_size.max(self.pos);
        Ok(buf.len())
    }

    pub fn flush(&mut self) -> StorageResult<()> {
        if !self.read_only {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

fn logmsg_image(path: &Path, what: &str) {
    info!("Image file {} is {}", path.display(), what);
}

/// Raw sector range of the SD card presented as one image
pub struct RawStore {
    dev: File,
    begin_sector: u32,
    end_sector: u32,
    cur_sector: u32,
}

impl RawStore {
    pub fn open(card: &SdCard, begin: u32, end: u32, block_size: u32) -> Result<Self> {
        if block_size as usize % SD_SECTOR_SIZE != 0 {
            bail!(
                "SCSI block size {} is not supported for raw ranges (must be a multiple of {})",
                block_size,
                SD_SECTOR_SIZE
            );
        }
        let mut end = end;
        let count = card.sector_count();
        if end >= count {
            info!("Limiting raw image mapping to SD card sector count {}", count);
            end = count.saturating_sub(1);
        }
        if begin > end {
            bail!("Raw range begins past its end: {}..{}", begin, end);
        }
        Ok(Self {
            dev: card.open_raw()?,
            begin_sector: begin,
            end_sector: end,
            cur_sector: begin,
        })
    }

    pub fn size(&self) -> u64 {
        u64::from(self.end_sector - self.begin_sector + 1) * SD_SECTOR_SIZE as u64
    }

    pub fn position(&self) -> u64 {
        u64::from(self.cur_sector - self.begin_sector) * SD_SECTOR_SIZE as u64
    }

    pub fn seek(&mut self, pos: u64) -> StorageResult<()> {
        if pos % SD_SECTOR_SIZE as u64 != 0 {
            return Err(StorageError::Unaligned);
        }
        let sector = self.begin_sector + (pos / SD_SECTOR_SIZE as u64) as u32;
        if sector > self.end_sector + 1 {
            return Err(StorageError::OutOfRange {
                offset: pos,
                size: self.size(),
            });
        }
        self.cur_sector = sector;
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        if buf.len() % SD_SECTOR_SIZE != 0 {
            return Err(StorageError::Unaligned);
        }
        sd::read_sectors(&mut self.dev, self.cur_sector, buf)?;
        self.cur_sector += (buf.len() / SD_SECTOR_SIZE) as u32;
        Ok(buf.len())
    }

    pub fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        if buf.len() % SD_SECTOR_SIZE != 0 {
            return Err(StorageError::Unaligned);
        }
        sd::write_sectors(&mut self.dev, self.cur_sector, buf)?;
        self.cur_sector += (buf.len() / SD_SECTOR_SIZE) as u32;
        Ok(buf.len())
    }

    pub fn flush(&mut self) -> StorageResult<()> {
        self.dev.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::sd::AllocExtent;
    use super::*;
    use crate::settings::DeviceSettings;

    fn card_with_raw(dir: &tempfile::TempDir, raw_sectors: u32) -> SdCard {
        let raw_path = dir.path().join("card.raw");
        let raw = vec![0u8; raw_sectors as usize * SD_SECTOR_SIZE];
        std::fs::write(&raw_path, raw).unwrap();
        SdCard::open(dir.path())
            .unwrap()
            .with_raw_device(&raw_path)
            .unwrap()
    }

    #[test]
    fn image_source_parsing() {
        assert_eq!(
            ImageSource::parse("RAW:0:12345").unwrap(),
            ImageSource::Raw { begin: 0, end: 12345 }
        );
        assert_eq!(ImageSource::parse("ROM:").unwrap(), ImageSource::Rom);
        assert_eq!(
            ImageSource::parse("HD0.hda").unwrap(),
            ImageSource::File(PathBuf::from("HD0.hda"))
        );
        assert!(ImageSource::parse("RAW:12345").is_err());
    }

    #[test]
    fn file_store_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let card = SdCard::open(dir.path()).unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let mut store = FileStore::open(&card, &path, false).unwrap();
        assert_eq!(store.size(), 4096);

        store.seek(512).unwrap();
        store.write(&[0xAA; 512]).unwrap();
        store.flush().unwrap();

        let mut buf = [0u8; 512];
        store.seek(512).unwrap();
        store.read(&mut buf).unwrap();
        assert_eq!(buf, [0xAA; 512]);
    }

    #[test]
    fn fastpath_reads_from_raw_sectors_and_demotes_on_unaligned() {
        let dir = tempfile::tempdir().unwrap();
        let mut card = card_with_raw(&dir, 64);

        // File contents live at sector 8 of the raw device; the file itself
        // holds different bytes so the paths are distinguishable.
        let path = dir.path().join("img.hda");
        std::fs::write(&path, vec![0x11u8; 2 * SD_SECTOR_SIZE]).unwrap();
        {
            let mut dev = card.open_raw().unwrap();
            write_sectors_at(&mut dev, 8, &[0x22u8; 2 * SD_SECTOR_SIZE]);
        }
        card.register_extent(
            &path,
            AllocExtent {
                begin_sector: 8,
                sector_count: 2,
            },
        );

        let mut store = FileStore::open(&card, &path, false).unwrap();
        assert!(store.is_contiguous());

        let mut buf = [0u8; SD_SECTOR_SIZE];
        store.seek(0).unwrap();
        store.read(&mut buf).unwrap();
        assert_eq!(buf[0], 0x22);

        // Unaligned read falls back to the filesystem, permanently
        let mut small = [0u8; 16];
        store.seek(1).unwrap();
        store.read(&mut small).unwrap();
        assert_eq!(small[0], 0x11);
        assert!(!store.is_contiguous());

        store.seek(0).unwrap();
        store.read(&mut buf).unwrap();
        assert_eq!(buf[0], 0x11);
    }

    #[test]
    fn fat_alloc_size_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let mut card = card_with_raw(&dir, 64);
        let path = dir.path().join("legacy.hda");
        std::fs::write(&path, vec![0u8; 3 * SD_SECTOR_SIZE]).unwrap();
        card.register_extent(
            &path,
            AllocExtent {
                begin_sector: 0,
                sector_count: 8,
            },
        );

        let store = FileStore::open(&card, &path, false).unwrap();
        assert_eq!(store.size(), 3 * SD_SECTOR_SIZE as u64);

        let store = FileStore::open(&card, &path, true).unwrap();
        assert_eq!(store.size(), 8 * SD_SECTOR_SIZE as u64);
    }

    #[test]
    fn raw_store_maps_sector_window() {
        let dir = tempfile::tempdir().unwrap();
        let card = card_with_raw(&dir, 32);
        let mut store = RawStore::open(&card, 4, 7, 512).unwrap();
        assert_eq!(store.size(), 4 * SD_SECTOR_SIZE as u64);

        store.seek(0).unwrap();
        store.write(&[0x5A; SD_SECTOR_SIZE]).unwrap();

        let mut dev = card.open_raw().unwrap();
        let mut buf = [0u8; SD_SECTOR_SIZE];
        sd::read_sectors(&mut dev, 4, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; SD_SECTOR_SIZE]);
    }

    #[test]
    fn raw_store_clamps_to_card_size() {
        let dir = tempfile::tempdir().unwrap();
        let card = card_with_raw(&dir, 16);
        let store = RawStore::open(&card, 0, 1000, 512).unwrap();
        assert_eq!(store.size(), 16 * SD_SECTOR_SIZE as u64);
    }

    #[test]
    fn raw_store_rejects_odd_block_size() {
        let dir = tempfile::tempdir().unwrap();
        let card = card_with_raw(&dir, 16);
        assert!(RawStore::open(&card, 0, 15, 256).is_err());
    }

    #[test]
    fn cow_selected_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let card = SdCard::open(dir.path()).unwrap();
        let path = dir.path().join("base.cow");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();

        let store = BackingStore::open(
            &card,
            &ImageSource::File(path),
            512,
            &DeviceSettings::default(),
        )
        .unwrap();
        assert!(matches!(store, BackingStore::Cow(_)));
        assert!(store.is_writable());
    }

    fn write_sectors_at(dev: &mut File, sector: u32, data: &[u8]) {
        dev.seek(SeekFrom::Start(u64::from(sector) * SD_SECTOR_SIZE as u64))
            .unwrap();
        dev.write_all(data).unwrap();
        dev.sync_data().unwrap();
    }
}
