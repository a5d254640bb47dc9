//! Copy-on-write overlay storage
//!
//! Lets the host appear to write to an immutable base image. The image is
//! divided into groups of sectors; a RAM bitmap tracks which groups live in
//! the overlay file. Reads pick the right file per group, writes copy the
//! unmodified head/tail of partially written groups from base to overlay
//! before marking them dirty. The base file is never opened for writing.
//!
//! The bitmap exists only in RAM: after a power cycle every group counts as
//! clean again and the base is authoritative, so a half-copied group can
//! never leak to the host.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bit_set::BitSet;
use log::*;

use crate::settings::DeviceSettings;

use super::{StorageError, StorageResult};

/// Default bitmap budget: 4 KiB = 32768 groups max
pub const DEFAULT_COW_BITMAP_SIZE: u32 = 4096;
/// Default buffer for base-to-overlay copies
pub const DEFAULT_COW_BUFFER_SIZE: u32 = 4096;
/// Bitmap budget floor; below this the image opens read-only instead
const COW_BITMAP_MIN_SIZE: u32 = 128;

pub struct CowStore {
    base: File,
    overlay: File,
    base_path: PathBuf,
    overlay_path: PathBuf,

    /// Set bit = group lives in the overlay
    bitmap: BitSet,
    group_count: u64,
    group_size_bytes: u64,

    size: u64,
    pos: u64,
    copy_buf: Vec<u8>,
}

/// Creates the overlay file at base size if missing or too small
fn create_overlay(path: &Path, size: u64, persist: bool) -> Result<File> {
    if !persist && path.exists() {
        // Overlays are session-scoped; stale contents from a previous run
        // are unreachable anyway once the bitmap is gone
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale overlay {}", path.display()))?;
    }
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() < size {
            info!("Overlay file exists but is too small, recreating: {}", path.display());
            std::fs::remove_file(path)?;
        }
    }
    let overlay = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to create overlay {}", path.display()))?;
    if overlay.metadata()?.len() < size {
        // Sparse file of the full base size
        overlay.set_len(size)?;
    }
    Ok(overlay)
}

/// Preflights the bitmap allocation so memory exhaustion degrades instead of
/// aborting
fn try_alloc_bitmap(groups: u64) -> Option<BitSet> {
    let words = (groups as usize).div_ceil(32);
    let mut probe: Vec<u32> = Vec::new();
    probe.try_reserve_exact(words).ok()?;
    Some(BitSet::with_capacity(groups as usize))
}

impl CowStore {
    /// Opens `<name>.cow` with overlay `<name>.tmp`. Returns `Ok(None)` when
    /// the bitmap cannot be allocated even at the minimum budget; the caller
    /// is expected to open the image read-only instead.
    pub fn open(
        base_path: &Path,
        block_size: u32,
        settings: &DeviceSettings,
    ) -> Result<Option<Self>> {
        if !base_path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("cow"))
        {
            bail!("Not a COW image: {}", base_path.display());
        }
        let overlay_path = base_path.with_extension("tmp");

        let base = File::open(base_path)
            .with_context(|| format!("Failed to open COW base {}", base_path.display()))?;
        let size = base.metadata()?.len();
        let total_sectors = size / u64::from(block_size);
        if total_sectors == 0 {
            bail!("COW base {} smaller than one block", base_path.display());
        }

        let overlay = create_overlay(&overlay_path, size, settings.persist_cow)?;

        let mut bitmap_cap = settings.cow_bitmap_size.max(1);
        let (bitmap, group_size_sectors, group_count) = loop {
            let max_groups = u64::from(bitmap_cap) * 8;
            let group_size_sectors = total_sectors.div_ceil(max_groups).max(1);
            let group_count = total_sectors.div_ceil(group_size_sectors);
            debug_assert!(group_count <= max_groups);

            if let Some(bitmap) = try_alloc_bitmap(group_count) {
                break (bitmap, group_size_sectors, group_count);
            }
            if bitmap_cap <= COW_BITMAP_MIN_SIZE {
                warn!("COW bitmap allocation failed even at {} bytes", bitmap_cap);
                return Ok(None);
            }
            bitmap_cap /= 2;
            info!("COW bitmap allocation failed, retrying with max size {} bytes", bitmap_cap);
        };

        let copy_buf_size = settings.cow_buffer_size.max(512);

        info!(
            "COW image {}: {} groups of {} sectors, overlay {}",
            base_path.display(),
            group_count,
            group_size_sectors,
            overlay_path.display()
        );

        Ok(Some(Self {
            base,
            overlay,
            base_path: base_path.to_path_buf(),
            overlay_path,
            bitmap,
            group_count,
            group_size_bytes: group_size_sectors * u64::from(block_size),
            size,
            pos: 0,
            copy_buf: vec![0; copy_buf_size as usize],
        }))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn overlay_path(&self) -> &Path {
        &self.overlay_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) -> StorageResult<()> {
        if pos > self.size {
            return Err(StorageError::OutOfRange {
                offset: pos,
                size: self.size,
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn flush(&mut self) -> StorageResult<()> {
        self.overlay.sync_data()?;
        Ok(())
    }

    fn group_from_offset(&self, offset: u64) -> u64 {
        offset / self.group_size_bytes
    }

    fn offset_from_group(&self, group: u64) -> u64 {
        group * self.group_size_bytes
    }

    fn is_dirty(&self, group: u64) -> bool {
        debug_assert!(group < self.group_count);
        self.bitmap.contains(group as usize)
    }

    fn mark_dirty(&mut self, group: u64) {
        debug_assert!(group < self.group_count);
        self.bitmap.insert(group as usize);
    }

    pub fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let from = self.pos;
        let to = from + buf.len() as u64;
        if to > self.size {
            return Err(StorageError::OutOfRange {
                offset: to,
                size: self.size,
            });
        }

        // Walk the range, extending a chunk while consecutive groups carry
        // the same dirty/clean label, then issue one read per chunk from the
        // appropriate file
        let mut offset = from;
        let mut done = 0usize;
        while offset < to {
            let dirty = self.is_dirty(self.group_from_offset(offset));
            let mut chunk_end = offset;
            while chunk_end < to
                && self.group_from_offset(chunk_end) < self.group_count
                && self.is_dirty(self.group_from_offset(chunk_end)) == dirty
            {
                let next_group = self.offset_from_group(self.group_from_offset(chunk_end) + 1);
                chunk_end = to.min(next_group);
            }

            let chunk = (chunk_end - offset) as usize;
            let dst = &mut buf[done..done + chunk];
            if dirty {
                self.overlay.seek(SeekFrom::Start(offset))?;
                self.overlay.read_exact(dst)?;
            } else {
                self.base.seek(SeekFrom::Start(offset))?;
                self.base.read_exact(dst)?;
            }
            done += chunk;
            offset = chunk_end;
        }

        self.pos = to;
        Ok(done)
    }

    pub fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        let from = self.pos;
        let to = from + buf.len() as u64;
        if to > self.size {
            return Err(StorageError::OutOfRange {
                offset: to,
                size: self.size,
            });
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let first_group = self.group_from_offset(from);
        let last_group = self.group_from_offset(to - 1);

        // Preserve the unwritten head of the first group
        if !self.is_dirty(first_group) {
            let group_start = self.offset_from_group(first_group);
            if from > group_start {
                self.copy_to_overlay(group_start, from)?;
            }
        }

        self.overlay.seek(SeekFrom::Start(from))?;
        self.overlay.write_all(buf)?;

        // Preserve the unwritten tail of the last group
        if !self.is_dirty(last_group) {
            let group_end = self.offset_from_group(last_group + 1).min(self.size);
            if to < group_end {
                self.copy_to_overlay(to, group_end)?;
            }
        }

        for group in first_group..=last_group {
            self.mark_dirty(group);
        }

        self.pos = to;
        Ok(buf.len())
    }

    /// Copies `[from, to)` from base to overlay. Never spans a group
    /// boundary.
    fn copy_to_overlay(&mut self, from: u64, to: u64) -> StorageResult<()> {
        debug_assert_eq!(
            self.group_from_offset(from),
            self.group_from_offset(to - 1)
        );

        self.base.seek(SeekFrom::Start(from))?;
        self.overlay.seek(SeekFrom::Start(from))?;

        let mut remaining = (to - from) as usize;
        while remaining > 0 {
            let chunk = remaining.min(self.copy_buf.len());
            self.base.read_exact(&mut self.copy_buf[..chunk])?;
            self.overlay.write_all(&self.copy_buf[..chunk])?;
            remaining -= chunk;
        }
        Ok(())
    }
}
