//! Folder images: a `.cue` sheet plus one or more `.bin` track files
//!
//! The folder presents as a single image. The cue sheet is parsed just far
//! enough to know where each track's file begins and whether the track is
//! audio or data; the audio flag surfaces in READ TOC.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::*;

use super::{StorageError, StorageResult};

/// Track content type from the cue sheet `TRACK` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueTrackType {
    Audio,
    /// MODE1/2048 - plain data sectors
    Mode1Cooked,
    /// MODE1/2352 or MODE2/2352 - raw sectors
    Mode1Raw,
}

impl CueTrackType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "AUDIO" => Some(Self::Audio),
            "MODE1/2048" => Some(Self::Mode1Cooked),
            "MODE1/2352" | "MODE2/2352" => Some(Self::Mode1Raw),
            _ => None,
        }
    }

    pub const fn is_audio(self) -> bool {
        matches!(self, Self::Audio)
    }
}

/// One track as laid out across the folder's bin files
#[derive(Debug, Clone)]
pub struct CueTrack {
    pub number: u8,
    pub track_type: CueTrackType,
    pub file: PathBuf,
    /// Byte offset of this track's file within the concatenated image
    pub start_offset: u64,
    pub file_size: u64,
}

/// Minimal cue sheet parser: FILE/TRACK/INDEX statements only
pub fn parse_cue(sheet: &str) -> Result<Vec<(String, u8, CueTrackType)>> {
    let mut tracks = Vec::new();
    let mut current_file: Option<String> = None;

    for line in sheet.lines() {
        let line = line.trim();
        let mut words = line.split_whitespace();
        match words.next() {
            Some("FILE") => {
                // Filename is quoted and may contain spaces
                let Some(begin) = line.find('"') else {
                    bail!("Malformed FILE statement: {}", line);
                };
                let Some(end) = line.rfind('"').filter(|e| *e > begin) else {
                    bail!("Malformed FILE statement: {}", line);
                };
                current_file = Some(line[begin + 1..end].to_string());
            }
            Some("TRACK") => {
                let number: u8 = words
                    .next()
                    .context("TRACK without number")?
                    .parse()
                    .context("Invalid track number")?;
                let mode = words.next().context("TRACK without mode")?;
                let Some(track_type) = CueTrackType::parse(mode) else {
                    bail!("Unsupported track mode: {}", mode);
                };
                let Some(file) = current_file.clone() else {
                    bail!("TRACK before FILE in cue sheet");
                };
                tracks.push((file, number, track_type));
            }
            // INDEX/PREGAP/REM etc. are not needed for file boundaries
            _ => (),
        }
    }

    if tracks.is_empty() {
        bail!("Cue sheet contains no tracks");
    }
    Ok(tracks)
}

/// Backing store over a cue/bin folder. Reads switch the underlying bin
/// file on track-file boundaries.
pub struct FolderStore {
    folder: PathBuf,
    tracks: Vec<CueTrack>,
    /// Index into `tracks` of the currently open file
    cur: usize,
    file: File,
    total_size: u64,
    pos: u64,
}

impl FolderStore {
    pub fn open(folder: &Path) -> Result<Self> {
        let mut cue_path = None;
        for entry in std::fs::read_dir(folder)
            .with_context(|| format!("Failed to read folder {}", folder.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("cue")) {
                if cue_path.is_some() {
                    bail!("Folder {} contains more than one cue sheet", folder.display());
                }
                cue_path = Some(path);
            }
        }
        let Some(cue_path) = cue_path else {
            bail!("Folder {} contains no cue sheet", folder.display());
        };

        let sheet = std::fs::read_to_string(&cue_path)?;
        let parsed = parse_cue(&sheet)?;

        let mut tracks = Vec::new();
        let mut offset = 0u64;
        let mut last_file: Option<String> = None;
        for (file, number, track_type) in parsed {
            let path = folder.join(&file);
            let size = std::fs::metadata(&path)
                .with_context(|| format!("Missing track file {}", path.display()))?
                .len();

            // Several tracks may share one bin; only a new file advances the
            // concatenation offset
            let file_changed = last_file.as_deref() != Some(file.as_str());
            if file_changed && last_file.is_some() {
                offset += tracks
                    .last()
                    .map(|t: &CueTrack| t.file_size)
                    .unwrap_or(0);
            }
            tracks.push(CueTrack {
                number,
                track_type,
                file: path,
                start_offset: offset,
                file_size: size,
            });
            last_file = Some(file);
        }

        let total_size = {
            let last = tracks.last().unwrap();
            last.start_offset + last.file_size
        };

        debug!(
            "Folder image {}: {} tracks, {} bytes",
            folder.display(),
            tracks.len(),
            total_size
        );

        let file = File::open(&tracks[0].file)?;
        Ok(Self {
            folder: folder.to_path_buf(),
            tracks,
            cur: 0,
            file,
            total_size,
            pos: 0,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn tracks(&self) -> &[CueTrack] {
        &self.tracks
    }

    pub fn size(&self) -> u64 {
        self.total_size
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Track index covering the given byte offset
    fn track_at(&self, pos: u64) -> usize {
        let mut idx = 0;
        for (i, t) in self.tracks.iter().enumerate() {
            if pos >= t.start_offset {
                idx = i;
            }
        }
        idx
    }

    pub fn select_file(&mut self, index: usize) -> StorageResult<()> {
        if index >= self.tracks.len() {
            return Err(StorageError::OutOfRange {
                offset: index as u64,
                size: self.tracks.len() as u64,
            });
        }
        if self.tracks[index].file != self.tracks[self.cur].file {
            self.file = File::open(&self.tracks[index].file)?;
        }
        self.cur = index;
        Ok(())
    }

    pub fn seek(&mut self, pos: u64) -> StorageResult<()> {
        if pos > self.total_size {
            return Err(StorageError::OutOfRange {
                offset: pos,
                size: self.total_size,
            });
        }
        let track = self.track_at(pos);
        self.select_file(track)?;
        self.pos = pos;
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        let mut done = 0;
        while done < buf.len() {
            if self.pos >= self.total_size {
                return Err(StorageError::OutOfRange {
                    offset: self.pos,
                    size: self.total_size,
                });
            }
            let track = self.track_at(self.pos);
            self.select_file(track)?;
            let within = self.pos - self.tracks[track].start_offset;
            let track_left = self.tracks[track].file_size - within;
            let chunk = ((buf.len() - done) as u64).min(track_left) as usize;

            self.file.seek(SeekFrom::Start(within))?;
            self.file.read_exact(&mut buf[done..done + chunk])?;
            done += chunk;
            self.pos += chunk as u64;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHEET: &str = r#"
FILE "track01.bin" BINARY
  TRACK 01 MODE1/2048
    INDEX 01 00:00:00
FILE "track02.bin" BINARY
  TRACK 02 AUDIO
    INDEX 01 00:00:00
"#;

    fn folder_fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("image.cue"), SHEET).unwrap();
        std::fs::write(dir.path().join("track01.bin"), vec![0x01; 4096]).unwrap();
        std::fs::write(dir.path().join("track02.bin"), vec![0x02; 2048]).unwrap();
        dir
    }

    #[test]
    fn parses_tracks_and_modes() {
        let tracks = parse_cue(SHEET).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].1, 1);
        assert_eq!(tracks[0].2, CueTrackType::Mode1Cooked);
        assert!(tracks[1].2.is_audio());
    }

    #[test]
    fn rejects_track_before_file() {
        assert!(parse_cue("TRACK 01 AUDIO").is_err());
    }

    #[test]
    fn folder_concatenates_bins() {
        let dir = folder_fixture();
        let mut store = FolderStore::open(dir.path()).unwrap();
        assert_eq!(store.size(), 6144);
        assert_eq!(store.tracks()[1].start_offset, 4096);

        // Read spanning the file boundary
        let mut buf = [0u8; 512];
        store.seek(4096 - 256).unwrap();
        store.read(&mut buf).unwrap();
        assert!(buf[..256].iter().all(|&b| b == 0x01));
        assert!(buf[256..].iter().all(|&b| b == 0x02));
    }

    #[test]
    fn folder_without_cue_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FolderStore::open(dir.path()).is_err());
    }
}
