//! SIMH magnetic tape container (`.TAP`) support
//!
//! A `.TAP` file is a flat sequence of records and markers. Each data record
//! is stored as:
//!
//! ```text
//! u32 length (LE) || payload || pad byte if length is odd || u32 length (LE)
//! ```
//!
//! The length word doubles as a marker when it matches one of the sentinel
//! values (filemark, erase gap, end of medium). The top 4 bits of the length
//! word carry a record class; only class 0 (good data) is ever generated.
//!
//! Reference: https://simh.trailing-edge.com/docs/simh_magtape.pdf

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use log::*;
use thiserror::Error;

/// Filemark marker (also a zero-length record)
pub const MARKER_TAPEMARK: u32 = 0x0000_0000;
/// Erase gap marker, skipped transparently when reading
pub const MARKER_ERASE_GAP: u32 = 0xFFFF_FFFE;
/// End of medium marker
pub const MARKER_END_MEDIUM: u32 = 0xFFFF_FFFF;

/// Mask for the length portion of the length word
const LENGTH_MASK: u32 = 0x0FFF_FFFF;

#[derive(Debug, Error)]
pub enum TapError {
    #[error("I/O error on tape medium")]
    Io(#[from] std::io::Error),

    /// Header and trailer length words of a record disagree
    #[error("record length mismatch: header {header}, trailer {trailer}")]
    LengthMismatch { header: u32, trailer: u32 },

    /// Record extends past the end of the container file
    #[error("truncated record at offset {offset}")]
    Truncated { offset: u64 },
}

pub type Result<T> = std::result::Result<T, TapError>;

/// Media access required by the tape drive. Erasing the remainder of the
/// tape needs truncation, which `std::io` does not abstract over.
pub trait TapMedia: Read + Write + Seek {
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl TapMedia for std::fs::File {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

impl TapMedia for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.get_mut().truncate(len as usize);
        Ok(())
    }
}

/// A single parsed record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapRecord {
    /// Record class from the top 4 bits of the length word
    pub class: u8,
    /// Payload length in bytes
    pub length: u32,
}

/// Outcome of a forward or backward read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapEvent {
    /// A data record. If a buffer was supplied, the payload was copied into
    /// its first `length` bytes.
    Record(TapRecord),
    Filemark,
    EndOfMedium,
    /// Backward motion hit the beginning of the tape
    BeginningOfTape,
}

/// What stopped a SPACE operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceStop {
    /// Requested count fully consumed
    Done,
    /// A filemark was crossed before the record count was reached
    Filemark,
    EndOfMedium,
    BeginningOfTape,
}

/// Tape drive position/record machine over a `.TAP` container.
///
/// The position is a byte offset into the container file and persists for
/// the lifetime of this value; the SCSI layer rewinds or relocates it.
pub struct TapDrive<T: TapMedia> {
    io: T,
    pos: u64,
}

impl<T: TapMedia> TapDrive<T> {
    pub fn new(io: T) -> Self {
        Self { io, pos: 0 }
    }

    /// Current position as a byte offset into the container
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn set_position(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn into_inner(self) -> T {
        self.io
    }

    pub fn media_size(&mut self) -> Result<u64> {
        Ok(self.io.seek(SeekFrom::End(0))?)
    }

    fn read_u32_at(&mut self, offset: u64) -> Result<u32> {
        let mut word = [0u8; 4];
        self.io.seek(SeekFrom::Start(offset))?;
        self.io
            .read_exact(&mut word)
            .map_err(|_| TapError::Truncated { offset })?;
        Ok(u32::from_le_bytes(word))
    }

    fn write_u32_at(&mut self, offset: u64, value: u32) -> Result<()> {
        self.io.seek(SeekFrom::Start(offset))?;
        self.io.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    /// Reads the next record moving forward. When `buffer` is given and large
    /// enough, the record payload is copied into it.
    pub fn read_forward(&mut self, mut buffer: Option<&mut [u8]>) -> Result<TapEvent> {
        loop {
            if self.pos >= self.media_size()? {
                return Ok(TapEvent::EndOfMedium);
            }

            let word = self.read_u32_at(self.pos)?;
            match word {
                MARKER_TAPEMARK => {
                    self.pos += 4;
                    return Ok(TapEvent::Filemark);
                }
                MARKER_END_MEDIUM => return Ok(TapEvent::EndOfMedium),
                MARKER_ERASE_GAP => {
                    // Erase gaps are invisible to the host
                    self.pos += 4;
                    continue;
                }
                _ => (),
            }

            let record = TapRecord {
                class: (word >> 28) as u8,
                length: word & LENGTH_MASK,
            };

            if record.length == 0 {
                // Zero length with a nonzero class, only the header is stored
                self.pos += 4;
                return Ok(TapEvent::Record(record));
            }

            let padded = u64::from(record.length).next_multiple_of(2);

            if let Some(buf) = buffer.as_deref_mut() {
                if buf.len() >= record.length as usize {
                    self.io.seek(SeekFrom::Start(self.pos + 4))?;
                    self.io
                        .read_exact(&mut buf[..record.length as usize])
                        .map_err(|_| TapError::Truncated { offset: self.pos })?;
                }
            }

            let trailer = self.read_u32_at(self.pos + 4 + padded)? & LENGTH_MASK;
            if trailer != record.length {
                debug!(
                    "TAP record length mismatch at {}: header={} trailer={}",
                    self.pos, record.length, trailer
                );
                return Err(TapError::LengthMismatch {
                    header: record.length,
                    trailer,
                });
            }

            self.pos += 8 + padded;
            return Ok(TapEvent::Record(record));
        }
    }

    /// Reads the previous record moving backward, leaving the position at its
    /// header.
    pub fn read_backward(&mut self, mut buffer: Option<&mut [u8]>) -> Result<TapEvent> {
        loop {
            if self.pos == 0 {
                return Ok(TapEvent::BeginningOfTape);
            }
            if self.pos < 4 {
                return Err(TapError::Truncated { offset: self.pos });
            }

            let word = self.read_u32_at(self.pos - 4)?;
            match word {
                MARKER_TAPEMARK => {
                    self.pos -= 4;
                    return Ok(TapEvent::Filemark);
                }
                MARKER_END_MEDIUM => {
                    self.pos -= 4;
                    return Ok(TapEvent::EndOfMedium);
                }
                MARKER_ERASE_GAP => {
                    self.pos -= 4;
                    continue;
                }
                _ => (),
            }

            let record = TapRecord {
                class: (word >> 28) as u8,
                length: word & LENGTH_MASK,
            };

            if record.length == 0 {
                self.pos -= 4;
                return Ok(TapEvent::Record(record));
            }

            let padded = u64::from(record.length).next_multiple_of(2);
            let total = 8 + padded;
            if self.pos < total {
                return Err(TapError::Truncated { offset: self.pos });
            }
            self.pos -= total;

            let header = self.read_u32_at(self.pos)? & LENGTH_MASK;
            if header != record.length {
                debug!(
                    "TAP backward record length mismatch at {}: header={} trailer={}",
                    self.pos, header, record.length
                );
                return Err(TapError::LengthMismatch {
                    header,
                    trailer: record.length,
                });
            }

            if let Some(buf) = buffer.as_deref_mut() {
                if buf.len() >= record.length as usize {
                    self.io.seek(SeekFrom::Start(self.pos + 4))?;
                    self.io
                        .read_exact(&mut buf[..record.length as usize])
                        .map_err(|_| TapError::Truncated { offset: self.pos })?;
                }
            }

            return Ok(TapEvent::Record(record));
        }
    }

    /// Writes a class 0 data record at the current position
    pub fn write_record(&mut self, data: &[u8]) -> Result<()> {
        let length = data.len() as u32;
        let padded = u64::from(length).next_multiple_of(2);

        self.write_u32_at(self.pos, length)?;
        if !data.is_empty() {
            self.io.seek(SeekFrom::Start(self.pos + 4))?;
            self.io.write_all(data)?;
            if padded > u64::from(length) {
                self.io.write_all(&[0])?;
            }
        }
        self.write_u32_at(self.pos + 4 + padded, length)?;

        self.pos += 8 + padded;
        Ok(())
    }

    pub fn write_filemark(&mut self) -> Result<()> {
        self.write_marker(MARKER_TAPEMARK)
    }

    pub fn write_eom(&mut self) -> Result<()> {
        self.write_marker(MARKER_END_MEDIUM)
    }

    pub fn write_erase_gap(&mut self) -> Result<()> {
        self.write_marker(MARKER_ERASE_GAP)
    }

    fn write_marker(&mut self, marker: u32) -> Result<()> {
        self.write_u32_at(self.pos, marker)?;
        self.pos += 4;
        Ok(())
    }

    /// Long erase: truncates the container at the current position and writes
    /// a fresh end-of-medium marker. The position is left before the marker.
    pub fn erase_to_end(&mut self) -> Result<()> {
        self.io.truncate(self.pos)?;
        let pos = self.pos;
        self.write_eom()?;
        self.pos = pos;
        Ok(())
    }

    /// Spaces over `count` records. Filemarks terminate the motion early.
    pub fn space_records(&mut self, count: u32) -> Result<SpaceStop> {
        for _ in 0..count {
            match self.read_forward(None)? {
                TapEvent::Record(_) => (),
                TapEvent::Filemark => return Ok(SpaceStop::Filemark),
                TapEvent::EndOfMedium => return Ok(SpaceStop::EndOfMedium),
                TapEvent::BeginningOfTape => unreachable!(),
            }
        }
        Ok(SpaceStop::Done)
    }

    /// Spaces forward until `count` filemarks have been crossed. Data records
    /// in between do not count towards the total.
    pub fn space_filemarks(&mut self, count: u32) -> Result<SpaceStop> {
        let mut crossed = 0;
        while crossed < count {
            match self.read_forward(None)? {
                TapEvent::Record(_) => (),
                TapEvent::Filemark => crossed += 1,
                TapEvent::EndOfMedium => return Ok(SpaceStop::EndOfMedium),
                TapEvent::BeginningOfTape => unreachable!(),
            }
        }
        Ok(SpaceStop::Done)
    }

    /// Spaces to end-of-data (just before the end-of-medium marker, or the
    /// physical end of the container)
    pub fn space_to_eod(&mut self) -> Result<()> {
        loop {
            match self.read_forward(None)? {
                TapEvent::Record(_) | TapEvent::Filemark => (),
                TapEvent::EndOfMedium => return Ok(()),
                TapEvent::BeginningOfTape => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_drive() -> TapDrive<Cursor<Vec<u8>>> {
        TapDrive::new(Cursor::new(Vec::new()))
    }

    #[test]
    fn write_read_roundtrip() {
        let mut drv = empty_drive();
        drv.write_record(b"first record").unwrap();
        drv.write_record(b"second").unwrap();
        drv.write_eom().unwrap();
        drv.rewind();

        let mut buf = [0u8; 64];
        let ev = drv.read_forward(Some(&mut buf)).unwrap();
        assert_eq!(
            ev,
            TapEvent::Record(TapRecord {
                class: 0,
                length: 12
            })
        );
        assert_eq!(&buf[..12], b"first record");

        let ev = drv.read_forward(Some(&mut buf)).unwrap();
        assert_eq!(
            ev,
            TapEvent::Record(TapRecord { class: 0, length: 6 })
        );
        assert_eq!(&buf[..6], b"second");

        assert_eq!(drv.read_forward(None).unwrap(), TapEvent::EndOfMedium);
    }

    #[test]
    fn odd_length_records_are_padded() {
        let mut drv = empty_drive();
        drv.write_record(b"odd").unwrap();

        // header + payload + pad + trailer
        assert_eq!(drv.position(), 4 + 3 + 1 + 4);

        drv.rewind();
        let mut buf = [0u8; 8];
        drv.read_forward(Some(&mut buf)).unwrap();
        assert_eq!(&buf[..3], b"odd");
    }

    #[test]
    fn filemark_sequence() {
        let mut drv = empty_drive();
        drv.write_record(b"data").unwrap();
        drv.write_filemark().unwrap();
        drv.write_record(b"more").unwrap();
        drv.write_eom().unwrap();
        drv.rewind();

        assert!(matches!(
            drv.read_forward(None).unwrap(),
            TapEvent::Record(_)
        ));
        assert_eq!(drv.read_forward(None).unwrap(), TapEvent::Filemark);
        assert!(matches!(
            drv.read_forward(None).unwrap(),
            TapEvent::Record(_)
        ));
        assert_eq!(drv.read_forward(None).unwrap(), TapEvent::EndOfMedium);
    }

    #[test]
    fn backward_read_returns_records_in_reverse() {
        let mut drv = empty_drive();
        drv.write_record(b"one").unwrap();
        drv.write_record(b"twotwo").unwrap();
        let end = drv.position();

        let mut buf = [0u8; 16];
        let ev = drv.read_backward(Some(&mut buf)).unwrap();
        assert_eq!(
            ev,
            TapEvent::Record(TapRecord { class: 0, length: 6 })
        );
        assert_eq!(&buf[..6], b"twotwo");

        let ev = drv.read_backward(Some(&mut buf)).unwrap();
        assert_eq!(
            ev,
            TapEvent::Record(TapRecord { class: 0, length: 3 })
        );
        assert_eq!(&buf[..3], b"one");

        assert_eq!(drv.read_backward(None).unwrap(), TapEvent::BeginningOfTape);

        // Forward from here gets back to where we were
        drv.read_forward(None).unwrap();
        drv.read_forward(None).unwrap();
        assert_eq!(drv.position(), end);
    }

    #[test]
    fn erase_gaps_are_transparent() {
        let mut drv = empty_drive();
        drv.write_record(b"a").unwrap();
        drv.write_erase_gap().unwrap();
        drv.write_erase_gap().unwrap();
        drv.write_record(b"b").unwrap();
        drv.rewind();

        let mut buf = [0u8; 4];
        drv.read_forward(Some(&mut buf)).unwrap();
        assert_eq!(&buf[..1], b"a");
        drv.read_forward(Some(&mut buf)).unwrap();
        assert_eq!(&buf[..1], b"b");
    }

    #[test]
    fn space_filemarks_crosses_requested_count() {
        let mut drv = empty_drive();
        drv.write_record(b"r1").unwrap();
        drv.write_filemark().unwrap();
        drv.write_record(b"r2").unwrap();
        drv.write_filemark().unwrap();
        drv.write_record(b"r3").unwrap();
        drv.write_eom().unwrap();
        drv.rewind();

        assert_eq!(drv.space_filemarks(2).unwrap(), SpaceStop::Done);

        // Next record is r3
        let mut buf = [0u8; 4];
        drv.read_forward(Some(&mut buf)).unwrap();
        assert_eq!(&buf[..2], b"r3");
    }

    #[test]
    fn space_records_stops_at_filemark() {
        let mut drv = empty_drive();
        drv.write_record(b"r1").unwrap();
        drv.write_filemark().unwrap();
        drv.write_record(b"r2").unwrap();
        drv.write_eom().unwrap();
        drv.rewind();

        assert_eq!(drv.space_records(5).unwrap(), SpaceStop::Filemark);

        let mut buf = [0u8; 4];
        drv.read_forward(Some(&mut buf)).unwrap();
        assert_eq!(&buf[..2], b"r2");
    }

    #[test]
    fn space_to_eod_lands_before_eom() {
        let mut drv = empty_drive();
        drv.write_record(b"r1").unwrap();
        drv.write_filemark().unwrap();
        drv.write_record(b"r2").unwrap();
        drv.write_eom().unwrap();
        drv.rewind();

        drv.space_to_eod().unwrap();
        assert_eq!(drv.read_forward(None).unwrap(), TapEvent::EndOfMedium);
    }

    #[test]
    fn erase_long_truncates_and_writes_eom() {
        let mut drv = empty_drive();
        drv.write_record(b"keep").unwrap();
        let cut = drv.position();
        drv.write_record(b"discard").unwrap();

        drv.set_position(cut);
        drv.erase_to_end().unwrap();

        drv.rewind();
        let mut buf = [0u8; 8];
        drv.read_forward(Some(&mut buf)).unwrap();
        assert_eq!(&buf[..4], b"keep");
        assert_eq!(drv.read_forward(None).unwrap(), TapEvent::EndOfMedium);
    }

    #[test]
    fn length_mismatch_is_detected() {
        let mut drv = empty_drive();
        drv.write_record(b"good").unwrap();
        // Corrupt the trailer length word
        let raw = drv.into_inner().into_inner();
        let mut bad = raw.clone();
        let n = bad.len();
        bad[n - 4..].copy_from_slice(&0x99u32.to_le_bytes());

        let mut drv = TapDrive::new(Cursor::new(bad));
        assert!(matches!(
            drv.read_forward(None),
            Err(TapError::LengthMismatch { .. })
        ));
    }
}
