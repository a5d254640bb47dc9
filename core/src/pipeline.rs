//! Streaming transfer pipeline
//!
//! Moves bulk data between the backing store and the SCSI wire through a
//! wrap-around ring, overlapping card I/O with the bus handshake. The card
//! driver transfers in 512-byte-alignable chunks; at each chunk boundary
//! (the progress-callback point in a DMA port) as much buffered data as
//! possible is pushed to, or pulled from, the PHY. Cursors only ever
//! advance, and a producer never runs more than one ring ahead of its
//! consumer.

use log::*;
use thiserror::Error;

use crate::scsi::phy::{PhyError, ScsiPhy};
use crate::storage::sd::SD_SECTOR_SIZE;
use crate::storage::{BackingStore, StorageError};

/// Ring size; must be a power of two
pub const STREAM_BUFFER_SIZE: usize = 65536;

/// Card write batching. Writes go out in multiples of the SD sector size
/// between these bounds, with a smaller final chunk so the bus does not
/// idle waiting for one big trailing write.
pub const MIN_SD_WRITE: usize = 4096;
pub const MAX_SD_WRITE: usize = 32768;
pub const LAST_SD_WRITE: usize = 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("PHY transfer failed")]
    Phy(#[from] PhyError),

    #[error("backing store transfer failed")]
    Storage(#[from] StorageError),
}

pub type TransferResult<T> = Result<T, TransferError>;

/// Read-ahead cache of one upcoming host read, keyed by where it would
/// start
#[derive(Debug)]
pub struct PrefetchCache {
    pub lba: u64,
    pub block_size: u32,
    pub data: Vec<u8>,
}

/// Streams `blocks` blocks from the store to the wire. A prefetch cache
/// hit serves the leading blocks without touching the card.
pub fn stream_read<P: ScsiPhy>(
    store: &mut BackingStore,
    phy: &mut P,
    lba: u64,
    blocks: u32,
    block_size: u32,
    prefetch: Option<&PrefetchCache>,
) -> TransferResult<()> {
    let total = blocks as usize * block_size as usize;
    let mut ring = vec![0u8; STREAM_BUFFER_SIZE];

    // Number of bytes read from the card / sent to the host
    let mut bytes_sd = 0usize;
    let mut bytes_scsi_done = 0usize;

    if let Some(cache) = prefetch {
        if cache.block_size == block_size && cache.lba == lba && !cache.data.is_empty() {
            let hit = cache.data.len().min(total);
            trace!("Prefetch hit at lba {}: {} bytes", lba, hit);
            phy.write(&cache.data[..hit])?;
            bytes_sd = hit;
            bytes_scsi_done = hit;
        }
    }

    store.seek(lba * u64::from(block_size) + bytes_sd as u64)?;

    while bytes_scsi_done < total {
        if phy.reset_flag() {
            return Err(PhyError::Reset.into());
        }

        if bytes_sd < total {
            // Fill the ring from the card without overwriting bytes the
            // PHY has not sent yet
            let free = STREAM_BUFFER_SIZE - (bytes_sd - bytes_scsi_done);
            let start = bytes_sd % STREAM_BUFFER_SIZE;
            let contig = STREAM_BUFFER_SIZE - start;
            let chunk = (total - bytes_sd).min(free).min(contig);
            if chunk > 0 {
                store.read(&mut ring[start..start + chunk])?;
                bytes_sd += chunk;
            }
        }

        // Card progress point: push everything that is ready
        let avail = bytes_sd - bytes_scsi_done;
        if avail > 0 {
            let start = bytes_scsi_done % STREAM_BUFFER_SIZE;
            let contig = STREAM_BUFFER_SIZE - start;
            let chunk = avail.min(contig);
            phy.write(&ring[start..start + chunk])?;
            bytes_scsi_done += chunk;
        }
    }

    Ok(())
}

/// Streams `blocks` blocks from the wire into the store. The card side is
/// batched: chunks are SD-sector multiples between [`MIN_SD_WRITE`] and
/// [`MAX_SD_WRITE`], except a smaller tail.
pub fn stream_write<P: ScsiPhy>(
    store: &mut BackingStore,
    phy: &mut P,
    lba: u64,
    blocks: u32,
    block_size: u32,
) -> TransferResult<()> {
    let total = blocks as usize * block_size as usize;
    let mut ring = vec![0u8; STREAM_BUFFER_SIZE];

    // Bytes received from the host / drained to the card
    let mut bytes_scsi = 0usize;
    let mut bytes_sd = 0usize;

    store.seek(lba * u64::from(block_size))?;

    while bytes_sd < total {
        if phy.reset_flag() {
            return Err(PhyError::Reset.into());
        }

        if bytes_scsi < total {
            let free = STREAM_BUFFER_SIZE - (bytes_scsi - bytes_sd);
            let start = bytes_scsi % STREAM_BUFFER_SIZE;
            let contig = STREAM_BUFFER_SIZE - start;
            let chunk = (total - bytes_scsi).min(free).min(contig);
            if chunk > 0 {
                phy.read(&mut ring[start..start + chunk])?;
                bytes_scsi += chunk;
            }
        }

        // Drain to the card in batches
        loop {
            let pending = bytes_scsi - bytes_sd;
            if pending == 0 {
                break;
            }
            let remaining = total - bytes_sd;
            let is_tail = pending == remaining;

            let mut chunk = pending.min(MAX_SD_WRITE);
            if !is_tail {
                if chunk < MIN_SD_WRITE {
                    // Wait for more data before bothering the card
                    break;
                }
                chunk -= chunk % SD_SECTOR_SIZE;
            } else if chunk > LAST_SD_WRITE && chunk % SD_SECTOR_SIZE == 0 {
                // Shrink the final write so its card time overlaps the
                // last host bytes
                let head = chunk - LAST_SD_WRITE.min(chunk);
                if head >= SD_SECTOR_SIZE && head % SD_SECTOR_SIZE == 0 {
                    chunk = head;
                }
            }

            let start = bytes_sd % STREAM_BUFFER_SIZE;
            let contig = STREAM_BUFFER_SIZE - start;
            let chunk = chunk.min(contig);
            store.write(&ring[start..start + chunk])?;
            bytes_sd += chunk;
        }
    }

    Ok(())
}

/// Reads ahead of a finished host read into a fresh cache. Failures just
/// produce no cache; prefetch is strictly best-effort.
pub fn refill_prefetch(
    store: &mut BackingStore,
    next_lba: u64,
    block_size: u32,
    prefetch_bytes: u32,
) -> Option<PrefetchCache> {
    if prefetch_bytes == 0 {
        return None;
    }
    let capacity = store.size() / u64::from(block_size);
    if next_lba >= capacity {
        return None;
    }
    let blocks = (u64::from(prefetch_bytes) / u64::from(block_size))
        .min(capacity - next_lba) as usize;
    if blocks == 0 {
        return None;
    }

    let mut data = vec![0u8; blocks * block_size as usize];
    store.seek(next_lba * u64::from(block_size)).ok()?;
    store.read(&mut data).ok()?;
    Some(PrefetchCache {
        lba: next_lba,
        block_size,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::phy::{BusWidth, PhyResult, ScsiPhase, Selection, SyncParams};
    use crate::settings::DeviceSettings;
    use crate::storage::sd::SdCard;
    use crate::storage::ImageSource;

    /// Byte-bucket PHY: write() appends, read() serves from a queue
    #[derive(Default)]
    struct BucketPhy {
        sent: Vec<u8>,
        to_receive: Vec<u8>,
        rx_pos: usize,
    }

    impl ScsiPhy for BucketPhy {
        fn wait_selection(&mut self) -> Option<Selection> {
            None
        }
        fn select(&mut self, _t: u8, _i: u8) -> bool {
            false
        }
        fn get_phase(&mut self) -> ScsiPhase {
            ScsiPhase::BusFree
        }
        fn set_phase(&mut self, _phase: ScsiPhase) {}
        fn read(&mut self, buf: &mut [u8]) -> PhyResult<usize> {
            let end = self.rx_pos + buf.len();
            buf.copy_from_slice(&self.to_receive[self.rx_pos..end]);
            self.rx_pos = end;
            Ok(buf.len())
        }
        fn write(&mut self, buf: &[u8]) -> PhyResult<usize> {
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn take_parity_error(&mut self) -> bool {
            false
        }
        fn atn(&self) -> bool {
            false
        }
        fn set_sync(&mut self, _params: SyncParams) {}
        fn set_bus_width(&mut self, _width: BusWidth) {}
        fn bus_width(&self) -> BusWidth {
            BusWidth::Narrow
        }
        fn assert_rst(&mut self) {}
        fn release(&mut self) {}
        fn reset_flag(&self) -> bool {
            false
        }
        fn clear_reset_flag(&mut self) {}
    }

    fn file_store(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> BackingStore {
        let card = SdCard::open(dir.path()).unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        BackingStore::open(
            &card,
            &ImageSource::File(path),
            512,
            &DeviceSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn read_larger_than_ring_arrives_in_order() {
        use rand::RngCore;
        let dir = tempfile::tempdir().unwrap();
        let mut data = vec![0u8; STREAM_BUFFER_SIZE * 3];
        rand::rng().fill_bytes(&mut data);
        let mut store = file_store(&dir, "big.img", &data);

        let mut phy = BucketPhy::default();
        stream_read(&mut store, &mut phy, 0, (data.len() / 512) as u32, 512, None).unwrap();
        assert_eq!(phy.sent, data);
    }

    #[test]
    fn read_serves_leading_blocks_from_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = vec![0u8; 8192];
        data[..1024].fill(0xAB);
        let mut store = file_store(&dir, "img.img", &data);

        // Cache holds different bytes than the file so a hit is observable
        let cache = PrefetchCache {
            lba: 0,
            block_size: 512,
            data: vec![0xCD; 1024],
        };

        let mut phy = BucketPhy::default();
        stream_read(&mut store, &mut phy, 0, 16, 512, Some(&cache)).unwrap();
        assert!(phy.sent[..1024].iter().all(|&b| b == 0xCD));
        assert_eq!(&phy.sent[1024..], &data[1024..]);
    }

    #[test]
    fn prefetch_mismatch_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0x11u8; 4096];
        let mut store = file_store(&dir, "img.img", &data);

        let cache = PrefetchCache {
            lba: 5,
            block_size: 512,
            data: vec![0xCD; 1024],
        };

        let mut phy = BucketPhy::default();
        stream_read(&mut store, &mut phy, 0, 8, 512, Some(&cache)).unwrap();
        assert_eq!(phy.sent, data);
    }

    #[test]
    fn write_larger_than_ring_lands_in_file() {
        use rand::RngCore;
        let dir = tempfile::tempdir().unwrap();
        let mut store = file_store(&dir, "dst.img", &vec![0u8; STREAM_BUFFER_SIZE * 2]);

        let mut payload = vec![0u8; STREAM_BUFFER_SIZE * 2];
        rand::rng().fill_bytes(&mut payload);

        let mut phy = BucketPhy {
            to_receive: payload.clone(),
            ..Default::default()
        };
        stream_write(&mut store, &mut phy, 0, (payload.len() / 512) as u32, 512).unwrap();
        store.flush().unwrap();

        let on_disk = std::fs::read(dir.path().join("dst.img")).unwrap();
        assert_eq!(on_disk, payload);
    }

    #[test]
    fn write_at_offset_only_touches_its_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = file_store(&dir, "dst.img", &vec![0xEEu8; 8192]);

        let mut phy = BucketPhy {
            to_receive: vec![0x00; 1024],
            ..Default::default()
        };
        stream_write(&mut store, &mut phy, 4, 2, 512).unwrap();
        store.flush().unwrap();

        let on_disk = std::fs::read(dir.path().join("dst.img")).unwrap();
        assert!(on_disk[..2048].iter().all(|&b| b == 0xEE));
        assert!(on_disk[2048..3072].iter().all(|&b| b == 0x00));
        assert!(on_disk[3072..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn refill_prefetch_stops_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = file_store(&dir, "img.img", &vec![0x42u8; 4096]);

        // 8 blocks total; asking from block 6 yields only 2
        let cache = refill_prefetch(&mut store, 6, 512, 8192).unwrap();
        assert_eq!(cache.lba, 6);
        assert_eq!(cache.data.len(), 1024);

        assert!(refill_prefetch(&mut store, 8, 512, 8192).is_none());
        assert!(refill_prefetch(&mut store, 0, 512, 0).is_none());
    }
}
