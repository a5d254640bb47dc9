//! Initiator engine: images physical SCSI drives to files on the card
//!
//! A single control loop scans IDs 0..7, probes whatever answers, then
//! clones the medium sector range by sector range into an image file.
//! Failed batches are retried whole, then sector by sector; a sector that
//! never reads is zero-filled and skipped so one bad spot cannot stall the
//! clone.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::*;

use crate::settings::{InitiatorImageHandling, SystemSettings, NUM_SCSI_IDS};
use crate::storage::sd::SdCard;

use super::phy::{BusWidth, ScsiPhase, ScsiPhy};
use super::{MSG_COMMAND_COMPLETE, MSG_IDENTIFY, STATUS_GOOD};

/// READ(6) carries a 21-bit LBA and an 8-bit count
const READ6_MAX_LBA: u32 = 0x1F_FFFF;
const READ6_MAX_SECTORS: u32 = 256;

/// Streaming chunk between the PHY and the image file
const TRANSFER_CHUNK: usize = 32768;

/// Sentinel returned by `execute` when it hands a data phase back to the
/// caller; never a real SCSI status
const STATUS_DATA_PHASE: u8 = 0xFF;

/// One probed drive being imaged
struct ImagingJob {
    target_id: u8,
    sector_size: u32,
    sector_count: u32,
    sectors_done: u32,
    max_sector_per_transfer: u32,
    bad_sector_count: u32,
    retry_count: u8,
    /// Sector-by-sector retry window after repeated batch failures
    fail_position: u32,
    use_read10: bool,
    eject_when_done: bool,
    file: File,
    filename: PathBuf,
}

/// Outcome of one `poll()` step, for the platform's status display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorProgress {
    Idle,
    Scanning { target_id: u8 },
    Imaging { target_id: u8, sectors_done: u32, sector_count: u32 },
    Finished { target_id: u8, bad_sectors: u32 },
}

pub struct Initiator<P: ScsiPhy> {
    phy: P,
    card: SdCard,
    sys: SystemSettings,

    scan_id: u8,
    /// IDs already imaged this session (bitmask)
    drives_imaged: u8,
    /// Discs imaged per removable drive, for numbered filenames
    removable_count: [u32; NUM_SCSI_IDS],
    target_bus_width: [u8; NUM_SCSI_IDS],

    job: Option<ImagingJob>,
    paused: bool,
}

impl<P: ScsiPhy> Initiator<P> {
    pub fn new(phy: P, card: SdCard, sys: SystemSettings) -> Self {
        Self {
            phy,
            card,
            sys,
            scan_id: 7,
            drives_imaged: 0,
            removable_count: [0; NUM_SCSI_IDS],
            target_bus_width: [0; NUM_SCSI_IDS],
            job: None,
            paused: false,
        }
    }

    /// Eject button doubles as a pause request in initiator mode
    pub fn request_pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.phy.assert_rst();
            self.phy.clear_reset_flag();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// One step of the imaging loop: probe the next ID, or move one batch
    pub fn poll(&mut self) -> InitiatorProgress {
        if self.paused {
            return InitiatorProgress::Idle;
        }
        if self.phy.reset_flag() {
            info!("Executing bus reset after aborted command");
            self.phy.assert_rst();
            self.phy.clear_reset_flag();
        }

        if self.job.is_some() {
            self.transfer_batch()
        } else {
            self.scan_next()
        }
    }

    fn scan_next(&mut self) -> InitiatorProgress {
        self.scan_id = (self.scan_id + 1) % NUM_SCSI_IDS as u8;
        let id = self.scan_id;
        if id == self.sys.initiator_id || self.drives_imaged & (1 << id) != 0 {
            return InitiatorProgress::Idle;
        }

        let startstop_ok =
            self.test_unit_ready(id) && self.start_stop_unit(id, true, false);
        if !startstop_ok {
            debug!("Failed to connect to SCSI ID {}", id);
            return InitiatorProgress::Scanning { target_id: id };
        }

        // Width first: only commands without a data phase are safe while
        // the target might still be in 16-bit mode
        if self.sys.max_bus_width > 0 && !self.negotiate_bus_width(id, self.sys.max_bus_width)
        {
            info!("Wide negotiation with ID {} failed, staying at 8 bit", id);
        }

        let capacity = self.read_capacity(id);
        let mut inquiry_data = [0u8; 36];
        let inquiry_ok = self.inquiry(id, &mut inquiry_data);

        let (sector_count, sector_size, mut max_sector_per_transfer) = match capacity {
            Some((count, size)) => {
                info!(
                    "SCSI ID {} capacity {} sectors x {} bytes",
                    id, count, size
                );
                (count, size, 512)
            }
            None => {
                // Likely SCSI-1; probe up to 1 GB in small batches
                info!(
                    "SCSI ID {} responds but READ CAPACITY failed, possibly SCSI-1",
                    id
                );
                (2_097_152, 512, 128)
            }
        };
        if sector_count == 0 {
            return InitiatorProgress::Scanning { target_id: id };
        }

        let mut device_type = 0u8;
        let mut removable = false;
        if inquiry_ok {
            device_type = inquiry_data[0] & 0x1F;
            removable = inquiry_data[1] & 0x80 != 0;
            let vendor = String::from_utf8_lossy(&inquiry_data[8..16]).to_string();
            let product = String::from_utf8_lossy(&inquiry_data[16..32]).to_string();
            info!("SCSI ID {}: {} {}", id, vendor.trim(), product.trim());
        }

        let use_read10 = self.test_supports_read10(id, sector_size);
        if !use_read10 {
            max_sector_per_transfer = max_sector_per_transfer.min(READ6_MAX_SECTORS);
        }

        let eject_when_done = removable;
        if eject_when_done && self.removable_count[id as usize] == 0 {
            self.removable_count[id as usize] = 1;
        }

        let Some((file, filename)) =
            self.create_image_file(id, device_type, removable, sector_count, sector_size)
        else {
            self.drives_imaged |= 1 << id;
            return InitiatorProgress::Scanning { target_id: id };
        };

        info!("Starting to copy drive data to {}", filename.display());
        self.job = Some(ImagingJob {
            target_id: id,
            sector_size,
            sector_count,
            sectors_done: 0,
            max_sector_per_transfer,
            bad_sector_count: 0,
            retry_count: 0,
            fail_position: 0,
            use_read10,
            eject_when_done,
            file,
            filename,
        });
        InitiatorProgress::Imaging {
            target_id: id,
            sectors_done: 0,
            sector_count,
        }
    }

    /// Destination filename from the device type, with the configured
    /// collision policy applied
    fn create_image_file(
        &mut self,
        id: u8,
        device_type: u8,
        removable: bool,
        sector_count: u32,
        sector_size: u32,
    ) -> Option<(File, PathBuf)> {
        let (prefix, extension) = match device_type {
            0x05 => ("CD", ".iso"),
            0x07 => ("MO", ".img"),
            0x00 if removable => ("RM", ".img"),
            0x00 => ("HD", ".hda"),
            other => {
                info!(
                    "Unhandled device type {}, imaging as direct access",
                    other
                );
                ("HD", ".hda")
            }
        };

        let base = if removable {
            format!(
                "{}{:02}_imaged({})",
                prefix, id, self.removable_count[id as usize]
            )
        } else {
            format!("{}{:02}_imaged", prefix, id)
        };
        let mut filename = self.card.root().join(format!("{}{}", base, extension));

        match self.sys.initiator_image_handling {
            InitiatorImageHandling::StopIfExists => {
                if filename.exists() {
                    info!(
                        "File {} already exists, skipping this drive",
                        filename.display()
                    );
                    return None;
                }
            }
            InitiatorImageHandling::NewNumberedCopy => {
                if filename.exists() {
                    let mut found = None;
                    for i in 1..1000 {
                        let candidate = self
                            .card
                            .root()
                            .join(format!("{}-{:03}{}", base, i, extension));
                        if !candidate.exists() {
                            found = Some(candidate);
                            break;
                        }
                    }
                    let Some(candidate) = found else {
                        warn!("Max images created for SCSI ID {}", id);
                        return None;
                    };
                    filename = candidate;
                }
            }
            InitiatorImageHandling::Overwrite => {
                if filename.exists() {
                    info!(
                        "File {} already exists, overwriting",
                        filename.display()
                    );
                    let _ = std::fs::remove_file(&filename);
                }
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&filename)
            .map_err(|e| error!("Failed to open {} for writing: {}", filename.display(), e))
            .ok()?;

        if self.card.is_exfat() {
            // Preallocating on FAT32 can leave stale data visible if the
            // copy is interrupted, so only exFAT cards get it
            debug!("Preallocating image file");
            let _ = file.set_len(u64::from(sector_count) * u64::from(sector_size));
        }

        Some((file, filename))
    }

    fn transfer_batch(&mut self) -> InitiatorProgress {
        let (id, done, count) = {
            let job = self.job.as_ref().unwrap();
            (job.target_id, job.sectors_done, job.sector_count)
        };

        if done >= count {
            return self.finish_job();
        }

        let mut numtoread = {
            let job = self.job.as_ref().unwrap();
            (count - done).min(job.max_sector_per_transfer)
        };
        // Retry sector by sector after repeated batch failures
        if done < self.job.as_ref().unwrap().fail_position {
            numtoread = 1;
        }

        let ok = self.read_batch_to_file(done, numtoread);

        let job = self.job.as_mut().unwrap();
        if ok {
            job.retry_count = 0;
            job.sectors_done += numtoread;
            let _ = job.file.flush();
            debug!(
                "SCSI read succeeded, sectors done: {} / {}",
                job.sectors_done, job.sector_count
            );
            InitiatorProgress::Imaging {
                target_id: id,
                sectors_done: job.sectors_done,
                sector_count: count,
            }
        } else {
            warn!(
                "Failed to transfer {} sectors starting at {}",
                numtoread, done
            );
            if job.retry_count < self.sys.initiator_max_retry {
                job.retry_count += 1;
                info!(
                    "Retrying.. {}/{}",
                    job.retry_count, self.sys.initiator_max_retry
                );
                if job.retry_count > 1 && numtoread > 1 {
                    info!("Multiple failures, retrying sector by sector");
                    job.fail_position = job.sectors_done + numtoread;
                }
            } else {
                info!("Retry limit exceeded, skipping one sector");
                job.retry_count = 0;
                // The unreadable sector is zero-filled in the image so the
                // layout stays intact
                let offset = u64::from(job.sectors_done) * u64::from(job.sector_size);
                let zeros = vec![0u8; job.sector_size as usize];
                let _ = job
                    .file
                    .seek(SeekFrom::Start(offset))
                    .and_then(|_| job.file.write_all(&zeros));
                job.sectors_done += 1;
                job.bad_sector_count += 1;
            }
            InitiatorProgress::Imaging {
                target_id: id,
                sectors_done: self.job.as_ref().unwrap().sectors_done,
                sector_count: count,
            }
        }
    }

    fn finish_job(&mut self) -> InitiatorProgress {
        let job = self.job.take().unwrap();
        let id = job.target_id;

        self.start_stop_unit(id, false, false);
        info!(
            "Finished imaging drive with ID {} to {}",
            id,
            job.filename.display()
        );
        if job.bad_sector_count != 0 {
            warn!(
                "{} bad sectors could not be read off this drive",
                job.bad_sector_count
            );
        }

        if job.eject_when_done {
            // Eject so the next disc can be inserted; its image gets a new
            // number
            self.start_stop_unit(id, false, true);
            self.removable_count[id as usize] += 1;
        } else {
            debug!("Marking SCSI ID {} as imaged, not asking it again", id);
            self.drives_imaged |= 1 << id;
        }

        let _ = job.file.sync_all();
        InitiatorProgress::Finished {
            target_id: id,
            bad_sectors: job.bad_sector_count,
        }
    }

    /*
     * Low level command plumbing
     */

    /// Runs one command through the phase loop. `stop_at_data` returns
    /// control to the caller as soon as a data phase begins, for streamed
    /// transfers.
    fn execute(
        &mut self,
        target_id: u8,
        cdb: &[u8],
        mut data_in: Option<&mut [u8]>,
        data_out: Option<&[u8]>,
        stop_at_data: bool,
    ) -> Option<u8> {
        if !self.phy.select(target_id, self.sys.initiator_id) {
            debug!("Target {} did not respond to selection", target_id);
            self.phy.release();
            return None;
        }

        let mut status = None;
        loop {
            let phase = self.phy.get_phase();
            if phase == ScsiPhase::BusFree {
                break;
            }
            match phase {
                ScsiPhase::MessageOut => {
                    let identify = [MSG_IDENTIFY];
                    if self.phy.write(&identify).is_err() {
                        break;
                    }
                }
                ScsiPhase::Command => {
                    if self.phy.write(cdb).is_err() {
                        break;
                    }
                }
                ScsiPhase::DataIn => {
                    if stop_at_data {
                        return Some(STATUS_DATA_PHASE);
                    }
                    let Some(buf) = data_in.as_deref_mut() else {
                        warn!("DATA IN phase but no buffer to receive into");
                        break;
                    };
                    self.phy
                        .set_bus_width(BusWidth::from_exponent(self.target_bus_width[target_id as usize]));
                    let ok = self.phy.read(buf).is_ok();
                    self.phy.set_bus_width(BusWidth::Narrow);
                    if !ok {
                        break;
                    }
                    data_in = None;
                }
                ScsiPhase::DataOut => {
                    if stop_at_data {
                        return Some(STATUS_DATA_PHASE);
                    }
                    let Some(buf) = data_out else {
                        warn!("DATA OUT phase but no data to send");
                        break;
                    };
                    self.phy
                        .set_bus_width(BusWidth::from_exponent(self.target_bus_width[target_id as usize]));
                    let ok = self.phy.write(buf).is_ok();
                    self.phy.set_bus_width(BusWidth::Narrow);
                    if !ok {
                        break;
                    }
                }
                ScsiPhase::Status => {
                    let mut s = [0u8];
                    if self.phy.read(&mut s).is_err() {
                        break;
                    }
                    status = Some(s[0]);
                }
                ScsiPhase::MessageIn => {
                    let mut msg = [0u8];
                    if self.phy.read(&mut msg).is_err() {
                        break;
                    }
                    if msg[0] == MSG_COMMAND_COMPLETE {
                        break;
                    }
                }
                _ => (),
            }
        }

        self.phy.release();
        status
    }

    /// Continues the phase loop of a command whose data phase the caller
    /// streamed manually
    fn drain_status(&mut self) -> Option<u8> {
        let mut status = None;
        loop {
            let phase = self.phy.get_phase();
            match phase {
                ScsiPhase::BusFree => break,
                ScsiPhase::Status => {
                    let mut s = [0u8];
                    if self.phy.read(&mut s).is_err() {
                        break;
                    }
                    status = Some(s[0]);
                }
                ScsiPhase::MessageIn => {
                    let mut msg = [0u8];
                    if self.phy.read(&mut msg).is_err() {
                        break;
                    }
                    if msg[0] == MSG_COMMAND_COMPLETE {
                        break;
                    }
                }
                _ => break,
            }
        }
        self.phy.release();
        status
    }

    /// Streams one batch from the target straight into the image file,
    /// overlapping card writes with the bus handshake
    fn read_batch_to_file(&mut self, start_sector: u32, sectors: u32) -> bool {
        let (id, sector_size, use_read10) = {
            let job = self.job.as_ref().unwrap();
            (job.target_id, job.sector_size, job.use_read10)
        };

        let fits_read6 =
            start_sector <= READ6_MAX_LBA && sectors <= READ6_MAX_SECTORS;
        let cdb: Vec<u8> = if !use_read10 && fits_read6 {
            vec![
                0x08,
                (start_sector >> 16) as u8,
                (start_sector >> 8) as u8,
                start_sector as u8,
                (sectors & 0xFF) as u8,
                0x00,
            ]
        } else {
            vec![
                0x28,
                0x00,
                (start_sector >> 24) as u8,
                (start_sector >> 16) as u8,
                (start_sector >> 8) as u8,
                start_sector as u8,
                0x00,
                (sectors >> 8) as u8,
                sectors as u8,
                0x00,
            ]
        };

        if self.execute(id, &cdb, None, None, true) != Some(STATUS_DATA_PHASE) {
            return false;
        }

        // Data phase reached; pull chunks and push them to the file while
        // the bus keeps handshaking the next chunk
        let total = sectors as usize * sector_size as usize;
        let width = BusWidth::from_exponent(self.target_bus_width[id as usize]);
        let mut buf = vec![0u8; TRANSFER_CHUNK];
        let mut done = 0usize;
        let mut all_ok = true;
        if self
            .job
            .as_mut()
            .unwrap()
            .file
            .seek(SeekFrom::Start(
                u64::from(start_sector) * u64::from(sector_size),
            ))
            .is_err()
        {
            all_ok = false;
        }
        while done < total && all_ok {
            if self.phy.reset_flag() {
                all_ok = false;
                break;
            }
            let chunk = (total - done).min(TRANSFER_CHUNK);
            self.phy.set_bus_width(width);
            let rx = self.phy.read(&mut buf[..chunk]);
            self.phy.set_bus_width(BusWidth::Narrow);
            if rx.is_err() {
                warn!("Read failed at byte {}", done);
                all_ok = false;
                break;
            }
            if self
                .job
                .as_mut()
                .unwrap()
                .file
                .write_all(&buf[..chunk])
                .is_err()
            {
                error!("Card write failed during imaging");
                all_ok = false;
                break;
            }
            done += chunk;
        }

        let status = self.drain_status();
        all_ok && status == Some(STATUS_GOOD)
    }

    fn test_unit_ready(&mut self, id: u8) -> bool {
        // A freshly powered drive may need a few tries
        for attempt in 0..2 {
            let status = self.execute(id, &[0x00, 0, 0, 0, 0, 0], None, None, false);
            match status {
                Some(STATUS_GOOD) => return true,
                Some(s) => {
                    debug!("Target {} TEST UNIT READY attempt {}: {}", id, attempt, s);
                    // Fetch and discard sense so the next try is clean
                    let mut sense = [0u8; 18];
                    let _ = self.execute(
                        id,
                        &[0x03, 0, 0, 0, 18, 0],
                        Some(&mut sense),
                        None,
                        false,
                    );
                }
                None => return false,
            }
        }
        false
    }

    fn start_stop_unit(&mut self, id: u8, start: bool, eject: bool) -> bool {
        let mut op = 0u8;
        if start {
            op |= 0x01;
        }
        if eject {
            op |= 0x02;
        }
        self.execute(id, &[0x1B, 0, 0, 0, op, 0], None, None, false) == Some(STATUS_GOOD)
    }

    fn inquiry(&mut self, id: u8, data: &mut [u8; 36]) -> bool {
        self.execute(id, &[0x12, 0, 0, 0, 36, 0], Some(data), None, false)
            == Some(STATUS_GOOD)
    }

    fn read_capacity(&mut self, id: u8) -> Option<(u32, u32)> {
        let mut data = [0u8; 8];
        let status = self.execute(
            id,
            &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            Some(&mut data),
            None,
            false,
        )?;
        if status != STATUS_GOOD {
            return None;
        }
        let last_lba = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let size = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        Some((last_lba.checked_add(1)?, size))
    }

    fn test_supports_read10(&mut self, id: u8, sector_size: u32) -> bool {
        let mut buf = vec![0u8; sector_size as usize];
        let cdb = [0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        self.execute(id, &cdb, Some(&mut buf), None, false) == Some(STATUS_GOOD)
    }

    /// Wide transfer negotiation through a MESSAGE OUT/IN exchange
    fn negotiate_bus_width(&mut self, id: u8, width: u8) -> bool {
        debug!("Negotiating bus width {} with ID {}", 8 << width, id);
        if !self.phy.select(id, self.sys.initiator_id) {
            self.phy.release();
            return false;
        }

        let msg_out = [MSG_IDENTIFY, 0x01, 0x02, 0x03, width];
        let mut agreed: Option<u8> = None;
        loop {
            match self.phy.get_phase() {
                ScsiPhase::MessageOut => {
                    if self.phy.write(&msg_out).is_err() {
                        break;
                    }
                }
                ScsiPhase::MessageIn => {
                    let mut header = [0u8; 2];
                    if self.phy.read(&mut header).is_err() {
                        break;
                    }
                    if header[0] != 0x01 {
                        // Message reject or similar
                        break;
                    }
                    let mut body = [0u8; 4];
                    let len = (header[1] as usize).min(body.len());
                    if self.phy.read(&mut body[..len]).is_err() {
                        break;
                    }
                    if body[0] == 0x03 {
                        agreed = Some(body[1]);
                    }
                }
                _ => break,
            }
            if agreed.is_some() {
                break;
            }
        }
        self.phy.release();

        match agreed {
            Some(a) if a == width => {
                info!("Negotiated {} bit bus with ID {}", 8 << width, id);
                self.target_bus_width[id as usize] = width;
                true
            }
            _ => {
                self.target_bus_width[id as usize] = 0;
                false
            }
        }
    }
}
