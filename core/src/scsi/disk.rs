//! Block device command set (direct-access, optical, removable and friends)
//!
//! Command handlers decode and pre-validate the CDB against the target
//! state. Bulk data moves are returned as `ReadBlocks`/`WriteBlocks` for
//! the bus to stream through the transfer pipeline; everything that fits a
//! small buffer is returned inline.

use log::*;

use crate::settings::{ScsiDeviceType, ScsiQuirks};
use crate::storage::sd::SdCard;
use crate::storage::BackingStore;

use super::sense::*;
use super::target::Target;
use super::{ScsiCmdResult, STATUS_GOOD};

/// Fabricated geometry for Apple hosts: Mac OS sanity-checks the rigid
/// geometry page, so cylinders are derived from capacity with this fixed
/// head/sector pair. 40960 blocks (a 20 MiB disk) reports 40 cylinders.
const APPLE_GEOMETRY_HEADS: u32 = 16;
const APPLE_GEOMETRY_SECTORS: u32 = 63;

pub(super) fn dispatch(t: &mut Target, _card: &SdCard, cdb: &[u8]) -> ScsiCmdResult {
    match cdb[0] {
        // REZERO UNIT
        0x01 => ScsiCmdResult::Status(STATUS_GOOD),
        // FORMAT UNIT
        0x04 => format_unit(t),
        // READ(6)
        0x08 => {
            let lba = u64::from(u32::from_be_bytes([0, cdb[1] & 0x1F, cdb[2], cdb[3]]));
            let blocks = if cdb[4] == 0 { 256 } else { u32::from(cdb[4]) };
            read_blocks(t, lba, blocks)
        }
        // READ(10)
        0x28 => {
            let lba = u64::from(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]));
            let blocks = u32::from(u16::from_be_bytes([cdb[7], cdb[8]]));
            read_blocks(t, lba, blocks)
        }
        // READ(12)
        0xA8 => {
            let lba = u64::from(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]));
            let blocks = u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]]);
            read_blocks(t, lba, blocks)
        }
        // WRITE(6)
        0x0A => {
            let lba = u64::from(u32::from_be_bytes([0, cdb[1] & 0x1F, cdb[2], cdb[3]]));
            let blocks = if cdb[4] == 0 { 256 } else { u32::from(cdb[4]) };
            write_blocks(t, lba, blocks)
        }
        // WRITE(10)
        0x2A => {
            let lba = u64::from(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]));
            let blocks = u32::from(u16::from_be_bytes([cdb[7], cdb[8]]));
            write_blocks(t, lba, blocks)
        }
        // WRITE(12)
        0xAA => {
            let lba = u64::from(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]));
            let blocks = u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]]);
            write_blocks(t, lba, blocks)
        }
        // SEEK(6)
        0x0B => {
            let lba = u64::from(u32::from_be_bytes([0, cdb[1] & 0x1F, cdb[2], cdb[3]]));
            seek(t, lba)
        }
        // SEEK(10) / LOCATE
        0x2B => {
            let lba = u64::from(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]));
            seek(t, lba)
        }
        // READ CAPACITY(10)
        0x25 => read_capacity(t),
        // VERIFY(10)
        0x2F => verify(t, cdb),
        // SYNCHRONIZE CACHE
        0x35 => synchronize_cache(t),
        // READ TOC
        0x43 => {
            if t.device_type == ScsiDeviceType::Optical {
                read_toc(t, cdb)
            } else {
                t.check(SenseKey::IllegalRequest, ASC_INVALID_COMMAND_OPERATION_CODE)
            }
        }
        // PLAY AUDIO / PAUSE-RESUME family: rendering is the audio
        // subsystem's problem, the command set just acknowledges
        0x45 | 0x47 | 0x48 | 0x4B | 0x4E if t.device_type == ScsiDeviceType::Optical => {
            debug!("Audio command {:02X} acknowledged", cdb[0]);
            ScsiCmdResult::Status(STATUS_GOOD)
        }
        op => {
            debug!("Unknown command {:02X}", op);
            t.check(SenseKey::IllegalRequest, ASC_INVALID_COMMAND_OPERATION_CODE)
        }
    }
}

fn format_unit(t: &mut Target) -> ScsiCmdResult {
    let writable = t.store.as_ref().is_some_and(BackingStore::is_writable);
    if writable {
        // Formatting an image is a no-op; the blocks are there already
        ScsiCmdResult::Status(STATUS_GOOD)
    } else {
        t.check(SenseKey::DataProtect, ASC_WRITE_PROTECTED)
    }
}

fn read_blocks(t: &mut Target, lba: u64, blocks: u32) -> ScsiCmdResult {
    let capacity = t.capacity_lba();
    if lba + u64::from(blocks) > capacity {
        debug!(
            "READ out of range: lba {} + {} > {}",
            lba, blocks, capacity
        );
        return t.check(SenseKey::IllegalRequest, ASC_LBA_OUT_OF_RANGE);
    }
    if blocks == 0 {
        return ScsiCmdResult::Status(STATUS_GOOD);
    }
    ScsiCmdResult::ReadBlocks { lba, blocks }
}

fn write_blocks(t: &mut Target, lba: u64, blocks: u32) -> ScsiCmdResult {
    if !t.store.as_ref().is_some_and(BackingStore::is_writable) {
        warn!("Host attempted write to a read-only drive");
        return t.check(SenseKey::DataProtect, ASC_WRITE_PROTECTED);
    }
    let capacity = t.capacity_lba();
    if lba + u64::from(blocks) > capacity {
        debug!(
            "WRITE out of range: lba {} + {} > {}",
            lba, blocks, capacity
        );
        return t.check(SenseKey::IllegalRequest, ASC_LBA_OUT_OF_RANGE);
    }
    // Cached prefetch may overlap the written range
    t.prefetch = None;
    if blocks == 0 {
        return ScsiCmdResult::Status(STATUS_GOOD);
    }
    ScsiCmdResult::WriteBlocks { lba, blocks }
}

fn seek(t: &mut Target, lba: u64) -> ScsiCmdResult {
    if lba >= t.capacity_lba() {
        return t.check(SenseKey::IllegalRequest, ASC_LBA_OUT_OF_RANGE);
    }
    ScsiCmdResult::Status(STATUS_GOOD)
}

fn read_capacity(t: &mut Target) -> ScsiCmdResult {
    let capacity = t.capacity_lba();
    if capacity == 0 {
        return t.check(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT);
    }
    let last_lba = u32::try_from(capacity - 1).unwrap_or(u32::MAX);
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&last_lba.to_be_bytes());
    data.extend_from_slice(&t.block_size.to_be_bytes());
    ScsiCmdResult::DataIn(data)
}

fn verify(t: &mut Target, cdb: &[u8]) -> ScsiCmdResult {
    let byte_compare = cdb[1] & 0x02 != 0;
    if byte_compare {
        debug!("VERIFY with byte compare is not implemented");
        return t.check(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
    }
    // Host asks for an ECC pass; the image has no ECC to fail
    ScsiCmdResult::Status(STATUS_GOOD)
}

fn synchronize_cache(t: &mut Target) -> ScsiCmdResult {
    if let Some(store) = &mut t.store {
        if let Err(e) = store.flush() {
            error!("SYNCHRONIZE CACHE flush failed: {}", e);
            return t.check(SenseKey::MediumError, ASC_NO_ADDITIONAL_SENSE_INFORMATION);
        }
    }
    ScsiCmdResult::Status(STATUS_GOOD)
}

/// MODE SENSE(6) and (10). Returns the block descriptor followed by the
/// requested page(s); 0x3F returns every page this device has.
pub(super) fn mode_sense(t: &mut Target, _card: &SdCard, cdb: &[u8]) -> ScsiCmdResult {
    let long_form = cdb[0] == 0x5A;
    let dbd = cdb[1] & 0x08 != 0;
    let page = cdb[2] & 0x3F;
    let alloc = if long_form {
        u16::from_be_bytes([cdb[7], cdb[8]]) as usize
    } else {
        cdb[4] as usize
    };

    let mut pages: Vec<u8> = Vec::new();
    let mut found = false;
    for candidate in [0x01u8, 0x03, 0x04, 0x08, 0x2A, 0x30] {
        if page == 0x3F || page == candidate {
            if let Some(body) = mode_page(t, candidate) {
                pages.push(candidate);
                pages.push(body.len() as u8);
                pages.extend_from_slice(&body);
                found = true;
            }
        }
    }
    if !found {
        debug!("Unsupported mode page {:02X}", page);
        return t.check(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
    }

    let descriptor = if dbd { Vec::new() } else { block_descriptor(t) };

    let mut data = if long_form {
        let mut d = vec![0u8; 8];
        let total = 8 + descriptor.len() + pages.len();
        d[0..2].copy_from_slice(&((total - 2) as u16).to_be_bytes());
        d[2] = mode_medium_type(t);
        d[3] = mode_device_specific(t);
        d[7] = descriptor.len() as u8;
        d
    } else {
        let total = 4 + descriptor.len() + pages.len();
        vec![
            (total - 1) as u8,
            mode_medium_type(t),
            mode_device_specific(t),
            descriptor.len() as u8,
        ]
    };
    data.extend_from_slice(&descriptor);
    data.extend_from_slice(&pages);
    data.truncate(alloc);
    ScsiCmdResult::DataIn(data)
}

fn block_descriptor(t: &Target) -> Vec<u8> {
    let capacity = t.capacity_lba().min(0xFF_FFFF) as u32;
    let mut d = vec![0u8; 8];
    d[0] = mode_density(t);
    d[1..4].copy_from_slice(&capacity.to_be_bytes()[1..4]);
    d[5..8].copy_from_slice(&t.block_size.to_be_bytes()[1..4]);
    d
}

fn mode_density(t: &Target) -> u8 {
    match t.device_type {
        // User data only, 2048 bytes per sector
        ScsiDeviceType::Optical => 0x01,
        _ => 0x00,
    }
}

fn mode_medium_type(t: &Target) -> u8 {
    match t.device_type {
        // 120 mm CD-ROM
        ScsiDeviceType::Optical => 0x02,
        _ => 0x00,
    }
}

fn mode_device_specific(t: &Target) -> u8 {
    // Write-protect bit
    if t.store.as_ref().is_some_and(BackingStore::is_writable) {
        0x00
    } else {
        0x80
    }
}

/// Body of one mode page, without the page code/length header
fn mode_page(t: &Target, page: u8) -> Option<Vec<u8>> {
    match page {
        // Read/write error recovery
        0x01 => Some(vec![0u8; 6]),
        // Format device
        0x03 => {
            let mut body = vec![0u8; 22];
            body[8..10].copy_from_slice(&(t.settings.sectors_per_track as u16).to_be_bytes());
            body[10..12].copy_from_slice(&(t.block_size as u16).to_be_bytes());
            // Interleave 1, soft sectored
            body[1] = 1;
            Some(body)
        }
        // Rigid disk geometry
        0x04 => {
            if !matches!(
                t.device_type,
                ScsiDeviceType::Fixed
                    | ScsiDeviceType::Removable
                    | ScsiDeviceType::Zip100
                    | ScsiDeviceType::Zip250
                    | ScsiDeviceType::Jaz
            ) {
                return None;
            }
            let (cylinders, heads) = geometry(t);
            let mut body = vec![0u8; 22];
            body[0..3].copy_from_slice(&cylinders.to_be_bytes()[1..4]);
            body[3] = heads as u8;
            Some(body)
        }
        // Caching
        0x08 => {
            let mut body = vec![0u8; 10];
            // Read cache enabled (RCD = 0), write cache disabled
            body[0] = 0x00;
            Some(body)
        }
        // CD capabilities and mechanical status
        0x2A => {
            if t.device_type != ScsiDeviceType::Optical {
                return None;
            }
            let mut body = vec![0u8; 18];
            // Reads CD-R/CD-RW
            body[0] = 0x03;
            // Audio play supported
            body[2] = 0x01;
            // Locking supported, eject supported
            body[4] = 0x29;
            // Max/current speed 4x (706 kB/s)
            body[6..8].copy_from_slice(&706u16.to_be_bytes());
            body[12..14].copy_from_slice(&706u16.to_be_bytes());
            Some(body)
        }
        // Apple signature page; Mac OS drivers probe for it
        0x30 => {
            if t.quirks != ScsiQuirks::Apple {
                return None;
            }
            Some(b"APPLE COMPUTER, INC   ".to_vec())
        }
        _ => None,
    }
}

/// Cylinder/head counts for the geometry pages. Apple hosts get values
/// fabricated from capacity with a fixed head/sector pair so the driver's
/// sanity check passes.
fn geometry(t: &Target) -> (u32, u32) {
    let capacity = t.capacity_lba() as u32;
    if t.quirks == ScsiQuirks::Apple && !t.settings.disable_mac_sanity_check {
        let cylinders = capacity / (APPLE_GEOMETRY_HEADS * APPLE_GEOMETRY_SECTORS);
        (cylinders.max(1), APPLE_GEOMETRY_HEADS)
    } else {
        let heads = t.settings.heads_per_cylinder.max(1);
        let sectors = t.settings.sectors_per_track.max(1);
        ((capacity / (heads * sectors)).max(1), heads)
    }
}

/// MODE SELECT parameter list: accepted, with only the block descriptor's
/// block length honored
pub(super) fn mode_select(t: &mut Target, data: &[u8]) -> ScsiCmdResult {
    if data.len() >= 12 {
        let descriptor_len = data[3] as usize;
        if descriptor_len >= 8 {
            let blocklen =
                u32::from_be_bytes([0, data[4 + 5], data[4 + 6], data[4 + 7]]);
            if blocklen != 0 && blocklen != t.block_size {
                if [256, 512, 1024, 2048, 4096].contains(&blocklen) {
                    debug!("MODE SELECT block size change: {}", blocklen);
                    t.block_size = blocklen;
                    t.set_unit_attention(ASC_PARAMETERS_CHANGED);
                } else {
                    return t.check(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
                }
            }
        }
    }
    ScsiCmdResult::Status(STATUS_GOOD)
}

/// READ TOC for optical targets. Track layout comes from the cue sheet when
/// the image is a folder, otherwise a single data track covers the image.
fn read_toc(t: &mut Target, cdb: &[u8]) -> ScsiCmdResult {
    const TRACK_LEADOUT: u8 = 0xAA;

    let msf = cdb[1] & 0x02 != 0;
    let format = cdb[2] & 0x0F;
    let track = cdb[6];
    let alloc = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;

    // (track number, control byte, start lba)
    let mut tracks: Vec<(u8, u8, u32)> = Vec::new();
    if let Some(BackingStore::Folder(folder)) = &t.store {
        for cue in folder.tracks() {
            let control = if cue.track_type.is_audio() { 0x10 } else { 0x14 };
            let lba = (cue.start_offset / u64::from(t.block_size)) as u32;
            tracks.push((cue.number, control, lba));
        }
    } else {
        tracks.push((1, 0x14, 0));
    }
    let leadout_lba = t.capacity_lba() as u32;

    let mut data = match format {
        0 => {
            // TOC: descriptors from the requested track up, plus lead-out
            if track > tracks.len() as u8 && track != TRACK_LEADOUT && track != 0 {
                return t.check(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
            }
            let mut d = vec![0u8; 4];
            d[2] = tracks.first().map(|t| t.0).unwrap_or(1);
            d[3] = tracks.last().map(|t| t.0).unwrap_or(1);
            for (number, control, lba) in
                tracks.iter().filter(|(n, _, _)| track <= *n || track == 0)
            {
                d.extend_from_slice(&track_descriptor(*number, *control, *lba, msf));
            }
            d.extend_from_slice(&track_descriptor(TRACK_LEADOUT, 0x14, leadout_lba, msf));
            let len = (d.len() - 2) as u16;
            d[0..2].copy_from_slice(&len.to_be_bytes());
            d
        }
        1 => {
            // Session info: single session
            let mut d = vec![0u8; 4];
            d[0..2].copy_from_slice(&10u16.to_be_bytes());
            d[2] = 1;
            d[3] = 1;
            let (number, control, lba) = tracks[0];
            d.extend_from_slice(&track_descriptor(number, control, lba, msf));
            d
        }
        2 => {
            // Full TOC: session lead-in points
            let mut d = vec![0u8; 4];
            d[2] = 1;
            d[3] = 1;
            for (number, control, lba) in &tracks {
                let mut desc = [0u8; 11];
                desc[0] = 1;
                desc[1] = *control;
                desc[3] = *number;
                desc[7..11].copy_from_slice(&lba_field(*lba, msf));
                d.extend_from_slice(&desc);
            }
            let len = (d.len() - 2) as u16;
            d[0..2].copy_from_slice(&len.to_be_bytes());
            d
        }
        _ => {
            error!("Unknown READ TOC format {}", format);
            return t.check(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
        }
    };

    data.truncate(alloc);
    ScsiCmdResult::DataIn(data)
}

fn track_descriptor(number: u8, control: u8, lba: u32, msf: bool) -> [u8; 8] {
    let mut d = [0u8; 8];
    d[1] = control;
    d[2] = number;
    d[4..8].copy_from_slice(&lba_field(lba, msf));
    d
}

/// Track start address, as LBA or MSF depending on the CDB flag
fn lba_field(lba: u32, msf: bool) -> [u8; 4] {
    if msf {
        let frames = lba + 150;
        [
            0,
            (frames / 75 / 60) as u8,
            (frames / 75 % 60) as u8,
            (frames % 75) as u8,
        ]
    } else {
        lba.to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::super::target::tests::disk_target;
    use super::super::{ScsiCmdResult, STATUS_CHECK_CONDITION, STATUS_GOOD};
    use super::*;
    use crate::settings::{DeviceSettings, SystemSettings};

    #[test]
    fn read_capacity_reports_last_lba_and_block_size() {
        let dir = tempfile::tempdir().unwrap();
        // 20 MiB disk
        let (card, mut target) = disk_target(&dir, 20 * 1024 * 1024);

        let ScsiCmdResult::DataIn(data) =
            target.command(&card, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0])
        else {
            panic!("expected data");
        };
        assert_eq!(&data[0..4], &0x9FFFu32.to_be_bytes());
        assert_eq!(&data[4..8], &512u32.to_be_bytes());
    }

    #[test]
    fn read_beyond_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (card, mut target) = disk_target(&dir, 512 * 16);

        // lba 15 + 2 blocks > 16
        let r = target.command(&card, &[0x08, 0, 0, 15, 2, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_CHECK_CONDITION)));
        assert_eq!(target.sense.key, SenseKey::IllegalRequest);
        assert_eq!(target.sense.asc, ASC_LBA_OUT_OF_RANGE);

        // lba 14 + 2 is fine
        let r = target.command(&card, &[0x08, 0, 0, 14, 2, 0]);
        assert!(matches!(r, ScsiCmdResult::ReadBlocks { lba: 14, blocks: 2 }));
    }

    #[test]
    fn read6_zero_blocks_means_256() {
        let dir = tempfile::tempdir().unwrap();
        let (card, mut target) = disk_target(&dir, 512 * 256);

        let r = target.command(&card, &[0x08, 0, 0, 0, 0, 0]);
        assert!(matches!(r, ScsiCmdResult::ReadBlocks { lba: 0, blocks: 256 }));
    }

    #[test]
    fn write_to_read_only_image_is_data_protect() {
        let dir = tempfile::tempdir().unwrap();
        let card = crate::storage::sd::SdCard::open(dir.path()).unwrap();
        let path = dir.path().join("ro.hda");
        std::fs::write(&path, vec![0u8; 512 * 8]).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).unwrap();

        let sys = SystemSettings::default();
        let settings = DeviceSettings {
            images: vec!["ro.hda".into()],
            ..Default::default()
        };
        let mut target = super::super::target::Target::new(
            0,
            ScsiDeviceType::Fixed,
            &sys,
            settings,
            0,
        );

        let r = target.command(&card, &[0x0A, 0, 0, 0, 1, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_CHECK_CONDITION)));
        assert_eq!(target.sense.key, SenseKey::DataProtect);
        assert_eq!(target.sense.asc, ASC_WRITE_PROTECTED);
    }

    #[test]
    fn mode_sense_geometry_page_under_apple_quirks() {
        let dir = tempfile::tempdir().unwrap();
        let card = crate::storage::sd::SdCard::open(dir.path()).unwrap();
        // 20 MiB = 40960 blocks -> 40 cylinders at 16 heads x 63 sectors
        std::fs::write(dir.path().join("mac.hda"), vec![0u8; 20 * 1024 * 1024]).unwrap();

        let sys = SystemSettings::for_preset(crate::settings::SystemPreset::Mac);
        let settings = DeviceSettings {
            images: vec!["mac.hda".into()],
            ..Default::default()
        };
        let mut target = super::super::target::Target::new(
            0,
            ScsiDeviceType::Fixed,
            &sys,
            settings,
            0,
        );

        let ScsiCmdResult::DataIn(data) = target.command(&card, &[0x1A, 0, 0x04, 0, 255, 0])
        else {
            panic!("expected data");
        };
        // Header (4) + block descriptor (8), then the page
        assert_eq!(data[3], 8);
        let page = &data[12..];
        assert_eq!(page[0], 0x04);
        let cylinders = u32::from_be_bytes([0, page[2], page[3], page[4]]);
        assert_eq!(cylinders, 40);
        assert_eq!(page[5], 16);
    }

    #[test]
    fn mode_sense_all_pages_includes_apple_signature() {
        let dir = tempfile::tempdir().unwrap();
        let card = crate::storage::sd::SdCard::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("mac.hda"), vec![0u8; 512 * 64]).unwrap();

        let sys = SystemSettings::for_preset(crate::settings::SystemPreset::Mac);
        let settings = DeviceSettings {
            images: vec!["mac.hda".into()],
            ..Default::default()
        };
        let mut target = super::super::target::Target::new(
            0,
            ScsiDeviceType::Fixed,
            &sys,
            settings,
            0,
        );

        let ScsiCmdResult::DataIn(data) = target.command(&card, &[0x1A, 0, 0x3F, 0, 255, 0])
        else {
            panic!("expected data");
        };
        let needle = b"APPLE COMPUTER, INC";
        assert!(data
            .windows(needle.len())
            .any(|w| w == needle));
    }

    #[test]
    fn unknown_opcode_reports_invalid_command() {
        let dir = tempfile::tempdir().unwrap();
        let (card, mut target) = disk_target(&dir, 512 * 16);

        let r = target.command(&card, &[0xF0, 0, 0, 0, 0, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_CHECK_CONDITION)));
        assert_eq!(target.sense.key, SenseKey::IllegalRequest);
        assert_eq!(target.sense.asc, ASC_INVALID_COMMAND_OPERATION_CODE);
    }

    #[test]
    fn verify_without_byte_compare_is_good() {
        let dir = tempfile::tempdir().unwrap();
        let (card, mut target) = disk_target(&dir, 512 * 16);

        let r = target.command(&card, &[0x2F, 0, 0, 0, 0, 0, 0, 0, 1, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_GOOD)));

        let r = target.command(&card, &[0x2F, 0x02, 0, 0, 0, 0, 0, 0, 1, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_CHECK_CONDITION)));
    }
}
