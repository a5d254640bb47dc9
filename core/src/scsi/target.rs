//! SCSI target: one emulated device behind one bus ID
//!
//! Owns the backing store, the latched sense, unit attention and the
//! eject/rotation machinery. Command bytes come in from the bus state
//! machine; the pre-validated outcome goes back as a [`ScsiCmdResult`] for
//! the bus to run the data phases.

use anyhow::Result;
use log::*;

use crate::pipeline::PrefetchCache;
use crate::settings::{
    DeviceSettings, DriveIdentity, ScsiDeviceType, ScsiQuirks, SystemSettings,
};
use crate::storage::sd::SdCard;
use crate::storage::{BackingStore, ImageSource};

use super::disk;
use super::sense::*;
use super::tape::{self, TapeState};
use super::{DataOutAction, ScsiCmdResult, STATUS_CHECK_CONDITION, STATUS_GOOD};

pub struct Target {
    id: u8,
    pub(crate) device_type: ScsiDeviceType,
    pub(crate) quirks: ScsiQuirks,
    pub(crate) enable_scsi2: bool,
    pub(crate) settings: DeviceSettings,
    pub(crate) identity: DriveIdentity,
    pub(crate) block_size: u32,

    pub(crate) sense: SenseData,
    unit_attention: Option<u16>,

    pub(crate) store: Option<BackingStore>,
    /// Flash contents for ROM-drive targets
    rom_flash: Option<Vec<u8>>,

    pub(crate) ejected: bool,
    /// Host has seen the empty tray via TEST UNIT READY
    eject_observed: bool,
    image_index: usize,
    /// Rotation override staged by the Toolbox SET NEXT CD command
    next_image_override: Option<usize>,
    /// Mount the next image read-only (fixed-disk rotation)
    mount_read_only: bool,

    pub(crate) tape: Option<TapeState>,
    pub(crate) prefetch: Option<PrefetchCache>,
}

impl Target {
    pub fn new(
        id: u8,
        device_type: ScsiDeviceType,
        sys: &SystemSettings,
        settings: DeviceSettings,
        sd_serial: u32,
    ) -> Self {
        let identity = DriveIdentity::build(&settings, device_type, sys.quirks, sd_serial);
        let block_size = settings.block_size_for(device_type);
        let tape = (device_type == ScsiDeviceType::Sequential).then(TapeState::default);

        Self {
            id,
            device_type,
            quirks: sys.quirks,
            enable_scsi2: sys.enable_scsi2,
            settings,
            identity,
            block_size,
            sense: SenseData::default(),
            unit_attention: None,
            store: None,
            rom_flash: None,
            ejected: false,
            eject_observed: false,
            image_index: 0,
            next_image_override: None,
            mount_read_only: false,
            tape,
            prefetch: None,
        }
    }

    /// Provides the flash contents for a `ROM:` image source
    pub fn set_rom_flash(&mut self, flash: Vec<u8>) {
        self.rom_flash = Some(flash);
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn device_type(&self) -> ScsiDeviceType {
        self.device_type
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// A target is active when it has an open store or anything to open
    pub fn active(&self) -> bool {
        self.store.is_some() || !self.settings.images.is_empty() || self.rom_flash.is_some()
    }

    pub fn capacity_lba(&self) -> u64 {
        self.store
            .as_ref()
            .map(|s| s.size() / u64::from(self.block_size))
            .unwrap_or(0)
    }

    pub fn image_index(&self) -> usize {
        self.image_index
    }

    pub fn images(&self) -> &[String] {
        &self.settings.images
    }

    /// Stages which image the next rotation mounts
    pub fn set_next_image(&mut self, index: usize) {
        self.next_image_override = Some(index);
    }

    pub(crate) fn check(&mut self, key: SenseKey, asc: u16) -> ScsiCmdResult {
        self.sense.set(key, asc);
        ScsiCmdResult::Status(STATUS_CHECK_CONDITION)
    }

    /// Latches a one-shot unit attention
    pub fn set_unit_attention(&mut self, asc: u16) {
        self.unit_attention = Some(asc);
    }

    /// Bus reset: drop transfer state and arm unit attention
    pub fn bus_reset(&mut self, card: &SdCard) {
        self.set_unit_attention(ASC_RESET_OCCURRED);
        self.prefetch = None;
        if self.ejected
            && !self.settings.keep_current_image_on_bus_reset
            && !self.settings.images.is_empty()
        {
            // A reset while the tray is out remounts the current image so
            // the host finds a disk after rescanning the bus
            if let Err(e) = self.mount_image(card, self.image_index) {
                warn!("Remount after bus reset failed: {:#}", e);
            }
        }
    }

    /// Opens the backing store if it is not open yet. Stores open lazily on
    /// the first command that needs them.
    fn ensure_store(&mut self, card: &SdCard) -> bool {
        if self.store.is_some() {
            return true;
        }
        if let Some(flash) = &self.rom_flash {
            match BackingStore::open_rom(flash) {
                Ok(store) => {
                    self.store = Some(store);
                    return true;
                }
                Err(e) => {
                    warn!("ROM drive unavailable: {:#}", e);
                    return false;
                }
            }
        }
        if self.settings.images.is_empty() {
            return false;
        }
        match self.open_image(card, self.image_index) {
            Ok(store) => {
                self.store = Some(store);
                if let Some(tape) = &mut self.tape {
                    tape.media_loaded(self.store.as_ref().unwrap());
                }
                true
            }
            Err(e) => {
                warn!("Failed to open image for SCSI ID {}: {:#}", self.id, e);
                false
            }
        }
    }

    fn open_image(&mut self, card: &SdCard, index: usize) -> Result<BackingStore> {
        let name = self.settings.images[index].clone();
        let source = if self.settings.sector_sd_end > 0 {
            ImageSource::Raw {
                begin: self.settings.sector_sd_begin,
                end: self.settings.sector_sd_end,
            }
        } else {
            ImageSource::parse(&name)?
        };

        // A directory configured on a tape target is a multi-file tape, not
        // a cue/bin folder
        if self.device_type == ScsiDeviceType::Sequential {
            if let ImageSource::File(path) = &source {
                let resolved = card.resolve(path);
                if resolved.is_dir() {
                    return tape::open_folder_tape(self, &resolved, card);
                }
            }
        }

        let mut store = BackingStore::open(card, &source, self.block_size, &self.settings)?;
        if self.take_mount_read_only() {
            if let BackingStore::File(f) = &mut store {
                f.set_read_only();
            }
        }
        if let Some(expected) = self.device_type.fixed_media_size() {
            if store.size() != expected {
                warn!(
                    "Image {} is {} bytes, expected {} for this media type",
                    name,
                    store.size(),
                    expected
                );
            }
        }
        debug!(
            "SCSI ID {}: opened image {} ({} bytes)",
            self.id,
            name,
            store.size()
        );
        Ok(store)
    }

    fn mount_image(&mut self, card: &SdCard, index: usize) -> Result<()> {
        let store = self.open_image(card, index)?;
        self.image_index = index;
        self.store = Some(store);
        self.ejected = false;
        self.eject_observed = false;
        self.prefetch = None;
        if let Some(tape) = &mut self.tape {
            tape.media_loaded(self.store.as_ref().unwrap());
        }
        self.set_unit_attention(ASC_MEDIUM_CHANGED);
        Ok(())
    }

    fn next_image_index(&mut self) -> usize {
        let count = self.settings.images.len().max(1);
        self.next_image_override
            .take()
            .map(|i| i % count)
            .unwrap_or((self.image_index + 1) % count)
    }

    /// Physical eject button handling; `mask` carries the pressed buttons
    pub fn eject_button(&mut self, card: &SdCard, mask: u8) {
        if self.settings.eject_button & mask == 0 {
            return;
        }
        if self.device_type == ScsiDeviceType::Fixed && !self.settings.eject_fixed_disk_enable {
            return;
        }
        if self.ejected {
            // Second press reinserts
            let next = self.next_image_index();
            if let Err(e) = self.mount_image(card, next) {
                warn!("Image rotation failed: {:#}", e);
            }
            return;
        }
        self.eject_media(card);
    }

    /// Ejects the media, or rotates straight to the next image when the
    /// host must never see an empty tray
    pub(crate) fn eject_media(&mut self, card: &SdCard) {
        info!("SCSI ID {}: media ejected", self.id);
        self.prefetch = None;
        if self.device_type == ScsiDeviceType::Fixed && self.settings.eject_fixed_disk_read_only {
            self.mount_read_only = true;
        }
        if self.settings.reinsert_immediately {
            let next = self.next_image_index();
            if let Err(e) = self.mount_image(card, next) {
                warn!("Image rotation failed: {:#}", e);
            }
            return;
        }
        if let Some(store) = &mut self.store {
            let _ = store.flush();
        }
        self.store = None;
        self.ejected = true;
        self.eject_observed = false;
    }

    /// Whether the device can serve media-dependent commands right now
    fn ready(&mut self, card: &SdCard) -> bool {
        !self.ejected && self.ensure_store(card)
    }

    /// Entry point for one CDB
    pub fn command(&mut self, card: &SdCard, cdb: &[u8]) -> ScsiCmdResult {
        let op = cdb[0];

        // Tape flag bits report per-command state
        if self.device_type == ScsiDeviceType::Sequential {
            self.sense.clear_tape_flags();
        }

        // One-shot unit attention surfaces on the first command that can
        // carry it
        if let Some(asc) = self.unit_attention {
            if !matches!(op, 0x00 | 0x03 | 0x12) {
                self.unit_attention = None;
                self.sense.clear();
                return self.check(SenseKey::UnitAttention, asc);
            }
        }

        // Sense latched by an earlier command survives only until the next
        // command that is not REQUEST SENSE
        if op != 0x03 && self.sense.is_pending() {
            self.sense.clear();
        }

        match op {
            // TEST UNIT READY
            0x00 => self.test_unit_ready(card),
            // REQUEST SENSE
            0x03 => self.request_sense(cdb),
            // INQUIRY
            0x12 => self.inquiry(card, cdb),
            // MODE SELECT(6/10) and MODE SENSE(6/10) need the medium like
            // any other media command
            0x15 | 0x55 | 0x1A | 0x5A => {
                if !self.ready(card) {
                    return self.check(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT);
                }
                match op {
                    0x15 => {
                        ScsiCmdResult::DataOut(cdb[4] as usize, DataOutAction::ModeSelect)
                    }
                    0x55 => ScsiCmdResult::DataOut(
                        u16::from_be_bytes([cdb[7], cdb[8]]) as usize,
                        DataOutAction::ModeSelect,
                    ),
                    _ => disk::mode_sense(self, card, cdb),
                }
            }
            // START STOP UNIT
            0x1B => self.start_stop_unit(card, cdb),
            // PREVENT ALLOW MEDIUM REMOVAL
            0x1E => ScsiCmdResult::Status(STATUS_GOOD),
            _ => {
                if !self.ready(card) {
                    return self.check(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT);
                }
                if self.device_type == ScsiDeviceType::Sequential {
                    tape::dispatch(self, card, cdb)
                } else {
                    disk::dispatch(self, card, cdb)
                }
            }
        }
    }

    /// Applies collected DATA OUT bytes
    pub fn handle_data_out(
        &mut self,
        card: &SdCard,
        action: DataOutAction,
        data: &[u8],
    ) -> ScsiCmdResult {
        match action {
            DataOutAction::ModeSelect => {
                // Parameters are accepted but only the block descriptor's
                // block length is honored
                disk::mode_select(self, data)
            }
            DataOutAction::TapeWrite { fixed } => tape::write_data(self, card, fixed, data),
            DataOutAction::ToolboxFilePrep | DataOutAction::ToolboxFileData { .. } => {
                unreachable!("toolbox data handled at bus level")
            }
        }
    }

    fn test_unit_ready(&mut self, card: &SdCard) -> ScsiCmdResult {
        if self.ejected {
            self.eject_observed = true;
            return self.check(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT);
        }
        if !self.ensure_store(card) {
            return self.check(SenseKey::NotReady, ASC_LOGICAL_UNIT_NOT_READY);
        }
        ScsiCmdResult::Status(STATUS_GOOD)
    }

    fn request_sense(&mut self, cdb: &[u8]) -> ScsiCmdResult {
        let alloc = cdb[4] as usize;
        let mut data = self.sense.take().to_vec();
        data.truncate(alloc.max(4).min(SENSE_LENGTH));
        ScsiCmdResult::DataIn(data)
    }

    fn inquiry(&mut self, card: &SdCard, cdb: &[u8]) -> ScsiCmdResult {
        // An ejected drive configured for it reloads when the host probes
        if self.ejected && self.eject_observed && self.settings.reinsert_on_inquiry {
            let next = self.next_image_index();
            if let Err(e) = self.mount_image(card, next) {
                warn!("Reinsert on inquiry failed: {:#}", e);
            }
        }

        let evpd = cdb[1] & 0x01 != 0;
        let page = cdb[2];
        let alloc = cdb[4] as usize;

        if !evpd && page != 0 {
            return self.check(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
        }

        let mut data = if evpd {
            match page {
                // Supported vital product data pages
                0x00 => vec![self.device_type.peripheral_type(), 0x00, 0x00, 0x02, 0x00, 0x80],
                // Unit serial number
                0x80 => {
                    let mut d = vec![self.device_type.peripheral_type(), 0x80, 0x00, 0x10];
                    d.extend_from_slice(&self.identity.serial);
                    d
                }
                _ => return self.check(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB),
            }
        } else {
            self.standard_inquiry()
        };

        data.truncate(alloc);
        ScsiCmdResult::DataIn(data)
    }

    fn standard_inquiry(&self) -> Vec<u8> {
        let mut data = vec![0u8; 36];
        data[0] = self.device_type.peripheral_type();
        if self.device_type.is_removable() {
            data[1] = 0x80;
        }
        data[2] = if self.enable_scsi2 { 0x02 } else { 0x00 };
        data[3] = 0x02;
        // Additional length (n - 4)
        data[4] = 31;
        data[8..16].copy_from_slice(&self.identity.vendor);
        data[16..32].copy_from_slice(&self.identity.product);
        data[32..36].copy_from_slice(&self.identity.revision);
        data
    }

    fn start_stop_unit(&mut self, card: &SdCard, cdb: &[u8]) -> ScsiCmdResult {
        let start = cdb[4] & 0x01 != 0;
        let load_eject = cdb[4] & 0x02 != 0;

        if !start && (load_eject || self.settings.eject_on_stop) {
            if self.device_type == ScsiDeviceType::Fixed && !self.settings.eject_fixed_disk_enable
            {
                return self.check(SenseKey::IllegalRequest, ASC_INVALID_FIELD_IN_CDB);
            }
            self.eject_media(card);
            return ScsiCmdResult::Status(STATUS_GOOD);
        }

        if start && load_eject {
            // LOAD: mount the next (or staged) image and drop the pending
            // attention, the host asked for the change itself
            let next = if self.settings.reinsert_after_eject || self.next_image_override.is_some()
            {
                self.next_image_index()
            } else {
                self.image_index
            };
            return match self.mount_image(card, next) {
                Ok(()) => {
                    self.unit_attention = None;
                    ScsiCmdResult::Status(STATUS_GOOD)
                }
                Err(_) => self.check(SenseKey::NotReady, ASC_MEDIUM_NOT_PRESENT),
            };
        }

        // Plain spin up/down
        ScsiCmdResult::Status(STATUS_GOOD)
    }

    /// Force-marks the freshly mounted store read-only when fixed-disk
    /// rotation asks for it
    pub(crate) fn take_mount_read_only(&mut self) -> bool {
        std::mem::take(&mut self.mount_read_only)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::settings::SystemPreset;
    use tempfile::TempDir;

    pub(crate) fn disk_target(dir: &TempDir, size: usize) -> (SdCard, Target) {
        let card = SdCard::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("HD0.hda"), vec![0u8; size]).unwrap();

        let sys = SystemSettings::default();
        let settings = DeviceSettings {
            images: vec!["HD0.hda".into()],
            ..DeviceSettings::for_system(&sys, SystemPreset::None)
        };
        let target = Target::new(0, ScsiDeviceType::Fixed, &sys, settings, 0x1234_5678);
        (card, target)
    }

    #[test]
    fn inquiry_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (card, mut target) = disk_target(&dir, 512 * 16);

        let ScsiCmdResult::DataIn(data) =
            target.command(&card, &[0x12, 0, 0, 0, 36, 0])
        else {
            panic!("expected data");
        };
        assert_eq!(data.len(), 36);
        assert_eq!(data[0], 0x00);
        assert_eq!(data[1], 0x00);
        assert_eq!(data[2], 0x02);
        assert_eq!(data[4], 31);
        assert_eq!(&data[8..16], b"SLEET   ");
        assert_eq!(&data[16..32], b"HARDDRIVE       ");
        assert!(data[8..36].iter().all(|&c| (0x20..=0x7E).contains(&c)));
    }

    #[test]
    fn inquiry_respects_allocation_length() {
        let dir = tempfile::tempdir().unwrap();
        let (card, mut target) = disk_target(&dir, 512 * 16);

        let ScsiCmdResult::DataIn(data) = target.command(&card, &[0x12, 0, 0, 0, 8, 0]) else {
            panic!("expected data");
        };
        assert_eq!(data.len(), 8);
    }

    #[test]
    fn unit_attention_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let (card, mut target) = disk_target(&dir, 512 * 16);
        target.set_unit_attention(ASC_RESET_OCCURRED);

        // INQUIRY passes through
        assert!(matches!(
            target.command(&card, &[0x12, 0, 0, 0, 36, 0]),
            ScsiCmdResult::DataIn(_)
        ));

        // First eligible command reports it
        let r = target.command(&card, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_CHECK_CONDITION)));
        assert_eq!(target.sense.key, SenseKey::UnitAttention);

        // Second one is clean
        assert!(matches!(
            target.command(&card, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            ScsiCmdResult::DataIn(_)
        ));
    }

    #[test]
    fn request_sense_consumes_latched_sense() {
        let dir = tempfile::tempdir().unwrap();
        let (card, mut target) = disk_target(&dir, 512 * 16);

        // Unknown opcode latches ILLEGAL REQUEST
        let r = target.command(&card, &[0xF0, 0, 0, 0, 0, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_CHECK_CONDITION)));

        let ScsiCmdResult::DataIn(sense) = target.command(&card, &[0x03, 0, 0, 0, 18, 0])
        else {
            panic!("expected sense data");
        };
        assert_eq!(sense[2] & 0x0F, 0x05);
        assert_eq!(sense[12], 0x20);
        assert!(!target.sense.is_pending());
    }

    #[test]
    fn ejected_device_reports_not_ready_until_reinserted() {
        let dir = tempfile::tempdir().unwrap();
        let card = SdCard::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("zip.img"), vec![0u8; 512 * 8]).unwrap();

        let sys = SystemSettings::default();
        let settings = DeviceSettings {
            images: vec!["zip.img".into()],
            reinsert_on_inquiry: true,
            ..Default::default()
        };
        let mut target = Target::new(1, ScsiDeviceType::Zip100, &sys, settings, 0);

        // Eject via START STOP UNIT (LoEj + !Start)
        assert!(matches!(
            target.command(&card, &[0x1B, 0, 0, 0, 0x02, 0]),
            ScsiCmdResult::Status(STATUS_GOOD)
        ));
        assert!(target.ejected);

        // Reads fail NOT READY
        let r = target.command(&card, &[0x08, 0, 0, 0, 1, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_CHECK_CONDITION)));
        assert_eq!(target.sense.key, SenseKey::NotReady);

        // So do MODE SENSE and MODE SELECT
        let r = target.command(&card, &[0x1A, 0, 0x3F, 0, 255, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_CHECK_CONDITION)));
        assert_eq!(target.sense.key, SenseKey::NotReady);
        assert_eq!(target.sense.asc, ASC_MEDIUM_NOT_PRESENT);

        let r = target.command(&card, &[0x15, 0, 0, 0, 12, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_CHECK_CONDITION)));
        assert_eq!(target.sense.key, SenseKey::NotReady);

        // Host observes via TUR, then INQUIRY remounts
        let _ = target.command(&card, &[0x00, 0, 0, 0, 0, 0]);
        let _ = target.command(&card, &[0x12, 0, 0, 0, 36, 0]);
        assert!(!target.ejected);

        // Medium-changed attention surfaces once
        let r = target.command(&card, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(r, ScsiCmdResult::Status(STATUS_CHECK_CONDITION)));
        assert_eq!(target.sense.asc, ASC_MEDIUM_CHANGED);
    }
}
