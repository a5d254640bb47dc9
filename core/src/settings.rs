//! Typed SCSI system and device settings
//!
//! The core consumes already-parsed settings; loading them from an .ini (or
//! anything else) is the platform's job, which is why everything here
//! derives serde. Presets reproduce the behavior bundles known-good for
//! specific host machines.

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

/// Maximum number of supported SCSI IDs
pub const NUM_SCSI_IDS: usize = 8;
/// Maximum number of alternative images per target (IMG0..IMG9)
pub const IMAGE_INDEX_MAX: usize = 10;

/// Default block sizes
pub const DEFAULT_BLOCKSIZE: u32 = 512;
pub const DEFAULT_BLOCKSIZE_OPTICAL: u32 = 2048;

/// Prefetch buffer size in bytes
pub const PREFETCH_BUFFER_SIZE: u32 = 8192;

/// Zip disk media sizes in bytes
pub const ZIP100_DISK_SIZE: u64 = 100_663_296;
pub const ZIP250_DISK_SIZE: u64 = 250_640_384;

/// Watchdog: a stuck bus gets a reset, then a crash dump
pub const WATCHDOG_BUS_RESET_TIMEOUT_MS: u32 = 15000;
pub const WATCHDOG_CRASH_TIMEOUT_MS: u32 = 30000;
/// Selection timeout for initiator mode
pub const SELECTION_TIMEOUT_MS: u32 = 250;

/// Emulated device type of one target
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr, strum::EnumIter,
)]
pub enum ScsiDeviceType {
    Fixed,
    Removable,
    Optical,
    Floppy,
    MagnetoOptical,
    Sequential,
    Network,
    Zip100,
    Zip250,
    Jaz,
}

impl ScsiDeviceType {
    /// Peripheral device type byte for INQUIRY
    pub const fn peripheral_type(self) -> u8 {
        match self {
            Self::Fixed | Self::Removable | Self::Floppy | Self::Zip100 | Self::Zip250
            | Self::Jaz => 0x00,
            Self::Sequential => 0x01,
            Self::Network => 0x03,
            Self::Optical => 0x05,
            Self::MagnetoOptical => 0x07,
        }
    }

    /// Whether INQUIRY reports removable media
    pub const fn is_removable(self) -> bool {
        !matches!(self, Self::Fixed | Self::Network)
    }

    pub const fn default_block_size(self) -> u32 {
        match self {
            Self::Optical => DEFAULT_BLOCKSIZE_OPTICAL,
            _ => DEFAULT_BLOCKSIZE,
        }
    }

    /// Fixed media size for types that have one
    pub const fn fixed_media_size(self) -> Option<u64> {
        match self {
            Self::Zip100 => Some(ZIP100_DISK_SIZE),
            Self::Zip250 => Some(ZIP250_DISK_SIZE),
            _ => None,
        }
    }
}

/// Host compatibility quirk modes
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, IntoStaticStr,
)]
pub enum ScsiQuirks {
    #[default]
    None,
    Apple,
    Omti,
    X68000,
}

/// System-wide behavior presets for known host machines
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, IntoStaticStr,
)]
pub enum SystemPreset {
    #[default]
    None,
    Mac,
    MacPlus,
    Mpc3000,
    MegaSte,
    X68000,
    Dos,
}

/// Per-device presets reproducing specific drive models
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, IntoStaticStr,
)]
pub enum DevicePreset {
    #[default]
    None,
    St32430n,
}

/// MCU clocking profile. Interpreted by the platform layer; the core only
/// carries the selection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, IntoStaticStr,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum SpeedGrade {
    #[default]
    Default,
    TurboMax,
    Custom,
    #[strum(serialize = "AudioSPDIF")]
    AudioSpdif,
    #[strum(serialize = "AudioI2S")]
    AudioI2s,
    A,
    B,
    C,
    #[strum(serialize = "WifiRM2")]
    WifiRm2,
}

/// What the initiator does when its destination image file already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InitiatorImageHandling {
    #[default]
    StopIfExists,
    NewNumberedCopy,
    Overwrite,
}

/// Settings that apply to the whole bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    pub quirks: ScsiQuirks,
    /// Selection response delay in ms; 255 selects the default
    pub selection_delay: u8,
    /// Synchronous transfer cap in MB/s; 0 disables sync mode
    pub max_sync_speed: u32,
    pub init_pre_delay_ms: u32,
    pub init_post_delay_ms: u32,
    pub enable_scsi2: bool,
    /// PHY hint: latch glitchy SEL assertions (needed by the Mac Plus)
    pub enable_sel_latch: bool,
    pub map_luns_to_ids: bool,
    pub enable_parity: bool,
    pub use_fat_alloc_size: bool,
    /// Bus width exponent: 0 = 8 bit, 1 = 16 bit
    pub max_bus_width: u8,
    pub speed_grade: SpeedGrade,

    pub initiator_id: u8,
    pub initiator_max_retry: u8,
    pub initiator_image_handling: InitiatorImageHandling,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            quirks: ScsiQuirks::None,
            selection_delay: 255,
            max_sync_speed: 10,
            init_pre_delay_ms: 0,
            init_post_delay_ms: 0,
            enable_scsi2: true,
            enable_sel_latch: false,
            map_luns_to_ids: false,
            enable_parity: true,
            use_fat_alloc_size: false,
            max_bus_width: 0,
            speed_grade: SpeedGrade::Default,
            initiator_id: 7,
            initiator_max_retry: 5,
            initiator_image_handling: InitiatorImageHandling::StopIfExists,
        }
    }
}

impl SystemSettings {
    /// Default settings with a host preset applied
    pub fn for_preset(preset: SystemPreset) -> Self {
        let mut sys = Self::default();
        match preset {
            SystemPreset::None => (),
            SystemPreset::Mac => {
                sys.quirks = ScsiQuirks::Apple;
            }
            SystemPreset::MacPlus => {
                sys.quirks = ScsiQuirks::Apple;
                sys.enable_sel_latch = true;
                sys.enable_scsi2 = false;
                sys.selection_delay = 0;
            }
            SystemPreset::Mpc3000 => {
                sys.init_pre_delay_ms = 700;
            }
            SystemPreset::MegaSte => {
                sys.map_luns_to_ids = true;
                sys.enable_parity = false;
            }
            SystemPreset::X68000 => {
                sys.quirks = ScsiQuirks::X68000;
                sys.enable_scsi2 = false;
                sys.selection_delay = 0;
                sys.max_sync_speed = 5;
            }
            SystemPreset::Dos => (),
        }
        sys
    }
}

/// Per-target settings. Shared defaults come from the system-level entry;
/// per-device keys override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub device_type: Option<ScsiDeviceType>,
    /// Block size override; `None` selects the type default
    pub block_size: Option<u32>,
    pub sectors_per_track: u32,
    pub heads_per_cylinder: u32,
    pub prefetch_bytes: u32,

    /// Which physical eject buttons affect this target (bitmask)
    pub eject_button: u8,
    pub eject_fixed_disk_enable: bool,
    pub eject_fixed_disk_read_only: bool,
    pub eject_fixed_disk_delay_s: u32,
    pub reinsert_on_inquiry: bool,
    pub reinsert_after_eject: bool,
    pub reinsert_immediately: bool,
    pub eject_on_stop: bool,
    pub keep_current_image_on_bus_reset: bool,

    pub right_align_strings: bool,
    pub disable_mac_sanity_check: bool,

    /// Inquiry identity overrides; empty string keeps the type default
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub serial: String,

    /// Raw sector range for RAW: style mappings set by device presets
    pub sector_sd_begin: u32,
    pub sector_sd_end: u32,

    /// Tape capacity cap in MiB; 0 = unlimited
    pub tape_length_mb: u32,

    pub use_fat_alloc_size: bool,

    pub cow_bitmap_size: u32,
    pub cow_buffer_size: u32,
    pub persist_cow: bool,

    /// Alternative images for rotation (IMG0..IMG9)
    pub images: Vec<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_type: None,
            block_size: None,
            sectors_per_track: 63,
            heads_per_cylinder: 255,
            prefetch_bytes: PREFETCH_BUFFER_SIZE,
            eject_button: 0,
            eject_fixed_disk_enable: false,
            eject_fixed_disk_read_only: false,
            eject_fixed_disk_delay_s: 0,
            reinsert_on_inquiry: true,
            reinsert_after_eject: true,
            reinsert_immediately: false,
            eject_on_stop: false,
            keep_current_image_on_bus_reset: false,
            right_align_strings: false,
            disable_mac_sanity_check: false,
            vendor: String::new(),
            product: String::new(),
            revision: String::new(),
            serial: String::new(),
            sector_sd_begin: 0,
            sector_sd_end: 0,
            tape_length_mb: 0,
            use_fat_alloc_size: false,
            cow_bitmap_size: crate::storage::cow::DEFAULT_COW_BITMAP_SIZE,
            cow_buffer_size: crate::storage::cow::DEFAULT_COW_BUFFER_SIZE,
            persist_cow: false,
            images: Vec::new(),
        }
    }
}

impl DeviceSettings {
    /// Shared per-device defaults derived from the system settings and
    /// preset
    pub fn for_system(sys: &SystemSettings, preset: SystemPreset) -> Self {
        let mut dev = Self {
            use_fat_alloc_size: sys.use_fat_alloc_size,
            ..Self::default()
        };
        if preset == SystemPreset::Dos {
            dev.reinsert_immediately = true;
            dev.keep_current_image_on_bus_reset = true;
        }
        dev
    }

    /// Applies a device preset on top of the current settings
    pub fn apply_device_preset(&mut self, preset: DevicePreset) {
        match preset {
            DevicePreset::None => (),
            DevicePreset::St32430n => {
                self.device_type = Some(ScsiDeviceType::Fixed);
                self.sector_sd_begin = 0;
                // 2147 MB in 512-byte sectors
                self.sector_sd_end = 4_397_055;
                if self.vendor.is_empty() {
                    self.vendor = "SEAGATE".into();
                }
                if self.product.is_empty() {
                    self.product = "ST32430N".into();
                }
            }
        }
    }

    pub fn block_size_for(&self, device_type: ScsiDeviceType) -> u32 {
        self.block_size
            .unwrap_or_else(|| device_type.default_block_size())
    }
}

/// Default inquiry identity per device type: {vendor, product, revision,
/// serial}. Empty serial falls back to the SD card serial number.
type DriveInfo = [&'static str; 4];

pub const FIRMWARE_REVISION: &str = "1.0";

const DRIVEINFO_FIXED: DriveInfo = ["SLEET", "HARDDRIVE", FIRMWARE_REVISION, ""];
const DRIVEINFO_REMOVABLE: DriveInfo = ["SLEET", "REMOVABLE", FIRMWARE_REVISION, ""];
const DRIVEINFO_OPTICAL: DriveInfo = ["SLEET", "CDROM", FIRMWARE_REVISION, ""];
const DRIVEINFO_FLOPPY: DriveInfo = ["SLEET", "FLOPPY", FIRMWARE_REVISION, ""];
const DRIVEINFO_MAGOPT: DriveInfo = ["SLEET", "MO_DRIVE", FIRMWARE_REVISION, ""];
const DRIVEINFO_NETWORK: DriveInfo = ["Dayna", "SCSI/Link", "2.0f", ""];
const DRIVEINFO_TAPE: DriveInfo = ["SLEET", "TAPE", FIRMWARE_REVISION, ""];

// Drive identities recognized by Apple machines
const APPLE_DRIVEINFO_FIXED: DriveInfo = ["DEC", "SLEET HDD", FIRMWARE_REVISION, "1.0"];
const APPLE_DRIVEINFO_REMOVABLE: DriveInfo = ["IOMEGA", "BETA230", FIRMWARE_REVISION, "2.02"];
const APPLE_DRIVEINFO_OPTICAL: DriveInfo =
    ["MATSHITA", "CD-ROM CR-8004", FIRMWARE_REVISION, "1.1f"];
const APPLE_DRIVEINFO_FLOPPY: DriveInfo = ["IOMEGA", "Io20S         *F", "PP33", ""];
const APPLE_DRIVEINFO_MAGOPT: DriveInfo = ["MOST", "RMD-5200", FIRMWARE_REVISION, "1.0"];
const APPLE_DRIVEINFO_TAPE: DriveInfo = ["SLEET", "APPLE_TAPE", FIRMWARE_REVISION, ""];

const IOMEGA_DRIVEINFO_ZIP100: DriveInfo = ["IOMEGA", "ZIP 100", "D.13", ""];
const IOMEGA_DRIVEINFO_ZIP250: DriveInfo = ["IOMEGA", "ZIP 250", "42.S", ""];
const IOMEGA_DRIVEINFO_JAZ: DriveInfo = ["iomega", "jaz", "", ""];

fn default_drive_info(device_type: ScsiDeviceType, quirks: ScsiQuirks) -> DriveInfo {
    let apple = quirks == ScsiQuirks::Apple;
    match device_type {
        ScsiDeviceType::Fixed => {
            if apple {
                APPLE_DRIVEINFO_FIXED
            } else {
                DRIVEINFO_FIXED
            }
        }
        ScsiDeviceType::Removable => {
            if apple {
                APPLE_DRIVEINFO_REMOVABLE
            } else {
                DRIVEINFO_REMOVABLE
            }
        }
        ScsiDeviceType::Optical => {
            if apple {
                APPLE_DRIVEINFO_OPTICAL
            } else {
                DRIVEINFO_OPTICAL
            }
        }
        ScsiDeviceType::Floppy => {
            if apple {
                APPLE_DRIVEINFO_FLOPPY
            } else {
                DRIVEINFO_FLOPPY
            }
        }
        ScsiDeviceType::MagnetoOptical => {
            if apple {
                APPLE_DRIVEINFO_MAGOPT
            } else {
                DRIVEINFO_MAGOPT
            }
        }
        ScsiDeviceType::Sequential => {
            if apple {
                APPLE_DRIVEINFO_TAPE
            } else {
                DRIVEINFO_TAPE
            }
        }
        ScsiDeviceType::Network => DRIVEINFO_NETWORK,
        ScsiDeviceType::Zip100 => IOMEGA_DRIVEINFO_ZIP100,
        ScsiDeviceType::Zip250 => IOMEGA_DRIVEINFO_ZIP250,
        ScsiDeviceType::Jaz => IOMEGA_DRIVEINFO_JAZ,
    }
}

/// Formatted inquiry identity of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveIdentity {
    pub vendor: [u8; 8],
    pub product: [u8; 16],
    pub revision: [u8; 4],
    pub serial: [u8; 16],
}

/// Formats one inquiry field per the SCSI spec: empty bytes filled with
/// space, only printable ASCII, left-aligned unless `align_right`.
pub fn format_drive_info_field(src: &str, out: &mut [u8], align_right: bool) {
    let clean: Vec<u8> = src
        .bytes()
        .take(out.len())
        .map(|c| if (0x20..=0x7E).contains(&c) { c } else { 0x20 })
        .collect();

    out.fill(0x20);
    if align_right {
        // Right align, trimming spaces on either side
        if let Some(start) = clean.iter().position(|&c| c != 0x20) {
            let end = clean.iter().rposition(|&c| c != 0x20).unwrap() + 1;
            let trimmed = &clean[start..end];
            let out_len = out.len();
            out[out_len - trimmed.len()..].copy_from_slice(trimmed);
        }
    } else {
        // Left align, preserving embedded spaces in case the config tries to
        // right-align manually
        out[..clean.len()].copy_from_slice(&clean);
    }
}

impl DriveIdentity {
    /// Builds the formatted identity from settings, quirk defaults and the
    /// SD card serial
    pub fn build(
        settings: &DeviceSettings,
        device_type: ScsiDeviceType,
        quirks: ScsiQuirks,
        sd_serial: u32,
    ) -> Self {
        let defaults = default_drive_info(device_type, quirks);
        let vendor = or_default(&settings.vendor, defaults[0]);
        let product = or_default(&settings.product, defaults[1]);
        let revision = or_default(&settings.revision, defaults[2]);
        let serial = if settings.serial.is_empty() && defaults[3].is_empty() {
            // SD card serial number as 8 hex chars
            hex::encode_upper(sd_serial.to_be_bytes())
        } else {
            or_default(&settings.serial, defaults[3]).to_string()
        };

        let mut id = Self {
            vendor: [0x20; 8],
            product: [0x20; 16],
            revision: [0x20; 4],
            serial: [0x20; 16],
        };
        format_drive_info_field(vendor, &mut id.vendor, settings.right_align_strings);
        format_drive_info_field(product, &mut id.product, settings.right_align_strings);
        format_drive_info_field(revision, &mut id.revision, settings.right_align_strings);
        format_drive_info_field(&serial, &mut id.serial, true);
        id
    }
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}
