//! Initiator engine scenarios against a simulated target drive

mod common;

use common::TargetSimPhy;

use sleet_core::scsi::initiator::{Initiator, InitiatorProgress};
use sleet_core::settings::SystemSettings;
use sleet_core::storage::sd::SdCard;

fn patterned_disk(sectors: u32, sector_size: usize) -> Vec<u8> {
    (0..sectors as usize * sector_size)
        .map(|i| (i % 253) as u8)
        .collect()
}

fn run_to_completion(initiator: &mut Initiator<TargetSimPhy>) -> InitiatorProgress {
    for _ in 0..100_000 {
        let progress = initiator.poll();
        if let InitiatorProgress::Finished { .. } = progress {
            return progress;
        }
    }
    panic!("initiator never finished");
}

// A full clone: the produced image file matches the emulated drive exactly
#[test]
fn clone_produces_identical_image() {
    let dir = tempfile::tempdir().unwrap();
    let card = SdCard::open(dir.path()).unwrap();

    let disk = patterned_disk(1000, 512);
    let phy = TargetSimPhy::new(3, disk.clone(), 512);

    let sys = SystemSettings::default();
    let mut initiator = Initiator::new(phy, card, sys);
    let progress = run_to_completion(&mut initiator);
    assert_eq!(
        progress,
        InitiatorProgress::Finished {
            target_id: 3,
            bad_sectors: 0
        }
    );

    let image = std::fs::read(dir.path().join("HD03_imaged.hda")).unwrap();
    assert_eq!(image.len(), 512_000);
    assert_eq!(image, disk);
}

// An unreadable sector is retried, then zero-filled and skipped; everything
// else still lands intact
#[test]
fn bad_sector_is_skipped_and_zero_filled() {
    let dir = tempfile::tempdir().unwrap();
    let card = SdCard::open(dir.path()).unwrap();

    let disk = patterned_disk(600, 512);
    let mut phy = TargetSimPhy::new(2, disk.clone(), 512);
    phy.bad_sectors.insert(257);

    let sys = SystemSettings::default();
    let mut initiator = Initiator::new(phy, card, sys);
    let progress = run_to_completion(&mut initiator);
    assert_eq!(
        progress,
        InitiatorProgress::Finished {
            target_id: 2,
            bad_sectors: 1
        }
    );

    let image = std::fs::read(dir.path().join("HD02_imaged.hda")).unwrap();
    assert_eq!(image.len(), disk.len());
    // The bad sector reads back as zeroes
    assert!(image[257 * 512..258 * 512].iter().all(|&b| b == 0));
    // Its neighbours carry the real data
    assert_eq!(&image[256 * 512..257 * 512], &disk[256 * 512..257 * 512]);
    assert_eq!(&image[258 * 512..259 * 512], &disk[258 * 512..259 * 512]);
}

// Collision policy: stop-if-exists leaves the existing file alone
#[test]
fn stop_if_exists_skips_drive() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("HD03_imaged.hda"), b"precious").unwrap();
    let card = SdCard::open(dir.path()).unwrap();

    let disk = patterned_disk(100, 512);
    let phy = TargetSimPhy::new(3, disk, 512);

    let sys = SystemSettings::default();
    let mut initiator = Initiator::new(phy, card, sys);
    for _ in 0..64 {
        let progress = initiator.poll();
        assert!(!matches!(progress, InitiatorProgress::Finished { .. }));
    }

    let kept = std::fs::read(dir.path().join("HD03_imaged.hda")).unwrap();
    assert_eq!(kept, b"precious");
}

// Collision policy: numbered copies get a fresh suffix
#[test]
fn numbered_copy_creates_suffixed_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("HD03_imaged.hda"), b"old").unwrap();
    let card = SdCard::open(dir.path()).unwrap();

    let disk = patterned_disk(100, 512);
    let phy = TargetSimPhy::new(3, disk.clone(), 512);

    let mut sys = SystemSettings::default();
    sys.initiator_image_handling =
        sleet_core::settings::InitiatorImageHandling::NewNumberedCopy;
    let mut initiator = Initiator::new(phy, card, sys);
    run_to_completion(&mut initiator);

    assert_eq!(
        std::fs::read(dir.path().join("HD03_imaged.hda")).unwrap(),
        b"old"
    );
    let copy = std::fs::read(dir.path().join("HD03_imaged-001.hda")).unwrap();
    assert_eq!(copy, disk);
}
