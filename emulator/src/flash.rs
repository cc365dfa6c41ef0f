//! File-backed dual-bank NOR flash with the board's partition layout.
//!
//! The flash file holds both physical banks in order. A sidecar option file
//! plays the part of the bank swap option bit: the value in it is latched
//! when the partitions are opened (a reset) and decides which bank appears
//! at the flash base. Activations program the option file for the next
//! emulated power cycle, never the current one.

use std::convert::Infallible;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};
use updater_core::image::{AddressRange, ImageCheck};
use updater_core::partition::nor::{BankSelect, FlashRegion, NorPartitionTable, PartitionLayout};
use updater_core::partition::{PartitionError, PartitionId};

pub const BANK_LEN: u32 = 0x4_0000;
pub const RECORD_LEN: u32 = 0x800;
pub const SLOT_LEN: u32 = BANK_LEN - RECORD_LEN;
pub const FLASH_CAPACITY: usize = 2 * BANK_LEN as usize;

pub const LAYOUT: PartitionLayout = PartitionLayout::new(
    FlashRegion::new(0, BANK_LEN),
    FlashRegion::new(BANK_LEN, BANK_LEN),
    RECORD_LEN,
);

pub const STACK_TOP: u32 = 0x2002_4000;
pub const EXEC_BASE: u32 = 0x0800_0000;

pub const IMAGE_CHECK: ImageCheck = ImageCheck::new(
    AddressRange::new(0x2000_0000, STACK_TOP),
    AddressRange::new(EXEC_BASE, EXEC_BASE + SLOT_LEN),
);

const ERASE_ALIGN: u32 = 2048;
const WRITE_ALIGN: u32 = 8;

pub type HostPartitions = NorPartitionTable<FileFlash, HostOptionBytes>;

pub struct FileFlash {
    bytes: Vec<u8>,
    swapped: bool,
    path: PathBuf,
}

impl FileFlash {
    /// Loads the flash image, starting erased when the file does not exist.
    /// With `swapped` set the second bank is mapped at offset zero.
    pub fn open(path: impl Into<PathBuf>, swapped: bool) -> io::Result<Self> {
        let path = path.into();
        let mut bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        bytes.resize(FLASH_CAPACITY, 0xFF);
        Ok(Self {
            bytes,
            swapped,
            path,
        })
    }

    /// Bytes of one physical bank, independent of the mapping.
    #[cfg(test)]
    pub fn physical_bank(&self, index: usize) -> &[u8] {
        let bank = BANK_LEN as usize;
        &self.bytes[index * bank..(index + 1) * bank]
    }

    /// Writes the image back to disk.
    pub fn persist(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, &self.bytes)
    }

    /// Physical range behind an addressed range; it may not straddle banks.
    fn range(&self, offset: u32, len: usize) -> Result<Range<usize>, NorFlashErrorKind> {
        let bank = BANK_LEN as usize;
        let start = usize::try_from(offset).map_err(|_| NorFlashErrorKind::OutOfBounds)?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(NorFlashErrorKind::OutOfBounds)?;
        if !self.swapped {
            return Ok(start..end);
        }
        if end <= bank {
            Ok(start + bank..end + bank)
        } else if start >= bank {
            Ok(start - bank..end - bank)
        } else {
            Err(NorFlashErrorKind::OutOfBounds)
        }
    }
}

impl ErrorType for FileFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for FileFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }
}

impl NorFlash for FileFlash {
    const WRITE_SIZE: usize = WRITE_ALIGN as usize;
    const ERASE_SIZE: usize = ERASE_ALIGN as usize;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % ERASE_ALIGN != 0 || to % ERASE_ALIGN != 0 || from > to {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let len = usize::try_from(to - from).map_err(|_| NorFlashErrorKind::OutOfBounds)?;
        let range = self.range(from, len)?;
        self.bytes[range].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset % WRITE_ALIGN != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = self.range(offset, bytes.len())?;
        // Programming only clears bits, like the real part.
        for (cell, byte) in self.bytes[range].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

/// Emulated bank swap option, stored as the slot label.
pub struct HostOptionBytes {
    path: PathBuf,
    running: PartitionId,
    programmed: PartitionId,
}

impl HostOptionBytes {
    /// Latches the stored selection; a missing file maps slot A at the base.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let running = match fs::read_to_string(&path) {
            Ok(text) if text.trim() == PartitionId::SlotB.label() => PartitionId::SlotB,
            Ok(_) => PartitionId::SlotA,
            Err(err) if err.kind() == io::ErrorKind::NotFound => PartitionId::SlotA,
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            running,
            programmed: running,
        })
    }

    pub fn persist(&self) -> io::Result<()> {
        fs::write(&self.path, format!("{}\n", self.programmed))
    }
}

impl BankSelect for HostOptionBytes {
    type Error = Infallible;

    fn running(&self) -> PartitionId {
        self.running
    }

    fn select(&mut self, slot: PartitionId) -> Result<(), Infallible> {
        self.programmed = slot;
        Ok(())
    }
}

fn option_path(flash_path: &Path) -> PathBuf {
    flash_path.with_extension("opt")
}

/// Opens the partition table over the flash file, as the device does at reset.
pub fn open_partitions(path: &Path) -> io::Result<Result<HostPartitions, PartitionError>> {
    let options = HostOptionBytes::open(option_path(path))?;
    let flash = FileFlash::open(path, options.running() == PartitionId::SlotB)?;
    Ok(NorPartitionTable::new(flash, options, LAYOUT, Some(IMAGE_CHECK)))
}

/// Writes flash contents and the programmed bank selection back to disk.
pub fn persist_partitions(partitions: HostPartitions) -> io::Result<()> {
    let (flash, options) = partitions.into_parts();
    flash.persist()?;
    options.persist()
}

/// Synthesises an image whose vector table passes [`IMAGE_CHECK`].
pub fn demo_image(len: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len)
        .map(|index| u8::try_from(index % 251).unwrap_or_default())
        .collect();
    if image.len() >= 8 {
        image[..4].copy_from_slice(&STACK_TOP.to_le_bytes());
        image[4..8].copy_from_slice(&(EXEC_BASE + 0x101).to_le_bytes());
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::scratch_dir;
    use updater_core::partition::PartitionTable;

    fn update_and_activate(path: &Path, image: &[u8]) -> PartitionId {
        let mut table = open_partitions(path).expect("io").expect("layout");
        let target = table.next_update_partition().expect("target");
        let mut handle = table.begin(target).expect("begin");
        table.write(&mut handle, image).expect("write");
        table.end(handle).expect("finalize");
        table.set_boot_partition(target).expect("activate");
        persist_partitions(table).expect("persist");
        target
    }

    #[test]
    fn activation_survives_a_reload_from_disk() {
        let path = scratch_dir("flash").join("flash.bin");

        update_and_activate(&path, &demo_image(3_000));

        let reloaded = open_partitions(&path).expect("io").expect("layout");
        assert_eq!(reloaded.active(), PartitionId::SlotB);
        assert_eq!(reloaded.boot_record().map(|record| record.image_len), Some(3_000));
    }

    #[test]
    fn updates_never_touch_the_bank_at_the_flash_base() {
        let path = scratch_dir("banks").join("flash.bin");
        let mut seeded = vec![0xFF; FLASH_CAPACITY];
        seeded[..BANK_LEN as usize].fill(0x5A);
        fs::write(&path, &seeded).expect("seed flash");

        for boot in 0..3 {
            let running = open_partitions(&path).expect("io").expect("layout").active();
            let bank = usize::from(running.to_raw());
            let before = FileFlash::open(&path, false).expect("open").physical_bank(bank).to_vec();

            let image = demo_image(2_000 + boot);
            let target = update_and_activate(&path, &image);

            let after = FileFlash::open(&path, false).expect("open");
            assert_ne!(target, running, "boot {boot}");
            assert_eq!(after.physical_bank(bank), before.as_slice(), "boot {boot}");
            let written = after.physical_bank(usize::from(target.to_raw()));
            assert_eq!(&written[..image.len()], image.as_slice());

            let rebooted = open_partitions(&path).expect("io").expect("layout");
            assert_eq!(rebooted.active(), target, "boot {boot}");
        }
    }

    #[test]
    fn demo_image_passes_the_vector_check() {
        assert_eq!(IMAGE_CHECK.check(&demo_image(64)), Ok(()));
    }

    #[test]
    fn writes_only_clear_bits() {
        let mut flash = FileFlash::open(scratch_dir("bits").join("flash.bin"), false).expect("open");
        flash.write(0, &[0xF0; 8]).expect("first");
        flash.write(0, &[0x0F; 8]).expect("second");

        let mut readback = [0xAA; 8];
        flash.read(0, &mut readback).expect("read");
        assert_eq!(readback, [0x00; 8]);
    }

    #[test]
    fn swapped_mapping_reads_the_second_bank_first() {
        let path = scratch_dir("swap").join("flash.bin");
        let mut seeded = vec![0x11; FLASH_CAPACITY];
        seeded[BANK_LEN as usize..].fill(0x22);
        fs::write(&path, &seeded).expect("seed flash");

        let mut flash = FileFlash::open(&path, true).expect("open");
        let mut base = [0u8; 4];
        flash.read(0, &mut base).expect("read");
        assert_eq!(base, [0x22; 4]);
        assert!(flash.read(BANK_LEN - 2, &mut base).is_err(), "reads stay in one bank");
    }
}
