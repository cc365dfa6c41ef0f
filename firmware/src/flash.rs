//! Internal flash split into two banks, each an application slot plus a boot
//! record page at its top.
//!
//! The STM32G0B1KE has 512 KiB of dual-bank flash with 2 KiB pages. Slot A is
//! physical bank 1 and slot B physical bank 2. The `nSWAP_BANK` option bit
//! decides which bank the CPU sees at `0x0800_0000`; that bank runs and the
//! other one appears at `0x0804_0000`. Every flash offset below is in that
//! mapped view, so the running slot is always the lower window and updates
//! always land in the upper one. The reset vector check uses the lower
//! window for both slots.
//!
//! Option bytes take effect only when reloaded, so activation programs the
//! bit and the restart goes through `OBL_LAUNCH` instead of a plain reset.

use core::ptr;

use cortex_m::peripheral::SCB;
use embassy_stm32::Peri;
use embassy_stm32::flash::{Blocking, Flash};
use embassy_stm32::peripherals::FLASH;
use updater_core::image::{AddressRange, ImageCheck};
use updater_core::partition::nor::{BankSelect, FlashRegion, NorPartitionTable, PartitionLayout};
use updater_core::partition::{PartitionError, PartitionId};

const FLASH_BASE: u32 = 0x0800_0000;
const RAM_BASE: u32 = 0x2000_0000;
const RAM_LEN: u32 = 144 * 1024;

const BANK_LEN: u32 = 0x4_0000;
const RECORD_LEN: u32 = 0x800;
/// Usable length of each application slot.
pub const SLOT_LEN: u32 = BANK_LEN - RECORD_LEN;

pub const LAYOUT: PartitionLayout = PartitionLayout::new(
    FlashRegion::new(0, BANK_LEN),
    FlashRegion::new(BANK_LEN, BANK_LEN),
    RECORD_LEN,
);

pub const IMAGE_CHECK: ImageCheck = ImageCheck::new(
    AddressRange::new(RAM_BASE, RAM_BASE + RAM_LEN),
    AddressRange::new(FLASH_BASE, FLASH_BASE + SLOT_LEN),
);

pub type FirmwareFlash = Flash<'static, Blocking>;
pub type FirmwarePartitions = NorPartitionTable<FirmwareFlash, OptionBytes>;

/// FLASH register block (RM0444, section 3.7).
mod regs {
    const BASE: usize = 0x4002_2000;

    pub const KEYR: *mut u32 = (BASE + 0x08) as *mut u32;
    pub const OPTKEYR: *mut u32 = (BASE + 0x0C) as *mut u32;
    pub const SR: *mut u32 = (BASE + 0x10) as *mut u32;
    pub const CR: *mut u32 = (BASE + 0x14) as *mut u32;
    pub const OPTR: *mut u32 = (BASE + 0x20) as *mut u32;

    pub const KEY1: u32 = 0x4567_0123;
    pub const KEY2: u32 = 0xCDEF_89AB;
    pub const OPTKEY1: u32 = 0x0819_2A3B;
    pub const OPTKEY2: u32 = 0x4C5D_6E7F;

    pub const SR_BSY1: u32 = 1 << 16;
    /// OPTVERR, RDERR, FASTERR, MISERR, PGSERR, SIZERR, PGAERR, WRPERR, PROGERR, OPERR.
    pub const SR_ERRORS: u32 = 0x0000_C3FA;

    pub const CR_OPTSTRT: u32 = 1 << 17;
    pub const CR_OBL_LAUNCH: u32 = 1 << 27;
    pub const CR_OPTLOCK: u32 = 1 << 30;
    pub const CR_LOCK: u32 = 1 << 31;

    pub const OPTR_NSWAP_BANK: u32 = 1 << 20;
    pub const OPTR_DUAL_BANK: u32 = 1 << 21;
}

fn read(reg: *mut u32) -> u32 {
    // SAFETY: `reg` is one of the FLASH registers above, always mapped.
    unsafe { ptr::read_volatile(reg) }
}

fn write(reg: *mut u32, value: u32) {
    // SAFETY: as for `read`; nothing else touches FLASH while this runs.
    unsafe { ptr::write_volatile(reg, value) }
}

fn wait_idle() {
    while read(regs::SR) & regs::SR_BSY1 != 0 {}
}

fn unlock_options() -> Result<(), OptionError> {
    if read(regs::CR) & regs::CR_LOCK != 0 {
        write(regs::KEYR, regs::KEY1);
        write(regs::KEYR, regs::KEY2);
    }
    if read(regs::CR) & regs::CR_OPTLOCK != 0 {
        write(regs::OPTKEYR, regs::OPTKEY1);
        write(regs::OPTKEYR, regs::OPTKEY2);
    }
    if read(regs::CR) & (regs::CR_LOCK | regs::CR_OPTLOCK) != 0 {
        return Err(OptionError::Locked);
    }
    Ok(())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, defmt::Format)]
pub enum OptionError {
    /// The part is configured single-bank; there is nothing to swap.
    SingleBank,
    /// The option registers stayed locked after the key sequence.
    Locked,
    /// Option byte programming reported an error (raw `FLASH_SR` bits).
    Program(u32),
}

/// Bank mapping from the `nSWAP_BANK` option bit, latched at boot.
pub struct OptionBytes {
    running: PartitionId,
}

impl OptionBytes {
    pub fn latch() -> Self {
        let swapped = read(regs::OPTR) & regs::OPTR_NSWAP_BANK == 0;
        let running = if swapped {
            PartitionId::SlotB
        } else {
            PartitionId::SlotA
        };
        Self { running }
    }
}

impl BankSelect for OptionBytes {
    type Error = OptionError;

    fn running(&self) -> PartitionId {
        self.running
    }

    fn select(&mut self, slot: PartitionId) -> Result<(), OptionError> {
        let current = read(regs::OPTR);
        if current & regs::OPTR_DUAL_BANK == 0 {
            return Err(OptionError::SingleBank);
        }
        // nSWAP_BANK is active low: cleared maps bank 2 at the base.
        let wanted = match slot {
            PartitionId::SlotA => current | regs::OPTR_NSWAP_BANK,
            PartitionId::SlotB => current & !regs::OPTR_NSWAP_BANK,
        };
        if wanted == current {
            return Ok(());
        }

        unlock_options()?;
        wait_idle();
        write(regs::SR, regs::SR_ERRORS);
        write(regs::OPTR, wanted);
        write(regs::CR, read(regs::CR) | regs::CR_OPTSTRT);
        wait_idle();

        let errors = read(regs::SR) & regs::SR_ERRORS;
        if errors != 0 {
            defmt::error!("flash: option programming failed sr={=u32:#x}", errors);
            return Err(OptionError::Program(errors));
        }
        defmt::info!("flash: {} mapped at the base from next reset", defmt::Display2Format(&slot));
        Ok(())
    }
}

/// Reloads the option bytes, which resets the part into the selected bank.
pub fn reload_options_and_reset() -> ! {
    match unlock_options() {
        Ok(()) => write(regs::CR, read(regs::CR) | regs::CR_OBL_LAUNCH),
        Err(err) => defmt::warn!("flash: {}, plain reset keeps the old bank", err),
    }
    SCB::sys_reset()
}

/// Opens the partition table over the blocking flash driver.
pub fn partitions(flash: Peri<'static, FLASH>) -> Result<FirmwarePartitions, PartitionError> {
    let banks = OptionBytes::latch();
    defmt::info!("flash: running {}", defmt::Display2Format(&banks.running()));
    let table = NorPartitionTable::new(Flash::new_blocking(flash), banks, LAYOUT, Some(IMAGE_CHECK))?;
    match table.boot_record() {
        Some(record) => defmt::info!(
            "flash: boot record seq={} len={}",
            record.sequence,
            record.image_len
        ),
        None => defmt::info!("flash: no boot record for the running bank"),
    }
    Ok(table)
}
