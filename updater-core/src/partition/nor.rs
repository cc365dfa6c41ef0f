//! A/B partition table on top of any `embedded-storage` NOR flash.
//!
//! The flash is split into two equally sized banks. The hardware maps one of
//! them at the flash base; that bank holds the running image and is never
//! erased or programmed. Flash offsets are always taken in that mapped view,
//! so the running slot lives in the lower window and the update target in the
//! upper one, whichever physical bank each slot occupies.
//!
//! The top of every bank is reserved for that bank's [`BootRecord`]. Switching
//! slots writes the record into the upper bank and then asks the [`BankSelect`]
//! to map it at the base from the next reset. The record is informational; the
//! bank mapping alone decides what runs.

use embedded_storage::nor_flash::NorFlash;

use super::{
    ActivationError, FinalizeError, PartitionError, PartitionId, PartitionTable, WriteError,
};
use crate::image::{ImageCheck, ImageCheckError, VECTOR_HEADER_LEN};

/// Largest flash write granule supported by the buffered writer.
pub const MAX_WRITE_GRANULE: usize = 32;

/// Size of the encoded boot record, padded to the largest granule.
pub const BOOT_RECORD_LEN: usize = MAX_WRITE_GRANULE;

/// Marker identifying a valid boot record (`"OTA1"`).
pub const BOOT_RECORD_MAGIC: u32 = 0x4F54_4131;

/// Contiguous byte range in flash, relative to the flash base.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FlashRegion {
    pub offset: u32,
    pub len: u32,
}

impl FlashRegion {
    pub const fn new(offset: u32, len: u32) -> Self {
        Self { offset, len }
    }

    pub const fn end(&self) -> u32 {
        self.offset + self.len
    }

    const fn overlaps(&self, other: &FlashRegion) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    const fn is_aligned(&self, erase_size: u32) -> bool {
        self.len > 0 && self.offset % erase_size == 0 && self.len % erase_size == 0
    }
}

/// Which bank of the mapped view a region belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BankWindow {
    /// Mapped at the flash base; holds the running image.
    Lower,
    /// Mapped above it; the only bank ever written.
    Upper,
}

/// Placement of the two banks as the CPU addresses them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PartitionLayout {
    pub lower: FlashRegion,
    pub upper: FlashRegion,
    /// Bytes at the top of each bank holding that bank's boot record.
    pub record_len: u32,
}

impl PartitionLayout {
    pub const fn new(lower: FlashRegion, upper: FlashRegion, record_len: u32) -> Self {
        Self {
            lower,
            upper,
            record_len,
        }
    }

    const fn bank(&self, window: BankWindow) -> FlashRegion {
        match window {
            BankWindow::Lower => self.lower,
            BankWindow::Upper => self.upper,
        }
    }

    /// Image area of a bank, below its record page.
    #[must_use]
    pub const fn image(&self, window: BankWindow) -> FlashRegion {
        let bank = self.bank(window);
        FlashRegion::new(bank.offset, bank.len - self.record_len)
    }

    /// Record page at the top of a bank.
    #[must_use]
    pub const fn record(&self, window: BankWindow) -> FlashRegion {
        let bank = self.bank(window);
        FlashRegion::new(bank.end() - self.record_len, self.record_len)
    }

    fn validate(&self, erase_size: u32, capacity: usize) -> Result<(), PartitionError> {
        for bank in [self.lower, self.upper] {
            let fits = usize::try_from(bank.end()).is_ok_and(|end| end <= capacity);
            if !bank.is_aligned(erase_size) || !fits {
                return Err(PartitionError::Layout);
            }
        }
        if self.lower.len != self.upper.len || self.lower.overlaps(&self.upper) {
            return Err(PartitionError::Layout);
        }
        let record_fits = usize::try_from(self.record_len).is_ok_and(|len| len >= BOOT_RECORD_LEN);
        if !record_fits || self.record_len % erase_size != 0 || self.record_len >= self.lower.len
        {
            return Err(PartitionError::Layout);
        }
        Ok(())
    }
}

/// Hardware selection of the bank mapped at the flash base.
///
/// On parts with a bank swap option this reads and programs the option
/// bytes; the running slot must come from there, never from flash contents.
pub trait BankSelect {
    type Error;

    /// Slot mapped at the flash base for the current boot.
    fn running(&self) -> PartitionId;

    /// Maps `slot` at the flash base from the next reset on.
    fn select(&mut self, slot: PartitionId) -> Result<(), Self::Error>;
}

/// Persistent boot selection stored in each bank's record page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootRecord {
    /// Incremented on every activation.
    pub sequence: u32,
    pub slot: PartitionId,
    pub image_len: u32,
}

impl BootRecord {
    /// Serializes the record, padding with the erased value.
    #[must_use]
    pub fn encode(&self) -> [u8; BOOT_RECORD_LEN] {
        let slot = u32::from(self.slot.to_raw());
        let mut bytes = [0xFF; BOOT_RECORD_LEN];
        bytes[0..4].copy_from_slice(&BOOT_RECORD_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[8..12].copy_from_slice(&slot.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.image_len.to_le_bytes());
        let check = Self::check_word(self.sequence, slot, self.image_len);
        bytes[16..20].copy_from_slice(&check.to_le_bytes());
        bytes
    }

    /// Parses a record, returning `None` for erased or damaged pages.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let word = |index: usize| -> Option<u32> {
            let raw = bytes.get(index * 4..index * 4 + 4)?;
            Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        };

        if word(0)? != BOOT_RECORD_MAGIC {
            return None;
        }
        let (sequence, slot, image_len) = (word(1)?, word(2)?, word(3)?);
        if word(4)? != Self::check_word(sequence, slot, image_len) {
            return None;
        }
        Some(Self {
            sequence,
            slot: PartitionId::from_raw(u8::try_from(slot).ok()?)?,
            image_len,
        })
    }

    const fn check_word(sequence: u32, slot: u32, image_len: u32) -> u32 {
        !(sequence ^ slot.rotate_left(16) ^ image_len)
    }
}

/// Open write cursor into the upper bank.
#[derive(Debug)]
pub struct NorWriteHandle {
    partition: PartitionId,
    region: FlashRegion,
    /// Bytes already programmed into flash.
    flushed: u32,
    tail: [u8; MAX_WRITE_GRANULE],
    tail_len: usize,
}

impl NorWriteHandle {
    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Total bytes accepted so far, including the unflushed tail.
    pub const fn bytes_accepted(&self) -> u32 {
        self.flushed + self.tail_len as u32
    }
}

/// [`PartitionTable`] backed by a NOR flash device and a bank mapping.
pub struct NorPartitionTable<F, B>
where
    F: NorFlash,
    B: BankSelect,
{
    flash: F,
    banks: B,
    layout: PartitionLayout,
    image_check: Option<ImageCheck>,
    running: PartitionId,
    record: Option<BootRecord>,
    pending: Option<BootRecord>,
    writing: bool,
    finalized: Option<(PartitionId, u32)>,
}

impl<F, B> NorPartitionTable<F, B>
where
    F: NorFlash,
    B: BankSelect,
{
    /// Validates `layout` against the flash geometry and loads the running
    /// bank's boot record.
    pub fn new(
        mut flash: F,
        banks: B,
        layout: PartitionLayout,
        image_check: Option<ImageCheck>,
    ) -> Result<Self, PartitionError> {
        let granule_fits = |size: usize| size > 0 && MAX_WRITE_GRANULE % size == 0;
        if !granule_fits(F::WRITE_SIZE) || !granule_fits(F::READ_SIZE) {
            return Err(PartitionError::Layout);
        }
        let erase_size = u32::try_from(F::ERASE_SIZE).map_err(|_| PartitionError::Layout)?;
        layout.validate(erase_size, flash.capacity())?;

        let mut raw = [0u8; BOOT_RECORD_LEN];
        flash
            .read(layout.record(BankWindow::Lower).offset, &mut raw)
            .map_err(|_| PartitionError::Flash)?;

        let running = banks.running();
        // A record naming the other slot was copied in from elsewhere.
        let record = BootRecord::decode(&raw).filter(|record| record.slot == running);

        Ok(Self {
            flash,
            banks,
            layout,
            image_check,
            running,
            record,
            pending: None,
            writing: false,
            finalized: None,
        })
    }

    pub const fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// Returns the running bank's boot record, if it carries one.
    pub const fn boot_record(&self) -> Option<BootRecord> {
        self.record
    }

    /// Returns the record written by an activation during this boot.
    pub const fn pending_record(&self) -> Option<BootRecord> {
        self.pending
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_parts(self) -> (F, B) {
        (self.flash, self.banks)
    }

    fn window(&self, partition: PartitionId) -> BankWindow {
        if partition == self.running {
            BankWindow::Lower
        } else {
            BankWindow::Upper
        }
    }

    /// Copies bytes out of a slot's image area.
    pub fn read_slot(
        &mut self,
        partition: PartitionId,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), PartitionError> {
        let region = self.layout.image(self.window(partition));
        let len = u32::try_from(buf.len()).map_err(|_| PartitionError::Layout)?;
        if offset.checked_add(len).is_none_or(|end| end > region.len) {
            return Err(PartitionError::Layout);
        }
        self.flash
            .read(region.offset + offset, buf)
            .map_err(|_| PartitionError::Flash)
    }

    fn flush_tail(&mut self, handle: &mut NorWriteHandle) -> Result<(), F::Error> {
        let granule = F::WRITE_SIZE;
        let padded = handle.tail_len.div_ceil(granule) * granule;
        handle.tail[handle.tail_len..padded].fill(0xFF);
        self.flash
            .write(handle.region.offset + handle.flushed, &handle.tail[..padded])?;
        // tail_len never exceeds MAX_WRITE_GRANULE, the cast is lossless.
        handle.flushed += handle.tail_len as u32;
        handle.tail_len = 0;
        Ok(())
    }

    fn verify_header(&mut self, handle: &NorWriteHandle) -> Result<(), FinalizeError> {
        let Some(check) = self.image_check else {
            return Ok(());
        };
        if (handle.flushed as usize) < VECTOR_HEADER_LEN {
            return Err(FinalizeError::InvalidImage(ImageCheckError::Truncated));
        }
        let mut header = [0u8; MAX_WRITE_GRANULE];
        self.flash
            .read(handle.region.offset, &mut header)
            .map_err(|_| FinalizeError::Flash)?;
        check
            .check(&header[..VECTOR_HEADER_LEN])
            .map_err(FinalizeError::InvalidImage)
    }
}

impl<F, B> PartitionTable for NorPartitionTable<F, B>
where
    F: NorFlash,
    B: BankSelect,
{
    type Handle = NorWriteHandle;

    fn active(&self) -> PartitionId {
        self.running
    }

    fn next_update_partition(&self) -> Option<PartitionId> {
        Some(self.running.other())
    }

    fn begin(&mut self, partition: PartitionId) -> Result<NorWriteHandle, PartitionError> {
        if self.writing {
            return Err(PartitionError::Busy);
        }
        if partition == self.running {
            return Err(PartitionError::ActivePartition);
        }

        // The stale record goes with the old image.
        let bank = self.layout.upper;
        self.finalized = None;
        self.pending = None;
        self.flash
            .erase(bank.offset, bank.end())
            .map_err(|_| PartitionError::Flash)?;
        self.writing = true;

        Ok(NorWriteHandle {
            partition,
            region: self.layout.image(BankWindow::Upper),
            flushed: 0,
            tail: [0xFF; MAX_WRITE_GRANULE],
            tail_len: 0,
        })
    }

    fn write(&mut self, handle: &mut NorWriteHandle, data: &[u8]) -> Result<(), WriteError> {
        let incoming = u32::try_from(data.len()).map_err(|_| WriteError::OutOfSpace)?;
        if handle
            .bytes_accepted()
            .checked_add(incoming)
            .is_none_or(|total| total > handle.region.len)
        {
            return Err(WriteError::OutOfSpace);
        }

        let granule = F::WRITE_SIZE;
        let mut rest = data;

        if handle.tail_len > 0 {
            let take = (granule - handle.tail_len).min(rest.len());
            handle.tail[handle.tail_len..handle.tail_len + take].copy_from_slice(&rest[..take]);
            handle.tail_len += take;
            rest = &rest[take..];
            if handle.tail_len == granule {
                self.flush_tail(handle).map_err(|_| WriteError::Flash)?;
            }
        }

        let bulk = rest.len() - rest.len() % granule;
        if bulk > 0 {
            self.flash
                .write(handle.region.offset + handle.flushed, &rest[..bulk])
                .map_err(|_| WriteError::Flash)?;
            handle.flushed += u32::try_from(bulk).map_err(|_| WriteError::OutOfSpace)?;
            rest = &rest[bulk..];
        }

        if !rest.is_empty() {
            handle.tail[..rest.len()].copy_from_slice(rest);
            handle.tail_len = rest.len();
        }
        Ok(())
    }

    fn end(&mut self, mut handle: NorWriteHandle) -> Result<(), FinalizeError> {
        self.writing = false;

        if handle.tail_len > 0 {
            self.flush_tail(&mut handle)
                .map_err(|_| FinalizeError::Flash)?;
        }
        if handle.flushed == 0 {
            return Err(FinalizeError::EmptyImage);
        }
        self.verify_header(&handle)?;

        self.finalized = Some((handle.partition, handle.flushed));
        Ok(())
    }

    fn abort(&mut self, handle: NorWriteHandle) {
        self.writing = false;
        if self
            .finalized
            .is_some_and(|(partition, _)| partition == handle.partition)
        {
            self.finalized = None;
        }
    }

    fn set_boot_partition(&mut self, partition: PartitionId) -> Result<(), ActivationError> {
        let Some((finalized, image_len)) = self.finalized else {
            return Err(ActivationError::NotFinalized);
        };
        if finalized != partition {
            return Err(ActivationError::NotFinalized);
        }

        let record = BootRecord {
            sequence: self
                .record
                .map_or(1, |previous| previous.sequence.wrapping_add(1)),
            slot: partition,
            image_len,
        };
        let page = self.layout.record(BankWindow::Upper);
        self.flash
            .erase(page.offset, page.end())
            .map_err(|_| ActivationError::Flash)?;
        self.flash
            .write(page.offset, &record.encode())
            .map_err(|_| ActivationError::Flash)?;
        self.banks
            .select(partition)
            .map_err(|_| ActivationError::BankSelect)?;

        self.pending = Some(record);
        self.finalized = None;
        Ok(())
    }
}
