//! Flash partitions targeted by the updater.
//!
//! A [`PartitionTable`] exposes exactly two application slots. One is active
//! (the boot target); the other is the only one the updater ever opens for
//! writing. Writing goes through an opaque handle so a partially written slot
//! can be abandoned without touching the boot selection.

use core::fmt;

use crate::image::ImageCheckError;

pub mod nor;

/// Application slot identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionId {
    SlotA,
    SlotB,
}

impl PartitionId {
    /// Returns the opposite slot.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            PartitionId::SlotA => PartitionId::SlotB,
            PartitionId::SlotB => PartitionId::SlotA,
        }
    }

    /// Encodes the slot for persistent records.
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            PartitionId::SlotA => 0,
            PartitionId::SlotB => 1,
        }
    }

    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(PartitionId::SlotA),
            1 => Some(PartitionId::SlotB),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            PartitionId::SlotA => "slot-a",
            PartitionId::SlotB => "slot-b",
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Failure while opening a partition for writing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionError {
    /// The requested slot is the current boot target.
    ActivePartition,
    /// Another write handle is still open.
    Busy,
    /// Flash geometry does not fit the layout.
    Layout,
    Flash,
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Failure while streaming data into an open partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteError {
    /// The image is larger than the slot.
    OutOfSpace,
    Flash,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Failure while closing a write handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FinalizeError {
    /// The platform header check rejected the written image.
    InvalidImage(ImageCheckError),
    EmptyImage,
    Flash,
}

impl fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeError::InvalidImage(err) => write!(f, "app image invalid: {err}"),
            FinalizeError::EmptyImage => f.write_str("empty image"),
            FinalizeError::Flash => f.write_str("flash error"),
        }
    }
}

/// Failure while switching the boot target.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ActivationError {
    /// The partition was not finalized since it was last opened.
    NotFinalized,
    Flash,
    /// The hardware refused to map the slot at the flash base.
    BankSelect,
}

impl fmt::Display for ActivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Platform partition management.
///
/// Implementations must keep the active slot readable and bootable through
/// every call, and must release the write handle on both [`end`] and
/// [`abort`], whatever the outcome.
///
/// [`end`]: PartitionTable::end
/// [`abort`]: PartitionTable::abort
pub trait PartitionTable {
    /// Open write cursor for one slot.
    type Handle;

    /// Returns the slot running from the flash base for this boot.
    fn active(&self) -> PartitionId;

    /// Returns the slot an update should be written to.
    fn next_update_partition(&self) -> Option<PartitionId>;

    /// Opens `partition` for writing an image of unknown size.
    fn begin(&mut self, partition: PartitionId) -> Result<Self::Handle, PartitionError>;

    /// Appends `data` at the handle's cursor.
    fn write(&mut self, handle: &mut Self::Handle, data: &[u8]) -> Result<(), WriteError>;

    /// Completes the write and validates the image header.
    fn end(&mut self, handle: Self::Handle) -> Result<(), FinalizeError>;

    /// Abandons the write, leaving the slot inactive and writable.
    fn abort(&mut self, handle: Self::Handle);

    /// Selects `partition` as the next boot target.
    fn set_boot_partition(&mut self, partition: PartitionId) -> Result<(), ActivationError>;
}
