#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};
use updater_core::config::MountConfig;
use updater_core::partition::nor::BankSelect;
use updater_core::partition::{
    ActivationError, FinalizeError, PartitionError, PartitionId, PartitionTable, WriteError,
};
use updater_core::storage::{
    DirEntry, EntryKind, Filesystem, FsError, Metadata, MountError, StorageDevice,
};
use updater_core::telemetry::{EventId, TelemetryPayload, TelemetrySink, UpdateEventKind};

#[derive(Clone, Debug, Default)]
pub struct CardContents {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

/// Fault injection applied to the mounted filesystem.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    pub fail_rename: bool,
    pub fail_remove: Option<String>,
    /// Reads of this path fail once this many bytes have been returned.
    pub fail_read: Option<(String, usize)>,
    pub fail_listing: bool,
    /// Lengths reported by `metadata` instead of the real file size.
    pub reported_len: BTreeMap<String, u64>,
}

/// In-memory card. Contents move into the filesystem while mounted.
pub struct MemoryCard {
    contents: Option<CardContents>,
    pub faults: Faults,
    pub label: &'static str,
    pub mount_error: Option<MountError>,
    pub corrupt: bool,
    pub mounts: usize,
    pub unmounts: usize,
    pub formats: usize,
}

impl MemoryCard {
    pub fn new() -> Self {
        Self {
            contents: Some(CardContents::default()),
            faults: Faults::default(),
            label: "SD",
            mount_error: None,
            corrupt: false,
            mounts: 0,
            unmounts: 0,
            formats: 0,
        }
    }

    fn contents_mut(&mut self) -> &mut CardContents {
        self.contents.as_mut().expect("card is mounted")
    }

    fn contents(&self) -> &CardContents {
        self.contents.as_ref().expect("card is mounted")
    }

    /// Adds a file, creating its parent directories.
    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        self.put_file(path, data);
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        let contents = self.contents_mut();
        for ancestor in ancestors(path) {
            contents.dirs.insert(ancestor);
        }
        contents.dirs.insert(path.to_string());
        self
    }

    pub fn put_file(&mut self, path: &str, data: &[u8]) {
        let contents = self.contents_mut();
        for ancestor in ancestors(path) {
            contents.dirs.insert(ancestor);
        }
        contents.files.insert(path.to_string(), data.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.contents().files.get(path).map(Vec::as_slice)
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.contents().files.contains_key(path)
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.contents().dirs.contains(path)
    }

    pub fn is_mounted(&self) -> bool {
        self.contents.is_none()
    }
}

impl StorageDevice for MemoryCard {
    type Fs = MemoryFs;

    fn mount(&mut self, _: &MountConfig) -> Result<MemoryFs, MountError> {
        self.mounts += 1;
        if let Some(err) = self.mount_error {
            return Err(err);
        }
        if self.corrupt {
            return Err(MountError::FilesystemCorrupt);
        }
        let contents = self.contents.take().expect("card mounted twice");
        Ok(MemoryFs {
            contents,
            faults: self.faults.clone(),
            open_files: 0,
        })
    }

    fn format(&mut self, _: &MountConfig) -> Result<(), MountError> {
        self.formats += 1;
        self.corrupt = false;
        self.contents = Some(CardContents::default());
        Ok(())
    }

    fn unmount(&mut self, fs: MemoryFs) {
        self.unmounts += 1;
        assert_eq!(fs.open_files, 0, "file handle leaked past unmount");
        self.contents = Some(fs.contents);
    }

    fn label(&self) -> &str {
        self.label
    }
}

pub struct MemoryFs {
    contents: CardContents,
    faults: Faults,
    open_files: usize,
}

pub struct MemoryFile {
    path: String,
    position: usize,
}

const MAX_OPEN_FILES: usize = 5;

impl MemoryFs {
    fn is_dir(&self, path: &str) -> bool {
        path == "/" || self.contents.dirs.contains(path)
    }

    fn open_handle(&mut self, path: &str) -> Result<MemoryFile, FsError> {
        if self.open_files == MAX_OPEN_FILES {
            return Err(FsError::TooManyOpenFiles);
        }
        self.open_files += 1;
        Ok(MemoryFile {
            path: path.to_string(),
            position: 0,
        })
    }
}

impl Filesystem for MemoryFs {
    type File = MemoryFile;

    fn metadata(&mut self, path: &str) -> Result<Metadata, FsError> {
        if self.is_dir(path) {
            return Ok(Metadata::directory());
        }
        let data = self.contents.files.get(path).ok_or(FsError::NotFound)?;
        let len = self
            .faults
            .reported_len
            .get(path)
            .copied()
            .unwrap_or(data.len() as u64);
        Ok(Metadata::file(len))
    }

    fn create(&mut self, path: &str) -> Result<MemoryFile, FsError> {
        if self.is_dir(path) {
            return Err(FsError::IsDirectory);
        }
        if !self.is_dir(parent(path)) {
            return Err(FsError::NotFound);
        }
        let file = self.open_handle(path)?;
        self.contents.files.insert(path.to_string(), Vec::new());
        Ok(file)
    }

    fn open(&mut self, path: &str) -> Result<MemoryFile, FsError> {
        if self.is_dir(path) {
            return Err(FsError::IsDirectory);
        }
        if !self.contents.files.contains_key(path) {
            return Err(FsError::NotFound);
        }
        self.open_handle(path)
    }

    fn read(&mut self, file: &mut MemoryFile, buf: &mut [u8]) -> Result<usize, FsError> {
        if let Some((path, after)) = &self.faults.fail_read {
            if *path == file.path && file.position >= *after {
                return Err(FsError::Io);
            }
        }
        let data = self.contents.files.get(&file.path).ok_or(FsError::NotFound)?;
        let remaining = &data[file.position.min(data.len())..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        file.position += count;
        Ok(count)
    }

    fn write(&mut self, file: &mut MemoryFile, data: &[u8]) -> Result<(), FsError> {
        let contents = self
            .contents
            .files
            .get_mut(&file.path)
            .ok_or(FsError::NotFound)?;
        contents.extend_from_slice(data);
        file.position += data.len();
        Ok(())
    }

    fn close(&mut self, _: MemoryFile) -> Result<(), FsError> {
        self.open_files -= 1;
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        if self.faults.fail_rename {
            return Err(FsError::Io);
        }
        if self.contents.files.contains_key(to) || self.is_dir(to) {
            return Err(FsError::Io);
        }
        let data = self.contents.files.remove(from).ok_or(FsError::NotFound)?;
        self.contents.files.insert(to.to_string(), data);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        if self.faults.fail_remove.as_deref() == Some(path) {
            return Err(FsError::Io);
        }
        if self.is_dir(path) {
            return Err(FsError::IsDirectory);
        }
        self.contents
            .files
            .remove(path)
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    fn create_dir(&mut self, path: &str) -> Result<(), FsError> {
        if !self.is_dir(parent(path)) {
            return Err(FsError::NotFound);
        }
        self.contents.dirs.insert(path.to_string());
        Ok(())
    }

    fn for_each_entry(
        &mut self,
        dir: &str,
        visit: &mut dyn FnMut(&DirEntry),
    ) -> Result<(), FsError> {
        if self.faults.fail_listing {
            return Err(FsError::Io);
        }
        if !self.is_dir(dir) {
            return Err(FsError::NotADirectory);
        }
        for path in self.contents.dirs.iter().filter(|path| parent(path) == dir) {
            visit(&DirEntry::new(name(path), EntryKind::Directory, 0)?);
        }
        for (path, data) in self
            .contents
            .files
            .iter()
            .filter(|(path, _)| parent(path) == dir)
        {
            visit(&DirEntry::new(name(path), EntryKind::File, data.len() as u64)?);
        }
        Ok(())
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn ancestors(path: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut current = parent(path);
    while current != "/" {
        found.push(current.to_string());
        current = parent(current);
    }
    found
}

/// Handle returned by [`MemoryPartitions::begin`].
#[derive(Debug)]
pub struct MemoryHandle {
    partition: PartitionId,
}

/// Two in-memory slots with call counters.
pub struct MemoryPartitions {
    pub slots: [Vec<u8>; 2],
    pub active: PartitionId,
    pub capacity: usize,
    pub writing: Option<PartitionId>,
    pub finalized: Option<PartitionId>,
    pub reject_image: Option<FinalizeError>,
    pub reject_activation: Option<ActivationError>,
    pub begin_calls: usize,
    pub end_calls: usize,
    pub abort_calls: usize,
    pub activate_calls: usize,
}

impl MemoryPartitions {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: [Vec::new(), Vec::new()],
            active: PartitionId::SlotA,
            capacity,
            writing: None,
            finalized: None,
            reject_image: None,
            reject_activation: None,
            begin_calls: 0,
            end_calls: 0,
            abort_calls: 0,
            activate_calls: 0,
        }
    }

    pub fn slot(&self, partition: PartitionId) -> &[u8] {
        &self.slots[usize::from(partition.to_raw())]
    }

    fn slot_mut(&mut self, partition: PartitionId) -> &mut Vec<u8> {
        &mut self.slots[usize::from(partition.to_raw())]
    }
}

impl PartitionTable for MemoryPartitions {
    type Handle = MemoryHandle;

    fn active(&self) -> PartitionId {
        self.active
    }

    fn next_update_partition(&self) -> Option<PartitionId> {
        Some(self.active.other())
    }

    fn begin(&mut self, partition: PartitionId) -> Result<MemoryHandle, PartitionError> {
        self.begin_calls += 1;
        if self.writing.is_some() {
            return Err(PartitionError::Busy);
        }
        if partition == self.active {
            return Err(PartitionError::ActivePartition);
        }
        self.slot_mut(partition).clear();
        self.writing = Some(partition);
        self.finalized = None;
        Ok(MemoryHandle { partition })
    }

    fn write(&mut self, handle: &mut MemoryHandle, data: &[u8]) -> Result<(), WriteError> {
        let capacity = self.capacity;
        let slot = self.slot_mut(handle.partition);
        if slot.len() + data.len() > capacity {
            return Err(WriteError::OutOfSpace);
        }
        slot.extend_from_slice(data);
        Ok(())
    }

    fn end(&mut self, handle: MemoryHandle) -> Result<(), FinalizeError> {
        self.end_calls += 1;
        self.writing = None;
        if let Some(err) = self.reject_image {
            return Err(err);
        }
        if self.slot(handle.partition).is_empty() {
            return Err(FinalizeError::EmptyImage);
        }
        self.finalized = Some(handle.partition);
        Ok(())
    }

    fn abort(&mut self, _: MemoryHandle) {
        self.abort_calls += 1;
        self.writing = None;
        self.finalized = None;
    }

    fn set_boot_partition(&mut self, partition: PartitionId) -> Result<(), ActivationError> {
        self.activate_calls += 1;
        if let Some(err) = self.reject_activation {
            return Err(err);
        }
        if self.finalized != Some(partition) {
            return Err(ActivationError::NotFinalized);
        }
        self.active = partition;
        self.finalized = None;
        Ok(())
    }
}

/// NOR flash model: erase sets bytes to `0xFF`, programming can only clear bits.
///
/// With `swapped` set the two halves trade places in the addressed view, the
/// way a dual-bank part maps its second bank at the flash base.
pub struct MemoryFlash {
    pub bytes: Vec<u8>,
    pub swapped: bool,
    pub erase_calls: usize,
}

impl MemoryFlash {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0xFF; capacity],
            swapped: false,
            erase_calls: 0,
        }
    }

    /// Physical byte range behind an addressed range within one bank.
    fn physical(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, NorFlashErrorKind> {
        let half = self.bytes.len() / 2;
        let start = offset as usize;
        let end = start + len;
        if end > self.bytes.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        if !self.swapped {
            return Ok(start..end);
        }
        if end <= half {
            Ok(start + half..end + half)
        } else if start >= half {
            Ok(start - half..end - half)
        } else {
            Err(NorFlashErrorKind::OutOfBounds)
        }
    }

    /// Bytes of one physical bank, whatever is mapped where.
    pub fn physical_bank(&self, index: usize) -> &[u8] {
        let half = self.bytes.len() / 2;
        &self.bytes[index * half..(index + 1) * half]
    }
}

impl ErrorType for MemoryFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MemoryFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.physical(offset, bytes.len())?;
        bytes.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }
}

impl NorFlash for MemoryFlash {
    const WRITE_SIZE: usize = 8;
    const ERASE_SIZE: usize = 2048;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 || from > to
        {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = self.physical(from, (to - from) as usize)?;
        self.bytes[range].fill(0xFF);
        self.erase_calls += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = self.physical(offset, bytes.len())?;
        for (cell, byte) in self.bytes[range].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

/// Bank swap option: `running` is latched at reset, `programmed` takes effect
/// at the next one.
#[derive(Debug)]
pub struct MemoryBanks {
    pub running: PartitionId,
    pub programmed: PartitionId,
    pub refuse: bool,
}

impl MemoryBanks {
    pub fn new() -> Self {
        Self {
            running: PartitionId::SlotA,
            programmed: PartitionId::SlotA,
            refuse: false,
        }
    }
}

#[derive(Debug)]
pub struct BankRefused;

impl BankSelect for MemoryBanks {
    type Error = BankRefused;

    fn running(&self) -> PartitionId {
        self.running
    }

    fn select(&mut self, slot: PartitionId) -> Result<(), BankRefused> {
        if self.refuse {
            return Err(BankRefused);
        }
        self.programmed = slot;
        Ok(())
    }
}

/// Applies the programmed bank mapping, as a reset does.
pub fn reset(mut flash: MemoryFlash, mut banks: MemoryBanks) -> (MemoryFlash, MemoryBanks) {
    banks.running = banks.programmed;
    flash.swapped = banks.running == PartitionId::SlotB;
    (flash, banks)
}

/// Sink that keeps every event and note for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub records: Vec<(UpdateEventKind, TelemetryPayload)>,
    pub notes: Vec<(UpdateEventKind, String)>,
}

impl RecordingSink {
    pub fn kinds(&self) -> Vec<UpdateEventKind> {
        self.records.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn contains(&self, kind: UpdateEventKind) -> bool {
        self.records.iter().any(|(recorded, _)| *recorded == kind)
    }

    pub fn notes_for(&self, kind: UpdateEventKind) -> Vec<&str> {
        self.notes
            .iter()
            .filter(|(recorded, _)| *recorded == kind)
            .map(|(_, text)| text.as_str())
            .collect()
    }
}

impl TelemetrySink for RecordingSink {
    fn record(&mut self, event: UpdateEventKind, payload: TelemetryPayload) -> EventId {
        self.records.push((event, payload));
        EventId::try_from(self.records.len() - 1).expect("event id overflow")
    }

    fn note(&mut self, event: UpdateEventKind, text: &str) {
        self.notes.push((event, text.to_string()));
    }
}

/// Deterministic, non-repeating-looking byte pattern.
pub fn pattern_image(len: usize) -> Vec<u8> {
    (0..len).map(|index| ((index * 31 + 7) % 251) as u8).collect()
}

/// Pattern image whose first two words form a valid Cortex-M vector table.
pub fn bootable_image(len: usize, stack_top: u32, reset_handler: u32) -> Vec<u8> {
    let mut image = pattern_image(len);
    image[..4].copy_from_slice(&stack_top.to_le_bytes());
    image[4..8].copy_from_slice(&(reset_handler | 1).to_le_bytes());
    image
}
