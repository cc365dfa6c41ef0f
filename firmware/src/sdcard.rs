//! SD card over SPI1, mounted through `embedded-sdmmc`.
//!
//! The card is wired to SPI1 (`PA5` SCK, `PA7` MOSI, `PA6` MISO) with chip
//! select on `PA4`. Only the first FAT volume is used. Names are 8.3, so the
//! update paths must stay within short names. FAT has no rename in this
//! driver; [`SdFilesystem::rename`] copies and deletes instead. Formatting is
//! not supported on the device.

use core::fmt::Write as _;

use embassy_stm32::Peri;
use embassy_stm32::gpio::{Level, Output, Speed};
use embassy_stm32::mode::Blocking;
use embassy_stm32::peripherals::{PA4, PA5, PA6, PA7, SPI1};
use embassy_stm32::spi::{self, Spi};
use embassy_stm32::time::Hertz;
use embassy_time::Delay;
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::{
    Error, Mode, RawDirectory, RawFile, RawVolume, SdCard, SdCardError, TimeSource, Timestamp,
    VolumeIdx, VolumeManager,
};
use heapless::String;
use updater_core::config::{DEFAULT_MAX_OPEN_FILES, MountConfig};
use updater_core::storage::{
    DirEntry, EntryKind, Filesystem, FsError, HandleBudget, MAX_NAME_LEN, Metadata, MountError,
    StorageDevice,
};

/// Card initialisation must run below 400 kHz.
const SPI_FREQUENCY: Hertz = Hertz(400_000);
const MAX_DIRS: usize = 4;
/// Handle slots in the volume manager; a mount may ask for fewer.
const MAX_FILES: usize = DEFAULT_MAX_OPEN_FILES as usize;
const COPY_CHUNK: usize = 512;

type CardSpi = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, Delay>;
type Card = SdCard<CardSpi, Delay>;
type Volumes = VolumeManager<Card, FixedClock, MAX_DIRS, MAX_FILES, 1>;
type SdError = Error<SdCardError>;

/// Timestamp source for FAT entries; the board has no RTC.
pub struct FixedClock;

impl TimeSource for FixedClock {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 56,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

/// The card and its volume manager while unmounted.
pub struct SdStorage {
    volumes: Option<Volumes>,
}

impl SdStorage {
    pub fn new(
        spi: Peri<'static, SPI1>,
        sck: Peri<'static, PA5>,
        mosi: Peri<'static, PA7>,
        miso: Peri<'static, PA6>,
        cs: Peri<'static, PA4>,
    ) -> Self {
        let mut config = spi::Config::default();
        config.frequency = SPI_FREQUENCY;
        let bus = Spi::new_blocking(spi, sck, mosi, miso, config);
        let cs = Output::new(cs, Level::High, Speed::VeryHigh);
        let Ok(device) = ExclusiveDevice::new(bus, cs, Delay);
        let card = SdCard::new(device, Delay);
        Self {
            volumes: Some(VolumeManager::new_with_limits(card, FixedClock, 5000)),
        }
    }
}

impl StorageDevice for SdStorage {
    type Fs = SdFilesystem;

    fn mount(&mut self, config: &MountConfig) -> Result<SdFilesystem, MountError> {
        let Some(volumes) = self.volumes.as_mut() else {
            return Err(MountError::DeviceUnresponsive);
        };
        let volume = volumes.open_raw_volume(VolumeIdx(0)).map_err(|err| {
            defmt::warn!("sdcard: mount failed: {}", defmt::Debug2Format(&err));
            mount_error(&err)
        })?;
        let volumes = self.volumes.take().ok_or(MountError::DeviceUnresponsive)?;
        Ok(SdFilesystem {
            volumes,
            volume,
            handles: HandleBudget::new(config, MAX_FILES),
        })
    }

    fn format(&mut self, _config: &MountConfig) -> Result<(), MountError> {
        defmt::warn!("sdcard: formatting is not supported");
        Err(MountError::FilesystemCorrupt)
    }

    fn unmount(&mut self, mut fs: SdFilesystem) {
        fs.close_volume();
        self.volumes = Some(fs.volumes);
    }
}

fn mount_error(err: &SdError) -> MountError {
    match err {
        Error::DeviceError(_) => MountError::DeviceUnresponsive,
        _ => MountError::FilesystemCorrupt,
    }
}

fn fs_error(err: SdError) -> FsError {
    match err {
        Error::NotFound => FsError::NotFound,
        Error::OpenedDirAsFile | Error::DeleteDirAsFile => FsError::IsDirectory,
        Error::OpenedFileAsDir => FsError::NotADirectory,
        Error::TooManyOpenFiles | Error::TooManyOpenDirs => FsError::TooManyOpenFiles,
        Error::FilenameError(_) => FsError::NameTooLong,
        Error::FormatError(_) => FsError::InvalidData,
        other => {
            defmt::warn!("sdcard: {}", defmt::Debug2Format(&other));
            FsError::Io
        }
    }
}

/// Splits `/a/b/c` into (`a/b`, `c`).
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_matches('/');
    trimmed.rsplit_once('/').unwrap_or(("", trimmed))
}

/// The first FAT volume of a mounted card.
pub struct SdFilesystem {
    volumes: Volumes,
    volume: RawVolume,
    handles: HandleBudget,
}

impl SdFilesystem {
    fn close_volume(&mut self) {
        if let Err(err) = self.volumes.close_volume(self.volume) {
            defmt::warn!("sdcard: unmount failed: {}", defmt::Debug2Format(&err));
        }
    }

    fn open_dir(&mut self, path: &str) -> Result<RawDirectory, SdError> {
        let mut dir = self.volumes.open_root_dir(self.volume)?;
        for name in path.split('/').filter(|name| !name.is_empty()) {
            let next = self.volumes.open_dir(dir, name);
            let _ = self.volumes.close_dir(dir);
            dir = next?;
        }
        Ok(dir)
    }

    /// Runs `op` against the directory holding the last path component.
    fn in_parent<T>(
        &mut self,
        path: &str,
        op: impl FnOnce(&mut Volumes, RawDirectory, &str) -> Result<T, SdError>,
    ) -> Result<T, FsError> {
        let (parent, leaf) = split_path(path);
        if leaf.is_empty() {
            return Err(FsError::IsDirectory);
        }
        let dir = self.open_dir(parent).map_err(fs_error)?;
        let result = op(&mut self.volumes, dir, leaf);
        let _ = self.volumes.close_dir(dir);
        result.map_err(fs_error)
    }

    fn open_file(&mut self, path: &str, mode: Mode) -> Result<RawFile, FsError> {
        self.handles.claim()?;
        self.in_parent(path, |volumes, dir, leaf| {
            volumes.open_file_in_dir(dir, leaf, mode)
        })
        .inspect_err(|_| self.handles.release())
    }

    fn copy(&mut self, source: RawFile, destination: RawFile) -> Result<(), FsError> {
        let mut buffer = [0u8; COPY_CHUNK];
        loop {
            let read = self.volumes.read(source, &mut buffer).map_err(fs_error)?;
            if read == 0 {
                return Ok(());
            }
            self.volumes
                .write(destination, &buffer[..read])
                .map_err(fs_error)?;
        }
    }
}

impl Filesystem for SdFilesystem {
    type File = RawFile;

    fn metadata(&mut self, path: &str) -> Result<Metadata, FsError> {
        if split_path(path).1.is_empty() {
            return Ok(Metadata::directory());
        }
        let entry = self.in_parent(path, |volumes, dir, leaf| {
            volumes.find_directory_entry(dir, leaf)
        })?;
        if entry.attributes.is_directory() {
            Ok(Metadata::directory())
        } else {
            Ok(Metadata::file(u64::from(entry.size)))
        }
    }

    fn create(&mut self, path: &str) -> Result<RawFile, FsError> {
        self.open_file(path, Mode::ReadWriteCreateOrTruncate)
    }

    fn open(&mut self, path: &str) -> Result<RawFile, FsError> {
        self.open_file(path, Mode::ReadOnly)
    }

    fn read(&mut self, file: &mut RawFile, buf: &mut [u8]) -> Result<usize, FsError> {
        self.volumes.read(*file, buf).map_err(fs_error)
    }

    fn write(&mut self, file: &mut RawFile, data: &[u8]) -> Result<(), FsError> {
        self.volumes.write(*file, data).map_err(fs_error)
    }

    fn close(&mut self, file: RawFile) -> Result<(), FsError> {
        self.handles.release();
        self.volumes.close_file(file).map_err(fs_error)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        let source = self.open(from)?;
        let destination = match self.create(to) {
            Ok(file) => file,
            Err(err) => {
                let _ = self.close(source);
                return Err(err);
            }
        };
        let copied = self.copy(source, destination);
        let source_closed = self.close(source);
        let destination_closed = self.close(destination);
        copied?;
        source_closed?;
        destination_closed?;
        self.remove(from)
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        self.in_parent(path, |volumes, dir, leaf| volumes.delete_file_in_dir(dir, leaf))
    }

    fn create_dir(&mut self, path: &str) -> Result<(), FsError> {
        self.in_parent(path, |volumes, dir, leaf| volumes.make_dir_in_dir(dir, leaf))
    }

    fn for_each_entry(
        &mut self,
        dir: &str,
        visit: &mut dyn FnMut(&DirEntry),
    ) -> Result<(), FsError> {
        let raw = self.open_dir(dir).map_err(fs_error)?;
        let result = self.volumes.iterate_dir(raw, |entry| {
            if entry.attributes.is_volume() {
                return;
            }
            let mut name: String<MAX_NAME_LEN> = String::new();
            if write!(name, "{}", entry.name).is_err() || name == "." || name == ".." {
                return;
            }
            name.make_ascii_lowercase();
            let (kind, len) = if entry.attributes.is_directory() {
                (EntryKind::Directory, 0)
            } else {
                (EntryKind::File, u64::from(entry.size))
            };
            if let Ok(entry) = DirEntry::new(&name, kind, len) {
                visit(&entry);
            }
        });
        let _ = self.volumes.close_dir(raw);
        result.map_err(fs_error)
    }
}
