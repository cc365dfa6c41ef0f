//! Removable storage abstractions and the scoped mount session.
//!
//! [`StorageDevice`] owns the card; mounting it yields a [`Filesystem`] that
//! stays inside a [`StorageSession`]. The session is the only way the rest of
//! the crate reaches the filesystem, and it unmounts the device on every exit
//! path (explicitly or when dropped).

use core::fmt;

use heapless::String;

use crate::config::MountConfig;

pub mod listing;

/// Longest entry name surfaced through [`DirEntry`].
pub const MAX_NAME_LEN: usize = 32;

/// Longest absolute path built while walking the tree.
pub const MAX_PATH_LEN: usize = 96;

/// Failure reported when the device cannot be mounted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MountError {
    /// The card did not answer (missing, unpowered, or miswired).
    DeviceUnresponsive,
    /// The card answered but carries no usable filesystem.
    FilesystemCorrupt,
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountError::DeviceUnresponsive => f.write_str("device-unresponsive"),
            MountError::FilesystemCorrupt => f.write_str("filesystem-corrupt"),
        }
    }
}

/// Errors surfaced by individual filesystem operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsError {
    NotMounted,
    NotFound,
    IsDirectory,
    NotADirectory,
    TooManyOpenFiles,
    NameTooLong,
    InvalidData,
    Io,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Kind of a directory entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    /// Single-character tag used in listings.
    pub const fn tag(self) -> char {
        match self {
            EntryKind::File => 'f',
            EntryKind::Directory => 'd',
            EntryKind::Symlink => 'l',
        }
    }
}

/// Result of a `stat` call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Metadata {
    pub kind: EntryKind,
    pub len: u64,
}

impl Metadata {
    pub const fn file(len: u64) -> Self {
        Self {
            kind: EntryKind::File,
            len,
        }
    }

    pub const fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            len: 0,
        }
    }

    /// Returns `true` for regular files.
    pub const fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    pub const fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }
}

/// Single entry produced by [`Filesystem::for_each_entry`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: String<MAX_NAME_LEN>,
    pub kind: EntryKind,
    pub len: u64,
}

impl DirEntry {
    /// Builds an entry, failing when the name does not fit.
    pub fn new(name: &str, kind: EntryKind, len: u64) -> Result<Self, FsError> {
        let name = String::try_from(name).map_err(|_| FsError::NameTooLong)?;
        Ok(Self { name, kind, len })
    }
}

/// Ordinary file operations against a mounted filesystem.
///
/// Paths are absolute within the mount (`/firmware/update.bin`). Open files are
/// plain handles; every operation goes through the filesystem so
/// implementations backed by a shared volume manager stay simple.
pub trait Filesystem {
    /// Handle for an open file.
    type File;

    /// Returns the metadata for `path`, or [`FsError::NotFound`].
    fn metadata(&mut self, path: &str) -> Result<Metadata, FsError>;

    /// Creates (or truncates) a file for writing.
    fn create(&mut self, path: &str) -> Result<Self::File, FsError>;

    /// Opens an existing file for reading from the start.
    fn open(&mut self, path: &str) -> Result<Self::File, FsError>;

    /// Reads into `buf`, returning `0` once the file is exhausted.
    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Appends `data` to a file opened with [`Filesystem::create`].
    fn write(&mut self, file: &mut Self::File, data: &[u8]) -> Result<(), FsError>;

    /// Flushes and releases the handle.
    fn close(&mut self, file: Self::File) -> Result<(), FsError>;

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError>;

    fn remove(&mut self, path: &str) -> Result<(), FsError>;

    fn create_dir(&mut self, path: &str) -> Result<(), FsError>;

    /// Invokes `visit` for every entry of `dir`, excluding `.` and `..`.
    fn for_each_entry(
        &mut self,
        dir: &str,
        visit: &mut dyn FnMut(&DirEntry),
    ) -> Result<(), FsError>;

    /// Returns `true` when `path` exists.
    fn exists(&mut self, path: &str) -> bool {
        self.metadata(path).is_ok()
    }
}

/// Physical storage that can be mounted as a [`Filesystem`].
pub trait StorageDevice {
    type Fs: Filesystem;

    /// Brings up the device and mounts its filesystem.
    fn mount(&mut self, config: &MountConfig) -> Result<Self::Fs, MountError>;

    /// Lays down a fresh filesystem, destroying the current contents.
    fn format(&mut self, config: &MountConfig) -> Result<(), MountError>;

    /// Flushes and releases the filesystem.
    fn unmount(&mut self, fs: Self::Fs);

    /// Human-readable device name written by the self-test probe.
    fn label(&self) -> &str {
        "SD"
    }
}

/// Open-file accounting for a mounted filesystem.
///
/// The limit is the smaller of [`MountConfig::max_open_files`] and what the
/// driver can hold.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HandleBudget {
    open: usize,
    max: usize,
}

impl HandleBudget {
    #[must_use]
    pub fn new(config: &MountConfig, driver_capacity: usize) -> Self {
        Self {
            open: 0,
            max: usize::from(config.max_open_files).min(driver_capacity),
        }
    }

    /// Reserves a handle, failing once the limit is reached.
    pub fn claim(&mut self) -> Result<(), FsError> {
        if self.open >= self.max {
            return Err(FsError::TooManyOpenFiles);
        }
        self.open += 1;
        Ok(())
    }

    pub fn release(&mut self) {
        self.open = self.open.saturating_sub(1);
    }

    /// Runs `open` under a reserved handle, giving it back if `open` fails.
    pub fn open_with<T>(
        &mut self,
        open: impl FnOnce() -> Result<T, FsError>,
    ) -> Result<T, FsError> {
        self.claim()?;
        open().inspect_err(|_| self.release())
    }

    #[must_use]
    pub const fn open(&self) -> usize {
        self.open
    }

    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }
}

/// Mounted storage scoped to a single boot cycle.
pub struct StorageSession<'d, D>
where
    D: StorageDevice,
{
    device: &'d mut D,
    fs: Option<D::Fs>,
    mount_point: &'static str,
    formatted: bool,
}

impl<'d, D> StorageSession<'d, D>
where
    D: StorageDevice,
{
    /// Mounts `device`, reformatting once when the policy allows it.
    pub fn mount(device: &'d mut D, config: &MountConfig) -> Result<Self, MountError> {
        let mut formatted = false;
        let fs = match device.mount(config) {
            Ok(fs) => fs,
            Err(MountError::FilesystemCorrupt) if config.format_if_mount_failed => {
                device.format(config)?;
                formatted = true;
                device.mount(config)?
            }
            Err(err) => return Err(err),
        };

        Ok(Self {
            device,
            fs: Some(fs),
            mount_point: config.mount_point,
            formatted,
        })
    }

    pub fn mount_point(&self) -> &'static str {
        self.mount_point
    }

    /// Returns `true` until [`StorageSession::unmount`] runs.
    pub fn is_mounted(&self) -> bool {
        self.fs.is_some()
    }

    /// Returns `true` when the card had to be reformatted to mount.
    pub fn was_formatted(&self) -> bool {
        self.formatted
    }

    pub fn label(&self) -> &str {
        self.device.label()
    }

    /// Grants access to the mounted filesystem.
    pub fn fs(&mut self) -> Result<&mut D::Fs, FsError> {
        self.fs.as_mut().ok_or(FsError::NotMounted)
    }

    /// Unmounts the device. Returns `false` when it was already unmounted.
    pub fn unmount(&mut self) -> bool {
        match self.fs.take() {
            Some(fs) => {
                self.device.unmount(fs);
                true
            }
            None => false,
        }
    }
}

impl<D> Drop for StorageSession<'_, D>
where
    D: StorageDevice,
{
    fn drop(&mut self) {
        self.unmount();
    }
}
