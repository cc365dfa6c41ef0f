//! Host directory standing in for the SD card.
//!
//! A missing directory behaves like an absent card. A plain file at the card
//! path behaves like a card without a usable filesystem, which `format`
//! replaces with an empty directory.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use updater_core::config::MountConfig;
use updater_core::storage::{
    DirEntry, EntryKind, Filesystem, FsError, HandleBudget, Metadata, MountError, StorageDevice,
};

/// Handles the host can hold; the mount config narrows it.
const HOST_HANDLE_CAPACITY: usize = 64;

pub struct HostCard {
    root: PathBuf,
}

impl HostCard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StorageDevice for HostCard {
    type Fs = HostFs;

    fn mount(&mut self, config: &MountConfig) -> Result<HostFs, MountError> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(HostFs {
                root: self.root.clone(),
                handles: HandleBudget::new(config, HOST_HANDLE_CAPACITY),
            }),
            Ok(_) => Err(MountError::FilesystemCorrupt),
            Err(_) => Err(MountError::DeviceUnresponsive),
        }
    }

    fn format(&mut self, _config: &MountConfig) -> Result<(), MountError> {
        let cleared = match fs::symlink_metadata(&self.root) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&self.root),
            Ok(_) => fs::remove_file(&self.root),
            Err(err) => Err(err),
        };
        cleared
            .and_then(|()| fs::create_dir_all(&self.root))
            .map_err(|_| MountError::DeviceUnresponsive)
    }

    fn unmount(&mut self, fs: HostFs) {
        drop(fs);
    }

    fn label(&self) -> &str {
        "HOST"
    }
}

/// Open file on the host card.
pub struct HostFile(File);

pub struct HostFs {
    root: PathBuf,
    handles: HandleBudget,
}

impl HostFs {
    fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(FsError::NotFound);
        }
        Ok(self.root.join(relative))
    }

    fn open_handle(
        &mut self,
        path: &str,
        open: impl FnOnce(&Path) -> io::Result<File>,
    ) -> Result<HostFile, FsError> {
        let target = self.resolve(path)?;
        if target.is_dir() {
            return Err(FsError::IsDirectory);
        }
        self.handles
            .open_with(|| open(&target).map(HostFile).map_err(|err| io_error(&err)))
    }
}

fn io_error(err: &io::Error) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound,
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => FsError::InvalidData,
        _ => FsError::Io,
    }
}

fn entry_kind(file_type: fs::FileType) -> EntryKind {
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

impl Filesystem for HostFs {
    type File = HostFile;

    fn metadata(&mut self, path: &str) -> Result<Metadata, FsError> {
        let meta = fs::symlink_metadata(self.resolve(path)?).map_err(|err| io_error(&err))?;
        Ok(match entry_kind(meta.file_type()) {
            EntryKind::File => Metadata::file(meta.len()),
            kind => Metadata { kind, len: 0 },
        })
    }

    fn create(&mut self, path: &str) -> Result<HostFile, FsError> {
        self.open_handle(path, |target| File::create(target))
    }

    fn open(&mut self, path: &str) -> Result<HostFile, FsError> {
        self.open_handle(path, |target| File::open(target))
    }

    fn read(&mut self, file: &mut HostFile, buf: &mut [u8]) -> Result<usize, FsError> {
        file.0.read(buf).map_err(|err| io_error(&err))
    }

    fn write(&mut self, file: &mut HostFile, data: &[u8]) -> Result<(), FsError> {
        file.0.write_all(data).map_err(|err| io_error(&err))
    }

    fn close(&mut self, mut file: HostFile) -> Result<(), FsError> {
        self.handles.release();
        file.0.flush().map_err(|err| io_error(&err))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        let (from, to) = (self.resolve(from)?, self.resolve(to)?);
        fs::rename(from, to).map_err(|err| io_error(&err))
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        if target.is_dir() {
            return Err(FsError::IsDirectory);
        }
        fs::remove_file(target).map_err(|err| io_error(&err))
    }

    fn create_dir(&mut self, path: &str) -> Result<(), FsError> {
        fs::create_dir(self.resolve(path)?).map_err(|err| io_error(&err))
    }

    fn for_each_entry(
        &mut self,
        dir: &str,
        visit: &mut dyn FnMut(&DirEntry),
    ) -> Result<(), FsError> {
        let target = self.resolve(dir)?;
        if target.exists() && !target.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(target).map_err(|err| io_error(&err))? {
            let entry = entry.map_err(|err| io_error(&err))?;
            let meta = entry.metadata().map_err(|err| io_error(&err))?;
            let kind = entry_kind(entry.file_type().map_err(|err| io_error(&err))?);
            let len = if kind == EntryKind::File { meta.len() } else { 0 };
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push((name, kind, len));
        }
        entries.sort_by(|left, right| left.0.cmp(&right.0));

        for (name, kind, len) in entries {
            // Names the firmware could not represent are left out.
            if let Ok(entry) = DirEntry::new(&name, kind, len) {
                visit(&entry);
            }
        }
        Ok(())
    }
}
