//! Write/rename/read probe proving the mounted card is usable.

use core::fmt::{self, Write as _};

use heapless::String;

use crate::config::UpdatePaths;
use crate::storage::{Filesystem, FsError, StorageDevice, StorageSession};

/// Longest probe line kept in the report.
pub const PROBE_LINE_CAPACITY: usize = 64;

/// Failure stage of the self-test.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SelfTestError {
    WriteFailed(FsError),
    RenameFailed(FsError),
    ReadFailed(FsError),
}

impl fmt::Display for SelfTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelfTestError::WriteFailed(err) => write!(f, "write failed: {err}"),
            SelfTestError::RenameFailed(err) => write!(f, "rename failed: {err}"),
            SelfTestError::ReadFailed(err) => write!(f, "read failed: {err}"),
        }
    }
}

/// Line read back from the renamed probe file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SelfTestReport {
    pub line: String<PROBE_LINE_CAPACITY>,
}

/// Builds the probe contents written to the card.
pub fn probe_greeting(label: &str) -> Result<String<PROBE_LINE_CAPACITY>, FsError> {
    let mut greeting = String::new();
    writeln!(greeting, "Hello {label}!").map_err(|_| FsError::NameTooLong)?;
    Ok(greeting)
}

/// Runs the probe against the mounted session.
///
/// The probe source is created (along with its parent directory when missing),
/// any stale destination is removed, the source is renamed over it, and the
/// first line of the destination is read back without its newline. Running it
/// twice in a row yields the same report.
pub fn run_self_test<D>(
    session: &mut StorageSession<'_, D>,
    paths: &UpdatePaths,
) -> Result<SelfTestReport, SelfTestError>
where
    D: StorageDevice,
{
    let greeting = probe_greeting(session.label()).map_err(SelfTestError::WriteFailed)?;
    let fs = session.fs().map_err(SelfTestError::WriteFailed)?;

    write_probe(fs, paths.probe_source, greeting.as_bytes()).map_err(SelfTestError::WriteFailed)?;

    if fs.exists(paths.probe_destination) {
        fs.remove(paths.probe_destination)
            .map_err(SelfTestError::RenameFailed)?;
    }
    fs.rename(paths.probe_source, paths.probe_destination)
        .map_err(SelfTestError::RenameFailed)?;

    let line = read_first_line(fs, paths.probe_destination).map_err(SelfTestError::ReadFailed)?;
    Ok(SelfTestReport { line })
}

fn write_probe<F>(fs: &mut F, path: &str, contents: &[u8]) -> Result<(), FsError>
where
    F: Filesystem,
{
    if let Some((parent, _)) = path.rsplit_once('/')
        && !parent.is_empty()
        && !fs.exists(parent)
    {
        fs.create_dir(parent)?;
    }

    let mut file = fs.create(path)?;
    let written = fs.write(&mut file, contents);
    let closed = fs.close(file);
    written.and(closed)
}

fn read_first_line<F>(fs: &mut F, path: &str) -> Result<String<PROBE_LINE_CAPACITY>, FsError>
where
    F: Filesystem,
{
    let mut file = fs.open(path)?;
    let mut buf = [0u8; PROBE_LINE_CAPACITY];
    let mut filled = 0;
    let read = loop {
        if filled == buf.len() || buf[..filled].contains(&b'\n') {
            break Ok(());
        }
        match fs.read(&mut file, &mut buf[filled..]) {
            Ok(0) => break Ok(()),
            Ok(count) => filled += count,
            Err(err) => break Err(err),
        }
    };
    let closed = fs.close(file);
    read.and(closed)?;

    strip_line(&buf[..filled])
}

/// Returns the text before the first newline.
fn strip_line(bytes: &[u8]) -> Result<String<PROBE_LINE_CAPACITY>, FsError> {
    let end = bytes
        .iter()
        .position(|byte| *byte == b'\n')
        .unwrap_or(bytes.len());
    let text = core::str::from_utf8(&bytes[..end]).map_err(|_| FsError::InvalidData)?;
    String::try_from(text).map_err(|_| FsError::InvalidData)
}
