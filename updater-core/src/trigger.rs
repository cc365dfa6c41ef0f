//! Update trigger: a marker file whose existence requests an update.
//!
//! The marker is consumed before any update work begins, so a failed or
//! interrupted update never re-arms itself on the next boot.

use core::fmt;

use crate::storage::{Filesystem, FsError, StorageDevice, StorageSession};

/// Failure while inspecting or consuming the marker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TriggerError {
    /// The marker could not be stat'ed for a reason other than absence.
    Probe(FsError),
    /// The marker exists but could not be deleted; no update is attempted.
    RemoveFailed(FsError),
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Returns `true` when the marker was present, deleting it first.
pub fn check_and_consume_trigger<D>(
    session: &mut StorageSession<'_, D>,
    marker: &str,
) -> Result<bool, TriggerError>
where
    D: StorageDevice,
{
    let fs = session.fs().map_err(TriggerError::Probe)?;
    consume_marker(fs, marker)
}

fn consume_marker<F>(fs: &mut F, marker: &str) -> Result<bool, TriggerError>
where
    F: Filesystem,
{
    match fs.metadata(marker) {
        Ok(_) => {
            fs.remove(marker).map_err(TriggerError::RemoveFailed)?;
            Ok(true)
        }
        Err(FsError::NotFound) => Ok(false),
        Err(err) => Err(TriggerError::Probe(err)),
    }
}
