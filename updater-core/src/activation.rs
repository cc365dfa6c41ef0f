//! Boot target switch and restart.
//!
//! Activation only accepts a [`CommittedImage`], so nothing that aborted can be
//! selected for boot. There is no rollback: once the record points at the new
//! slot, a bad image keeps booting until another update replaces it.

use crate::partition::{ActivationError, PartitionId, PartitionTable};
use crate::update::CommittedImage;

/// Platform hook that resets the device.
pub trait SystemReset {
    fn restart(&mut self) -> !;
}

/// Marks the committed partition as the next boot target.
pub fn activate<P>(table: &mut P, image: CommittedImage) -> Result<PartitionId, ActivationError>
where
    P: PartitionTable,
{
    let partition = image.partition();
    table.set_boot_partition(partition)?;
    Ok(partition)
}

/// Restarts the device. Storage must already be unmounted.
pub fn restart<R>(reset: &mut R) -> !
where
    R: SystemReset,
{
    reset.restart()
}
