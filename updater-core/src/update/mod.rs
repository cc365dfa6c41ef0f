//! Streams a firmware image from storage into the inactive partition.
//!
//! [`UpdateWriter`] drives `Idle → Checked → Writing → {Committed | Aborted}`.
//! The partition handle lives inside an [`UpdateSession`] that is consumed by
//! either commit or abort, so every failure path releases it and the only way
//! to obtain a [`CommittedImage`] (and thus to activate anything) is a full,
//! length-matched, finalized write.

use core::fmt;

use heapless::Vec;

use crate::partition::{FinalizeError, PartitionError, PartitionId, PartitionTable, WriteError};
use crate::storage::{Filesystem, FsError};
use crate::telemetry::{TelemetryPayload, TelemetrySink, UpdateEventKind};

/// Bytes read from storage per write call.
pub const CHUNK_SIZE: usize = 1024;

/// Phase transitions retained for diagnostics.
pub const MAX_STATE_HISTORY: usize = 8;

/// Coarse phase of an update attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdatePhase {
    Idle,
    Checked,
    Writing,
    Committed,
    Aborted,
}

/// Failure that ends an update attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateError {
    /// The image could not be stat'ed.
    Storage(FsError),
    ImageNotFound,
    ImageIsDirectory,
    /// Reading the image failed mid-stream.
    ImageRead(FsError),
    NoUpdatePartition,
    Partition(PartitionError),
    Write(WriteError),
    SizeMismatch {
        expected: u64,
        written: u64,
    },
    Finalize(FinalizeError),
    Transition(TransitionError),
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::SizeMismatch { expected, written } => {
                write!(f, "size mismatch: expected {expected} bytes, wrote {written}")
            }
            UpdateError::Finalize(err) => write!(f, "finalize failed: {err}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// State of the current attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateState {
    Idle,
    Checked {
        expected_size: u64,
    },
    Writing {
        partition: PartitionId,
        bytes_written: u64,
        expected_size: u64,
    },
    Committed {
        partition: PartitionId,
        bytes_written: u64,
    },
    Aborted(UpdateError),
}

impl UpdateState {
    pub const fn phase(&self) -> UpdatePhase {
        match self {
            UpdateState::Idle => UpdatePhase::Idle,
            UpdateState::Checked { .. } => UpdatePhase::Checked,
            UpdateState::Writing { .. } => UpdatePhase::Writing,
            UpdateState::Committed { .. } => UpdatePhase::Committed,
            UpdateState::Aborted(_) => UpdatePhase::Aborted,
        }
    }

    /// Returns `true` once the attempt has committed or aborted.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, UpdateState::Committed { .. } | UpdateState::Aborted(_))
    }
}

/// Failure reported when attempting an invalid state transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransitionError {
    pub from: UpdatePhase,
    pub to: UpdatePhase,
}

impl TransitionError {
    pub const fn new(from: UpdatePhase, to: UpdatePhase) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} -> {:?}", self.from, self.to)
    }
}

const fn transition_allowed(from: UpdatePhase, to: UpdatePhase) -> bool {
    matches!(
        (from, to),
        (UpdatePhase::Idle, UpdatePhase::Checked)
            | (UpdatePhase::Checked, UpdatePhase::Writing)
            | (UpdatePhase::Writing, UpdatePhase::Writing | UpdatePhase::Committed)
            | (
                UpdatePhase::Idle | UpdatePhase::Checked | UpdatePhase::Writing,
                UpdatePhase::Aborted
            )
    )
}

/// Proof that an image was fully written and finalized.
///
/// Only [`UpdateWriter::run`] can produce one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CommittedImage {
    partition: PartitionId,
    len: u64,
}

impl CommittedImage {
    pub(crate) const fn new(partition: PartitionId, len: u64) -> Self {
        Self { partition, len }
    }

    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    pub const fn len(&self) -> u64 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Write cursor for one attempt, consumed by [`finish`](Self::finish) or
/// [`abort`](Self::abort).
pub struct UpdateSession<H> {
    handle: H,
    partition: PartitionId,
    bytes_written: u64,
    expected_size: u64,
}

impl<H> UpdateSession<H> {
    const fn new(handle: H, partition: PartitionId, expected_size: u64) -> Self {
        Self {
            handle,
            partition,
            bytes_written: 0,
            expected_size,
        }
    }

    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub const fn expected_size(&self) -> u64 {
        self.expected_size
    }

    fn write<P>(&mut self, table: &mut P, chunk: &[u8]) -> Result<(), WriteError>
    where
        P: PartitionTable<Handle = H>,
    {
        table.write(&mut self.handle, chunk)?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    fn finish<P>(self, table: &mut P) -> Result<CommittedImage, UpdateError>
    where
        P: PartitionTable<Handle = H>,
    {
        if self.bytes_written != self.expected_size {
            table.abort(self.handle);
            return Err(UpdateError::SizeMismatch {
                expected: self.expected_size,
                written: self.bytes_written,
            });
        }
        table.end(self.handle).map_err(UpdateError::Finalize)?;
        Ok(CommittedImage::new(self.partition, self.bytes_written))
    }

    fn abort<P>(self, table: &mut P)
    where
        P: PartitionTable<Handle = H>,
    {
        table.abort(self.handle);
    }
}

/// Drives a single update attempt.
#[derive(Debug)]
pub struct UpdateWriter {
    state: UpdateState,
    history: Vec<UpdatePhase, MAX_STATE_HISTORY>,
}

impl UpdateWriter {
    pub const fn new() -> Self {
        Self {
            state: UpdateState::Idle,
            history: Vec::new(),
        }
    }

    pub const fn state(&self) -> UpdateState {
        self.state
    }

    /// Phases entered so far, oldest first.
    pub fn history(&self) -> &[UpdatePhase] {
        &self.history
    }

    /// Updates the state machine, validating the requested transition.
    pub fn set_state(&mut self, next: UpdateState) -> Result<(), TransitionError> {
        let (from, to) = (self.state.phase(), next.phase());
        if !transition_allowed(from, to) {
            return Err(TransitionError::new(from, to));
        }
        if from != to {
            // History is diagnostic only; once full, later phases are dropped.
            let _ = self.history.push(to);
        }
        self.state = next;
        Ok(())
    }

    /// Streams `image_path` into the inactive partition and finalizes it.
    ///
    /// The source is read in [`CHUNK_SIZE`] pieces until a read returns zero
    /// bytes; the written total must then equal the size reported by `stat`.
    /// On any failure the partition handle is released, the active partition
    /// is left untouched, and the writer ends in [`UpdateState::Aborted`].
    pub fn run<F, P, S>(
        &mut self,
        fs: &mut F,
        table: &mut P,
        image_path: &str,
        sink: &mut S,
    ) -> Result<CommittedImage, UpdateError>
    where
        F: Filesystem,
        P: PartitionTable,
        S: TelemetrySink,
    {
        match self.stream(fs, table, image_path, sink) {
            Ok(image) => {
                sink.record(
                    UpdateEventKind::UpdateCommitted,
                    TelemetryPayload::Committed {
                        partition: image.partition(),
                        bytes_written: image.len(),
                    },
                );
                Ok(image)
            }
            Err(err) => {
                // Aborted is reachable from every non-terminal phase.
                let _ = self.set_state(UpdateState::Aborted(err));
                sink.record(UpdateEventKind::UpdateAborted, TelemetryPayload::Aborted(err));
                Err(err)
            }
        }
    }

    /// Stats the image and moves to [`UpdateState::Checked`].
    pub fn check_image<F>(&mut self, fs: &mut F, image_path: &str) -> Result<u64, UpdateError>
    where
        F: Filesystem,
    {
        let metadata = match fs.metadata(image_path) {
            Ok(metadata) => metadata,
            Err(FsError::NotFound) => return Err(UpdateError::ImageNotFound),
            Err(err) => return Err(UpdateError::Storage(err)),
        };
        if !metadata.is_file() {
            return Err(UpdateError::ImageIsDirectory);
        }

        self.set_state(UpdateState::Checked {
            expected_size: metadata.len,
        })
        .map_err(UpdateError::Transition)?;
        Ok(metadata.len)
    }

    fn stream<F, P, S>(
        &mut self,
        fs: &mut F,
        table: &mut P,
        image_path: &str,
        sink: &mut S,
    ) -> Result<CommittedImage, UpdateError>
    where
        F: Filesystem,
        P: PartitionTable,
        S: TelemetrySink,
    {
        let expected_size = self.check_image(fs, image_path)?;
        sink.record(
            UpdateEventKind::ImageChecked,
            TelemetryPayload::Image { expected_size },
        );

        let partition = table
            .next_update_partition()
            .ok_or(UpdateError::NoUpdatePartition)?;
        let handle = table.begin(partition).map_err(UpdateError::Partition)?;
        let mut session = UpdateSession::new(handle, partition, expected_size);

        if let Err(err) = self.set_state(UpdateState::Writing {
            partition,
            bytes_written: 0,
            expected_size,
        }) {
            session.abort(table);
            return Err(UpdateError::Transition(err));
        }
        sink.record(
            UpdateEventKind::TransferStarted,
            TelemetryPayload::Transfer {
                partition,
                expected_size,
            },
        );

        if let Err(err) = self.pump(fs, table, &mut session, image_path) {
            session.abort(table);
            return Err(err);
        }

        let image = session.finish(table)?;
        self.set_state(UpdateState::Committed {
            partition: image.partition(),
            bytes_written: image.len(),
        })
        .map_err(UpdateError::Transition)?;
        Ok(image)
    }

    fn pump<F, P>(
        &mut self,
        fs: &mut F,
        table: &mut P,
        session: &mut UpdateSession<P::Handle>,
        image_path: &str,
    ) -> Result<(), UpdateError>
    where
        F: Filesystem,
        P: PartitionTable,
    {
        let mut file = fs.open(image_path).map_err(UpdateError::ImageRead)?;
        let mut chunk = [0u8; CHUNK_SIZE];

        let streamed = loop {
            let read = match fs.read(&mut file, &mut chunk) {
                Ok(0) => break Ok(()),
                Ok(read) => read,
                Err(err) => break Err(UpdateError::ImageRead(err)),
            };
            if let Err(err) = session.write(table, &chunk[..read]) {
                break Err(UpdateError::Write(err));
            }
            // Writing -> Writing is always allowed.
            let _ = self.set_state(UpdateState::Writing {
                partition: session.partition(),
                bytes_written: session.bytes_written(),
                expected_size: session.expected_size(),
            });
        };

        let closed = fs.close(file).map_err(UpdateError::ImageRead);
        streamed.and(closed)
    }
}

impl Default for UpdateWriter {
    fn default() -> Self {
        Self::new()
    }
}
