//! Telemetry event catalog and payload structures shared by firmware and host targets.
//!
//! The boot cycle reports every decision through a [`TelemetrySink`]. Event
//! kinds encode to compact numeric codes so the firmware can log them cheaply
//! over defmt, while payloads keep the typed error detail for the emulator's
//! transcripts. Correctness never depends on a sink; [`NoopSink`] drops
//! everything.

use core::{fmt, time::Duration};

use heapless::{HistoryBuf, OldestOrdered};

use crate::partition::{ActivationError, PartitionId};
use crate::selftest::SelfTestError;
use crate::storage::{EntryKind, FsError, MountError};
use crate::trigger::TriggerError;
use crate::update::UpdateError;

/// Identifier used when tracking emitted telemetry events.
pub type EventId = u32;

/// Discriminated telemetry events emitted during a boot cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateEventKind {
    Mounted,
    MountFailed,
    SelfTestPassed,
    SelfTestFailed,
    DirectoryEntry,
    ListingFailed,
    TriggerDetected,
    TriggerAbsent,
    TriggerFailed,
    ImageChecked,
    TransferStarted,
    UpdateCommitted,
    UpdateAborted,
    PartitionActivated,
    ActivationFailed,
    Unmounted,
    RestartRequested,
    IdleEntered,
    Custom(u16),
}

impl fmt::Display for UpdateEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateEventKind::Mounted => "mounted",
            UpdateEventKind::MountFailed => "mount-failed",
            UpdateEventKind::SelfTestPassed => "self-test-passed",
            UpdateEventKind::SelfTestFailed => "self-test-failed",
            UpdateEventKind::DirectoryEntry => "directory-entry",
            UpdateEventKind::ListingFailed => "listing-failed",
            UpdateEventKind::TriggerDetected => "trigger-detected",
            UpdateEventKind::TriggerAbsent => "trigger-absent",
            UpdateEventKind::TriggerFailed => "trigger-failed",
            UpdateEventKind::ImageChecked => "image-checked",
            UpdateEventKind::TransferStarted => "transfer-started",
            UpdateEventKind::UpdateCommitted => "update-committed",
            UpdateEventKind::UpdateAborted => "update-aborted",
            UpdateEventKind::PartitionActivated => "partition-activated",
            UpdateEventKind::ActivationFailed => "activation-failed",
            UpdateEventKind::Unmounted => "unmounted",
            UpdateEventKind::RestartRequested => "restart-requested",
            UpdateEventKind::IdleEntered => "idle-entered",
            UpdateEventKind::Custom(code) => return write!(f, "custom({code})"),
        };
        f.write_str(name)
    }
}

impl UpdateEventKind {
    const CATALOG: [UpdateEventKind; 18] = [
        UpdateEventKind::Mounted,
        UpdateEventKind::MountFailed,
        UpdateEventKind::SelfTestPassed,
        UpdateEventKind::SelfTestFailed,
        UpdateEventKind::DirectoryEntry,
        UpdateEventKind::ListingFailed,
        UpdateEventKind::TriggerDetected,
        UpdateEventKind::TriggerAbsent,
        UpdateEventKind::TriggerFailed,
        UpdateEventKind::ImageChecked,
        UpdateEventKind::TransferStarted,
        UpdateEventKind::UpdateCommitted,
        UpdateEventKind::UpdateAborted,
        UpdateEventKind::PartitionActivated,
        UpdateEventKind::ActivationFailed,
        UpdateEventKind::Unmounted,
        UpdateEventKind::RestartRequested,
        UpdateEventKind::IdleEntered,
    ];

    const STORAGE_BASE: u16 = 0x0100;
    const TRIGGER_BASE: u16 = 0x0200;
    const UPDATE_BASE: u16 = 0x0300;
    const BOOT_BASE: u16 = 0x0400;

    /// Encodes the event into a compact transport-friendly discriminant.
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            UpdateEventKind::Mounted => Self::STORAGE_BASE,
            UpdateEventKind::MountFailed => Self::STORAGE_BASE + 1,
            UpdateEventKind::SelfTestPassed => Self::STORAGE_BASE + 2,
            UpdateEventKind::SelfTestFailed => Self::STORAGE_BASE + 3,
            UpdateEventKind::DirectoryEntry => Self::STORAGE_BASE + 4,
            UpdateEventKind::Unmounted => Self::STORAGE_BASE + 5,
            UpdateEventKind::ListingFailed => Self::STORAGE_BASE + 6,
            UpdateEventKind::TriggerDetected => Self::TRIGGER_BASE,
            UpdateEventKind::TriggerAbsent => Self::TRIGGER_BASE + 1,
            UpdateEventKind::TriggerFailed => Self::TRIGGER_BASE + 2,
            UpdateEventKind::ImageChecked => Self::UPDATE_BASE,
            UpdateEventKind::TransferStarted => Self::UPDATE_BASE + 1,
            UpdateEventKind::UpdateCommitted => Self::UPDATE_BASE + 2,
            UpdateEventKind::UpdateAborted => Self::UPDATE_BASE + 3,
            UpdateEventKind::PartitionActivated => Self::BOOT_BASE,
            UpdateEventKind::ActivationFailed => Self::BOOT_BASE + 1,
            UpdateEventKind::RestartRequested => Self::BOOT_BASE + 2,
            UpdateEventKind::IdleEntered => Self::BOOT_BASE + 3,
            UpdateEventKind::Custom(code) => code,
        }
    }

    /// Decodes a raw discriminant, falling back to [`UpdateEventKind::Custom`].
    #[must_use]
    pub fn from_raw(code: u16) -> Self {
        Self::CATALOG
            .iter()
            .copied()
            .find(|kind| kind.to_raw() == code)
            .unwrap_or(UpdateEventKind::Custom(code))
    }

    /// Returns `true` for events describing a failure.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            UpdateEventKind::MountFailed
                | UpdateEventKind::SelfTestFailed
                | UpdateEventKind::ListingFailed
                | UpdateEventKind::TriggerFailed
                | UpdateEventKind::UpdateAborted
                | UpdateEventKind::ActivationFailed
        )
    }
}

/// Payloads carried alongside telemetry events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TelemetryPayload {
    /// No additional metadata accompanies the event.
    None,
    Mount {
        formatted: bool,
    },
    MountFailed(MountError),
    SelfTestFailed(SelfTestError),
    Entry {
        kind: EntryKind,
        len: u64,
    },
    ListingFailed(FsError),
    TriggerFailed(TriggerError),
    Image {
        expected_size: u64,
    },
    Transfer {
        partition: PartitionId,
        expected_size: u64,
    },
    Committed {
        partition: PartitionId,
        bytes_written: u64,
    },
    Aborted(UpdateError),
    Partition(PartitionId),
    ActivationFailed(ActivationError),
}

impl TelemetryPayload {
    /// Convenience constructor when no payload data is needed.
    #[must_use]
    pub const fn none() -> Self {
        TelemetryPayload::None
    }
}

/// Destination for boot-cycle telemetry.
pub trait TelemetrySink {
    /// Records a structured event.
    fn record(&mut self, event: UpdateEventKind, payload: TelemetryPayload) -> EventId;

    /// Attaches free-form text to an event (probe line, listing path).
    fn note(&mut self, _event: UpdateEventKind, _text: &str) {}
}

/// Sink that discards every event.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record(&mut self, _: UpdateEventKind, _: TelemetryPayload) -> EventId {
        0
    }
}

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Trait implemented by monotonic instant wrappers used for telemetry tracking.
pub trait TelemetryInstant: Copy {
    /// Returns the saturating duration from `earlier` to `self`.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord<TInstant>
where
    TInstant: Copy,
{
    pub id: EventId,
    pub timestamp: TInstant,
    pub event: UpdateEventKind,
    pub details: TelemetryPayload,
    pub elapsed_since_previous: Option<Duration>,
}

/// Telemetry ring buffer type alias.
pub type TelemetryRing<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord<TInstant>, CAPACITY>;

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<TInstant, const CAPACITY: usize = TELEMETRY_RING_CAPACITY>
where
    TInstant: Copy,
{
    ring: TelemetryRing<TInstant, CAPACITY>,
    last_recorded_at: Option<TInstant>,
    next_event_id: EventId,
}

impl<TInstant, const CAPACITY: usize> TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            last_recorded_at: None,
            next_event_id: 0,
        }
    }

    /// Records an event and the time elapsed since the previous one.
    pub fn record(
        &mut self,
        event: UpdateEventKind,
        payload: TelemetryPayload,
        timestamp: TInstant,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        let elapsed = self
            .last_recorded_at
            .map(|previous| timestamp.saturating_duration_since(previous));
        self.last_recorded_at = Some(timestamp);

        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            event,
            details: payload,
            elapsed_since_previous: elapsed,
        });

        id
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord<TInstant>> {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent telemetry record, if available.
    pub fn latest(&self) -> Option<&TelemetryRecord<TInstant>> {
        self.ring.recent()
    }

    /// Returns the number of records currently stored.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no telemetry records are stored.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl<TInstant, const CAPACITY: usize> Default for TelemetryRecorder<TInstant, CAPACITY>
where
    TInstant: Copy + TelemetryInstant,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
    struct MicrosInstant(u64);

    impl TelemetryInstant for MicrosInstant {
        fn saturating_duration_since(&self, earlier: Self) -> Duration {
            Duration::from_micros(self.0.saturating_sub(earlier.0))
        }
    }

    #[test]
    fn event_codes_round_trip() {
        for kind in UpdateEventKind::CATALOG {
            assert_eq!(UpdateEventKind::from_raw(kind.to_raw()), kind);
        }
        assert_eq!(
            UpdateEventKind::from_raw(0xBEEF),
            UpdateEventKind::Custom(0xBEEF)
        );
    }

    #[test]
    fn event_codes_are_unique() {
        for (index, kind) in UpdateEventKind::CATALOG.iter().enumerate() {
            for other in &UpdateEventKind::CATALOG[index + 1..] {
                assert_ne!(kind.to_raw(), other.to_raw(), "{kind} collides with {other}");
            }
        }
    }

    #[test]
    fn records_elapsed_between_events() {
        let mut recorder = TelemetryRecorder::<MicrosInstant>::new();

        let first = recorder.record(
            UpdateEventKind::Mounted,
            TelemetryPayload::Mount { formatted: false },
            MicrosInstant(100),
        );
        assert_eq!(first, 0);
        assert_eq!(recorder.latest().unwrap().elapsed_since_previous, None);

        let second = recorder.record(
            UpdateEventKind::SelfTestPassed,
            TelemetryPayload::none(),
            MicrosInstant(350),
        );
        assert_eq!(second, 1);

        let elapsed = recorder
            .latest()
            .and_then(|record| record.elapsed_since_previous)
            .expect("missing elapsed");
        assert_eq!(elapsed.as_micros(), 250);
    }

    #[test]
    fn ring_keeps_most_recent_records() {
        let mut recorder = TelemetryRecorder::<MicrosInstant, 4>::new();
        for tick in 0..6 {
            recorder.record(
                UpdateEventKind::DirectoryEntry,
                TelemetryPayload::none(),
                MicrosInstant(tick),
            );
        }

        assert_eq!(recorder.len(), 4);
        let ids: heapless::Vec<EventId, 4> = recorder.oldest_first().map(|record| record.id).collect();
        assert_eq!(ids.as_slice(), &[2, 3, 4, 5]);
    }
}
