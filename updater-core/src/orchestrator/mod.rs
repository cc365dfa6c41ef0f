//! One boot cycle of the updater.
//!
//! [`UpdateOrchestrator::run_boot_cycle`] mounts storage, runs the self-test,
//! reports a diagnostic listing, consumes the trigger, streams the image, and
//! activates it. The storage session is unmounted on every path before the
//! decision is returned. The caller acts on the [`BootDecision`]: restart the
//! device, or enter the idle heartbeat. Nothing here blocks on time; the boot
//! delay and heartbeat period belong to the platform.

use core::fmt::{self, Write as _};

use heapless::String;

use crate::activation;
use crate::config::UpdaterConfig;
use crate::partition::{ActivationError, PartitionId, PartitionTable};
use crate::selftest::{SelfTestError, run_self_test};
use crate::storage::listing::walk;
use crate::storage::{MAX_PATH_LEN, MountError, StorageDevice, StorageSession};
use crate::telemetry::{TelemetryPayload, TelemetrySink, UpdateEventKind};
use crate::trigger::{TriggerError, check_and_consume_trigger};
use crate::update::{UpdateError, UpdateWriter};

/// Longest note emitted for a listing entry (`"f /sdcard/..."`).
const LISTING_NOTE_LEN: usize = MAX_PATH_LEN + 16;

/// Why the cycle ended without an update.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IdleReason {
    NoTrigger,
    MountFailed(MountError),
    SelfTestFailed(SelfTestError),
    TriggerFailed(TriggerError),
    UpdateAborted(UpdateError),
}

impl fmt::Display for IdleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleReason::NoTrigger => f.write_str("no update pending"),
            IdleReason::MountFailed(err) => write!(f, "mount failed: {err}"),
            IdleReason::SelfTestFailed(err) => write!(f, "self-test failed: {err}"),
            IdleReason::TriggerFailed(err) => write!(f, "trigger failed: {err}"),
            IdleReason::UpdateAborted(err) => write!(f, "update aborted: {err}"),
        }
    }
}

/// Why the device must restart.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RestartReason {
    /// The new image is the boot target.
    Activated {
        partition: PartitionId,
        image_len: u64,
    },
    /// The image was committed but the switch failed; the previous target
    /// stays selected.
    ActivationFailed(ActivationError),
}

/// Outcome of one boot cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootDecision {
    Idle(IdleReason),
    Restart(RestartReason),
}

impl BootDecision {
    pub const fn is_restart(&self) -> bool {
        matches!(self, BootDecision::Restart(_))
    }
}

/// Owns the storage device and partition table across boot cycles.
pub struct UpdateOrchestrator<D, P>
where
    D: StorageDevice,
    P: PartitionTable,
{
    device: D,
    partitions: P,
    config: UpdaterConfig,
}

impl<D, P> UpdateOrchestrator<D, P>
where
    D: StorageDevice,
    P: PartitionTable,
{
    pub const fn new(device: D, partitions: P, config: UpdaterConfig) -> Self {
        Self {
            device,
            partitions,
            config,
        }
    }

    pub const fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn device(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn partitions(&mut self) -> &mut P {
        &mut self.partitions
    }

    pub fn into_parts(self) -> (D, P) {
        (self.device, self.partitions)
    }

    /// Runs mount → self-test → trigger → update → activate.
    pub fn run_boot_cycle<S>(&mut self, sink: &mut S) -> BootDecision
    where
        S: TelemetrySink,
    {
        let config = self.config;

        let mut session = match StorageSession::mount(&mut self.device, &config.mount) {
            Ok(session) => session,
            Err(err) => {
                sink.record(
                    UpdateEventKind::MountFailed,
                    TelemetryPayload::MountFailed(err),
                );
                return enter_idle(sink, IdleReason::MountFailed(err));
            }
        };
        sink.record(
            UpdateEventKind::Mounted,
            TelemetryPayload::Mount {
                formatted: session.was_formatted(),
            },
        );

        match run_self_test(&mut session, &config.paths) {
            Ok(report) => {
                sink.record(UpdateEventKind::SelfTestPassed, TelemetryPayload::none());
                sink.note(UpdateEventKind::SelfTestPassed, &report.line);
            }
            Err(err) => {
                sink.record(
                    UpdateEventKind::SelfTestFailed,
                    TelemetryPayload::SelfTestFailed(err),
                );
                close_session(&mut session, sink);
                return enter_idle(sink, IdleReason::SelfTestFailed(err));
            }
        }

        if config.listing_depth > 0 {
            report_listing(&mut session, config.listing_depth, sink);
        }

        match check_and_consume_trigger(&mut session, config.paths.trigger) {
            Ok(true) => {
                sink.record(UpdateEventKind::TriggerDetected, TelemetryPayload::none());
            }
            Ok(false) => {
                sink.record(UpdateEventKind::TriggerAbsent, TelemetryPayload::none());
                close_session(&mut session, sink);
                return enter_idle(sink, IdleReason::NoTrigger);
            }
            Err(err) => {
                sink.record(
                    UpdateEventKind::TriggerFailed,
                    TelemetryPayload::TriggerFailed(err),
                );
                close_session(&mut session, sink);
                return enter_idle(sink, IdleReason::TriggerFailed(err));
            }
        }

        let mut writer = UpdateWriter::new();
        let committed = match session.fs() {
            Ok(fs) => writer.run(fs, &mut self.partitions, config.paths.image, sink),
            Err(err) => Err(UpdateError::Storage(err)),
        };
        let image = match committed {
            Ok(image) => image,
            Err(err) => {
                close_session(&mut session, sink);
                return enter_idle(sink, IdleReason::UpdateAborted(err));
            }
        };

        let reason = match activation::activate(&mut self.partitions, image) {
            Ok(partition) => {
                sink.record(
                    UpdateEventKind::PartitionActivated,
                    TelemetryPayload::Partition(partition),
                );
                RestartReason::Activated {
                    partition,
                    image_len: image.len(),
                }
            }
            Err(err) => {
                sink.record(
                    UpdateEventKind::ActivationFailed,
                    TelemetryPayload::ActivationFailed(err),
                );
                RestartReason::ActivationFailed(err)
            }
        };

        close_session(&mut session, sink);
        sink.record(UpdateEventKind::RestartRequested, TelemetryPayload::none());
        BootDecision::Restart(reason)
    }
}

fn close_session<D, S>(session: &mut StorageSession<'_, D>, sink: &mut S)
where
    D: StorageDevice,
    S: TelemetrySink,
{
    if session.unmount() {
        sink.record(UpdateEventKind::Unmounted, TelemetryPayload::none());
    }
}

fn enter_idle<S>(sink: &mut S, reason: IdleReason) -> BootDecision
where
    S: TelemetrySink,
{
    sink.record(UpdateEventKind::IdleEntered, TelemetryPayload::none());
    BootDecision::Idle(reason)
}

/// Reports entries under the mount root. A failed walk is reported but never
/// changes the boot decision.
fn report_listing<D, S>(session: &mut StorageSession<'_, D>, depth: u8, sink: &mut S)
where
    D: StorageDevice,
    S: TelemetrySink,
{
    let mount_point = session.mount_point();
    let walked = session.fs().and_then(|fs| {
        walk(fs, "/", depth, &mut |path, entry| {
            sink.record(
                UpdateEventKind::DirectoryEntry,
                TelemetryPayload::Entry {
                    kind: entry.kind,
                    len: entry.len,
                },
            );
            let mut note: String<LISTING_NOTE_LEN> = String::new();
            if write!(note, "{} {mount_point}{path}", entry.kind.tag()).is_ok() {
                sink.note(UpdateEventKind::DirectoryEntry, &note);
            }
        })
    });

    if let Err(err) = walked {
        sink.record(
            UpdateEventKind::ListingFailed,
            TelemetryPayload::ListingFailed(err),
        );
        let mut note: String<LISTING_NOTE_LEN> = String::new();
        if write!(note, "listing of {mount_point} cut short: {err}").is_ok() {
            sink.note(UpdateEventKind::ListingFailed, &note);
        }
    }
}
