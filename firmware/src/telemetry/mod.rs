//! Telemetry ring and log mirroring for the firmware target.
//!
//! Boot-cycle events land in the shared [`TelemetryRecorder`] and are mirrored
//! to defmt (or stdout on the host) as they happen, so a probe attached over
//! RTT sees the same trail the ring keeps for later inspection.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use core::time::Duration;

use embassy_time::Instant;
use updater_core::telemetry::{
    EventId, TelemetryInstant, TelemetryPayload, TelemetryRecord, TelemetryRecorder,
    TelemetrySink, UpdateEventKind,
};

/// Monotonic timestamp backed by the embassy time driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct FirmwareInstant(Instant);

impl FirmwareInstant {
    #[cfg(target_os = "none")]
    pub fn now() -> Self {
        Self(Instant::now())
    }

    pub const fn into_embassy(self) -> Instant {
        self.0
    }
}

impl From<Instant> for FirmwareInstant {
    fn from(value: Instant) -> Self {
        Self(value)
    }
}

impl TelemetryInstant for FirmwareInstant {
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        let micros = self
            .0
            .checked_duration_since(earlier.0)
            .map_or(0, |elapsed| elapsed.as_micros());
        Duration::from_micros(micros)
    }
}

pub type FirmwareRecorder = TelemetryRecorder<FirmwareInstant>;

/// [`TelemetrySink`] that stores events in a recorder and logs each one.
pub struct FirmwareSink<'a> {
    recorder: &'a mut FirmwareRecorder,
    clock: fn() -> FirmwareInstant,
}

impl<'a> FirmwareSink<'a> {
    pub fn new(recorder: &'a mut FirmwareRecorder, clock: fn() -> FirmwareInstant) -> Self {
        Self { recorder, clock }
    }

    pub fn recorder(&self) -> &FirmwareRecorder {
        self.recorder
    }
}

impl TelemetrySink for FirmwareSink<'_> {
    fn record(&mut self, event: UpdateEventKind, payload: TelemetryPayload) -> EventId {
        let timestamp = (self.clock)();
        let id = self.recorder.record(event, payload, timestamp);
        if let Some(record) = self.recorder.latest() {
            log_record(record);
        }
        id
    }

    fn note(&mut self, event: UpdateEventKind, text: &str) {
        emit_note(event, text);
    }
}

fn log_record(record: &TelemetryRecord<FirmwareInstant>) {
    let timestamp_us = record.timestamp.into_embassy().as_micros();
    let delta_us = record
        .elapsed_since_previous
        .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    emit_log(record, timestamp_us, delta_us);
}

#[cfg(target_os = "none")]
fn emit_log(record: &TelemetryRecord<FirmwareInstant>, timestamp_us: u64, delta_us: Option<u64>) {
    let event = defmt::Display2Format(&record.event);
    let details = defmt::Debug2Format(&record.details);
    match (record.event.is_failure(), delta_us) {
        (true, Some(delta)) => {
            defmt::warn!("telemetry:{} {} t={}us Δ={}us", event, details, timestamp_us, delta);
        }
        (true, None) => defmt::warn!("telemetry:{} {} t={}us", event, details, timestamp_us),
        (false, Some(delta)) => {
            defmt::info!("telemetry:{} {} t={}us Δ={}us", event, details, timestamp_us, delta);
        }
        (false, None) => defmt::info!("telemetry:{} {} t={}us", event, details, timestamp_us),
    }
}

#[cfg(not(target_os = "none"))]
fn emit_log(record: &TelemetryRecord<FirmwareInstant>, timestamp_us: u64, delta_us: Option<u64>) {
    if let Some(delta) = delta_us {
        println!(
            "telemetry:{} {:?} t={}us Δ={}us",
            record.event, record.details, timestamp_us, delta
        );
    } else {
        println!(
            "telemetry:{} {:?} t={}us",
            record.event, record.details, timestamp_us
        );
    }
}

#[cfg(target_os = "none")]
fn emit_note(event: UpdateEventKind, text: &str) {
    defmt::info!("{}: {}", defmt::Display2Format(&event), text);
}

#[cfg(not(target_os = "none"))]
fn emit_note(event: UpdateEventKind, text: &str) {
    println!("{event}: {text}");
}
