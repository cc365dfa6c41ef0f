use embassy_stm32::gpio::Output;
use embassy_time::Timer;
use updater_core::heartbeat::{Heartbeat, HeartbeatPhase};

use super::embassy_duration;
use crate::status;

/// Blinks the status LED forever.
pub async fn run(mut led: Output<'static>, mut heartbeat: Heartbeat) -> ! {
    loop {
        match heartbeat.phase() {
            HeartbeatPhase::On => led.set_high(),
            HeartbeatPhase::Off => led.set_low(),
        }
        status::record_heartbeat(heartbeat.ticks());
        defmt::trace!(
            "heartbeat {} {}",
            heartbeat.phase().glyph(),
            defmt::Debug2Format(&status::snapshot())
        );
        Timer::after(embassy_duration(heartbeat.period())).await;
        heartbeat.tick();
    }
}
