use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::gpio::{Level, Output, Speed};
use embassy_time::Timer;
use static_cell::StaticCell;
use updater_core::activation::{self, SystemReset};
use updater_core::config::UpdaterConfig;
use updater_core::heartbeat::Heartbeat;
use updater_core::orchestrator::{BootDecision, UpdateOrchestrator};

use crate::flash;
use crate::sdcard::SdStorage;
use crate::status;
use crate::telemetry::{FirmwareInstant, FirmwareRecorder, FirmwareSink};

mod heartbeat_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

/// Restarts through an option byte reload so a new bank mapping applies.
struct OptionReloadReset;

impl SystemReset for OptionReloadReset {
    fn restart(&mut self) -> ! {
        flash::reload_options_and_reset()
    }
}

static TELEMETRY: StaticCell<FirmwareRecorder> = StaticCell::new();

pub(crate) fn embassy_duration(duration: core::time::Duration) -> embassy_time::Duration {
    embassy_time::Duration::from_micros(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
}

#[embassy_executor::main]
pub async fn main(_spawner: Spawner) {
    let config = UpdaterConfig::default();
    let hal::Peripherals {
        SPI1,
        PA4,
        PA5,
        PA6,
        PA7,
        PB3,
        FLASH,
        ..
    } = hal::init(hal::Config::default());

    let led = Output::new(PB3, Level::Low, Speed::Low);
    let heartbeat = Heartbeat::new(config.heartbeat_period);

    defmt::info!(
        "sd-ota: boot cycle starts in {}ms",
        u64::try_from(config.boot_delay.as_millis()).unwrap_or(u64::MAX)
    );
    Timer::after(embassy_duration(config.boot_delay)).await;

    let partitions = match flash::partitions(FLASH) {
        Ok(partitions) => partitions,
        Err(err) => {
            defmt::error!("sd-ota: flash unusable: {}", defmt::Display2Format(&err));
            heartbeat_task::run(led, heartbeat).await
        }
    };
    let storage = SdStorage::new(SPI1, PA5, PA7, PA6, PA4);
    let mut orchestrator = UpdateOrchestrator::new(storage, partitions, config);

    let recorder = TELEMETRY.init(FirmwareRecorder::new());
    let mut sink = FirmwareSink::new(recorder, FirmwareInstant::now);
    let decision = orchestrator.run_boot_cycle(&mut sink);
    status::record_decision(&decision);

    match decision {
        BootDecision::Restart(reason) => {
            defmt::info!("sd-ota: restarting ({})", defmt::Debug2Format(&reason));
            activation::restart(&mut OptionReloadReset)
        }
        BootDecision::Idle(reason) => {
            defmt::info!("sd-ota: idle: {}", defmt::Display2Format(&reason));
            heartbeat_task::run(led, heartbeat).await
        }
    }
}
