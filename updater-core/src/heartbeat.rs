//! Idle heartbeat pattern.

use core::time::Duration;

use crate::config::DEFAULT_HEARTBEAT_PERIOD;

/// Indicator level for the current half period.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeartbeatPhase {
    On,
    Off,
}

impl HeartbeatPhase {
    /// Glyph printed by console indicators.
    pub const fn glyph(self) -> char {
        match self {
            HeartbeatPhase::On => '.',
            HeartbeatPhase::Off => '-',
        }
    }
}

/// Alternates on/off with a fixed half period.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Heartbeat {
    phase: HeartbeatPhase,
    period: Duration,
    ticks: u32,
}

impl Heartbeat {
    /// Starts in [`HeartbeatPhase::On`].
    pub const fn new(period: Duration) -> Self {
        Self {
            phase: HeartbeatPhase::On,
            period,
            ticks: 0,
        }
    }

    pub const fn phase(&self) -> HeartbeatPhase {
        self.phase
    }

    /// Time to hold the current phase.
    pub const fn period(&self) -> Duration {
        self.period
    }

    pub const fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Advances to the next phase and returns it.
    pub fn tick(&mut self) -> HeartbeatPhase {
        self.phase = match self.phase {
            HeartbeatPhase::On => HeartbeatPhase::Off,
            HeartbeatPhase::Off => HeartbeatPhase::On,
        };
        self.ticks = self.ticks.wrapping_add(1);
        self.phase
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_PERIOD)
    }
}
