#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Shared status storage for the firmware target.
//!
//! The boot cycle publishes its decision here and the heartbeat loop bumps a
//! tick counter, so a debugger (or a later console) can read a
//! [`StatusSnapshot`] without reaching into the runtime's locals.

use portable_atomic::{AtomicU8, AtomicU32, Ordering};
use updater_core::orchestrator::{BootDecision, RestartReason};

const DECISION_PENDING: u8 = 0;
const DECISION_IDLE: u8 = 1;
const DECISION_RESTART: u8 = 2;

/// Raw code of the last boot decision.
static DECISION: AtomicU8 = AtomicU8::new(DECISION_PENDING);
/// Length (+1) of the image that was activated; 0 when nothing was.
static ACTIVATED_LEN: AtomicU32 = AtomicU32::new(0);
/// Heartbeat half periods elapsed since entering idle.
static HEARTBEAT_TICKS: AtomicU32 = AtomicU32::new(0);

/// Coarse outcome of the boot cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecisionState {
    Pending,
    Idle,
    Restarting,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StatusSnapshot {
    pub decision: DecisionState,
    pub activated_len: Option<u32>,
    pub heartbeat_ticks: u32,
}

const fn encode_decision(decision: &BootDecision) -> u8 {
    match decision {
        BootDecision::Idle(_) => DECISION_IDLE,
        BootDecision::Restart(_) => DECISION_RESTART,
    }
}

const fn decode_decision(raw: u8) -> DecisionState {
    match raw {
        DECISION_IDLE => DecisionState::Idle,
        DECISION_RESTART => DecisionState::Restarting,
        _ => DecisionState::Pending,
    }
}

fn encode_len(decision: &BootDecision) -> u32 {
    match decision {
        BootDecision::Restart(RestartReason::Activated { image_len, .. }) => {
            u32::try_from(*image_len).map_or(u32::MAX, |len| len.saturating_add(1))
        }
        _ => 0,
    }
}

fn decode_len(raw: u32) -> Option<u32> {
    raw.checked_sub(1)
}

/// Publishes the outcome of the boot cycle.
pub fn record_decision(decision: &BootDecision) {
    ACTIVATED_LEN.store(encode_len(decision), Ordering::Relaxed);
    DECISION.store(encode_decision(decision), Ordering::Relaxed);
}

/// Stores the heartbeat tick count.
pub fn record_heartbeat(ticks: u32) {
    HEARTBEAT_TICKS.store(ticks, Ordering::Relaxed);
}

/// Builds a [`StatusSnapshot`] from the stored values.
pub fn snapshot() -> StatusSnapshot {
    StatusSnapshot {
        decision: decode_decision(DECISION.load(Ordering::Relaxed)),
        activated_len: decode_len(ACTIVATED_LEN.load(Ordering::Relaxed)),
        heartbeat_ticks: HEARTBEAT_TICKS.load(Ordering::Relaxed),
    }
}
