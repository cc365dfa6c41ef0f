#![no_std]

// Shared logic for the removable-storage firmware updater.
//
// Everything here stays portable across the MCU firmware and the host emulator:
// storage, flash partitions, and telemetry are reached through traits so the
// same boot cycle runs against embedded-sdmmc on the device and against plain
// files on a workstation.

pub mod activation;
pub mod config;
pub mod heartbeat;
pub mod image;
pub mod orchestrator;
pub mod partition;
pub mod selftest;
pub mod storage;
pub mod telemetry;
pub mod trigger;
pub mod update;
