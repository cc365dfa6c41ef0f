#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

mod status;
mod telemetry;

#[cfg(target_os = "none")]
mod flash;
#[cfg(target_os = "none")]
mod panic;
#[cfg(target_os = "none")]
mod runtime;
#[cfg(target_os = "none")]
mod sdcard;

#[cfg(not(target_os = "none"))]
fn main() {}
