//! Boot-time configuration shared by firmware and host targets.
//!
//! All values are `Copy` and const-constructible so the firmware can keep its
//! configuration in flash while the emulator overrides individual fields from
//! the command line.

use core::time::Duration;

/// Mount point reported in diagnostics.
pub const DEFAULT_MOUNT_POINT: &str = "/sdcard";

/// Maximum number of files the filesystem may hold open concurrently.
pub const DEFAULT_MAX_OPEN_FILES: u8 = 5;

/// FAT allocation unit used when the card has to be formatted.
pub const DEFAULT_ALLOCATION_UNIT_SIZE: u32 = 16 * 1024;

/// Delay between reset and the first storage access.
pub const DEFAULT_BOOT_DELAY: Duration = Duration::from_secs(5);

/// Half period of the idle heartbeat.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Parameters handed to the storage device when mounting.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MountConfig {
    pub mount_point: &'static str,
    /// Reformat and retry once when the filesystem is missing or corrupt.
    pub format_if_mount_failed: bool,
    pub max_open_files: u8,
    pub allocation_unit_size: u32,
}

impl MountConfig {
    /// Creates the default mount configuration (no reformat on failure).
    pub const fn new() -> Self {
        Self {
            mount_point: DEFAULT_MOUNT_POINT,
            format_if_mount_failed: false,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            allocation_unit_size: DEFAULT_ALLOCATION_UNIT_SIZE,
        }
    }

    /// Returns a copy with the reformat policy replaced.
    #[must_use]
    pub const fn with_format_if_mount_failed(mut self, enabled: bool) -> Self {
        self.format_if_mount_failed = enabled;
        self
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Well-known paths, relative to the mount point.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UpdatePaths {
    pub probe_source: &'static str,
    pub probe_destination: &'static str,
    pub trigger: &'static str,
    pub image: &'static str,
}

impl UpdatePaths {
    pub const fn new() -> Self {
        Self {
            probe_source: "/test/hello.txt",
            probe_destination: "/test/foo.txt",
            trigger: "/boot_cnt",
            image: "/firmware/update.bin",
        }
    }
}

impl Default for UpdatePaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete configuration for one boot cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UpdaterConfig {
    pub mount: MountConfig,
    pub paths: UpdatePaths,
    pub boot_delay: Duration,
    pub heartbeat_period: Duration,
    /// Depth of the diagnostic listing under the mount root (0 disables it).
    pub listing_depth: u8,
}

impl UpdaterConfig {
    pub const fn new() -> Self {
        Self {
            mount: MountConfig::new(),
            paths: UpdatePaths::new(),
            boot_delay: DEFAULT_BOOT_DELAY,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            listing_depth: 1,
        }
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self::new()
    }
}
