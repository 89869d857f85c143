//! Configuration for the GPIO device support.
//!
//! Parses environment variables; anything unset takes the default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::board::BoardProfile;
use crate::error::{Error, Result};
use crate::multiplexer::MultiplexerConfig;
use crate::sysfs::PermissionWait;
use crate::tracing::prelude::*;

/// Kernel interface used to access lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Backend {
    /// GPIO character device, grouped requests.
    #[default]
    Cdev,
    /// Legacy `/sys/class/gpio`, one line per record.
    Sysfs,
}

/// Device support configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub backend: Backend,

    /// Character device of the controller.
    pub chip: PathBuf,

    /// sysfs GPIO class directory.
    pub sysfs_root: PathBuf,

    /// Board profile for pin lookups. Without one, pins are raw numbers.
    pub board: Option<BoardProfile>,

    /// Consumer label shown by the kernel for lines we hold.
    pub consumer: String,

    pub multiplexer: MultiplexerConfig,

    pub permission: PermissionWait,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            chip: PathBuf::from("/dev/gpiochip0"),
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            board: None,
            consumer: "devgpio".into(),
            multiplexer: MultiplexerConfig::default(),
            permission: PermissionWait::default(),
        }
    }
}

impl DeviceConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DEVGPIO_BACKEND`: `cdev` (default) or `sysfs`
    /// - `DEVGPIO_CHIP`: controller device (default: `/dev/gpiochip0`)
    /// - `DEVGPIO_SYSFS_ROOT`: sysfs class directory (default: `/sys/class/gpio`)
    /// - `DEVGPIO_BOARD`: `RASPI B REV2`, `RASPI B+` or `BEAGLEBONE BLACK`
    /// - `DEVGPIO_CONSUMER`: consumer label (default: `devgpio`)
    /// - `DEVGPIO_WAIT_MS`: event wait in ms (default: 1000, clamped to 1-60000)
    /// - `DEVGPIO_IDLE_MS`: idle interval in ms (default: 5000, clamped to 1-60000)
    /// - `DEVGPIO_UDEV_TRIES`: permission checks (default: 100, at least 1)
    /// - `DEVGPIO_UDEV_INTERVAL_US`: delay between checks in µs (default: 500)
    ///
    /// Malformed numbers fall back to the default with a warning. An unknown
    /// board name is an error.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let board = match std::env::var("DEVGPIO_BOARD") {
            Ok(name) if !name.trim().is_empty() => {
                Some(BoardProfile::from_str(name.trim()).map_err(|_| {
                    Error::InvalidConfiguration(format!("unknown board '{name}'"))
                })?)
            }
            _ => None,
        };

        let wait_ms: u64 = env_or("DEVGPIO_WAIT_MS", 1000).clamp(1, 60_000);
        let idle_ms: u64 = env_or("DEVGPIO_IDLE_MS", 5000).clamp(1, 60_000);
        let attempts: u32 = env_or("DEVGPIO_UDEV_TRIES", 100).max(1);
        let interval_us: u64 = env_or("DEVGPIO_UDEV_INTERVAL_US", 500);

        Ok(Self {
            backend: env_or("DEVGPIO_BACKEND", defaults.backend),
            chip: std::env::var_os("DEVGPIO_CHIP")
                .map(PathBuf::from)
                .unwrap_or(defaults.chip),
            sysfs_root: std::env::var_os("DEVGPIO_SYSFS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.sysfs_root),
            board,
            consumer: std::env::var("DEVGPIO_CONSUMER")
                .ok()
                .filter(|c| !c.is_empty())
                .unwrap_or(defaults.consumer),
            multiplexer: MultiplexerConfig {
                wait: Duration::from_millis(wait_ms),
                idle: Duration::from_millis(idle_ms),
            },
            permission: PermissionWait {
                attempts,
                interval: Duration::from_micros(interval_us),
            },
        })
    }
}

fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, default = %default, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
