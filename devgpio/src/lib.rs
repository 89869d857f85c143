//! GPIO line management for process-control records.
//!
//! Resolves board pin labels to line offsets, acquires lines from the GPIO
//! character device (or the legacy sysfs interface), reads and writes them
//! as packed bit groups, and turns edge events into at most one pending
//! scan request per record. [`device::DeviceSupport`] ties these together
//! for a record-processing framework.

pub mod bits;
pub mod board;
pub mod chip;
pub mod config;
pub mod device;
pub mod error;
pub mod line;
pub mod link;
pub mod manager;
pub mod multiplexer;
pub mod notify;
pub mod registry;
pub mod resource;
pub mod sysfs;
pub mod tracing;

pub use board::{BoardProfile, PinResolver};
pub use config::{Backend, DeviceConfig};
pub use device::{DeviceSupport, InitPhase, RecordConfig, RecordInit, RecordKind, ScanCommand};
pub use error::{Error, Result};
pub use line::{Direction, EdgeEvent, EdgeKind, EdgeMode, LineSettings, Polarity};
pub use manager::{LineGroup, LineManager};
pub use notify::{NotificationBinding, RecordKey, ScanRequest};
