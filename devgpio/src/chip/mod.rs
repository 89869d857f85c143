//! Kernel-facing GPIO controller interface.
//!
//! [`GpioChip`] is the controller (`/dev/gpiochipN`): it reports line
//! metadata and grants line requests. A granted request is a [`LineHandle`]
//! owning one file descriptor shared by every line of the group. Dropping
//! the handle closes that descriptor and returns the lines to the kernel.
//!
//! [`linux::CdevChip`] talks to the real character device through
//! `gpiocdev`. Unit tests run against an in-process controller in `sim`.

pub mod linux;
#[cfg(test)]
pub(crate) mod sim;

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;

use bitflags::bitflags;

use crate::error::Result;
use crate::line::{Direction, EdgeEvent, LineSettings};

bitflags! {
    /// Line state as reported by the controller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LineFlags: u32 {
        const USED = 1 << 0;
        const ACTIVE_LOW = 1 << 1;
        const INPUT = 1 << 2;
        const OUTPUT = 1 << 3;
        const EDGE_RISING = 1 << 4;
        const EDGE_FALLING = 1 << 5;
    }
}

/// Controller identification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    pub name: String,
    pub label: String,
    pub lines: u32,
}

/// Kernel-reported metadata of one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub offset: u32,
    pub name: String,
    /// Label of the current owner, if any.
    pub consumer: Option<String>,
    pub flags: LineFlags,
}

impl LineInfo {
    /// Whether some owner (possibly this process) holds the line.
    pub fn used(&self) -> bool {
        self.flags.contains(LineFlags::USED)
    }

    pub fn direction(&self) -> Direction {
        if self.flags.contains(LineFlags::OUTPUT) {
            Direction::Output
        } else {
            Direction::Input
        }
    }
}

impl fmt::Display for LineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.name.is_empty() {
            "unnamed"
        } else {
            &self.name
        };
        write!(f, "line {:>3}: {:<16} {:<3}", self.offset, name, self.direction())?;
        if self.flags.contains(LineFlags::ACTIVE_LOW) {
            write!(f, " active-low")?;
        }
        match (
            self.flags.contains(LineFlags::EDGE_RISING),
            self.flags.contains(LineFlags::EDGE_FALLING),
        ) {
            (true, true) => write!(f, " edge=both")?,
            (true, false) => write!(f, " edge=rising")?,
            (false, true) => write!(f, " edge=falling")?,
            (false, false) => {}
        }
        match &self.consumer {
            Some(consumer) => write!(f, " [used by '{}']", consumer),
            None if self.used() => write!(f, " [used]"),
            None => Ok(()),
        }
    }
}

/// A GPIO controller.
pub trait GpioChip: Send + Sync + fmt::Debug {
    /// Controller name and line count.
    fn info(&self) -> Result<ChipInfo>;

    /// Metadata for `offset`, including whether another owner holds it.
    fn line_info(&self, offset: u32) -> Result<LineInfo>;

    /// Request every offset in one atomic kernel request.
    ///
    /// Either all lines are granted or none are.
    fn request_lines(
        &self,
        offsets: &[u32],
        settings: &LineSettings,
        consumer: &str,
    ) -> Result<Box<dyn LineHandle>>;
}

/// A granted line request.
///
/// Bitmaps address lines by position in the request, not by offset: bit `i`
/// is `offsets()[i]`. Values are logical; polarity inversion is applied by
/// the kernel according to the request flags.
pub trait LineHandle: Send + Sync + fmt::Debug {
    fn offsets(&self) -> &[u32];

    /// Read the levels selected by `mask`.
    fn get_values(&self, mask: u64) -> io::Result<u64>;

    /// Drive the levels selected by `mask` to the matching bits of `bits`.
    fn set_values(&self, mask: u64, bits: u64) -> io::Result<()>;

    /// Replace the configuration of every line in the request.
    fn reconfigure(&self, settings: &LineSettings) -> io::Result<()>;

    /// Descriptor that becomes readable when an edge event is queued.
    fn event_fd(&self) -> BorrowedFd<'_>;

    /// Read at most one queued edge event without blocking.
    fn read_event(&self) -> io::Result<Option<EdgeEvent>>;
}
