//! GPIO character device backend (`/dev/gpiochipN`) on top of `gpiocdev`.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use gpiocdev::chip::Chip;
use gpiocdev::line::{self, EdgeDetection, Value, Values};
use gpiocdev::request::{Config, Request};

use super::{ChipInfo, GpioChip, LineFlags, LineHandle, LineInfo};
use crate::bits::MAX_GROUP_LINES;
use crate::error::{Error, Result};
use crate::line::{Direction, EdgeEvent, EdgeKind, EdgeMode, LineSettings};
use crate::tracing::prelude::*;

/// An open GPIO character device.
pub struct CdevChip {
    path: PathBuf,
    chip: Chip,
}

impl CdevChip {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let chip = Chip::from_path(&path).map_err(|e| Error::DeviceUnavailable {
            context: format!("open {}", path.display()),
            source: io::Error::other(e),
        })?;
        debug!(chip = %path.display(), "Opened GPIO controller");
        Ok(Self { path, chip })
    }

    /// Classify a refused request by asking the controller who holds the
    /// lines now.
    fn refused(&self, offsets: &[u32], source: gpiocdev::Error) -> Error {
        for &offset in offsets {
            if let Ok(info) = self.line_info(offset) {
                if info.used() {
                    return Error::AlreadyInUse {
                        offset,
                        consumer: info.consumer,
                    };
                }
            }
        }
        Error::DeviceUnavailable {
            context: format!("line request on {}", self.path.display()),
            source: io::Error::other(source),
        }
    }
}

impl fmt::Debug for CdevChip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdevChip").field("path", &self.path).finish()
    }
}

fn edge_detection(mode: EdgeMode) -> Option<EdgeDetection> {
    match mode {
        EdgeMode::None => None,
        EdgeMode::Rising => Some(EdgeDetection::RisingEdge),
        EdgeMode::Falling => Some(EdgeDetection::FallingEdge),
        EdgeMode::Both => Some(EdgeDetection::BothEdges),
    }
}

fn flags_from(info: &line::Info) -> LineFlags {
    let mut flags = match info.direction {
        line::Direction::Output => LineFlags::OUTPUT,
        _ => LineFlags::INPUT,
    };
    flags.set(LineFlags::USED, info.used);
    flags.set(LineFlags::ACTIVE_LOW, info.active_low);
    match info.edge_detection {
        Some(EdgeDetection::RisingEdge) => flags |= LineFlags::EDGE_RISING,
        Some(EdgeDetection::FallingEdge) => flags |= LineFlags::EDGE_FALLING,
        Some(EdgeDetection::BothEdges) => {
            flags |= LineFlags::EDGE_RISING | LineFlags::EDGE_FALLING
        }
        None => {}
    }
    flags
}

fn value_of(bit: bool) -> Value {
    if bit {
        Value::Active
    } else {
        Value::Inactive
    }
}

impl GpioChip for CdevChip {
    fn info(&self) -> Result<ChipInfo> {
        let info = self.chip.info().map_err(|e| Error::DeviceUnavailable {
            context: format!("chip info for {}", self.path.display()),
            source: io::Error::other(e),
        })?;
        Ok(ChipInfo {
            name: info.name,
            label: info.label,
            lines: info.num_lines,
        })
    }

    fn line_info(&self, offset: u32) -> Result<LineInfo> {
        let lines = self.info()?.lines;
        if offset >= lines {
            return Err(Error::InvalidConfiguration(format!(
                "line {offset} is out of range, {} has {lines} lines",
                self.path.display()
            )));
        }
        let info = self
            .chip
            .line_info(offset)
            .map_err(|e| Error::DeviceUnavailable {
                context: format!("line info for {offset}"),
                source: io::Error::other(e),
            })?;

        Ok(LineInfo {
            offset,
            flags: flags_from(&info),
            consumer: (!info.consumer.is_empty()).then(|| info.consumer.clone()),
            name: info.name,
        })
    }

    fn request_lines(
        &self,
        offsets: &[u32],
        settings: &LineSettings,
        consumer: &str,
    ) -> Result<Box<dyn LineHandle>> {
        if offsets.is_empty() || offsets.len() > MAX_GROUP_LINES {
            return Err(Error::InvalidConfiguration(format!(
                "a line request takes 1 to {} offsets, got {}",
                MAX_GROUP_LINES,
                offsets.len()
            )));
        }
        let lines = self.info()?.lines;
        if let Some(offset) = offsets.iter().find(|&&o| o >= lines) {
            return Err(Error::InvalidConfiguration(format!(
                "line {offset} is out of range, {} has {lines} lines",
                self.path.display()
            )));
        }

        let mut builder = Request::builder();
        builder
            .on_chip(self.path.clone())
            .with_consumer(consumer)
            .with_lines(offsets);
        match settings.direction {
            Direction::Input => {
                builder.as_input();
            }
            Direction::Output => {
                builder.as_output(Value::Inactive);
            }
        }
        if settings.polarity.is_active_low() {
            builder.as_active_low();
        }
        if let Some(edge) = edge_detection(settings.edge) {
            builder.with_edge_detection(edge);
        }

        let request = builder
            .request()
            .map_err(|e| self.refused(offsets, e))?;
        trace!(?offsets, ?settings, "Granted line request");
        Ok(Box::new(CdevLines {
            offsets: offsets.to_vec(),
            request,
        }))
    }
}

/// Lines granted by one character device request.
pub struct CdevLines {
    offsets: Vec<u32>,
    request: Request,
}

impl CdevLines {
    fn selected(&self, mask: u64) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.offsets
            .iter()
            .copied()
            .enumerate()
            .filter(move |(pos, _)| mask & (1u64 << pos) != 0)
    }
}

impl fmt::Debug for CdevLines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdevLines")
            .field("offsets", &self.offsets)
            .finish()
    }
}

impl LineHandle for CdevLines {
    fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn get_values(&self, mask: u64) -> io::Result<u64> {
        if self.selected(mask).next().is_none() {
            return Ok(0);
        }
        let mut values = Values::default();
        for (_, offset) in self.selected(mask) {
            values.set(offset, Value::Inactive);
        }
        self.request.values(&mut values).map_err(io::Error::other)?;

        Ok(self
            .selected(mask)
            .filter(|&(_, offset)| matches!(values.get(offset), Some(Value::Active)))
            .fold(0, |bits, (pos, _)| bits | (1u64 << pos)))
    }

    fn set_values(&self, mask: u64, bits: u64) -> io::Result<()> {
        if self.selected(mask).next().is_none() {
            return Ok(());
        }
        let mut values = Values::default();
        for (pos, offset) in self.selected(mask) {
            values.set(offset, value_of(bits & (1u64 << pos) != 0));
        }
        self.request.set_values(&values).map_err(io::Error::other)
    }

    fn reconfigure(&self, settings: &LineSettings) -> io::Result<()> {
        let mut config = Config::default();
        config.with_lines(&self.offsets);
        if settings.direction == Direction::Input {
            config.as_input();
        }
        if settings.polarity.is_active_low() {
            config.as_active_low();
        }
        if let Some(edge) = edge_detection(settings.edge) {
            config.with_edge_detection(edge);
        }
        if settings.direction == Direction::Output {
            // Keep driving the current levels.
            for &offset in &self.offsets {
                let value = self.request.value(offset).map_err(io::Error::other)?;
                config.with_line(offset).as_output(value);
            }
        }
        self.request.reconfigure(&config).map_err(io::Error::other)
    }

    fn event_fd(&self) -> BorrowedFd<'_> {
        self.request.as_fd()
    }

    fn read_event(&self) -> io::Result<Option<EdgeEvent>> {
        if !self.request.has_edge_event().map_err(io::Error::other)? {
            return Ok(None);
        }
        let event = self.request.read_edge_event().map_err(io::Error::other)?;
        Ok(Some(EdgeEvent {
            offset: event.offset,
            kind: match event.kind {
                line::EdgeKind::Rising => EdgeKind::Rising,
                line::EdgeKind::Falling => EdgeKind::Falling,
            },
            timestamp_ns: event.timestamp_ns,
            seqno: event.seqno,
            line_seqno: event.line_seqno,
        }))
    }
}
