//! Simulated GPIO controller.
//!
//! Behaves like the character device closely enough to run the full stack
//! without hardware: requests are atomic, lines held elsewhere report
//! `USED`, writes to inputs fail with `EPERM`, and edge events are delivered
//! as fixed-size records through a nonblocking pipe per request so the
//! multiplexer polls and reads them as it does a real request fd.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use super::{ChipInfo, GpioChip, LineFlags, LineHandle, LineInfo};
use crate::bits::MAX_GROUP_LINES;
use crate::error::{Error, Result};
use crate::line::{Direction, EdgeEvent, EdgeKind, LineSettings};
use crate::tracing::prelude::*;

const RECORD_SIZE: usize = 24;

fn encode_event(event: &EdgeEvent) -> [u8; RECORD_SIZE] {
    let kind: u32 = match event.kind {
        EdgeKind::Rising => 1,
        EdgeKind::Falling => 2,
    };
    let mut buf = [0u8; RECORD_SIZE];
    buf[0..8].copy_from_slice(&event.timestamp_ns.to_ne_bytes());
    buf[8..12].copy_from_slice(&kind.to_ne_bytes());
    buf[12..16].copy_from_slice(&event.offset.to_ne_bytes());
    buf[16..20].copy_from_slice(&event.seqno.to_ne_bytes());
    buf[20..24].copy_from_slice(&event.line_seqno.to_ne_bytes());
    buf
}

fn decode_event(buf: &[u8; RECORD_SIZE]) -> io::Result<EdgeEvent> {
    let u32_at = |at: usize| u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&buf[0..8]);
    let kind = match u32_at(8) {
        1 => EdgeKind::Rising,
        2 => EdgeKind::Falling,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown edge event kind {other}"),
            ))
        }
    };
    Ok(EdgeEvent {
        timestamp_ns: u64::from_ne_bytes(ts),
        kind,
        offset: u32_at(12),
        seqno: u32_at(16),
        line_seqno: u32_at(20),
    })
}

/// Read at most one record. A short read or an empty pipe is no event.
fn read_record(mut file: &File) -> io::Result<Option<EdgeEvent>> {
    let mut buf = [0u8; RECORD_SIZE];
    match file.read(&mut buf) {
        Ok(n) if n == RECORD_SIZE => decode_event(&buf).map(Some),
        Ok(_) => Ok(None),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn flags_for(settings: &LineSettings) -> LineFlags {
    let mut flags = match settings.direction {
        Direction::Input => LineFlags::INPUT,
        Direction::Output => LineFlags::OUTPUT,
    };
    flags.set(LineFlags::ACTIVE_LOW, settings.polarity.is_active_low());
    flags.set(LineFlags::EDGE_RISING, settings.edge.detects_rising());
    flags.set(LineFlags::EDGE_FALLING, settings.edge.detects_falling());
    flags
}

#[derive(Debug, Default)]
struct SimLine {
    name: String,
    /// Electrical level.
    level: bool,
    /// Consumer label of an owner outside this process.
    external: Option<String>,
    /// Request currently holding the line.
    owner: Option<u64>,
    line_seqno: u32,
}

#[derive(Debug)]
struct SimRequest {
    settings: LineSettings,
    consumer: String,
    events: File,
    seqno: u32,
}

#[derive(Debug, Default)]
struct SimState {
    lines: Vec<SimLine>,
    requests: HashMap<u64, SimRequest>,
    next_request: u64,
    clock_ns: u64,
}

impl SimState {
    fn line(&self, offset: u32) -> io::Result<&SimLine> {
        self.lines
            .get(offset as usize)
            .ok_or_else(|| io::Error::from(Errno::EINVAL))
    }

    fn line_mut(&mut self, offset: u32) -> io::Result<&mut SimLine> {
        self.lines
            .get_mut(offset as usize)
            .ok_or_else(|| io::Error::from(Errno::EINVAL))
    }

    /// Queue an event on the request holding `offset`, if it watches `kind`.
    fn emit(&mut self, offset: u32, kind: EdgeKind) {
        let Some(id) = self.lines.get(offset as usize).and_then(|l| l.owner) else {
            return;
        };
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        let edge = request.settings.edge;
        let wanted = match kind {
            EdgeKind::Rising => edge.detects_rising(),
            EdgeKind::Falling => edge.detects_falling(),
        };
        if !wanted || request.settings.direction != Direction::Input {
            return;
        }

        self.clock_ns += 1_000;
        request.seqno += 1;
        let line = &mut self.lines[offset as usize];
        line.line_seqno += 1;

        let record = encode_event(&EdgeEvent {
            offset,
            kind,
            timestamp_ns: self.clock_ns,
            seqno: request.seqno,
            line_seqno: line.line_seqno,
        });
        // A full pipe drops the event, as the kernel does on kfifo overflow.
        if let Err(e) = (&request.events).write_all(&record) {
            trace!(offset, error = %e, "Dropped simulated edge event");
        }
    }
}

/// In-process GPIO controller.
#[derive(Debug, Clone)]
pub struct SimChip {
    label: String,
    state: Arc<Mutex<SimState>>,
}

impl SimChip {
    /// A controller with `lines` lines named `GPIO0`, `GPIO1`, ...
    pub fn new(lines: u32) -> Self {
        let state = SimState {
            lines: (0..lines)
                .map(|n| SimLine {
                    name: format!("GPIO{n}"),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        Self {
            label: "devgpio-sim".into(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock cannot leave the tables inconsistent.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Mark `offset` as held by another process.
    pub fn claim_external(&self, offset: u32, consumer: &str) {
        if let Ok(line) = self.state().line_mut(offset) {
            line.external = Some(consumer.to_string());
        }
    }

    /// Drive the electrical level of `offset` from outside, queueing an edge
    /// event when the level changes on a watched input.
    pub fn set_level(&self, offset: u32, level: bool) {
        let mut state = self.state();
        let Ok(line) = state.line_mut(offset) else {
            return;
        };
        if line.level == level {
            return;
        }
        line.level = level;
        let owner = line.owner;

        let active_low = owner
            .and_then(|id| state.requests.get(&id))
            .map(|r| r.settings.polarity.is_active_low())
            .unwrap_or(false);
        let kind = if level != active_low {
            EdgeKind::Rising
        } else {
            EdgeKind::Falling
        };
        state.emit(offset, kind);
    }

    /// Electrical level of `offset`.
    pub fn level(&self, offset: u32) -> bool {
        self.state().line(offset).map(|l| l.level).unwrap_or(false)
    }

    /// Queue an edge event without changing the level.
    pub fn inject_edge(&self, offset: u32, kind: EdgeKind) {
        self.state().emit(offset, kind);
    }

    /// Number of live requests.
    pub fn open_requests(&self) -> usize {
        self.state().requests.len()
    }
}

impl GpioChip for SimChip {
    fn info(&self) -> Result<ChipInfo> {
        Ok(ChipInfo {
            name: "gpiochip-sim".into(),
            label: self.label.clone(),
            lines: self.state().lines.len() as u32,
        })
    }

    fn line_info(&self, offset: u32) -> Result<LineInfo> {
        let state = self.state();
        let line = state
            .line(offset)
            .map_err(|e| Error::from_request(offset, "line info", e))?;

        let mut flags = LineFlags::INPUT;
        let mut consumer = line.external.clone();
        if consumer.is_some() {
            flags |= LineFlags::USED;
        }
        if let Some(request) = line.owner.and_then(|id| state.requests.get(&id)) {
            flags = flags_for(&request.settings) | LineFlags::USED;
            consumer = Some(request.consumer.clone());
        }

        Ok(LineInfo {
            offset,
            name: line.name.clone(),
            consumer,
            flags,
        })
    }

    fn request_lines(
        &self,
        offsets: &[u32],
        settings: &LineSettings,
        consumer: &str,
    ) -> Result<Box<dyn LineHandle>> {
        let first = offsets.first().copied().unwrap_or_default();
        if offsets.is_empty() || offsets.len() > MAX_GROUP_LINES {
            return Err(Error::from_request(
                first,
                "line request",
                Errno::EINVAL.into(),
            ));
        }

        let mut state = self.state();
        for &offset in offsets {
            let line = state
                .line(offset)
                .map_err(|e| Error::from_request(offset, "line request", e))?;
            if line.external.is_some() || line.owner.is_some() {
                return Err(Error::from_request(
                    offset,
                    "line request",
                    Errno::EBUSY.into(),
                ));
            }
        }

        let (reader, writer) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(|e| Error::from_request(first, "event pipe", e.into()))?;

        let id = state.next_request;
        state.next_request += 1;
        for &offset in offsets {
            state.lines[offset as usize].owner = Some(id);
        }
        state.requests.insert(
            id,
            SimRequest {
                settings: *settings,
                consumer: consumer.to_string(),
                events: File::from(writer),
                seqno: 0,
            },
        );
        trace!(?offsets, id, "Granted simulated line request");

        Ok(Box::new(SimLines {
            id,
            offsets: offsets.to_vec(),
            events: File::from(reader),
            state: Arc::clone(&self.state),
        }))
    }
}

/// Lines granted by [`SimChip::request_lines`].
#[derive(Debug)]
pub struct SimLines {
    id: u64,
    offsets: Vec<u32>,
    events: File,
    state: Arc<Mutex<SimState>>,
}

impl SimLines {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl LineHandle for SimLines {
    fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn get_values(&self, mask: u64) -> io::Result<u64> {
        let state = self.state();
        let request = state
            .requests
            .get(&self.id)
            .ok_or_else(|| io::Error::from(Errno::EBADF))?;
        let active_low = request.settings.polarity.is_active_low();

        let mut bits = 0;
        for (pos, &offset) in self.offsets.iter().enumerate() {
            if mask & (1u64 << pos) != 0 && state.line(offset)?.level != active_low {
                bits |= 1u64 << pos;
            }
        }
        Ok(bits)
    }

    fn set_values(&self, mask: u64, bits: u64) -> io::Result<()> {
        let mut state = self.state();
        let request = state
            .requests
            .get(&self.id)
            .ok_or_else(|| io::Error::from(Errno::EBADF))?;
        if request.settings.direction != Direction::Output {
            return Err(Errno::EPERM.into());
        }
        let active_low = request.settings.polarity.is_active_low();

        for (pos, &offset) in self.offsets.iter().enumerate() {
            if mask & (1u64 << pos) != 0 {
                state.line_mut(offset)?.level = (bits & (1u64 << pos) != 0) != active_low;
            }
        }
        Ok(())
    }

    fn reconfigure(&self, settings: &LineSettings) -> io::Result<()> {
        let mut state = self.state();
        let request = state
            .requests
            .get_mut(&self.id)
            .ok_or_else(|| io::Error::from(Errno::EBADF))?;
        request.settings = *settings;
        Ok(())
    }

    fn event_fd(&self) -> BorrowedFd<'_> {
        self.events.as_fd()
    }

    fn read_event(&self) -> io::Result<Option<EdgeEvent>> {
        read_record(&self.events)
    }
}

impl Drop for SimLines {
    fn drop(&mut self) {
        let mut state = self.state();
        state.requests.remove(&self.id);
        for &offset in &self.offsets {
            if let Some(line) = state.lines.get_mut(offset as usize) {
                if line.owner == Some(self.id) {
                    line.owner = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::{EdgeMode, Polarity};

    #[test]
    fn test_request_is_atomic() {
        let chip = SimChip::new(8);
        chip.claim_external(3, "other");

        let err = chip
            .request_lines(&[1, 2, 3], &LineSettings::output(), "test")
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInUse { offset: 3, .. }));
        // Nothing was granted
        assert_eq!(chip.open_requests(), 0);
        assert!(!chip.line_info(1).unwrap().used());
    }

    #[test]
    fn test_out_of_range_offset_is_invalid() {
        let chip = SimChip::new(4);
        let err = chip
            .request_lines(&[9], &LineSettings::input(), "test")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_drop_returns_lines() {
        let chip = SimChip::new(4);
        let handle = chip
            .request_lines(&[0, 1], &LineSettings::output(), "test")
            .unwrap();
        let info = chip.line_info(1).unwrap();
        assert!(info.used());
        assert_eq!(info.consumer.as_deref(), Some("test"));
        assert_eq!(info.direction(), Direction::Output);

        drop(handle);
        assert!(!chip.line_info(1).unwrap().used());
        assert_eq!(chip.open_requests(), 0);
    }

    #[test]
    fn test_write_to_input_is_refused() {
        let chip = SimChip::new(4);
        let handle = chip
            .request_lines(&[0], &LineSettings::input(), "test")
            .unwrap();
        let err = handle.set_values(0b1, 0b1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::EPERM as i32));
    }

    #[test]
    fn test_active_low_inverts_logical_value() {
        let chip = SimChip::new(4);
        let settings = LineSettings::output().with_polarity(Polarity::ActiveLow);
        let handle = chip.request_lines(&[2], &settings, "test").unwrap();

        handle.set_values(0b1, 0b1).unwrap();
        assert!(!chip.level(2));
        assert_eq!(handle.get_values(0b1).unwrap(), 0b1);
    }

    #[test]
    fn test_level_change_queues_event() {
        let chip = SimChip::new(8);
        let settings = LineSettings::input().with_edge(EdgeMode::Rising);
        let handle = chip.request_lines(&[5], &settings, "test").unwrap();

        assert_eq!(handle.read_event().unwrap(), None);
        chip.set_level(5, true);
        chip.set_level(5, false); // falling edge is not watched

        let event = handle.read_event().unwrap().unwrap();
        assert_eq!(event.offset, 5);
        assert_eq!(event.kind, EdgeKind::Rising);
        assert_eq!(event.line_seqno, 1);
        assert_eq!(handle.read_event().unwrap(), None);
    }

    #[test]
    fn test_no_events_without_edge_detection() {
        let chip = SimChip::new(8);
        let handle = chip
            .request_lines(&[5], &LineSettings::input(), "test")
            .unwrap();
        chip.inject_edge(5, EdgeKind::Rising);
        assert_eq!(handle.read_event().unwrap(), None);

        handle
            .reconfigure(&LineSettings::input().with_edge(EdgeMode::Both))
            .unwrap();
        chip.inject_edge(5, EdgeKind::Falling);
        assert_eq!(handle.read_event().unwrap().unwrap().kind, EdgeKind::Falling);
    }

    #[test]
    fn test_short_record_is_no_event() {
        let (reader, writer) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        let (reader, mut writer) = (File::from(reader), File::from(writer));
        let record = encode_event(&EdgeEvent {
            offset: 1,
            kind: EdgeKind::Rising,
            timestamp_ns: 10,
            seqno: 1,
            line_seqno: 1,
        });

        writer.write_all(&record[..RECORD_SIZE / 2]).unwrap();
        assert_eq!(read_record(&reader).unwrap(), None);
        // Nothing left over
        assert_eq!(read_record(&reader).unwrap(), None);

        writer.write_all(&record).unwrap();
        assert_eq!(read_record(&reader).unwrap().unwrap().offset, 1);
    }

    #[test]
    fn test_unknown_record_kind_is_invalid_data() {
        let mut buf = [0u8; RECORD_SIZE];
        buf[8] = 7;
        let err = decode_event(&buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_flags_for_settings() {
        let settings = LineSettings::input()
            .with_polarity(Polarity::ActiveLow)
            .with_edge(EdgeMode::Both);
        assert_eq!(
            flags_for(&settings),
            LineFlags::INPUT | LineFlags::ACTIVE_LOW | LineFlags::EDGE_RISING | LineFlags::EDGE_FALLING
        );
        assert_eq!(flags_for(&LineSettings::output()), LineFlags::OUTPUT);
    }
}
