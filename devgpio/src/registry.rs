//! Process-wide table of line ownership.
//!
//! Every offset this process has touched has an entry recording where it is
//! in the `Unowned -> Requested -> Granted -> Released` lifecycle, the
//! configuration it was requested with, and the group holding its handle.
//! Offsets never seen are `Unowned`. All mutation goes through one mutex, so
//! a reader never observes a half-applied multi-line transition.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::line::{EdgeMode, LineSettings, Ownership};
use crate::tracing::prelude::*;

/// Identifies the line group that holds a granted handle.
pub type GroupId = u64;

/// Registry view of one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub state: Ownership,
    pub settings: LineSettings,
    pub group: Option<GroupId>,
    /// State to restore if a pending request is aborted.
    previous: Ownership,
}

#[derive(Debug, Default)]
struct Table {
    lines: HashMap<u32, LineEntry>,
    next_group: GroupId,
}

#[derive(Debug)]
pub struct LineRegistry {
    consumer: String,
    table: Mutex<Table>,
}

impl LineRegistry {
    /// `consumer` is the label this process presents to the kernel.
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            table: Mutex::new(Table::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Reserve `offsets` for a pending request.
    ///
    /// Fails without side effects if this process already holds or is
    /// requesting any of them.
    pub fn begin(&self, offsets: &[u32], settings: &LineSettings) -> Result<()> {
        let mut table = self.table();
        for &offset in offsets {
            if let Some(entry) = table.lines.get(&offset) {
                if matches!(entry.state, Ownership::Requested | Ownership::Granted) {
                    return Err(Error::AlreadyInUse {
                        offset,
                        consumer: Some(self.consumer.clone()),
                    });
                }
            }
        }
        for &offset in offsets {
            let previous = table
                .lines
                .get(&offset)
                .map(|e| e.state)
                .unwrap_or(Ownership::Unowned);
            table.lines.insert(
                offset,
                LineEntry {
                    state: Ownership::Requested,
                    settings: *settings,
                    group: None,
                    previous,
                },
            );
        }
        Ok(())
    }

    /// Mark a pending request as granted and allocate its group id.
    pub fn grant(&self, offsets: &[u32]) -> GroupId {
        let mut table = self.table();
        let group = table.next_group;
        table.next_group += 1;
        for &offset in offsets {
            if let Some(entry) = table.lines.get_mut(&offset) {
                entry.state = Ownership::Granted;
                entry.group = Some(group);
            }
        }
        trace!(?offsets, group, "Lines granted");
        group
    }

    /// Undo [`begin`](Self::begin) after a failed request.
    pub fn abort(&self, offsets: &[u32]) {
        let mut table = self.table();
        for &offset in offsets {
            let Some(entry) = table.lines.get(&offset).copied() else {
                continue;
            };
            if entry.state != Ownership::Requested {
                continue;
            }
            if entry.previous == Ownership::Unowned {
                table.lines.remove(&offset);
            } else if let Some(e) = table.lines.get_mut(&offset) {
                e.state = entry.previous;
            }
        }
    }

    /// Mark the lines of `group` released. Lines since re-granted to another
    /// group are left alone.
    pub fn release(&self, offsets: &[u32], group: GroupId) {
        let mut table = self.table();
        for offset in offsets {
            if let Some(entry) = table.lines.get_mut(offset) {
                if entry.group == Some(group) && entry.state == Ownership::Granted {
                    entry.state = Ownership::Released;
                    entry.group = None;
                }
            }
        }
        trace!(?offsets, group, "Lines released");
    }

    /// Record a new edge mode for lines of `group`.
    pub fn set_edge(&self, offsets: &[u32], group: GroupId, edge: EdgeMode) {
        let mut table = self.table();
        for offset in offsets {
            if let Some(entry) = table.lines.get_mut(offset) {
                if entry.group == Some(group) {
                    entry.settings.edge = edge;
                }
            }
        }
    }

    pub fn state(&self, offset: u32) -> Ownership {
        self.entry(offset)
            .map(|e| e.state)
            .unwrap_or(Ownership::Unowned)
    }

    pub fn entry(&self, offset: u32) -> Option<LineEntry> {
        self.table().lines.get(&offset).copied()
    }
}
