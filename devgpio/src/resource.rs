//! Per-record line resource, tagged by backend.

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use nix::poll::PollFlags;

use crate::chip::LineHandle;
use crate::error::Result;
use crate::line::{EdgeEvent, EdgeMode, LineSettings};
use crate::manager::{LineGroup, WeakLineGroup};
use crate::sysfs::{SysfsLine, SysfsValue, WeakSysfsLine};

/// Interval at which a waiting release re-wakes the event loop.
const UNPIN_POLL: Duration = Duration::from_millis(10);

pub(crate) type Wake = Arc<dyn Fn() + Send + Sync>;

/// Counts descriptors pinned by the event loop.
///
/// Pins are only taken while the owner's handle lock is held for reading,
/// so once a release has taken the handle under the write lock the count
/// can only fall.
#[derive(Default)]
pub(crate) struct PinGate {
    pinned: Mutex<usize>,
    unpinned: Condvar,
    waker: Mutex<Option<Wake>>,
}

impl PinGate {
    fn count(&self) -> MutexGuard<'_, usize> {
        self.pinned.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn pin(self: &Arc<Self>) -> PinGuard {
        *self.count() += 1;
        PinGuard(Arc::clone(self))
    }

    /// Install the callback that interrupts the loop holding the pins.
    pub(crate) fn set_waker(&self, wake: Wake) {
        *self.waker.lock().unwrap_or_else(|p| p.into_inner()) = Some(wake);
    }

    /// Block until every pin is dropped.
    pub(crate) fn wait_unpinned(&self) {
        let wake = self.waker.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut pinned = self.count();
        while *pinned > 0 {
            if let Some(wake) = &wake {
                wake();
            }
            pinned = self
                .unpinned
                .wait_timeout(pinned, UNPIN_POLL)
                .unwrap_or_else(|p| p.into_inner())
                .0;
        }
    }
}

/// One pin on a [`PinGate`], dropped at the end of a wait.
pub(crate) struct PinGuard(Arc<PinGate>);

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pinned = self.0.count();
        *pinned = pinned.saturating_sub(1);
        if *pinned == 0 {
            self.0.unpinned.notify_all();
        }
    }
}

/// Lines held by one record.
#[derive(Debug, Clone)]
pub enum LineResource {
    /// Character device request, one or more lines.
    Group(LineGroup),
    /// Legacy sysfs export, exactly one line.
    Sysfs(SysfsLine),
}

impl LineResource {
    pub fn line_count(&self) -> usize {
        match self {
            LineResource::Group(group) => group.offsets().len(),
            LineResource::Sysfs(_) => 1,
        }
    }

    pub fn offsets(&self) -> Vec<u32> {
        match self {
            LineResource::Group(group) => group.offsets().to_vec(),
            LineResource::Sysfs(line) => vec![line.offset()],
        }
    }

    pub fn settings(&self) -> LineSettings {
        match self {
            LineResource::Group(group) => group.settings(),
            LineResource::Sysfs(line) => line.settings(),
        }
    }

    /// Read the lines selected by `mask`, packed into the low bits.
    pub fn get(&self, mask: u64) -> Result<u64> {
        match self {
            LineResource::Group(group) => group.get(mask),
            LineResource::Sysfs(line) => {
                if mask & 1 == 0 {
                    return Ok(0);
                }
                Ok(u64::from(line.get()?))
            }
        }
    }

    /// Drive the lines selected by `mask` from the packed `value`.
    pub fn set(&self, mask: u64, value: u64) -> Result<()> {
        match self {
            LineResource::Group(group) => group.set(mask, value),
            LineResource::Sysfs(line) => {
                if mask & 1 == 0 {
                    return Ok(());
                }
                line.set(value & 1 != 0)
            }
        }
    }

    pub fn set_edge(&self, edge: EdgeMode) -> Result<()> {
        match self {
            LineResource::Group(group) => group.set_edge(edge),
            LineResource::Sysfs(line) => line.set_edge(edge),
        }
    }

    /// Discard edge notifications queued before now.
    pub fn drain_events(&self) -> Result<()> {
        match self {
            LineResource::Group(group) => group.drain_events().map(|_| ()),
            // Reading the attribute clears the pending wakeup.
            LineResource::Sysfs(line) => line.get().map(|_| ()),
        }
    }

    pub fn release(&self) {
        match self {
            LineResource::Group(group) => group.release(),
            LineResource::Sysfs(line) => line.release(),
        }
    }

    pub fn is_released(&self) -> bool {
        match self {
            LineResource::Group(group) => group.is_released(),
            LineResource::Sysfs(line) => line.is_released(),
        }
    }

    pub fn downgrade(&self) -> WeakResource {
        match self {
            LineResource::Group(group) => WeakResource::Group(group.downgrade()),
            LineResource::Sysfs(line) => WeakResource::Sysfs(line.downgrade()),
        }
    }
}

/// Non-owning form of [`LineResource`] held by event watchers.
#[derive(Debug, Clone)]
pub enum WeakResource {
    Group(WeakLineGroup),
    Sysfs(WeakSysfsLine),
}

impl WeakResource {
    /// Pin the live descriptor for one wait, or `None` once released.
    pub(crate) fn watch(&self) -> Option<Watch> {
        let (source, pin) = match self {
            WeakResource::Group(group) => {
                let (handle, pin) = group.pin()?;
                (WatchSource::Cdev(handle), pin)
            }
            WeakResource::Sysfs(line) => {
                let (value, pin) = line.pin()?;
                (WatchSource::Sysfs(value), pin)
            }
        };
        Some(Watch { source, _pin: pin })
    }

    /// Let an explicit release interrupt the loop that pins this resource.
    pub(crate) fn set_waker(&self, wake: Wake) {
        match self {
            WeakResource::Group(group) => group.set_waker(wake),
            WeakResource::Sysfs(line) => line.set_waker(wake),
        }
    }
}

enum WatchSource {
    Cdev(Arc<dyn LineHandle>),
    Sysfs(Arc<SysfsValue>),
}

/// A descriptor pinned for the duration of one wait.
///
/// The source is declared first so it is dropped before the pin.
pub(crate) struct Watch {
    source: WatchSource,
    _pin: PinGuard,
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            WatchSource::Cdev(handle) => f.debug_tuple("Watch").field(handle).finish(),
            WatchSource::Sysfs(value) => f.debug_tuple("Watch").field(value).finish(),
        }
    }
}

impl Watch {
    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        match &self.source {
            WatchSource::Cdev(handle) => handle.event_fd(),
            WatchSource::Sysfs(value) => value.event_fd(),
        }
    }

    /// Readiness that signals an edge on this descriptor.
    pub(crate) fn interest(&self) -> PollFlags {
        match &self.source {
            WatchSource::Cdev(_) => PollFlags::POLLIN,
            WatchSource::Sysfs(_) => PollFlags::POLLPRI | PollFlags::POLLERR,
        }
    }

    pub(crate) fn read_event(&self) -> io::Result<Option<EdgeEvent>> {
        match &self.source {
            WatchSource::Cdev(handle) => handle.read_event(),
            WatchSource::Sysfs(value) => value.read_event(),
        }
    }
}
