//! Line acquisition and grouped value access on the character device.
//!
//! [`LineManager::acquire`] turns a list of offsets into a [`LineGroup`]: a
//! single kernel request shared by all members, addressed by position. Bit
//! `i` of every mask and value refers to the `i`-th offset of the request;
//! [`LineGroup::get`] and [`LineGroup::set`] pack and unpack those bits so
//! callers see contiguous values regardless of which positions are selected.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::bits::{self, MAX_GROUP_LINES};
use crate::chip::{GpioChip, LineHandle};
use crate::error::{Error, Result};
use crate::line::{Direction, EdgeMode, LineSettings};
use crate::registry::{GroupId, LineRegistry};
use crate::resource::{PinGate, PinGuard, Wake};
use crate::tracing::prelude::*;

/// Acquires line groups from one controller.
#[derive(Debug, Clone)]
pub struct LineManager {
    chip: Arc<dyn GpioChip>,
    registry: Arc<LineRegistry>,
}

impl LineManager {
    pub fn new(chip: Arc<dyn GpioChip>, registry: Arc<LineRegistry>) -> Self {
        Self { chip, registry }
    }

    pub fn chip(&self) -> &Arc<dyn GpioChip> {
        &self.chip
    }

    pub fn registry(&self) -> &Arc<LineRegistry> {
        &self.registry
    }

    /// Request `offsets` as one group.
    ///
    /// Each line is first checked against kernel metadata; a line held by
    /// any other owner fails with [`Error::AlreadyInUse`] and no request is
    /// made. The kernel request itself is all-or-nothing. On any failure the
    /// registry is left as it was.
    pub fn acquire(&self, offsets: &[u32], settings: LineSettings) -> Result<LineGroup> {
        validate_offsets(offsets)?;
        settings.validate()?;

        self.registry.begin(offsets, &settings)?;
        match self.request(offsets, &settings) {
            Ok(handle) => {
                let id = self.registry.grant(offsets);
                debug!(?offsets, direction = %settings.direction, group = id, "Acquired lines");
                Ok(LineGroup {
                    inner: Arc::new(GroupInner {
                        id,
                        offsets: offsets.to_vec(),
                        settings: Mutex::new(settings),
                        handle: RwLock::new(Some(Arc::from(handle))),
                        gate: Arc::default(),
                        registry: Arc::clone(&self.registry),
                    }),
                })
            }
            Err(e) => {
                self.registry.abort(offsets);
                Err(e)
            }
        }
    }

    fn request(&self, offsets: &[u32], settings: &LineSettings) -> Result<Box<dyn LineHandle>> {
        for &offset in offsets {
            let info = self.chip.line_info(offset)?;
            if info.used() {
                return Err(Error::AlreadyInUse {
                    offset,
                    consumer: info.consumer,
                });
            }
        }
        self.chip
            .request_lines(offsets, settings, self.registry.consumer())
    }
}

fn validate_offsets(offsets: &[u32]) -> Result<()> {
    if offsets.is_empty() {
        return Err(Error::InvalidConfiguration("no lines requested".into()));
    }
    if offsets.len() > MAX_GROUP_LINES {
        return Err(Error::InvalidConfiguration(format!(
            "{} lines requested, at most {} fit one request",
            offsets.len(),
            MAX_GROUP_LINES
        )));
    }
    let mut seen = HashSet::new();
    for &offset in offsets {
        if !seen.insert(offset) {
            return Err(Error::InvalidConfiguration(format!(
                "line {offset} listed twice"
            )));
        }
    }
    Ok(())
}

struct GroupInner {
    id: GroupId,
    offsets: Vec<u32>,
    settings: Mutex<LineSettings>,
    /// `None` once released. Readers clone the `Arc` so a concurrent
    /// release never closes a descriptor mid-call.
    handle: RwLock<Option<Arc<dyn LineHandle>>>,
    /// Pins held by the event loop.
    gate: Arc<PinGate>,
    registry: Arc<LineRegistry>,
}

impl GroupInner {
    fn handle(&self) -> Result<Arc<dyn LineHandle>> {
        self.handle
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(Error::Released)
    }

    fn settings(&self) -> LineSettings {
        *self.settings.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pin(&self) -> Option<(Arc<dyn LineHandle>, PinGuard)> {
        let slot = self.handle.read().unwrap_or_else(|p| p.into_inner());
        let handle = slot.as_ref()?;
        Some((Arc::clone(handle), self.gate.pin()))
    }

    /// Take the handle and close it. With `wait`, pins held by the event
    /// loop are waited out first so the descriptor is closed on return.
    fn release(&self, wait: bool) -> bool {
        let handle = self.handle.write().unwrap_or_else(|p| p.into_inner()).take();
        let Some(handle) = handle else {
            return false;
        };
        if wait {
            self.gate.wait_unpinned();
        }
        drop(handle);
        self.registry.release(&self.offsets, self.id);
        true
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        if self.release(false) {
            debug!(offsets = ?self.offsets, group = self.id, "Released lines on drop");
        }
    }
}

/// Lines granted by one kernel request.
///
/// Clones share the request. The request is closed by [`release`] or when
/// the last clone is dropped.
///
/// [`release`]: LineGroup::release
#[derive(Clone)]
pub struct LineGroup {
    inner: Arc<GroupInner>,
}

impl fmt::Debug for LineGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineGroup")
            .field("id", &self.inner.id)
            .field("offsets", &self.inner.offsets)
            .field("settings", &self.inner.settings())
            .field("released", &self.is_released())
            .finish()
    }
}

impl LineGroup {
    pub fn offsets(&self) -> &[u32] {
        &self.inner.offsets
    }

    pub fn settings(&self) -> LineSettings {
        self.inner.settings()
    }

    pub fn is_released(&self) -> bool {
        self.inner
            .handle
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_none()
    }

    /// Mask covering every line of the group.
    pub fn full_mask(&self) -> u64 {
        bits::low_mask(self.inner.offsets.len())
    }

    /// Read the lines selected by `mask`, packed into the low bits.
    pub fn get(&self, mask: u64) -> Result<u64> {
        let mask = mask & self.full_mask();
        let raw = self.inner.handle()?.get_values(mask)?;
        Ok(bits::pack(raw, mask))
    }

    /// Drive the lines selected by `mask` from the packed `value`.
    pub fn set(&self, mask: u64, value: u64) -> Result<()> {
        if self.settings().direction != Direction::Output {
            return Err(Error::InvalidConfiguration(format!(
                "lines {:?} are not outputs",
                self.inner.offsets
            )));
        }
        let mask = mask & self.full_mask();
        let handle = self.inner.handle()?;
        handle.set_values(mask, bits::unpack(value, mask))?;
        Ok(())
    }

    /// Push a new edge-detection mode to the kernel.
    pub fn set_edge(&self, edge: EdgeMode) -> Result<()> {
        let handle = self.inner.handle()?;
        let mut settings = self.inner.settings.lock().unwrap_or_else(|p| p.into_inner());
        let updated = settings.with_edge(edge);
        updated.validate()?;
        if updated == *settings {
            return Ok(());
        }

        handle.reconfigure(&updated).map_err(|e| {
            Error::from_request(self.inner.offsets[0], "line reconfiguration", e)
        })?;
        *settings = updated;
        self.inner
            .registry
            .set_edge(&self.inner.offsets, self.inner.id, edge);
        debug!(offsets = ?self.inner.offsets, %edge, "Edge detection updated");
        Ok(())
    }

    /// Discard edge events already queued on the request.
    pub fn drain_events(&self) -> Result<usize> {
        let handle = self.inner.handle()?;
        let mut drained = 0;
        while handle.read_event()?.is_some() {
            drained += 1;
        }
        Ok(drained)
    }

    /// Close the request. Calling it again is a no-op.
    ///
    /// Returns once the kernel has the lines back, even while the event
    /// loop is watching them.
    pub fn release(&self) {
        if self.inner.release(true) {
            debug!(offsets = ?self.inner.offsets, group = self.inner.id, "Released lines");
        }
    }

    /// Non-owning reference for event watchers.
    pub fn downgrade(&self) -> WeakLineGroup {
        WeakLineGroup {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// A reference that neither keeps the group alive nor closes it.
#[derive(Debug, Clone)]
pub struct WeakLineGroup {
    inner: Weak<GroupInner>,
}

impl WeakLineGroup {
    /// Pin the live handle, if the group still exists and is not released.
    pub(crate) fn pin(&self) -> Option<(Arc<dyn LineHandle>, PinGuard)> {
        self.inner.upgrade()?.pin()
    }

    pub(crate) fn set_waker(&self, wake: Wake) {
        if let Some(inner) = self.inner.upgrade() {
            inner.gate.set_waker(wake);
        }
    }
}
