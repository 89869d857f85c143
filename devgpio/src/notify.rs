//! At-most-one outstanding reprocessing request per record.
//!
//! A [`NotificationBinding`] holds a single ticket slot. The multiplexer may
//! only send a [`ScanRequest`] after claiming the slot; further edges for
//! the same record are coalesced until the request is completed or
//! dropped. Each claim carries a fresh epoch, so a request that outlives a
//! cancel/re-register cycle cannot clear the flag of its successor.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::line::EdgeEvent;

slotmap::new_key_type! {
    /// Identifies a record initialized through [`DeviceSupport`](crate::device::DeviceSupport).
    pub struct RecordKey;
}

const NONE_OUTSTANDING: u64 = 0;

/// Notification state of one record.
#[derive(Debug)]
pub struct NotificationBinding {
    record: RecordKey,
    name: String,
    outstanding: AtomicU64,
    next_epoch: AtomicU64,
}

impl NotificationBinding {
    pub fn new(record: RecordKey, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            record,
            name: name.into(),
            outstanding: AtomicU64::new(NONE_OUTSTANDING),
            next_epoch: AtomicU64::new(1),
        })
    }

    pub fn record(&self) -> RecordKey {
        self.record
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) != NONE_OUTSTANDING
    }

    /// Mark a request outstanding, unless one already is.
    pub fn try_claim(self: &Arc<Self>, event: EdgeEvent) -> Option<ScanRequest> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        self.outstanding
            .compare_exchange(NONE_OUTSTANDING, epoch, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(ScanRequest {
            binding: Arc::clone(self),
            epoch,
            event,
        })
    }

    /// Forget any outstanding request.
    pub fn clear(&self) {
        self.outstanding.store(NONE_OUTSTANDING, Ordering::Release);
    }

    fn finish(&self, epoch: u64) {
        let _ = self.outstanding.compare_exchange(
            epoch,
            NONE_OUTSTANDING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// A request that the framework reprocess one record.
///
/// Completing or dropping the request re-arms notification for the record.
pub struct ScanRequest {
    binding: Arc<NotificationBinding>,
    epoch: u64,
    event: EdgeEvent,
}

impl ScanRequest {
    pub fn record(&self) -> RecordKey {
        self.binding.record
    }

    pub fn name(&self) -> &str {
        &self.binding.name
    }

    /// The edge that triggered this request. Later coalesced edges are not
    /// reported.
    pub fn event(&self) -> &EdgeEvent {
        &self.event
    }

    /// Signal that the record has been reprocessed.
    pub fn complete(self) {}
}

impl Drop for ScanRequest {
    fn drop(&mut self) {
        self.binding.finish(self.epoch);
    }
}

impl fmt::Debug for ScanRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRequest")
            .field("record", &self.binding.name)
            .field("epoch", &self.epoch)
            .field("event", &self.event)
            .finish()
    }
}
