//! Interface offered to the record-processing framework.
//!
//! [`DeviceSupport`] is the explicitly constructed context the framework
//! integration owns for the lifetime of the process. It holds the optional
//! board profile, the line backend, every record's line resource and the
//! event multiplexer.
//!
//! ## Lifecycle
//!
//! 1. [`DeviceSupport::new`] (or [`DeviceSupport::with_chip`]) opens the
//!    backend. [`DeviceSupport::select_board`] may pick a board profile
//!    once.
//! 2. `init(BeforeRecords)`, then [`DeviceSupport::init_record`] for each
//!    record, then `init(AfterRecords)`, which starts the event thread.
//! 3. At run time the framework calls [`DeviceSupport::read`],
//!    [`DeviceSupport::write`] and [`DeviceSupport::get_scan_interrupt`],
//!    and processes the [`ScanRequest`]s received from
//!    [`DeviceSupport::take_scan_requests`].
//! 4. [`DeviceSupport::shutdown`] stops the event thread and releases every
//!    line.
//!
//! Every method takes `&self` and may be called from any thread.

use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use slotmap::SlotMap;
use tokio::sync::mpsc;

use crate::bits;
use crate::board::{BoardProfile, PinResolver};
use crate::chip::linux::CdevChip;
use crate::chip::GpioChip;
use crate::config::{Backend, DeviceConfig};
use crate::error::{Error, Result};
use crate::line::{Direction, EdgeMode, LineSettings};
use crate::link::{self, LinkSpec, MAX_LINK_LINES};
use crate::manager::LineManager;
use crate::multiplexer::{EventMultiplexer, MultiplexerState};
use crate::notify::{NotificationBinding, RecordKey, ScanRequest};
use crate::registry::LineRegistry;
use crate::resource::LineResource;
use crate::sysfs::SysfsGpio;
use crate::tracing::prelude::*;

/// Point in framework startup at which [`DeviceSupport::init`] is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum InitPhase {
    BeforeRecords,
    AfterRecords,
}

/// Kind of record bound to lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RecordKind {
    /// Binary input, one line.
    Bi,
    /// Binary output, one line.
    Bo,
    /// Multi-bit binary input.
    Mbbi,
    /// Multi-bit binary output.
    Mbbo,
}

impl RecordKind {
    pub fn direction(self) -> Direction {
        match self {
            RecordKind::Bi | RecordKind::Mbbi => Direction::Input,
            RecordKind::Bo | RecordKind::Mbbo => Direction::Output,
        }
    }

    pub fn is_input(self) -> bool {
        self.direction() == Direction::Input
    }

    pub fn is_multi_bit(self) -> bool {
        matches!(self, RecordKind::Mbbi | RecordKind::Mbbo)
    }
}

/// What the framework knows about a record at initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordConfig {
    pub name: String,
    pub kind: RecordKind,
    /// Pin specification from the record's link field.
    pub link: String,
}

impl RecordConfig {
    pub fn new(name: impl Into<String>, kind: RecordKind, link: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            link: link.into(),
        }
    }
}

/// Result of a successful record initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInit {
    pub key: RecordKey,
    pub line_count: usize,
    /// Value mask, one bit per line.
    pub mask: u64,
    /// Level read at initialization, for input records.
    pub initial_value: Option<u32>,
}

/// Scan list operation requested by the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ScanCommand {
    /// The record was placed on an interrupt scan list.
    Add = 0,
    /// The record was taken off its interrupt scan list.
    Remove = 1,
}

impl TryFrom<i32> for ScanCommand {
    type Error = Error;

    fn try_from(cmd: i32) -> Result<Self> {
        match cmd {
            0 => Ok(ScanCommand::Add),
            1 => Ok(ScanCommand::Remove),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown scan command {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct Record {
    name: String,
    kind: RecordKind,
    mask: u64,
    /// Edge enabled while the record is on an interrupt scan list.
    edge: EdgeMode,
    resource: LineResource,
    binding: Arc<NotificationBinding>,
}

#[derive(Debug)]
enum Access {
    Cdev(LineManager),
    Sysfs(SysfsGpio),
}

/// Device support context shared by all records.
pub struct DeviceSupport {
    config: DeviceConfig,
    resolver: OnceLock<PinResolver>,
    access: Access,
    records: RwLock<SlotMap<RecordKey, Record>>,
    multiplexer: EventMultiplexer,
    requests: Mutex<Option<mpsc::UnboundedReceiver<ScanRequest>>>,
}

impl std::fmt::Debug for DeviceSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSupport")
            .field("backend", &self.config.backend)
            .field("board", &self.resolver.get().map(PinResolver::profile))
            .field("records", &self.records().len())
            .finish()
    }
}

impl DeviceSupport {
    /// Open the backend named by `config`.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let registry = Arc::new(LineRegistry::new(config.consumer.clone()));
        let access = match config.backend {
            Backend::Cdev => {
                let chip = CdevChip::open(&config.chip)?;
                Access::Cdev(LineManager::new(Arc::new(chip), registry))
            }
            Backend::Sysfs => Access::Sysfs(SysfsGpio::new(
                &config.sysfs_root,
                config.permission,
                registry,
            )),
        };
        Self::build(config, access)
    }

    /// Use `chip` as the character-device backend, whatever `config` names.
    pub fn with_chip(config: DeviceConfig, chip: Arc<dyn GpioChip>) -> Result<Self> {
        let registry = Arc::new(LineRegistry::new(config.consumer.clone()));
        let config = DeviceConfig {
            backend: Backend::Cdev,
            ..config
        };
        Self::build(config, Access::Cdev(LineManager::new(chip, registry)))
    }

    fn build(config: DeviceConfig, access: Access) -> Result<Self> {
        let (multiplexer, requests) = EventMultiplexer::new(config.multiplexer)?;
        let support = Self {
            resolver: OnceLock::new(),
            access,
            records: RwLock::new(SlotMap::with_key()),
            multiplexer,
            requests: Mutex::new(Some(requests)),
            config,
        };
        if let Some(board) = support.config.board {
            support.select_board(board)?;
        }
        Ok(support)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Select the board profile used to resolve pin labels.
    ///
    /// Only one profile may be selected per context; a second selection
    /// fails with [`Error::ProfileAlreadySelected`] and keeps the first.
    pub fn select_board(&self, profile: BoardProfile) -> Result<()> {
        if let Some(existing) = self.resolver.get() {
            warn!(board = %existing.profile(), requested = %profile, "Board profile already selected");
            return Err(Error::ProfileAlreadySelected(existing.profile()));
        }
        let resolver = PinResolver::new(profile)?;
        self.resolver.set(resolver).map_err(|_| {
            let existing = self.board().unwrap_or(profile);
            warn!(board = %existing, requested = %profile, "Board profile already selected");
            Error::ProfileAlreadySelected(existing)
        })?;
        info!(board = %profile, description = profile.description(), "Board profile selected");
        Ok(())
    }

    pub fn board(&self) -> Option<BoardProfile> {
        self.resolver.get().map(PinResolver::profile)
    }

    /// Map a pin label to a line offset.
    ///
    /// Without a board profile the label must be a decimal line number.
    pub fn resolve_pin(&self, label: &str) -> Result<u32> {
        match self.resolver.get() {
            Some(resolver) => resolver.resolve(label),
            None => label
                .parse()
                .map_err(|_| Error::UnknownPin(label.to_string())),
        }
    }

    /// Framework initialization hook, called before and after records are
    /// initialized. The event thread starts after records. Repeated calls
    /// are no-ops.
    pub fn init(&self, phase: InitPhase) -> Result<()> {
        match phase {
            InitPhase::BeforeRecords => {
                debug!(backend = %self.config.backend, board = ?self.board(), "Device support initializing");
                Ok(())
            }
            InitPhase::AfterRecords => self.multiplexer.start().inspect_err(|e| {
                error!(error = %e, "Failed to start event multiplexer");
            }),
        }
    }

    /// Receiver of reprocessing requests. Returns `None` after the first
    /// call.
    pub fn take_scan_requests(&self) -> Option<mpsc::UnboundedReceiver<ScanRequest>> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Parse the record's link, resolve and acquire its lines.
    ///
    /// On failure the record stays unbound; other records are unaffected.
    pub fn init_record(&self, config: &RecordConfig) -> Result<RecordInit> {
        self.try_init_record(config).inspect_err(|e| {
            error!(record = %config.name, link = %config.link, error = %e, "Record initialization failed");
        })
    }

    fn try_init_record(&self, config: &RecordConfig) -> Result<RecordInit> {
        let spec = if config.kind.is_multi_bit() {
            link::parse_multi(&config.link, MAX_LINK_LINES)?
        } else {
            link::parse_simple(&config.link)?
        };

        let mut offsets = Vec::with_capacity(spec.line_count());
        offsets.push(self.resolve_pin(&spec.pin)?);
        offsets.extend_from_slice(&spec.extra);

        let settings = match config.kind.direction() {
            Direction::Input => LineSettings::input(),
            Direction::Output => LineSettings::output(),
        }
        .with_polarity(spec.polarity);

        let resource = self.acquire(&offsets, settings)?;
        let mask = bits::low_mask(resource.line_count());
        let initial_value = if config.kind.is_input() {
            Some(to_record_value(resource.get(mask)?))
        } else {
            None
        };

        let line_count = resource.line_count();
        let key = self.records_mut().insert_with_key(|key| Record {
            name: config.name.clone(),
            kind: config.kind,
            mask,
            edge: default_edge(&spec),
            resource,
            binding: NotificationBinding::new(key, config.name.clone()),
        });
        debug!(record = %config.name, kind = %config.kind, ?offsets, "Record initialized");

        Ok(RecordInit {
            key,
            line_count,
            mask,
            initial_value,
        })
    }

    fn acquire(&self, offsets: &[u32], settings: LineSettings) -> Result<LineResource> {
        match &self.access {
            Access::Cdev(manager) => Ok(LineResource::Group(manager.acquire(offsets, settings)?)),
            Access::Sysfs(gpio) => match offsets {
                [offset] => Ok(LineResource::Sysfs(gpio.export(*offset, settings)?)),
                _ => Err(Error::InvalidConfiguration(format!(
                    "sysfs backend drives one line per record, {} given",
                    offsets.len()
                ))),
            },
        }
    }

    /// Place the record on, or take it off, interrupt scanning.
    ///
    /// `Add` enables edge detection, then watches the record's lines;
    /// adding a record twice keeps the first registration. `Remove` stops
    /// watching, clears any outstanding request and disables edge
    /// detection; removing a record that was never added is harmless.
    ///
    /// Returns the record's notification binding, which tags its
    /// [`ScanRequest`]s.
    pub fn get_scan_interrupt(
        &self,
        cmd: ScanCommand,
        key: RecordKey,
    ) -> Result<Arc<NotificationBinding>> {
        let record = self.record(key)?;
        self.scan_interrupt(cmd, key, &record).inspect_err(|e| {
            error!(record = %record.name, command = ?cmd, error = %e, "Interrupt scan change failed");
        })?;
        Ok(record.binding)
    }

    fn scan_interrupt(&self, cmd: ScanCommand, key: RecordKey, record: &Record) -> Result<()> {
        if !record.kind.is_input() {
            return Err(Error::InvalidConfiguration(format!(
                "{} records cannot be scanned on interrupt",
                record.kind
            )));
        }
        match cmd {
            ScanCommand::Add => {
                if self.multiplexer.is_registered(key) {
                    return Ok(());
                }
                record.resource.set_edge(record.edge)?;
                self.multiplexer
                    .register(record.resource.downgrade(), Arc::clone(&record.binding));
            }
            ScanCommand::Remove => {
                self.multiplexer.cancel(key);
                if record.resource.settings().edge.is_enabled() {
                    record.resource.set_edge(EdgeMode::None)?;
                    // Events queued before the edge was disabled must not
                    // reach a later registration.
                    record.resource.drain_events()?;
                }
            }
        }
        Ok(())
    }

    /// Read the record's lines as a packed value.
    pub fn read(&self, key: RecordKey) -> Result<u32> {
        let record = self.record(key)?;
        let value = record.resource.get(record.mask).inspect_err(|e| {
            error!(record = %record.name, error = %e, "Could not read value");
        })?;
        trace!(record = %record.name, value, "Read");
        Ok(to_record_value(value))
    }

    /// Drive the record's lines from the packed `value`. Bits beyond the
    /// record's lines are ignored.
    pub fn write(&self, key: RecordKey, value: u32) -> Result<()> {
        let record = self.record(key)?;
        let value = u64::from(value) & record.mask;
        record.resource.set(record.mask, value).inspect_err(|e| {
            error!(record = %record.name, error = %e, "Could not write value");
        })?;
        trace!(record = %record.name, value, "Wrote");
        Ok(())
    }

    /// Unbind the record, stop watching it and release its lines.
    pub fn release_record(&self, key: RecordKey) -> Result<()> {
        let record = self.records_mut().remove(key).ok_or(Error::UnknownRecord)?;
        self.multiplexer.cancel(key);
        record.resource.release();
        debug!(record = %record.name, "Record released");
        Ok(())
    }

    /// Stop the event thread and release every record's lines.
    pub fn shutdown(&self) {
        self.multiplexer.stop();
        let records: Vec<Record> = self.records_mut().drain().map(|(_, r)| r).collect();
        for record in &records {
            record.resource.release();
        }
        info!(records = records.len(), "Device support shut down");
    }

    pub fn record_count(&self) -> usize {
        self.records().len()
    }

    /// Line offsets bound to the record, in bit order.
    pub fn record_offsets(&self, key: RecordKey) -> Result<Vec<u32>> {
        Ok(self.record(key)?.resource.offsets())
    }

    pub fn multiplexer_state(&self) -> MultiplexerState {
        self.multiplexer.state()
    }

    pub fn sysfs_root(&self) -> Option<&Path> {
        match &self.access {
            Access::Sysfs(gpio) => Some(gpio.root()),
            Access::Cdev(_) => None,
        }
    }

    fn record(&self, key: RecordKey) -> Result<Record> {
        self.records().get(key).cloned().ok_or(Error::UnknownRecord)
    }

    fn records(&self) -> RwLockReadGuard<'_, SlotMap<RecordKey, Record>> {
        self.records.read().unwrap_or_else(|p| p.into_inner())
    }

    fn records_mut(&self) -> RwLockWriteGuard<'_, SlotMap<RecordKey, Record>> {
        self.records.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn default_edge(spec: &LinkSpec) -> EdgeMode {
    spec.edge.unwrap_or(EdgeMode::Both)
}

// Record links carry at most MAX_LINK_LINES (32) lines.
fn to_record_value(packed: u64) -> u32 {
    packed as u32
}
