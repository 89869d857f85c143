//! Legacy sysfs GPIO backend (`/sys/class/gpio`).
//!
//! A line is acquired by writing its number to `export`, which makes the
//! kernel create `gpioN/` with `direction`, `value`, `edge` and
//! `active_low` attributes. On boards where a udev rule hands out write
//! permission to those attributes, the rule races with us, so acquisition
//! waits until `direction` is readable and writable before configuring the
//! line. Release writes the number to `unexport`.
//!
//! This backend handles one line per request.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::unistd::{access, AccessFlags};

use crate::error::{Error, Result};
use crate::line::{Direction, EdgeEvent, EdgeKind, EdgeMode, LineSettings, Polarity};
use crate::registry::{GroupId, LineRegistry};
use crate::resource::{PinGate, PinGuard, Wake};
use crate::tracing::prelude::*;

/// Retry budget for the udev permission wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionWait {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PermissionWait {
    fn default() -> Self {
        Self {
            attempts: 100,
            interval: Duration::from_micros(500),
        }
    }
}

/// Poll `path` for read and write access.
///
/// Fails with [`Error::Timeout`] once `wait.attempts` checks have failed.
pub fn wait_for_permission(path: &Path, offset: u32, wait: PermissionWait) -> Result<()> {
    for attempt in 0..wait.attempts {
        if access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok() {
            if attempt > 0 {
                debug!(offset, attempt, "Attribute became accessible");
            }
            return Ok(());
        }
        thread::sleep(wait.interval);
    }
    warn!(offset, path = %path.display(), attempts = wait.attempts, "Attribute not accessible");
    Err(Error::Timeout {
        offset,
        attempts: wait.attempts,
    })
}

/// Handle to a sysfs GPIO class directory.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
    wait: PermissionWait,
    registry: Arc<LineRegistry>,
}

impl SysfsGpio {
    pub fn new(root: impl Into<PathBuf>, wait: PermissionWait, registry: Arc<LineRegistry>) -> Self {
        Self {
            root: root.into(),
            wait,
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn line_dir(&self, offset: u32) -> PathBuf {
        self.root.join(format!("gpio{offset}"))
    }

    /// Export `offset` and configure it with `settings`.
    ///
    /// A line whose attribute directory already exists was exported by
    /// someone else and fails with [`Error::AlreadyInUse`].
    pub fn export(&self, offset: u32, settings: LineSettings) -> Result<SysfsLine> {
        settings.validate()?;
        self.registry.begin(&[offset], &settings)?;

        let dir = self.line_dir(offset);
        if dir.exists() {
            self.registry.abort(&[offset]);
            return Err(Error::AlreadyInUse {
                offset,
                consumer: None,
            });
        }

        if let Err(e) = write_control(&self.root.join("export"), offset) {
            self.registry.abort(&[offset]);
            return Err(e);
        }

        match self.configure(offset, &dir, &settings) {
            Ok(value) => {
                let group = self.registry.grant(&[offset]);
                debug!(offset, direction = %settings.direction, "Exported line");
                Ok(SysfsLine {
                    inner: Arc::new(SysfsInner {
                        offset,
                        dir,
                        root: self.root.clone(),
                        group,
                        settings: Mutex::new(settings),
                        value: RwLock::new(Some(Arc::new(value))),
                        gate: Arc::default(),
                        registry: Arc::clone(&self.registry),
                    }),
                })
            }
            Err(e) => {
                if let Err(u) = write_control(&self.root.join("unexport"), offset) {
                    warn!(offset, error = %u, "Unexport after failed configuration failed");
                }
                self.registry.abort(&[offset]);
                Err(e)
            }
        }
    }

    fn configure(&self, offset: u32, dir: &Path, settings: &LineSettings) -> Result<SysfsValue> {
        wait_for_permission(&dir.join("direction"), offset, self.wait)?;

        let active_low = match settings.polarity {
            Polarity::ActiveHigh => "0",
            Polarity::ActiveLow => "1",
        };
        write_attr(dir, "active_low", offset, active_low)?;
        write_attr(dir, "direction", offset, &settings.direction.to_string())?;
        if settings.edge.is_enabled() {
            write_attr(dir, "edge", offset, &settings.edge.to_string())?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(settings.direction == Direction::Output)
            .open(dir.join("value"))
            .map_err(|e| Error::from_request(offset, "open value attribute", e))?;
        let value = SysfsValue { offset, file };
        // Reading once clears the pending priority event the attribute
        // reports right after open.
        value.read()?;
        Ok(value)
    }
}

fn write_control(path: &Path, offset: u32) -> Result<()> {
    fs::write(path, offset.to_string()).map_err(|e| {
        Error::from_request(offset, format!("write {}", path.display()), e)
    })
}

fn write_attr(dir: &Path, attr: &str, offset: u32, value: &str) -> Result<()> {
    trace!(offset, attr, value, "Writing attribute");
    fs::write(dir.join(attr), value)
        .map_err(|e| Error::from_request(offset, format!("write {attr}"), e))
}

/// The open `value` attribute of an exported line.
#[derive(Debug)]
pub struct SysfsValue {
    offset: u32,
    file: File,
}

impl SysfsValue {
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Logical level; the kernel applies `active_low`.
    pub fn read(&self) -> io::Result<bool> {
        let mut buf = [0u8; 4];
        let n = self.file.read_at(&mut buf, 0)?;
        match buf[..n].first() {
            Some(b'0') => Ok(false),
            Some(b'1') => Ok(true),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected value attribute contents for line {}", self.offset),
            )),
        }
    }

    pub fn write(&self, level: bool) -> io::Result<()> {
        let text: &[u8] = if level { b"1" } else { b"0" };
        self.file.write_all_at(text, 0)
    }

    /// Descriptor to poll for `POLLPRI` when edge detection is enabled.
    pub fn event_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// Re-read the attribute after a priority wakeup.
    ///
    /// sysfs reports no edge direction, so it is derived from the level.
    pub fn read_event(&self) -> io::Result<Option<EdgeEvent>> {
        let level = self.read()?;
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Ok(Some(EdgeEvent {
            offset: self.offset,
            kind: if level {
                EdgeKind::Rising
            } else {
                EdgeKind::Falling
            },
            timestamp_ns,
            seqno: 0,
            line_seqno: 0,
        }))
    }
}

struct SysfsInner {
    offset: u32,
    dir: PathBuf,
    root: PathBuf,
    group: GroupId,
    settings: Mutex<LineSettings>,
    value: RwLock<Option<Arc<SysfsValue>>>,
    gate: Arc<PinGate>,
    registry: Arc<LineRegistry>,
}

impl SysfsInner {
    fn value(&self) -> Result<Arc<SysfsValue>> {
        self.value
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(Error::Released)
    }

    fn settings(&self) -> LineSettings {
        *self.settings.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pin(&self) -> Option<(Arc<SysfsValue>, PinGuard)> {
        let slot = self.value.read().unwrap_or_else(|p| p.into_inner());
        let value = slot.as_ref()?;
        Some((Arc::clone(value), self.gate.pin()))
    }

    fn release(&self, wait: bool) -> bool {
        let value = self.value.write().unwrap_or_else(|p| p.into_inner()).take();
        let Some(value) = value else {
            return false;
        };
        if wait {
            self.gate.wait_unpinned();
        }
        drop(value);
        if let Err(e) = write_control(&self.root.join("unexport"), self.offset) {
            warn!(offset = self.offset, error = %e, "Unexport failed");
        }
        self.registry.release(&[self.offset], self.group);
        true
    }
}

impl Drop for SysfsInner {
    fn drop(&mut self) {
        if self.release(false) {
            debug!(offset = self.offset, "Unexported line on drop");
        }
    }
}

/// One exported sysfs line. Clones share the export.
#[derive(Clone)]
pub struct SysfsLine {
    inner: Arc<SysfsInner>,
}

impl std::fmt::Debug for SysfsLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysfsLine")
            .field("offset", &self.inner.offset)
            .field("settings", &self.inner.settings())
            .finish()
    }
}

impl SysfsLine {
    pub fn offset(&self) -> u32 {
        self.inner.offset
    }

    pub fn settings(&self) -> LineSettings {
        self.inner.settings()
    }

    pub fn get(&self) -> Result<bool> {
        Ok(self.inner.value()?.read()?)
    }

    pub fn set(&self, level: bool) -> Result<()> {
        if self.settings().direction != Direction::Output {
            return Err(Error::InvalidConfiguration(format!(
                "line {} is not an output",
                self.inner.offset
            )));
        }
        Ok(self.inner.value()?.write(level)?)
    }

    /// Write the `edge` attribute.
    pub fn set_edge(&self, edge: EdgeMode) -> Result<()> {
        let value = self.inner.value()?;
        let mut settings = self.inner.settings.lock().unwrap_or_else(|p| p.into_inner());
        let updated = settings.with_edge(edge);
        updated.validate()?;
        write_attr(&self.inner.dir, "edge", self.inner.offset, &edge.to_string())?;
        *settings = updated;
        self.inner
            .registry
            .set_edge(&[self.inner.offset], self.inner.group, edge);
        // Clear a wakeup left over from the previous mode.
        value.read()?;
        Ok(())
    }

    /// Unexport the line. Calling it again is a no-op.
    ///
    /// The `value` attribute is closed before the line is unexported, even
    /// while the event loop is watching it.
    pub fn release(&self) {
        if self.inner.release(true) {
            debug!(offset = self.inner.offset, "Unexported line");
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner
            .value
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_none()
    }

    pub fn downgrade(&self) -> WeakSysfsLine {
        WeakSysfsLine {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// A reference that neither keeps the export alive nor releases it.
#[derive(Debug, Clone)]
pub struct WeakSysfsLine {
    inner: Weak<SysfsInner>,
}

impl WeakSysfsLine {
    pub(crate) fn pin(&self) -> Option<(Arc<SysfsValue>, PinGuard)> {
        self.inner.upgrade()?.pin()
    }

    pub(crate) fn set_waker(&self, wake: Wake) {
        if let Some(inner) = self.inner.upgrade() {
            inner.gate.set_waker(wake);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::line::Ownership;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// A scratch directory laid out like `/sys/class/gpio`.
    pub(crate) struct ScratchSysfs {
        pub root: PathBuf,
    }

    impl ScratchSysfs {
        pub(crate) fn new(name: &str) -> Self {
            static COUNTER: AtomicUsize = AtomicUsize::new(0);
            let root = std::env::temp_dir().join(format!(
                "devgpio-{}-{}-{}",
                name,
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed)
            ));
            fs::create_dir_all(&root).unwrap();
            Self { root }
        }

        /// Create the attribute files the kernel would make on export.
        pub(crate) fn create_line(&self, offset: u32) {
            create_line(&self.root, offset);
        }

        /// Play the kernel and udev: once `export` names `offset`, create
        /// its attributes after `delay`.
        pub(crate) fn serve_export(&self, offset: u32, delay: Duration) -> thread::JoinHandle<()> {
            let root = self.root.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    let exported = fs::read_to_string(root.join("export")).unwrap_or_default();
                    if exported.trim() == offset.to_string() {
                        thread::sleep(delay);
                        create_line(&root, offset);
                        return;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            })
        }

        pub(crate) fn attr(&self, offset: u32, attr: &str) -> String {
            fs::read_to_string(self.root.join(format!("gpio{offset}")).join(attr))
                .unwrap()
                .trim()
                .to_string()
        }

        pub(crate) fn gpio(&self, attempts: u32) -> SysfsGpio {
            SysfsGpio::new(
                &self.root,
                PermissionWait {
                    attempts,
                    interval: Duration::from_millis(2),
                },
                Arc::new(LineRegistry::new("devgpio-test")),
            )
        }
    }

    fn create_line(root: &Path, offset: u32) {
        let dir = root.join(format!("gpio{offset}"));
        fs::create_dir_all(&dir).unwrap();
        for (attr, contents) in [
            ("direction", "in"),
            ("value", "0"),
            ("edge", "none"),
            ("active_low", "0"),
        ] {
            fs::write(dir.join(attr), contents).unwrap();
        }
    }

    impl Drop for ScratchSysfs {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn test_export_waits_for_attributes() {
        let scratch = ScratchSysfs::new("export");
        let gpio = scratch.gpio(500);
        let server = scratch.serve_export(17, Duration::from_millis(20));

        let line = gpio
            .export(17, LineSettings::output().with_polarity(Polarity::ActiveLow))
            .unwrap();
        server.join().unwrap();

        assert_eq!(scratch.attr(17, "direction"), "out");
        assert_eq!(scratch.attr(17, "active_low"), "1");
        assert_eq!(gpio.registry.state(17), Ownership::Granted);

        line.set(true).unwrap();
        assert_eq!(scratch.attr(17, "value"), "1");
        assert!(line.get().unwrap());
    }

    #[test]
    fn test_permission_wait_times_out() {
        let scratch = ScratchSysfs::new("timeout");
        let gpio = scratch.gpio(5);

        let err = gpio.export(4, LineSettings::input()).unwrap_err();
        assert!(matches!(err, Error::Timeout { offset: 4, attempts: 5 }));
        assert_eq!(gpio.registry.state(4), Ownership::Unowned);
        // The export was rolled back
        assert_eq!(
            fs::read_to_string(scratch.root.join("unexport")).unwrap(),
            "4"
        );
    }

    #[test]
    fn test_existing_export_is_in_use() {
        let scratch = ScratchSysfs::new("in-use");
        scratch.create_line(22);
        let gpio = scratch.gpio(5);

        let err = gpio.export(22, LineSettings::input()).unwrap_err();
        assert!(matches!(err, Error::AlreadyInUse { offset: 22, .. }));
        assert!(!scratch.root.join("export").exists());
        assert_eq!(gpio.registry.state(22), Ownership::Unowned);
    }

    #[test]
    fn test_release_unexports_once() {
        let scratch = ScratchSysfs::new("release");
        let gpio = scratch.gpio(500);
        let server = scratch.serve_export(9, Duration::ZERO);
        let line = gpio.export(9, LineSettings::input()).unwrap();
        server.join().unwrap();

        line.release();
        assert_eq!(
            fs::read_to_string(scratch.root.join("unexport")).unwrap(),
            "9"
        );
        fs::remove_file(scratch.root.join("unexport")).unwrap();

        line.release();
        drop(line);
        assert!(!scratch.root.join("unexport").exists());
        assert_eq!(gpio.registry.state(9), Ownership::Released);
    }

    #[test]
    fn test_input_rejects_writes_and_output_rejects_edges() {
        let scratch = ScratchSysfs::new("rules");
        let gpio = scratch.gpio(500);

        let server = scratch.serve_export(3, Duration::ZERO);
        let input = gpio.export(3, LineSettings::input()).unwrap();
        server.join().unwrap();
        assert!(matches!(input.set(true), Err(Error::InvalidConfiguration(_))));
        input.set_edge(EdgeMode::Both).unwrap();
        assert_eq!(scratch.attr(3, "edge"), "both");

        let server = scratch.serve_export(4, Duration::ZERO);
        let output = gpio.export(4, LineSettings::output()).unwrap();
        server.join().unwrap();
        assert!(matches!(
            output.set_edge(EdgeMode::Rising),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_wait_for_permission_sees_late_file() {
        let scratch = ScratchSysfs::new("wait");
        let path = scratch.root.join("late");
        let writer = {
            let path = path.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                fs::write(path, "").unwrap();
            })
        };
        let wait = PermissionWait {
            attempts: 1000,
            interval: Duration::from_millis(1),
        };
        wait_for_permission(&path, 1, wait).unwrap();
        writer.join().unwrap();
    }
}
