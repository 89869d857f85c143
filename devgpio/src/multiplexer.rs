//! Edge-event multiplexer.
//!
//! One dedicated thread waits on the descriptors of every interrupt-enabled
//! record and turns edge events into [`ScanRequest`]s sent over a channel.
//!
//! ## Loop
//!
//! Each pass takes a snapshot of the registrations, pinning each live
//! descriptor for the duration of the wait. With nothing registered the
//! thread waits on its waker alone for the idle interval. Otherwise it
//! polls the waker plus every pinned descriptor with the bounded wait
//! interval, then dispatches the ready ones: one event record is read per
//! descriptor and, if the record has no request outstanding, a request is
//! sent. Additional edges are coalesced.
//!
//! ## Cancellation
//!
//! Dispatch of a descriptor holds the registration table lock and checks
//! that the registration it snapshotted is still current, so a concurrent
//! [`cancel`](EventMultiplexer::cancel) either waits for that dispatch to
//! finish or causes it to be skipped. Registration and cancellation wake the
//! loop through a self-pipe so the wait set is rebuilt promptly.
//!
//! The multiplexer never owns line resources. It holds weak references, and
//! a handle pinned by a snapshot is dropped at the end of the pass. An
//! explicit release wakes the loop through the waker installed at
//! registration and waits for that pass to end, so the descriptor is closed
//! by the releasing thread.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::notify::{NotificationBinding, RecordKey, ScanRequest};
use crate::resource::{Watch, WeakResource};
use crate::tracing::prelude::*;

/// Wait intervals of the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplexerConfig {
    /// Bounded wait while at least one record is registered.
    pub wait: Duration,
    /// Suspension between checks while nothing is registered.
    pub idle: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(1000),
            idle: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum MultiplexerState {
    /// No interrupt-enabled records.
    Idle,
    /// Blocked in the bounded wait.
    Watching,
    /// Reading events from ready descriptors.
    Dispatching,
}

struct Registration {
    source: WeakResource,
    binding: Arc<NotificationBinding>,
    generation: u64,
}

#[derive(Default)]
struct Table {
    registrations: HashMap<RecordKey, Registration>,
    next_generation: u64,
}

/// Self-pipe used to interrupt the wait.
struct Waker {
    read: File,
    write: File,
}

impl Waker {
    fn new() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self {
            read: File::from(read),
            write: File::from(write),
        })
    }

    fn wake(&self) {
        // A full pipe already guarantees a wakeup.
        let _ = (&self.write).write(&[1]);
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        while matches!((&self.read).read(&mut buf), Ok(n) if n > 0) {}
    }
}

struct Shared {
    config: MultiplexerConfig,
    table: Mutex<Table>,
    dispatching: AtomicBool,
    waker: Waker,
    requests: mpsc::UnboundedSender<ScanRequest>,
    shutdown: CancellationToken,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Handle to the multiplexer thread.
pub struct EventMultiplexer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventMultiplexer {
    /// Create a stopped multiplexer and the receiver its requests arrive on.
    pub fn new(config: MultiplexerConfig) -> Result<(Self, mpsc::UnboundedReceiver<ScanRequest>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let waker = Waker::new().map_err(|source| Error::DeviceUnavailable {
            context: "multiplexer waker".into(),
            source,
        })?;
        let shared = Arc::new(Shared {
            config,
            table: Mutex::new(Table::default()),
            dispatching: AtomicBool::new(false),
            waker,
            requests: tx,
            shutdown: CancellationToken::new(),
        });
        Ok((
            Self {
                shared,
                thread: Mutex::new(None),
            },
            rx,
        ))
    }

    /// Spawn the event thread. Calling it while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock().unwrap_or_else(|p| p.into_inner());
        if thread.is_some() {
            return Ok(());
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::InvalidConfiguration(
                "multiplexer was stopped and cannot be restarted".into(),
            ));
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("devgpio-irq".to_string())
            .spawn(move || {
                run(&shared);
                trace!("Event multiplexer thread exiting");
            })?;
        *thread = Some(handle);
        debug!(
            wait_ms = self.shared.config.wait.as_millis() as u64,
            idle_ms = self.shared.config.idle.as_millis() as u64,
            "Event multiplexer started"
        );
        Ok(())
    }

    /// Stop the event thread and wait for it to exit.
    pub fn stop(&self) {
        self.shared.shutdown.cancel();
        self.shared.waker.wake();
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Event multiplexer thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Watch `source` for `binding`'s record.
    ///
    /// Returns `false` if the record is already registered; the existing
    /// binding is kept.
    pub fn register(&self, source: WeakResource, binding: Arc<NotificationBinding>) -> bool {
        let key = binding.record();
        {
            let mut table = self.shared.table();
            if table.registrations.contains_key(&key) {
                return false;
            }
            let shared = Arc::downgrade(&self.shared);
            source.set_waker(Arc::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.waker.wake();
                }
            }));
            table.next_generation += 1;
            let generation = table.next_generation;
            debug!(record = binding.name(), "Interrupt registered");
            table.registrations.insert(
                key,
                Registration {
                    source,
                    binding,
                    generation,
                },
            );
        }
        self.shared.waker.wake();
        true
    }

    /// Stop watching `key` and clear its outstanding request, if any.
    ///
    /// Returns `false` if the record was not registered.
    pub fn cancel(&self, key: RecordKey) -> bool {
        let removed = self.shared.table().registrations.remove(&key);
        match removed {
            Some(registration) => {
                registration.binding.clear();
                debug!(record = registration.binding.name(), "Interrupt cancelled");
                self.shared.waker.wake();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, key: RecordKey) -> bool {
        self.shared.table().registrations.contains_key(&key)
    }

    pub fn registrations(&self) -> usize {
        self.shared.table().registrations.len()
    }

    pub fn state(&self) -> MultiplexerState {
        if self.shared.dispatching.load(Ordering::Acquire) {
            MultiplexerState::Dispatching
        } else if self.registrations() == 0 {
            MultiplexerState::Idle
        } else {
            MultiplexerState::Watching
        }
    }
}

impl Drop for EventMultiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Pinned {
    key: RecordKey,
    generation: u64,
    watch: Watch,
}

fn run(shared: &Shared) {
    while !shared.shutdown.is_cancelled() {
        let pinned = snapshot(shared);
        let timeout = if pinned.is_empty() {
            shared.config.idle
        } else {
            shared.config.wait
        };

        let mut fds = Vec::with_capacity(pinned.len() + 1);
        fds.push(PollFd::new(shared.waker.read.as_fd(), PollFlags::POLLIN));
        for p in &pinned {
            fds.push(PollFd::new(p.watch.fd(), p.watch.interest()));
        }

        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "Event wait failed");
                thread::sleep(shared.config.wait);
                continue;
            }
        }

        if fds[0].revents().is_some_and(|r| !r.is_empty()) {
            shared.waker.drain();
        }

        let ready: Vec<usize> = fds[1..]
            .iter()
            .enumerate()
            .filter(|(i, fd)| {
                let wanted = pinned[*i].watch.interest() | PollFlags::POLLERR | PollFlags::POLLHUP;
                fd.revents().is_some_and(|r| r.intersects(wanted))
            })
            .map(|(i, _)| i)
            .collect();
        drop(fds);

        if ready.is_empty() {
            continue;
        }
        shared.dispatching.store(true, Ordering::Release);
        for i in ready {
            dispatch(shared, &pinned[i]);
        }
        shared.dispatching.store(false, Ordering::Release);
    }
}

fn snapshot(shared: &Shared) -> Vec<Pinned> {
    shared
        .table()
        .registrations
        .iter()
        .filter_map(|(&key, reg)| {
            reg.source.watch().map(|watch| Pinned {
                key,
                generation: reg.generation,
                watch,
            })
        })
        .collect()
}

fn dispatch(shared: &Shared, pinned: &Pinned) {
    let table = shared.table();
    let Some(registration) = table.registrations.get(&pinned.key) else {
        trace!("Skipping event for cancelled record");
        return;
    };
    if registration.generation != pinned.generation {
        trace!("Skipping event for re-registered record");
        return;
    }
    let binding = &registration.binding;

    let event = match pinned.watch.read_event() {
        Ok(Some(event)) => event,
        Ok(None) => return,
        Err(e) => {
            warn!(record = binding.name(), error = %e, "Transient event read error");
            return;
        }
    };

    match binding.try_claim(event) {
        Some(request) => {
            trace!(record = binding.name(), offset = event.offset, kind = ?event.kind, "Requesting scan");
            if shared.requests.send(request).is_err() {
                trace!("Scan request receiver closed");
            }
        }
        None => {
            trace!(record = binding.name(), offset = event.offset, "Coalesced edge event");
        }
    }
}

fn poll_timeout(interval: Duration) -> PollTimeout {
    let ms = u16::try_from(interval.as_millis()).unwrap_or(u16::MAX);
    PollTimeout::from(ms)
}
