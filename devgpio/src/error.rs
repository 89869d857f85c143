//! Error type shared by every part of the GPIO subsystem.
//!
//! Configuration and acquisition errors are reported once, at record
//! initialization, and leave only that record disabled. Runtime errors from
//! get/set surface to the calling read or write. Event read hiccups inside
//! the multiplexer never become an `Error`; they are logged and skipped.

use std::io;

use nix::errno::Errno;

use crate::board::BoardProfile;

/// Errors returned by line resolution, acquisition and access.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The key, name or number is not part of the selected board profile.
    #[error("unknown pin '{0}'")]
    UnknownPin(String),

    /// The line is held by another owner (or already by this process).
    #[error("line {offset} already in use{}", owner_suffix(.consumer))]
    AlreadyInUse {
        offset: u32,
        consumer: Option<String>,
    },

    /// The kernel or filesystem refused access to the line.
    #[error("permission denied for line {offset}: {source}")]
    PermissionDenied {
        offset: u32,
        #[source]
        source: io::Error,
    },

    /// Line attributes did not become accessible within the retry budget.
    #[error("cannot access line {offset} after {attempts} attempts")]
    Timeout { offset: u32, attempts: u32 },

    /// Direction/edge mismatch, malformed pin specification and similar.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Opening the controller or issuing a control request failed.
    #[error("device unavailable ({context}): {source}")]
    DeviceUnavailable {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A board profile was already selected for this process.
    #[error("board profile already selected: {0}")]
    ProfileAlreadySelected(BoardProfile),

    /// The handle was released before the operation.
    #[error("line handle already released")]
    Released,

    /// No record is bound to the given key.
    #[error("no record bound to this key")]
    UnknownRecord,

    /// Runtime I/O failure while reading or writing line values.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Map an errno-carrying I/O error from a control request on `offset`.
    pub(crate) fn from_request(offset: u32, context: impl Into<String>, source: io::Error) -> Self {
        match source.raw_os_error().map(Errno::from_raw) {
            Some(Errno::EBUSY) => Error::AlreadyInUse {
                offset,
                consumer: None,
            },
            Some(Errno::EACCES | Errno::EPERM) => Error::PermissionDenied { offset, source },
            Some(Errno::EINVAL) => {
                Error::InvalidConfiguration(format!("{}: {}", context.into(), source))
            }
            _ => Error::DeviceUnavailable {
                context: context.into(),
                source,
            },
        }
    }
}

fn owner_suffix(consumer: &Option<String>) -> String {
    match consumer {
        Some(c) => format!(" by '{c}'"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
