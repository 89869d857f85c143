//! Logging setup for programs built on this crate.
//!
//! A program calls [`init_journald_or_stdout`] once at startup. Library
//! code uses `use crate::tracing::prelude::*` for the level macros.

use std::env;
use std::fmt::{self, Write as _};

use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const CRATE_PREFIX: &str = "devgpio::";

/// Install a subscriber: journald when started by systemd, stdout
/// otherwise.
pub fn init_journald_or_stdout() {
    if env::var_os("JOURNAL_STREAM").is_some() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry().with(layer).init(),
            Err(e) => {
                use_stdout();
                error!(error = %e, "Failed to initialize journald logging, using stdout");
            }
        }
    } else {
        use_stdout();
    }
}

// Filter by RUST_LOG, defaulting to INFO instead of ERROR.
fn use_stdout() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().event_format(LineFormat))
        .init();
}

/// One line per event: time, level, short target, message, then fields.
struct LineFormat;

#[derive(Default)]
struct Fields {
    message: String,
    rest: String,
}

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.rest, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else if !field.name().starts_with("log.") {
            let _ = write!(self.rest, " {}={:?}", field.name(), value);
        }
    }
}

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = Fields::default();
        event.record(&mut fields);

        LocalTimer.format_time(&mut writer)?;

        let level = *event.metadata().level();
        let color = match level {
            Level::ERROR => "\x1b[31m",
            Level::WARN => "\x1b[33m",
            Level::INFO => "\x1b[32m",
            Level::DEBUG => "\x1b[34m",
            Level::TRACE => "\x1b[35m",
        };
        let target = event.metadata().target();
        let target = target.strip_prefix(CRATE_PREFIX).unwrap_or(target);

        write!(writer, " {color}{level:<5}\x1b[0m {target}: {}", fields.message)?;
        if !fields.rest.is_empty() {
            write!(writer, "\x1b[90m{}\x1b[0m", fields.rest)?;
        }
        writeln!(writer)
    }
}

// Local time to the second; the default timer is UTC and verbose.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let format = time::macros::format_description!("[hour]:[minute]:[second]");
        match now.format(format) {
            Ok(stamp) => write!(w, "{stamp}"),
            Err(_) => write!(w, "--:--:--"),
        }
    }
}
