//! Command-line tool to inspect and drive GPIO lines.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use devgpio::chip::linux::CdevChip;
use devgpio::chip::GpioChip;
use devgpio::registry::LineRegistry;
use devgpio::{
    Backend, BoardProfile, DeviceConfig, DeviceSupport, InitPhase, LineManager,
    LineSettings, PinResolver, Polarity, RecordConfig, RecordKind, ScanCommand,
};
use tracing::debug;

/// Inspect and drive GPIO lines
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// GPIO character device (default: DEVGPIO_CHIP or /dev/gpiochip0)
    #[arg(short, long, global = true)]
    chip: Option<PathBuf>,

    /// Board profile for pin labels, e.g. "RASPI B+"
    #[arg(short, long, global = true)]
    board: Option<BoardProfile>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show which line offset a pin label maps to
    Resolve {
        /// Board key, name or number
        label: String,
    },

    /// List controller lines with their owners
    Info {
        /// Only these lines (default: all)
        pins: Vec<String>,
    },

    /// Read lines as one packed value
    Get {
        #[arg(required = true)]
        pins: Vec<String>,

        /// Lines are active low
        #[arg(short, long)]
        low: bool,
    },

    /// Drive lines from a packed value
    Set {
        /// Value, decimal or 0x/0b prefixed; bit 0 is the first pin
        value: String,

        #[arg(required = true)]
        pins: Vec<String>,

        /// Lines are active low
        #[arg(short, long)]
        low: bool,

        /// Keep the lines requested this long before releasing them
        #[arg(long, default_value_t = 0)]
        hold_ms: u64,
    },

    /// Print the value of a record link each time its lines change
    Watch {
        /// Link in multi-line form, e.g. "J8-11 low falling"
        link: String,

        /// Use the legacy sysfs interface instead of the character device
        #[arg(long)]
        sysfs: bool,

        /// Stop after this many changes
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("devgpio=debug".parse()?)
                    .add_directive("gpioprobe=debug".parse()?),
            )
            .init();
    } else {
        devgpio::tracing::init_journald_or_stdout();
    }

    let mut config = DeviceConfig::from_env().context("Invalid DEVGPIO_* configuration")?;
    if let Some(chip) = args.chip {
        config.chip = chip;
    }
    if args.board.is_some() {
        config.board = args.board;
    }
    config.consumer = "gpioprobe".into();
    debug!(?config, "Configuration");

    match args.command {
        Command::Resolve { label } => resolve(&config, &label),
        Command::Info { pins } => info(&config, &pins),
        Command::Get { pins, low } => get(&config, &pins, low),
        Command::Set {
            value,
            pins,
            low,
            hold_ms,
        } => set(&config, &value, &pins, low, hold_ms).await,
        Command::Watch { link, sysfs, count } => {
            if sysfs {
                config.backend = Backend::Sysfs;
            }
            watch(config, &link, count).await
        }
    }
}

fn resolver(config: &DeviceConfig) -> Result<Option<PinResolver>> {
    config
        .board
        .map(PinResolver::new)
        .transpose()
        .context("Failed to load board table")
}

fn offsets(config: &DeviceConfig, pins: &[String]) -> Result<Vec<u32>> {
    let resolver = resolver(config)?;
    pins.iter()
        .map(|pin| match &resolver {
            Some(r) => r.resolve(pin).map_err(anyhow::Error::from),
            None => pin
                .parse()
                .with_context(|| format!("'{pin}' is not a line number; pass --board for labels")),
        })
        .collect()
}

fn manager(config: &DeviceConfig) -> Result<LineManager> {
    let chip = CdevChip::open(&config.chip)
        .with_context(|| format!("Failed to open {}", config.chip.display()))?;
    Ok(LineManager::new(
        Arc::new(chip),
        Arc::new(LineRegistry::new(config.consumer.clone())),
    ))
}

fn settings(base: LineSettings, low: bool) -> LineSettings {
    base.with_polarity(if low {
        Polarity::ActiveLow
    } else {
        Polarity::ActiveHigh
    })
}

fn resolve(config: &DeviceConfig, label: &str) -> Result<()> {
    let Some(resolver) = resolver(config)? else {
        bail!("No board selected; pass --board or set DEVGPIO_BOARD");
    };
    let (offset, matched) = resolver.lookup(label)?;
    println!("{label} -> {offset} ({matched:?}, {})", resolver.profile());
    Ok(())
}

fn info(config: &DeviceConfig, pins: &[String]) -> Result<()> {
    let chip = CdevChip::open(&config.chip)
        .with_context(|| format!("Failed to open {}", config.chip.display()))?;
    let chip_info = chip.info()?;
    println!(
        "{} [{}] {} lines",
        chip_info.name, chip_info.label, chip_info.lines
    );

    let selected = if pins.is_empty() {
        (0..chip_info.lines).collect()
    } else {
        offsets(config, pins)?
    };
    for offset in selected {
        match chip.line_info(offset) {
            Ok(line) => println!("  {line}"),
            Err(e) => println!("  line {offset:>3}: {e}"),
        }
    }
    Ok(())
}

fn get(config: &DeviceConfig, pins: &[String], low: bool) -> Result<()> {
    let offsets = offsets(config, pins)?;
    let group = manager(config)?
        .acquire(&offsets, settings(LineSettings::input(), low))
        .context("Failed to request lines")?;
    let value = group.get(group.full_mask())?;
    println!("{value:#0width$b}", width = offsets.len() + 2);
    Ok(())
}

async fn set(
    config: &DeviceConfig,
    value: &str,
    pins: &[String],
    low: bool,
    hold_ms: u64,
) -> Result<()> {
    let value = parse_value(value)?;
    let offsets = offsets(config, pins)?;
    let group = manager(config)?
        .acquire(&offsets, settings(LineSettings::output(), low))
        .context("Failed to request lines")?;
    group.set(group.full_mask(), value)?;
    if hold_ms > 0 {
        tokio::time::sleep(Duration::from_millis(hold_ms)).await;
    }
    group.release();
    Ok(())
}

async fn watch(config: DeviceConfig, link: &str, count: Option<usize>) -> Result<()> {
    let support = DeviceSupport::new(config).context("Failed to open GPIO backend")?;
    let mut requests = support
        .take_scan_requests()
        .context("Scan requests already taken")?;

    support.init(InitPhase::BeforeRecords)?;
    let record = support.init_record(&RecordConfig::new("watch", RecordKind::Mbbi, link))?;
    support.init(InitPhase::AfterRecords)?;
    support.get_scan_interrupt(ScanCommand::Add, record.key)?;
    debug!(
        offsets = ?support.record_offsets(record.key)?,
        sysfs = ?support.sysfs_root(),
        state = %support.multiplexer_state(),
        "Watching"
    );

    let mut value = record.initial_value.unwrap_or_default();
    println!("initial {value:#b}");

    let mut seen = 0;
    while count.map_or(true, |n| seen < n) {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else { break };
                value = support.read(request.record())?;
                let event = request.event();
                println!(
                    "{:>12}.{:09} line {:>3} {:<7} -> {value:#b}",
                    event.timestamp_ns / 1_000_000_000,
                    event.timestamp_ns % 1_000_000_000,
                    event.offset,
                    event.kind,
                );
                request.complete();
                seen += 1;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    support.get_scan_interrupt(ScanCommand::Remove, record.key)?;
    support.shutdown();
    debug!(events = seen, last = value, "Watch finished");
    Ok(())
}

fn parse_value(raw: &str) -> Result<u64> {
    let parsed = if let Some(hex) = raw.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = raw.strip_prefix("0b") {
        u64::from_str_radix(bin, 2)
    } else {
        raw.parse()
    };
    parsed.with_context(|| format!("Invalid value '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_prefixes() {
        assert_eq!(parse_value("5").unwrap(), 5);
        assert_eq!(parse_value("0x1f").unwrap(), 31);
        assert_eq!(parse_value("0b101").unwrap(), 5);
        assert!(parse_value("0b12").is_err());
    }

    #[test]
    fn test_numbers_without_board() {
        let config = DeviceConfig::default();
        assert_eq!(
            offsets(&config, &["4".into(), "17".into()]).unwrap(),
            vec![4, 17]
        );
        assert!(offsets(&config, &["J8-11".into()]).is_err());
    }

    #[test]
    fn test_labels_with_board() {
        let config = DeviceConfig {
            board: Some(BoardProfile::RaspberryPiBPlus),
            ..DeviceConfig::default()
        };
        assert_eq!(offsets(&config, &["J8-11".into()]).unwrap(), vec![17]);
    }
}
