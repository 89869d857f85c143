//! Line data model: direction, polarity, edge detection and ownership.

use crate::error::{Error, Result};

/// Requested line direction.
///
/// The string forms match the legacy `direction` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum Direction {
    #[strum(serialize = "in")]
    Input,
    #[strum(serialize = "out")]
    Output,
}

/// Whether the logical active level is electrical high or low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Polarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    pub fn is_active_low(self) -> bool {
        matches!(self, Polarity::ActiveLow)
    }
}

/// Edge-detection mode.
///
/// The string forms match the legacy `edge` attribute.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum EdgeMode {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeMode {
    pub fn is_enabled(self) -> bool {
        !matches!(self, EdgeMode::None)
    }

    pub fn detects_rising(self) -> bool {
        matches!(self, EdgeMode::Rising | EdgeMode::Both)
    }

    pub fn detects_falling(self) -> bool {
        matches!(self, EdgeMode::Falling | EdgeMode::Both)
    }
}

/// Ownership of a line as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Unowned,
    Requested,
    Granted,
    Released,
}

/// Configuration shared by all lines of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub direction: Direction,
    pub polarity: Polarity,
    pub edge: EdgeMode,
}

impl LineSettings {
    pub fn input() -> Self {
        Self {
            direction: Direction::Input,
            polarity: Polarity::ActiveHigh,
            edge: EdgeMode::None,
        }
    }

    pub fn output() -> Self {
        Self {
            direction: Direction::Output,
            polarity: Polarity::ActiveHigh,
            edge: EdgeMode::None,
        }
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn with_edge(mut self, edge: EdgeMode) -> Self {
        self.edge = edge;
        self
    }

    /// Edge detection may only be attached to inputs.
    pub fn validate(&self) -> Result<()> {
        if self.edge.is_enabled() && self.direction != Direction::Input {
            return Err(Error::InvalidConfiguration(format!(
                "edge detection '{}' requires an input line",
                self.edge
            )));
        }
        Ok(())
    }
}

/// Kind of a kernel-reported edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum EdgeKind {
    Rising,
    Falling,
}

/// One edge event read from a line handle. Not stored beyond dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub offset: u32,
    pub kind: EdgeKind,
    pub timestamp_ns: u64,
    pub seqno: u32,
    pub line_seqno: u32,
}
