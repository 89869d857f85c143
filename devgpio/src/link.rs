//! Pin specification strings from record link fields.
//!
//! Simple form, one line:
//!
//! ```text
//! <pin> [high|h|low|l]
//! ```
//!
//! Multi-line form:
//!
//! ```text
//! <pin> [<offset>...] [high|h|low|l] [rising|r|falling|f|both|b]
//! ```
//!
//! `<pin>` is a board key, name or number. Additional lines are raw
//! offsets. Keywords are case-insensitive.

use crate::error::{Error, Result};
use crate::line::{EdgeMode, Polarity};

/// Line count limit of multi-line links: record values are 32 bits wide.
pub const MAX_LINK_LINES: usize = 32;

/// Parsed link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    /// First line, to be resolved against the board profile.
    pub pin: String,
    /// Further lines as raw offsets, in bit order after `pin`.
    pub extra: Vec<u32>,
    pub polarity: Polarity,
    /// Edge named in the link, if any.
    pub edge: Option<EdgeMode>,
}

impl LinkSpec {
    pub fn line_count(&self) -> usize {
        1 + self.extra.len()
    }
}

fn polarity_keyword(token: &str) -> Option<Polarity> {
    match token.to_ascii_lowercase().as_str() {
        "high" | "h" => Some(Polarity::ActiveHigh),
        "low" | "l" => Some(Polarity::ActiveLow),
        _ => None,
    }
}

fn edge_keyword(token: &str) -> Option<EdgeMode> {
    match token.to_ascii_lowercase().as_str() {
        "rising" | "r" => Some(EdgeMode::Rising),
        "falling" | "f" => Some(EdgeMode::Falling),
        "both" | "b" => Some(EdgeMode::Both),
        _ => None,
    }
}

fn invalid(link: &str, reason: impl std::fmt::Display) -> Error {
    Error::InvalidConfiguration(format!("link '{link}': {reason}"))
}

/// Parse the one-line form.
pub fn parse_simple(link: &str) -> Result<LinkSpec> {
    let tokens: Vec<&str> = link.split_whitespace().collect();
    let (pin, rest) = tokens
        .split_first()
        .ok_or_else(|| invalid(link, "empty link"))?;
    if rest.len() > 1 {
        return Err(invalid(link, "expected '<pin> [high|low]'"));
    }

    let polarity = match rest.first() {
        Some(token) => polarity_keyword(token)
            .ok_or_else(|| invalid(link, format!("invalid option for logic: '{token}'")))?,
        None => Polarity::ActiveHigh,
    };

    Ok(LinkSpec {
        pin: pin.to_string(),
        extra: Vec::new(),
        polarity,
        edge: None,
    })
}

/// Parse the multi-line form, allowing at most `max_lines` lines.
pub fn parse_multi(link: &str, max_lines: usize) -> Result<LinkSpec> {
    let tokens: Vec<&str> = link.split_whitespace().collect();
    let (pin, rest) = tokens
        .split_first()
        .ok_or_else(|| invalid(link, "empty link"))?;

    let mut spec = LinkSpec {
        pin: pin.to_string(),
        extra: Vec::new(),
        polarity: Polarity::ActiveHigh,
        edge: None,
    };
    let mut polarity_seen = false;

    for token in rest {
        if let Ok(offset) = token.parse::<u32>() {
            if polarity_seen || spec.edge.is_some() {
                return Err(invalid(link, "line offsets must precede options"));
            }
            spec.extra.push(offset);
        } else if let Some(polarity) = polarity_keyword(token) {
            if polarity_seen {
                return Err(invalid(link, "logic given twice"));
            }
            polarity_seen = true;
            spec.polarity = polarity;
        } else if let Some(edge) = edge_keyword(token) {
            if spec.edge.is_some() {
                return Err(invalid(link, "edge given twice"));
            }
            spec.edge = Some(edge);
        } else {
            return Err(invalid(link, format!("unrecognized token '{token}'")));
        }
    }

    if spec.line_count() > max_lines {
        return Err(invalid(
            link,
            format!("{} lines given, at most {} allowed", spec.line_count(), max_lines),
        ));
    }
    Ok(spec)
}
