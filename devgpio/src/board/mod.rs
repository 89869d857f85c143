//! Board profiles and pin resolution.
//!
//! A board profile is a static table mapping connector labels ("keys",
//! e.g. `J8-11`) and symbolic names (e.g. `GPIO17`, `UART4_TXD`) to kernel
//! line offsets. A [`PinResolver`] is built once for the profile selected at
//! startup and answers lookups without I/O.

mod beaglebone;
mod raspberry_pi;

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Supported boards.
///
/// The string forms are the board names accepted by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum BoardProfile {
    #[strum(serialize = "RASPI B REV2")]
    RaspberryPiBRev2,
    #[strum(serialize = "RASPI B+")]
    RaspberryPiBPlus,
    #[strum(serialize = "BEAGLEBONE BLACK")]
    BeagleBoneBlack,
}

impl BoardProfile {
    /// Human readable board description.
    pub fn description(self) -> &'static str {
        match self {
            BoardProfile::RaspberryPiBRev2 => "Raspberry Pi B Rev2",
            BoardProfile::RaspberryPiBPlus => "Raspberry Pi B+",
            BoardProfile::BeagleBoneBlack => "BeagleBone Black",
        }
    }

    fn pins(self) -> &'static [Pin] {
        match self {
            BoardProfile::RaspberryPiBRev2 => raspberry_pi::B_REV2,
            BoardProfile::RaspberryPiBPlus => raspberry_pi::B_PLUS,
            BoardProfile::BeagleBoneBlack => beaglebone::BLACK,
        }
    }

    fn padded_numbers(self) -> &'static [(&'static str, u32)] {
        match self {
            BoardProfile::RaspberryPiBRev2 | BoardProfile::RaspberryPiBPlus => {
                raspberry_pi::PADDED_NUMBERS
            }
            BoardProfile::BeagleBoneBlack => &[],
        }
    }
}

/// One header position.
#[derive(Debug, Clone, Copy)]
pub struct Pin {
    pub key: &'static str,
    pub name: &'static str,
    pub offset: u32,
}

/// Which table satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matched {
    Key,
    Name,
    Number,
}

/// Key/name/number lookup for one board profile.
#[derive(Debug)]
pub struct PinResolver {
    profile: BoardProfile,
    by_key: HashMap<&'static str, u32>,
    by_name: HashMap<&'static str, u32>,
    by_number: HashMap<String, u32>,
}

impl PinResolver {
    /// Build the lookup tables for `profile`.
    ///
    /// Fails if a table contains the same label twice.
    pub fn new(profile: BoardProfile) -> Result<Self> {
        info!(board = profile.description(), "Loading pin table");

        let mut by_key = HashMap::new();
        let mut by_name = HashMap::new();
        let mut by_number = HashMap::new();

        for pin in profile.pins() {
            insert_unique(&mut by_key, pin.key, pin.offset, "key")?;
            insert_unique(&mut by_name, pin.name, pin.offset, "name")?;
            by_number.entry(pin.offset.to_string()).or_insert(pin.offset);
        }
        for &(alias, offset) in profile.padded_numbers() {
            insert_unique(&mut by_number, alias.to_string(), offset, "number")?;
        }

        Ok(Self {
            profile,
            by_key,
            by_name,
            by_number,
        })
    }

    pub fn profile(&self) -> BoardProfile {
        self.profile
    }

    /// Resolve a key, name or raw number to a line offset.
    pub fn resolve(&self, label: &str) -> Result<u32> {
        self.lookup(label).map(|(offset, _)| offset)
    }

    /// Like [`resolve`](Self::resolve), also reporting which table matched.
    pub fn lookup(&self, label: &str) -> Result<(u32, Matched)> {
        let found = self
            .by_key
            .get(label)
            .map(|&o| (o, Matched::Key))
            .or_else(|| self.by_name.get(label).map(|&o| (o, Matched::Name)))
            .or_else(|| self.by_number.get(label).map(|&o| (o, Matched::Number)));

        match found {
            Some((offset, matched)) => {
                debug!(label, offset, ?matched, "Resolved pin");
                Ok((offset, matched))
            }
            None => Err(Error::UnknownPin(label.to_string())),
        }
    }

    /// Every header position of the profile, in table order.
    pub fn pins(&self) -> &'static [Pin] {
        self.profile.pins()
    }
}

fn insert_unique<K>(map: &mut HashMap<K, u32>, label: K, offset: u32, table: &str) -> Result<()>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
{
    if map.contains_key(&label) {
        return Err(Error::InvalidConfiguration(format!(
            "duplicate {table} '{label}' in board table"
        )));
    }
    map.insert(label, offset);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use test_case::test_case;

    #[test_case(BoardProfile::RaspberryPiBPlus, "J8-11", 17; "key")]
    #[test_case(BoardProfile::RaspberryPiBPlus, "GPIO17", 17; "name")]
    #[test_case(BoardProfile::RaspberryPiBPlus, "17", 17; "number fallback")]
    #[test_case(BoardProfile::RaspberryPiBPlus, "J8-27", 0; "id eeprom data")]
    #[test_case(BoardProfile::RaspberryPiBPlus, "08", 8; "padded number")]
    #[test_case(BoardProfile::RaspberryPiBRev2, "P1-26", 7; "rev2 key")]
    #[test_case(BoardProfile::RaspberryPiBRev2, "GPIO08", 8; "rev2 padded name")]
    #[test_case(BoardProfile::RaspberryPiBRev2, "P5-06", 31; "rev2 p5 header")]
    #[test_case(BoardProfile::BeagleBoneBlack, "P9_12", 60; "beaglebone key")]
    #[test_case(BoardProfile::BeagleBoneBlack, "USR3", 56; "user led")]
    #[test_case(BoardProfile::BeagleBoneBlack, "UART4_TXD", 31; "pinmux name")]
    #[test_case(BoardProfile::BeagleBoneBlack, "117", 117; "beaglebone number")]
    fn resolves(profile: BoardProfile, label: &str, expect: u32) {
        let resolver = PinResolver::new(profile).unwrap();
        assert_eq!(resolver.resolve(label).unwrap(), expect);
        // Stable across repeated lookups
        assert_eq!(resolver.resolve(label).unwrap(), expect);
    }

    #[test_case(BoardProfile::RaspberryPiBPlus, "J8-99"; "missing key")]
    #[test_case(BoardProfile::RaspberryPiBPlus, "P1-11"; "other revision key")]
    #[test_case(BoardProfile::RaspberryPiBPlus, "j8-11"; "case sensitive")]
    #[test_case(BoardProfile::RaspberryPiBRev2, "99"; "number not on header")]
    #[test_case(BoardProfile::BeagleBoneBlack, ""; "empty")]
    fn rejects(profile: BoardProfile, label: &str) {
        let resolver = PinResolver::new(profile).unwrap();
        assert!(matches!(resolver.resolve(label), Err(Error::UnknownPin(l)) if l == label));
    }

    #[test]
    fn test_key_wins_over_name() {
        // On the BeagleBone the user LEDs use the same string as key and name
        let resolver = PinResolver::new(BoardProfile::BeagleBoneBlack).unwrap();
        assert_eq!(resolver.lookup("USR0").unwrap(), (53, Matched::Key));
        assert_eq!(resolver.lookup("GPIO0_7").unwrap(), (7, Matched::Name));
        assert_eq!(resolver.lookup("7").unwrap(), (7, Matched::Number));
    }

    #[test]
    fn test_every_table_entry_resolves() {
        for profile in [
            BoardProfile::RaspberryPiBRev2,
            BoardProfile::RaspberryPiBPlus,
            BoardProfile::BeagleBoneBlack,
        ] {
            let resolver = PinResolver::new(profile).unwrap();
            for pin in resolver.pins() {
                assert_eq!(resolver.resolve(pin.key).unwrap(), pin.offset);
                assert_eq!(resolver.resolve(&pin.offset.to_string()).unwrap(), pin.offset);
            }
        }
    }

    #[test]
    fn test_profile_names() {
        assert_eq!(
            BoardProfile::from_str("RASPI B+").unwrap(),
            BoardProfile::RaspberryPiBPlus
        );
        assert_eq!(
            BoardProfile::from_str("beaglebone black").unwrap(),
            BoardProfile::BeagleBoneBlack
        );
        assert_eq!(BoardProfile::RaspberryPiBRev2.to_string(), "RASPI B REV2");
        assert!(BoardProfile::from_str("RASPI 5").is_err());
    }
}
