//! Raspberry Pi header tables.
//!
//! Both revisions share the BCM2835 numbering; the B+ 40-pin `J8` header
//! adds lines 0, 1, 5, 6, 12, 13, 16, 19, 20, 21 and 26, the B rev2 adds
//! the `P5` auxiliary header.

use super::Pin;

const fn pin(key: &'static str, name: &'static str, offset: u32) -> Pin {
    Pin { key, name, offset }
}

/// Model B revision 2: 26-pin `P1` header plus `P5`.
pub(super) const B_REV2: &[Pin] = &[
    pin("P1-08", "GPIO14", 14),
    pin("P1-10", "GPIO15", 15),
    pin("P1-12", "GPIO18", 18),
    pin("P1-16", "GPIO23", 23),
    pin("P1-18", "GPIO24", 24),
    pin("P1-22", "GPIO25", 25),
    pin("P1-24", "GPIO08", 8),
    pin("P1-26", "GPIO07", 7),
    pin("P1-03", "GPIO2", 2),
    pin("P1-05", "GPIO3", 3),
    pin("P1-07", "GPIO4", 4),
    pin("P1-11", "GPIO17", 17),
    pin("P1-13", "GPIO27", 27),
    pin("P1-15", "GPIO22", 22),
    pin("P1-19", "GPIO10", 10),
    pin("P1-21", "GPIO9", 9),
    pin("P1-23", "GPIO11", 11),
    pin("P5-03", "GPIO28", 28),
    pin("P5-05", "GPIO30", 30),
    pin("P5-04", "GPIO29", 29),
    pin("P5-06", "GPIO31", 31),
];

/// Model B+ (and later 40-pin boards): `J8` header.
pub(super) const B_PLUS: &[Pin] = &[
    pin("J8-08", "GPIO14", 14),
    pin("J8-10", "GPIO15", 15),
    pin("J8-12", "GPIO18", 18),
    pin("J8-16", "GPIO23", 23),
    pin("J8-18", "GPIO24", 24),
    pin("J8-22", "GPIO25", 25),
    pin("J8-24", "GPIO08", 8),
    pin("J8-26", "GPIO07", 7),
    pin("J8-03", "GPIO2", 2),
    pin("J8-05", "GPIO3", 3),
    pin("J8-07", "GPIO4", 4),
    pin("J8-11", "GPIO17", 17),
    pin("J8-13", "GPIO27", 27),
    pin("J8-15", "GPIO22", 22),
    pin("J8-19", "GPIO10", 10),
    pin("J8-21", "GPIO9", 9),
    pin("J8-23", "GPIO11", 11),
    pin("J8-27", "GPIO0", 0),
    pin("J8-28", "GPIO1", 1),
    pin("J8-29", "GPIO5", 5),
    pin("J8-31", "GPIO6", 6),
    pin("J8-32", "GPIO12", 12),
    pin("J8-33", "GPIO13", 13),
    pin("J8-35", "GPIO19", 19),
    pin("J8-36", "GPIO16", 16),
    pin("J8-37", "GPIO26", 26),
    pin("J8-38", "GPIO20", 20),
    pin("J8-40", "GPIO21", 21),
];

/// Zero-padded spellings accepted as raw numbers on both revisions.
pub(super) const PADDED_NUMBERS: &[(&str, u32)] = &[("08", 8), ("07", 7)];
