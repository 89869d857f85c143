//! BeagleBone Black expansion header table.
//!
//! Offsets are the kernel GPIO numbers, `32 * bank + bit`. Names are the
//! default pinmux function of each header position.

use super::Pin;

const fn pin(key: &'static str, name: &'static str, offset: u32) -> Pin {
    Pin { key, name, offset }
}

/// User LEDs, `P8` and `P9` headers.
pub(super) const BLACK: &[Pin] = &[
    pin("USR0", "USR0", 53),
    pin("USR1", "USR1", 54),
    pin("USR2", "USR2", 55),
    pin("USR3", "USR3", 56),
    pin("P8_3", "GPIO1_6", 38),
    pin("P8_4", "GPIO1_7", 39),
    pin("P8_5", "GPIO1_2", 34),
    pin("P8_6", "GPIO1_3", 35),
    pin("P8_7", "TIMER4", 66),
    pin("P8_8", "TIMER7", 67),
    pin("P8_9", "TIMER5", 69),
    pin("P8_10", "TIMER6", 68),
    pin("P8_11", "GPIO1_13", 45),
    pin("P8_12", "GPIO1_12", 44),
    pin("P8_13", "EHRPWM2B", 23),
    pin("P8_14", "GPIO0_26", 26),
    pin("P8_15", "GPIO1_15", 47),
    pin("P8_16", "GPIO1_14", 46),
    pin("P8_17", "GPIO0_27", 27),
    pin("P8_18", "GPIO2_1", 65),
    pin("P8_19", "EHRPWM2A", 22),
    pin("P8_20", "GPIO1_31", 63),
    pin("P8_21", "GPIO1_30", 62),
    pin("P8_22", "GPIO1_5", 37),
    pin("P8_23", "GPIO1_4", 36),
    pin("P8_24", "GPIO1_1", 33),
    pin("P8_25", "GPIO1_0", 32),
    pin("P8_26", "GPIO1_29", 61),
    pin("P8_27", "GPIO2_22", 86),
    pin("P8_28", "GPIO2_24", 88),
    pin("P8_29", "GPIO2_23", 87),
    pin("P8_30", "GPIO2_25", 89),
    pin("P8_31", "UART5_CTSN", 10),
    pin("P8_32", "UART5_RTSN", 11),
    pin("P8_33", "UART4_RTSN", 9),
    pin("P8_34", "UART3_RTSN", 81),
    pin("P8_35", "UART4_CTSN", 8),
    pin("P8_36", "UART3_CTSN", 80),
    pin("P8_37", "UART5_TXD", 78),
    pin("P8_38", "UART5_RXD", 79),
    pin("P8_39", "GPIO2_12", 76),
    pin("P8_40", "GPIO2_13", 77),
    pin("P8_41", "GPIO2_10", 74),
    pin("P8_42", "GPIO2_11", 75),
    pin("P8_43", "GPIO2_8", 72),
    pin("P8_44", "GPIO2_9", 73),
    pin("P8_45", "GPIO2_6", 70),
    pin("P8_46", "GPIO2_7", 71),
    pin("P9_11", "UART4_RXD", 30),
    pin("P9_12", "GPIO1_28", 60),
    pin("P9_13", "UART4_TXD", 31),
    pin("P9_14", "EHRPWM1A", 50),
    pin("P9_15", "GPIO1_16", 48),
    pin("P9_16", "EHRPWM1B", 51),
    pin("P9_17", "I2C1_SCL", 5),
    pin("P9_18", "I2C1_SDA", 4),
    pin("P9_19", "I2C2_SCL", 13),
    pin("P9_20", "I2C2_SDA", 12),
    pin("P9_21", "UART2_TXD", 3),
    pin("P9_22", "UART2_RXD", 2),
    pin("P9_23", "GPIO1_17", 49),
    pin("P9_24", "UART1_TXD", 15),
    pin("P9_25", "GPIO3_21", 117),
    pin("P9_26", "UART1_RXD", 14),
    pin("P9_27", "GPIO3_19", 115),
    pin("P9_28", "SPI1_CS0", 113),
    pin("P9_29", "SPI1_D0", 111),
    pin("P9_30", "SPI1_D1", 112),
    pin("P9_31", "SPI1_SCLK", 110),
    pin("P9_41", "CLKOUT2", 20),
    pin("P9_42", "GPIO0_7", 7),
];
