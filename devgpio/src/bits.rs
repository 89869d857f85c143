//! Packing between group-position bitmaps and contiguous record values.
//!
//! A line group addresses its members by position: bit `i` of a kernel
//! bitmap is the `i`-th requested line. Records see a packed value where
//! bit 0 is the lowest selected position, bit 1 the next one, and so on.
//! All arithmetic is done on `u64`, the width of the kernel bitmap, so no
//! shift can exceed the operand width.

/// Largest number of lines in one group (width of the kernel bitmap).
pub const MAX_GROUP_LINES: usize = 64;

/// Mask selecting the first `count` positions.
pub fn low_mask(count: usize) -> u64 {
    if count >= MAX_GROUP_LINES {
        u64::MAX
    } else {
        (1u64 << count) - 1
    }
}

/// Gather the bits of `raw` selected by `mask` into the low-order bits.
pub fn pack(raw: u64, mask: u64) -> u64 {
    let mut packed = 0;
    let mut out = 0;
    let mut remaining = mask;
    while remaining != 0 {
        let pos = remaining.trailing_zeros();
        if raw & (1u64 << pos) != 0 {
            packed |= 1u64 << out;
        }
        out += 1;
        remaining &= remaining - 1;
    }
    packed
}

/// Scatter the low-order bits of `packed` into the positions selected by
/// `mask`. Bits of `packed` beyond the number of selected positions are
/// ignored.
pub fn unpack(packed: u64, mask: u64) -> u64 {
    let mut raw = 0;
    let mut input = 0;
    let mut remaining = mask;
    while remaining != 0 {
        let pos = remaining.trailing_zeros();
        if packed & (1u64 << input) != 0 {
            raw |= 1u64 << pos;
        }
        input += 1;
        remaining &= remaining - 1;
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0b1, 0b1, 0b1; "single line high")]
    #[test_case(0b0, 0b1, 0b0; "single line low")]
    #[test_case(0b1010, 0b1010, 0b11; "sparse mask gathers")]
    #[test_case(0b1111, 0b0101, 0b11; "unselected bits dropped")]
    #[test_case(0b0100, 0b0110, 0b10; "second selected position")]
    #[test_case(1 << 63, 1 << 63, 0b1; "top bit")]
    fn gather(raw: u64, mask: u64, expect: u64) {
        assert_eq!(pack(raw, mask), expect);
    }

    #[test_case(0b11, 0b1010, 0b1010; "sparse mask scatters")]
    #[test_case(0b10, 0b0110, 0b0100; "second selected position")]
    #[test_case(0b111, 0b0011, 0b0011; "excess value bits ignored")]
    #[test_case(0b1, 1 << 63, 1 << 63; "top bit")]
    fn scatter(packed: u64, mask: u64, expect: u64) {
        assert_eq!(unpack(packed, mask), expect);
    }

    #[test]
    fn test_set_then_get_is_independent_of_positions() {
        let masks = [0b1u64, 0b101, 0b1110_0001, u64::MAX, 0x8000_0000_0000_0001];
        for mask in masks {
            let width = mask.count_ones() as usize;
            for value in [0u64, 1, 0b10, 0b1011, u64::MAX] {
                let expect = value & low_mask(width);
                assert_eq!(pack(unpack(value, mask), mask), expect, "mask {mask:#x}");
            }
        }
    }

    #[test]
    fn test_low_mask_full_width() {
        assert_eq!(low_mask(0), 0);
        assert_eq!(low_mask(3), 0b111);
        assert_eq!(low_mask(32), 0xffff_ffff);
        assert_eq!(low_mask(64), u64::MAX);
    }
}
