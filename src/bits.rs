//! MSB-first bit-field extraction for the fixed-format card registers.
//!
//! Registers arrive as big-endian word arrays: `words[0]` holds the most
//! significant 32 bits. Bit numbers follow the register tables, so bit 127 of
//! a CSD is the top bit of `words[0]`.

use crate::err::SdError;

pub const WORD_BITS: u32 = 32;

/// Extract `size` bits starting at bit `start` of a `total_bits` wide register.
///
/// Fields that straddle a word boundary take their low bits from the word
/// holding `start` and their high bits from the preceding (more significant)
/// word.
pub fn try_parse_bits(words: &[u32], total_bits: u32, start: u32, size: u32) -> Result<u32, SdError> {
    if start >= total_bits || size == 0 || size > WORD_BITS {
        return Err(SdError::InvalidParameter);
    }
    let word_count = total_bits / WORD_BITS;
    if words.len() < word_count as usize {
        return Err(SdError::InvalidParameter);
    }

    let index = (word_count - start / WORD_BITS - 1) as usize;
    let shift = start & (WORD_BITS - 1);
    let mut ret = (words[index] >> shift) as u64;
    if size + shift > WORD_BITS {
        if index == 0 {
            return Err(SdError::InvalidParameter);
        }
        ret |= (words[index - 1] as u64) << (WORD_BITS - shift);
    }

    let mask = (1u64 << size) - 1;
    Ok((ret & mask) as u32)
}

/// Same as [`try_parse_bits`] but yields 0 for an invalid range.
pub fn parse_bits(words: &[u32], total_bits: u32, start: u32, size: u32) -> u32 {
    match try_parse_bits(words, total_bits, start, size) {
        Ok(v) => v,
        Err(_) => {
            log::debug!("parse_bits: invalid range start={} size={} total={}", start, size, total_bits);
            0
        }
    }
}

/// Pack big-endian register bytes into the word layout the decoder expects.
pub fn be_words<const N: usize>(bytes: &[u8]) -> [u32; N] {
    let mut words = [0u32; N];
    for (i, w) in words.iter_mut().enumerate() {
        let mut v = 0u32;
        for j in 0..4 {
            v = (v << 8) | bytes.get(i * 4 + j).copied().unwrap_or(0) as u32;
        }
        *w = v;
    }
    words
}

/// Little-endian integer stored at `off` in a byte register (EXT_CSD style).
pub fn le_bytes(buf: &[u8], off: usize, len: usize) -> u32 {
    let mut v = 0u32;
    for i in (0..len).rev() {
        v = (v << 8) | buf.get(off + i).copied().unwrap_or(0) as u32;
    }
    v
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegField {
    pub name: &'static str,
    pub start: u32,
    pub width: u32,
}

impl RegField {
    pub const fn new(name: &'static str, start: u32, width: u32) -> Self {
        Self { name, start, width }
    }

    pub fn get(&self, words: &[u32], total_bits: u32) -> u32 {
        parse_bits(words, total_bits, self.start, self.width)
    }
}

/// Declares a register's field table.
///
/// Every `name: start, width` line becomes an upper-case `RegField` constant,
/// and the whole set is collected into `FIELDS` for dumping.
#[macro_export]
macro_rules! reg_layout {
    ($bits:expr; $($name:ident : $start:expr, $width:expr;)*) => {
        pub const BITS: u32 = $bits;

        paste::paste! {
            $(
                pub const [<$name:upper>]: $crate::bits::RegField =
                    $crate::bits::RegField::new(stringify!($name), $start, $width);
            )*

            pub const FIELDS: &[$crate::bits::RegField] = &[$([<$name:upper>]),*];
        }

        #[allow(unused)]
        pub(crate) fn field(words: &[u32], f: $crate::bits::RegField) -> u32 {
            f.get(words, BITS)
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_is_zero() {
        let w = [0xFFFF_FFFFu32; 4];
        assert_eq!(parse_bits(&w, 128, 128, 4), 0);
        assert_eq!(parse_bits(&w, 128, 200, 1), 0);
        assert_eq!(parse_bits(&w, 128, 3, 0), 0);
        assert_eq!(parse_bits(&w, 128, 3, 33), 0);
        assert!(try_parse_bits(&w, 128, 128, 4).is_err());
    }

    #[test]
    fn top_and_bottom_fields() {
        let w = [0xC000_0000, 0, 0, 0x0000_0003];
        assert_eq!(parse_bits(&w, 128, 126, 2), 3);
        assert_eq!(parse_bits(&w, 128, 0, 2), 3);
        assert_eq!(parse_bits(&w, 128, 0, 32), 3);
    }

    #[test]
    fn straddling_field() {
        // bits [35:28] = 0xAB spanning words[3] and words[2]
        let w = [0, 0, 0x0000_000A, 0xB000_0000];
        assert_eq!(parse_bits(&w, 128, 28, 8), 0xAB);
    }

    #[test]
    fn shifted_register_yields_same_field() {
        // A value placed aligned must match the same value shifted across a boundary.
        for start in 0..96u32 {
            for size in 1..=32u32 {
                if start + size > 128 {
                    continue;
                }
                let value: u64 = 0xDEAD_BEEF & ((1u64 << size) - 1);
                let mut wide: u128 = 0;
                wide |= (value as u128) << start;
                let w = [
                    (wide >> 96) as u32,
                    (wide >> 64) as u32,
                    (wide >> 32) as u32,
                    wide as u32,
                ];
                assert_eq!(parse_bits(&w, 128, start, size) as u64, value, "start={start} size={size}");
            }
        }
    }

    #[test]
    fn layout_macro_builds_table() {
        mod demo {
            crate::reg_layout! { 64;
                structure: 60, 4;
                bus_widths: 48, 4;
            }
        }
        assert_eq!(demo::FIELDS.len(), 2);
        assert_eq!(demo::STRUCTURE.name, "structure");
        let w = [0x1005_0000, 0];
        assert_eq!(demo::field(&w, demo::STRUCTURE), 1);
        assert_eq!(demo::field(&w, demo::BUS_WIDTHS), 5);
    }

    #[test]
    fn byte_helpers() {
        let bytes = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        let w: [u32; 2] = be_words(&bytes);
        assert_eq!(w, [0x1234_5678, 0x9ABC_DEF0]);
        assert_eq!(le_bytes(&bytes, 1, 3), 0x78_56_34);
    }
}
