use log::{debug, warn};

use crate::err::SdError;

use super::{FACTOR, Raw128, TACC_UNIT, TRAN_SPEED_UNIT};

/// Field table shared by the eMMC CSD and SD CSD 1.0.
pub mod layout {
    crate::reg_layout! { 128;
        csd_structure: 126, 2;
        spec_vers: 122, 4;
        taac_value: 115, 4;
        taac_unit: 112, 3;
        nsac: 104, 8;
        tran_value: 99, 4;
        tran_unit: 96, 3;
        ccc: 84, 12;
        read_bl_len: 80, 4;
        read_bl_partial: 79, 1;
        write_blk_misalign: 78, 1;
        read_blk_misalign: 77, 1;
        c_size: 62, 12;
        c_size_mult: 47, 3;
        erase_grp_size: 42, 5;
        erase_grp_mult: 37, 5;
        erase_blk_en: 46, 1;
        sector_size: 39, 7;
        r2w_factor: 26, 3;
        write_bl_len: 22, 4;
        write_bl_partial: 21, 1;
    }
}

/// SD CSD 2.0 only differs in the capacity field.
pub mod layout_v2 {
    crate::reg_layout! { 128;
        c_size: 48, 22;
    }
}

const BLOCK_SHIFT: u32 = 9;
const SD_SDXC_C_SIZE: u32 = 0xFFFF;

/// Card specific data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Csd {
    pub structure: u32,
    pub spec_vers: u32,
    pub taac_ns: u32,
    pub taac_clks: u32,
    pub max_dtr: u32,
    pub ccc: u32,
    pub c_size: u32,
    pub read_bl_len: u32,
    pub read_partial: bool,
    pub write_misalign: bool,
    pub read_misalign: bool,
    pub r2w_factor: u32,
    pub write_bl_len: u32,
    pub write_partial: bool,
    /// In units of `1 << read_bl_len` bytes.
    pub capacity: u64,
    /// Erase unit in 512-byte sectors, 0 when unknown.
    pub erase_size: u32,
    pub block_addr: bool,
    pub sdxc: bool,
}

fn f(raw: &Raw128, field: crate::bits::RegField) -> u32 {
    layout::field(raw, field)
}

impl Csd {
    fn decode_common(raw: &Raw128) -> Self {
        use layout::*;

        let taac = TACC_UNIT[f(raw, TAAC_UNIT) as usize] * FACTOR[f(raw, TAAC_VALUE) as usize];
        let c_size = f(raw, C_SIZE);
        let mult = f(raw, C_SIZE_MULT);
        Csd {
            structure: f(raw, CSD_STRUCTURE),
            taac_ns: (taac + 9) / 10,
            taac_clks: f(raw, NSAC) * 100,
            max_dtr: TRAN_SPEED_UNIT[f(raw, TRAN_UNIT) as usize] * FACTOR[f(raw, TRAN_VALUE) as usize],
            ccc: f(raw, CCC),
            c_size,
            capacity: ((1 + c_size) as u64) << (mult + 2),
            read_bl_len: f(raw, READ_BL_LEN),
            read_partial: f(raw, READ_BL_PARTIAL) == 1,
            write_misalign: f(raw, WRITE_BLK_MISALIGN) == 1,
            read_misalign: f(raw, READ_BLK_MISALIGN) == 1,
            r2w_factor: f(raw, R2W_FACTOR),
            write_bl_len: f(raw, WRITE_BL_LEN),
            write_partial: f(raw, WRITE_BL_PARTIAL) == 1,
            ..Default::default()
        }
    }

    pub fn decode_mmc(raw: &Raw128) -> Result<Self, SdError> {
        use layout::*;

        if f(raw, CSD_STRUCTURE) == 0 {
            warn!("mmc csd: structure 0 is invalid");
            return Err(SdError::DecodeInvalid);
        }
        let mut csd = Self::decode_common(raw);
        csd.spec_vers = f(raw, SPEC_VERS);
        if csd.write_bl_len >= BLOCK_SHIFT {
            let grp = f(raw, ERASE_GRP_SIZE) + 1;
            let mult = f(raw, ERASE_GRP_MULT) + 1;
            csd.erase_size = (grp * mult) << (csd.write_bl_len - BLOCK_SHIFT);
        }
        debug!("mmc csd: {:?}", csd);
        Ok(csd)
    }

    pub fn decode_sd(raw: &Raw128) -> Result<Self, SdError> {
        use layout::*;

        let csd = match f(raw, CSD_STRUCTURE) {
            0 => {
                let mut csd = Self::decode_common(raw);
                if f(raw, ERASE_BLK_EN) == 1 {
                    csd.erase_size = 1;
                } else if csd.write_bl_len >= BLOCK_SHIFT {
                    csd.erase_size = (f(raw, SECTOR_SIZE) + 1) << (csd.write_bl_len - BLOCK_SHIFT);
                }
                csd
            }
            1 => {
                let c_size = layout_v2::field(raw, layout_v2::C_SIZE);
                Csd {
                    structure: 1,
                    max_dtr: TRAN_SPEED_UNIT[f(raw, TRAN_UNIT) as usize] * FACTOR[f(raw, TRAN_VALUE) as usize],
                    ccc: f(raw, CCC),
                    c_size,
                    capacity: ((1 + c_size) as u64) << 10,
                    read_bl_len: BLOCK_SHIFT,
                    write_bl_len: BLOCK_SHIFT,
                    r2w_factor: 2,
                    erase_size: 1,
                    block_addr: true,
                    sdxc: c_size >= SD_SDXC_C_SIZE,
                    ..Default::default()
                }
            }
            other => {
                warn!("sd csd: structure {} not supported", other);
                return Err(SdError::NotSupported);
            }
        };
        debug!("sd csd: {:?}", csd);
        Ok(csd)
    }

    /// Capacity in 512-byte sectors.
    pub fn sectors(&self) -> u64 {
        if self.read_bl_len >= BLOCK_SHIFT {
            self.capacity << (self.read_bl_len - BLOCK_SHIFT)
        } else {
            self.capacity >> (BLOCK_SHIFT - self.read_bl_len)
        }
    }

    pub fn has_class(&self, class: u32) -> bool {
        self.ccc & class != 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a raw CSD by OR-ing `(start, width, value)` fields into place.
    pub(crate) fn build(fields: &[(u32, u32, u32)]) -> Raw128 {
        let mut wide: u128 = 0;
        for &(start, width, value) in fields {
            let mask = ((1u128 << width) - 1) << start;
            wide = (wide & !mask) | (((value as u128) << start) & mask);
        }
        [(wide >> 96) as u32, (wide >> 64) as u32, (wide >> 32) as u32, wide as u32]
    }

    #[test]
    fn sd_v1_capacity_and_speed() {
        // TRAN_SPEED 0x32 (2.5 * 10Mbit/s), C_SIZE 0xF1B, MULT 7, READ_BL_LEN 10
        let raw = build(&[
            (126, 2, 0),
            (99, 4, 6),
            (96, 3, 2),
            (84, 12, 0x5B5),
            (80, 4, 10),
            (62, 12, 0xF1B),
            (47, 3, 7),
            (46, 1, 1),
            (22, 4, 10),
        ]);
        let csd = Csd::decode_sd(&raw).unwrap();
        assert_eq!(csd.max_dtr, 25_000_000);
        assert_eq!(csd.capacity, (1 + 0xF1B) << 9);
        assert_eq!(csd.sectors(), ((1 + 0xF1B) << 9) << 1);
        assert_eq!(csd.erase_size, 1);
        assert!(!csd.block_addr);
    }

    #[test]
    fn sd_v1_sector_erase() {
        let raw = build(&[(126, 2, 0), (46, 1, 0), (39, 7, 31), (22, 4, 10)]);
        let csd = Csd::decode_sd(&raw).unwrap();
        assert_eq!(csd.erase_size, 32 << 1);
    }

    #[test]
    fn sd_v2_capacity() {
        let raw = build(&[(126, 2, 1), (99, 4, 6), (96, 3, 2), (48, 22, 0x1FFFF)]);
        let csd = Csd::decode_sd(&raw).unwrap();
        assert_eq!(csd.capacity, (1 + 0x1FFFF) << 10);
        assert_eq!(csd.sectors(), csd.capacity);
        assert!(csd.block_addr);
        assert!(csd.sdxc);
        assert_eq!(csd.max_dtr, 25_000_000);
    }

    #[test]
    fn sd_unknown_structure() {
        let raw = build(&[(126, 2, 2)]);
        assert_eq!(Csd::decode_sd(&raw), Err(SdError::NotSupported));
    }

    #[test]
    fn mmc_fields() {
        // TAAC 1.5us, NSAC 100 clocks, TRAN_SPEED 20MHz
        let raw = build(&[
            (126, 2, 3),
            (122, 4, 4),
            (115, 4, 4),
            (112, 3, 3),
            (104, 8, 1),
            (99, 4, 5),
            (96, 3, 2),
            (62, 12, 0xFFF),
            (47, 3, 7),
            (80, 4, 9),
            (42, 5, 31),
            (37, 5, 31),
            (22, 4, 9),
        ]);
        let csd = Csd::decode_mmc(&raw).unwrap();
        assert_eq!(csd.spec_vers, 4);
        assert_eq!(csd.taac_ns, (1000 * 15 + 9) / 10);
        assert_eq!(csd.taac_clks, 100);
        assert_eq!(csd.max_dtr, 20_000_000);
        assert_eq!(csd.capacity, 0x1000 << 9);
        assert_eq!(csd.erase_size, 32 * 32);
    }

    #[test]
    fn mmc_structure_zero_rejected() {
        let raw = build(&[(126, 2, 0)]);
        assert_eq!(Csd::decode_mmc(&raw), Err(SdError::DecodeInvalid));
    }
}
