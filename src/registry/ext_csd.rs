use log::{debug, warn};

use crate::bits::le_bytes;
use crate::constant::*;
use crate::err::SdError;

const CSD_STRUCTURE_EXT: u32 = 3;

/// Decoded extended CSD. Fields gated behind a later revision stay zero on
/// older parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtCsd {
    pub raw: Vec<u8>,
    pub structure: u8,
    pub rev: u8,
    pub sectors: u32,
    pub block_addr: bool,
    pub strobe_support: bool,
    pub raw_card_type: u8,
    /// Normalised CARD_TYPE bits used for mode selection.
    pub card_type: u32,
    pub hs_max_dtr: u32,
    pub erase_group_def: u8,
    pub part_config: u8,
    pub part_switch_time: u32,
    pub sa_timeout: u32,
    pub rel_wr_sec_c: u8,
    pub hc_erase_timeout: u32,
    /// In sectors.
    pub hc_erase_size: u32,
    pub boot_size: u32,
    pub enh_area_enable: bool,
    pub enh_area_offset: u64,
    pub enh_area_size: u64,
    pub sec_trim_mult: u8,
    pub sec_erase_mult: u8,
    pub sec_feature_support: u8,
    pub trim_timeout: u32,
    pub power_class: PowerClassTable,
    pub hpi: bool,
    pub hpi_cmd: u32,
    pub out_of_int_time: u32,
    pub wr_rel_param: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerClassTable {
    pub f52_v195: u8,
    pub f26_v195: u8,
    pub f52_v360: u8,
    pub f26_v360: u8,
    pub f200_v195: u8,
    pub f200_v360: u8,
    pub ddr_f52_v195: u8,
    pub ddr_f52_v360: u8,
}

/// Map the raw CARD_TYPE byte to (max high-speed clock, normalised type bits).
fn decode_card_type(raw: u8) -> (u32, u32) {
    const T26: u8 = EXT_CSD_CARD_TYPE_26 as u8;
    const T52: u8 = EXT_CSD_CARD_TYPE_52 as u8;
    const DDR18: u8 = EXT_CSD_CARD_TYPE_DDR_1_8V as u8;
    const DDR12: u8 = EXT_CSD_CARD_TYPE_DDR_1_2V as u8;
    const DDR52: u8 = EXT_CSD_CARD_TYPE_DDR_52 as u8;
    const SDR18: u8 = EXT_CSD_CARD_TYPE_SDR_1_8V as u8;
    const SDR12: u8 = EXT_CSD_CARD_TYPE_SDR_1_2V as u8;
    const HS: u8 = T52 | T26;

    let masked = raw & EXT_CSD_CARD_TYPE_MASK;
    let sdr = masked & (SDR18 | SDR12);
    let rest = masked & !(SDR18 | SDR12);

    if sdr != 0 && rest & HS == HS {
        let card_type = match sdr {
            s if s == SDR18 | SDR12 => EXT_CSD_CARD_TYPE_SDR_200,
            SDR12 => EXT_CSD_CARD_TYPE_SDR_1_2V,
            _ => EXT_CSD_CARD_TYPE_SDR_1_8V,
        };
        return (MMC_FREQ_200M, card_type);
    }

    match masked {
        m if m == DDR52 | HS => (MMC_FREQ_52M, EXT_CSD_CARD_TYPE_DDR_52),
        m if m == DDR12 | HS => (MMC_FREQ_52M, EXT_CSD_CARD_TYPE_DDR_1_2V),
        m if m == DDR18 | HS => (MMC_FREQ_52M, EXT_CSD_CARD_TYPE_DDR_1_8V),
        HS => (MMC_FREQ_52M, 0),
        T26 => (MMC_FREQ_26M, 0),
        _ => {
            debug!("ext_csd: card type {:#x} has no high-speed support", raw);
            (0, 0)
        }
    }
}

impl ExtCsd {
    /// Decode a 512-byte EXT_CSD. `csd_structure` is the CSD_STRUCTURE of the
    /// same card; `block_addr` the addressing mode known so far.
    pub fn decode(raw: &[u8], csd_structure: u32, block_addr: bool) -> Result<Self, SdError> {
        if raw.len() < EXT_CSD_SIZE {
            return Err(SdError::InvalidParameter);
        }
        let mut ext = ExtCsd {
            raw: raw[..EXT_CSD_SIZE].to_vec(),
            structure: raw[EXT_CSD_STRUCTURE],
            rev: raw[EXT_CSD_REV],
            block_addr,
            ..Default::default()
        };
        if csd_structure == CSD_STRUCTURE_EXT && ext.structure > EXT_CSD_STRUCTURE_MAX {
            warn!("ext_csd: structure {} is invalid", ext.structure);
            return Err(SdError::DecodeInvalid);
        }

        if ext.rev >= 2 {
            ext.sectors = le_bytes(raw, EXT_CSD_SEC_CNT, 4);
            if ext.sectors > MMC_2G_SECTORS {
                ext.block_addr = true;
            }
        }

        ext.strobe_support = raw[EXT_CSD_STROBE_SUPPORT] != 0;
        ext.raw_card_type = raw[EXT_CSD_CARD_TYPE];
        let (hs_max_dtr, card_type) = decode_card_type(ext.raw_card_type);
        ext.hs_max_dtr = hs_max_dtr;
        ext.card_type = card_type | (ext.raw_card_type as u32 & EXT_CSD_CARD_TYPE_HS400);
        if ext.strobe_support {
            ext.card_type |= EXT_CSD_CARD_TYPE_HS400ES;
        }

        if ext.rev >= 3 {
            ext.erase_group_def = raw[EXT_CSD_ERASE_GROUP_DEF];
            ext.part_config = raw[EXT_CSD_PART_CONFIG];
            ext.part_switch_time = 10 * raw[EXT_CSD_PART_SWITCH_TIME] as u32;
            let shift = raw[EXT_CSD_S_A_TIMEOUT];
            if shift > 0 && shift <= EXT_CSD_S_A_TIMEOUT_MAX {
                ext.sa_timeout = 1 << shift;
            }
            ext.rel_wr_sec_c = raw[EXT_CSD_REL_WR_SEC_C];
            ext.hc_erase_timeout = 300 * raw[EXT_CSD_ERASE_TIMEOUT_MULT] as u32;
            ext.hc_erase_size = (raw[EXT_CSD_HC_ERASE_GRP_SIZE] as u32) << 10;
            ext.boot_size = (raw[EXT_CSD_BOOT_MULT] as u32) << 17;
        }

        if ext.rev >= 4 {
            if raw[EXT_CSD_PARTITION_SUPPORT] & EXT_CSD_PART_SUPPORT_ENH_ATTRIBUTE_EN != 0
                && raw[EXT_CSD_PARTITION_ATTRIBUTE] & EXT_CSD_PART_ATTRIBUTE_ENH_USR != 0
            {
                ext.enh_area_enable = true;
                ext.enh_area_offset = le_bytes(raw, EXT_CSD_ENH_START_ADDR, 4) as u64;
                if ext.block_addr {
                    ext.enh_area_offset <<= MMC_SECTOR_SHIFT;
                }
                let mult = le_bytes(raw, EXT_CSD_ENH_SIZE_MULT, 3) as u64;
                let grp = raw[EXT_CSD_HC_ERASE_GRP_SIZE] as u64 * raw[EXT_CSD_HC_WP_GRP_SIZE] as u64;
                ext.enh_area_size = (mult * grp) << MMC_SECTOR_SHIFT;
            }
            ext.sec_trim_mult = raw[EXT_CSD_SEC_TRIM_MULT];
            ext.sec_erase_mult = raw[EXT_CSD_SEC_ERASE_MULT];
            ext.sec_feature_support = raw[EXT_CSD_SEC_FEATURE_SUPPORT];
            ext.trim_timeout = 300 * raw[EXT_CSD_TRIM_MULT] as u32;
            ext.power_class = PowerClassTable {
                f52_v195: raw[EXT_CSD_PWR_CL_52_195],
                f26_v195: raw[EXT_CSD_PWR_CL_26_195],
                f52_v360: raw[EXT_CSD_PWR_CL_52_360],
                f26_v360: raw[EXT_CSD_PWR_CL_26_360],
                f200_v195: raw[EXT_CSD_PWR_CL_200_195],
                f200_v360: raw[EXT_CSD_PWR_CL_200_360],
                ddr_f52_v195: raw[EXT_CSD_PWR_CL_DDR_52_195],
                ddr_f52_v360: raw[EXT_CSD_PWR_CL_DDR_52_360],
            };
        }

        if ext.rev >= 5 {
            let hpi = raw[EXT_CSD_HPI_FEATURE];
            if hpi & EXT_CSD_HPI_SUPPORT != 0 {
                ext.hpi = true;
                ext.hpi_cmd = if hpi & EXT_CSD_HPI_IMPLEMENTATION != 0 {
                    MMC_STOP_TRANSMISSION
                } else {
                    MMC_SEND_STATUS
                };
                ext.out_of_int_time = raw[EXT_CSD_OUT_OF_INTERRUPT_TIME] as u32 * 10;
            }
            ext.wr_rel_param = raw[EXT_CSD_WR_REL_PARAM];
        }

        debug!(
            "ext_csd: rev {} sectors {} card_type {:#x} hs_max_dtr {}",
            ext.rev, ext.sectors, ext.card_type, ext.hs_max_dtr
        );
        Ok(ext)
    }

    /// Fields that must not change between two reads of the same card.
    pub fn same_identity(&self, other: &[u8]) -> bool {
        const CHECKED: [usize; 8] = [
            EXT_CSD_PARTITION_SUPPORT,
            EXT_CSD_HC_WP_GRP_SIZE,
            EXT_CSD_REV,
            EXT_CSD_HC_ERASE_GRP_SIZE,
            EXT_CSD_SEC_CNT,
            EXT_CSD_SEC_CNT + 1,
            EXT_CSD_SEC_CNT + 2,
            EXT_CSD_SEC_CNT + 3,
        ];
        other.len() >= EXT_CSD_SIZE && CHECKED.iter().all(|&i| self.raw[i] == other[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(rev: u8) -> Vec<u8> {
        let mut raw = vec![0u8; EXT_CSD_SIZE];
        raw[EXT_CSD_REV] = rev;
        raw
    }

    #[test]
    fn sector_count_sets_block_addr() {
        let mut raw = blank(2);
        raw[EXT_CSD_SEC_CNT..EXT_CSD_SEC_CNT + 4].copy_from_slice(&0x00E9_0000u32.to_le_bytes());
        let ext = ExtCsd::decode(&raw, 3, false).unwrap();
        assert_eq!(ext.sectors, 0x00E9_0000);
        assert!(ext.block_addr);

        let mut raw = blank(1);
        raw[EXT_CSD_SEC_CNT..EXT_CSD_SEC_CNT + 4].copy_from_slice(&0x00E9_0000u32.to_le_bytes());
        let ext = ExtCsd::decode(&raw, 3, false).unwrap();
        assert_eq!(ext.sectors, 0);
        assert!(!ext.block_addr);
    }

    #[test]
    fn card_type_buckets() {
        assert_eq!(decode_card_type(0x3F), (MMC_FREQ_200M, EXT_CSD_CARD_TYPE_SDR_200));
        assert_eq!(decode_card_type(0x17), (MMC_FREQ_200M, EXT_CSD_CARD_TYPE_SDR_1_8V));
        assert_eq!(decode_card_type(0x2B), (MMC_FREQ_200M, EXT_CSD_CARD_TYPE_SDR_1_2V));
        assert_eq!(decode_card_type(0x57), (MMC_FREQ_200M, EXT_CSD_CARD_TYPE_SDR_1_8V));
        assert_eq!(decode_card_type(0x0F), (MMC_FREQ_52M, EXT_CSD_CARD_TYPE_DDR_52));
        assert_eq!(decode_card_type(0x07), (MMC_FREQ_52M, EXT_CSD_CARD_TYPE_DDR_1_8V));
        assert_eq!(decode_card_type(0x0B), (MMC_FREQ_52M, EXT_CSD_CARD_TYPE_DDR_1_2V));
        assert_eq!(decode_card_type(0x03), (MMC_FREQ_52M, 0));
        assert_eq!(decode_card_type(0x01), (MMC_FREQ_26M, 0));
        assert_eq!(decode_card_type(0x00), (0, 0));
    }

    #[test]
    fn structure_checked_only_for_ext_csd_cards() {
        let mut raw = blank(5);
        raw[EXT_CSD_STRUCTURE] = 3;
        assert_eq!(ExtCsd::decode(&raw, 3, false), Err(SdError::DecodeInvalid));
        assert!(ExtCsd::decode(&raw, 2, false).is_ok());
    }

    #[test]
    fn revision_gated_fields() {
        let mut raw = blank(3);
        raw[EXT_CSD_ERASE_GROUP_DEF] = 1;
        raw[EXT_CSD_HC_ERASE_GRP_SIZE] = 2;
        raw[EXT_CSD_S_A_TIMEOUT] = 0x18;
        raw[EXT_CSD_HPI_FEATURE] = 3;
        raw[EXT_CSD_SEC_TRIM_MULT] = 7;
        let ext = ExtCsd::decode(&raw, 3, false).unwrap();
        assert_eq!(ext.hc_erase_size, 2048);
        assert_eq!(ext.sa_timeout, 0);
        assert_eq!(ext.sec_trim_mult, 0);
        assert!(!ext.hpi);

        raw[EXT_CSD_REV] = 5;
        raw[EXT_CSD_OUT_OF_INTERRUPT_TIME] = 4;
        let ext = ExtCsd::decode(&raw, 3, false).unwrap();
        assert_eq!(ext.sec_trim_mult, 7);
        assert!(ext.hpi);
        assert_eq!(ext.hpi_cmd, MMC_STOP_TRANSMISSION);
        assert_eq!(ext.out_of_int_time, 40);
    }

    #[test]
    fn enhanced_area() {
        let mut raw = blank(4);
        raw[EXT_CSD_PARTITION_SUPPORT] = EXT_CSD_PART_SUPPORT_ENH_ATTRIBUTE_EN;
        raw[EXT_CSD_PARTITION_ATTRIBUTE] = EXT_CSD_PART_ATTRIBUTE_ENH_USR;
        raw[EXT_CSD_ENH_START_ADDR] = 0x10;
        raw[EXT_CSD_ENH_SIZE_MULT] = 2;
        raw[EXT_CSD_HC_ERASE_GRP_SIZE] = 1;
        raw[EXT_CSD_HC_WP_GRP_SIZE] = 4;
        let ext = ExtCsd::decode(&raw, 3, true).unwrap();
        assert!(ext.enh_area_enable);
        assert_eq!(ext.enh_area_offset, 0x10 << 9);
        assert_eq!(ext.enh_area_size, 8 << 9);
    }
}
