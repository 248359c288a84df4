#![allow(unused)]

// Command opcodes shared by MMC/SD/SDIO
pub const MMC_GO_IDLE_STATE: u32 = 0;
pub const MMC_SEND_OP_COND: u32 = 1;
pub const MMC_ALL_SEND_CID: u32 = 2;
pub const MMC_SET_RELATIVE_ADDR: u32 = 3;
pub const SD_SEND_RELATIVE_ADDR: u32 = 3;
pub const SDIO_SEND_OP_COND: u32 = 5;
pub const MMC_SWITCH: u32 = 6;
pub const SD_SWITCH_FUNC: u32 = 6;
pub const SD_ACMD_SET_BUS_WIDTH: u32 = 6;
pub const MMC_SELECT_CARD: u32 = 7;
pub const MMC_SEND_EXT_CSD: u32 = 8;
pub const SD_SEND_IF_COND: u32 = 8;
pub const MMC_SEND_CSD: u32 = 9;
pub const SD_SWITCH_VOLTAGE: u32 = 11;
pub const MMC_STOP_TRANSMISSION: u32 = 12;
pub const MMC_SEND_STATUS: u32 = 13;
pub const SD_ACMD_SD_STATUS: u32 = 13;
pub const MMC_READ_SINGLE_BLOCK: u32 = 17;
pub const MMC_READ_MULTIPLE_BLOCK: u32 = 18;
pub const SD_SEND_TUNING_BLOCK: u32 = 19;
pub const MMC_SEND_TUNING_BLOCK_HS200: u32 = 21;
pub const MMC_WRITE_BLOCK: u32 = 24;
pub const MMC_WRITE_MULTIPLE_BLOCK: u32 = 25;
pub const SD_ERASE_WR_BLK_START: u32 = 32;
pub const SD_ERASE_WR_BLK_END: u32 = 33;
pub const MMC_ERASE_GROUP_START: u32 = 35;
pub const MMC_ERASE_GROUP_END: u32 = 36;
pub const MMC_ERASE: u32 = 38;
pub const SD_ACMD_SD_SEND_OP_COND: u32 = 41;
pub const SD_ACMD_SEND_SCR: u32 = 51;
pub const SDIO_RW_DIRECT: u32 = 52;
pub const SDIO_RW_EXTENDED: u32 = 53;
pub const MMC_APP_CMD: u32 = 55;

// Retry budgets
pub const MMC_CMD_DEFAULT_RETRY: u32 = 3;
pub const MMC_STOP_RETRY: u32 = 5;
pub const MMC_OP_COND_LOOPS: u32 = 100;
pub const MMC_WAIT_READY_LOOPS: u32 = 100;
pub const MMC_DETECT_RETRY: u32 = 3;

// R1 card status
pub const R1_OUT_OF_RANGE: u32 = 1 << 31;
pub const R1_ADDRESS_ERROR: u32 = 1 << 30;
pub const R1_BLOCK_LEN_ERROR: u32 = 1 << 29;
pub const R1_ERASE_SEQ_ERROR: u32 = 1 << 28;
pub const R1_ERASE_PARAM: u32 = 1 << 27;
pub const R1_WP_VIOLATION: u32 = 1 << 26;
pub const R1_CARD_IS_LOCKED: u32 = 1 << 25;
pub const R1_COM_CRC_ERROR: u32 = 1 << 23;
pub const R1_ILLEGAL_COMMAND: u32 = 1 << 22;
pub const R1_CARD_ECC_FAILED: u32 = 1 << 21;
pub const R1_CC_ERROR: u32 = 1 << 20;
pub const R1_GENERAL_ERROR: u32 = 1 << 19;
pub const R1_CURRENT_STATE_MASK: u32 = 0x1E00;
pub const R1_CURRENT_STATE_SHIFT: u32 = 9;
pub const R1_READY_FOR_DATA: u32 = 1 << 8;
pub const R1_SWITCH_ERROR: u32 = 1 << 7;
pub const R1_IS_APP_CMD: u32 = 1 << 5;

pub const R1_STATE_PRG: u32 = 7;

// OCR
pub const OCR_BUSY: u32 = 0x8000_0000;
pub const OCR_HCS: u32 = 1 << 30;
pub const OCR_XPC: u32 = 1 << 28;
pub const OCR_S18R: u32 = 1 << 24;
pub const OCR_S18A_HCS: u32 = 0x4100_0000;
pub const OCR_RESERVED_LOW: u32 = 0x7F;
pub const OCR_1V65_1V95: u32 = 0x80;
pub const OCR_2V7_3V6: u32 = 0x00FF_8000;
pub const OCR_2V7_2V8: u32 = 1 << 15;
pub const OCR_3V5_3V6: u32 = 1 << 23;
pub const SDIO_OCR_MEM_PRESENT: u32 = 1 << 27;
pub const SDIO_OCR_FUNC_SHIFT: u32 = 28;
pub const SDIO_OCR_FUNC_MASK: u32 = 0x7;

// SEND_IF_COND
pub const SD_IF_COND_CHECK_PATTERN: u32 = 0xAA;

// CSD command classes
pub const CSD_CCC_ERASE: u32 = 1 << 5;
pub const CSD_CCC_APP_SPEC: u32 = 1 << 8;
pub const CSD_CCC_SWITCH: u32 = 1 << 10;

// Block geometry
pub const MMC_SECTOR_SIZE: usize = 512;
pub const MMC_SECTOR_SHIFT: u32 = 9;
/// Sectors a byte-addressed card can reach with a 32-bit argument.
pub const BYTE_ADDR_MAX_SECTORS: u64 = 1 << (32 - MMC_SECTOR_SHIFT);
pub const MMC_2G_SECTORS: u32 = (2 * 1024 * 1024 * 1024u64 / 512) as u32;

// Clock rates in Hz
pub const MMC_FREQ_26M: u32 = 26_000_000;
pub const MMC_FREQ_52M: u32 = 52_000_000;
pub const MMC_FREQ_200M: u32 = 200_000_000;
pub const SD_FREQ_HS: u32 = 50_000_000;
pub const SD_FREQ_SDR104: u32 = 208_000_000;
pub const SD_FREQ_DDR50: u32 = 50_000_000;
pub const SD_FREQ_SDR50: u32 = 100_000_000;
pub const SD_FREQ_SDR25: u32 = 50_000_000;
pub const SD_FREQ_SDR12: u32 = 25_000_000;
pub const SDIO_FREQ_HS: u32 = 50_000_000;

// EXT_CSD byte offsets
pub const EXT_CSD_ENH_START_ADDR: usize = 136;
pub const EXT_CSD_ENH_SIZE_MULT: usize = 140;
pub const EXT_CSD_PARTITION_SUPPORT: usize = 160;
pub const EXT_CSD_PARTITION_ATTRIBUTE: usize = 156;
pub const EXT_CSD_HPI_MGMT: usize = 161;
pub const EXT_CSD_WR_REL_PARAM: usize = 166;
pub const EXT_CSD_ERASE_GROUP_DEF: usize = 175;
pub const EXT_CSD_PART_CONFIG: usize = 179;
pub const EXT_CSD_BUS_WIDTH: usize = 183;
pub const EXT_CSD_STROBE_SUPPORT: usize = 184;
pub const EXT_CSD_HS_TIMING: usize = 185;
pub const EXT_CSD_POWER_CLASS: usize = 187;
pub const EXT_CSD_REV: usize = 192;
pub const EXT_CSD_STRUCTURE: usize = 194;
pub const EXT_CSD_CARD_TYPE: usize = 196;
pub const EXT_CSD_OUT_OF_INTERRUPT_TIME: usize = 198;
pub const EXT_CSD_PART_SWITCH_TIME: usize = 199;
pub const EXT_CSD_PWR_CL_52_195: usize = 200;
pub const EXT_CSD_PWR_CL_26_195: usize = 201;
pub const EXT_CSD_PWR_CL_52_360: usize = 202;
pub const EXT_CSD_PWR_CL_26_360: usize = 203;
pub const EXT_CSD_SEC_CNT: usize = 212;
pub const EXT_CSD_S_A_TIMEOUT: usize = 217;
pub const EXT_CSD_HC_WP_GRP_SIZE: usize = 221;
pub const EXT_CSD_REL_WR_SEC_C: usize = 222;
pub const EXT_CSD_ERASE_TIMEOUT_MULT: usize = 223;
pub const EXT_CSD_HC_ERASE_GRP_SIZE: usize = 224;
pub const EXT_CSD_BOOT_MULT: usize = 226;
pub const EXT_CSD_SEC_TRIM_MULT: usize = 229;
pub const EXT_CSD_SEC_ERASE_MULT: usize = 230;
pub const EXT_CSD_SEC_FEATURE_SUPPORT: usize = 231;
pub const EXT_CSD_TRIM_MULT: usize = 232;
pub const EXT_CSD_PWR_CL_200_195: usize = 236;
pub const EXT_CSD_PWR_CL_200_360: usize = 237;
pub const EXT_CSD_PWR_CL_DDR_52_195: usize = 238;
pub const EXT_CSD_PWR_CL_DDR_52_360: usize = 239;
pub const EXT_CSD_HPI_FEATURE: usize = 503;
pub const EXT_CSD_SIZE: usize = 512;

pub const EXT_CSD_STRUCTURE_MAX: u8 = 2;
pub const EXT_CSD_S_A_TIMEOUT_MAX: u8 = 0x17;

// EXT_CSD field values
pub const EXT_CSD_CMD_SET_NORMAL: u32 = 1 << 0;
pub const EXT_CSD_ACCESS_WRITE_BYTE: u32 = 3;
pub const EXT_CSD_PART_SUPPORT_ENH_ATTRIBUTE_EN: u8 = 1 << 1;
pub const EXT_CSD_PART_ATTRIBUTE_ENH_USR: u8 = 1 << 0;
pub const EXT_CSD_PART_CONFIG_ACCESS_MASK: u8 = 0x07;
pub const EXT_CSD_HPI_SUPPORT: u8 = 1 << 0;
pub const EXT_CSD_HPI_IMPLEMENTATION: u8 = 1 << 1;

pub const EXT_CSD_BUS_WIDTH_1: u8 = 0;
pub const EXT_CSD_BUS_WIDTH_4: u8 = 1;
pub const EXT_CSD_BUS_WIDTH_8: u8 = 2;
pub const EXT_CSD_DDR_BUS_WIDTH_4: u8 = 5;
pub const EXT_CSD_DDR_BUS_WIDTH_8: u8 = 6;
pub const EXT_CSD_BUS_WIDTH_STROBE: u8 = 0x80;

pub const EXT_CSD_TIMING_BC: u8 = 0;
pub const EXT_CSD_TIMING_HS: u8 = 1;
pub const EXT_CSD_TIMING_HS200: u8 = 2;
pub const EXT_CSD_TIMING_HS400: u8 = 3;

pub const EXT_CSD_PWR_CL_8BIT_MASK: u8 = 0xF0;
pub const EXT_CSD_PWR_CL_8BIT_SHIFT: u8 = 4;
pub const EXT_CSD_PWR_CL_4BIT_MASK: u8 = 0x0F;

// EXT_CSD CARD_TYPE
pub const EXT_CSD_CARD_TYPE_26: u32 = 0x01;
pub const EXT_CSD_CARD_TYPE_52: u32 = 0x02;
pub const EXT_CSD_CARD_TYPE_DDR_1_8V: u32 = 0x04;
pub const EXT_CSD_CARD_TYPE_DDR_1_2V: u32 = 0x08;
pub const EXT_CSD_CARD_TYPE_DDR_52: u32 = 0x0C;
pub const EXT_CSD_CARD_TYPE_SDR_1_8V: u32 = 0x10;
pub const EXT_CSD_CARD_TYPE_SDR_1_2V: u32 = 0x20;
pub const EXT_CSD_CARD_TYPE_SDR_200: u32 = 0x30;
pub const EXT_CSD_CARD_TYPE_HS400_1_8V: u32 = 0x40;
pub const EXT_CSD_CARD_TYPE_HS400_1_2V: u32 = 0x80;
pub const EXT_CSD_CARD_TYPE_HS400: u32 = 0xC0;
pub const EXT_CSD_CARD_TYPE_HS400ES: u32 = 0x100;
pub const EXT_CSD_CARD_TYPE_MASK: u8 = 0x3F;

// SD CMD6 switch function
pub const SD_SWITCH_CHECK: u32 = 0;
pub const SD_SWITCH_SET: u32 = 1;
pub const SD_SWITCH_STATUS_LEN: usize = 64;
pub const SD_SWITCH_GROUP_ACCESS_MODE: u32 = 0;
pub const SD_SWITCH_GROUP_DRIVER_STRENGTH: u32 = 2;
pub const SD_SWITCH_GROUP_CURRENT_LIMIT: u32 = 3;

pub const SD_BUS_SPEED_HS: u8 = 1 << 1;
pub const SD_MODE_UHS_SDR12: u8 = 1 << 0;
pub const SD_MODE_UHS_SDR25: u8 = 1 << 1;
pub const SD_MODE_UHS_SDR50: u8 = 1 << 2;
pub const SD_MODE_UHS_SDR104: u8 = 1 << 3;
pub const SD_MODE_UHS_DDR50: u8 = 1 << 4;

pub const SD_FUNC_HS: u32 = 1;
pub const SD_FUNC_SDR12: u32 = 0;
pub const SD_FUNC_SDR25: u32 = 1;
pub const SD_FUNC_SDR50: u32 = 2;
pub const SD_FUNC_SDR104: u32 = 3;
pub const SD_FUNC_DDR50: u32 = 4;

pub const SD_MAX_CURRENT_200: u8 = 1 << 0;
pub const SD_MAX_CURRENT_400: u8 = 1 << 1;
pub const SD_MAX_CURRENT_600: u8 = 1 << 2;
pub const SD_MAX_CURRENT_800: u8 = 1 << 3;
pub const SD_CURRENT_LIMIT_200: u32 = 0;
pub const SD_CURRENT_LIMIT_400: u32 = 1;
pub const SD_CURRENT_LIMIT_600: u32 = 2;
pub const SD_CURRENT_LIMIT_800: u32 = 3;

pub const SD_BUS_WIDTH_1: u32 = 0;
pub const SD_BUS_WIDTH_4: u32 = 2;

// SCR / SSR
pub const SD_SCR_LEN: usize = 8;
pub const SD_SSR_LEN: usize = 64;
pub const SD_SCR_SPEC_1: u32 = 1;
pub const SD_SCR_SPEC_2: u32 = 2;
pub const SD_SCR_BUS_WIDTH_4: u32 = 1 << 2;
pub const SD_SSR_AU_SIZE_MAX_V2: u32 = 9;

// Tuning block patterns
pub const TUNING_BLK_4BIT_LEN: usize = 64;
pub const TUNING_BLK_8BIT_LEN: usize = 128;

// SDIO CCCR
pub const SDIO_CCCR_REV: u32 = 0x00;
pub const SDIO_CCCR_SD_REV: u32 = 0x01;
pub const SDIO_CCCR_IO_ENABLE: u32 = 0x02;
pub const SDIO_CCCR_IO_READY: u32 = 0x03;
pub const SDIO_CCCR_INT_ENABLE: u32 = 0x04;
pub const SDIO_CCCR_INT_PENDING: u32 = 0x05;
pub const SDIO_CCCR_IO_ABORT: u32 = 0x06;
pub const SDIO_CCCR_BUS_IF_CONTROL: u32 = 0x07;
pub const SDIO_CCCR_CARD_CAPS: u32 = 0x08;
pub const SDIO_CCCR_COMMON_CIS_PTR: u32 = 0x09;
pub const SDIO_CCCR_POWER: u32 = 0x12;
pub const SDIO_CCCR_SPEED: u32 = 0x13;

pub const SDIO_CCCR_REV_MAX: u8 = 3;
pub const SDIO_CCCR_REV_1_10: u8 = 1;
pub const SDIO_CCCR_REV_1_20: u8 = 2;

pub const SDIO_CCCR_RES: u8 = 0x08;
pub const SDIO_CCCR_CD_DISABLE: u8 = 0x80;
pub const SDIO_CCCR_WIDTH_4BIT: u8 = 0x02;
pub const SDIO_CCCR_CAP_SMB: u8 = 0x02;
pub const SDIO_CCCR_CAP_LSC: u8 = 0x40;
pub const SDIO_CCCR_CAP_4BLS: u8 = 0x80;
pub const SDIO_CCCR_POWER_SMPC: u8 = 0x01;
pub const SDIO_CCCR_SPEED_SHS: u8 = 0x01;
pub const SDIO_CCCR_SPEED_EHS: u8 = 0x02;
pub const SDIO_CCCR_INT_MASTER: u8 = 0x01;

// SDIO FBR
pub const SDIO_FBR_BASE_SHIFT: u32 = 8;
pub const SDIO_FBR_STD_IF: u32 = 0x00;
pub const SDIO_FBR_STD_IF_EXT: u32 = 0x01;
pub const SDIO_FBR_CIS_PTR: u32 = 0x09;
pub const SDIO_FBR_BLK_SIZE: u32 = 0x10;
pub const SDIO_FBR_STD_IF_MASK: u8 = 0x0F;
pub const SDIO_CIS_PTR_LEN: u32 = 3;

pub const SDIO_MAX_FUNCTIONS: u32 = 7;
pub const SDIO_MAX_BLOCK_SIZE: u32 = 512;
pub const SDIO_MAX_BLOCK_COUNT: u32 = 511;
pub const SDIO_MAX_REG_ADDR: u32 = 0x1FFFF;
pub const SDIO_DEFAULT_ENABLE_TIMEOUT_MS: u32 = 100;

// SDIO CIS tuples
pub const CISTPL_NULL: u8 = 0x00;
pub const CISTPL_MANFID: u8 = 0x20;
pub const CISTPL_FUNCE: u8 = 0x22;
pub const CISTPL_END: u8 = 0xFF;
pub const CISTPL_MANFID_MIN_LEN: u8 = 4;
pub const CISTPL_FUNCE_COMMON_MIN_LEN: u8 = 4;
pub const CISTPL_FUNCE_FUNC_V1_LEN: u8 = 0x1C;
pub const CISTPL_FUNCE_FUNC_LEN: u8 = 0x2A;

// SDIO R5 response flags
pub const SDIO_R5_COM_CRC_ERROR: u32 = 1 << 15;
pub const SDIO_R5_ILLEGAL_COMMAND: u32 = 1 << 14;
pub const SDIO_R5_ERROR: u32 = 1 << 11;
pub const SDIO_R5_FUNCTION_NUMBER: u32 = 1 << 9;
pub const SDIO_R5_OUT_OF_RANGE: u32 = 1 << 8;
pub const SDIO_R5_DATA_MASK: u32 = 0xFF;
