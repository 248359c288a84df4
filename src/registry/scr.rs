use log::debug;

use crate::bits::{be_words, parse_bits};
use crate::constant::*;
use crate::err::SdError;

use super::{SCR_BITS, SSR_BITS};

/// SD configuration register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scr {
    pub sd_spec: u32,
    pub sd_spec3: bool,
    pub bus_widths: u32,
    pub cmd_support: u32,
}

impl Scr {
    /// `bytes` is the 8-byte ACMD51 payload as received.
    pub fn decode(bytes: &[u8]) -> Result<Self, SdError> {
        let raw: [u32; 2] = be_words(bytes);
        let structure = parse_bits(&raw, SCR_BITS, 60, 4);
        if structure != 0 {
            debug!("scr: structure {} is invalid", structure);
            return Err(SdError::InvalidParameter);
        }
        let sd_spec = parse_bits(&raw, SCR_BITS, 56, 4);
        let scr = Scr {
            sd_spec,
            sd_spec3: sd_spec == SD_SCR_SPEC_2 && parse_bits(&raw, SCR_BITS, 47, 1) == 1,
            bus_widths: parse_bits(&raw, SCR_BITS, 48, 4),
            cmd_support: parse_bits(&raw, SCR_BITS, 32, 2),
        };
        debug!("scr: {:?}", scr);
        Ok(scr)
    }
}

/// SD status register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ssr {
    pub speed_class: u32,
    pub au_size: u32,
    /// Allocation unit in sectors.
    pub au_value: u32,
    pub erase_timeout: u32,
    pub erase_offset: u32,
    pub uhs_speed_grade: u32,
}

impl Ssr {
    pub fn decode(bytes: &[u8], scr: &Scr) -> Self {
        let raw: [u32; 16] = be_words(bytes);
        let mut ssr = Ssr {
            speed_class: parse_bits(&raw, SSR_BITS, 440, 8),
            au_size: parse_bits(&raw, SSR_BITS, 428, 4),
            uhs_speed_grade: parse_bits(&raw, SSR_BITS, 396, 4),
            ..Default::default()
        };
        if ssr.au_size > 0 {
            if ssr.au_size <= SD_SSR_AU_SIZE_MAX_V2 || scr.sd_spec3 {
                ssr.au_value = 1 << (ssr.au_size + 4);
                let erase_size = parse_bits(&raw, SSR_BITS, 408, 16);
                let erase_timeout = parse_bits(&raw, SSR_BITS, 402, 6);
                if erase_size > 0 {
                    ssr.erase_timeout = erase_timeout * 1000 / erase_size;
                    ssr.erase_offset = 1000 * parse_bits(&raw, SSR_BITS, 400, 2);
                }
            } else {
                debug!("ssr: invalid AU size {}", ssr.au_size);
            }
        }
        debug!("ssr: {:?}", ssr);
        ssr
    }
}

/// UHS bus speed mode, numbered as the CMD6 group 1 function value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SdBusMode {
    #[default]
    Default,
    Sdr12,
    Sdr25,
    Sdr50,
    Sdr104,
    Ddr50,
}

impl SdBusMode {
    pub fn function(&self) -> u32 {
        match self {
            SdBusMode::Default | SdBusMode::Sdr12 => SD_FUNC_SDR12,
            SdBusMode::Sdr25 => SD_FUNC_SDR25,
            SdBusMode::Sdr50 => SD_FUNC_SDR50,
            SdBusMode::Sdr104 => SD_FUNC_SDR104,
            SdBusMode::Ddr50 => SD_FUNC_DDR50,
        }
    }

    pub fn max_dtr(&self) -> u32 {
        match self {
            SdBusMode::Default | SdBusMode::Sdr12 => SD_FREQ_SDR12,
            SdBusMode::Sdr25 => SD_FREQ_SDR25,
            SdBusMode::Sdr50 => SD_FREQ_SDR50,
            SdBusMode::Sdr104 => SD_FREQ_SDR104,
            SdBusMode::Ddr50 => SD_FREQ_DDR50,
        }
    }
}

/// Capabilities reported by the CMD6 check-mode status block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchCaps {
    pub hs_max_dtr: u32,
    pub uhs_max_dtr: u32,
    pub bus_mode: u8,
    pub drv_type: u8,
    pub curr_limit: u8,
}

/// Function-group-1 selection reported in a CMD6 status block.
pub fn switch_status_group1(status: &[u8]) -> u32 {
    status.get(16).map(|b| (b & 0x0F) as u32).unwrap_or(0)
}

/// Function-group-4 selection reported in a CMD6 status block.
pub fn switch_status_group4(status: &[u8]) -> u32 {
    status.get(15).map(|b| ((b >> 4) & 0x0F) as u32).unwrap_or(0)
}
