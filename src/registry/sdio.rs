use log::debug;

use crate::constant::*;
use crate::err::SdError;

/// Card common control registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cccr {
    pub cccr_rev: u8,
    pub sdio_rev: u8,
    pub multi_block: bool,
    pub low_speed: bool,
    pub low_speed_4bit: bool,
    pub high_power: bool,
    pub high_speed: bool,
}

impl Cccr {
    pub fn decode_rev(&mut self, data: u8) -> Result<(), SdError> {
        self.cccr_rev = data & 0x0F;
        self.sdio_rev = data >> 4;
        if self.cccr_rev > SDIO_CCCR_REV_MAX {
            debug!("cccr: revision {} not supported", self.cccr_rev);
            return Err(SdError::NotSupported);
        }
        Ok(())
    }

    pub fn decode_caps(&mut self, data: u8) {
        self.low_speed_4bit = data & SDIO_CCCR_CAP_4BLS != 0;
        self.low_speed = data & SDIO_CCCR_CAP_LSC != 0;
        self.multi_block = data & SDIO_CCCR_CAP_SMB != 0;
    }
}

/// Common (function 0) CIS contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommonCis {
    pub vendor: u16,
    pub device: u16,
    pub blk_size: u16,
    pub max_dtr: u32,
}

/// Per-function CIS contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuncCis {
    pub vendor: u16,
    pub device: u16,
    pub max_blk_size: u16,
    pub enable_timeout_ms: u32,
}

/// Which CIS a walk is decoding into.
pub enum CisTarget<'a> {
    Common(&'a mut CommonCis),
    Function { cis: &'a mut FuncCis, sdio_rev: u8 },
}

const FUNCE_TYPE_COMMON: u8 = 0x00;
const FUNCE_TYPE_FUNCTION: u8 = 0x01;
const MAX_DTR_VALUE: [u32; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];
const MAX_DTR_UNIT: [u32; 8] = [10_000, 100_000, 1_000_000, 10_000_000, 0, 0, 0, 0];

fn decode_manfid(target: &mut CisTarget<'_>, body: &[u8]) {
    if body.len() < CISTPL_MANFID_MIN_LEN as usize {
        return;
    }
    let vendor = u16::from_le_bytes([body[0], body[1]]);
    let device = u16::from_le_bytes([body[2], body[3]]);
    match target {
        CisTarget::Common(c) => {
            c.vendor = vendor;
            c.device = device;
        }
        CisTarget::Function { cis, .. } => {
            cis.vendor = vendor;
            cis.device = device;
        }
    }
}

fn decode_funce(target: &mut CisTarget<'_>, body: &[u8]) {
    let Some(&kind) = body.first() else {
        return;
    };
    match (kind, target) {
        (FUNCE_TYPE_COMMON, CisTarget::Common(c)) => {
            if body.len() < CISTPL_FUNCE_COMMON_MIN_LEN as usize {
                return;
            }
            c.blk_size = u16::from_le_bytes([body[1], body[2]]);
            let speed = body[3];
            c.max_dtr = MAX_DTR_UNIT[(speed & 7) as usize] * MAX_DTR_VALUE[((speed >> 3) & 15) as usize];
        }
        (FUNCE_TYPE_FUNCTION, CisTarget::Function { cis, sdio_rev }) => {
            let min = if *sdio_rev == 0 {
                CISTPL_FUNCE_FUNC_V1_LEN
            } else {
                CISTPL_FUNCE_FUNC_LEN
            };
            if body.len() < min as usize {
                return;
            }
            cis.max_blk_size = u16::from_le_bytes([body[12], body[13]]);
            cis.enable_timeout_ms = if *sdio_rev > 0 {
                u16::from_le_bytes([body[28], body[29]]) as u32 * 10
            } else {
                SDIO_DEFAULT_ENABLE_TIMEOUT_MS
            };
        }
        _ => {}
    }
}

/// Walks a CIS tuple chain starting at `start`, reading one byte at a time
/// through `read`.
///
/// The chain ends at an END code, a NULL code, or a link byte of 0xFF. A
/// tuple with a zero link carries no body and is stepped over.
pub fn walk_cis<F>(start: u32, mut read: F, mut target: CisTarget<'_>) -> Result<(), SdError>
where
    F: FnMut(u32) -> Result<u8, SdError>,
{
    let mut addr = start;
    loop {
        let code = read(addr)?;
        if code == CISTPL_END || code == CISTPL_NULL {
            return Ok(());
        }
        addr += 1;
        let link = read(addr)?;
        if link == CISTPL_END {
            return Ok(());
        }
        addr += 1;
        if link == 0 {
            continue;
        }

        let mut body = Vec::new();
        body.try_reserve_exact(link as usize)
            .map_err(|_| SdError::AllocationFailure)?;
        for _ in 0..link {
            body.push(read(addr)?);
            addr += 1;
        }
        debug!("cis: tuple {:#04x} len {} at {:#x}", code, link, addr);

        match code {
            CISTPL_MANFID => decode_manfid(&mut target, &body),
            CISTPL_FUNCE => decode_funce(&mut target, &body),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn reader(image: Vec<u8>, log: &RefCell<Vec<u32>>) -> impl FnMut(u32) -> Result<u8, SdError> + '_ {
        move |addr| {
            log.borrow_mut().push(addr);
            image.get(addr as usize).copied().ok_or(SdError::IoError)
        }
    }

    #[test]
    fn common_cis() {
        let image = vec![
            0x20, 4, 0x71, 0x02, 0x01, 0x89, // MANFID
            0x22, 4, 0x00, 0x00, 0x02, 0x32, // FUNCE common
            0xFF,
        ];
        let log = RefCell::new(Vec::new());
        let mut cis = CommonCis::default();
        walk_cis(0, reader(image, &log), CisTarget::Common(&mut cis)).unwrap();
        assert_eq!(cis.vendor, 0x0271);
        assert_eq!(cis.device, 0x8901);
        assert_eq!(cis.blk_size, 512);
        assert_eq!(cis.max_dtr, 25_000_000);
    }

    #[test]
    fn end_stops_without_reading_further() {
        let image = vec![0x20, 4, 1, 2, 3, 4, 0xFF, 0x20, 4, 9, 9, 9, 9];
        let log = RefCell::new(Vec::new());
        let mut cis = CommonCis::default();
        walk_cis(0, reader(image, &log), CisTarget::Common(&mut cis)).unwrap();
        assert_eq!(*log.borrow().last().unwrap(), 6);
        assert_eq!(cis.vendor, 0x0201);
    }

    #[test]
    fn zero_link_is_skipped() {
        let image = vec![0x80, 0, 0x20, 4, 0x34, 0x12, 0x78, 0x56, 0xFF];
        let log = RefCell::new(Vec::new());
        let mut cis = CommonCis::default();
        walk_cis(0, reader(image, &log), CisTarget::Common(&mut cis)).unwrap();
        assert_eq!(cis.vendor, 0x1234);
        assert_eq!(cis.device, 0x5678);
        // code, link, then straight to the next tuple
        assert_eq!(&log.borrow()[..3], &[0, 1, 2]);
    }

    #[test]
    fn function_funce() {
        let mut body = vec![0u8; CISTPL_FUNCE_FUNC_LEN as usize];
        body[0] = 0x01;
        body[12] = 0x00;
        body[13] = 0x02;
        body[28] = 5;
        let mut image = vec![0x22, CISTPL_FUNCE_FUNC_LEN];
        image.extend_from_slice(&body);
        image.push(0xFF);

        let log = RefCell::new(Vec::new());
        let mut cis = FuncCis::default();
        walk_cis(0, reader(image.clone(), &log), CisTarget::Function { cis: &mut cis, sdio_rev: 2 }).unwrap();
        assert_eq!(cis.max_blk_size, 512);
        assert_eq!(cis.enable_timeout_ms, 50);

        let mut cis = FuncCis::default();
        walk_cis(0, reader(image, &log), CisTarget::Function { cis: &mut cis, sdio_rev: 0 }).unwrap();
        assert_eq!(cis.enable_timeout_ms, SDIO_DEFAULT_ENABLE_TIMEOUT_MS);
    }

    #[test]
    fn common_funce_ignored_for_function() {
        let image = vec![0x22, 4, 0x00, 0x00, 0x02, 0x32, 0xFF];
        let log = RefCell::new(Vec::new());
        let mut cis = FuncCis::default();
        walk_cis(0, reader(image, &log), CisTarget::Function { cis: &mut cis, sdio_rev: 1 }).unwrap();
        assert_eq!(cis, FuncCis::default());
    }

    #[test]
    fn cccr_revision() {
        let mut cccr = Cccr::default();
        assert!(cccr.decode_rev(0x32).is_ok());
        assert_eq!(cccr.sdio_rev, 3);
        assert_eq!(cccr.cccr_rev, 2);
        assert_eq!(cccr.decode_rev(0x04), Err(SdError::NotSupported));
        cccr.decode_caps(SDIO_CCCR_CAP_SMB | SDIO_CCCR_CAP_LSC);
        assert!(cccr.multi_block && cccr.low_speed && !cccr.low_speed_4bit);
    }
}
