use std::sync::Arc;

use log::{debug, info, warn};

use super::{CardProtocol, sd};
use crate::constant::*;
use crate::device::{Device, DeviceKind, DeviceState, SdioFunction, SdioRegs};
use crate::err::SdError;
use crate::host::{Bus, BusTiming, BusWidth, HostCaps};
use crate::registry::sdio::{CisTarget, walk_cis};
use crate::registry::{Cccr, CommonCis, FuncCis};

pub struct SdioProtocol;

impl CardProtocol for SdioProtocol {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Sdio
    }

    fn detect(&self, bus: &mut Bus) -> Result<Device, SdError> {
        bus.sdio_io_reset();
        bus.mmc_go_idle()?;
        let mut dev = Device::new(DeviceKind::Sdio);
        sdio_init(bus, &mut dev)?;
        info!(
            "bus{}: {:?} vendor {:#06x} device {:#06x}, {} function(s)",
            bus.cfg.index,
            dev.kind,
            dev.sdio.as_ref().map(|s| s.cis.vendor).unwrap_or(0),
            dev.sdio.as_ref().map(|s| s.cis.device).unwrap_or(0),
            dev.functions().len()
        );
        Ok(dev)
    }

    fn reinit(&self, bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
        bus.mmc_go_idle()?;
        bus.set_clock(bus.cfg.freq_min)?;
        bus.sdio_send_op_cond(0)?;
        bus.sdio_send_op_cond(dev.ocr)?;
        bus.sd_send_relative_addr()?;
        bus.mmc_select_card()?;

        match enable_high_speed(bus, dev) {
            Ok(()) => bus.set_bus_timing(BusTiming::SdHs)?,
            Err(SdError::NotSupported) => {}
            Err(e) => return Err(e),
        }
        let clock = max_clock(bus, dev);
        bus.set_clock(clock)?;

        match enable_4bit(bus, dev) {
            Ok(()) => bus.set_bus_width(BusWidth::Width4),
            Err(SdError::NotSupported) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Only meaningful for the memory half of a combo card.
    fn erase_cmds(&self) -> Option<(u32, u32)> {
        Some((SD_ERASE_WR_BLK_START, SD_ERASE_WR_BLK_END))
    }
}

// ===== CCCR / FBR access =====

pub(crate) fn fbr_base(func: u32) -> u32 {
    func << SDIO_FBR_BASE_SHIFT
}

impl Bus {
    pub fn sdio_read_byte(&mut self, func: u32, addr: u32) -> Result<u8, SdError> {
        self.io_rw_direct(false, func, addr, 0, false)
    }

    pub fn sdio_write_byte(&mut self, func: u32, addr: u32, data: u8) -> Result<(), SdError> {
        self.io_rw_direct(true, func, addr, data, false).map(|_| ())
    }

    /// Write RES in CCCR ABORT. The card may not answer, so failures are
    /// only logged.
    pub(crate) fn sdio_io_reset(&mut self) {
        let val = match self.sdio_read_byte(0, SDIO_CCCR_IO_ABORT) {
            Ok(v) => v | SDIO_CCCR_RES,
            Err(_) => SDIO_CCCR_RES,
        };
        if let Err(e) = self.sdio_write_byte(0, SDIO_CCCR_IO_ABORT, val) {
            debug!("bus{}: io reset: {}", self.cfg.index, e);
        }
    }

    fn sdio_update_cccr<F>(&mut self, addr: u32, f: F) -> Result<u8, SdError>
    where
        F: FnOnce(u8) -> u8,
    {
        let val = f(self.sdio_read_byte(0, addr)?);
        self.sdio_write_byte(0, addr, val)?;
        Ok(val)
    }

    pub(crate) fn sdio_cd_disable(&mut self) -> Result<(), SdError> {
        self.sdio_update_cccr(SDIO_CCCR_BUS_IF_CONTROL, |v| v | SDIO_CCCR_CD_DISABLE)
            .map(|_| ())
    }

    pub fn sdio_io_enable_reg(&mut self) -> Result<u8, SdError> {
        self.sdio_read_byte(0, SDIO_CCCR_IO_ENABLE)
    }

    pub fn sdio_io_ready_reg(&mut self) -> Result<u8, SdError> {
        self.sdio_read_byte(0, SDIO_CCCR_IO_READY)
    }

    pub fn sdio_int_pending_reg(&mut self) -> Result<u8, SdError> {
        self.sdio_read_byte(0, SDIO_CCCR_INT_PENDING)
    }

    pub(crate) fn sdio_set_io_enable(&mut self, func: u32, enable: bool) -> Result<(), SdError> {
        self.sdio_update_cccr(SDIO_CCCR_IO_ENABLE, |v| {
            if enable { v | (1 << func) } else { v & !(1 << func) }
        })
        .map(|_| ())
    }

    /// Toggle a function's interrupt enable, keeping the master bit set
    /// while any function remains enabled.
    pub(crate) fn sdio_set_int_enable(&mut self, func: u32, enable: bool) -> Result<(), SdError> {
        self.sdio_update_cccr(SDIO_CCCR_INT_ENABLE, |v| {
            if enable {
                v | SDIO_CCCR_INT_MASTER | (1 << func)
            } else {
                let v = v & !(1 << func);
                if v & 0xFE == 0 { 0 } else { v }
            }
        })
        .map(|_| ())
    }

    fn sdio_bus_speed_select(&mut self, high_speed: bool) -> Result<(), SdError> {
        self.sdio_update_cccr(SDIO_CCCR_SPEED, |v| {
            if high_speed {
                v | SDIO_CCCR_SPEED_EHS
            } else {
                v & !SDIO_CCCR_SPEED_EHS
            }
        })
        .map(|_| ())
    }

    /// Program a function's block size through its FBR.
    pub(crate) fn sdio_set_fbr_block_size(&mut self, func: u32, size: u32) -> Result<(), SdError> {
        let base = fbr_base(func);
        self.sdio_write_byte(0, base + SDIO_FBR_BLK_SIZE, (size & 0xFF) as u8)?;
        self.sdio_write_byte(0, base + SDIO_FBR_BLK_SIZE + 1, ((size >> 8) & 0xFF) as u8)
    }

    fn sdio_read_cis_ptr(&mut self, base: u32) -> Result<u32, SdError> {
        let mut ptr = 0u32;
        for i in 0..SDIO_CIS_PTR_LEN {
            let b = self.sdio_read_byte(0, base + SDIO_FBR_CIS_PTR + i)?;
            ptr |= (b as u32) << (i * 8);
        }
        Ok(ptr)
    }
}

// ===== Enumeration =====

fn sdio_regs(dev: &Device) -> Result<&SdioRegs, SdError> {
    dev.sdio.as_ref().ok_or(SdError::InvalidObject)
}

fn read_cccr(bus: &mut Bus) -> Result<Cccr, SdError> {
    let mut cccr = Cccr::default();
    cccr.decode_rev(bus.sdio_read_byte(0, SDIO_CCCR_REV)?)?;
    cccr.decode_caps(bus.sdio_read_byte(0, SDIO_CCCR_CARD_CAPS)?);
    if cccr.cccr_rev >= SDIO_CCCR_REV_1_10 {
        cccr.high_power = bus.sdio_read_byte(0, SDIO_CCCR_POWER)? & SDIO_CCCR_POWER_SMPC != 0;
    }
    if cccr.cccr_rev >= SDIO_CCCR_REV_1_20 {
        cccr.high_speed = bus.sdio_read_byte(0, SDIO_CCCR_SPEED)? & SDIO_CCCR_SPEED_SHS != 0;
    }
    debug!("bus{}: cccr {:?}", bus.cfg.index, cccr);
    Ok(cccr)
}

fn read_common_cis(bus: &mut Bus) -> Result<CommonCis, SdError> {
    let ptr = bus.sdio_read_cis_ptr(0)?;
    let mut cis = CommonCis::default();
    walk_cis(ptr, |addr| bus.sdio_read_byte(0, addr), CisTarget::Common(&mut cis))?;
    debug!("bus{}: common cis {:?}", bus.cfg.index, cis);
    Ok(cis)
}

fn read_function(bus: &mut Bus, num: u32, common: &CommonCis, sdio_rev: u8) -> Result<SdioFunction, SdError> {
    let base = fbr_base(num);
    let mut class = bus.sdio_read_byte(0, base + SDIO_FBR_STD_IF)? & SDIO_FBR_STD_IF_MASK;
    if class == SDIO_FBR_STD_IF_MASK {
        class = bus.sdio_read_byte(0, base + SDIO_FBR_STD_IF_EXT)?;
    }

    let ptr = bus.sdio_read_cis_ptr(base)?;
    let mut cis = FuncCis::default();
    walk_cis(
        ptr,
        |addr| bus.sdio_read_byte(0, addr),
        CisTarget::Function {
            cis: &mut cis,
            sdio_rev,
        },
    )?;

    let vendor = if cis.vendor == 0 { common.vendor } else { cis.vendor };
    let device = if cis.device == 0 { common.device } else { cis.device };
    let max_blk_size = if cis.max_blk_size == 0 {
        common.blk_size
    } else {
        cis.max_blk_size
    };
    let timeout = if cis.enable_timeout_ms == 0 {
        SDIO_DEFAULT_ENABLE_TIMEOUT_MS
    } else {
        cis.enable_timeout_ms
    };
    let func = SdioFunction::new(num, class, vendor, device, max_blk_size as u32, timeout);
    debug!("bus{}: {:?}", bus.cfg.index, func);
    Ok(func)
}

fn add_functions(bus: &mut Bus, dev: &mut Device, rocr: u32) -> Result<(), SdError> {
    let count = (rocr >> SDIO_OCR_FUNC_SHIFT) & SDIO_OCR_FUNC_MASK;
    let (common, sdio_rev) = {
        let regs = sdio_regs(dev)?;
        (regs.cis, regs.cccr.sdio_rev)
    };
    let mut functions = Vec::with_capacity(count as usize);
    for num in 1..=count {
        functions.push(Arc::new(read_function(bus, num, &common, sdio_rev)?));
    }
    if let Some(regs) = dev.sdio.as_mut() {
        regs.functions = functions;
    }
    Ok(())
}

/// Identification up to the common CIS. Returns the card's CMD5 response.
fn sdio_select(bus: &mut Bus, dev: &mut Device) -> Result<u32, SdError> {
    let rocr = bus.sdio_send_op_cond(dev.ocr)?;
    if rocr & SDIO_OCR_MEM_PRESENT != 0 {
        match sd::sd_select(bus, dev) {
            Ok(_) => dev.kind = DeviceKind::Combo,
            Err(e) => debug!("bus{}: memory half not usable: {}", bus.cfg.index, e),
        }
    }

    dev.rca = bus.sd_send_relative_addr()?;
    if dev.kind == DeviceKind::Combo {
        sd::read_csd(bus, dev)?;
    }
    bus.mmc_select_card()?;

    let cccr = read_cccr(bus)?;
    let cis = read_common_cis(bus)?;
    dev.sdio = Some(SdioRegs {
        cccr,
        cis,
        functions: Vec::new(),
    });

    if dev.kind == DeviceKind::Combo {
        if let Err(e) = sd::read_registers(bus, dev) {
            warn!("bus{}: combo memory registers unreadable, io only: {}", bus.cfg.index, e);
            bus.mmc_go_idle()?;
            dev.kind = DeviceKind::Sdio;
            dev.sd = None;
        }
    }
    Ok(rocr)
}

fn switch_high_speed(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    if !bus.has_cap(HostCaps::HIGH_SPEED) || !sdio_regs(dev)?.cccr.high_speed {
        return Err(SdError::NotSupported);
    }
    bus.sdio_bus_speed_select(true)
}

/// High speed on the I/O half and, for a combo card, the memory half too.
fn enable_high_speed(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    switch_high_speed(bus, dev)?;
    dev.set_state(DeviceState::HIGH_SPEED);
    if dev.kind == DeviceKind::Combo {
        if let Err(e) = sd::switch_high_speed(bus, dev) {
            warn!("bus{}: combo memory refused high speed: {}", bus.cfg.index, e);
            dev.clear_state(DeviceState::HIGH_SPEED);
            if let Err(re) = bus.sdio_bus_speed_select(false) {
                warn!("bus{}: revert to default speed failed: {}", bus.cfg.index, re);
            }
            return Err(e);
        }
    }
    Ok(())
}

fn switch_4bit(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    let cccr = sdio_regs(dev)?.cccr;
    if !bus.has_cap(HostCaps::CAP_4BIT) || (cccr.low_speed && !cccr.low_speed_4bit) {
        return Err(SdError::NotSupported);
    }
    bus.sdio_update_cccr(SDIO_CCCR_BUS_IF_CONTROL, |v| v | SDIO_CCCR_WIDTH_4BIT)
        .map(|_| ())
}

fn enable_4bit(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    switch_4bit(bus, dev)?;
    if dev.kind == DeviceKind::Combo {
        let widths = dev.sd.as_ref().map(|r| r.scr.bus_widths).unwrap_or(0);
        if widths & SD_SCR_BUS_WIDTH_4 != 0 && bus.has_cap(HostCaps::CAP_4BIT) {
            bus.sd_app_set_bus_width(SD_BUS_WIDTH_4)?;
        }
    }
    Ok(())
}

fn max_clock(bus: &Bus, dev: &Device) -> u32 {
    let mut clock = if dev.has_state(DeviceState::HIGH_SPEED) {
        SDIO_FREQ_HS
    } else {
        match dev.sdio.as_ref().map(|s| s.cis.max_dtr) {
            Some(dtr) if dtr > 0 => dtr,
            _ => bus.ios.clock,
        }
    };
    if dev.kind == DeviceKind::Combo {
        clock = clock.min(sd::max_clock(bus, dev));
    }
    clock.min(bus.cfg.freq_max)
}

fn sdio_init(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    let ocr = bus.sdio_send_op_cond(0)?;
    let ocr = bus.select_work_voltage(ocr);
    if ocr == 0 {
        warn!("bus{}: sdio work voltage is invalid", bus.cfg.index);
        return Err(SdError::InvalidParameter);
    }
    dev.ocr = ocr;

    let rocr = sdio_select(bus, dev)?;
    bus.sdio_cd_disable()?;

    match enable_high_speed(bus, dev) {
        Ok(()) => bus.set_bus_timing(BusTiming::SdHs)?,
        Err(SdError::NotSupported) => debug!("bus{}: sdio stays at default speed", bus.cfg.index),
        Err(e) => return Err(e),
    }
    let clock = max_clock(bus, dev);
    bus.set_clock(clock)?;

    match enable_4bit(bus, dev) {
        Ok(()) => bus.set_bus_width(BusWidth::Width4)?,
        Err(SdError::NotSupported) => debug!("bus{}: sdio stays 1-bit", bus.cfg.index),
        Err(e) => return Err(e),
    }

    add_functions(bus, dev, rocr)?;

    if dev.kind == DeviceKind::Combo {
        dev.set_state(DeviceState::REMOVABLE);
        dev.erase_size = dev.csd.erase_size;
        dev.capacity = dev.csd.sectors();
    }
    dev.set_state(DeviceState::PRESENT);
    Ok(())
}
