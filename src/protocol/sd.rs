use log::{debug, info, warn};

use super::CardProtocol;
use crate::constant::*;
use crate::device::{Device, DeviceKind, DeviceState, SdRegs};
use crate::err::SdError;
use crate::host::{Bus, BusTiming, BusWidth, HostCaps, SignalVoltage};
use crate::registry::scr::{SdBusMode, switch_status_group1, switch_status_group4};
use crate::registry::{Cid, Csd, Scr, Ssr, SwitchCaps};

pub struct SdProtocol;

impl CardProtocol for SdProtocol {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Sd
    }

    fn detect(&self, bus: &mut Bus) -> Result<Device, SdError> {
        let mut dev = Device::new(DeviceKind::Sd);
        bus.mmc_go_idle()?;
        // Required before ACMD41 on v2 cards; v1 cards stay silent.
        let _ = bus.sd_send_if_cond(bus.cfg.voltages);
        sd_init(bus, &mut dev)?;
        info!(
            "bus{}: sd {}{} at rca {:#x}",
            bus.cfg.index,
            dev.cid.pnm,
            if dev.has_state(DeviceState::UHS) {
                " (uhs)"
            } else if dev.has_state(DeviceState::HIGH_SPEED) {
                " (high speed)"
            } else {
                ""
            },
            dev.rca
        );
        Ok(dev)
    }

    fn erase_cmds(&self) -> Option<(u32, u32)> {
        Some((SD_ERASE_WR_BLK_START, SD_ERASE_WR_BLK_END))
    }
}

fn sd_init(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    let ocr = bus.sd_send_op_cond(0)?;
    let ocr = bus.select_work_voltage(ocr);
    if ocr == 0 {
        warn!("bus{}: sd work voltage is invalid", bus.cfg.index);
        return Err(SdError::InvalidParameter);
    }
    dev.ocr = ocr;

    let low_voltage = sd_select(bus, dev)?;
    dev.rca = bus.sd_send_relative_addr()?;
    read_csd(bus, dev)?;
    bus.mmc_select_card()?;
    read_registers(bus, dev)?;

    if low_voltage {
        uhs_init(bus, dev)?;
        dev.set_state(DeviceState::UHS);
    } else {
        hs_init(bus, dev)?;
    }
    device_add(dev);
    Ok(())
}

/// Negotiate operating conditions and read the CID. Returns whether the bus
/// now signals at 1.8V.
pub(crate) fn sd_select(bus: &mut Bus, dev: &mut Device) -> Result<bool, SdError> {
    let mut ocr = dev.ocr;
    let mut request_1v8 = bus.supports_uhs();
    let mut low_voltage = false;

    loop {
        bus.mmc_go_idle()?;
        if bus.sd_send_if_cond(dev.ocr).is_ok() {
            ocr |= OCR_HCS;
        }
        if bus.has_cap(HostCaps::XPC) {
            ocr |= OCR_XPC;
        }
        if request_1v8 {
            ocr |= OCR_S18R;
        } else {
            ocr &= !OCR_S18R;
        }
        let rocr = bus.sd_send_op_cond(ocr)?;

        if !bus.has_cap(HostCaps::SD3) {
            break;
        }
        if request_1v8 && rocr & OCR_S18A_HCS == OCR_S18A_HCS {
            let switched = bus
                .sd_switch_voltage()
                .and_then(|_| bus.switch_voltage(SignalVoltage::V180));
            match switched {
                Ok(()) => low_voltage = true,
                Err(e) => {
                    warn!("bus{}: 1.8V switch failed, retry at 3.3V: {}", bus.cfg.index, e);
                    request_1v8 = false;
                    continue;
                }
            }
        }
        break;
    }

    dev.raw_cid = bus.mmc_all_send_cid()?;
    dev.cid = Cid::decode_sd(&dev.raw_cid);
    Ok(low_voltage)
}

pub(crate) fn read_csd(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    dev.raw_csd = bus.mmc_send_csd()?;
    dev.csd = Csd::decode_sd(&dev.raw_csd)?;
    if dev.csd.block_addr {
        dev.set_state(DeviceState::BLOCK_ADDR);
    }
    if dev.csd.sdxc {
        dev.set_state(DeviceState::SDXC);
    }
    Ok(())
}

/// SCR, SSR and switch capabilities, then the best common bus mode.
pub(crate) fn read_registers(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    let scr = Scr::decode(&bus.sd_app_send_scr()?)?;
    let ssr = if dev.csd.has_class(CSD_CCC_APP_SPEC) {
        Ssr::decode(&bus.sd_app_sd_status()?, &scr)
    } else {
        Ssr::default()
    };
    let sw_caps = read_switch_caps(bus, dev, &scr)?;
    if bus.dev_read_only() {
        dev.set_state(DeviceState::READONLY);
    }
    let bus_mode = select_bus_mode(bus.caps(), &scr, &sw_caps);
    debug!("bus{}: sd bus mode {:?}", bus.cfg.index, bus_mode);
    dev.sd = Some(SdRegs {
        scr,
        ssr,
        sw_caps,
        bus_mode,
    });
    Ok(())
}

fn read_switch_caps(bus: &mut Bus, dev: &Device, scr: &Scr) -> Result<SwitchCaps, SdError> {
    let mut caps = SwitchCaps::default();
    if scr.sd_spec < SD_SCR_SPEC_1 || !dev.csd.has_class(CSD_CCC_SWITCH) {
        return Ok(caps);
    }

    // Status bytes arrive most significant first: group 1 support at [13],
    // group 3 at [9], group 4 at [7].
    let status = bus.sd_switch_func(SD_SWITCH_CHECK, SD_SWITCH_GROUP_ACCESS_MODE, 1)?;
    if status[13] & SD_BUS_SPEED_HS != 0 {
        caps.hs_max_dtr = SD_FREQ_HS;
    }
    if scr.sd_spec3 {
        caps.bus_mode = status[13];
        let status = bus.sd_switch_func(SD_SWITCH_CHECK, SD_SWITCH_GROUP_DRIVER_STRENGTH, 1)?;
        caps.drv_type = status[9];
        let status = bus.sd_switch_func(SD_SWITCH_CHECK, SD_SWITCH_GROUP_CURRENT_LIMIT, 1)?;
        caps.curr_limit = status[7];
    }
    Ok(caps)
}

/// Fastest UHS mode both sides support, or `Default` without UHS.
pub(crate) fn select_bus_mode(host: HostCaps, scr: &Scr, caps: &SwitchCaps) -> SdBusMode {
    if !host.intersects(HostCaps::UHS) || !scr.sd_spec3 {
        return SdBusMode::Default;
    }
    let card = caps.bus_mode;
    let sdr104 = host.contains(HostCaps::UHS_SDR104);
    let sdr50 = sdr104 || host.contains(HostCaps::UHS_SDR50);
    let sdr25 = sdr50 || host.contains(HostCaps::UHS_SDR25);
    let sdr12 = sdr25 || host.contains(HostCaps::UHS_SDR12);

    if sdr104 && card & SD_MODE_UHS_SDR104 != 0 {
        SdBusMode::Sdr104
    } else if host.contains(HostCaps::UHS_DDR50) && card & SD_MODE_UHS_DDR50 != 0 {
        SdBusMode::Ddr50
    } else if sdr50 && card & SD_MODE_UHS_SDR50 != 0 {
        SdBusMode::Sdr50
    } else if sdr25 && card & SD_MODE_UHS_SDR25 != 0 {
        SdBusMode::Sdr25
    } else if sdr12 && card & SD_MODE_UHS_SDR12 != 0 {
        SdBusMode::Sdr12
    } else {
        SdBusMode::Default
    }
}

/// Group 4 value for the current limit, capped by the host.
pub(crate) fn current_limit(host: HostCaps, mode: SdBusMode, card: u8) -> u32 {
    if !matches!(mode, SdBusMode::Sdr104 | SdBusMode::Ddr50 | SdBusMode::Sdr50) {
        return SD_CURRENT_LIMIT_200;
    }
    let card_max = if card & SD_MAX_CURRENT_800 != 0 {
        SD_CURRENT_LIMIT_800
    } else if card & SD_MAX_CURRENT_600 != 0 {
        SD_CURRENT_LIMIT_600
    } else if card & SD_MAX_CURRENT_400 != 0 {
        SD_CURRENT_LIMIT_400
    } else {
        SD_CURRENT_LIMIT_200
    };
    let host_max = if host.contains(HostCaps::MAX_CURRENT_800) {
        SD_CURRENT_LIMIT_800
    } else if host.contains(HostCaps::MAX_CURRENT_600) {
        SD_CURRENT_LIMIT_600
    } else if host.contains(HostCaps::MAX_CURRENT_400) {
        SD_CURRENT_LIMIT_400
    } else if host.contains(HostCaps::MAX_CURRENT_200) {
        SD_CURRENT_LIMIT_200
    } else {
        return card_max;
    };
    card_max.min(host_max)
}

fn sd_regs(dev: &Device) -> Result<&SdRegs, SdError> {
    dev.sd.as_ref().ok_or(SdError::InvalidObject)
}

pub(crate) fn switch_4bit(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    let widths = sd_regs(dev)?.scr.bus_widths;
    if widths & SD_SCR_BUS_WIDTH_4 != 0 && bus.has_cap(HostCaps::CAP_4BIT) {
        bus.sd_app_set_bus_width(SD_BUS_WIDTH_4)?;
        bus.set_bus_width(BusWidth::Width4)?;
    }
    Ok(())
}

fn uhs_init(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    let regs = sd_regs(dev)?;
    let (spec3, mode, card_limit) = (regs.scr.sd_spec3, regs.bus_mode, regs.sw_caps.curr_limit);
    if !spec3 || !dev.csd.has_class(CSD_CCC_SWITCH) {
        return Ok(());
    }

    switch_4bit(bus, dev)?;

    let limit = current_limit(bus.caps(), mode, card_limit);
    let status = bus.sd_switch_func(SD_SWITCH_SET, SD_SWITCH_GROUP_CURRENT_LIMIT, limit)?;
    if switch_status_group4(&status) != limit {
        debug!("bus{}: current limit {} not taken", bus.cfg.index, limit);
    }

    let timing = match mode {
        SdBusMode::Sdr104 => BusTiming::UhsSdr104,
        SdBusMode::Ddr50 => BusTiming::UhsDdr50,
        SdBusMode::Sdr50 => BusTiming::UhsSdr50,
        SdBusMode::Sdr25 => BusTiming::UhsSdr25,
        SdBusMode::Sdr12 => BusTiming::UhsSdr12,
        SdBusMode::Default => return Ok(()),
    };
    let status = bus.sd_switch_func(SD_SWITCH_SET, SD_SWITCH_GROUP_ACCESS_MODE, mode.function())?;
    if switch_status_group1(&status) != mode.function() {
        warn!("bus{}: card kept default speed instead of {:?}", bus.cfg.index, mode);
        return Ok(());
    }
    bus.set_bus_timing(timing)?;
    bus.set_clock(mode.max_dtr())?;
    if let Some(regs) = dev.sd.as_mut() {
        regs.sw_caps.uhs_max_dtr = mode.max_dtr();
    }

    match mode {
        SdBusMode::Ddr50 => bus.tune(SD_SWITCH_FUNC),
        SdBusMode::Sdr104 | SdBusMode::Sdr50 => bus.tune(SD_SEND_TUNING_BLOCK),
        _ => Ok(()),
    }
}

/// CMD6 high-speed switch. `NotSupported` when either side lacks it.
pub(crate) fn switch_high_speed(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    let regs = sd_regs(dev)?;
    if regs.sw_caps.hs_max_dtr == 0
        || regs.scr.sd_spec < SD_SCR_SPEC_1
        || !bus.has_cap(HostCaps::HIGH_SPEED)
        || !dev.csd.has_class(CSD_CCC_SWITCH)
    {
        return Err(SdError::NotSupported);
    }
    let status = bus.sd_switch_func(SD_SWITCH_SET, SD_SWITCH_GROUP_ACCESS_MODE, SD_FUNC_HS)?;
    if switch_status_group1(&status) != SD_FUNC_HS {
        return Err(SdError::NotSupported);
    }
    Ok(())
}

fn hs_init(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    match switch_high_speed(bus, dev) {
        Ok(()) => {
            dev.set_state(DeviceState::HIGH_SPEED);
            bus.set_bus_timing(BusTiming::SdHs)?;
        }
        Err(SdError::NotSupported) => debug!("bus{}: staying at default speed", bus.cfg.index),
        Err(e) => return Err(e),
    }
    let clock = max_clock(bus, dev);
    bus.set_clock(clock)?;
    switch_4bit(bus, dev)
}

pub(crate) fn max_clock(bus: &Bus, dev: &Device) -> u32 {
    let mut clock = u32::MAX;
    if dev.has_state(DeviceState::HIGH_SPEED) {
        if let Some(hs) = dev.sd.as_ref().map(|r| r.sw_caps.hs_max_dtr).filter(|&v| v > 0) {
            clock = hs;
        }
    } else if dev.csd.max_dtr > 0 {
        clock = dev.csd.max_dtr;
    }
    clock.min(bus.cfg.freq_max)
}

fn device_add(dev: &mut Device) {
    dev.set_state(DeviceState::REMOVABLE);
    dev.erase_size = dev.csd.erase_size;
    dev.capacity = dev.csd.sectors();
    debug!(
        "sd capacity {}.{} GiB",
        dev.capacity >> 21,
        (dev.capacity & ((1 << 21) - 1)) >> 11
    );
    dev.set_state(DeviceState::PRESENT);
}
