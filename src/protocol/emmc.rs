use log::{debug, info, warn};

use super::CardProtocol;
use crate::constant::*;
use crate::device::{Device, DeviceKind, DeviceState};
use crate::err::SdError;
use crate::host::{Bus, BusTiming, BusWidth, HostCaps, SignalVoltage};
use crate::registry::{Cid, Csd, ExtCsd};

pub struct EmmcProtocol;

impl CardProtocol for EmmcProtocol {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Emmc
    }

    fn detect(&self, bus: &mut Bus) -> Result<Device, SdError> {
        let mut dev = Device::new(DeviceKind::Emmc);
        bus.mmc_go_idle()?;
        emmc_init(bus, &mut dev)?;
        Ok(dev)
    }

    fn erase_cmds(&self) -> Option<(u32, u32)> {
        Some((MMC_ERASE_GROUP_START, MMC_ERASE_GROUP_END))
    }
}

/// Treat a refused or unsupported mode switch as "feature unavailable".
fn tolerate(res: Result<(), SdError>, what: &str) -> Result<bool, SdError> {
    match res {
        Ok(()) => Ok(true),
        Err(e @ (SdError::SwitchFailure | SdError::NotSupported)) => {
            warn!("emmc: {} unavailable: {}", what, e);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn emmc_init(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    let ocr = bus.mmc_send_op_cond(0)?;
    let ocr = bus.select_work_voltage(ocr);
    if ocr == 0 {
        warn!("bus{}: no usable voltage in ocr", bus.cfg.index);
        return Err(SdError::InvalidParameter);
    }
    if ocr & OCR_1V65_1V95 != 0 {
        if let Err(e) = bus.switch_voltage(SignalVoltage::V180) {
            warn!("bus{}: 1.8V switch failed: {}", bus.cfg.index, e);
        }
    }
    dev.ocr = ocr;

    emmc_select(bus, dev)?;
    switch_operation_mode(bus, dev)?;
    device_add(bus, dev);
    Ok(())
}

fn emmc_select(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    bus.mmc_go_idle()?;
    let rocr = bus.mmc_send_op_cond(dev.ocr | OCR_HCS)?;
    if rocr & OCR_HCS != 0 {
        dev.set_state(DeviceState::BLOCK_ADDR);
    }

    dev.raw_cid = bus.mmc_all_send_cid()?;
    bus.mmc_set_relative_addr(1)?;
    dev.rca = 1;

    dev.raw_csd = bus.mmc_send_csd()?;
    dev.csd = Csd::decode_mmc(&dev.raw_csd)?;
    dev.cid = Cid::decode_mmc(&dev.raw_cid, dev.csd.spec_vers);
    if dev.cid.removable {
        dev.set_state(DeviceState::REMOVABLE);
    }
    info!(
        "emmc: {} mid {:#x} psn {:#x} spec {}",
        dev.cid.pnm, dev.cid.mid, dev.cid.psn, dev.csd.spec_vers
    );

    bus.mmc_select_card()?;

    if dev.csd.spec_vers >= 4 {
        let raw = bus.mmc_send_ext_csd()?;
        let ext = ExtCsd::decode(&raw, dev.csd.structure, dev.block_addr())?;
        if ext.block_addr {
            dev.set_state(DeviceState::BLOCK_ADDR);
        }
        dev.ext_csd = Some(ext);
    }
    Ok(())
}

/// Re-read EXT_CSD and make sure the card still answers with the same
/// identity after a bus width change.
fn compare_ext_csd(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    let Some(ext) = dev.ext_csd.as_ref() else {
        return Ok(());
    };
    let raw = bus.mmc_send_ext_csd()?;
    if !ext.same_identity(&raw) {
        debug!("emmc: ext_csd mismatch at width {}", bus.ios.bus_width.bits());
        return Err(SdError::IoError);
    }
    Ok(())
}

fn check_switch_status(bus: &mut Bus) -> Result<(), SdError> {
    let status = bus.mmc_send_status()?;
    if status & R1_SWITCH_ERROR != 0 {
        return Err(SdError::SwitchFailure);
    }
    Ok(())
}

fn switch_operation_mode(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    let Some((enh_area, part_config, hpi)) = dev
        .ext_csd
        .as_ref()
        .map(|e| (e.enh_area_enable, e.part_config, e.hpi))
    else {
        return bus.set_clock(dev.csd.max_dtr);
    };

    if enh_area && tolerate(bus.mmc_switch(EXT_CSD_ERASE_GROUP_DEF, 1), "erase group def")? {
        if let Some(ext) = dev.ext_csd.as_mut() {
            ext.erase_group_def = 1;
        }
    }

    if part_config & EXT_CSD_PART_CONFIG_ACCESS_MASK != 0 {
        let value = part_config & !EXT_CSD_PART_CONFIG_ACCESS_MASK;
        if tolerate(bus.mmc_switch(EXT_CSD_PART_CONFIG, value), "partition config")? {
            if let Some(ext) = dev.ext_csd.as_mut() {
                ext.part_config = value;
            }
        }
    }

    bus_speed_mode(bus, dev)?;
    ddr_mode(bus, dev)?;

    if hpi {
        tolerate(bus.mmc_switch(EXT_CSD_HPI_MGMT, 1), "hpi enable")?;
    }
    Ok(())
}

// ===== Bus speed =====

fn bus_speed_mode(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    let Some((strobe, hs_max_dtr, raw_card_type)) = dev
        .ext_csd
        .as_ref()
        .map(|e| (e.strobe_support, e.hs_max_dtr, e.raw_card_type as u32))
    else {
        return bus.set_clock(dev.csd.max_dtr);
    };

    if strobe && bus.has_cap(HostCaps::HS400ES) && bus.has_cap(HostCaps::CAP_8BIT) {
        if tolerate(select_hs400es(bus, dev), "hs400es")? {
            dev.set_state(DeviceState::HS400ES);
            info!("bus{}: hs400 enhanced strobe", bus.cfg.index);
            return power_class(bus, dev);
        }
    }

    if hs_max_dtr > MMC_FREQ_52M && bus.has_cap(HostCaps::HS200) {
        if tolerate(enable_hs200(bus, dev, hs_max_dtr), "hs200")? {
            dev.set_state(DeviceState::HS200);
        } else {
            bus.set_bus_timing(BusTiming::Legacy)?;
            bus.set_clock(dev.csd.max_dtr)?;
        }
    }

    if hs_max_dtr > 0 && !dev.has_state(DeviceState::HS200) && bus.has_cap(HostCaps::HIGH_SPEED) {
        let res = bus
            .mmc_switch(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS)
            .and_then(|_| bus.set_bus_timing(BusTiming::MmcHs));
        if tolerate(res, "high speed")? {
            dev.set_state(DeviceState::HIGH_SPEED);
        }
    }

    if dev.has_state(DeviceState::HS200) {
        if raw_card_type & EXT_CSD_CARD_TYPE_HS400 != 0
            && bus.has_cap(HostCaps::HS400)
            && bus.ios.bus_width == BusWidth::Width8
        {
            select_hs400(bus)?;
            dev.set_state(DeviceState::HS400);
            dev.clear_state(DeviceState::HS200);
        }
        return power_class(bus, dev);
    }

    let clock = if dev.has_state(DeviceState::HIGH_SPEED) {
        hs_max_dtr.min(MMC_FREQ_52M)
    } else {
        dev.csd.max_dtr
    };
    bus.set_clock(clock)
}

/// HS200 timing plus tuning at the HS200 clock. A failed tuning counts as a
/// refused switch so the caller can drop to the next mode.
fn enable_hs200(bus: &mut Bus, dev: &Device, hs_max_dtr: u32) -> Result<(), SdError> {
    select_hs200(bus, dev)?;
    bus.set_clock(hs_max_dtr)?;
    let index = bus.cfg.index;
    bus.tune(MMC_SEND_TUNING_BLOCK_HS200).map_err(|e| {
        warn!("bus{}: hs200 tuning failed: {}", index, e);
        SdError::SwitchFailure
    })
}

/// Pick the lowest I/O voltage both sides support for HS200-class signalling.
fn switch_signal_voltage(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    let card_type = dev.ext_csd.as_ref().map(|e| e.card_type).unwrap_or(0);
    if bus.has_cap(HostCaps::HS200_1V2) && card_type & EXT_CSD_CARD_TYPE_SDR_1_2V != 0 {
        match bus.switch_voltage(SignalVoltage::V120) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("bus{}: 1.2V switch failed: {}", bus.cfg.index, e),
        }
    }
    if bus.has_cap(HostCaps::HS200_1V8) && card_type & EXT_CSD_CARD_TYPE_SDR_1_8V != 0 {
        return bus.switch_voltage(SignalVoltage::V180);
    }
    Ok(())
}

fn select_hs_bus_width(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    const WIDTHS: [(BusWidth, u8, HostCaps); 2] = [
        (BusWidth::Width8, EXT_CSD_BUS_WIDTH_8, HostCaps::CAP_8BIT),
        (BusWidth::Width4, EXT_CSD_BUS_WIDTH_4, HostCaps::CAP_4BIT),
    ];
    let mut last = SdError::NotSupported;
    for (width, value, cap) in WIDTHS {
        if !bus.has_cap(cap) {
            continue;
        }
        let res = bus
            .mmc_switch(EXT_CSD_BUS_WIDTH, value)
            .and_then(|_| bus.set_bus_width(width))
            .and_then(|_| compare_ext_csd(bus, dev));
        match res {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("bus{}: width {} failed: {}", bus.cfg.index, width.bits(), e);
                last = e;
            }
        }
    }
    bus.set_bus_width(BusWidth::Width1)?;
    Err(last)
}

fn switch_to_hs(bus: &mut Bus) -> Result<(), SdError> {
    bus.mmc_switch(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS)?;
    bus.set_bus_timing(BusTiming::MmcHs)?;
    bus.set_clock(MMC_FREQ_52M)?;
    check_switch_status(bus)
}

fn select_hs200(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    switch_signal_voltage(bus, dev)?;
    select_hs_bus_width(bus, dev)?;
    bus.mmc_switch(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS200)?;
    bus.set_bus_timing(BusTiming::MmcHs200)?;
    check_switch_status(bus)
}

fn select_hs400(bus: &mut Bus) -> Result<(), SdError> {
    switch_to_hs(bus)?;
    bus.mmc_switch(EXT_CSD_BUS_WIDTH, EXT_CSD_DDR_BUS_WIDTH_8)?;
    bus.mmc_switch(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS400)?;
    bus.set_clock(MMC_FREQ_200M)?;
    bus.set_bus_timing(BusTiming::MmcHs400)?;
    check_switch_status(bus)
}

fn select_hs400es(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    switch_signal_voltage(bus, dev)?;
    select_hs_bus_width(bus, dev)?;
    if bus.ios.bus_width != BusWidth::Width8 {
        return Err(SdError::NotSupported);
    }
    switch_to_hs(bus)?;
    bus.mmc_switch(EXT_CSD_BUS_WIDTH, EXT_CSD_DDR_BUS_WIDTH_8 | EXT_CSD_BUS_WIDTH_STROBE)?;
    bus.mmc_switch(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS400)?;
    bus.set_clock(MMC_FREQ_200M)?;
    bus.set_bus_timing(BusTiming::MmcHs400)?;
    bus.set_enhance_strobe(true)?;
    check_switch_status(bus)
}

/// Select POWER_CLASS for the current voltage, clock and width.
fn power_class(bus: &mut Bus, dev: &Device) -> Result<(), SdError> {
    let Some(ext) = dev.ext_csd.as_ref() else {
        return Ok(());
    };
    if dev.csd.spec_vers < 4 {
        return Ok(());
    }
    let vdd = 1u32 << bus.ios.vdd;
    let clock = bus.ios.clock;
    let ddr = dev.has_state(DeviceState::DDR);
    let t = &ext.power_class;

    let raw = if vdd == OCR_1V65_1V95 {
        match clock {
            _ if ddr => t.ddr_f52_v195,
            c if c <= MMC_FREQ_26M => t.f26_v195,
            c if c <= MMC_FREQ_52M => t.f52_v195,
            _ => t.f200_v195,
        }
    } else if vdd & OCR_2V7_3V6 != 0 {
        match clock {
            _ if ddr => t.ddr_f52_v360,
            c if c <= MMC_FREQ_26M => t.f26_v360,
            c if c <= MMC_FREQ_52M => t.f52_v360,
            _ => t.f200_v360,
        }
    } else {
        return Ok(());
    };

    let class = if bus.ios.bus_width == BusWidth::Width8 {
        (raw & EXT_CSD_PWR_CL_8BIT_MASK) >> EXT_CSD_PWR_CL_8BIT_SHIFT
    } else {
        raw & EXT_CSD_PWR_CL_4BIT_MASK
    };
    if class > 0 {
        debug!("bus{}: power class {}", bus.cfg.index, class);
        bus.mmc_switch(EXT_CSD_POWER_CLASS, class)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DdrVoltage {
    V18,
    V12,
}

/// Find the widest working bus and enable DDR52 when both sides allow it.
fn ddr_mode(bus: &mut Bus, dev: &mut Device) -> Result<(), SdError> {
    if dev
        .state()
        .intersects(DeviceState::HS400ES | DeviceState::HS400 | DeviceState::HS200)
    {
        return Ok(());
    }
    let Some(card_type) = dev.ext_csd.as_ref().map(|e| e.raw_card_type as u32) else {
        return Ok(());
    };
    if dev.csd.spec_vers < 4 || !bus.has_cap(HostCaps::CAP_4BIT | HostCaps::CAP_8BIT) {
        return Ok(());
    }

    let mut ddr = None;
    if dev.has_state(DeviceState::HIGH_SPEED) {
        if card_type & EXT_CSD_CARD_TYPE_DDR_1_8V != 0
            && bus.has_cap(HostCaps::DDR_1V8)
            && bus.has_cap(HostCaps::UHS_DDR50)
        {
            ddr = Some(DdrVoltage::V18);
        } else if card_type & EXT_CSD_CARD_TYPE_DDR_1_2V != 0 && bus.has_cap(HostCaps::DDR_1V2) {
            ddr = Some(DdrVoltage::V12);
        }
    }

    const WIDTHS: [(BusWidth, u8, u8, HostCaps); 2] = [
        (BusWidth::Width8, EXT_CSD_BUS_WIDTH_8, EXT_CSD_DDR_BUS_WIDTH_8, HostCaps::CAP_8BIT),
        (BusWidth::Width4, EXT_CSD_BUS_WIDTH_4, EXT_CSD_DDR_BUS_WIDTH_4, HostCaps::CAP_4BIT),
    ];
    let mut chosen = None;
    for (width, sdr_value, ddr_value, cap) in WIDTHS {
        if !bus.has_cap(cap) {
            continue;
        }
        let res = bus
            .mmc_switch(EXT_CSD_BUS_WIDTH, sdr_value)
            .and_then(|_| bus.set_bus_width(width))
            .and_then(|_| compare_ext_csd(bus, dev));
        match res {
            Ok(()) => {
                chosen = Some((width, ddr_value));
                break;
            }
            Err(e) => debug!("bus{}: width {} failed: {}", bus.cfg.index, width.bits(), e),
        }
    }

    let Some((width, ddr_value)) = chosen else {
        warn!("bus{}: falling back to 1-bit bus", bus.cfg.index);
        bus.mmc_switch(EXT_CSD_BUS_WIDTH, EXT_CSD_BUS_WIDTH_1)?;
        return bus.set_bus_width(BusWidth::Width1);
    };

    if let Some(voltage) = ddr {
        bus.mmc_switch(EXT_CSD_BUS_WIDTH, ddr_value)?;
        if voltage == DdrVoltage::V12 {
            bus.switch_voltage(SignalVoltage::V120)?;
        }
        dev.set_state(DeviceState::DDR);
        bus.set_bus_timing(BusTiming::MmcDdr52)?;
        bus.set_bus_width(width)?;
        info!("bus{}: ddr52 at width {}", bus.cfg.index, width.bits());
    }
    Ok(())
}

fn device_add(bus: &mut Bus, dev: &mut Device) {
    let (erase_size, capacity) = match dev.ext_csd.as_ref() {
        Some(ext) => {
            let erase = if ext.erase_group_def == 1 && ext.hc_erase_size > 0 {
                ext.hc_erase_size
            } else {
                dev.csd.erase_size
            };
            let capacity = if dev.block_addr() && ext.sectors > 0 {
                ext.sectors as u64
            } else {
                dev.csd.sectors()
            };
            (erase, capacity)
        }
        None => (dev.csd.erase_size, dev.csd.sectors()),
    };
    dev.erase_size = erase_size;
    dev.capacity = capacity;
    if bus.dev_read_only() {
        dev.set_state(DeviceState::READONLY);
    }
    dev.set_state(DeviceState::PRESENT);
}
