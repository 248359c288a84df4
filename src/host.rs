//! Bus controller seam: the callbacks a platform driver implements, the
//! controller configuration, and the `Bus` wrapper that tracks I/O settings.

use bitflags::bitflags;
use log::{debug, info};

use crate::cmd::Command;
use crate::constant::*;
use crate::delay_ms;
use crate::device::DeviceKind;
use crate::err::SdError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HostCaps: u32 {
        const HIGH_SPEED = 1 << 0;
        const CAP_4BIT = 1 << 1;
        const CAP_8BIT = 1 << 2;
        const AUTO_STOP = 1 << 3;
        const NONREMOVABLE = 1 << 4;
        const UHS_SDR12 = 1 << 5;
        const UHS_SDR25 = 1 << 6;
        const UHS_SDR50 = 1 << 7;
        const UHS_SDR104 = 1 << 8;
        const UHS_DDR50 = 1 << 9;
        const DDR_1V8 = 1 << 10;
        const DDR_1V2 = 1 << 11;
        const HS200_1V8 = 1 << 12;
        const HS200_1V2 = 1 << 13;
        const HS400_1V8 = 1 << 14;
        const HS400_1V2 = 1 << 15;
        const HS400ES = 1 << 16;
        const XPC = 1 << 17;
        const SD3 = 1 << 18;
        const MAX_CURRENT_200 = 1 << 19;
        const MAX_CURRENT_400 = 1 << 20;
        const MAX_CURRENT_600 = 1 << 21;
        const MAX_CURRENT_800 = 1 << 22;
        const SDIO_IRQ = 1 << 23;

        const UHS = Self::UHS_SDR12.bits() | Self::UHS_SDR25.bits() | Self::UHS_SDR50.bits()
            | Self::UHS_SDR104.bits() | Self::UHS_DDR50.bits();
        const HS200 = Self::HS200_1V8.bits() | Self::HS200_1V2.bits();
        const HS400 = Self::HS400_1V8.bits() | Self::HS400_1V2.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusWidth {
    #[default]
    Width1,
    Width4,
    Width8,
}

impl BusWidth {
    pub fn bits(&self) -> u32 {
        match self {
            BusWidth::Width1 => 1,
            BusWidth::Width4 => 4,
            BusWidth::Width8 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusTiming {
    #[default]
    Legacy,
    MmcHs,
    SdHs,
    UhsSdr12,
    UhsSdr25,
    UhsSdr50,
    UhsSdr104,
    UhsDdr50,
    MmcDdr52,
    MmcHs200,
    MmcHs400,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerMode {
    #[default]
    Off,
    Up,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalVoltage {
    #[default]
    V330,
    V180,
    V120,
}

/// Current bus I/O settings as last applied to the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ios {
    pub clock: u32,
    pub vdd: u32,
    pub power_mode: PowerMode,
    pub bus_width: BusWidth,
    pub timing: BusTiming,
    pub signal_voltage: SignalVoltage,
    pub enhanced_strobe: bool,
}

/// Controller configuration as supplied by the platform.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub index: u32,
    pub dev_type: DeviceKind,
    pub freq_min: u32,
    pub freq_max: u32,
    /// Default OCR voltage window.
    pub voltages: u32,
    pub caps: HostCaps,
    pub max_blk_num: u32,
    pub max_blk_size: u32,
    pub max_req_size: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            index: 0,
            dev_type: DeviceKind::Sd,
            freq_min: 400_000,
            freq_max: SD_FREQ_HS,
            voltages: OCR_2V7_3V6,
            caps: HostCaps::HIGH_SPEED | HostCaps::CAP_4BIT,
            max_blk_num: 2048,
            max_blk_size: 512,
            max_req_size: 512 * 2048,
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), SdError> {
        if self.freq_min > self.freq_max || self.max_blk_num == 0 || self.max_blk_size == 0 {
            return Err(SdError::InvalidParameter);
        }
        if self.dev_type == DeviceKind::Combo {
            return Err(SdError::InvalidParameter);
        }
        Ok(())
    }
}

/// Callbacks implemented by the platform bus-controller driver.
///
/// Only `request` is mandatory. The setters default to accepting the change
/// silently; optional features default to `NotSupported`.
pub trait HostOps: Send {
    /// Execute one command and its data phase. Transport failures may be
    /// returned directly or recorded in `cmd.err` / `data.err`.
    fn request(&mut self, cmd: &mut Command<'_>) -> Result<(), SdError>;

    fn set_clock(&mut self, _hz: u32) -> Result<(), SdError> {
        Ok(())
    }

    fn set_power_mode(&mut self, _mode: PowerMode) -> Result<(), SdError> {
        Ok(())
    }

    fn set_bus_width(&mut self, _width: BusWidth) -> Result<(), SdError> {
        Ok(())
    }

    fn set_bus_timing(&mut self, _timing: BusTiming) -> Result<(), SdError> {
        Ok(())
    }

    fn switch_voltage(&mut self, _voltage: SignalVoltage) -> Result<(), SdError> {
        Err(SdError::NotSupported)
    }

    fn set_enhance_strobe(&mut self, _enable: bool) -> Result<(), SdError> {
        Err(SdError::NotSupported)
    }

    /// Controller-driven tuning. Hosts without a tuning engine leave this
    /// unimplemented and the tuning block is sent once instead.
    fn tune(&mut self, _opcode: u32) -> Result<(), SdError> {
        Err(SdError::NotSupported)
    }

    fn hw_reset(&mut self) {}

    fn dev_read_only(&mut self) -> bool {
        false
    }

    fn dev_plugged(&mut self) -> bool {
        true
    }

    fn enable_sdio_irq(&mut self, _enable: bool) -> Result<(), SdError> {
        Ok(())
    }
}

/// A controller's command path: driver callbacks plus tracked settings.
pub struct Bus {
    pub(crate) ops: Box<dyn HostOps>,
    pub(crate) cfg: HostConfig,
    pub(crate) ios: Ios,
    /// Relative address of the card being talked to, 0 before assignment.
    pub(crate) rca: u32,
}

impl Bus {
    pub fn new(cfg: HostConfig, ops: Box<dyn HostOps>) -> Self {
        Self {
            ops,
            cfg,
            ios: Ios::default(),
            rca: 0,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.cfg
    }

    pub fn ios(&self) -> &Ios {
        &self.ios
    }

    pub fn caps(&self) -> HostCaps {
        self.cfg.caps
    }

    pub fn has_cap(&self, cap: HostCaps) -> bool {
        self.cfg.caps.intersects(cap)
    }

    pub fn supports_uhs(&self) -> bool {
        self.has_cap(HostCaps::UHS)
    }

    pub fn set_clock(&mut self, hz: u32) -> Result<(), SdError> {
        let hz = hz.min(self.cfg.freq_max);
        debug!("bus{}: clock {} Hz", self.cfg.index, hz);
        self.ops.set_clock(hz)?;
        self.ios.clock = hz;
        Ok(())
    }

    pub fn set_bus_width(&mut self, width: BusWidth) -> Result<(), SdError> {
        debug!("bus{}: width {}", self.cfg.index, width.bits());
        self.ops.set_bus_width(width)?;
        self.ios.bus_width = width;
        Ok(())
    }

    pub fn set_bus_timing(&mut self, timing: BusTiming) -> Result<(), SdError> {
        debug!("bus{}: timing {:?}", self.cfg.index, timing);
        self.ops.set_bus_timing(timing)?;
        self.ios.timing = timing;
        Ok(())
    }

    pub fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), SdError> {
        self.ops.set_power_mode(mode)?;
        self.ios.power_mode = mode;
        Ok(())
    }

    pub fn switch_voltage(&mut self, voltage: SignalVoltage) -> Result<(), SdError> {
        debug!("bus{}: signal voltage {:?}", self.cfg.index, voltage);
        self.ops.switch_voltage(voltage)?;
        self.ios.signal_voltage = voltage;
        Ok(())
    }

    pub fn set_enhance_strobe(&mut self, enable: bool) -> Result<(), SdError> {
        self.ops.set_enhance_strobe(enable)?;
        self.ios.enhanced_strobe = enable;
        Ok(())
    }

    pub fn dev_read_only(&mut self) -> bool {
        self.ops.dev_read_only()
    }

    pub fn dev_plugged(&mut self) -> bool {
        self.ops.dev_plugged()
    }

    pub fn enable_sdio_irq(&mut self, enable: bool) -> Result<(), SdError> {
        self.ops.enable_sdio_irq(enable)
    }

    pub fn hw_reset(&mut self) {
        self.ops.hw_reset();
    }

    /// Power the slot and drop to identification settings.
    pub fn power_up(&mut self) -> Result<(), SdError> {
        self.ios.vdd = 31u32.saturating_sub(self.cfg.voltages.leading_zeros());
        self.set_power_mode(PowerMode::Up)?;
        self.set_bus_width(BusWidth::Width1)?;
        self.set_bus_timing(BusTiming::Legacy)?;
        if let Err(e) = self.switch_voltage(SignalVoltage::V330) {
            debug!("bus{}: keep default signal voltage: {}", self.cfg.index, e);
        }
        self.set_clock(self.cfg.freq_min)?;
        self.set_power_mode(PowerMode::On)?;
        delay_ms(1);
        info!("bus{}: powered up at {} Hz", self.cfg.index, self.ios.clock);
        Ok(())
    }

    pub fn power_off(&mut self) -> Result<(), SdError> {
        self.ops.set_clock(0)?;
        self.ios.clock = 0;
        self.set_power_mode(PowerMode::Off)?;
        self.set_bus_width(BusWidth::Width1)?;
        self.set_bus_timing(BusTiming::Legacy)?;
        info!("bus{}: powered off", self.cfg.index);
        Ok(())
    }

    /// Intersect a device OCR with the host window and keep the lowest
    /// common voltage pair. Returns 0 when nothing overlaps.
    pub fn select_work_voltage(&mut self, ocr: u32) -> u32 {
        let mut ocr = ocr;
        if ocr & OCR_RESERVED_LOW != 0 {
            debug!("bus{}: device claims voltages below the defined range", self.cfg.index);
            ocr &= !OCR_RESERVED_LOW;
        }
        ocr &= self.cfg.voltages;
        if ocr == 0 {
            return 0;
        }
        let bit = ocr.trailing_zeros();
        ocr &= 3 << bit;
        self.ios.vdd = bit;
        debug!("bus{}: work voltage ocr {:#x} vdd bit {}", self.cfg.index, ocr, bit);
        ocr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl HostOps for Nop {
        fn request(&mut self, _cmd: &mut Command<'_>) -> Result<(), SdError> {
            Ok(())
        }
    }

    #[test]
    fn work_voltage_lowest_pair() {
        let cfg = HostConfig {
            voltages: OCR_2V7_3V6 | OCR_1V65_1V95,
            ..Default::default()
        };
        let mut bus = Bus::new(cfg, Box::new(Nop));
        assert_eq!(bus.select_work_voltage(0x00FF_8080), OCR_1V65_1V95);
        assert_eq!(bus.select_work_voltage(0x00FF_8000), 0x0001_8000);
        assert_eq!(bus.ios().vdd, 15);
        assert_eq!(bus.select_work_voltage(0x7F), 0);
    }

    #[test]
    fn clock_is_capped() {
        let mut bus = Bus::new(HostConfig::default(), Box::new(Nop));
        bus.set_clock(200_000_000).unwrap();
        assert_eq!(bus.ios().clock, SD_FREQ_HS);
    }

    #[test]
    fn config_validation() {
        assert!(HostConfig::default().validate().is_ok());
        let bad = HostConfig {
            max_blk_num: 0,
            ..Default::default()
        };
        assert_eq!(bad.validate(), Err(SdError::InvalidParameter));
        let combo = HostConfig {
            dev_type: DeviceKind::Combo,
            ..Default::default()
        };
        assert_eq!(combo.validate(), Err(SdError::InvalidParameter));
    }
}
