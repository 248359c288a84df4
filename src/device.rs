// ===== Device Model =====

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::constant::*;
use crate::registry::scr::SdBusMode;
use crate::registry::{Cccr, Cid, CommonCis, Csd, ExtCsd, Raw128, Scr, Ssr, SwitchCaps, cid::cid_bytes};
use crate::sdio::SdioIrqHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    Emmc,
    #[default]
    Sd,
    Sdio,
    /// SDIO functions plus SD memory on one card.
    Combo,
}

impl DeviceKind {
    pub fn has_memory(&self) -> bool {
        !matches!(self, DeviceKind::Sdio)
    }

    pub fn has_io(&self) -> bool {
        matches!(self, DeviceKind::Sdio | DeviceKind::Combo)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceState: u32 {
        const PRESENT = 1 << 0;
        const REMOVABLE = 1 << 1;
        const READONLY = 1 << 2;
        const HIGH_SPEED = 1 << 3;
        const UHS = 1 << 4;
        const HS200 = 1 << 5;
        const HS400 = 1 << 6;
        const HS400ES = 1 << 7;
        const DDR = 1 << 8;
        const BLOCK_ADDR = 1 << 9;
        const SDXC = 1 << 10;
    }
}

/// SD-memory registers.
#[derive(Debug, Clone, Default)]
pub struct SdRegs {
    pub scr: Scr,
    pub ssr: Ssr,
    pub sw_caps: SwitchCaps,
    pub bus_mode: SdBusMode,
}

/// SDIO common registers and the enumerated functions.
#[derive(Default)]
pub struct SdioRegs {
    pub cccr: Cccr,
    pub cis: CommonCis,
    pub functions: Vec<Arc<SdioFunction>>,
}

pub struct SdioFunction {
    pub num: u32,
    pub class: u8,
    pub vendor: u16,
    pub device: u16,
    pub max_blk_size: u32,
    cur_blk_size: AtomicU32,
    enable_timeout_ms: AtomicU32,
    pub(crate) irq_handler: spin::Mutex<Option<Arc<dyn SdioIrqHandler>>>,
}

impl SdioFunction {
    pub fn new(num: u32, class: u8, vendor: u16, device: u16, max_blk_size: u32, enable_timeout_ms: u32) -> Self {
        Self {
            num,
            class,
            vendor,
            device,
            max_blk_size,
            cur_blk_size: AtomicU32::new(0),
            enable_timeout_ms: AtomicU32::new(enable_timeout_ms),
            irq_handler: spin::Mutex::new(None),
        }
    }

    pub fn cur_blk_size(&self) -> u32 {
        self.cur_blk_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_cur_blk_size(&self, size: u32) {
        self.cur_blk_size.store(size, Ordering::Release);
    }

    pub fn enable_timeout_ms(&self) -> u32 {
        self.enable_timeout_ms.load(Ordering::Acquire)
    }

    pub(crate) fn set_enable_timeout_ms(&self, ms: u32) {
        self.enable_timeout_ms.store(ms, Ordering::Release);
    }

    pub fn has_irq_handler(&self) -> bool {
        self.irq_handler.lock().is_some()
    }
}

impl core::fmt::Debug for SdioFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdioFunction")
            .field("num", &self.num)
            .field("class", &self.class)
            .field("vendor", &format_args!("{:#06x}", self.vendor))
            .field("device", &format_args!("{:#06x}", self.device))
            .field("max_blk_size", &self.max_blk_size)
            .field("cur_blk_size", &self.cur_blk_size())
            .finish()
    }
}

/// An enumerated card. Built by a protocol detect pass, then shared.
pub struct Device {
    pub kind: DeviceKind,
    pub rca: u32,
    /// Work voltage window.
    pub ocr: u32,
    pub raw_cid: Raw128,
    pub raw_csd: Raw128,
    pub cid: Cid,
    pub csd: Csd,
    pub ext_csd: Option<ExtCsd>,
    pub sd: Option<SdRegs>,
    pub sdio: Option<SdioRegs>,
    /// In 512-byte sectors.
    pub capacity: u64,
    /// Erase unit in sectors.
    pub erase_size: u32,
    state: AtomicU32,
}

impl Device {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            rca: 0,
            ocr: 0,
            raw_cid: [0; 4],
            raw_csd: [0; 4],
            cid: Cid::default(),
            csd: Csd::default(),
            ext_csd: None,
            sd: None,
            sdio: None,
            capacity: 0,
            erase_size: 0,
            state: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, flags: DeviceState) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_state(&self, flags: DeviceState) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn has_state(&self, flags: DeviceState) -> bool {
        self.state().contains(flags)
    }

    pub fn is_present(&self) -> bool {
        self.has_state(DeviceState::PRESENT)
    }

    pub fn block_addr(&self) -> bool {
        self.has_state(DeviceState::BLOCK_ADDR)
    }

    pub fn cid_bytes(&self) -> [u8; 16] {
        cid_bytes(&self.raw_cid)
    }

    pub fn sd_regs(&self) -> Option<&SdRegs> {
        self.sd.as_ref()
    }

    pub fn function(&self, num: u32) -> Option<Arc<SdioFunction>> {
        self.sdio
            .as_ref()?
            .functions
            .iter()
            .find(|f| f.num == num)
            .cloned()
    }

    pub fn functions(&self) -> &[Arc<SdioFunction>] {
        self.sdio.as_ref().map(|s| s.functions.as_slice()).unwrap_or(&[])
    }

    /// Whether block I/O may be issued to this device.
    pub fn block_ready(&self) -> bool {
        self.kind.has_memory() && self.capacity > 0 && self.erase_size > 0 && self.is_present()
    }

    pub fn sector_count(&self) -> u64 {
        self.capacity
    }

    /// Bus argument for a sector address.
    pub fn data_addr(&self, sector: u32) -> u32 {
        if self.block_addr() {
            sector
        } else {
            sector << MMC_SECTOR_SHIFT
        }
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind)
            .field("rca", &format_args!("{:#x}", self.rca))
            .field("ocr", &format_args!("{:#x}", self.ocr))
            .field("cid", &self.cid)
            .field("capacity", &self.capacity)
            .field("erase_size", &self.erase_size)
            .field("state", &self.state())
            .finish()
    }
}
