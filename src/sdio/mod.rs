//! Function-level access to an enumerated SDIO card.
//!
//! A function driver opens an [`SdioFunc`] by bus and function number, then
//! brackets every register transaction with [`SdioFunc::claim_host`]. The
//! returned [`SdioHost`] holds the controller lock until it is dropped.

mod irq;

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::MutexGuard;

pub use irq::{IrqEvent, IrqNotifier, SdioIrqHandler};
pub(crate) use irq::{IrqThread, dispatch};

use crate::cmd::DataBuffer;
use crate::constant::*;
use crate::controller::Controller;
use crate::delay_ms;
use crate::device::{Device, SdioFunction};
use crate::err::SdError;
use crate::host::Bus;

/// Vendor-specific window of the CCCR that function drivers may write.
const SDIO_CCCR_VENDOR_START: u32 = 0xF0;
const SDIO_CCCR_VENDOR_END: u32 = 0xFF;

fn sub_buf<'b>(buf: &'b mut DataBuffer<'_>, off: usize, len: usize) -> Result<DataBuffer<'b>, SdError> {
    match buf {
        DataBuffer::Read(b) => Ok(DataBuffer::Read(&mut b[off..off + len])),
        DataBuffer::Write(b) => Ok(DataBuffer::Write(&b[off..off + len])),
        _ => Err(SdError::InvalidParameter),
    }
}

impl Bus {
    /// Largest byte-mode run for `func`.
    pub(crate) fn sdio_max_byte_run(&self, func: &SdioFunction) -> u32 {
        self.cfg
            .max_blk_size
            .min(func.max_blk_size)
            .min(SDIO_MAX_BLOCK_SIZE)
    }

    /// CMD53 transfer of any length. Whole blocks go out in block mode when
    /// the card supports it; the remainder is split into byte runs.
    pub(crate) fn sdio_transfer(
        &mut self,
        func: &SdioFunction,
        multi_block: bool,
        mut addr: u32,
        incr: bool,
        mut buf: DataBuffer<'_>,
    ) -> Result<(), SdError> {
        let max_run = self.sdio_max_byte_run(func);
        if max_run == 0 || buf.is_empty() {
            return Err(SdError::InvalidParameter);
        }
        let blksz = match func.cur_blk_size() {
            0 => max_run,
            n => n,
        };
        let mut rem = buf.len();
        let mut off = 0usize;

        if multi_block && rem > blksz as usize {
            let max_blocks = self
                .cfg
                .max_blk_num
                .min(self.cfg.max_req_size / blksz)
                .min(SDIO_MAX_BLOCK_COUNT)
                .max(1);
            while rem >= blksz as usize {
                let blocks = (rem as u32 / blksz).min(max_blocks);
                let size = (blocks * blksz) as usize;
                self.io_rw_extended(func.num, addr, incr, sub_buf(&mut buf, off, size)?, blocks, blksz)?;
                rem -= size;
                off += size;
                if incr {
                    addr += size as u32;
                }
            }
        }

        while rem > 0 {
            let size = rem.min(max_run as usize);
            self.io_rw_extended(func.num, addr, incr, sub_buf(&mut buf, off, size)?, 0, size as u32)?;
            rem -= size;
            off += size;
            if incr {
                addr += size as u32;
            }
        }
        Ok(())
    }

    /// One CMD53 over a scatter list at a fixed address.
    pub(crate) fn sdio_transfer_sg(
        &mut self,
        func: &SdioFunction,
        multi_block: bool,
        addr: u32,
        buf: DataBuffer<'_>,
    ) -> Result<(), SdError> {
        let len = buf.len() as u32;
        let max_run = self.sdio_max_byte_run(func);
        let blksz = match func.cur_blk_size() {
            0 => max_run,
            n => n,
        };
        if max_run == 0 || len == 0 {
            return Err(SdError::InvalidParameter);
        }
        if len <= max_run {
            return self.io_rw_extended(func.num, addr, false, buf, 0, len);
        }
        if !multi_block || len % blksz != 0 {
            return Err(SdError::InvalidParameter);
        }
        let blocks = len / blksz;
        if blocks > self.cfg.max_blk_num || len > self.cfg.max_req_size {
            return Err(SdError::InvalidParameter);
        }
        self.io_rw_extended(func.num, addr, false, buf, blocks, blksz)
    }
}

/// Snapshot of the limits that apply to one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdioCommonInfo {
    pub func_num: u32,
    pub max_blk_num: u32,
    pub max_blk_size: u32,
    pub max_req_size: u32,
    pub cur_blk_size: u32,
    /// Settable.
    pub enable_timeout_ms: u32,
    pub irq_claimed: bool,
}

/// Open handle on one SDIO function.
#[derive(Clone)]
pub struct SdioFunc {
    ctrl: Arc<Controller>,
    dev: Arc<Device>,
    func: Arc<SdioFunction>,
}

impl SdioFunc {
    pub fn open(bus_num: u32, func_num: u32) -> Result<Self, SdError> {
        if func_num == 0 || func_num > SDIO_MAX_FUNCTIONS {
            return Err(SdError::InvalidParameter);
        }
        let ctrl = Controller::open(bus_num)?;
        let dev = ctrl.device().ok_or(SdError::NoDevice)?;
        if !dev.kind.has_io() || !dev.is_present() {
            return Err(SdError::NoDevice);
        }
        let func = dev.function(func_num).ok_or(SdError::InvalidParameter)?;
        Ok(Self { ctrl, dev, func })
    }

    pub fn info(&self) -> &SdioFunction {
        &self.func
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    /// Take the controller lock for a run of register accesses.
    pub fn claim_host(&self) -> Result<SdioHost<'_>, SdError> {
        if !self.dev.is_present() {
            return Err(SdError::NoDevice);
        }
        Ok(SdioHost::new(&self.ctrl, self.dev.clone(), self.func.clone()))
    }
}

/// Claimed controller, bound to one function. Dropping it releases the host.
pub struct SdioHost<'a> {
    pub(crate) bus: MutexGuard<'a, Bus>,
    ctrl: &'a Arc<Controller>,
    dev: Arc<Device>,
    pub(crate) func: Arc<SdioFunction>,
}

impl<'a> SdioHost<'a> {
    pub(crate) fn new(ctrl: &'a Arc<Controller>, dev: Arc<Device>, func: Arc<SdioFunction>) -> Self {
        Self {
            bus: ctrl.lock_bus(),
            ctrl,
            dev,
            func,
        }
    }

    pub fn func_num(&self) -> u32 {
        self.func.num
    }

    pub fn release(self) {}

    fn multi_block(&self) -> bool {
        self.dev.sdio.as_ref().is_some_and(|r| r.cccr.multi_block)
    }

    fn check(&self) -> Result<(), SdError> {
        if self.dev.is_present() {
            Ok(())
        } else {
            Err(SdError::NoDevice)
        }
    }

    // ===== Direct access =====

    pub fn read_byte(&mut self, addr: u32) -> Result<u8, SdError> {
        self.check()?;
        self.bus.sdio_read_byte(self.func.num, addr)
    }

    pub fn write_byte(&mut self, addr: u32, val: u8) -> Result<(), SdError> {
        self.check()?;
        self.bus.sdio_write_byte(self.func.num, addr, val)
    }

    /// Read a function-0 register.
    pub fn read_func0(&mut self, addr: u32) -> Result<u8, SdError> {
        self.check()?;
        self.bus.sdio_read_byte(0, addr)
    }

    /// Write a vendor-specific function-0 register (0xF0..=0xFF).
    pub fn write_func0(&mut self, addr: u32, val: u8) -> Result<(), SdError> {
        self.check()?;
        if !(SDIO_CCCR_VENDOR_START..=SDIO_CCCR_VENDOR_END).contains(&addr) {
            return Err(SdError::InvalidParameter);
        }
        self.bus.sdio_write_byte(0, addr, val)
    }

    // ===== Extended access =====

    /// Read from incrementing addresses.
    pub fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), SdError> {
        self.check()?;
        let mb = self.multi_block();
        self.bus.sdio_transfer(&self.func, mb, addr, true, DataBuffer::Read(buf))
    }

    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), SdError> {
        self.check()?;
        let mb = self.multi_block();
        self.bus.sdio_transfer(&self.func, mb, addr, true, DataBuffer::Write(data))
    }

    /// Read repeatedly from one address, e.g. a FIFO port.
    pub fn read_fixed(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), SdError> {
        self.check()?;
        let mb = self.multi_block();
        self.bus.sdio_transfer(&self.func, mb, addr, false, DataBuffer::Read(buf))
    }

    pub fn write_fixed(&mut self, addr: u32, data: &[u8]) -> Result<(), SdError> {
        self.check()?;
        let mb = self.multi_block();
        self.bus.sdio_transfer(&self.func, mb, addr, false, DataBuffer::Write(data))
    }

    pub fn read_scatter(&mut self, addr: u32, bufs: Vec<&mut [u8]>) -> Result<(), SdError> {
        self.check()?;
        let mb = self.multi_block();
        self.bus.sdio_transfer_sg(&self.func, mb, addr, DataBuffer::ReadScatter(bufs))
    }

    pub fn write_scatter(&mut self, addr: u32, bufs: Vec<&[u8]>) -> Result<(), SdError> {
        self.check()?;
        let mb = self.multi_block();
        self.bus.sdio_transfer_sg(&self.func, mb, addr, DataBuffer::WriteScatter(bufs))
    }

    // ===== Function control =====

    /// Program the function block size. 0 picks the largest the function
    /// and controller both allow.
    pub fn set_block_size(&mut self, size: u32) -> Result<(), SdError> {
        self.check()?;
        let max = self.bus.sdio_max_byte_run(&self.func);
        if max == 0 || size > max {
            return Err(SdError::InvalidParameter);
        }
        let size = if size == 0 { max } else { size };
        self.bus.sdio_set_fbr_block_size(self.func.num, size)?;
        self.func.set_cur_blk_size(size);
        debug!("bus{}: func{} block size {}", self.ctrl.index(), self.func.num, size);
        Ok(())
    }

    /// Set the IO_ENABLE bit and poll IO_READY until the function reports
    /// ready, for at most the enable timeout.
    pub fn enable_func(&mut self) -> Result<(), SdError> {
        self.check()?;
        let num = self.func.num;
        self.bus.sdio_set_io_enable(num, true)?;
        let timeout = self.func.enable_timeout_ms();
        let mut waited = 0;
        loop {
            if self.bus.sdio_io_ready_reg()? & (1 << num) != 0 {
                info!("bus{}: func{} enabled", self.ctrl.index(), num);
                return Ok(());
            }
            if waited >= timeout {
                warn!("bus{}: func{} not ready after {} ms", self.ctrl.index(), num, timeout);
                return Err(SdError::Timeout);
            }
            delay_ms(1);
            waited += 1;
        }
    }

    pub fn disable_func(&mut self) -> Result<(), SdError> {
        self.check()?;
        self.bus.sdio_set_io_enable(self.func.num, false)
    }

    pub fn common_info(&self) -> SdioCommonInfo {
        let cfg = self.bus.config();
        SdioCommonInfo {
            func_num: self.func.num,
            max_blk_num: cfg.max_blk_num,
            max_blk_size: self.bus.sdio_max_byte_run(&self.func),
            max_req_size: cfg.max_req_size,
            cur_blk_size: self.func.cur_blk_size(),
            enable_timeout_ms: self.func.enable_timeout_ms(),
            irq_claimed: self.func.has_irq_handler(),
        }
    }

    /// Only the enable timeout is writable.
    pub fn set_common_info(&mut self, info: &SdioCommonInfo) -> Result<(), SdError> {
        if info.func_num != self.func.num {
            return Err(SdError::InvalidParameter);
        }
        self.func.set_enable_timeout_ms(info.enable_timeout_ms);
        Ok(())
    }

    // ===== Interrupts =====

    pub fn claim_irq(&mut self, handler: Arc<dyn SdioIrqHandler>) -> Result<(), SdError> {
        self.check()?;
        {
            let mut slot = self.func.irq_handler.lock();
            if slot.is_some() {
                return Err(SdError::DeviceBusy);
            }
            *slot = Some(handler);
        }
        let res = self
            .ctrl
            .start_irq_thread()
            .and_then(|_| self.bus.sdio_set_int_enable(self.func.num, true));
        if let Err(e) = res {
            self.func.irq_handler.lock().take();
            return Err(e);
        }
        match self.bus.enable_sdio_irq(true) {
            Ok(()) | Err(SdError::NotSupported) => {}
            Err(e) => warn!("bus{}: host sdio irq enable failed: {}", self.ctrl.index(), e),
        }
        debug!("bus{}: func{} irq claimed", self.ctrl.index(), self.func.num);
        Ok(())
    }

    pub fn release_irq(&mut self) -> Result<(), SdError> {
        if self.func.irq_handler.lock().take().is_none() {
            return Ok(());
        }
        let res = self.bus.sdio_set_int_enable(self.func.num, false);
        if !self.dev.functions().iter().any(|f| f.has_irq_handler()) {
            if let Err(e) = self.bus.enable_sdio_irq(false) {
                debug!("bus{}: host sdio irq disable: {}", self.ctrl.index(), e);
            }
            self.ctrl.stop_irq_thread(false);
        }
        debug!("bus{}: func{} irq released", self.ctrl.index(), self.func.num);
        res
    }
}
