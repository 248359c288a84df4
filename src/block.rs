//! Sector read/write/erase on top of an enumerated memory device.

use log::{debug, warn};

use crate::cmd::{Command, DataBuffer, RespType};
use crate::constant::*;
use crate::device::{Device, DeviceState};
use crate::err::SdError;
use crate::host::Bus;
use crate::protocol::protocol_for;

/// Round `[start, end)` inward to whole erase units. Returns the aligned
/// start and sector count; the count is 0 when nothing is left.
pub fn align_erase(start: u64, end: u64, unit: u32) -> (u64, u64) {
    let unit = unit as u64;
    let s = start.div_ceil(unit) * unit;
    let e = end / unit * unit;
    if e <= s { (s, 0) } else { (s, e - s) }
}

/// Sectors reachable through a 32-bit command argument. Byte-addressed
/// cards stop at 4 GiB.
fn addressable(dev: &Device) -> u64 {
    if dev.block_addr() {
        dev.capacity
    } else {
        dev.capacity.min(BYTE_ADDR_MAX_SECTORS)
    }
}

impl Bus {
    /// Largest sector count one request may carry.
    pub fn max_chunk_sectors(&self) -> u32 {
        let by_req = self.cfg.max_req_size / MMC_SECTOR_SIZE as u32;
        self.cfg.max_blk_num.min(by_req).max(1)
    }

    fn check_rw(&self, dev: &Device, start: u32, len: usize) -> Result<u32, SdError> {
        if !dev.kind.has_memory() {
            return Err(SdError::NotSupported);
        }
        if !dev.block_ready() {
            return Err(SdError::NoDevice);
        }
        if len == 0 || len % MMC_SECTOR_SIZE != 0 {
            return Err(SdError::InvalidParameter);
        }
        let count = (len / MMC_SECTOR_SIZE) as u64;
        if start as u64 + count > addressable(dev) {
            return Err(SdError::InvalidParameter);
        }
        Ok(count as u32)
    }

    pub fn read_blocks(&mut self, dev: &Device, start: u32, buf: &mut [u8]) -> Result<(), SdError> {
        self.check_rw(dev, start, buf.len())?;
        let chunk_len = self.max_chunk_sectors() as usize * MMC_SECTOR_SIZE;
        let mut sector = start;
        for chunk in buf.chunks_mut(chunk_len) {
            let blocks = (chunk.len() / MMC_SECTOR_SIZE) as u32;
            let opcode = if blocks > 1 {
                MMC_READ_MULTIPLE_BLOCK
            } else {
                MMC_READ_SINGLE_BLOCK
            };
            let stop = self.auto_stop(blocks, false);
            let mut cmd = Command::new(opcode, dev.data_addr(sector), RespType::R1).with_data(
                MMC_SECTOR_SIZE as u32,
                blocks,
                DataBuffer::Read(chunk),
            );
            if let Some(stop) = stop {
                cmd = cmd.with_stop(stop);
            }
            self.send(&mut cmd, 1)?;
            sector += blocks;
        }
        Ok(())
    }

    pub fn write_blocks(&mut self, dev: &Device, start: u32, buf: &[u8]) -> Result<(), SdError> {
        self.check_rw(dev, start, buf.len())?;
        if dev.has_state(DeviceState::READONLY) {
            warn!("bus{}: write to read-only device", self.cfg.index);
            return Err(SdError::NotSupported);
        }
        let chunk_len = self.max_chunk_sectors() as usize * MMC_SECTOR_SIZE;
        let mut sector = start;
        for chunk in buf.chunks(chunk_len) {
            let blocks = (chunk.len() / MMC_SECTOR_SIZE) as u32;
            let opcode = if blocks > 1 {
                MMC_WRITE_MULTIPLE_BLOCK
            } else {
                MMC_WRITE_BLOCK
            };
            let stop = self.auto_stop(blocks, true);
            let mut cmd = Command::new(opcode, dev.data_addr(sector), RespType::R1).with_data(
                MMC_SECTOR_SIZE as u32,
                blocks,
                DataBuffer::Write(chunk),
            );
            if let Some(stop) = stop {
                cmd = cmd.with_stop(stop);
            }
            self.send(&mut cmd, 1)?;
            self.mmc_wait_ready()?;
            sector += blocks;
        }
        Ok(())
    }

    /// Erase whole erase units inside `[start, start + count)`, clipped to
    /// the device. A range that holds no whole unit succeeds without
    /// touching the bus.
    pub fn erase(&mut self, dev: &Device, start: u32, count: u32) -> Result<(), SdError> {
        if !dev.kind.has_memory() || dev.erase_size == 0 || !dev.csd.has_class(CSD_CCC_ERASE) {
            return Err(SdError::NotSupported);
        }
        let (start_op, end_op) = protocol_for(dev.kind)
            .erase_cmds()
            .ok_or(SdError::NotSupported)?;
        if !dev.block_ready() {
            return Err(SdError::NoDevice);
        }
        if start as u64 >= addressable(dev) {
            return Err(SdError::InvalidParameter);
        }
        if dev.has_state(DeviceState::READONLY) {
            warn!("bus{}: erase on read-only device", self.cfg.index);
            return Err(SdError::NotSupported);
        }

        let end = (start as u64 + count as u64).min(addressable(dev));
        let (first, sectors) = align_erase(start as u64, end, dev.erase_size);
        if sectors == 0 {
            debug!("bus{}: erase {}+{} holds no whole unit", self.cfg.index, start, count);
            return Ok(());
        }
        let first = first as u32;
        let last = first + (sectors as u32 - 1);
        debug!("bus{}: erase sectors {}..={}", self.cfg.index, first, last);

        let mut cmd = Command::new(start_op, dev.data_addr(first), RespType::R1);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        let mut cmd = Command::new(end_op, dev.data_addr(last), RespType::R1);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        let mut cmd = Command::new(MMC_ERASE, 0, RespType::R1B);
        self.send(&mut cmd, 1)?;
        self.mmc_wait_ready()?;
        Ok(())
    }
}
