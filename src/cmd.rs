use bitflags::bitflags;
use log::{debug, warn};

use crate::constant::*;
use crate::delay_ms;
use crate::err::SdError;
use crate::host::{Bus, BusWidth, HostCaps};
use crate::registry::Raw128;

bitflags! {
    /// Expected response shape of a command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RespType: u32 {
        const PRESENT = 1 << 0;
        const LONG = 1 << 1;
        const CRC = 1 << 2;
        const BUSY = 1 << 3;
        const OPCODE = 1 << 4;
    }
}

impl RespType {
    pub const NONE: RespType = RespType::empty();
    pub const R1: RespType = RespType::PRESENT.union(RespType::CRC).union(RespType::OPCODE);
    pub const R1B: RespType = RespType::R1.union(RespType::BUSY);
    pub const R2: RespType = RespType::PRESENT.union(RespType::LONG).union(RespType::CRC);
    pub const R3: RespType = RespType::PRESENT;
    pub const R4: RespType = RespType::PRESENT;
    pub const R5: RespType = RespType::R1;
    pub const R6: RespType = RespType::R1;
    pub const R7: RespType = RespType::R1;
}

/// R1 status bits that mean the card rejected the command.
pub const R1_ERROR_MASK: u32 = R1_OUT_OF_RANGE
    | R1_ADDRESS_ERROR
    | R1_BLOCK_LEN_ERROR
    | R1_ERASE_SEQ_ERROR
    | R1_ERASE_PARAM
    | R1_WP_VIOLATION
    | R1_COM_CRC_ERROR
    | R1_ILLEGAL_COMMAND
    | R1_CARD_ECC_FAILED
    | R1_CC_ERROR
    | R1_GENERAL_ERROR;

pub fn r1_state(status: u32) -> u32 {
    (status & R1_CURRENT_STATE_MASK) >> R1_CURRENT_STATE_SHIFT
}

#[derive(Debug)]
pub enum DataBuffer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
    ReadScatter(Vec<&'a mut [u8]>),
    WriteScatter(Vec<&'a [u8]>),
}

impl DataBuffer<'_> {
    pub fn is_read(&self) -> bool {
        matches!(self, DataBuffer::Read(_) | DataBuffer::ReadScatter(_))
    }

    pub fn len(&self) -> usize {
        match self {
            DataBuffer::Read(b) => b.len(),
            DataBuffer::Write(b) => b.len(),
            DataBuffer::ReadScatter(v) => v.iter().map(|b| b.len()).sum(),
            DataBuffer::WriteScatter(v) => v.iter().map(|b| b.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Data phase of a command.
#[derive(Debug)]
pub struct Data<'a> {
    pub block_size: u32,
    pub block_count: u32,
    pub buf: DataBuffer<'a>,
    /// Issued by the host driver once the data phase completes.
    pub stop: Option<Box<Command<'static>>>,
    pub err: Option<SdError>,
}

#[derive(Debug)]
pub struct Command<'a> {
    pub opcode: u32,
    pub arg: u32,
    pub resp_type: RespType,
    pub resp: [u32; 4],
    pub err: Option<SdError>,
    pub data: Option<Data<'a>>,
}

impl<'a> Command<'a> {
    pub fn new(opcode: u32, arg: u32, resp_type: RespType) -> Self {
        Self {
            opcode,
            arg,
            resp_type,
            resp: [0; 4],
            err: None,
            data: None,
        }
    }

    pub fn with_data(mut self, block_size: u32, block_count: u32, buf: DataBuffer<'a>) -> Self {
        self.data = Some(Data {
            block_size,
            block_count,
            buf,
            stop: None,
            err: None,
        });
        self
    }

    pub fn with_stop(mut self, stop: Command<'static>) -> Self {
        if let Some(data) = self.data.as_mut() {
            data.stop = Some(Box::new(stop));
        }
        self
    }

    pub fn as_r1(&self) -> u32 {
        self.resp[0]
    }

    pub fn as_r2(&self) -> Raw128 {
        self.resp
    }

    fn reset(&mut self) {
        self.err = None;
        self.resp = [0; 4];
        if let Some(data) = self.data.as_mut() {
            data.err = None;
            if let Some(stop) = data.stop.as_mut() {
                stop.err = None;
            }
        }
    }

    /// First error recorded for the command, its data phase or its stop.
    pub fn status(&self) -> Result<(), SdError> {
        if let Some(e) = self.err {
            return Err(e);
        }
        if let Some(data) = self.data.as_ref() {
            if let Some(e) = data.err {
                return Err(e);
            }
            if let Some(e) = data.stop.as_ref().and_then(|s| s.err) {
                return Err(e);
            }
        }
        Ok(())
    }
}

fn check_r5(resp: u32) -> Result<u8, SdError> {
    if resp & (SDIO_R5_COM_CRC_ERROR | SDIO_R5_ILLEGAL_COMMAND | SDIO_R5_ERROR) != 0 {
        return Err(SdError::IoError);
    }
    if resp & (SDIO_R5_FUNCTION_NUMBER | SDIO_R5_OUT_OF_RANGE) != 0 {
        return Err(SdError::InvalidParameter);
    }
    Ok((resp & SDIO_R5_DATA_MASK) as u8)
}

// ===== Command Transport =====

impl Bus {
    /// Issue `cmd` through the host driver, trying up to `retries` times.
    pub fn send(&mut self, cmd: &mut Command<'_>, retries: u32) -> Result<(), SdError> {
        if retries == 0 {
            return Err(SdError::InvalidParameter);
        }
        let mut last = SdError::IoError;
        for attempt in 0..retries {
            cmd.reset();
            debug!("cmd{} arg {:#x} attempt {}", cmd.opcode, cmd.arg, attempt);
            match self.ops.request(cmd).and_then(|_| cmd.status()) {
                Ok(()) => {
                    debug!("cmd{} resp {:#x?}", cmd.opcode, cmd.resp);
                    return Ok(());
                }
                Err(e) if e.is_transport() => {
                    debug!("cmd{} failed: {}", cmd.opcode, e);
                    last = e;
                }
                Err(e) => {
                    debug!("cmd{} rejected: {}", cmd.opcode, e);
                    return Err(e);
                }
            }
        }
        Err(last)
    }

    pub fn mmc_go_idle(&mut self) -> Result<(), SdError> {
        let mut cmd = Command::new(MMC_GO_IDLE_STATE, 0, RespType::NONE);
        self.send(&mut cmd, 1)?;
        delay_ms(1);
        Ok(())
    }

    fn op_cond_loop<F>(&mut self, ocr: u32, delay: u32, mut issue: F) -> Result<u32, SdError>
    where
        F: FnMut(&mut Bus, u32) -> Result<u32, SdError>,
    {
        for _ in 0..MMC_OP_COND_LOOPS {
            let resp = issue(self, ocr)?;
            if ocr == 0 || resp & OCR_BUSY != 0 {
                return Ok(resp);
            }
            delay_ms(delay);
        }
        warn!("bus{}: op cond {:#x} never completed", self.cfg.index, ocr);
        Err(SdError::Timeout)
    }

    /// CMD1 until the card leaves the busy state. `ocr == 0` only queries.
    pub fn mmc_send_op_cond(&mut self, ocr: u32) -> Result<u32, SdError> {
        self.op_cond_loop(ocr, 10, |bus, ocr| {
            let mut cmd = Command::new(MMC_SEND_OP_COND, ocr, RespType::R3);
            bus.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
            Ok(cmd.resp[0])
        })
    }

    /// ACMD41 until the card leaves the busy state. `ocr == 0` only queries.
    pub fn sd_send_op_cond(&mut self, ocr: u32) -> Result<u32, SdError> {
        self.op_cond_loop(ocr, 20, |bus, ocr| {
            bus.sd_app_cmd(0)?;
            let mut cmd = Command::new(SD_ACMD_SD_SEND_OP_COND, ocr, RespType::R3);
            bus.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
            Ok(cmd.resp[0])
        })
    }

    /// CMD5 until the card leaves the busy state. `ocr == 0` only queries.
    pub fn sdio_send_op_cond(&mut self, ocr: u32) -> Result<u32, SdError> {
        self.op_cond_loop(ocr, 10, |bus, ocr| {
            let mut cmd = Command::new(SDIO_SEND_OP_COND, ocr, RespType::R4);
            bus.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
            Ok(cmd.resp[0])
        })
    }

    pub fn mmc_all_send_cid(&mut self) -> Result<Raw128, SdError> {
        let mut cmd = Command::new(MMC_ALL_SEND_CID, 0, RespType::R2);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        Ok(cmd.as_r2())
    }

    /// eMMC: the host assigns `rca`.
    pub fn mmc_set_relative_addr(&mut self, rca: u32) -> Result<(), SdError> {
        let mut cmd = Command::new(MMC_SET_RELATIVE_ADDR, rca << 16, RespType::R1);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        self.rca = rca;
        Ok(())
    }

    /// SD/SDIO: the card publishes its own address in an R6.
    pub fn sd_send_relative_addr(&mut self) -> Result<u32, SdError> {
        let mut cmd = Command::new(SD_SEND_RELATIVE_ADDR, 0, RespType::R6);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        self.rca = cmd.resp[0] >> 16;
        debug!("bus{}: rca {:#x}", self.cfg.index, self.rca);
        Ok(self.rca)
    }

    pub fn mmc_send_csd(&mut self) -> Result<Raw128, SdError> {
        let mut cmd = Command::new(MMC_SEND_CSD, self.rca << 16, RespType::R2);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        Ok(cmd.as_r2())
    }

    pub fn mmc_select_card(&mut self) -> Result<(), SdError> {
        let mut cmd = Command::new(MMC_SELECT_CARD, self.rca << 16, RespType::R1B);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)
    }

    pub fn mmc_send_status(&mut self) -> Result<u32, SdError> {
        let mut cmd = Command::new(MMC_SEND_STATUS, self.rca << 16, RespType::R1);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        Ok(cmd.as_r1())
    }

    /// Poll CMD13 until the card is ready for data and out of programming.
    pub fn mmc_wait_ready(&mut self) -> Result<u32, SdError> {
        for _ in 0..MMC_WAIT_READY_LOOPS {
            let status = self.mmc_send_status()?;
            if status & R1_ERROR_MASK != 0 {
                warn!("bus{}: card status error {:#x}", self.cfg.index, status);
                return Err(SdError::CardError(status));
            }
            if status & R1_READY_FOR_DATA != 0 && r1_state(status) != R1_STATE_PRG {
                return Ok(status);
            }
            delay_ms(10);
        }
        Err(SdError::Timeout)
    }

    pub fn mmc_stop_transmission(&mut self, write: bool) -> Result<(), SdError> {
        let resp_type = if write { RespType::R1B } else { RespType::R1 };
        let mut cmd = Command::new(MMC_STOP_TRANSMISSION, 0, resp_type);
        self.send(&mut cmd, MMC_STOP_RETRY)?;
        if write {
            self.mmc_wait_ready()?;
        }
        Ok(())
    }

    pub fn mmc_send_ext_csd(&mut self) -> Result<Vec<u8>, SdError> {
        let mut buf = vec![0u8; EXT_CSD_SIZE];
        let mut cmd = Command::new(MMC_SEND_EXT_CSD, 0, RespType::R1).with_data(
            EXT_CSD_SIZE as u32,
            1,
            DataBuffer::Read(&mut buf),
        );
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        drop(cmd);
        Ok(buf)
    }

    /// CMD6 write-byte to an EXT_CSD field, then wait for the card.
    pub fn mmc_switch(&mut self, index: usize, value: u8) -> Result<(), SdError> {
        let arg = (EXT_CSD_ACCESS_WRITE_BYTE << 24)
            | ((index as u32) << 16)
            | ((value as u32) << 8)
            | EXT_CSD_CMD_SET_NORMAL;
        let mut cmd = Command::new(MMC_SWITCH, arg, RespType::R1B);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        debug!("cmd6 index {} value {:#x} resp {:#x}", index, value, cmd.as_r1());

        let status = self.mmc_wait_ready()?;
        if status & R1_SWITCH_ERROR != 0 {
            warn!("bus{}: switch of ext_csd[{}] refused", self.cfg.index, index);
            return Err(SdError::SwitchFailure);
        }
        Ok(())
    }

    /// Read the tuning block once.
    pub fn mmc_send_tuning(&mut self, opcode: u32) -> Result<(), SdError> {
        let len = match self.ios.bus_width {
            BusWidth::Width8 => TUNING_BLK_8BIT_LEN,
            BusWidth::Width4 => TUNING_BLK_4BIT_LEN,
            BusWidth::Width1 => return Err(SdError::InvalidParameter),
        };
        let mut buf = vec![0u8; len];
        let mut cmd = Command::new(opcode, 0, RespType::R1).with_data(len as u32, 1, DataBuffer::Read(&mut buf));
        self.send(&mut cmd, 1)
    }

    /// Tune the sampling point with `opcode` (CMD19 or CMD21). Controllers
    /// without a tuning engine get a single tuning block read instead.
    pub fn tune(&mut self, opcode: u32) -> Result<(), SdError> {
        match self.ops.tune(opcode) {
            Err(SdError::NotSupported) => self.mmc_send_tuning(opcode),
            other => other,
        }
    }

    // ===== SD specific =====

    pub fn sd_send_if_cond(&mut self, ocr: u32) -> Result<(), SdError> {
        let vhs = if ocr & OCR_2V7_3V6 != 0 { 1 } else { 0 };
        let arg = (vhs << 8) | SD_IF_COND_CHECK_PATTERN;
        let mut cmd = Command::new(SD_SEND_IF_COND, arg, RespType::R7);
        self.send(&mut cmd, 1)?;
        if cmd.resp[0] & 0xFF != SD_IF_COND_CHECK_PATTERN {
            debug!("bus{}: if cond echo {:#x}", self.cfg.index, cmd.resp[0]);
            return Err(SdError::IoError);
        }
        Ok(())
    }

    pub fn sd_app_cmd(&mut self, rca: u32) -> Result<(), SdError> {
        let mut cmd = Command::new(MMC_APP_CMD, rca << 16, RespType::R1);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        if cmd.as_r1() & R1_IS_APP_CMD == 0 {
            return Err(SdError::IoError);
        }
        Ok(())
    }

    pub fn sd_app_set_bus_width(&mut self, width: u32) -> Result<(), SdError> {
        self.sd_app_cmd(self.rca)?;
        let mut cmd = Command::new(SD_ACMD_SET_BUS_WIDTH, width, RespType::R1);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)
    }

    pub fn sd_app_send_scr(&mut self) -> Result<[u8; SD_SCR_LEN], SdError> {
        let mut buf = [0u8; SD_SCR_LEN];
        self.sd_app_cmd(self.rca)?;
        let mut cmd = Command::new(SD_ACMD_SEND_SCR, 0, RespType::R1).with_data(
            SD_SCR_LEN as u32,
            1,
            DataBuffer::Read(&mut buf),
        );
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        drop(cmd);
        Ok(buf)
    }

    pub fn sd_app_sd_status(&mut self) -> Result<[u8; SD_SSR_LEN], SdError> {
        let mut buf = [0u8; SD_SSR_LEN];
        self.sd_app_cmd(self.rca)?;
        let mut cmd = Command::new(SD_ACMD_SD_STATUS, 0, RespType::R1).with_data(
            SD_SSR_LEN as u32,
            1,
            DataBuffer::Read(&mut buf),
        );
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        drop(cmd);
        Ok(buf)
    }

    /// CMD6 switch function: `mode` is check or set, `group` 0-based.
    pub fn sd_switch_func(&mut self, mode: u32, group: u32, value: u32) -> Result<[u8; SD_SWITCH_STATUS_LEN], SdError> {
        let shift = group * 4;
        let arg = (mode << 31) | (0x00FF_FFFF & !(0xF << shift)) | ((value & 0xF) << shift);
        let mut status = [0u8; SD_SWITCH_STATUS_LEN];
        let mut cmd = Command::new(SD_SWITCH_FUNC, arg, RespType::R1).with_data(
            SD_SWITCH_STATUS_LEN as u32,
            1,
            DataBuffer::Read(&mut status),
        );
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        drop(cmd);
        Ok(status)
    }

    /// CMD11, signalling the card to move to 1.8V.
    pub fn sd_switch_voltage(&mut self) -> Result<(), SdError> {
        let mut cmd = Command::new(SD_SWITCH_VOLTAGE, 0, RespType::R1);
        self.send(&mut cmd, 1)?;
        if cmd.as_r1() & R1_ERROR_MASK != 0 {
            return Err(SdError::CardError(cmd.as_r1()));
        }
        Ok(())
    }

    // ===== SDIO specific =====

    /// CMD52. Returns the byte read back (for a write with `raw`, the new value).
    pub fn io_rw_direct(&mut self, write: bool, func: u32, addr: u32, data: u8, raw: bool) -> Result<u8, SdError> {
        if func > SDIO_MAX_FUNCTIONS || addr > SDIO_MAX_REG_ADDR {
            return Err(SdError::InvalidParameter);
        }
        let arg = ((write as u32) << 31)
            | (func << 28)
            | (((write && raw) as u32) << 27)
            | (addr << 9)
            | if write { data as u32 } else { 0 };
        let mut cmd = Command::new(SDIO_RW_DIRECT, arg, RespType::R5);
        self.send(&mut cmd, MMC_CMD_DEFAULT_RETRY)?;
        check_r5(cmd.resp[0])
    }

    /// CMD53. `blocks == 0` selects byte mode with `blksz` bytes.
    pub fn io_rw_extended(
        &mut self,
        func: u32,
        addr: u32,
        incr: bool,
        buf: DataBuffer<'_>,
        blocks: u32,
        blksz: u32,
    ) -> Result<(), SdError> {
        if func > SDIO_MAX_FUNCTIONS || addr > SDIO_MAX_REG_ADDR || blksz == 0 {
            return Err(SdError::InvalidParameter);
        }
        if (blocks == 0 && blksz > SDIO_MAX_BLOCK_SIZE) || blocks > SDIO_MAX_BLOCK_COUNT {
            return Err(SdError::InvalidParameter);
        }
        let count = blocks.max(1);
        let total = blksz.checked_mul(count).ok_or(SdError::InvalidParameter)?;
        if buf.len() != total as usize {
            return Err(SdError::InvalidParameter);
        }
        let write = !buf.is_read();
        let mut arg = ((write as u32) << 31) | (func << 28) | ((incr as u32) << 26) | (addr << 9);
        if blocks == 0 {
            // 512 bytes encodes as 0
            arg |= if blksz == SDIO_MAX_BLOCK_SIZE { 0 } else { blksz };
        } else {
            arg |= (1 << 27) | blocks;
        }
        let mut cmd = Command::new(SDIO_RW_EXTENDED, arg, RespType::R5).with_data(blksz, count, buf);
        self.send(&mut cmd, 1)?;
        check_r5(cmd.resp[0]).map(|_| ())
    }

    /// Build the stop command for a multi-block transfer, unless the
    /// controller sends one itself.
    pub(crate) fn auto_stop(&self, blocks: u32, write: bool) -> Option<Command<'static>> {
        if blocks <= 1 || self.cfg.caps.contains(HostCaps::AUTO_STOP) {
            return None;
        }
        let resp_type = if write { RespType::R1B } else { RespType::R1 };
        Some(Command::new(MMC_STOP_TRANSMISSION, 0, resp_type))
    }
}
