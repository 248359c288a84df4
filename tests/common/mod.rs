//! Scripted bus controller shared by the integration tests.
//!
//! `MockHost` answers commands from a small card model kept behind an
//! `Arc<Mutex<Card>>`, so a test can inspect the command log and poke card
//! state while the crate owns the host.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sdmmc_core::constant::*;
use sdmmc_core::{Command, DataBuffer, HostConfig, HostOps, SdError, SignalVoltage};

pub const OCR_WINDOW: u32 = OCR_2V7_3V6;
pub const STATUS_TRAN: u32 = R1_READY_FOR_DATA | (4 << 9);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    Sd,
    Emmc,
    Sdio,
}

pub struct Card {
    pub kind: CardKind,
    pub plugged: bool,
    pub read_only: bool,
    /// Every command seen, as (opcode, arg).
    pub log: Vec<(u32, u32)>,
    /// CMD53 traffic as (func, addr, block_mode, bytes).
    pub ext_log: Vec<(u32, u32, bool, usize)>,
    pub fail_idle: u32,
    pub fail_cmd52: u32,
    app: bool,
    pub rca: u32,
    pub cid: [u32; 4],
    pub csd: [u32; 4],
    pub scr: [u8; 8],
    pub ext_csd: Vec<u8>,
    switch_error: bool,
    pub media: Vec<u8>,
    erase_start: u32,
    erase_end: u32,
    pub erased: Vec<(u32, u32)>,
    /// SDIO register space keyed by (function, address).
    pub regs: HashMap<(u32, u32), u8>,
    pub sdio_funcs: u32,
    /// IO_READY bits the card will ever raise.
    pub ready_mask: u8,
    /// Card and host both signal at 1.8V on request.
    pub signal_1v8: bool,
    /// Tuning block reads (CMD19/CMD21) succeed.
    pub tuning_ok: bool,
    /// CMD6 group 1 support byte reported by an SD card.
    pub bus_modes: u8,
    /// SD card answers every access-mode switch with default speed.
    pub keep_default_speed: bool,
}

impl Card {
    fn blank(kind: CardKind) -> Self {
        Self {
            kind,
            plugged: true,
            read_only: false,
            log: Vec::new(),
            ext_log: Vec::new(),
            fail_idle: 0,
            fail_cmd52: 0,
            app: false,
            rca: 0,
            cid: [0x0353_5355, 0x3136_4780, 0x1234_5678, 0x0001_3A00],
            csd: [0; 4],
            scr: [0; 8],
            ext_csd: Vec::new(),
            switch_error: false,
            media: Vec::new(),
            erase_start: 0,
            erase_end: 0,
            erased: Vec::new(),
            regs: HashMap::new(),
            sdio_funcs: 0,
            ready_mask: 0xFE,
            signal_1v8: false,
            tuning_ok: true,
            bus_modes: SD_BUS_SPEED_HS | 1,
            keep_default_speed: false,
        }
    }

    /// High-capacity SD card, CSD 2.0, `sectors` a multiple of 1024.
    pub fn sd(sectors: u32) -> Self {
        let mut card = Self::blank(CardKind::Sd);
        card.rca = 0xB368;
        card.csd = build_raw(&[
            (126, 2, 1),
            (99, 4, 6),
            (96, 3, 2),
            (84, 12, 0x5B5),
            (48, 22, sectors / 1024 - 1),
        ]);
        // structure 0, spec 2, 1-bit and 4-bit widths
        card.scr = [0x02, 0x05, 0, 0, 0, 0, 0, 0];
        card.media = vec![0u8; sectors as usize * MMC_SECTOR_SIZE];
        card
    }

    /// Block-addressed eMMC with `sectors` user sectors and an erase group
    /// of `hc_erase_grp` * 1024 sectors.
    pub fn emmc(sectors: u32, hc_erase_grp: u8) -> Self {
        let mut card = Self::blank(CardKind::Emmc);
        card.csd = build_raw(&[
            (126, 2, 3),
            (122, 4, 4),
            (99, 4, 6),
            (96, 3, 2),
            (84, 12, 0x0F5),
            (80, 4, 9),
            (62, 12, 0xFFF),
            (47, 3, 7),
            (22, 4, 9),
        ]);
        let mut ext = vec![0u8; EXT_CSD_SIZE];
        ext[EXT_CSD_REV] = 5;
        ext[EXT_CSD_STRUCTURE] = 2;
        ext[EXT_CSD_CARD_TYPE] = 0x03;
        ext[EXT_CSD_ERASE_GROUP_DEF] = 1;
        ext[EXT_CSD_HC_ERASE_GRP_SIZE] = hc_erase_grp;
        ext[EXT_CSD_SEC_CNT..EXT_CSD_SEC_CNT + 4].copy_from_slice(&sectors.to_le_bytes());
        card.ext_csd = ext;
        card.media = vec![0u8; sectors as usize * MMC_SECTOR_SIZE];
        card
    }

    /// Two-function SDIO card. Function 1 carries its own CIS with a 20 ms
    /// enable timeout; function 2 falls back to the common CIS.
    pub fn sdio() -> Self {
        let mut card = Self::blank(CardKind::Sdio);
        card.rca = 0x0001;
        card.sdio_funcs = 2;
        let mut f0 = |addr: u32, val: u8| {
            card.regs.insert((0, addr), val);
        };
        // CCCR 1.20 / SDIO 3.00, multi-block, high speed
        f0(SDIO_CCCR_REV, 0x32);
        f0(SDIO_CCCR_CARD_CAPS, SDIO_CCCR_CAP_SMB);
        f0(SDIO_CCCR_SPEED, SDIO_CCCR_SPEED_SHS);
        set_cis_ptr(&mut card.regs, 0, 0x1000);
        set_cis_ptr(&mut card.regs, 0x100, 0x2000);
        set_cis_ptr(&mut card.regs, 0x200, 0x3000);
        card.regs.insert((0, 0x100), 0x07);
        card.regs.insert((0, 0x200), 0x0F);
        card.regs.insert((0, 0x201), 0x42);

        let common = [
            CISTPL_MANFID, 4, 0xD0, 0x02, 0x30, 0x43, // vendor 0x02d0, device 0x4330
            CISTPL_FUNCE, 4, 0x00, 0x00, 0x02, 0x32, // 512-byte blocks, 25 MHz
            CISTPL_END,
        ];
        put(&mut card.regs, 0x1000, &common);

        let mut funce = vec![CISTPL_FUNCE, CISTPL_FUNCE_FUNC_LEN, 0x01];
        funce.resize(2 + CISTPL_FUNCE_FUNC_LEN as usize, 0);
        // max block size 256 at body[12], enable timeout 2 * 10 ms at body[28]
        funce[2 + 12] = 0x00;
        funce[2 + 13] = 0x01;
        funce[2 + 28] = 2;
        funce.push(CISTPL_END);
        put(&mut card.regs, 0x2000, &funce);
        put(&mut card.regs, 0x3000, &[CISTPL_END]);
        card
    }

    pub fn reg(&self, func: u32, addr: u32) -> u8 {
        self.regs.get(&(func, addr)).copied().unwrap_or(0)
    }

    pub fn opcodes(&self) -> Vec<u32> {
        self.log.iter().map(|c| c.0).collect()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
        self.ext_log.clear();
    }

    fn sector_range(&self, arg: u32, blocks: u32) -> Result<std::ops::Range<usize>, SdError> {
        let start = arg as usize * MMC_SECTOR_SIZE;
        let end = start + blocks as usize * MMC_SECTOR_SIZE;
        if end > self.media.len() {
            return Err(SdError::DataTimeout);
        }
        Ok(start..end)
    }

    fn memory_data(&mut self, cmd: &mut Command<'_>) -> Result<(), SdError> {
        let arg = cmd.arg;
        let Some(data) = cmd.data.as_mut() else {
            return Err(SdError::InvalidParameter);
        };
        let range = self.sector_range(arg, data.block_count)?;
        match &mut data.buf {
            DataBuffer::Read(buf) => buf.copy_from_slice(&self.media[range]),
            DataBuffer::Write(buf) => self.media[range].copy_from_slice(buf),
            _ => return Err(SdError::InvalidParameter),
        }
        cmd.resp[0] = STATUS_TRAN;
        Ok(())
    }

    fn fill(cmd: &mut Command<'_>, bytes: &[u8]) {
        if let Some(DataBuffer::Read(buf)) = cmd.data.as_mut().map(|d| &mut d.buf) {
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
        }
    }

    fn tuning(&self) -> Result<(), SdError> {
        if self.tuning_ok { Ok(()) } else { Err(SdError::DataCrc) }
    }

    fn erase_cmd(&mut self, opcode: u32, arg: u32) {
        match opcode {
            SD_ERASE_WR_BLK_START | MMC_ERASE_GROUP_START => self.erase_start = arg,
            SD_ERASE_WR_BLK_END | MMC_ERASE_GROUP_END => self.erase_end = arg,
            _ => {
                self.erased.push((self.erase_start, self.erase_end));
                let start = self.erase_start as usize * MMC_SECTOR_SIZE;
                let end = (self.erase_end as usize + 1) * MMC_SECTOR_SIZE;
                let end = end.min(self.media.len());
                if start < end {
                    self.media[start..end].fill(0xFF);
                }
            }
        }
    }

    fn handle_sd(&mut self, cmd: &mut Command<'_>) -> Result<(), SdError> {
        let app = std::mem::take(&mut self.app);
        match (app, cmd.opcode) {
            (_, MMC_GO_IDLE_STATE) => {}
            (_, MMC_APP_CMD) => {
                self.app = true;
                cmd.resp[0] = R1_IS_APP_CMD | STATUS_TRAN;
            }
            (false, SD_SEND_IF_COND) => cmd.resp[0] = cmd.arg & 0xFFF,
            (true, SD_ACMD_SD_SEND_OP_COND) => {
                cmd.resp[0] = if cmd.arg == 0 {
                    OCR_WINDOW
                } else if self.signal_1v8 && cmd.arg & OCR_S18R != 0 {
                    OCR_BUSY | OCR_S18A_HCS | OCR_WINDOW
                } else {
                    OCR_BUSY | OCR_HCS | OCR_WINDOW
                };
            }
            (false, SD_SWITCH_VOLTAGE) if self.signal_1v8 => cmd.resp[0] = STATUS_TRAN,
            (_, MMC_ALL_SEND_CID) => cmd.resp = self.cid,
            (false, SD_SEND_RELATIVE_ADDR) => cmd.resp[0] = self.rca << 16,
            (_, MMC_SEND_CSD) => cmd.resp = self.csd,
            (_, MMC_SELECT_CARD) => {}
            (true, SD_ACMD_SEND_SCR) => Self::fill(cmd, &self.scr.clone()),
            (true, SD_ACMD_SD_STATUS) => Self::fill(cmd, &[0u8; 64]),
            (true, SD_ACMD_SET_BUS_WIDTH) => cmd.resp[0] = STATUS_TRAN,
            (false, SD_SWITCH_FUNC) => {
                let mut status = [0u8; 64];
                status[13] = self.bus_modes;
                if cmd.arg >> 31 == 1 && !self.keep_default_speed {
                    status[16] = (cmd.arg & 0xF) as u8;
                }
                Self::fill(cmd, &status);
            }
            (false, SD_SEND_TUNING_BLOCK) => self.tuning()?,
            (false, MMC_SEND_STATUS) => cmd.resp[0] = STATUS_TRAN,
            (_, MMC_STOP_TRANSMISSION) => cmd.resp[0] = STATUS_TRAN,
            (_, MMC_READ_SINGLE_BLOCK | MMC_READ_MULTIPLE_BLOCK | MMC_WRITE_BLOCK | MMC_WRITE_MULTIPLE_BLOCK) => {
                self.memory_data(cmd)?
            }
            (_, SD_ERASE_WR_BLK_START | SD_ERASE_WR_BLK_END | MMC_ERASE) => {
                self.erase_cmd(cmd.opcode, cmd.arg);
                cmd.resp[0] = STATUS_TRAN;
            }
            _ => return Err(SdError::CmdTimeout),
        }
        Ok(())
    }

    fn handle_emmc(&mut self, cmd: &mut Command<'_>) -> Result<(), SdError> {
        match cmd.opcode {
            MMC_GO_IDLE_STATE => {}
            MMC_SEND_OP_COND => {
                cmd.resp[0] = if cmd.arg == 0 {
                    OCR_WINDOW
                } else {
                    OCR_BUSY | OCR_HCS | OCR_WINDOW
                };
            }
            MMC_ALL_SEND_CID => cmd.resp = self.cid,
            MMC_SET_RELATIVE_ADDR => self.rca = cmd.arg >> 16,
            MMC_SEND_CSD => cmd.resp = self.csd,
            MMC_SELECT_CARD => {}
            MMC_SEND_EXT_CSD => Self::fill(cmd, &self.ext_csd.clone()),
            MMC_SEND_TUNING_BLOCK_HS200 => self.tuning()?,
            MMC_SWITCH => {
                let index = ((cmd.arg >> 16) & 0xFF) as usize;
                self.ext_csd[index] = (cmd.arg >> 8) as u8;
            }
            MMC_SEND_STATUS => {
                cmd.resp[0] = STATUS_TRAN;
                if std::mem::take(&mut self.switch_error) {
                    cmd.resp[0] |= R1_SWITCH_ERROR;
                }
            }
            MMC_STOP_TRANSMISSION => cmd.resp[0] = STATUS_TRAN,
            MMC_READ_SINGLE_BLOCK | MMC_READ_MULTIPLE_BLOCK | MMC_WRITE_BLOCK | MMC_WRITE_MULTIPLE_BLOCK => {
                self.memory_data(cmd)?
            }
            MMC_ERASE_GROUP_START | MMC_ERASE_GROUP_END | MMC_ERASE => {
                self.erase_cmd(cmd.opcode, cmd.arg);
                cmd.resp[0] = STATUS_TRAN;
            }
            _ => return Err(SdError::CmdTimeout),
        }
        Ok(())
    }

    fn write_reg(&mut self, func: u32, addr: u32, val: u8) {
        self.regs.insert((func, addr), val);
        if func == 0 && addr == SDIO_CCCR_IO_ENABLE {
            self.regs.insert((0, SDIO_CCCR_IO_READY), val & self.ready_mask);
        }
    }

    fn handle_sdio(&mut self, cmd: &mut Command<'_>) -> Result<(), SdError> {
        let funcs = self.sdio_funcs << SDIO_OCR_FUNC_SHIFT;
        match cmd.opcode {
            MMC_GO_IDLE_STATE => {}
            SDIO_SEND_OP_COND => {
                cmd.resp[0] = if cmd.arg == 0 {
                    funcs | OCR_WINDOW
                } else {
                    OCR_BUSY | funcs | OCR_WINDOW
                };
            }
            SD_SEND_RELATIVE_ADDR => cmd.resp[0] = self.rca << 16,
            MMC_SELECT_CARD => {}
            SDIO_RW_DIRECT => {
                if self.fail_cmd52 > 0 {
                    self.fail_cmd52 -= 1;
                    return Err(SdError::CmdTimeout);
                }
                let write = cmd.arg >> 31 == 1;
                let func = (cmd.arg >> 28) & 7;
                let addr = (cmd.arg >> 9) & 0x1FFFF;
                if write {
                    self.write_reg(func, addr, cmd.arg as u8);
                }
                cmd.resp[0] = self.reg(func, addr) as u32;
            }
            SDIO_RW_EXTENDED => {
                let write = cmd.arg >> 31 == 1;
                let func = (cmd.arg >> 28) & 7;
                let block_mode = cmd.arg & (1 << 27) != 0;
                let incr = cmd.arg & (1 << 26) != 0;
                let addr = (cmd.arg >> 9) & 0x1FFFF;
                let Some(data) = cmd.data.as_mut() else {
                    return Err(SdError::InvalidParameter);
                };
                let len = data.buf.len();
                self.ext_log.push((func, addr, block_mode, len));
                let at = |i: usize| if incr { addr + i as u32 } else { addr };
                match &mut data.buf {
                    DataBuffer::Read(buf) => {
                        for (i, b) in buf.iter_mut().enumerate() {
                            *b = self.reg(func, at(i));
                        }
                    }
                    DataBuffer::Write(buf) => {
                        for (i, b) in buf.iter().enumerate() {
                            self.write_reg(func, at(i), *b);
                        }
                    }
                    DataBuffer::ReadScatter(bufs) => {
                        for b in bufs.iter_mut().flat_map(|s| s.iter_mut()) {
                            *b = self.reg(func, addr);
                        }
                    }
                    DataBuffer::WriteScatter(bufs) => {
                        let bytes: Vec<u8> = bufs.iter().flat_map(|s| s.iter().copied()).collect();
                        for b in bytes {
                            self.write_reg(func, addr, b);
                        }
                    }
                }
                if !write {
                    cmd.resp[0] = 0;
                }
            }
            _ => return Err(SdError::CmdTimeout),
        }
        Ok(())
    }
}

fn put(regs: &mut HashMap<(u32, u32), u8>, at: u32, bytes: &[u8]) {
    for (i, b) in bytes.iter().enumerate() {
        regs.insert((0, at + i as u32), *b);
    }
}

fn set_cis_ptr(regs: &mut HashMap<(u32, u32), u8>, base: u32, ptr: u32) {
    for i in 0..3 {
        regs.insert((0, base + SDIO_FBR_CIS_PTR + i), (ptr >> (8 * i)) as u8);
    }
}

/// Build a raw 128-bit register from `(start, width, value)` fields.
pub fn build_raw(fields: &[(u32, u32, u32)]) -> [u32; 4] {
    let mut wide: u128 = 0;
    for &(start, width, value) in fields {
        let mask = ((1u128 << width) - 1) << start;
        wide = (wide & !mask) | (((value as u128) << start) & mask);
    }
    [(wide >> 96) as u32, (wide >> 64) as u32, (wide >> 32) as u32, wide as u32]
}

pub struct MockHost {
    pub card: Arc<Mutex<Card>>,
    in_flight: Arc<AtomicBool>,
    pub overlaps: Arc<AtomicU32>,
}

impl MockHost {
    pub fn new(card: Card) -> (Self, Arc<Mutex<Card>>, Arc<AtomicU32>) {
        let card = Arc::new(Mutex::new(card));
        let overlaps = Arc::new(AtomicU32::new(0));
        let host = Self {
            card: card.clone(),
            in_flight: Arc::new(AtomicBool::new(false)),
            overlaps: overlaps.clone(),
        };
        (host, card, overlaps)
    }
}

impl HostOps for MockHost {
    fn request(&mut self, cmd: &mut Command<'_>) -> Result<(), SdError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.overlaps.fetch_add(1, Ordering::AcqRel);
        }
        let res = {
            let mut card = self.card.lock();
            card.log.push((cmd.opcode, cmd.arg));
            if let Some(stop) = cmd.data.as_ref().and_then(|d| d.stop.as_ref()) {
                card.log.push((stop.opcode, stop.arg));
            }
            if cmd.opcode == MMC_GO_IDLE_STATE && card.fail_idle > 0 {
                card.fail_idle -= 1;
                Err(SdError::CmdTimeout)
            } else {
                match card.kind {
                    CardKind::Sd => card.handle_sd(cmd),
                    CardKind::Emmc => card.handle_emmc(cmd),
                    CardKind::Sdio => card.handle_sdio(cmd),
                }
            }
        };
        if matches!(cmd.opcode, MMC_READ_MULTIPLE_BLOCK | MMC_WRITE_MULTIPLE_BLOCK) {
            std::thread::sleep(Duration::from_micros(200));
        }
        self.in_flight.store(false, Ordering::Release);
        res
    }

    fn dev_read_only(&mut self) -> bool {
        self.card.lock().read_only
    }

    fn dev_plugged(&mut self) -> bool {
        self.card.lock().plugged
    }

    fn switch_voltage(&mut self, voltage: SignalVoltage) -> Result<(), SdError> {
        match voltage {
            SignalVoltage::V330 => Ok(()),
            SignalVoltage::V180 if self.card.lock().signal_1v8 => Ok(()),
            _ => Err(SdError::NotSupported),
        }
    }
}

pub fn config(index: u32, kind: sdmmc_core::DeviceKind) -> HostConfig {
    HostConfig {
        index,
        dev_type: kind,
        ..Default::default()
    }
}

/// Wait up to a second for `cond`.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
