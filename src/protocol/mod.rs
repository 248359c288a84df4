//! Per-kind identification and bus negotiation.
//!
//! Each device kind gets one `CardProtocol` implementation, picked once when
//! detection starts. The SD helpers are shared with the SDIO path so a combo
//! card can bring up its memory half.

pub mod emmc;
pub mod sd;
pub mod sdio;

use log::{error, info};

use crate::device::{Device, DeviceKind};
use crate::err::SdError;
use crate::host::Bus;

pub use emmc::EmmcProtocol;
pub use sd::SdProtocol;
pub use sdio::SdioProtocol;

pub trait CardProtocol: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Full identification from a freshly powered bus.
    fn detect(&self, bus: &mut Bus) -> Result<Device, SdError>;

    /// Bring an already known card back to transfer state.
    fn reinit(&self, _bus: &mut Bus, _dev: &Device) -> Result<(), SdError> {
        Err(SdError::NotSupported)
    }

    /// Opcodes for erase start/end, if the kind has memory.
    fn erase_cmds(&self) -> Option<(u32, u32)>;
}

pub fn protocol_for(kind: DeviceKind) -> &'static dyn CardProtocol {
    match kind {
        DeviceKind::Emmc => &EmmcProtocol,
        DeviceKind::Sd => &SdProtocol,
        DeviceKind::Sdio | DeviceKind::Combo => &SdioProtocol,
    }
}

impl Bus {
    /// Power the slot and run one identification pass for `kind`. On failure
    /// the slot is powered off again.
    pub fn do_detect(&mut self, kind: DeviceKind) -> Result<Device, SdError> {
        if kind == DeviceKind::Combo {
            return Err(SdError::InvalidParameter);
        }
        self.power_up()?;
        self.rca = 0;
        match protocol_for(kind).detect(self) {
            Ok(dev) => {
                info!(
                    "bus{}: {:?} ready, {} sectors, clock {} Hz, width {}",
                    self.cfg.index,
                    dev.kind,
                    dev.capacity,
                    self.ios.clock,
                    self.ios.bus_width.bits()
                );
                Ok(dev)
            }
            Err(e) => {
                error!("bus{}: {:?} detect failed: {}", self.cfg.index, kind, e);
                if let Err(pe) = self.power_off() {
                    error!("bus{}: power off failed: {}", self.cfg.index, pe);
                }
                Err(e)
            }
        }
    }
}
