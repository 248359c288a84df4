//! SD / eMMC / SDIO protocol core.
//!
//! The crate sits between a platform bus-controller driver, which implements
//! [`HostOps`], and the users of a slot: a block-device binding and SDIO
//! function drivers. Register a slot with [`Controller::add`], send it a
//! [`Message::Plug`] and the matching protocol identifies the card and
//! negotiates width, voltage and speed.

pub mod bits;
pub mod block;
pub mod cmd;
pub mod constant;
pub mod controller;
pub mod device;
mod err;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod sdio;

pub use cmd::{Command, DataBuffer, RespType};
pub use controller::{Controller, DeviceHandle, DeviceListener, Message, Reply, Request};
pub use device::{Device, DeviceKind, DeviceState, SdioFunction};
pub use err::SdError;
pub use host::{Bus, BusTiming, BusWidth, HostCaps, HostConfig, HostOps, PowerMode, SignalVoltage};
pub use sdio::{IrqNotifier, SdioCommonInfo, SdioFunc, SdioHost, SdioIrqHandler};

pub(crate) fn delay_ms(ms: u32) {
    if ms > 0 {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }
}
