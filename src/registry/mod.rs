//! Decoders turning raw register images into typed fields.

pub mod cid;
pub mod csd;
pub mod ext_csd;
pub mod scr;
pub mod sdio;

pub use cid::Cid;
pub use csd::Csd;
pub use ext_csd::ExtCsd;
pub use scr::{Scr, Ssr, SwitchCaps};
pub use sdio::{Cccr, CommonCis, FuncCis};

/// Raw 128-bit CID/CSD image, most significant word first.
pub type Raw128 = [u32; 4];

pub const CID_BITS: u32 = 128;
pub const CSD_BITS: u32 = 128;
pub const SCR_BITS: u32 = 64;
pub const SSR_BITS: u32 = 512;

// TRAN_SPEED / TAAC lookup tables
pub(crate) const TRAN_SPEED_UNIT: [u32; 8] = [10_000, 100_000, 1_000_000, 10_000_000, 0, 0, 0, 0];
pub(crate) const TACC_UNIT: [u32; 8] = [1, 10, 100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000];
pub(crate) const FACTOR: [u32; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];
