use log::debug;

use crate::bits::parse_bits;

use super::{CID_BITS, Raw128};

const PNM_START_BIT: u32 = 96;

/// Card identification register.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cid {
    pub mid: u32,
    pub oid: u32,
    pub pnm: String,
    pub hw_rev: u32,
    pub fw_rev: u32,
    pub psn: u32,
    pub year: u32,
    pub month: u32,
    /// Only meaningful for eMMC 4.1+ layouts: CBX == 0 means a removable card.
    pub removable: bool,
}

fn product_name(raw: &Raw128, len: u32) -> String {
    (0..len)
        .map(|i| parse_bits(raw, CID_BITS, PNM_START_BIT - i * 8, 8) as u8)
        .take_while(|&c| c != 0)
        .map(char::from)
        .collect()
}

impl Cid {
    /// eMMC CID. `spec_vers` comes from the CSD and picks the layout.
    pub fn decode_mmc(raw: &Raw128, spec_vers: u32) -> Self {
        let mut cid = Cid {
            month: parse_bits(raw, CID_BITS, 12, 4),
            year: parse_bits(raw, CID_BITS, 8, 4) + 1997,
            ..Default::default()
        };

        if spec_vers <= 1 {
            cid.mid = parse_bits(raw, CID_BITS, 104, 24);
            cid.pnm = product_name(raw, 7);
            cid.hw_rev = parse_bits(raw, CID_BITS, 44, 4);
            cid.fw_rev = parse_bits(raw, CID_BITS, 40, 4);
            cid.psn = parse_bits(raw, CID_BITS, 16, 24);
        } else {
            cid.mid = parse_bits(raw, CID_BITS, 120, 8);
            cid.oid = parse_bits(raw, CID_BITS, 104, 16);
            cid.pnm = product_name(raw, 6);
            cid.psn = parse_bits(raw, CID_BITS, 16, 32);
            cid.removable = parse_bits(raw, CID_BITS, 112, 2) == 0;
        }
        debug!("mmc cid: {:?}", cid);
        cid
    }

    pub fn decode_sd(raw: &Raw128) -> Self {
        let cid = Cid {
            mid: parse_bits(raw, CID_BITS, 120, 8),
            oid: parse_bits(raw, CID_BITS, 104, 16),
            pnm: product_name(raw, 5),
            hw_rev: parse_bits(raw, CID_BITS, 60, 4),
            fw_rev: parse_bits(raw, CID_BITS, 56, 4),
            psn: parse_bits(raw, CID_BITS, 24, 32),
            year: parse_bits(raw, CID_BITS, 12, 8) + 2000,
            month: parse_bits(raw, CID_BITS, 8, 4),
            removable: true,
        };
        debug!("sd cid: {:?}", cid);
        cid
    }
}

/// Raw CID as the 16 bytes seen on the wire.
pub fn cid_bytes(raw: &Raw128) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, w) in raw.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&w.to_be_bytes());
    }
    out
}
