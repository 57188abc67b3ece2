//! Link-layer addresses of the boards.
//!
//! The first three bytes are `FA:61:0E`, the company id assigned to LCSR by
//! the IEEE, followed by `13:94` and the board number. Multicast frames use
//! the same company id with the multicast bit set, followed by `13:94:FF`.

use std::fmt;

/// A 6-byte MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

const LCSR_CID: [u8; 3] = [0xfa, 0x61, 0x0e];
const MULTICAST_BIT: u8 = 0x01;

impl MacAddr {
    /// Unicast address of board `board` (0 addresses the bridge itself).
    pub const fn board(board: u8) -> Self {
        Self([LCSR_CID[0], LCSR_CID[1], LCSR_CID[2], 0x13, 0x94, board])
    }

    /// Multicast address observed by every board.
    pub const fn multicast() -> Self {
        Self([LCSR_CID[0] | MULTICAST_BIT, LCSR_CID[1], LCSR_CID[2], 0x13, 0x94, 0xff])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & MULTICAST_BIT != 0
    }

    /// Address with each 16-bit word byte-swapped, as the KSZ8851 registers
    /// on the FPGA report it.
    pub fn swap16(&self) -> Self {
        let b = self.0;
        Self([b[1], b[0], b[3], b[2], b[5], b[4]])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}
