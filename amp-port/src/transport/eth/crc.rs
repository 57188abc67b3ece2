//! CRC used in FireWire packets carried over Ethernet.
//!
//! The FPGA computes the standard CRC-32 over the packet bytes and stores it
//! bit-reversed, big-endian, in the quadlet that follows the covered region.

use crc_all::Crc;

fn crc32(bytes: &[u8]) -> u32 {
    const POLYNOMIAL: u32 = 0x04c1_1db7;
    const WIDTH: usize = 32;
    const INITIAL: u32 = 0xffff_ffff;
    const XOR: u32 = 0xffff_ffff;
    const REFLECT: bool = true;
    let mut crc32 = Crc::<u32>::new(POLYNOMIAL, WIDTH, INITIAL, XOR, REFLECT);

    crc32.update(bytes);
    crc32.finish()
}

/// CRC quadlet for a covered region, as it appears on the wire.
pub fn packet_crc(bytes: &[u8]) -> u32 {
    crc32(bytes).reverse_bits()
}

/// Check the big-endian CRC quadlet stored right after `covered`.
///
/// Returns the computed CRC on mismatch.
pub fn check_crc(covered: &[u8], stored: &[u8]) -> Result<(), (u32, u32)> {
    let received = u32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]);
    let computed = packet_crc(covered);
    if computed == received {
        Ok(())
    } else {
        Err((computed, received))
    }
}
