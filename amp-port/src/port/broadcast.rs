//! Layout of broadcast cycles.
//!
//! A broadcast read starts with one quadlet write to every node carrying the
//! read sequence number and the mask of boards that should answer. Each
//! board then broadcasts its real-time block, and every board stores what it
//! sees in its hub buffer: one 32-quadlet section per board id, the first
//! quadlet of which echoes the sequence number and the data length.
//!
//! A broadcast write is one block write to every node; each board picks its
//! own part out of it by board id.

use crate::types::{BoardId, NodeAddr, Quadlet, MAX_BOARDS};

/// Target of the broadcast read request (quadlet write).
pub const READ_REQUEST_ADDR: NodeAddr = 0x1800;

/// Start of the hub buffer.
pub const HUB_BUFFER_ADDR: NodeAddr = 0x1000;

/// Quadlets per board in the hub buffer.
pub const SECTION_QUADS: usize = 32;

/// Longest real-time block a board can return through the hub.
pub const MAX_SECTION_DATA: usize = SECTION_QUADS - 1;

/// Target of the broadcast write (block write).
pub const WRITE_ADDR: NodeAddr = 0xffff_ffff_0000;

/// Quadlet written to [`READ_REQUEST_ADDR`].
pub fn read_request(sequence: u16, mask: u16) -> Quadlet {
    ((sequence as u32) << 16) | mask as u32
}

/// First quadlet of a hub section.
pub fn section_header(sequence: u16, quads: usize) -> Quadlet {
    ((sequence as u32) << 16) | (quads as u32 & 0xffff)
}

/// Quadlets of hub buffer covering every board in `mask`.
pub fn hub_quads(mask: u16) -> usize {
    let highest = MAX_BOARDS - mask.leading_zeros() as usize;
    highest * SECTION_QUADS
}

/// Section of board `id`, if `hub` covers it.
pub fn section(hub: &[Quadlet], id: BoardId) -> Option<&[Quadlet]> {
    let start = id.index() * SECTION_QUADS;
    hub.get(start..start + SECTION_QUADS)
}

pub fn section_sequence(section: &[Quadlet]) -> u16 {
    section.first().map_or(0, |&q| (q >> 16) as u16)
}

pub fn section_len(section: &[Quadlet]) -> usize {
    section.first().map_or(0, |&q| (q & 0xffff) as usize)
}

/// Whether every board in `mask` has stored data for `sequence`.
pub fn sections_ready(hub: &[Quadlet], mask: u16, sequence: u16) -> bool {
    BoardId::all()
        .filter(|id| mask & (1 << id.get()) != 0)
        .all(|id| section(hub, id).is_some_and(|s| section_sequence(s) == sequence))
}

/// Pack per-board write buffers into one broadcast write.
pub fn pack_write<'a>(entries: impl IntoIterator<Item = (BoardId, &'a [Quadlet])>) -> Vec<Quadlet> {
    let mut packed = Vec::new();
    for (id, data) in entries {
        packed.push(((id.get() as u32) << 24) | (data.len() as u32 & 0xffff));
        packed.extend_from_slice(data);
    }
    packed
}

/// Split a broadcast write into its per-board parts. Parsing stops at a
/// truncated part.
pub fn unpack_write(packed: &[Quadlet]) -> Vec<(u8, &[Quadlet])> {
    let mut parts = Vec::new();
    let mut rest = packed;
    while let Some((&header, tail)) = rest.split_first() {
        let id = (header >> 24) as u8;
        let len = (header & 0xffff) as usize;
        let Some(data) = tail.get(..len) else {
            break;
        };
        parts.push((id, data));
        rest = &tail[len..];
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> BoardId {
        BoardId::new(n).unwrap()
    }

    #[test]
    fn test_hub_quads() {
        assert_eq!(hub_quads(0), 0);
        assert_eq!(hub_quads(0b1), SECTION_QUADS);
        assert_eq!(hub_quads(0b1001), 4 * SECTION_QUADS);
        assert_eq!(hub_quads(0x8000), 16 * SECTION_QUADS);
    }

    #[test]
    fn test_sections_ready() {
        let mut hub = vec![0; hub_quads(0b101)];
        hub[0] = section_header(7, 4);
        assert!(!sections_ready(&hub, 0b101, 7));

        hub[2 * SECTION_QUADS] = section_header(7, 4);
        assert!(sections_ready(&hub, 0b101, 7));
        assert!(!sections_ready(&hub, 0b101, 8));
        // Board 1 is not in the mask and is never waited for
        assert_eq!(section_sequence(section(&hub, id(1)).unwrap()), 0);
        assert_eq!(section_len(section(&hub, id(2)).unwrap()), 4);

        // Sections beyond the buffer are never ready
        assert!(!sections_ready(&hub, 0b1000, 7));
    }

    #[test]
    fn test_pack_write() {
        let a = [1, 2];
        let b = [3];
        let packed = pack_write([(id(0), &a[..]), (id(5), &b[..])]);
        assert_eq!(packed, vec![0x0000_0002, 1, 2, 0x0500_0001, 3]);

        let parts = unpack_write(&packed);
        assert_eq!(parts, vec![(0, &a[..]), (5, &b[..])]);
    }

    #[test]
    fn test_unpack_truncated() {
        let packed = [0x0100_0001, 9, 0x0200_0003, 1];
        assert_eq!(unpack_write(&packed), vec![(1, &[9][..])]);
    }
}
