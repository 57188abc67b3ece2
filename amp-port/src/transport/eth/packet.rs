//! FireWire packets carried over Ethernet and UDP.
//!
//! Requests sent to the bridge board are a 2-byte control word followed by an
//! IEEE-1394 asynchronous packet. Responses from the bridge are the 1394
//! response packet followed by 8 bytes of FPGA diagnostics. All quadlets are
//! big-endian.
//!
//! ```text
//! quadlet 0   dest id (16) | tl (6) | rt (2) | tcode (4) | pri (4)
//! quadlet 1   src id (16)  | dest offset 47:32 (16)    requests
//!             src id (16)  | rcode (4) | reserved (12) responses
//! quadlet 2   dest offset 31:0                         (reserved in responses)
//! quadlet 3   data (quadlet write / response) or data length (16) | ext tcode (16)
//! ```
//!
//! Quadlet read requests end after a header CRC at quadlet 3. Every other
//! packet carries its header CRC at quadlet 4; block packets follow it with
//! the data and a data CRC.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use bitvec::prelude::*;
use bytes::{BufMut, BytesMut};

use super::crc::{check_crc, packet_crc};
use crate::error::{Error, Result};
use crate::types::{NodeAddr, NodeId, Quadlet};

/// Bytes in a quadlet read request packet.
pub const QREAD_SIZE: usize = 16;
/// Bytes in a quadlet write request packet.
pub const QWRITE_SIZE: usize = 20;
/// Bytes in a quadlet read response packet.
pub const QRESPONSE_SIZE: usize = 20;
/// Bytes in a block read request packet.
pub const BREAD_SIZE: usize = 20;
/// Bytes in a block read response header, including the header CRC.
pub const BRESPONSE_HEADER_SIZE: usize = 20;
/// Bytes in a block write header, including the header CRC.
pub const BWRITE_HEADER_SIZE: usize = 20;
/// Bytes in a CRC trailer.
pub const CRC_SIZE: usize = 4;
/// Bytes in the control word preceding each request.
pub const CTRL_SIZE: usize = 2;
/// Diagnostic bytes following each response.
pub const EXTRA_SIZE: usize = 8;

/// Source id the host puts in requests; it is not a node on the bus.
pub const HOST_BUS_ID: u16 = 0xffff;

/// Response code of a completed transaction.
pub const RCODE_COMPLETE: u8 = 0;

/// FPGA system clock, used to convert the diagnostic tick counts.
pub const FPGA_SYSCLK_HZ: f64 = 49.152e6;

bitflags! {
    /// First byte of the control word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlFlags: u8 {
        /// Prevent forwarding by the Ethernet/FireWire bridge.
        const NOFORWARD = 0x01;
    }
}

bitflags! {
    /// Flag byte of the response diagnostics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtraFlags: u8 {
        /// FireWire bus reset in progress on the FPGA side.
        const BUS_RESET = 0x01;
    }
}

bitflags! {
    /// Ethernet status word the FPGA reports with each response.
    ///
    /// The low nibble is not a flag: it holds the state the FPGA was waiting
    /// in, see [`FpgaStatus::wait_state`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FpgaStatus: u16 {
        const FRAME_ERROR = 0x4000;
        const IPV4_ERROR = 0x2000;
        const UDP_ERROR = 0x1000;
        const DEST_ERROR = 0x0800;
        const ACCESS_ERROR = 0x0400;
        const STATE_ERROR = 0x0200;
        const ETH_STATE_ERROR = 0x0100;
        /// Request arrived over UDP rather than raw Ethernet.
        const UDP = 0x0080;
        const LINK_ON = 0x0040;
        const ETH_IDLE = 0x0020;

        const ERRORS = Self::FRAME_ERROR.bits()
            | Self::IPV4_ERROR.bits()
            | Self::UDP_ERROR.bits()
            | Self::DEST_ERROR.bits()
            | Self::ACCESS_ERROR.bits()
            | Self::STATE_ERROR.bits()
            | Self::ETH_STATE_ERROR.bits();
    }
}

impl FpgaStatus {
    const WAIT_STATE_MASK: u16 = 0x000f;

    pub fn has_errors(&self) -> bool {
        self.intersects(FpgaStatus::ERRORS)
    }

    pub fn wait_state(&self) -> u8 {
        (self.bits() & Self::WAIT_STATE_MASK) as u8
    }
}

impl fmt::Display for FpgaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(FpgaStatus, &str); 10] = [
            (FpgaStatus::FRAME_ERROR, "FrameErr"),
            (FpgaStatus::IPV4_ERROR, "IPv4Err"),
            (FpgaStatus::UDP_ERROR, "UDPErr"),
            (FpgaStatus::DEST_ERROR, "DestErr"),
            (FpgaStatus::ACCESS_ERROR, "AccessErr"),
            (FpgaStatus::STATE_ERROR, "StateErr"),
            (FpgaStatus::ETH_STATE_ERROR, "EthStateErr"),
            (FpgaStatus::UDP, "UDP"),
            (FpgaStatus::LINK_ON, "Link-On"),
            (FpgaStatus::ETH_IDLE, "ETH-idle"),
        ];
        for (flag, name) in NAMES {
            if self.contains(flag) {
                write!(f, "{} ", name)?;
            }
        }
        write!(f, "wait={}", self.wait_state())
    }
}

/// FireWire transaction code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum TCode {
    #[strum(to_string = "QWRITE")]
    QWrite = 0,
    #[strum(to_string = "BWRITE")]
    BWrite = 1,
    #[strum(to_string = "QREAD")]
    QRead = 4,
    #[strum(to_string = "BREAD")]
    BRead = 5,
    #[strum(to_string = "QRESPONSE")]
    QResponse = 6,
    #[strum(to_string = "BRESPONSE")]
    BResponse = 7,
}

impl TCode {
    /// Header bytes, including the header CRC.
    pub fn header_size(self) -> usize {
        match self {
            TCode::QRead => QREAD_SIZE,
            TCode::QWrite => QWRITE_SIZE,
            TCode::QResponse => QRESPONSE_SIZE,
            TCode::BRead => BREAD_SIZE,
            TCode::BWrite => BWRITE_HEADER_SIZE,
            TCode::BResponse => BRESPONSE_HEADER_SIZE,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, TCode::QResponse | TCode::BResponse)
    }

    /// Whether a data block and data CRC follow the header.
    pub fn has_data_block(self) -> bool {
        matches!(self, TCode::BWrite | TCode::BResponse)
    }
}

struct HeaderWordBuilder {
    word: u32,
}

impl HeaderWordBuilder {
    fn new() -> Self {
        Self { word: 0 }
    }

    fn with_destination(mut self, bus_id: u16) -> Self {
        let view = self.word.view_bits_mut::<Lsb0>();
        view[16..32].store(bus_id);
        self
    }

    fn with_label(mut self, label: u8) -> Self {
        let view = self.word.view_bits_mut::<Lsb0>();
        view[10..16].store(label & 0x3f);
        self
    }

    fn with_tcode(mut self, tcode: TCode) -> Self {
        let view = self.word.view_bits_mut::<Lsb0>();
        view[4..8].store(tcode as u8);
        self
    }

    fn build(self) -> u32 {
        self.word
    }
}

fn quadlet_at(bytes: &[u8], index: usize) -> u32 {
    let i = index * 4;
    u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
}

fn put_crc(dst: &mut BytesMut, from: usize) {
    let crc = packet_crc(&dst[from..]);
    dst.put_u32(crc);
}

/// Decoded first three header quadlets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub destination: u16,
    pub label: u8,
    pub tcode: u8,
    pub source: u16,
    /// Destination offset 47:32 for requests, rcode word for responses.
    pub word1_low: u16,
    pub offset_low: u32,
}

impl PacketHeader {
    /// Decode the header; `packet` must hold at least 12 bytes.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < 12 {
            return Err(Error::ShortFrame {
                expected: 12,
                actual: packet.len(),
            });
        }
        let q0 = quadlet_at(packet, 0);
        let q1 = quadlet_at(packet, 1);
        let bits = q0.view_bits::<Lsb0>();
        Ok(Self {
            destination: bits[16..32].load::<u16>(),
            label: bits[10..16].load::<u8>(),
            tcode: bits[4..8].load::<u8>(),
            source: (q1 >> 16) as u16,
            word1_low: (q1 & 0xffff) as u16,
            offset_low: quadlet_at(packet, 2),
        })
    }

    pub fn tcode(&self) -> Option<TCode> {
        TCode::from_repr(self.tcode)
    }

    pub fn address(&self) -> NodeAddr {
        ((self.word1_low as u64) << 32) | self.offset_low as u64
    }

    pub fn rcode(&self) -> u8 {
        (self.word1_low >> 12) as u8
    }

    /// Node the packet concerns: the target of a request, the sender of a
    /// response.
    pub fn remote_node(&self) -> u8 {
        let bus_id = match self.tcode() {
            Some(tcode) if tcode.is_response() => self.source,
            _ => self.destination,
        };
        (bus_id & NodeId::MASK) as u8
    }
}

/// Builds request frames (control word + 1394 packet).
#[derive(Debug, Clone, Copy)]
pub struct RequestBuilder {
    flags: ControlFlags,
    epoch: u8,
}

impl RequestBuilder {
    pub fn new(epoch: u8) -> Self {
        Self {
            flags: ControlFlags::empty(),
            epoch,
        }
    }

    pub fn with_flags(mut self, flags: ControlFlags) -> Self {
        self.flags = flags;
        self
    }

    fn start(&self, capacity: usize, node: NodeId, addr: NodeAddr, tcode: TCode, tl: u8) -> BytesMut {
        let mut dst = BytesMut::with_capacity(CTRL_SIZE + capacity);
        dst.put_u8(self.flags.bits());
        dst.put_u8(self.epoch);
        let q0 = HeaderWordBuilder::new()
            .with_destination(node.bus_id())
            .with_label(tl)
            .with_tcode(tcode)
            .build();
        dst.put_u32(q0);
        dst.put_u32(((HOST_BUS_ID as u32) << 16) | ((addr >> 32) & 0xffff) as u32);
        dst.put_u32((addr & 0xffff_ffff) as u32);
        dst
    }

    pub fn quadlet_read(&self, node: NodeId, addr: NodeAddr, tl: u8) -> BytesMut {
        let mut dst = self.start(QREAD_SIZE, node, addr, TCode::QRead, tl);
        put_crc(&mut dst, CTRL_SIZE);
        dst
    }

    pub fn quadlet_write(&self, node: NodeId, addr: NodeAddr, data: Quadlet, tl: u8) -> BytesMut {
        let mut dst = self.start(QWRITE_SIZE, node, addr, TCode::QWrite, tl);
        dst.put_u32(data);
        put_crc(&mut dst, CTRL_SIZE);
        dst
    }

    pub fn block_read(&self, node: NodeId, addr: NodeAddr, nbytes: u16, tl: u8) -> BytesMut {
        let mut dst = self.start(BREAD_SIZE, node, addr, TCode::BRead, tl);
        dst.put_u32((nbytes as u32) << 16);
        put_crc(&mut dst, CTRL_SIZE);
        dst
    }

    pub fn block_write(&self, node: NodeId, addr: NodeAddr, data: &[Quadlet], tl: u8) -> BytesMut {
        let nbytes = data.len() * 4;
        let mut dst = self.start(BWRITE_HEADER_SIZE + nbytes + CRC_SIZE, node, addr, TCode::BWrite, tl);
        dst.put_u32((nbytes as u32) << 16);
        put_crc(&mut dst, CTRL_SIZE);
        let data_start = dst.len();
        for &quadlet in data {
            dst.put_u32(quadlet);
        }
        put_crc(&mut dst, data_start);
        dst
    }
}

/// 8 bytes of FPGA diagnostics appended to each response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtraData {
    pub flags: ExtraFlags,
    /// FireWire bus generation on the FPGA.
    pub epoch: u8,
    pub fpga_status: FpgaStatus,
    /// Clock ticks the FPGA took to receive the request.
    pub receive_ticks: u16,
    /// Clock ticks from start of reception until the response was queued.
    pub total_ticks: u16,
}

impl ExtraData {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < EXTRA_SIZE {
            return Err(Error::ShortFrame {
                expected: EXTRA_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            flags: ExtraFlags::from_bits_retain(bytes[0]),
            epoch: bytes[1],
            fpga_status: FpgaStatus::from_bits_retain(u16::from_be_bytes([bytes[2], bytes[3]])),
            receive_ticks: u16::from_be_bytes([bytes[4], bytes[5]]),
            total_ticks: u16::from_be_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.flags.bits());
        dst.put_u8(self.epoch);
        dst.put_u16(self.fpga_status.bits());
        dst.put_u16(self.receive_ticks);
        dst.put_u16(self.total_ticks);
    }

    pub fn bus_reset_active(&self) -> bool {
        self.flags.contains(ExtraFlags::BUS_RESET)
    }

    pub fn receive_time(&self) -> Duration {
        Duration::from_secs_f64(self.receive_ticks as f64 / FPGA_SYSCLK_HZ)
    }

    pub fn total_time(&self) -> Duration {
        Duration::from_secs_f64(self.total_ticks as f64 / FPGA_SYSCLK_HZ)
    }
}

fn response_start(capacity: usize, src: NodeId, tl: u8, tcode: TCode, rcode: u8) -> BytesMut {
    let mut dst = BytesMut::with_capacity(capacity + EXTRA_SIZE);
    let q0 = HeaderWordBuilder::new()
        .with_destination(HOST_BUS_ID)
        .with_label(tl)
        .with_tcode(tcode)
        .build();
    dst.put_u32(q0);
    dst.put_u32(((src.bus_id() as u32) << 16) | (((rcode & 0x0f) as u32) << 12));
    dst.put_u32(0);
    dst
}

/// Quadlet read response packet as sent by a board (without diagnostics).
pub fn quadlet_response(src: NodeId, tl: u8, data: Quadlet, rcode: u8) -> BytesMut {
    let mut dst = response_start(QRESPONSE_SIZE, src, tl, TCode::QResponse, rcode);
    dst.put_u32(data);
    put_crc(&mut dst, 0);
    dst
}

/// Block read response packet as sent by a board (without diagnostics).
pub fn block_response(src: NodeId, tl: u8, data: &[Quadlet], rcode: u8) -> BytesMut {
    let nbytes = data.len() * 4;
    let mut dst = response_start(
        BRESPONSE_HEADER_SIZE + nbytes + CRC_SIZE,
        src,
        tl,
        TCode::BResponse,
        rcode,
    );
    dst.put_u32((nbytes as u32) << 16);
    put_crc(&mut dst, 0);
    for &quadlet in data {
        dst.put_u32(quadlet);
    }
    put_crc(&mut dst, BRESPONSE_HEADER_SIZE);
    dst
}

/// Verify the CRCs of a packet whose header, header CRC included, spans
/// `header_size` bytes. Returns the number of bytes the packet occupies.
fn verify_crcs(packet: &[u8], header_size: usize, has_data_block: bool) -> Result<usize> {
    if packet.len() < header_size {
        return Err(Error::ShortFrame {
            expected: header_size,
            actual: packet.len(),
        });
    }
    let crc_at = header_size - CRC_SIZE;
    check_crc(&packet[..crc_at], &packet[crc_at..header_size])
        .map_err(|(computed, received)| Error::Crc { computed, received })?;

    if !has_data_block {
        return Ok(header_size);
    }
    let nbytes = (quadlet_at(packet, 3) >> 16) as usize;
    let total = header_size + nbytes + CRC_SIZE;
    if packet.len() < total {
        return Err(Error::ShortFrame {
            expected: total,
            actual: packet.len(),
        });
    }
    check_crc(&packet[header_size..header_size + nbytes], &packet[header_size + nbytes..total])
        .map_err(|(computed, received)| Error::Crc { computed, received })?;
    Ok(total)
}

/// Verify a packet of unknown type; returns its header and the number of
/// bytes the packet occupies.
///
/// The transaction code sits inside the CRC-covered header, so it is only
/// trusted once a header CRC has been found at one of the two possible
/// header sizes.
fn check_integrity(packet: &[u8]) -> Result<(PacketHeader, usize)> {
    let header = PacketHeader::parse(packet)?;
    let mut found = verify_crcs(packet, QREAD_SIZE, false);
    if found.is_err() && packet.len() >= QWRITE_SIZE {
        found = verify_crcs(packet, QWRITE_SIZE, false);
    }
    let header_size = found?;

    let tcode = header
        .tcode()
        .ok_or_else(|| Error::Protocol(format!("unknown tcode {}", header.tcode)))?;
    if tcode.header_size() != header_size {
        return Err(Error::Protocol(format!(
            "{} packet with a {}-byte header",
            tcode, header_size
        )));
    }
    let used = verify_crcs(packet, header_size, tcode.has_data_block())?;
    Ok((header, used))
}

/// Check a 1394 packet against the transaction it should belong to.
///
/// The CRCs are verified at the layout of the expected `tcode` before any
/// header field is compared. Then the transaction code, transaction label
/// and remote node (target of a request, sender of a response) must match.
/// A broadcast `node` accepts any remote node.
pub fn check_packet(packet: &[u8], node: NodeId, tcode: TCode, tl: u8) -> Result<PacketHeader> {
    verify_crcs(packet, tcode.header_size(), tcode.has_data_block())?;
    let header = PacketHeader::parse(packet)?;
    if header.tcode != tcode as u8 {
        return Err(Error::TcodeMismatch {
            expected: tcode as u8,
            actual: header.tcode,
        });
    }
    if header.label != tl {
        return Err(Error::LabelMismatch {
            expected: tl,
            actual: header.label,
        });
    }
    let remote = header.remote_node();
    if !node.is_broadcast() && remote != node.get() {
        return Err(Error::NodeMismatch {
            expected: node,
            actual: remote,
        });
    }
    Ok(header)
}

fn check_rcode(header: &PacketHeader) -> Result<()> {
    match header.rcode() {
        RCODE_COMPLETE => Ok(()),
        rcode => Err(Error::ResponseCode(rcode)),
    }
}

/// Validate a quadlet read response frame and extract its data.
pub fn parse_quadlet_response(frame: &[u8], node: NodeId, tl: u8) -> Result<(Quadlet, ExtraData)> {
    let header = check_packet(frame, node, TCode::QResponse, tl)?;
    check_rcode(&header)?;
    let data = quadlet_at(frame, 3);
    let extra = ExtraData::decode(&frame[QRESPONSE_SIZE..])?;
    Ok((data, extra))
}

/// Validate a block read response frame, copying its data into `out`.
pub fn parse_block_response(frame: &[u8], node: NodeId, tl: u8, out: &mut [Quadlet]) -> Result<ExtraData> {
    let header = check_packet(frame, node, TCode::BResponse, tl)?;
    check_rcode(&header)?;
    let nbytes = (quadlet_at(frame, 3) >> 16) as usize;
    if nbytes != out.len() * 4 {
        return Err(Error::LengthMismatch {
            expected: out.len() * 4,
            actual: nbytes,
        });
    }
    let data = &frame[BRESPONSE_HEADER_SIZE..BRESPONSE_HEADER_SIZE + nbytes];
    for (i, quadlet) in out.iter_mut().enumerate() {
        *quadlet = quadlet_at(data, i);
    }
    let extra_at = BRESPONSE_HEADER_SIZE + nbytes + CRC_SIZE;
    ExtraData::decode(&frame[extra_at..])
}

/// Decoded request, as the bridge sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    QuadletRead { node: NodeId, addr: NodeAddr, tl: u8 },
    QuadletWrite { node: NodeId, addr: NodeAddr, data: Quadlet, tl: u8 },
    BlockRead { node: NodeId, addr: NodeAddr, nbytes: u16, tl: u8 },
    BlockWrite { node: NodeId, addr: NodeAddr, data: Vec<Quadlet>, tl: u8 },
}

impl Request {
    pub fn node(&self) -> NodeId {
        match self {
            Request::QuadletRead { node, .. }
            | Request::QuadletWrite { node, .. }
            | Request::BlockRead { node, .. }
            | Request::BlockWrite { node, .. } => *node,
        }
    }

    pub fn label(&self) -> u8 {
        match self {
            Request::QuadletRead { tl, .. }
            | Request::QuadletWrite { tl, .. }
            | Request::BlockRead { tl, .. }
            | Request::BlockWrite { tl, .. } => *tl,
        }
    }
}

/// Request frame with its control word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub flags: ControlFlags,
    pub epoch: u8,
    pub request: Request,
}

impl RequestFrame {
    /// Decode and integrity-check a request frame.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < CTRL_SIZE {
            return Err(Error::ShortFrame {
                expected: CTRL_SIZE,
                actual: frame.len(),
            });
        }
        let packet = &frame[CTRL_SIZE..];
        let (header, _) = check_integrity(packet)?;
        let node = NodeId::from_bus_id(header.destination);
        let addr = header.address();
        let tl = header.label;
        let request = match header.tcode() {
            Some(TCode::QRead) => Request::QuadletRead { node, addr, tl },
            Some(TCode::QWrite) => Request::QuadletWrite {
                node,
                addr,
                data: quadlet_at(packet, 3),
                tl,
            },
            Some(TCode::BRead) => Request::BlockRead {
                node,
                addr,
                nbytes: (quadlet_at(packet, 3) >> 16) as u16,
                tl,
            },
            Some(TCode::BWrite) => {
                let nbytes = (quadlet_at(packet, 3) >> 16) as usize;
                let data = &packet[BWRITE_HEADER_SIZE..BWRITE_HEADER_SIZE + nbytes];
                Request::BlockWrite {
                    node,
                    addr,
                    data: (0..nbytes / 4).map(|i| quadlet_at(data, i)).collect(),
                    tl,
                }
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "tcode {} is not a request",
                    header.tcode
                )))
            }
        };
        Ok(Self {
            flags: ControlFlags::from_bits_retain(frame[0]),
            epoch: frame[1],
            request,
        })
    }
}

impl fmt::Display for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request {
            Request::QuadletRead { node, addr, tl } => {
                write!(f, "QREAD node={} addr={:#014x} tl={}", node, addr, tl)?
            }
            Request::QuadletWrite { node, addr, data, tl } => write!(
                f,
                "QWRITE node={} addr={:#014x} data={:#010x} tl={}",
                node, addr, data, tl
            )?,
            Request::BlockRead { node, addr, nbytes, tl } => write!(
                f,
                "BREAD node={} addr={:#014x} len={} tl={}",
                node, addr, nbytes, tl
            )?,
            Request::BlockWrite { node, addr, data, tl } => write!(
                f,
                "BWRITE node={} addr={:#014x} len={} tl={} data={}",
                node,
                addr,
                data.len() * 4,
                tl,
                dump_quadlets(data)
            )?,
        }
        write!(f, " gen={}", self.epoch)?;
        if self.flags.contains(ControlFlags::NOFORWARD) {
            write!(f, " noforward")?;
        }
        Ok(())
    }
}

/// Decoded response, as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Quadlet { node: NodeId, tl: u8, rcode: u8, data: Quadlet },
    Block { node: NodeId, tl: u8, rcode: u8, data: Vec<Quadlet> },
}

impl Response {
    pub fn label(&self) -> u8 {
        match self {
            Response::Quadlet { tl, .. } | Response::Block { tl, .. } => *tl,
        }
    }
}

/// Response frame with its diagnostics (absent if the frame was truncated).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub response: Response,
    pub extra: Option<ExtraData>,
}

impl ResponseFrame {
    /// Decode and integrity-check a response frame.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let (header, used) = check_integrity(frame)?;
        let node = NodeId::from_bus_id(header.source);
        let tl = header.label;
        let rcode = header.rcode();
        let response = match header.tcode() {
            Some(TCode::QResponse) => Response::Quadlet {
                node,
                tl,
                rcode,
                data: quadlet_at(frame, 3),
            },
            Some(TCode::BResponse) => {
                let nbytes = (quadlet_at(frame, 3) >> 16) as usize;
                let data = &frame[BRESPONSE_HEADER_SIZE..BRESPONSE_HEADER_SIZE + nbytes];
                Response::Block {
                    node,
                    tl,
                    rcode,
                    data: (0..nbytes / 4).map(|i| quadlet_at(data, i)).collect(),
                }
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "tcode {} is not a response",
                    header.tcode
                )))
            }
        };
        Ok(Self {
            response,
            extra: ExtraData::decode(&frame[used..]).ok(),
        })
    }
}

impl fmt::Display for ResponseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.response {
            Response::Quadlet { node, tl, rcode, data } => write!(
                f,
                "QRESPONSE node={} tl={} rcode={} data={:#010x}",
                node, tl, rcode, data
            )?,
            Response::Block { node, tl, rcode, data } => write!(
                f,
                "BRESPONSE node={} tl={} rcode={} len={} data={}",
                node,
                tl,
                rcode,
                data.len() * 4,
                dump_quadlets(data)
            )?,
        }
        if let Some(extra) = &self.extra {
            write!(
                f,
                " gen={} recv={:.2}us total={:.2}us",
                extra.epoch,
                extra.receive_time().as_secs_f64() * 1e6,
                extra.total_time().as_secs_f64() * 1e6
            )?;
            if extra.fpga_status.has_errors() {
                write!(f, " status=[{}]", extra.fpga_status)?;
            }
            if extra.bus_reset_active() {
                write!(f, " bus-reset")?;
            }
        }
        Ok(())
    }
}

/// Space-separated hex dump of quadlets.
pub fn dump_quadlets(data: &[Quadlet]) -> String {
    data.iter()
        .map(|q| hex::encode(q.to_be_bytes()))
        .collect::<Vec<String>>()
        .join(" ")
}
