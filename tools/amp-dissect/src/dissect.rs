//! Frame dissection engine.

use amp_port::transport::eth::mac::MacAddr;
use amp_port::transport::eth::packet::{RequestFrame, ResponseFrame};
use amp_port::Error;
use colored::Colorize;
use std::fmt;

/// Which way a captured frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToBridge,
    BridgeToHost,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::HostToBridge => write!(f, "{}", "TX".cyan()),
            Direction::BridgeToHost => write!(f, "{}", "RX".yellow()),
        }
    }
}

/// Dissected frame with decoded content
#[derive(Debug)]
pub struct DissectedFrame {
    pub line: usize,
    pub timestamp: Option<f64>,
    pub direction: Direction,
    pub raw_data: Vec<u8>,
    pub content: FrameContent,
    pub crc_status: CrcStatus,
}

impl DissectedFrame {
    pub fn is_invalid(&self) -> bool {
        matches!(self.content, FrameContent::Invalid(_))
    }
}

impl fmt::Display for DissectedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.timestamp {
            Some(t) => write!(f, "{:>12.6} ", t)?,
            None => write!(f, "{:>12} ", format!("#{}", self.line))?,
        }
        write!(f, "{} ", self.direction)?;
        match &self.content {
            FrameContent::Request(request) => {
                write!(f, "{}", request)?;
                // Sent to every board, so raw Ethernet used the multicast address
                if request.request.node().is_broadcast() {
                    write!(f, " dst={}", MacAddr::multicast())?;
                }
            }
            FrameContent::Response(response) => write!(f, "{}", response)?,
            FrameContent::Invalid(reason) => {
                write!(f, "{} [{}]", reason.red(), hex::encode(&self.raw_data))?
            }
        }
        if self.crc_status != CrcStatus::NotChecked {
            write!(f, " {}", self.crc_status)?;
        }
        Ok(())
    }
}

/// Decoded frame content
#[derive(Debug)]
pub enum FrameContent {
    Request(RequestFrame),
    Response(ResponseFrame),
    Invalid(String),
}

/// CRC validation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcStatus {
    Valid,
    Invalid,
    NotChecked,
}

impl fmt::Display for CrcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrcStatus::Valid => write!(f, "{}", "CRC OK".green()),
            CrcStatus::Invalid => write!(f, "{}", "CRC FAIL".red()),
            CrcStatus::NotChecked => write!(f, ""),
        }
    }
}

/// Dissect one capture line: `[timestamp] tx|rx <hex>`.
///
/// Blank lines and `#` comments yield `None`. Lines that cannot be split
/// into a direction and a payload come back as invalid frames.
pub fn dissect_line(line_number: usize, line: &str) -> Option<DissectedFrame> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split_whitespace().collect::<Vec<_>>();
    let timestamp = fields.first().and_then(|f| f.parse::<f64>().ok());
    if timestamp.is_some() {
        fields.remove(0);
    }

    let invalid = |direction, reason: String| DissectedFrame {
        line: line_number,
        timestamp,
        direction,
        raw_data: Vec::new(),
        content: FrameContent::Invalid(reason),
        crc_status: CrcStatus::NotChecked,
    };

    let direction = match fields.first().map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("tx") => Direction::HostToBridge,
        Some("rx") => Direction::BridgeToHost,
        other => {
            return Some(invalid(
                Direction::HostToBridge,
                format!("Unknown direction {:?}", other.unwrap_or("")),
            ))
        }
    };
    let payload: String = fields[1..].concat();
    let data = match hex::decode(&payload) {
        Ok(data) => data,
        Err(e) => return Some(invalid(direction, format!("Bad hex: {}", e))),
    };
    Some(dissect_frame(line_number, timestamp, direction, data))
}

/// Dissect a captured frame using main library types
pub fn dissect_frame(
    line: usize,
    timestamp: Option<f64>,
    direction: Direction,
    raw_data: Vec<u8>,
) -> DissectedFrame {
    let parsed = match direction {
        Direction::HostToBridge => RequestFrame::parse(&raw_data).map(FrameContent::Request),
        Direction::BridgeToHost => ResponseFrame::parse(&raw_data).map(FrameContent::Response),
    };
    let (content, crc_status) = match parsed {
        Ok(content) => (content, CrcStatus::Valid),
        Err(e @ Error::Crc { .. }) => (FrameContent::Invalid(format!("{}", e)), CrcStatus::Invalid),
        Err(e) => (
            FrameContent::Invalid(format!("Parse error: {}", e)),
            CrcStatus::NotChecked,
        ),
    };

    DissectedFrame {
        line,
        timestamp,
        direction,
        raw_data,
        content,
        crc_status,
    }
}
