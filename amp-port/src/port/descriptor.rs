//! Port descriptors: the compact `-p` option naming a port.
//!
//! | descriptor     | transport     | port number |
//! |----------------|---------------|-------------|
//! | `fw<n>`        | FireWire      | n           |
//! | `eth<n>`       | raw Ethernet  | n           |
//! | `udp[<ip>]`    | UDP           | 0           |
//! | `<n>`          | FireWire      | n           |
//!
//! An optional `-p` prefix is stripped, so a command-line argument can be
//! passed as-is.

use std::fmt;

use crate::error::{Error, Result};
use crate::transport::PortType;

/// Characters that must follow `udp` for them to be taken as an address.
const MIN_IP_LEN: usize = 8;

/// Parsed port descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub port_type: PortType,
    pub port_num: u32,
    /// Bridge address, UDP only.
    pub ip: Option<String>,
}

impl PortDescriptor {
    pub fn parse(descriptor: &str) -> Result<Self> {
        let value = descriptor.strip_prefix("-p").unwrap_or(descriptor);
        let fail = || Error::Descriptor(descriptor.to_string());

        if let Some(rest) = value.strip_prefix("fw") {
            let port_num = parse_leading_number(rest).ok_or_else(fail)?;
            Ok(Self::numbered(PortType::Firewire, port_num))
        } else if let Some(rest) = value.strip_prefix("eth") {
            let port_num = parse_leading_number(rest).ok_or_else(fail)?;
            Ok(Self::numbered(PortType::EthRaw, port_num))
        } else if let Some(rest) = value.strip_prefix("udp") {
            Ok(Self {
                port_type: PortType::EthUdp,
                port_num: 0,
                ip: (rest.len() >= MIN_IP_LEN).then(|| rest.to_string()),
            })
        } else {
            let port_num = parse_leading_number(value).ok_or_else(fail)?;
            Ok(Self::numbered(PortType::Firewire, port_num))
        }
    }

    fn numbered(port_type: PortType, port_num: u32) -> Self {
        Self {
            port_type,
            port_num,
            ip: None,
        }
    }
}

impl fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port_type {
            PortType::Firewire => write!(f, "fw{}", self.port_num),
            PortType::EthRaw => write!(f, "eth{}", self.port_num),
            PortType::EthUdp => write!(f, "udp{}", self.ip.as_deref().unwrap_or("")),
        }
    }
}

/// Number at the start of `text`: leading whitespace and an optional `+`
/// are skipped, parsing stops at the first non-digit.
fn parse_leading_number(text: &str) -> Option<u32> {
    let text = text.trim_start();
    let text = text.strip_prefix('+').unwrap_or(text);
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("fw2", PortType::Firewire, 2, None; "firewire")]
    #[test_case("eth3", PortType::EthRaw, 3, None; "raw ethernet")]
    #[test_case("udp192.168.1.1", PortType::EthUdp, 0, Some("192.168.1.1"); "udp with address")]
    #[test_case("udp10.0.0.1", PortType::EthUdp, 0, Some("10.0.0.1"); "udp shortest address")]
    #[test_case("udp1.2.3.4", PortType::EthUdp, 0, None; "udp address too short")]
    #[test_case("udp", PortType::EthUdp, 0, None; "udp default address")]
    #[test_case("5", PortType::Firewire, 5, None; "legacy number")]
    #[test_case("  7", PortType::Firewire, 7, None; "legacy number with spaces")]
    #[test_case("-pfw1", PortType::Firewire, 1, None; "option prefix")]
    #[test_case("-pudp192.168.10.100", PortType::EthUdp, 0, Some("192.168.10.100"); "option prefix udp")]
    #[test_case("fw0trailing", PortType::Firewire, 0, None; "trailing text ignored")]
    fn test_parse(text: &str, port_type: PortType, port_num: u32, ip: Option<&str>) {
        let descriptor = PortDescriptor::parse(text).unwrap();
        assert_eq!(descriptor.port_type, port_type);
        assert_eq!(descriptor.port_num, port_num);
        assert_eq!(descriptor.ip.as_deref(), ip);
    }

    #[test_case("xyz"; "unknown tag")]
    #[test_case("fw"; "missing number")]
    #[test_case("eth-1"; "negative number")]
    #[test_case(""; "empty")]
    #[test_case("99999999999"; "overflow")]
    fn test_parse_failure(text: &str) {
        assert!(matches!(PortDescriptor::parse(text), Err(Error::Descriptor(_))));
    }

    #[test]
    fn test_display() {
        assert_eq!(PortDescriptor::parse("-peth4").unwrap().to_string(), "eth4");
        assert_eq!(PortDescriptor::parse("3").unwrap().to_string(), "fw3");
    }
}
