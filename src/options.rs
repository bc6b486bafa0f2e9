use std::net::Ipv4Addr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    HostName = 12,
    DomainName = 15,
    InterfaceMtu = 26,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    Message = 56,
    RenewalTime = 58,
    RebindingTime = 59,
    VendorClassId = 60,
    ClientIdentifier = 61,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::HostName),
            15 => Ok(Self::DomainName),
            26 => Ok(Self::InterfaceMtu),
            28 => Ok(Self::BroadcastAddress),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            56 => Ok(Self::Message),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            60 => Ok(Self::VendorClassId),
            61 => Ok(Self::ClientIdentifier),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    HostName(String),
    DomainName(String),
    InterfaceMtu(u16),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    Message(String),
    RenewalTime(u32),
    RebindingTime(u32),
    VendorClassId(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn addr_from(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    if data.len() != 4 {
        return Err(Error::InvalidPacket(format!("Invalid {} length", what)));
    }
    Ok(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn addr_list_from(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.len() % 4 != 0 || data.is_empty() {
        return Err(Error::InvalidPacket(format!("Invalid {} length", what)));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn u32_from(data: &[u8], what: &str) -> Result<u32> {
    if data.len() != 4 {
        return Err(Error::InvalidPacket(format!("Invalid {} length", what)));
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

impl DhcpOption {
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => {
                Ok(Self::SubnetMask(addr_from(data, "subnet mask")?))
            }
            Ok(OptionCode::Router) => {
                Ok(Self::Router(addr_list_from(data, "router option")?))
            }
            Ok(OptionCode::DnsServer) => {
                Ok(Self::DnsServer(addr_list_from(data, "DNS server option")?))
            }
            Ok(OptionCode::HostName) => {
                Ok(Self::HostName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::DomainName) => {
                Ok(Self::DomainName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::InterfaceMtu) => {
                if data.len() != 2 {
                    return Err(Error::InvalidPacket("Invalid MTU length".to_string()));
                }
                Ok(Self::InterfaceMtu(u16::from_be_bytes([data[0], data[1]])))
            }
            Ok(OptionCode::BroadcastAddress) => {
                Ok(Self::BroadcastAddress(addr_from(data, "broadcast address")?))
            }
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(addr_from(
                data,
                "requested IP address",
            )?)),
            Ok(OptionCode::LeaseTime) => Ok(Self::LeaseTime(u32_from(data, "lease time")?)),
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                }
                let msg_type = MessageType::try_from(data[0]).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(msg_type))
            }
            Ok(OptionCode::ServerIdentifier) => {
                Ok(Self::ServerIdentifier(addr_from(data, "server identifier")?))
            }
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::Message) => {
                Ok(Self::Message(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::RenewalTime) => Ok(Self::RenewalTime(u32_from(data, "renewal time")?)),
            Ok(OptionCode::RebindingTime) => {
                Ok(Self::RebindingTime(u32_from(data, "rebinding time")?))
            }
            Ok(OptionCode::VendorClassId) => Ok(Self::VendorClassId(data.to_vec())),
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::InvalidPacket(
                "Pad/End should not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::HostName(_) => OptionCode::HostName as u8,
            Self::DomainName(_) => OptionCode::DomainName as u8,
            Self::InterfaceMtu(_) => OptionCode::InterfaceMtu as u8,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::Message(_) => OptionCode::Message as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::VendorClassId(_) => OptionCode::VendorClassId as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => {
                let mut result = vec![self.code(), 4];
                result.extend_from_slice(&addr.octets());
                result
            }
            Self::Router(addrs) | Self::DnsServer(addrs) => {
                let mut result = vec![self.code(), (addrs.len() * 4) as u8];
                for addr in addrs {
                    result.extend_from_slice(&addr.octets());
                }
                result
            }
            Self::HostName(text) | Self::DomainName(text) | Self::Message(text) => {
                let bytes = text.as_bytes();
                let mut result = vec![self.code(), bytes.len() as u8];
                result.extend_from_slice(bytes);
                result
            }
            Self::InterfaceMtu(mtu) => {
                let mut result = vec![self.code(), 2];
                result.extend_from_slice(&mtu.to_be_bytes());
                result
            }
            Self::LeaseTime(time) | Self::RenewalTime(time) | Self::RebindingTime(time) => {
                let mut result = vec![self.code(), 4];
                result.extend_from_slice(&time.to_be_bytes());
                result
            }
            Self::MessageType(msg_type) => {
                vec![self.code(), 1, *msg_type as u8]
            }
            Self::ParameterRequestList(data)
            | Self::VendorClassId(data)
            | Self::ClientIdentifier(data) => {
                let mut result = vec![self.code(), data.len() as u8];
                result.extend_from_slice(data);
                result
            }
            Self::Unknown(code, data) => {
                let mut result = vec![*code, data.len() as u8];
                result.extend_from_slice(data);
                result
            }
        }
    }
}

/// Selects the subset of `defaults` whose tag appears in the client's
/// parameter request list, in request order. Repeated tags are served once;
/// tags with no matching default are skipped.
pub fn options_from_parameter_requests(preqs: &[u8], defaults: &[DhcpOption]) -> Vec<DhcpOption> {
    let mut selected: Vec<DhcpOption> = Vec::new();
    for &code in preqs {
        if selected.iter().any(|option| option.code() == code) {
            continue;
        }
        if let Some(option) = defaults.iter().find(|option| option.code() == code) {
            selected.push(option.clone());
        }
    }
    selected
}
