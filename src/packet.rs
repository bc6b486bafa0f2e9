use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

const BROADCAST_FLAG: u16 = 0x8000;
const IP_TTL: u8 = 128;

// The fixed BOOTP header runs up to the magic cookie; options follow it.
const OPTIONS_OFFSET: usize = 240;
// BOOTP floor: payloads are padded out to 300 bytes.
const MIN_PAYLOAD_LEN: usize = 300;

fn be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn ipv4(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

/// A DHCP message plus the transport envelope it arrived in (or should leave
/// in). The envelope fields are only meaningful on packets produced by
/// [`DhcpPacket::parse_frame`] or destined for [`DhcpPacket::encode_frame`];
/// the payload-level codec zeroes them.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,

    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl DhcpPacket {
    /// Parses a bare DHCP payload (UDP payload, lower layers stripped).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(cookie) = data.get(OPTIONS_OFFSET - 4..OPTIONS_OFFSET) else {
            return Err(Error::InvalidPacket(format!(
                "Payload too short for a BOOTP header: {} bytes",
                data.len()
            )));
        };
        if cookie != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket(
                "Missing DHCP magic cookie".to_string(),
            ));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: be32(data, 4),
            secs: be16(data, 8),
            flags: be16(data, 10),
            ciaddr: ipv4(data, 12),
            yiaddr: ipv4(data, 16),
            siaddr: ipv4(data, 20),
            giaddr: ipv4(data, 24),
            chaddr,
            sname,
            file,
            options: Self::parse_options(&data[OPTIONS_OFFSET..])?,
            src_mac: [0u8; 6],
            dst_mac: [0u8; 6],
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_port: 0,
        })
    }

    fn parse_options(mut data: &[u8]) -> Result<Vec<DhcpOption>> {
        let mut options = Vec::new();

        while let [code, rest @ ..] = data {
            match *code {
                0 => data = rest, // pad
                255 => break,     // end
                code => {
                    let [len, rest @ ..] = rest else {
                        return Err(Error::InvalidPacket(format!(
                            "Option {} is missing its length byte",
                            code
                        )));
                    };
                    let len = usize::from(*len);
                    if rest.len() < len {
                        return Err(Error::InvalidPacket(format!(
                            "Option {} runs past the end of the packet",
                            code
                        )));
                    }
                    let (value, tail) = rest.split_at(len);
                    options.push(DhcpOption::parse(code, value)?);
                    data = tail;
                }
            }
        }

        Ok(options)
    }

    /// Encodes the bare DHCP payload, padded to the BOOTP minimum.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_PAYLOAD_LEN);

        out.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&addr.octets());
        }
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&self.sname);
        out.extend_from_slice(&self.file);
        out.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            out.extend_from_slice(&option.encode());
        }
        out.push(OptionCode::End as u8);

        if out.len() < MIN_PAYLOAD_LEN {
            out.resize(MIN_PAYLOAD_LEN, 0);
        }

        out
    }

    /// Parses a raw Ethernet frame carrying IPv4/UDP and fills the transport
    /// envelope from the frame headers.
    pub fn parse_frame(frame: &[u8]) -> Result<Self> {
        let sliced = etherparse::SlicedPacket::from_ethernet(frame)
            .map_err(|error| Error::InvalidPacket(format!("Bad ethernet frame: {}", error)))?;

        let Some(etherparse::TransportSlice::Udp(udp)) = &sliced.transport else {
            return Err(Error::InvalidPacket(
                "Frame does not carry a UDP datagram".to_string(),
            ));
        };

        let mut packet = Self::parse(udp.payload())?;

        if let Some(etherparse::LinkSlice::Ethernet2(eth)) = &sliced.link {
            packet.src_mac = eth.source();
            packet.dst_mac = eth.destination();
        }
        if let Some(etherparse::NetSlice::Ipv4(ip)) = &sliced.net {
            packet.src_ip = ip.header().source_addr();
            packet.dst_ip = ip.header().destination_addr();
        }
        packet.src_port = udp.source_port();
        packet.dst_port = udp.destination_port();

        Ok(packet)
    }

    /// Builds the full Ethernet+IPv4+UDP frame for this packet from its
    /// transport envelope.
    pub fn encode_frame(&self) -> Result<Vec<u8>> {
        let payload = self.encode();
        let builder = etherparse::PacketBuilder::ethernet2(self.src_mac, self.dst_mac)
            .ipv4(self.src_ip.octets(), self.dst_ip.octets(), IP_TTL)
            .udp(self.src_port, self.dst_port);

        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder
            .write(&mut frame, &payload)
            .map_err(|error| Error::Internal(format!("Failed to build ethernet frame: {}", error)))?;

        Ok(frame)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MessageType(msg_type) => Some(*msg_type),
            _ => None,
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn client_identifier(&self) -> Option<Vec<u8>> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ClientIdentifier(id) => Some(id.clone()),
            _ => None,
        })
    }

    pub fn parameter_request_list(&self) -> Option<Vec<u8>> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ParameterRequestList(preqs) => Some(preqs.clone()),
            _ => None,
        })
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::LeaseTime(time) => Some(*time),
            _ => None,
        })
    }

    pub fn vendor_class_id(&self) -> Option<Vec<u8>> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::VendorClassId(id) => Some(id.clone()),
            _ => None,
        })
    }

    pub fn message(&self) -> Option<String> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::Message(text) => Some(text.clone()),
            _ => None,
        })
    }

    pub fn format_mac(&self) -> String {
        self.chaddr[..6]
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & BROADCAST_FLAG) != 0
    }
}
