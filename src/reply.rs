//! Reply assembly: BOOTP header fill plus destination selection.
//!
//! Destination rules follow RFC 2131 §4.1: relayed replies go back to the
//! relay agent on the server port; otherwise NAKs are broadcast, and
//! OFFER/ACK unicast to whichever address the client can already receive on,
//! falling back to broadcast for clients that asked for it or have no
//! address yet.

use std::net::Ipv4Addr;

use crate::config::{Config, SubnetConfig};
use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREPLY, DhcpPacket, HLEN_ETHERNET, HTYPE_ETHERNET};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

fn pack_sname(hostname: &str) -> [u8; 64] {
    let mut sname = [0u8; 64];
    let bytes = hostname.as_bytes();
    // Leave at least one trailing NUL.
    let len = bytes.len().min(63);
    sname[..len].copy_from_slice(&bytes[..len]);
    sname
}

/// Builds a server reply to `request`. `options` must carry a message type
/// of OFFER, ACK, or NAK; anything else is a caller bug.
pub fn build_reply(
    config: &Config,
    subnet: &SubnetConfig,
    request: &DhcpPacket,
    ciaddr: Ipv4Addr,
    yiaddr: Ipv4Addr,
    siaddr: Ipv4Addr,
    giaddr: Ipv4Addr,
    options: Vec<DhcpOption>,
) -> Result<DhcpPacket> {
    let msg_type = options
        .iter()
        .find_map(|option| match option {
            DhcpOption::MessageType(msg_type) => Some(*msg_type),
            _ => None,
        })
        .ok_or_else(|| Error::Internal("reply options are missing a message type".to_string()))?;

    let (dst_mac, dst_ip) = match msg_type {
        MessageType::Nak => {
            if giaddr != Ipv4Addr::UNSPECIFIED {
                (request.src_mac, giaddr)
            } else {
                (BROADCAST_MAC, Ipv4Addr::BROADCAST)
            }
        }
        MessageType::Offer | MessageType::Ack => {
            if giaddr != Ipv4Addr::UNSPECIFIED {
                (request.src_mac, giaddr)
            } else if ciaddr != Ipv4Addr::UNSPECIFIED {
                (request.src_mac, ciaddr)
            } else if !request.is_broadcast() {
                (request.src_mac, yiaddr)
            } else {
                (BROADCAST_MAC, Ipv4Addr::BROADCAST)
            }
        }
        other => {
            return Err(Error::Internal(format!(
                "{} is not a server reply type",
                other
            )));
        }
    };

    let dst_port = if giaddr != Ipv4Addr::UNSPECIFIED {
        DHCP_SERVER_PORT
    } else {
        DHCP_CLIENT_PORT
    };

    Ok(DhcpPacket {
        op: BOOTREPLY,
        htype: HTYPE_ETHERNET,
        hlen: HLEN_ETHERNET,
        hops: 0,
        xid: request.xid,
        secs: 0,
        flags: request.flags,
        ciaddr,
        yiaddr,
        siaddr,
        giaddr,
        chaddr: request.chaddr,
        sname: pack_sname(&config.hostname),
        file: [0u8; 128],
        options,
        // The link fills the source MAC when the frame goes out.
        src_mac: [0u8; 6],
        dst_mac,
        src_ip: subnet.server_ip,
        dst_ip,
        src_port: DHCP_SERVER_PORT,
        dst_port,
    })
}
