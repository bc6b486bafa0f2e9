//! Raw frame I/O, one link per served subnet.
//!
//! [`RawLink`] is the production implementation: an `AF_PACKET` socket bound
//! to the subnet's interface, nonblocking and driven through tokio's
//! [`AsyncFd`]. Inbound traffic is filtered down to IPv4/UDP datagrams for
//! the DHCP server port before it reaches the decoder; outbound frames get
//! the interface MAC stamped into the Ethernet source field.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;

use crate::error::{Error, Result};
use crate::reply::DHCP_SERVER_PORT;

const RECV_BUFFER_SIZE: usize = 1500;

pub trait Link: Send {
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>>> + Send;
    fn send(&mut self, frame: &[u8]) -> impl Future<Output = Result<()>> + Send;
}

pub struct RawLink {
    fd: AsyncFd<OwnedFd>,
    mac: [u8; 6],
}

impl RawLink {
    pub fn open(interface: &str, mac: [u8; 6]) -> Result<Self> {
        let name = CString::new(interface)
            .map_err(|_| Error::Socket(format!("Invalid interface name: {}", interface)))?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(Error::Socket(format!(
                "Unknown interface {}: {}",
                interface,
                io::Error::last_os_error()
            )));
        }

        let protocol = (libc::ETH_P_IP as u16).to_be();
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                i32::from(protocol),
            )
        };
        if fd < 0 {
            return Err(Error::Socket(format!(
                "Failed to create raw socket on {}: {}",
                interface,
                io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex as libc::c_int;

        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::Socket(format!(
                "Failed to bind raw socket to {}: {}",
                interface,
                io::Error::last_os_error()
            )));
        }

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            mac,
        })
    }
}

impl Link for RawLink {
    async fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            let mut guard = self.fd.readable().await?;
            let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

            let received = guard.try_io(|fd| {
                let count = unsafe {
                    libc::recv(
                        fd.get_ref().as_raw_fd(),
                        buffer.as_mut_ptr().cast::<libc::c_void>(),
                        buffer.len(),
                        0,
                    )
                };
                if count < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(count as usize)
                }
            });

            match received {
                Ok(Ok(count)) => {
                    buffer.truncate(count);
                    if frame_wants_dhcp_server(&buffer) {
                        return Ok(buffer);
                    }
                }
                Ok(Err(error)) => return Err(error.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut frame = frame.to_vec();
        if frame.len() >= 12 {
            frame[6..12].copy_from_slice(&self.mac);
        }

        loop {
            let mut guard = self.fd.writable().await?;

            let sent = guard.try_io(|fd| {
                let count = unsafe {
                    libc::send(
                        fd.get_ref().as_raw_fd(),
                        frame.as_ptr().cast::<libc::c_void>(),
                        frame.len(),
                        0,
                    )
                };
                if count < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(count as usize)
                }
            });

            match sent {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(error)) => return Err(error.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Cheap pre-decode filter: IPv4/UDP frames addressed to the DHCP server
/// port. Everything else on the wire is not ours to parse.
fn frame_wants_dhcp_server(frame: &[u8]) -> bool {
    match etherparse::SlicedPacket::from_ethernet(frame) {
        Ok(sliced) => matches!(
            sliced.transport,
            Some(etherparse::TransportSlice::Udp(udp))
                if udp.destination_port() == DHCP_SERVER_PORT
        ),
        Err(_) => false,
    }
}
