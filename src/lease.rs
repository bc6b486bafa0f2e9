//! Lease tracking for one subnet.
//!
//! Each subnet task owns one [`LeaseDb`] outright, so the store needs no
//! locking. Expiry is evaluated lazily against a monotonic clock at lookup
//! time; expired leases stay in the map but stop counting as holders of
//! their address.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::packet::DhcpPacket;

/// Stable identity of a DHCP client: the Client-Identifier option value if
/// the client sent one, otherwise hardware type plus hardware address. A
/// client that changes its identifier is a distinct client even on the same
/// hardware.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn from_packet(packet: &DhcpPacket) -> Self {
        if let Some(id) = packet.client_identifier() {
            return Self(id);
        }
        let hlen = (packet.hlen as usize).min(packet.chaddr.len());
        let mut id = Vec::with_capacity(hlen + 1);
        id.push(packet.htype);
        id.extend_from_slice(&packet.chaddr[..hlen]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ClientId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self
            .0
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":");
        write!(f, "{}", hex)
    }
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub client_id: ClientId,
    pub addr: Ipv4Addr,
    pub tm_start: Instant,
    pub tm_end: Instant,
}

impl Lease {
    pub fn make(client_id: ClientId, addr: Ipv4Addr, lease_time: u32) -> Self {
        let now = Instant::now();
        Self {
            client_id,
            addr,
            tm_start: now,
            tm_end: now + Duration::from_secs(u64::from(lease_time)),
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.tm_end
    }

    /// Seconds remaining, rounded to the nearest second, 0 once expired.
    pub fn timeleft(&self) -> u32 {
        let now = Instant::now();
        if now >= self.tm_end {
            return 0;
        }
        (self.tm_end - now).as_secs_f64().round() as u32
    }

    /// Remaining lifetime plus the fractional T1/T2 renewal deadlines derived
    /// from it.
    pub fn timeleft3(&self, t1_ratio: f64, t2_ratio: f64) -> (u32, u32, u32) {
        let lease_time = self.timeleft();
        let t1 = (t1_ratio * f64::from(lease_time)).round() as u32;
        let t2 = (t2_ratio * f64::from(lease_time)).round() as u32;
        (lease_time, t1, t2)
    }
}

pub fn addr_in_range(addr: Ipv4Addr, range: (Ipv4Addr, Ipv4Addr)) -> bool {
    let addr = u32::from(addr);
    addr >= u32::from(range.0) && addr <= u32::from(range.1)
}

#[derive(Debug, Default)]
pub struct LeaseDb {
    leases: HashMap<ClientId, Lease>,
}

impl LeaseDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, client_id: &ClientId) -> Option<Lease> {
        self.leases.get(client_id).cloned()
    }

    /// Inserts or overwrites the lease for `client_id`. The lease must be
    /// keyed by the same client.
    pub fn replace(&mut self, client_id: &ClientId, lease: Lease) {
        debug_assert_eq!(
            *client_id, lease.client_id,
            "lease stored under a foreign client id"
        );
        self.leases.insert(client_id.clone(), lease);
    }

    pub fn remove(&mut self, client_id: &ClientId) {
        self.leases.remove(client_id);
    }

    /// True when no unexpired lease holds `addr`. Addresses outside any
    /// configured range are trivially available; allocation never hands them
    /// out because it only scans the range.
    pub fn addr_available(&self, addr: Ipv4Addr) -> bool {
        !self
            .leases
            .values()
            .any(|lease| lease.addr == addr && !lease.expired())
    }

    /// First available address in the inclusive range, scanning from the low
    /// end. `None` iff every address is held by an unexpired lease.
    pub fn usable_addr(&self, range: (Ipv4Addr, Ipv4Addr)) -> Option<Ipv4Addr> {
        (u32::from(range.0)..=u32::from(range.1))
            .map(Ipv4Addr::from)
            .find(|addr| self.addr_available(*addr))
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DhcpOption, MessageType};
    use crate::packet::{BOOTREQUEST, HLEN_ETHERNET, HTYPE_ETHERNET};

    fn make_client_id(mac: &[u8; 6]) -> ClientId {
        let mut id = vec![HTYPE_ETHERNET];
        id.extend_from_slice(mac);
        ClientId::from(id)
    }

    fn expire(lease: &mut Lease) {
        lease.tm_end = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .expect("monotonic clock too close to boot");
    }

    fn test_packet(options: Vec<DhcpOption>) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        DhcpPacket {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 1,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options,
            src_mac: [0u8; 6],
            dst_mac: [0u8; 6],
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_port: 0,
        }
    }

    const RANGE: (Ipv4Addr, Ipv4Addr) = (
        Ipv4Addr::new(192, 168, 1, 100),
        Ipv4Addr::new(192, 168, 1, 200),
    );

    #[test]
    fn test_client_id_from_hardware_address() {
        let packet = test_packet(vec![DhcpOption::MessageType(MessageType::Discover)]);
        let client_id = ClientId::from_packet(&packet);
        assert_eq!(
            client_id.as_bytes(),
            &[1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
        );
        assert_eq!(client_id.to_string(), "01:aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_client_id_prefers_option() {
        let packet = test_packet(vec![
            DhcpOption::MessageType(MessageType::Discover),
            DhcpOption::ClientIdentifier(vec![0, 1, 2, 3]),
        ]);
        let client_id = ClientId::from_packet(&packet);
        assert_eq!(client_id.as_bytes(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_lease_lifetime() {
        let lease = Lease::make(
            make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            Ipv4Addr::new(192, 168, 1, 100),
            3600,
        );
        assert!(!lease.expired());
        assert_eq!(lease.timeleft(), 3600);

        let mut expired = lease.clone();
        expire(&mut expired);
        assert!(expired.expired());
        assert_eq!(expired.timeleft(), 0);
    }

    #[test]
    fn test_timeleft3_fractions() {
        let lease = Lease::make(
            make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            Ipv4Addr::new(192, 168, 1, 100),
            3600,
        );
        let (lease_time, t1, t2) = lease.timeleft3(0.5, 0.875);
        assert_eq!(lease_time, 3600);
        assert_eq!(t1, 1800);
        assert_eq!(t2, 3150);
        assert!(t1 <= t2 && t2 <= lease_time);
    }

    #[test]
    fn test_timeleft3_small_lifetimes_stay_ordered() {
        for lease_time in 0..=10u32 {
            let lease = Lease::make(
                make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
                Ipv4Addr::new(192, 168, 1, 100),
                lease_time,
            );
            let (remaining, t1, t2) = lease.timeleft3(0.5, 0.875);
            assert!(t1 <= t2 && t2 <= remaining);
        }
    }

    #[test]
    fn test_lookup_replace_remove() {
        let mut db = LeaseDb::new();
        let client_id = make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);

        assert!(db.lookup(&client_id).is_none());

        let lease = Lease::make(client_id.clone(), Ipv4Addr::new(192, 168, 1, 100), 3600);
        db.replace(&client_id, lease);
        assert_eq!(
            db.lookup(&client_id).unwrap().addr,
            Ipv4Addr::new(192, 168, 1, 100)
        );

        let moved = Lease::make(client_id.clone(), Ipv4Addr::new(192, 168, 1, 101), 3600);
        db.replace(&client_id, moved);
        assert_eq!(
            db.lookup(&client_id).unwrap().addr,
            Ipv4Addr::new(192, 168, 1, 101)
        );
        assert_eq!(db.len(), 1);

        db.remove(&client_id);
        assert!(db.lookup(&client_id).is_none());

        // Removing an absent client is a no-op.
        db.remove(&client_id);
        assert!(db.is_empty());
    }

    #[test]
    fn test_addr_available_tracks_expiry() {
        let mut db = LeaseDb::new();
        let client_id = make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        let addr = Ipv4Addr::new(192, 168, 1, 100);

        assert!(db.addr_available(addr));

        let lease = Lease::make(client_id.clone(), addr, 3600);
        db.replace(&client_id, lease);
        assert!(!db.addr_available(addr));

        let mut lease = db.lookup(&client_id).unwrap();
        expire(&mut lease);
        db.replace(&client_id, lease);
        assert!(db.addr_available(addr));
    }

    #[test]
    fn test_usable_addr_first_fit() {
        let mut db = LeaseDb::new();
        assert_eq!(
            db.usable_addr(RANGE),
            Some(Ipv4Addr::new(192, 168, 1, 100))
        );

        let client1 = make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        db.replace(
            &client1,
            Lease::make(client1.clone(), Ipv4Addr::new(192, 168, 1, 100), 3600),
        );
        assert_eq!(
            db.usable_addr(RANGE),
            Some(Ipv4Addr::new(192, 168, 1, 101))
        );
    }

    #[test]
    fn test_usable_addr_exhaustion() {
        let range = (
            Ipv4Addr::new(192, 168, 1, 100),
            Ipv4Addr::new(192, 168, 1, 101),
        );
        let mut db = LeaseDb::new();

        let client1 = make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        let client2 = make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);
        db.replace(
            &client1,
            Lease::make(client1.clone(), Ipv4Addr::new(192, 168, 1, 100), 3600),
        );
        db.replace(
            &client2,
            Lease::make(client2.clone(), Ipv4Addr::new(192, 168, 1, 101), 3600),
        );

        assert_eq!(db.usable_addr(range), None);

        // An expired holder frees its address for reallocation.
        let mut lease = db.lookup(&client1).unwrap();
        expire(&mut lease);
        db.replace(&client1, lease);
        assert_eq!(
            db.usable_addr(range),
            Some(Ipv4Addr::new(192, 168, 1, 100))
        );
    }

    #[test]
    fn test_no_duplicate_unexpired_holders() {
        // Allocating through usable_addr can never produce two unexpired
        // leases on one address.
        let mut db = LeaseDb::new();
        for index in 0..20u8 {
            let client_id = make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, index]);
            let addr = db.usable_addr(RANGE).unwrap();
            db.replace(&client_id, Lease::make(client_id.clone(), addr, 3600));
        }

        let mut seen = std::collections::HashSet::new();
        for index in 0..20u8 {
            let client_id = make_client_id(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, index]);
            let lease = db.lookup(&client_id).unwrap();
            assert!(seen.insert(lease.addr), "duplicate holder of {}", lease.addr);
        }
    }

    #[test]
    fn test_addr_in_range_bounds() {
        assert!(addr_in_range(Ipv4Addr::new(192, 168, 1, 100), RANGE));
        assert!(addr_in_range(Ipv4Addr::new(192, 168, 1, 200), RANGE));
        assert!(addr_in_range(Ipv4Addr::new(192, 168, 1, 150), RANGE));
        assert!(!addr_in_range(Ipv4Addr::new(192, 168, 1, 99), RANGE));
        assert!(!addr_in_range(Ipv4Addr::new(192, 168, 1, 201), RANGE));
        assert!(!addr_in_range(Ipv4Addr::new(10, 0, 0, 1), RANGE));
    }
}
