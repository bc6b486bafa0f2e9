use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SubnetConfig, T1_RATIO, T2_RATIO};
use crate::error::{Error, Result};
use crate::lease::{ClientId, Lease, LeaseDb, addr_in_range};
use crate::link::{Link, RawLink};
use crate::options::{DhcpOption, MessageType, options_from_parameter_requests};
use crate::packet::{BOOTREQUEST, DhcpPacket, HLEN_ETHERNET, HTYPE_ETHERNET};
use crate::reply::build_reply;

/// Shape check on inbound packets: a client BOOTREQUEST over Ethernet with a
/// 6-byte hardware address and no relay hops counted against it.
pub fn valid_pkt(packet: &DhcpPacket) -> bool {
    packet.op == BOOTREQUEST
        && packet.htype == HTYPE_ETHERNET
        && packet.hlen == HLEN_ETHERNET
        && packet.hops == 0
}

pub struct DhcpServer {
    config: Arc<Config>,
}

impl DhcpServer {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Spawns one serving task per configured subnet and waits on them.
    pub async fn run(&self) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for subnet in &self.config.subnets {
            let link = RawLink::open(&subnet.interface, subnet.mac_bytes()?)?;
            info!(
                "Serving {} ({} - {}) on {}",
                subnet.server_ip, subnet.range_start, subnet.range_end, subnet.interface
            );
            let runner = SubnetRunner::new(Arc::clone(&self.config), subnet.clone(), link);
            tasks.spawn(runner.run());
        }

        info!("DHCP server ready and listening");

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Subnet task failed: {}", err),
                Err(err) => error!("Subnet task panicked: {}", err),
            }
        }

        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// One subnet's serving state: its link, its lease database, and its slice
/// of the configuration. Owned by exactly one task, so no locking.
pub struct SubnetRunner<L> {
    config: Arc<Config>,
    subnet: SubnetConfig,
    defaults: Vec<DhcpOption>,
    db: LeaseDb,
    link: L,
}

impl<L: Link> SubnetRunner<L> {
    pub fn new(config: Arc<Config>, subnet: SubnetConfig, link: L) -> Self {
        let defaults = subnet.default_options();
        Self {
            config,
            subnet,
            defaults,
            db: LeaseDb::new(),
            link,
        }
    }

    /// The receive loop. Never stops on a single-packet failure: decode and
    /// handler errors are logged and the next frame is awaited.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let frame = match self.link.recv().await {
                Ok(frame) => frame,
                Err(err) => {
                    error!("Error receiving on {}: {}", self.subnet.interface, err);
                    continue;
                }
            };
            self.handle_frame(&frame).await;
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) {
        let packet = match DhcpPacket::parse_frame(frame) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("Dropped packet: {}", err);
                return;
            }
        };
        if let Err(err) = self.dispatch(&packet).await {
            warn!("Input pkt {}", err);
        }
    }

    async fn dispatch(&mut self, request: &DhcpPacket) -> Result<()> {
        if !valid_pkt(request) {
            warn!(
                "Invalid packet from {}: op={} htype={} hlen={} hops={}",
                request.format_mac(),
                request.op,
                request.htype,
                request.hlen,
                request.hops
            );
            return Ok(());
        }

        match request.message_type() {
            Some(MessageType::Discover) => self.handle_discover(request).await,
            Some(MessageType::Request) => self.handle_request(request).await,
            Some(msg_type @ (MessageType::Decline | MessageType::Release)) => {
                self.handle_decline_release(request, msg_type).await
            }
            Some(MessageType::Inform) => self.handle_inform(request).await,
            Some(other) => {
                debug!("unhandled msgtype {} from {}", other, request.format_mac());
                Ok(())
            }
            None => {
                warn!("no dhcp msgtype from {}", request.format_mac());
                Ok(())
            }
        }
    }

    /// DISCOVER: pick an address and offer it. The lease store is not
    /// touched; the offer only becomes a lease on the follow-up REQUEST.
    async fn handle_discover(&mut self, request: &DhcpPacket) -> Result<()> {
        debug!(
            "DISCOVER from {} on {}",
            request.format_mac(),
            self.subnet.interface
        );
        let ourip = self.subnet.server_ip;
        let client_id = ClientId::from_packet(request);
        let lease = self.db.lookup(&client_id);

        let offered = match &lease {
            Some(lease) if !lease.expired() => Some(lease.addr),
            Some(lease) if self.db.addr_available(lease.addr) => Some(lease.addr),
            _ => self.candidate_addr(request),
        };
        let Some(yiaddr) = offered else {
            warn!(
                "No usable address for {} on {}",
                client_id, self.subnet.interface
            );
            return Ok(());
        };

        let lease_time = match request.lease_time() {
            Some(requested) if self.config.lease_time_acceptable(requested) => requested,
            _ => match &lease {
                Some(lease) if !lease.expired() => lease.timeleft(),
                _ => self.config.lease_time_for(&self.subnet),
            },
        };
        let t1 = (T1_RATIO * f64::from(lease_time)).round() as u32;
        let t2 = (T2_RATIO * f64::from(lease_time)).round() as u32;

        let mut options = vec![
            DhcpOption::MessageType(MessageType::Offer),
            DhcpOption::SubnetMask(self.subnet.subnet_mask),
            DhcpOption::LeaseTime(lease_time),
            DhcpOption::RenewalTime(t1),
            DhcpOption::RebindingTime(t2),
            DhcpOption::ServerIdentifier(ourip),
        ];
        if let Some(vendor) = request.vendor_class_id() {
            options.push(DhcpOption::VendorClassId(vendor));
        }
        self.append_requested_defaults(request, &mut options);

        let reply = build_reply(
            &self.config,
            &self.subnet,
            request,
            Ipv4Addr::UNSPECIFIED,
            yiaddr,
            ourip,
            request.giaddr,
            options,
        )?;
        info!("OFFER {} to {}", yiaddr, request.format_mac());
        self.send(&reply).await
    }

    /// The address a client with no reusable lease gets offered: its
    /// requested address when that is in range and free, the first free
    /// address otherwise.
    fn candidate_addr(&self, request: &DhcpPacket) -> Option<Ipv4Addr> {
        if let Some(requested) = request.requested_ip()
            && addr_in_range(requested, self.subnet.range())
            && self.db.addr_available(requested)
        {
            return Some(requested);
        }
        self.db.usable_addr(self.subnet.range())
    }

    /// REQUEST: the client state is recovered from which of the server
    /// identifier, requested address, and existing lease are present
    /// (RFC 2131 §4.3.2). Unrecognized combinations are dropped.
    async fn handle_request(&mut self, request: &DhcpPacket) -> Result<()> {
        debug!(
            "REQUEST from {} on {}",
            request.format_mac(),
            self.subnet.interface
        );
        let client_id = ClientId::from_packet(request);
        let sid = request.server_identifier();
        let reqip = request.requested_ip();
        let lease = self.db.lookup(&client_id);

        match (sid, reqip, lease) {
            (Some(sid), Some(reqip), _) => {
                self.request_selecting(request, client_id, sid, reqip).await
            }
            (None, Some(reqip), Some(lease)) => {
                self.request_init_reboot(request, client_id, reqip, lease)
                    .await
            }
            (None, None, Some(lease)) => self.request_renewing(request, client_id, lease).await,
            _ => Ok(()),
        }
    }

    async fn request_selecting(
        &mut self,
        request: &DhcpPacket,
        client_id: ClientId,
        sid: Ipv4Addr,
        reqip: Ipv4Addr,
    ) -> Result<()> {
        if sid != self.subnet.server_ip {
            debug!(
                "REQUEST from {} is for server {}",
                request.format_mac(),
                sid
            );
            return Ok(());
        }
        if request.ciaddr != Ipv4Addr::UNSPECIFIED {
            warn!(
                "Selecting REQUEST from {} carries ciaddr {}",
                request.format_mac(),
                request.ciaddr
            );
            return Ok(());
        }
        if !addr_in_range(reqip, self.subnet.range()) {
            return self
                .send_nak(request, "Requested address is not in subnet range")
                .await;
        }
        if !self.db.addr_available(reqip) {
            return self
                .send_nak(request, "Requested address is not available")
                .await;
        }

        let lease = Lease::make(
            client_id.clone(),
            reqip,
            self.config.lease_time_for(&self.subnet),
        );
        self.send_ack(request, client_id, lease).await
    }

    async fn request_init_reboot(
        &mut self,
        request: &DhcpPacket,
        client_id: ClientId,
        reqip: Ipv4Addr,
        lease: Lease,
    ) -> Result<()> {
        if request.ciaddr != Ipv4Addr::UNSPECIFIED {
            warn!(
                "Init-reboot REQUEST from {} carries ciaddr {}",
                request.format_mac(),
                request.ciaddr
            );
            return Ok(());
        }
        if lease.expired() && !self.db.addr_available(reqip) {
            return self
                .send_nak(request, "Lease has expired and address is taken")
                .await;
        }
        if request.giaddr == Ipv4Addr::UNSPECIFIED && !addr_in_range(reqip, self.subnet.range()) {
            return self
                .send_nak(request, "Requested address is not in subnet range")
                .await;
        }
        if lease.addr != reqip {
            return self.send_nak(request, "Requested address is incorrect").await;
        }

        let fresh = Lease::make(
            client_id.clone(),
            lease.addr,
            self.config.lease_time_for(&self.subnet),
        );
        self.send_ack(request, client_id, fresh).await
    }

    async fn request_renewing(
        &mut self,
        request: &DhcpPacket,
        client_id: ClientId,
        lease: Lease,
    ) -> Result<()> {
        if request.ciaddr == Ipv4Addr::UNSPECIFIED {
            warn!(
                "Renewing REQUEST from {} has no ciaddr",
                request.format_mac()
            );
            return Ok(());
        }
        if lease.expired() && !self.db.addr_available(lease.addr) {
            return self
                .send_nak(request, "Lease has expired and address is taken")
                .await;
        }
        if lease.addr != request.ciaddr {
            return self.send_nak(request, "Requested address is incorrect").await;
        }

        let fresh = Lease::make(
            client_id.clone(),
            lease.addr,
            self.config.lease_time_for(&self.subnet),
        );
        self.send_ack(request, client_id, fresh).await
    }

    /// DECLINE and RELEASE take the same path: verify the message targets
    /// this server, then forget the client's lease. Neither is answered.
    async fn handle_decline_release(
        &mut self,
        request: &DhcpPacket,
        msg_type: MessageType,
    ) -> Result<()> {
        debug!(
            "{} from {} on {}",
            msg_type,
            request.format_mac(),
            self.subnet.interface
        );
        let client_id = ClientId::from_packet(request);

        let Some(sid) = request.server_identifier() else {
            warn!(
                "{} from {} has no server identifier",
                msg_type,
                request.format_mac()
            );
            return Ok(());
        };
        if sid != self.subnet.server_ip {
            return Ok(());
        }

        let Some(addr) = request.requested_ip() else {
            warn!(
                "{} from {} has no requested address",
                msg_type,
                request.format_mac()
            );
            return Ok(());
        };

        if self.db.lookup(&client_id).is_none() {
            warn!(
                "{} from {} without a lease",
                msg_type,
                request.format_mac()
            );
            return Ok(());
        }

        self.db.remove(&client_id);
        let reason = request
            .message()
            .unwrap_or_else(|| "unspecified".to_string());
        info!("{} of {} by {}: {}", msg_type, addr, client_id, reason);
        Ok(())
    }

    /// INFORM: the client already has an address and only wants
    /// configuration. Answered with a lease-free ACK; the store is not
    /// touched.
    async fn handle_inform(&mut self, request: &DhcpPacket) -> Result<()> {
        debug!(
            "INFORM from {} on {}",
            request.format_mac(),
            self.subnet.interface
        );
        if request.ciaddr == Ipv4Addr::UNSPECIFIED {
            return Err(Error::InvalidPacket(
                "INFORM without ciaddr".to_string(),
            ));
        }
        let ourip = self.subnet.server_ip;

        let mut options = vec![
            DhcpOption::MessageType(MessageType::Ack),
            DhcpOption::ServerIdentifier(ourip),
        ];
        if let Some(vendor) = request.vendor_class_id() {
            options.push(DhcpOption::VendorClassId(vendor));
        }
        self.append_requested_defaults(request, &mut options);

        let reply = build_reply(
            &self.config,
            &self.subnet,
            request,
            request.ciaddr,
            Ipv4Addr::UNSPECIFIED,
            ourip,
            request.giaddr,
            options,
        )?;
        info!("INFORM reply to {}", request.format_mac());
        self.send(&reply).await
    }

    async fn send_ack(
        &mut self,
        request: &DhcpPacket,
        client_id: ClientId,
        lease: Lease,
    ) -> Result<()> {
        let ourip = self.subnet.server_ip;
        let (lease_time, t1, t2) = lease.timeleft3(T1_RATIO, T2_RATIO);

        let mut options = vec![
            DhcpOption::MessageType(MessageType::Ack),
            DhcpOption::SubnetMask(self.subnet.subnet_mask),
            DhcpOption::LeaseTime(lease_time),
            DhcpOption::RenewalTime(t1),
            DhcpOption::RebindingTime(t2),
            DhcpOption::ServerIdentifier(ourip),
        ];
        if let Some(vendor) = request.vendor_class_id() {
            options.push(DhcpOption::VendorClassId(vendor));
        }
        self.append_requested_defaults(request, &mut options);

        let yiaddr = lease.addr;
        self.db.replace(&client_id, lease);

        let reply = build_reply(
            &self.config,
            &self.subnet,
            request,
            request.ciaddr,
            yiaddr,
            ourip,
            request.giaddr,
            options,
        )?;
        info!(
            "ACK {} to {} (lease {} seconds)",
            yiaddr,
            request.format_mac(),
            lease_time
        );
        self.send(&reply).await
    }

    async fn send_nak(&mut self, request: &DhcpPacket, reason: &str) -> Result<()> {
        let mut options = vec![
            DhcpOption::MessageType(MessageType::Nak),
            DhcpOption::ServerIdentifier(self.subnet.server_ip),
            DhcpOption::Message(reason.to_string()),
        ];
        if let Some(id) = request.client_identifier() {
            options.push(DhcpOption::ClientIdentifier(id));
        }
        if let Some(vendor) = request.vendor_class_id() {
            options.push(DhcpOption::VendorClassId(vendor));
        }

        let reply = build_reply(
            &self.config,
            &self.subnet,
            request,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            request.giaddr,
            options,
        )?;
        warn!("NAK to {}: {}", request.format_mac(), reason);
        self.send(&reply).await
    }

    fn append_requested_defaults(&self, request: &DhcpPacket, options: &mut Vec<DhcpOption>) {
        if let Some(preqs) = request.parameter_request_list() {
            options.extend(options_from_parameter_requests(&preqs, &self.defaults));
        }
    }

    async fn send(&mut self, reply: &DhcpPacket) -> Result<()> {
        let frame = reply.encode_frame()?;
        self.link.send(&frame).await
    }
}
