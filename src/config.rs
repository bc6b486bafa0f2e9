use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::options::DhcpOption;

/// Fraction of the lease lifetime after which a client should start renewing
/// (RFC 2131 §4.4.5).
pub const T1_RATIO: f64 = 0.5;
/// Fraction of the lease lifetime after which a client should start
/// rebinding.
pub const T2_RATIO: f64 = 0.875;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub hostname: String,
    pub default_lease_seconds: u32,
    pub min_lease_seconds: u32,
    pub max_lease_seconds: u32,
    pub subnets: Vec<SubnetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub interface: String,
    pub interface_mac: String,
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    pub broadcast_address: Option<Ipv4Addr>,
    pub mtu: Option<u16>,
    pub lease_seconds: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "dhclerk".to_string(),
            default_lease_seconds: 3600,
            min_lease_seconds: 60,
            max_lease_seconds: 86400,
            subnets: vec![SubnetConfig::default()],
        }
    }
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            interface_mac: "52:54:00:12:34:56".to_string(),
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            domain_name: None,
            broadcast_address: None,
            mtu: None,
            lease_seconds: None,
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(Error::InvalidConfig("hostname must not be empty".to_string()));
        }

        if self.default_lease_seconds == 0 {
            return Err(Error::InvalidConfig(
                "default_lease_seconds must be greater than 0".to_string(),
            ));
        }

        if self.min_lease_seconds > self.max_lease_seconds {
            return Err(Error::InvalidConfig(
                "min_lease_seconds must not exceed max_lease_seconds".to_string(),
            ));
        }

        if self.subnets.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one subnet must be configured".to_string(),
            ));
        }

        let mut seen_interfaces: HashSet<&str> = HashSet::new();
        for subnet in &self.subnets {
            if !seen_interfaces.insert(&subnet.interface) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate interface in subnets: {}",
                    subnet.interface
                )));
            }
            subnet.validate()?;

            if let Some(lease_seconds) = subnet.lease_seconds
                && lease_seconds == 0
            {
                return Err(Error::InvalidConfig(format!(
                    "lease_seconds on {} must be greater than 0",
                    subnet.interface
                )));
            }
        }

        Ok(())
    }

    /// The lease lifetime handed out on `subnet`: its override if set, the
    /// global default otherwise.
    pub fn lease_time_for(&self, subnet: &SubnetConfig) -> u32 {
        subnet.lease_seconds.unwrap_or(self.default_lease_seconds)
    }

    /// Whether a client-requested lease lifetime falls within the configured
    /// bounds.
    pub fn lease_time_acceptable(&self, lease_time: u32) -> bool {
        lease_time >= self.min_lease_seconds && lease_time <= self.max_lease_seconds
    }
}

impl SubnetConfig {
    fn validate(&self) -> Result<()> {
        let start = u32::from(self.range_start);
        let end = u32::from(self.range_end);

        if start > end {
            return Err(Error::InvalidConfig(format!(
                "range_start must be less than or equal to range_end on {}",
                self.interface
            )));
        }

        let server = u32::from(self.server_ip);
        if server >= start && server <= end {
            return Err(Error::InvalidConfig(format!(
                "server_ip must not be within the address range on {}",
                self.interface
            )));
        }

        if let Some(gateway) = self.gateway {
            let gw = u32::from(gateway);
            if gw >= start && gw <= end {
                return Err(Error::InvalidConfig(format!(
                    "gateway must not be within the address range on {}",
                    self.interface
                )));
            }
        }

        if !mask_is_contiguous(self.subnet_mask) {
            return Err(Error::InvalidConfig(format!(
                "invalid subnet mask: {} (must be contiguous)",
                self.subnet_mask
            )));
        }

        self.mac_bytes()?;

        if let Some(ref domain) = self.domain_name
            && !valid_domain_name(domain)
        {
            return Err(Error::InvalidConfig(format!(
                "invalid domain name: {}",
                domain
            )));
        }

        Ok(())
    }

    pub fn range(&self) -> (Ipv4Addr, Ipv4Addr) {
        (self.range_start, self.range_end)
    }

    pub fn ip_in_range(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.range_start) && addr <= u32::from(self.range_end)
    }

    pub fn range_size(&self) -> u32 {
        u32::from(self.range_end) - u32::from(self.range_start) + 1
    }

    pub fn broadcast_addr(&self) -> Ipv4Addr {
        if let Some(broadcast) = self.broadcast_address {
            return broadcast;
        }

        let ip = u32::from(self.server_ip);
        let mask = u32::from(self.subnet_mask);
        Ipv4Addr::from(ip | !mask)
    }

    /// The interface MAC as raw bytes. Accepts six `:`- or `-`-separated
    /// hex octets; anything else is a config error.
    pub fn mac_bytes(&self) -> Result<[u8; 6]> {
        let bad = || {
            Error::InvalidConfig(format!(
                "invalid MAC address format: {}",
                self.interface_mac
            ))
        };

        let mut octets = [0u8; 6];
        let mut filled = 0;
        for part in self.interface_mac.split([':', '-']) {
            if filled == octets.len() || part.len() != 2 {
                return Err(bad());
            }
            octets[filled] = u8::from_str_radix(part, 16).map_err(|_| bad())?;
            filled += 1;
        }
        if filled < octets.len() {
            return Err(bad());
        }
        Ok(octets)
    }

    /// Server-default options offered to clients that ask for them through
    /// the parameter request list.
    pub fn default_options(&self) -> Vec<DhcpOption> {
        let mut options = Vec::new();

        if let Some(gateway) = self.gateway {
            options.push(DhcpOption::Router(vec![gateway]));
        }

        if !self.dns_servers.is_empty() {
            options.push(DhcpOption::DnsServer(self.dns_servers.clone()));
        }

        if let Some(ref domain) = self.domain_name {
            options.push(DhcpOption::DomainName(domain.clone()));
        }

        options.push(DhcpOption::BroadcastAddress(self.broadcast_addr()));

        if let Some(mtu) = self.mtu {
            options.push(DhcpOption::InterfaceMtu(mtu));
        }

        options
    }
}

/// A netmask is well formed when its set bits are one unbroken prefix, i.e.
/// the leading ones and trailing zeros account for the whole word.
fn mask_is_contiguous(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits != 0 && bits.leading_ones() + bits.trailing_zeros() == 32
}

fn valid_domain_name(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());

        let invalid_subnets = [
            SubnetConfig {
                range_start: Ipv4Addr::new(192, 168, 1, 200),
                range_end: Ipv4Addr::new(192, 168, 1, 100),
                ..Default::default()
            },
            SubnetConfig {
                server_ip: Ipv4Addr::new(192, 168, 1, 150),
                ..Default::default()
            },
            SubnetConfig {
                gateway: Some(Ipv4Addr::new(192, 168, 1, 150)),
                ..Default::default()
            },
            SubnetConfig {
                subnet_mask: Ipv4Addr::new(255, 0, 255, 0),
                ..Default::default()
            },
            SubnetConfig {
                interface_mac: "invalid".to_string(),
                ..Default::default()
            },
            SubnetConfig {
                domain_name: Some("bad domain\x00name".to_string()),
                ..Default::default()
            },
        ];
        for subnet in invalid_subnets {
            let config = Config {
                subnets: vec![subnet],
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }

        let invalid_configs = [
            Config {
                hostname: String::new(),
                ..Default::default()
            },
            Config {
                default_lease_seconds: 0,
                ..Default::default()
            },
            Config {
                min_lease_seconds: 7200,
                max_lease_seconds: 3600,
                ..Default::default()
            },
            Config {
                subnets: vec![],
                ..Default::default()
            },
            Config {
                subnets: vec![SubnetConfig::default(), SubnetConfig::default()],
                ..Default::default()
            },
        ];
        for config in invalid_configs {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_subnet_mask_contiguity() {
        for mask in [
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(255, 255, 240, 0),
            Ipv4Addr::new(255, 0, 0, 0),
            Ipv4Addr::new(255, 255, 255, 255),
        ] {
            assert!(mask_is_contiguous(mask), "{mask} should be accepted");
        }
        for mask in [
            Ipv4Addr::new(255, 0, 255, 0),
            Ipv4Addr::new(0, 0, 0, 0),
            Ipv4Addr::new(255, 255, 0, 255),
            Ipv4Addr::new(0, 255, 255, 255),
        ] {
            assert!(!mask_is_contiguous(mask), "{mask} should be rejected");
        }
    }

    #[test]
    fn test_lease_time_policy() {
        let config = Config::default();
        assert_eq!(config.lease_time_for(&config.subnets[0]), 3600);

        let subnet = SubnetConfig {
            lease_seconds: Some(600),
            ..Default::default()
        };
        assert_eq!(config.lease_time_for(&subnet), 600);

        assert!(config.lease_time_acceptable(60));
        assert!(config.lease_time_acceptable(3600));
        assert!(config.lease_time_acceptable(86400));
        assert!(!config.lease_time_acceptable(59));
        assert!(!config.lease_time_acceptable(86401));
    }

    #[test]
    fn test_range_functions() {
        let subnet = SubnetConfig::default();

        assert!(subnet.ip_in_range(Ipv4Addr::new(192, 168, 1, 100)));
        assert!(subnet.ip_in_range(Ipv4Addr::new(192, 168, 1, 200)));
        assert!(!subnet.ip_in_range(Ipv4Addr::new(192, 168, 1, 50)));
        assert!(!subnet.ip_in_range(Ipv4Addr::new(10, 0, 0, 1)));

        assert_eq!(subnet.range_size(), 101);
        assert_eq!(subnet.broadcast_addr(), Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_mac_parsing() {
        let subnet = |mac: &str| SubnetConfig {
            interface_mac: mac.to_string(),
            ..Default::default()
        };

        assert_eq!(
            subnet("aa:bb:cc:dd:ee:ff").mac_bytes().unwrap(),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
        );
        assert_eq!(
            subnet("AA-BB-CC-DD-EE-FF").mac_bytes().unwrap(),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
        );

        for mac in [
            "",
            "invalid",
            "aa:bb:cc:dd:ee",
            "aa:bb:cc:dd:ee:ff:00",
            "aa:bb:cc:dd:ee:fg",
            "aaa:bb:cc:dd:ee:f",
        ] {
            assert!(subnet(mac).mac_bytes().is_err(), "{mac:?} should be rejected");
        }
    }

    #[test]
    fn test_default_options_contents() {
        let subnet = SubnetConfig {
            domain_name: Some("example.local".to_string()),
            mtu: Some(1500),
            ..Default::default()
        };
        let options = subnet.default_options();

        assert!(options.iter().any(|opt| opt.code() == 3));
        assert!(options.iter().any(|opt| opt.code() == 6));
        assert!(options.iter().any(|opt| opt.code() == 15));
        assert!(options.iter().any(|opt| opt.code() == 28));
        assert!(options.iter().any(|opt| opt.code() == 26));
        // Required reply options are never server defaults; the handlers add
        // them explicitly.
        assert!(!options.iter().any(|opt| opt.code() == 1));
        assert!(!options.iter().any(|opt| opt.code() == 51));
        assert!(!options.iter().any(|opt| opt.code() == 53));
    }

    #[test]
    fn test_domain_name_validation() {
        assert!(valid_domain_name("example.local"));
        assert!(valid_domain_name("sub.example-1.io"));
        assert!(!valid_domain_name(""));
        assert!(!valid_domain_name("bad domain"));
        assert!(!valid_domain_name("bad\x00domain"));
        assert!(!valid_domain_name(&"a".repeat(300)));
    }
}
