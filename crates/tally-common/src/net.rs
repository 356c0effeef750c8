use std::net::{IpAddr, UdpSocket};
use std::str::FromStr;

/// Header carrying the agent's address. Also used as gRPC metadata key.
pub const REAL_IP_HEADER: &str = "x-real-ip";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubnetError {
    #[error("subnet must be in CIDR form, got {0:?}")]
    NotCidr(String),
    #[error("invalid network address: {0}")]
    Address(String),
    #[error("prefix length {prefix} is out of range for {family}")]
    Prefix { prefix: u8, family: &'static str },
}

/// A CIDR block such as `192.168.1.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            (IpAddr::V4(_), IpAddr::V6(v6)) => v6.to_ipv4_mapped().is_some_and(|v4| self.contains(IpAddr::V4(v4))),
            (IpAddr::V6(_), IpAddr::V4(v4)) => self.contains(IpAddr::V6(v4.to_ipv6_mapped())),
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p)),
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| SubnetError::NotCidr(s.to_string()))?;
        let network: IpAddr = addr
            .parse()
            .map_err(|_| SubnetError::Address(addr.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| SubnetError::NotCidr(s.to_string()))?;
        let (max, family) = match network {
            IpAddr::V4(_) => (32, "IPv4"),
            IpAddr::V6(_) => (128, "IPv6"),
        };
        if prefix > max {
            return Err(SubnetError::Prefix { prefix, family });
        }
        Ok(Self { network, prefix })
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Outbound address the OS would pick to reach `target`. No packet is sent.
pub fn local_ip_towards(target: &str) -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}

pub fn local_ip() -> std::io::Result<IpAddr> {
    local_ip_towards("8.8.8.8:80")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn v4_membership() {
        let subnet: Subnet = "192.168.1.0/24".parse().unwrap();
        assert!(subnet.contains(ip("192.168.1.77")));
        assert!(!subnet.contains(ip("192.168.2.1")));
        assert!(subnet.contains(ip("::ffff:192.168.1.5")));
        assert!(!subnet.contains(ip("fe80::1")));
    }

    #[test]
    fn zero_and_full_prefixes() {
        let any: Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(ip("10.1.2.3")));
        let single: Subnet = "10.0.0.1/32".parse().unwrap();
        assert!(single.contains(ip("10.0.0.1")));
        assert!(!single.contains(ip("10.0.0.2")));
    }

    #[test]
    fn v6_membership() {
        let subnet: Subnet = "2001:db8::/32".parse().unwrap();
        assert!(subnet.contains(ip("2001:db8::1")));
        assert!(!subnet.contains(ip("2001:db9::1")));
        assert!(!subnet.contains(ip("10.0.0.1")));
    }

    #[test]
    fn mapped_v6_subnet_matches_plain_v4() {
        let subnet: Subnet = "::ffff:10.0.0.0/104".parse().unwrap();
        assert!(subnet.contains(ip("10.0.0.1")));
        assert!(subnet.contains(ip("10.255.1.2")));
        assert!(subnet.contains(ip("::ffff:10.3.2.1")));
        assert!(!subnet.contains(ip("11.0.0.1")));
    }

    #[test]
    fn rejects_malformed_cidr() {
        assert!(matches!("10.0.0.0".parse::<Subnet>(), Err(SubnetError::NotCidr(_))));
        assert!(matches!("10.0.0/8".parse::<Subnet>(), Err(SubnetError::Address(_))));
        assert!(matches!("10.0.0.0/33".parse::<Subnet>(), Err(SubnetError::Prefix { .. })));
    }

    #[test]
    fn loopback_route_resolves_locally() {
        assert!(local_ip_towards("127.0.0.1:9").unwrap().is_loopback());
    }
}
