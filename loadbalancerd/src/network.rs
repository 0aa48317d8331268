//! Mapping of configured VIPs onto network partitions.
//!
//! Each partition (public, internal, admin, ...) is bound to one or more
//! subnets. A VIP belongs to every partition with a subnet containing it.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// VIP addresses per partition name
pub type PartitionVips = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("invalid subnet '{0}': {1}")]
    InvalidSubnet(String, String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}

/// An IPv4 or IPv6 network in CIDR form. Host bits are cleared on parse,
/// so "10.20.0.10/24" and "10.20.0.0/24" are the same subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = v4_mask(self.prefix);
                u32::from(*ip) & mask == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = v6_mask(self.prefix);
                u128::from(*ip) & mask == u128::from(net)
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn v6_mask(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

impl FromStr for Subnet {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| NetworkError::InvalidSubnet(s.to_string(), reason.to_string());

        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("missing prefix length"))?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid("bad address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;

        let network = match addr {
            IpAddr::V4(ip) if prefix <= 32 => IpAddr::V4((u32::from(ip) & v4_mask(prefix)).into()),
            IpAddr::V6(ip) if prefix <= 128 => {
                IpAddr::V6((u128::from(ip) & v6_mask(prefix)).into())
            }
            _ => return Err(invalid("prefix length out of range")),
        };

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Parse partition bindings given as CIDR strings.
pub fn parse_bindings(
    bindings: &BTreeMap<String, Vec<String>>,
) -> Result<BTreeMap<String, Vec<Subnet>>, NetworkError> {
    bindings
        .iter()
        .map(|(partition, cidrs)| -> Result<(String, Vec<Subnet>), NetworkError> {
            let subnets = cidrs.iter().map(|c| c.parse()).collect::<Result<Vec<Subnet>, _>>()?;
            Ok((partition.clone(), subnets))
        })
        .collect()
}

pub fn parse_vips(vips: &[String]) -> Result<Vec<IpAddr>, NetworkError> {
    vips.iter()
        .map(|v| v.trim().parse().map_err(|_| NetworkError::InvalidAddress(v.clone())))
        .collect()
}

/// Assign each VIP to the partitions whose subnets contain it. Partitions
/// with no matching VIP are left out; VIPs matching nothing are logged.
pub fn partition_vip_map(
    bindings: &BTreeMap<String, Vec<Subnet>>,
    vips: &[IpAddr],
) -> PartitionVips {
    let mut map = PartitionVips::new();

    for vip in vips {
        let mut matched = false;
        for (partition, subnets) in bindings {
            if subnets.iter().any(|s| s.contains(vip)) {
                map.entry(partition.clone()).or_default().push(vip.to_string());
                matched = true;
            }
        }
        if !matched {
            tracing::warn!("VIP {} is not in any bound partition subnet", vip);
        }
    }
    map
}
