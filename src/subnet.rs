//! IPv4/IPv6 subnet model.
//!
//! A [`Subnet`] keeps the address exactly as written (host bits are not
//! truncated) so that a rule file survives a load/serialize cycle, while
//! matching only looks at the first `prefix_len` bits.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::{AclError, Result};

/// An IP subnet in `ip/prefix` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    net: IpNet,
}

impl Subnet {
    /// Create a subnet, returning `None` when the prefix exceeds the family width.
    pub fn new(address: IpAddr, prefix_len: u8) -> Option<Self> {
        IpNet::new(address, prefix_len).ok().map(|net| Self { net })
    }

    /// Parse an `ip` or `ip/prefix` token.
    ///
    /// Returns `None` (not an error) when the token is not an IP literal, which
    /// is how the rule parser tells subnets apart from hostname patterns.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (addr, prefix) = match text.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (text, None),
        };
        let address: IpAddr = addr.parse().ok()?;
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok()?,
            None => max_prefix_len(&address),
        };
        Self::new(address, prefix_len)
    }

    /// Build a subnet from 4 or 16 raw address bytes.
    pub fn from_raw(bytes: &[u8], prefix_len: u8) -> Option<Self> {
        Self::new(ip_from_bytes(bytes)?, prefix_len)
    }

    /// The address as written, host bits included.
    pub fn address(&self) -> IpAddr {
        self.net.addr()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.net, IpNet::V4(_))
    }

    /// True iff `ip` has the same family and the same first `prefix_len` bits.
    pub fn matches(&self, ip: IpAddr) -> bool {
        self.net.contains(&ip)
    }

    /// Same as [`Subnet::matches`] for a raw 4 or 16 byte address.
    pub fn matches_bytes(&self, bytes: &[u8]) -> bool {
        ip_from_bytes(bytes).is_some_and(|ip| self.matches(ip))
    }

    /// True when every address matched by `other` is also matched by `self`.
    pub fn covers(&self, other: &Subnet) -> bool {
        self.is_ipv4() == other.is_ipv4()
            && self.prefix_len() <= other.prefix_len()
            && self.matches(other.address())
    }

    /// Truncated, read-only network used by the compiled lookup tables.
    pub fn to_immutable(&self) -> IpNet {
        self.net.trunc()
    }
}

impl Ord for Subnet {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.net, other.net) {
            (IpNet::V4(a), IpNet::V4(b)) => a
                .addr()
                .octets()
                .cmp(&b.addr().octets())
                .then(a.prefix_len().cmp(&b.prefix_len())),
            (IpNet::V6(a), IpNet::V6(b)) => a
                .addr()
                .octets()
                .cmp(&b.addr().octets())
                .then(a.prefix_len().cmp(&b.prefix_len())),
            (IpNet::V4(_), IpNet::V6(_)) => Ordering::Less,
            (IpNet::V6(_), IpNet::V4(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Subnet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.net.addr(), self.net.prefix_len())
    }
}

impl FromStr for Subnet {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| AclError::InvalidSubnet(s.to_string()))
    }
}

impl From<IpNet> for Subnet {
    fn from(net: IpNet) -> Self {
        Self { net }
    }
}

fn max_prefix_len(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

pub(crate) fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        Some(IpAddr::V4(Ipv4Addr::from(v4)))
    } else if let Ok(v6) = <[u8; 16]>::try_from(bytes) {
        Some(IpAddr::V6(Ipv6Addr::from(v6)))
    } else {
        None
    }
}
