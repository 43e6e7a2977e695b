//! IPv4 address and netmask utilities scoped to the routable mesh range.

use std::{fmt, net::Ipv4Addr};

use snafu::Snafu;

/// An IPv4 address stored in host byte order.
///
/// Kept as a plain `u32` newtype rather than [`Ipv4Addr`] so that netmask
/// arithmetic (`&`, `bitmask`) reads the way it does in the routing tables
/// below, without repeated conversions at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub u32);

impl Addr {
    pub const fn new(host_order: u32) -> Self {
        Self(host_order)
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ipv4Addr::from(self.0))
    }
}

impl serde::Serialize for Addr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Addr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let ip: Ipv4Addr = s.parse().map_err(serde::de::Error::custom)?;
        Ok(Addr::from(ip))
    }
}

impl From<Ipv4Addr> for Addr {
    fn from(ip: Ipv4Addr) -> Self {
        Addr(u32::from(ip))
    }
}

impl From<Addr> for Ipv4Addr {
    fn from(addr: Addr) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("netmask length {len} is out of range (expected 0..=32)"))]
    InvalidNetmask { len: u8 },
}

/// Returns the 32-bit mask with `len` leading one bits.
pub fn bitmask(len: u8) -> Result<u32, Error> {
    match len {
        0 => Ok(0),
        1..=32 => Ok(u32::MAX << (32 - len as u32)),
        _ => InvalidNetmaskSnafu { len }.fail(),
    }
}

/// Number of leading one bits in a big-endian netmask, as delivered by the kernel.
pub fn netmask_len(mask: u32) -> u8 {
    mask.count_ones() as u8
}

/// Tests whether `addr` falls within `[min, max]` inclusive, the configured
/// routable range of the mesh (defaults to 172.16.0.0 .. 172.31.255.0, i.e.
/// 172.16.0.0/12's host range).
pub fn addr_in_range(addr: Addr, min: Addr, max: Addr) -> bool {
    addr.0 >= min.0 && addr.0 <= max.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_edges() {
        assert_eq!(bitmask(0).unwrap(), 0);
        assert_eq!(bitmask(32).unwrap(), u32::MAX);
        assert_eq!(bitmask(24).unwrap(), 0xFFFF_FF00);
        assert!(bitmask(33).is_err());
    }

    #[test]
    fn range_check() {
        let min = Addr::from("172.16.0.0".parse::<Ipv4Addr>().unwrap());
        let max = Addr::from("172.31.255.255".parse::<Ipv4Addr>().unwrap());
        assert!(addr_in_range(
            Addr::from("172.16.0.5".parse::<Ipv4Addr>().unwrap()),
            min,
            max
        ));
        assert!(!addr_in_range(
            Addr::from("10.0.0.1".parse::<Ipv4Addr>().unwrap()),
            min,
            max
        ));
    }

    #[test]
    fn display_roundtrip() {
        let a = Addr::from("172.16.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(a.to_string(), "172.16.0.2");
    }
}
