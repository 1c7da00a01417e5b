use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

/// An 128-bit identifier used to identify a port on a network adapter, a port
/// on a router, or a multicast group.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Gid([u8; 16]);

impl Gid {
    /// The all-zero GID, used on the wire to mean "no group".
    pub const ZERO: Gid = Gid([0; 16]);

    /// Get the raw bytes of this GID.
    #[inline]
    pub fn raw(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether this GID is all zeroes.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Whether this GID names a multicast group (prefix `ff00::/8`).
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }
}

impl fmt::Debug for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gid = Ipv6Addr::from(*self);
        f.debug_tuple("Gid").field(&gid.to_string()).finish()
    }
}

impl fmt::Display for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ipv6Addr::from(*self).fmt(f)
    }
}

impl From<Ipv6Addr> for Gid {
    #[inline]
    fn from(addr: Ipv6Addr) -> Self {
        Self(addr.octets())
    }
}

impl From<Gid> for Ipv6Addr {
    #[inline]
    fn from(gid: Gid) -> Self {
        Ipv6Addr::from(gid.0)
    }
}

impl From<[u8; 16]> for Gid {
    #[inline]
    fn from(raw: [u8; 16]) -> Self {
        Self(raw)
    }
}

impl From<Gid> for [u8; 16] {
    #[inline]
    fn from(gid: Gid) -> Self {
        gid.0
    }
}

impl Serialize for Gid {
    #[inline]
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Gid {
    #[inline]
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as Deserialize<'de>>::deserialize(deserializer)?;
        s.parse::<Ipv6Addr>()
            .map(Self::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_prefix() {
        let gid: Gid = "ff12:401b:ffff::1".parse::<Ipv6Addr>().unwrap().into();
        assert!(gid.is_multicast());
        assert!(!Gid::ZERO.is_multicast());
        assert!(Gid::ZERO.is_zero());
    }

    #[test]
    fn test_serde_as_text() {
        let gid: Gid = "fe80::2:c903:a:1f31".parse::<Ipv6Addr>().unwrap().into();
        let json = serde_json::to_string(&gid).unwrap();
        assert_eq!(json, "\"fe80::2:c903:a:1f31\"");
        let back: Gid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, gid);
    }
}
