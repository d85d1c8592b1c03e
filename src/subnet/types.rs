//! Subnet lease data model.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Monotonically increasing logical clock of the backing store.
pub type Revision = u64;

/// An IPv4 network: base address plus prefix length (0..=32).
///
/// Host bits of the base address are kept as given, so a subnet written to
/// the store reads back identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subnet(Ipv4Net);

impl Subnet {
    /// Create a subnet, rejecting prefix lengths above 32.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, ipnet::PrefixLenError> {
        Ipv4Net::new(addr, prefix_len).map(Self)
    }

    /// Base address.
    pub fn addr(&self) -> Ipv4Addr {
        self.0.addr()
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    /// The underlying network.
    pub fn net(&self) -> Ipv4Net {
        self.0
    }

    /// Check if the network contains `addr`.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.0.contains(&addr)
    }

    /// Check if two networks intersect.
    ///
    /// Two CIDR blocks intersect exactly when one contains the other's base
    /// address.
    pub fn overlaps(&self, other: &Subnet) -> bool {
        other.contains(self.network()) || self.contains(other.network())
    }

    fn network(&self) -> Ipv4Addr {
        self.0.network()
    }
}

impl From<Ipv4Net> for Subnet {
    fn from(net: Ipv4Net) -> Self {
        Self(net)
    }
}

impl FromStr for Subnet {
    type Err = ipnet::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ipv4Net::from_str(s).map(Self)
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr(), self.prefix_len())
    }
}

/// Attributes stored with a subnet lease.
///
/// The registry never interprets these; field names on the wire match the
/// JSON written by existing deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseAttrs {
    /// Public address of the host owning the lease.
    #[serde(rename = "PublicIP")]
    pub public_ip: Ipv4Addr,

    /// Backend type tag (e.g. "vxlan").
    #[serde(rename = "BackendType", default, skip_serializing_if = "String::is_empty")]
    pub backend_type: String,

    /// Opaque backend-specific data.
    #[serde(rename = "BackendData", default, skip_serializing_if = "Option::is_none")]
    pub backend_data: Option<serde_json::Value>,
}

impl LeaseAttrs {
    /// Create attributes with no backend data.
    pub fn new(public_ip: Ipv4Addr, backend_type: impl Into<String>) -> Self {
        Self {
            public_ip,
            backend_type: backend_type.into(),
            backend_data: None,
        }
    }

    /// Attach backend data.
    pub fn with_backend_data(mut self, data: serde_json::Value) -> Self {
        self.backend_data = Some(data);
        self
    }
}

/// A subnet with its attributes and computed expiration.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    /// The leased subnet.
    pub subnet: Subnet,

    /// Attributes. `None` for removal tombstones.
    pub attrs: Option<LeaseAttrs>,

    /// Absolute expiration. `None` for removal tombstones.
    pub expiration: Option<DateTime<Utc>>,

    /// Remaining TTL in seconds, -1 until computed.
    pub ttl: i64,
}

impl Lease {
    /// A lease decoded from the store, expiration not yet computed.
    pub fn new(subnet: Subnet, attrs: LeaseAttrs) -> Self {
        Self {
            subnet,
            attrs: Some(attrs),
            expiration: None,
            ttl: -1,
        }
    }

    /// A removal tombstone carrying only the subnet.
    pub fn tombstone(subnet: Subnet) -> Self {
        Self {
            subnet,
            attrs: None,
            expiration: None,
            ttl: -1,
        }
    }

    /// Set the expiration and remaining TTL.
    pub fn with_expiration(mut self, expiration: DateTime<Utc>, ttl: i64) -> Self {
        self.expiration = Some(expiration);
        self.ttl = ttl;
        self
    }

    /// Check if the lease has expired at `now`. Tombstones are always expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map_or(true, |exp| exp <= now)
    }
}

/// Kind of lease change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A lease was created or replaced.
    Added,
    /// A lease was deleted or expired.
    Removed,
}

/// Domain-level lease change.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Full lease with attributes and expiration.
    Added(Lease),
    /// Tombstone: only the subnet is meaningful.
    Removed(Lease),
}

impl Event {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Added(_) => EventKind::Added,
            Self::Removed(_) => EventKind::Removed,
        }
    }

    /// The lease carried by this event.
    pub fn lease(&self) -> &Lease {
        match self {
            Self::Added(lease) | Self::Removed(lease) => lease,
        }
    }

    /// The subnet this event is about.
    pub fn subnet(&self) -> Subnet {
        self.lease().subnet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Subnet {
        s.parse().unwrap()
    }

    #[test]
    fn test_overlaps() {
        assert!(net("10.0.0.0/16").overlaps(&net("10.0.1.0/24")));
        assert!(net("10.0.1.0/24").overlaps(&net("10.0.0.0/16")));
        assert!(net("10.0.1.0/24").overlaps(&net("10.0.1.0/24")));
        assert!(!net("10.0.1.0/24").overlaps(&net("10.0.2.0/24")));
        assert!(net("0.0.0.0/0").overlaps(&net("192.168.0.0/16")));
    }

    #[test]
    fn test_display_keeps_host_bits() {
        let s = Subnet::new(Ipv4Addr::new(10, 0, 1, 5), 24).unwrap();
        assert_eq!(s.to_string(), "10.0.1.5/24");
        assert!(Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 33).is_err());
    }

    #[test]
    fn test_attrs_wire_names() {
        let attrs = LeaseAttrs::new(Ipv4Addr::new(192, 168, 2, 1), "vxlan")
            .with_backend_data(serde_json::json!({"VNI": 1}));
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(json["PublicIP"], "192.168.2.1");
        assert_eq!(json["BackendType"], "vxlan");
        assert_eq!(json["BackendData"]["VNI"], 1);
    }

    #[test]
    fn test_tombstone_is_expired() {
        let lease = Lease::tombstone(net("10.0.0.0/24"));
        assert!(lease.attrs.is_none());
        assert!(lease.is_expired_at(Utc::now()));
        assert_eq!(Event::Removed(lease).kind(), EventKind::Removed);
    }
}
