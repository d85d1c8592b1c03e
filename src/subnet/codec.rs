//! Key and value encoding for subnet leases.
//!
//! Layout under the configured prefix:
//!
//! ```text
//! <prefix>/config                      opaque network config blob
//! <prefix>/subnets/<A.B.C.D>-<len>     JSON-encoded LeaseAttrs, bound to a store lease
//! ```
//!
//! Keys under `<prefix>/subnets/` whose suffix does not match the subnet
//! grammar are never treated as leases; the grammar check runs before any
//! decode so foreign keys are skipped cheaply.

use super::types::{Lease, LeaseAttrs, Subnet};
use regex::bytes::Regex;
use std::net::Ipv4Addr;
use std::sync::LazyLock;
use thiserror::Error;

/// Four octets without leading zeros, a dash, and a prefix length 0..=32.
static SUBNET_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^((0|[1-9][0-9]?|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}(0|[1-9][0-9]?|1[0-9]{2}|2[0-4][0-9]|25[0-5])-([0-9]|[1-2][0-9]|3[0-2])$",
    )
    .expect("invalid subnet suffix pattern")
});

const CONFIG_SEGMENT: &str = "config";
const SUBNETS_SEGMENT: &str = "subnets";

/// Decode failure for a key suffix or stored value.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Suffix does not match the subnet grammar.
    #[error("suffix {suffix:?} is not a subnet key")]
    BadSuffix { suffix: String },

    /// Key does not live under the subnets namespace.
    #[error("key {key:?} is outside the subnets namespace")]
    OutsideNamespace { key: String },

    /// Stored attributes are not valid JSON for LeaseAttrs.
    #[error("invalid lease attributes: {0}")]
    BadAttrs(#[from] serde_json::Error),
}

impl From<CodecError> for crate::core::error::RegistryError {
    fn from(err: CodecError) -> Self {
        let key = match &err {
            CodecError::BadSuffix { suffix } => suffix.clone(),
            CodecError::OutsideNamespace { key } => key.clone(),
            CodecError::BadAttrs(_) => String::new(),
        };
        Self::Malformed {
            key,
            reason: err.to_string(),
        }
    }
}

/// Check a key suffix against the subnet grammar without decoding it.
pub fn is_subnet_suffix(suffix: &[u8]) -> bool {
    SUBNET_SUFFIX.is_match(suffix)
}

/// Encode a subnet as a key suffix: `A.B.C.D-len`.
pub fn encode_subnet_key(subnet: &Subnet) -> String {
    format!("{}-{}", subnet.addr(), subnet.prefix_len())
}

/// Decode a key suffix produced by [`encode_subnet_key`].
pub fn decode_subnet_key(suffix: &[u8]) -> Result<Subnet, CodecError> {
    let bad = || CodecError::BadSuffix {
        suffix: String::from_utf8_lossy(suffix).into_owned(),
    };
    if !is_subnet_suffix(suffix) {
        return Err(bad());
    }
    // The grammar guarantees ASCII with exactly one dash.
    let text = std::str::from_utf8(suffix).map_err(|_| bad())?;
    let (addr, len) = text.split_once('-').ok_or_else(bad)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| bad())?;
    let len: u8 = len.parse().map_err(|_| bad())?;
    Subnet::new(addr, len).map_err(|_| bad())
}

/// Serialize lease attributes.
pub fn encode_attrs(attrs: &LeaseAttrs) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(attrs)?)
}

/// Deserialize lease attributes.
pub fn decode_attrs(value: &[u8]) -> Result<LeaseAttrs, CodecError> {
    Ok(serde_json::from_slice(value)?)
}

/// Key layout for one registry namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
    subnets_prefix: String,
}

impl KeyLayout {
    /// Create a layout rooted at `prefix`.
    ///
    /// The prefix is cleaned like a slash-separated path: repeated slashes
    /// collapse, `.` and `..` segments resolve, a trailing slash is dropped.
    /// An empty prefix roots keys at `subnets/...` and `config`.
    pub fn new(prefix: &str) -> Self {
        let prefix = clean_prefix(prefix);
        let subnets_prefix = join(&prefix, SUBNETS_SEGMENT) + "/";
        Self {
            prefix,
            subnets_prefix,
        }
    }

    /// The namespace root.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of the network config blob.
    pub fn config_key(&self) -> String {
        join(&self.prefix, CONFIG_SEGMENT)
    }

    /// Prefix shared by every subnet key, including the trailing slash.
    pub fn subnets_prefix(&self) -> &str {
        &self.subnets_prefix
    }

    /// Full key for a subnet.
    pub fn subnet_key(&self, subnet: &Subnet) -> String {
        format!("{}{}", self.subnets_prefix, encode_subnet_key(subnet))
    }

    /// The suffix of `key` under the subnets namespace, if it lives there.
    pub fn subnet_suffix<'a>(&self, key: &'a [u8]) -> Option<&'a [u8]> {
        key.strip_prefix(self.subnets_prefix.as_bytes())
    }

    /// Prefilter: does `key` name a subnet lease?
    pub fn is_subnet_key(&self, key: &[u8]) -> bool {
        self.subnet_suffix(key).is_some_and(is_subnet_suffix)
    }

    /// Decode the subnet named by a full key.
    pub fn parse_subnet_key(&self, key: &[u8]) -> Result<Subnet, CodecError> {
        let suffix = self
            .subnet_suffix(key)
            .ok_or_else(|| CodecError::OutsideNamespace {
                key: String::from_utf8_lossy(key).into_owned(),
            })?;
        decode_subnet_key(suffix)
    }

    /// Decode a full key/value pair into a lease with no expiration yet.
    pub fn parse_lease(&self, key: &[u8], value: &[u8]) -> Result<Lease, CodecError> {
        let subnet = self.parse_subnet_key(key)?;
        let attrs = decode_attrs(value)?;
        Ok(Lease::new(subnet, attrs))
    }
}

fn clean_prefix(prefix: &str) -> String {
    let rooted = prefix.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in prefix.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if rooted {
        format!("/{joined}")
    } else {
        joined
    }
}

fn join(prefix: &str, segment: &str) -> String {
    match prefix {
        "" => segment.to_string(),
        "/" => format!("/{segment}"),
        _ => format!("{prefix}/{segment}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_subnet_key() {
        let subnet: Subnet = "10.0.1.0/24".parse().unwrap();
        assert_eq!(encode_subnet_key(&subnet), "10.0.1.0-24");
    }

    #[test]
    fn test_grammar_accepts() {
        for ok in [
            "0.0.0.0-0",
            "0.0.0.0-1",
            "10.0.0.0-8",
            "10.0.1.0-24",
            "255.255.255.255-32",
            "1.22.199.250-9",
        ] {
            assert!(is_subnet_suffix(ok.as_bytes()), "{ok}");
        }
    }

    #[test]
    fn test_grammar_rejects() {
        for bad in [
            "10.0.0.256-24",
            "10.0.0.0-33",
            "abc-24",
            "010.0.0.0-24",
            "10.0.0.0-024",
            "10.0.0-24",
            "10.0.0.0/24",
            "10.0.0.0-24 ",
            "10.0.0.0-\u{0668}",
            "",
        ] {
            assert!(!is_subnet_suffix(bad.as_bytes()), "{bad}");
            assert!(decode_subnet_key(bad.as_bytes()).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_layout_keys() {
        let layout = KeyLayout::new("/coreos.com/network/");
        assert_eq!(layout.config_key(), "/coreos.com/network/config");
        assert_eq!(layout.subnets_prefix(), "/coreos.com/network/subnets/");

        let subnet: Subnet = "10.0.5.0/24".parse().unwrap();
        let key = layout.subnet_key(&subnet);
        assert_eq!(key, "/coreos.com/network/subnets/10.0.5.0-24");
        assert!(layout.is_subnet_key(key.as_bytes()));
        assert_eq!(layout.parse_subnet_key(key.as_bytes()).unwrap(), subnet);
    }

    #[test]
    fn test_layout_cleans_prefix() {
        let cases = [
            ("/coreos.com//network", "/coreos.com/network/config"),
            ("/coreos.com/./network/", "/coreos.com/network/config"),
            ("/coreos.com/x/../network", "/coreos.com/network/config"),
            ("/", "/config"),
            ("//", "/config"),
            ("", "config"),
            ("net", "net/config"),
        ];
        for (prefix, config_key) in cases {
            assert_eq!(KeyLayout::new(prefix).config_key(), config_key, "{prefix:?}");
        }

        assert_eq!(KeyLayout::new("").subnets_prefix(), "subnets/");
        assert_eq!(KeyLayout::new("/").subnets_prefix(), "/subnets/");
        let subnet: Subnet = "10.0.5.0/24".parse().unwrap();
        assert_eq!(
            KeyLayout::new("").subnet_key(&subnet),
            "subnets/10.0.5.0-24"
        );
    }

    #[test]
    fn test_layout_filters_foreign_keys() {
        let layout = KeyLayout::new("/net");
        assert!(!layout.is_subnet_key(b"/net/subnets/readme"));
        assert!(!layout.is_subnet_key(b"/net/config"));
        assert!(!layout.is_subnet_key(b"/other/subnets/10.0.0.0-24"));
        assert!(matches!(
            layout.parse_subnet_key(b"/other/subnets/10.0.0.0-24"),
            Err(CodecError::OutsideNamespace { .. })
        ));
    }

    #[test]
    fn test_parse_lease_bad_value() {
        let layout = KeyLayout::new("/net");
        let err = layout
            .parse_lease(b"/net/subnets/10.0.0.0-24", b"not json")
            .unwrap_err();
        assert!(matches!(err, CodecError::BadAttrs(_)));
    }
}
