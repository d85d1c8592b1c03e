//! TLS material for the store client connection.
//!
//! TLS is enabled only when a client certificate, its private key and a CA
//! bundle are all configured. The material is loaded as PEM bytes; turning
//! it into a concrete TLS library configuration is the connector's job.
//!
//! ```text
//! TlsConfig    - file paths
//! TlsIdentity  - client certificate chain + private key
//! TrustStore   - CA bundle used to verify the store
//! TlsMaterial  - identity + trust store, ready for a connector
//! ```

use anyhow::{Context, Result};
use std::path::Path;

const PEM_CERT_MARKER: &str = "-----BEGIN CERTIFICATE-----";

/// TLS file locations for the store client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Client certificate chain path.
    pub cert_path: String,
    /// Client private key path.
    pub key_path: String,
    /// CA bundle path.
    pub ca_path: String,
}

impl TlsConfig {
    /// Create a TLS configuration.
    pub fn new(
        cert_path: impl Into<String>,
        key_path: impl Into<String>,
        ca_path: impl Into<String>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: ca_path.into(),
        }
    }

    /// Build from optional paths. TLS is on only when all three are set.
    pub fn from_parts(
        cert_path: Option<&str>,
        key_path: Option<&str>,
        ca_path: Option<&str>,
    ) -> Option<Self> {
        match (cert_path, key_path, ca_path) {
            (Some(cert), Some(key), Some(ca)) => Some(Self::new(cert, key, ca)),
            _ => None,
        }
    }

    /// Validate that TLS files exist.
    pub fn validate(&self) -> Result<()> {
        if !Path::new(&self.cert_path).exists() {
            anyhow::bail!("TLS client certificate not found: {}", self.cert_path);
        }
        if !Path::new(&self.key_path).exists() {
            anyhow::bail!("TLS private key not found: {}", self.key_path);
        }
        if !Path::new(&self.ca_path).exists() {
            anyhow::bail!("TLS CA bundle not found: {}", self.ca_path);
        }
        Ok(())
    }

    /// Load identity and trust store.
    pub fn load(&self) -> Result<TlsMaterial> {
        TlsMaterial::load(self)
    }
}

/// Client certificate chain and private key.
#[derive(Clone)]
pub struct TlsIdentity {
    /// Certificate chain in PEM format.
    pub cert_chain_pem: Vec<u8>,
    /// Private key in PEM format.
    pub key_pem: Vec<u8>,
    /// Common name from the certificate, if found.
    pub common_name: Option<String>,
}

impl TlsIdentity {
    /// Load an identity from file paths.
    pub fn load(cert_path: &str, key_path: &str) -> Result<Self> {
        let cert_chain_pem = std::fs::read(cert_path)
            .with_context(|| format!("failed to read client certificate: {}", cert_path))?;
        if count_certificates(&cert_chain_pem) == 0 {
            anyhow::bail!("no PEM certificate found in {}", cert_path);
        }
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("failed to read private key: {}", key_path))?;
        if !String::from_utf8_lossy(&key_pem).contains("PRIVATE KEY-----") {
            anyhow::bail!("no PEM private key found in {}", key_path);
        }

        let common_name = parse_common_name(&cert_chain_pem);
        Ok(Self {
            cert_chain_pem,
            key_pem,
            common_name,
        })
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_chain_bytes", &self.cert_chain_pem.len())
            .field("key", &"<redacted>")
            .field("common_name", &self.common_name)
            .finish()
    }
}

/// CA certificates used to verify the store.
#[derive(Debug, Clone)]
pub struct TrustStore {
    /// CA certificates in PEM format.
    pub ca_certs_pem: Vec<u8>,
    /// Number of certificates loaded.
    pub cert_count: usize,
}

impl TrustStore {
    /// Load a trust store from a CA bundle file.
    pub fn load(ca_path: &str) -> Result<Self> {
        let ca_certs_pem = std::fs::read(ca_path)
            .with_context(|| format!("failed to read CA bundle: {}", ca_path))?;
        let cert_count = count_certificates(&ca_certs_pem);
        if cert_count == 0 {
            anyhow::bail!("CA bundle {} contains no certificates", ca_path);
        }
        Ok(Self {
            ca_certs_pem,
            cert_count,
        })
    }
}

/// Everything a connector needs to open a TLS session to the store.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// Client identity.
    pub identity: TlsIdentity,
    /// Store CA bundle.
    pub trust: TrustStore,
}

impl TlsMaterial {
    /// Validate paths and load identity and trust store.
    pub fn load(config: &TlsConfig) -> Result<Self> {
        config.validate()?;
        let identity = TlsIdentity::load(&config.cert_path, &config.key_path)?;
        let trust = TrustStore::load(&config.ca_path)?;
        tracing::debug!(
            common_name = ?identity.common_name,
            ca_certs = trust.cert_count,
            "loaded store TLS material"
        );
        Ok(Self { identity, trust })
    }
}

fn count_certificates(pem: &[u8]) -> usize {
    String::from_utf8_lossy(pem).matches(PEM_CERT_MARKER).count()
}

// Heuristic: looks for a `CN=` marker in the PEM text.
fn parse_common_name(cert_pem: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(cert_pem);
    let start = text.find("CN=")? + 3;
    let rest = &text[start..];
    let end = rest.find([',', '\n', '/']).unwrap_or(rest.len());
    let cn = rest[..end].trim();
    (!cn.is_empty()).then(|| cn.to_string())
}
