//! Connection configuration and client-identity loading.

use std::io::BufReader;
use std::time::Duration;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};

/// The caller-supplied certificate chain presented to the server.
#[derive(Debug)]
pub struct ClientIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl ClientIdentity {
    /// Load a PEM certificate chain and private key.
    pub fn from_pem_files(cert_path: &str, key_path: &str) -> Result<Self> {
        let cert_data =
            std::fs::read(cert_path).with_context(|| format!("failed to read cert: {cert_path}"))?;
        let mut reader = BufReader::new(cert_data.as_slice());
        let cert_chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to parse certificates")?;
        if cert_chain.is_empty() {
            anyhow::bail!("no certificates found in {cert_path}");
        }

        let key_data =
            std::fs::read(key_path).with_context(|| format!("failed to read key: {key_path}"))?;
        let mut reader = BufReader::new(key_data.as_slice());
        let key = loop {
            match rustls_pemfile::read_one(&mut reader)? {
                Some(rustls_pemfile::Item::Pkcs1Key(key)) => break PrivateKeyDer::Pkcs1(key),
                Some(rustls_pemfile::Item::Pkcs8Key(key)) => break PrivateKeyDer::Pkcs8(key),
                Some(rustls_pemfile::Item::Sec1Key(key)) => break PrivateKeyDer::Sec1(key),
                Some(_) => continue,
                None => anyhow::bail!("no private key found in {key_path}"),
            }
        };

        Ok(Self { cert_chain, key })
    }
}

/// Everything needed to reach and authenticate with a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Access tokens sent with Authenticate.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Skip certificate verification entirely (after an explicit caller
    /// decision following a trust failure).
    #[serde(default)]
    pub ignore_verification: bool,

    /// TCP connect timeout; `None` leaves it to the OS.
    #[serde(default, with = "opt_duration_secs")]
    pub connect_timeout: Option<Duration>,

    /// Client certificate presented during the TLS handshake.
    #[serde(skip)]
    pub identity: Option<ClientIdentity>,
}

fn default_port() -> u16 {
    64_738
}

impl ConnectConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: None,
            tokens: Vec::new(),
            ignore_verification: false,
            connect_timeout: Some(Duration::from_secs(30)),
            identity: None,
        }
    }
}

mod opt_duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_the_protocol_port() {
        let config = ConnectConfig::new("voice.example.com", "alice");
        assert_eq!(config.port, 64_738);
        assert!(!config.ignore_verification);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = ConnectConfig {
            tokens: vec!["token".into()],
            connect_timeout: Some(Duration::from_secs(5)),
            ..ConnectConfig::new("example.org", "bob")
        };
        let json = serde_json::to_string(&config).unwrap();
        let decoded: ConnectConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.host, "example.org");
        assert_eq!(decoded.tokens, vec!["token".to_string()]);
        assert_eq!(decoded.connect_timeout, Some(Duration::from_secs(5)));
    }
}
