//! Configuration parsing.
//!
//! A thin `serde` + `toml` layer: typed sub-structs for listener, TLS,
//! relay, and I/O log configuration, loaded from a path and validated.
//! Validation failure at startup is a fatal configuration error; failure
//! on `SIGHUP` reload just logs and keeps running on the old config.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Ordered list of bind endpoints.
    #[serde(rename = "listener", default)]
    pub listeners: Vec<ListenerConfig>,

    /// Where to write the pid file.
    pub pid_file: PathBuf,

    /// Server timeout: write-queue drain bound on terminal states, and the
    /// read/write/handshake timeout.
    #[serde(with = "humantime_secs", default = "default_server_timeout")]
    pub server_timeout: Duration,

    /// TCP keepalive toggle, applied to every accepted connection.
    #[serde(default)]
    pub tcp_keepalive: bool,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub iolog: IoLogConfig,
}

fn default_server_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub bind: SocketAddr,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Verify the peer's certificate/hostname. The core does no
    /// authentication beyond this toggle.
    #[serde(default)]
    pub verify_peer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Ordered list of upstream relay endpoints to try.
    #[serde(default)]
    pub endpoints: Vec<SocketAddr>,
    /// Journal-then-forward mode.
    #[serde(default)]
    pub store_first: bool,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoLogConfig {
    /// Root directory under which per-session I/O log directories are
    /// created.
    pub dir: PathBuf,
    /// File mode applied to timing/stream files; write bits are cleared on
    /// completion.
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}

fn default_file_mode() -> u32 {
    0o600
}

impl Default for IoLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/log/auditlogd/io"),
            file_mode: default_file_mode(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::fatal_config(format!("reading {}: {e}", path.display())))?;
        let config: ServerConfig = toml::from_str(&text)
            .map_err(|e| Error::fatal_config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(Error::fatal_config("no listener addresses configured"));
        }
        for listener in &self.listeners {
            if listener.tls && self.tls.is_none() {
                return Err(Error::fatal_config(format!(
                    "listener {} requests tls but no [tls] section is configured",
                    listener.bind
                )));
            }
        }
        if self.relay.enabled && self.relay.endpoints.is_empty() {
            return Err(Error::fatal_config(
                "relay.enabled is true but no relay endpoints are configured",
            ));
        }
        Ok(())
    }
}

/// `serde(with = ...)` helper so `server_timeout` round-trips through TOML
/// as a plain integer number of seconds rather than requiring a
/// `humantime`-formatted string in the config file.
mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_listener_list() {
        let cfg = ServerConfig {
            listeners: vec![],
            pid_file: PathBuf::from("/tmp/auditlogd.pid"),
            server_timeout: Duration::from_secs(30),
            tcp_keepalive: false,
            tls: None,
            relay: RelayConfig::default(),
            iolog: IoLogConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_tls_listener_without_tls_section() {
        let cfg = ServerConfig {
            listeners: vec![ListenerConfig {
                bind: "127.0.0.1:4343".parse().unwrap(),
                tls: true,
            }],
            pid_file: PathBuf::from("/tmp/auditlogd.pid"),
            server_timeout: Duration::from_secs(30),
            tcp_keepalive: false,
            tls: None,
            relay: RelayConfig::default(),
            iolog: IoLogConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_example_toml() {
        let toml_text = r#"
            pid_file = "/var/run/auditlogd.pid"
            server_timeout = 30

            [[listener]]
            bind = "0.0.0.0:4343"
            tls = true

            [tls]
            cert_file = "/etc/auditlogd/cert.pem"
            key_file = "/etc/auditlogd/key.pem"

            [relay]
            enabled = false

            [iolog]
            dir = "/var/log/auditlogd/io"
        "#;
        let cfg: ServerConfig = toml::from_str(toml_text).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.listeners.len(), 1);
        assert!(cfg.listeners[0].tls);
    }
}
