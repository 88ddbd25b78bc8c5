//! Configuration for a LinkNode

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{LinkError, Result};
use crate::network::framing::DEFAULT_MAX_FRAME_LEN;
use crate::node::name_generator;
use crate::types::{SyncDirection, UserIdentity};

/// Server address a client falls back to when no host file is present
pub const DEFAULT_SERVER_ADDR: &str = "192.168.0.221:8888";

/// Address a server binds when no host file is present
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8888";

/// Main configuration for a LinkNode
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// User id sent in handshake, login and direction messages
    pub user_id: i32,

    /// User name (auto-generated if None)
    pub user_name: Option<String>,

    /// Period between two transform broadcasts, in milliseconds
    pub sync_interval_ms: u64,

    /// Time a client waits for `ReplyUdpHost` after the stream opens
    pub handshake_timeout_ms: u64,

    /// Timeout for step() in milliseconds
    /// step() returns when either an event is produced or this timeout elapses
    pub step_timeout_ms: u64,

    /// Largest accepted stream frame in bytes
    pub max_frame_len: usize,

    /// Direction a server applies to a session when it logs in:
    /// server to client when true, client to server otherwise
    pub server_to_client: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            user_id: 1,
            user_name: None,
            sync_interval_ms: 100,
            handshake_timeout_ms: 5000,
            step_timeout_ms: 5000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            server_to_client: false,
        }
    }
}

impl LinkConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user id
    pub fn with_user_id(mut self, id: i32) -> Self {
        self.user_id = id;
        self
    }

    /// Set the user name
    pub fn with_user_name(mut self, name: String) -> Self {
        self.user_name = Some(name);
        self
    }

    /// Set the sync interval in milliseconds
    pub fn with_sync_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sync_interval_ms = interval_ms;
        self
    }

    /// Set the handshake timeout in milliseconds
    pub fn with_handshake_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.handshake_timeout_ms = timeout_ms;
        self
    }

    /// Set the step timeout in milliseconds
    pub fn with_step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step_timeout_ms = timeout_ms;
        self
    }

    /// Set the maximum stream frame length
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Set the direction a server applies on login
    pub fn with_server_to_client(mut self, server_to_client: bool) -> Self {
        self.server_to_client = server_to_client;
        self
    }

    /// Direction a server applies to a freshly logged-in session
    pub fn default_direction(&self) -> SyncDirection {
        if self.server_to_client {
            SyncDirection::ServerToClient
        } else {
            SyncDirection::ClientToServer
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Check values that would make a node unusable
    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "sync interval must be positive".to_string(),
            ));
        }
        if self.max_frame_len == 0 {
            return Err(LinkError::InvalidConfig(
                "max frame length must be positive".to_string(),
            ));
        }
        if let Some(name) = &self.user_name {
            if name.is_empty() {
                return Err(LinkError::InvalidConfig(
                    "user name cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Identity to announce, generating a name when none is configured
    pub(crate) fn resolve_identity(&self) -> UserIdentity {
        let name = self
            .user_name
            .clone()
            .unwrap_or_else(name_generator::generate_random_name);
        UserIdentity::new(self.user_id, name)
    }
}

/// Parse an `ip:port` host line
pub fn parse_host(text: &str) -> Result<SocketAddr> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| LinkError::InvalidAddress("empty host file".to_string()))?;
    line.parse()
        .map_err(|_| LinkError::InvalidAddress(line.to_string()))
}

/// Read the address from a host file, falling back to `fallback`
///
/// A missing or unparsable file is not an error: it is logged and the
/// fallback is used.
pub fn load_host_file(path: impl AsRef<Path>, fallback: SocketAddr) -> SocketAddr {
    let path = path.as_ref();
    match std::fs::read_to_string(path)
        .map_err(LinkError::from)
        .and_then(|text| parse_host(&text))
    {
        Ok(addr) => {
            tracing::info!("Loaded host {} from {}", addr, path.display());
            addr
        }
        Err(e) => {
            tracing::warn!(
                "Using default host {} ({}: {})",
                fallback,
                path.display(),
                e
            );
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.sync_interval(), Duration::from_millis(100));
        assert_eq!(config.handshake_timeout_ms, 5000);
        assert_eq!(config.default_direction(), SyncDirection::ClientToServer);
        assert!(config.validate().is_ok());
        assert_eq!(
            DEFAULT_SERVER_ADDR.parse::<SocketAddr>().unwrap().port(),
            8888
        );
    }

    #[test]
    fn test_builder_methods() {
        let config = LinkConfig::new()
            .with_user_id(7)
            .with_user_name("Alice".to_string())
            .with_server_to_client(true)
            .with_handshake_timeout_ms(250);
        assert_eq!(config.resolve_identity(), UserIdentity::new(7, "Alice"));
        assert_eq!(config.default_direction(), SyncDirection::ServerToClient);
        assert_eq!(config.handshake_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_generated_name_when_absent() {
        let identity = LinkConfig::default().resolve_identity();
        assert!(!identity.name.is_empty());
    }

    #[test]
    fn test_invalid_values() {
        assert!(LinkConfig::new().with_sync_interval_ms(0).validate().is_err());
        assert!(LinkConfig::new().with_max_frame_len(0).validate().is_err());
        assert!(LinkConfig::new()
            .with_user_name(String::new())
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_host() {
        assert_eq!(
            parse_host("\n# pc address\n 10.0.0.2:9000 \n").unwrap(),
            "10.0.0.2:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_host("").is_err());
        assert!(parse_host("localhost").is_err());
    }

    #[test]
    fn test_load_host_file_falls_back() {
        let fallback: SocketAddr = DEFAULT_BIND_ADDR.parse().unwrap();
        let missing = std::env::temp_dir().join("holo-link-missing-host.ip");
        assert_eq!(load_host_file(&missing, fallback), fallback);

        let path = std::env::temp_dir().join(format!("holo-link-host-{}.ip", std::process::id()));
        std::fs::write(&path, "127.0.0.1:7777").unwrap();
        assert_eq!(
            load_host_file(&path, fallback),
            "127.0.0.1:7777".parse::<SocketAddr>().unwrap()
        );
        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(load_host_file(&path, fallback), fallback);
        let _ = std::fs::remove_file(&path);
    }
}
