//! Control-plane request for the tunnel device
//!
//! The device is configured with a newline-delimited `key=value` text
//! protocol. Field order and literal values matter, so the request is built
//! as an ordered list of pairs in exactly one place and serialized from it.

use std::fmt;

use crate::config::{InterfaceConfig, Key, PeerConfig, WireGuardConfig};
use crate::error::{ConfigError, DeviceError};

/// Route every IPv4 destination through the peer
pub const ROUTE_ALL_V4: &str = "0.0.0.0/0";
/// Route every IPv6 destination through the peer
pub const ROUTE_ALL_V6: &str = "::0/0";

/// An ordered list of control-plane settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UapiRequest {
    entries: Vec<(String, String)>,
}

impl UapiRequest {
    /// Build the request that configures `interface` with a single `peer`
    pub fn for_peer(interface: &InterfaceConfig, peer: &PeerConfig) -> Self {
        let preshared_key = peer.preshared_key.unwrap_or(Key::ZERO);

        let entries = [
            ("private_key", interface.private_key.to_string()),
            ("public_key", peer.public_key.to_string()),
            ("endpoint", peer.endpoint.to_string()),
            (
                "persistent_keepalive_interval",
                peer.persistent_keepalive.to_string(),
            ),
            ("preshared_key", preshared_key.to_string()),
            ("allowed_ip", ROUTE_ALL_V4.to_string()),
            ("allowed_ip", ROUTE_ALL_V6.to_string()),
        ];

        Self {
            entries: entries
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        }
    }

    /// Build the request for a loaded configuration's active peer
    pub fn from_config(config: &WireGuardConfig) -> Result<Self, ConfigError> {
        let peer = config
            .active_peer()
            .ok_or(ConfigError::Structure("at least one peer section"))?;
        Ok(Self::for_peer(&config.interface, peer))
    }

    /// Parse request text as received by a device
    pub fn parse(text: &str) -> Result<Self, DeviceError> {
        let mut entries = Vec::new();

        for (line_num, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| DeviceError::InvalidRequest {
                line: line_num + 1,
                message: format!("expected key=value, got: {}", line),
            })?;

            if key.is_empty() {
                return Err(DeviceError::InvalidRequest {
                    line: line_num + 1,
                    message: "empty key".to_string(),
                });
            }

            entries.push((key.to_string(), value.to_string()));
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for UapiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}
