//! WireGuard configuration loader
//!
//! Turns a wg-quick style document with one [Interface] and one or more
//! [Peer] sections into a validated [`WireGuardConfig`].

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use super::codec::{self, HostLookup, Key, SystemLookup};
use super::document::{Document, Section};
use crate::error::{CodecError, ConfigError};

/// MTU used when the interface does not set one
pub const DEFAULT_MTU: u16 = 1420;

/// Smallest MTU an IPv4-only interface runs with
pub const MIN_MTU_IPV4: u16 = 576;

/// Smallest MTU once any IPv6 address is configured
pub const MIN_MTU_IPV6: u16 = 1280;

/// Minimum MTU for an interface carrying `addresses`
pub fn min_mtu(addresses: &[IpAddr]) -> u16 {
    if addresses.iter().any(IpAddr::is_ipv6) {
        MIN_MTU_IPV6
    } else {
        MIN_MTU_IPV4
    }
}

const INTERFACE: &str = "Interface";
const PEER: &str = "Peer";

/// Where a configuration document comes from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A file on disk
    Path(PathBuf),
    /// Standard input, read to the end
    Stdin,
    /// An in-memory document
    Text(String),
}

impl ConfigSource {
    /// Interpret a command-line argument; `-` means standard input
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            Self::Stdin
        } else {
            Self::Path(PathBuf::from(arg))
        }
    }
}

/// Complete WireGuard configuration
#[derive(Debug, Clone)]
pub struct WireGuardConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations, in document order (never empty)
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Our private key
    pub private_key: Key,
    /// Tunnel addresses, prefix lengths dropped
    pub address: Vec<IpAddr>,
    /// DNS servers reachable through the tunnel
    pub dns: Vec<IpAddr>,
    /// MTU as written in the file; `None` when absent
    pub mtu: Option<u16>,
}

impl InterfaceConfig {
    /// MTU to bring the device up with
    pub fn effective_mtu(&self) -> u16 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }
}

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's public key
    pub public_key: Key,
    /// Endpoint resolved once at load time
    pub endpoint: SocketAddr,
    /// Pre-shared key (optional)
    pub preshared_key: Option<Key>,
    /// Keepalive interval in seconds, 0 = disabled
    pub persistent_keepalive: u16,
}

impl WireGuardConfig {
    /// Load a configuration from any source, resolving endpoints with the system resolver
    pub fn load(source: &ConfigSource) -> Result<Self, ConfigError> {
        match source {
            ConfigSource::Path(path) => Self::from_file(path),
            ConfigSource::Stdin => {
                let mut content = String::new();
                std::io::stdin().read_to_string(&mut content)?;
                Self::parse(&content)
            }
            ConfigSource::Text(content) => Self::parse(content),
        }
    }

    /// Parse a WireGuard configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a WireGuard configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::parse_with(content, &SystemLookup)
    }

    /// Parse a configuration, resolving peer endpoint hostnames through `lookup`
    pub fn parse_with(content: &str, lookup: &dyn HostLookup) -> Result<Self, ConfigError> {
        let document = Document::parse(content)?;

        let interfaces: Vec<&Section> = document.sections_named(INTERFACE).collect();
        if interfaces.len() != 1 {
            return Err(ConfigError::Structure(
                "one (and only one) interface section",
            ));
        }

        let peer_sections: Vec<&Section> = document.sections_named(PEER).collect();
        if peer_sections.is_empty() {
            return Err(ConfigError::Structure("at least one peer section"));
        }

        for section in document.sections() {
            if !section.name.eq_ignore_ascii_case(INTERFACE) && !section.name.eq_ignore_ascii_case(PEER) {
                tracing::debug!("Ignoring unknown section [{}] at line {}", section.name, section.line);
            }
        }

        let interface = parse_interface(interfaces[0])?;
        let peers = peer_sections
            .into_iter()
            .map(|section| parse_peer(section, lookup))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(WireGuardConfig { interface, peers })
    }

    /// The peer wired into the running tunnel. Only the first peer is used.
    ///
    /// `None` only for a hand-built value with no peers; loading never
    /// produces one.
    pub fn active_peer(&self) -> Option<&PeerConfig> {
        self.peers.first()
    }
}

fn parse_interface(section: &Section) -> Result<InterfaceConfig, ConfigError> {
    let private_key = required(section, INTERFACE, "PrivateKey")?;
    let private_key = field(codec::decode_key(private_key), "PrivateKey")?;

    let address = required(section, INTERFACE, "Address")?;
    let address = field(codec::parse_address_list(address, true), "Address")?;

    let dns = required(section, INTERFACE, "DNS")?;
    let dns = field(codec::parse_address_list(dns, false), "DNS")?;

    let mtu = section
        .get("MTU")
        .map(|value| field(parse_mtu(value, min_mtu(&address)), "MTU"))
        .transpose()?;

    for key in section.keys() {
        if !matches!(key, "privatekey" | "address" | "dns" | "mtu") {
            tracing::debug!("Unknown interface key: {}", key);
        }
    }

    Ok(InterfaceConfig {
        private_key,
        address,
        dns,
        mtu,
    })
}

fn parse_peer(section: &Section, lookup: &dyn HostLookup) -> Result<PeerConfig, ConfigError> {
    let public_key = required(section, PEER, "PublicKey")?;
    let public_key = field(codec::decode_key(public_key), "PublicKey")?;

    let endpoint = required(section, PEER, "Endpoint")?;
    let endpoint = codec::resolve_endpoint(endpoint, lookup).map_err(|source| match source {
        CodecError::MalformedEndpoint { .. } => ConfigError::InvalidField {
            field: "Endpoint",
            source,
        },
        _ => ConfigError::EndpointResolution {
            endpoint: endpoint.to_string(),
            source,
        },
    })?;

    let persistent_keepalive = section
        .get("PersistentKeepalive")
        .map(|value| field(parse_u16(value), "PersistentKeepalive"))
        .transpose()?
        .unwrap_or(0);

    let preshared_key = section
        .get("PresharedKey")
        .map(|value| field(codec::decode_key(value), "PresharedKey"))
        .transpose()?;

    if section.has("AllowedIPs") {
        tracing::warn!("AllowedIPs is ignored; all traffic is routed through the tunnel");
    }

    for key in section.keys() {
        if !matches!(
            key,
            "publickey" | "endpoint" | "persistentkeepalive" | "presharedkey" | "allowedips"
        ) {
            tracing::debug!("Unknown peer key: {}", key);
        }
    }

    Ok(PeerConfig {
        public_key,
        endpoint,
        preshared_key,
        persistent_keepalive,
    })
}

fn required<'a>(
    section: &'a Section,
    section_name: &'static str,
    key: &'static str,
) -> Result<&'a str, ConfigError> {
    section.get(key).ok_or(ConfigError::MissingField {
        section: section_name,
        field: key,
    })
}

fn field<T>(result: Result<T, CodecError>, name: &'static str) -> Result<T, ConfigError> {
    result.map_err(|source| ConfigError::InvalidField {
        field: name,
        source,
    })
}

fn parse_u16(value: &str) -> Result<u16, CodecError> {
    value.parse().map_err(|_| CodecError::InvalidNumber {
        value: value.to_string(),
    })
}

fn parse_mtu(value: &str, min: u16) -> Result<u16, CodecError> {
    match parse_u16(value)? {
        0 => Err(CodecError::InvalidNumber {
            value: value.to_string(),
        }),
        mtu if mtu < min => Err(CodecError::MtuTooSmall { mtu, min }),
        mtu => Ok(mtu),
    }
}
