//! Field codecs for configuration values
//!
//! Keys arrive base64-encoded and leave as lowercase hex, which is the form
//! the control-plane protocol expects. Addresses are IP literals, optionally
//! carrying a prefix length that is dropped.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::error::CodecError;

/// Length of every WireGuard key in bytes
pub const KEY_LEN: usize = 32;

/// A 32-byte WireGuard key.
///
/// `Display` renders the 64-character lowercase hex form used on the control
/// plane. `Debug` is redacted so keys never end up in logs.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// The all-zero key, meaning "no preshared key" on the control plane
    pub const ZERO: Key = Key([0u8; KEY_LEN]);

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }

    /// Parse the hex form emitted by `Display`
    pub fn from_hex(text: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(text).map_err(|_| CodecError::InvalidEncoding)?;
        Self::from_slice(&bytes)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CodecError::WrongLength { got: bytes.len() })?;
        Ok(Self(key))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(..)")
    }
}

/// Decode a standard base64 key into a 32-byte [`Key`]
pub fn decode_key(text: &str) -> Result<Key, CodecError> {
    let bytes = BASE64
        .decode(text)
        .map_err(|_| CodecError::InvalidEncoding)?;
    Key::from_slice(&bytes)
}

/// Hostname lookup used when resolving peer endpoints at load time
pub trait HostLookup {
    fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Blocking lookup through the host's resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok((host, 0).to_socket_addrs()?.map(|addr| addr.ip()).collect())
    }
}

/// Resolve a `host:port` endpoint to a concrete socket address.
///
/// The first address returned by the lookup wins. This is a one-time
/// snapshot; later DNS changes are not observed.
pub fn resolve_endpoint(text: &str, lookup: &dyn HostLookup) -> Result<SocketAddr, CodecError> {
    let malformed = || CodecError::MalformedEndpoint {
        value: text.to_string(),
    };

    let (host, port) = split_host_port(text).ok_or_else(malformed)?;
    let port: u16 = port.parse().map_err(|_| malformed())?;

    let ip = match host.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => lookup
            .lookup(host)
            .map_err(|source| CodecError::HostLookup {
                host: host.to_string(),
                source,
            })?
            .into_iter()
            .next()
            .ok_or_else(|| CodecError::NoAddress {
                host: host.to_string(),
            })?,
    };

    Ok(SocketAddr::new(ip, port))
}

/// Split `host:port` or `[v6]:port` into its two parts
fn split_host_port(text: &str) -> Option<(&str, &str)> {
    let (host, port) = if let Some(rest) = text.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        let (host, port) = text.rsplit_once(':')?;
        // An unbracketed host with colons is an IPv6 literal missing its brackets
        if host.contains(':') {
            return None;
        }
        (host, port)
    };

    if host.is_empty() || port.contains(':') {
        return None;
    }
    Some((host, port))
}

/// Parse a comma-separated list of IP literals, preserving order.
///
/// With `allow_prefix`, an item containing `/` is read as `addr/len` and only
/// the address is kept. One malformed item fails the whole list.
pub fn parse_address_list(value: &str, allow_prefix: bool) -> Result<Vec<IpAddr>, CodecError> {
    value
        .split(',')
        .map(str::trim)
        .map(|item| {
            if allow_prefix && item.contains('/') {
                item.parse::<IpNet>()
                    .map(|net| net.addr())
                    .map_err(|_| CodecError::InvalidPrefix {
                        value: item.to_string(),
                    })
            } else {
                item.parse::<IpAddr>()
                    .map_err(|_| CodecError::InvalidAddress {
                        value: item.to_string(),
                    })
            }
        })
        .collect()
}
