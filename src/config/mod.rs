//! Configuration parsing for WireGuard
//!
//! This module handles parsing of wg-quick style `.conf` configuration files.

pub mod codec;
mod document;
mod parser;

pub use codec::{decode_key, parse_address_list, resolve_endpoint, HostLookup, Key, SystemLookup};
pub use document::{Document, Section};
pub use parser::{
    min_mtu, ConfigSource, InterfaceConfig, PeerConfig, WireGuardConfig, DEFAULT_MTU,
    MIN_MTU_IPV4, MIN_MTU_IPV6,
};
