//! wiresocks - WireGuard tunnel behind a local SOCKS5 proxy
//!
//! Reads a wg-quick style configuration, runs the WireGuard session entirely
//! in userspace over a virtual TCP/IP stack, and lets local applications use
//! the tunnel through SOCKS5. No TUN device, routes or privileges needed.
//!
//! # Features
//!
//! - Strict configuration parsing into typed keys and addresses
//! - Control-plane request built in one fixed, reproducible order
//! - Hostnames in proxy requests resolved by DNS through the tunnel
//! - One peer, all traffic (`0.0.0.0/0`, `::0/0`) routed to it
//!
//! # Usage
//!
//! ```no_run
//! use wiresocks::app::{run, Options};
//! use wiresocks::config::ConfigSource;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run(Options {
//!         source: ConfigSource::from_arg("wg0.conf"),
//!         listen: "127.0.0.1:1080".parse()?,
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod resolver;
pub mod socks5;
pub mod tunnel;
pub mod uapi;

pub use config::WireGuardConfig;
pub use error::WireSocksError;
pub use resolver::{NameResolver, TunnelResolver};
pub use socks5::Socks5Server;
pub use tunnel::{create_net_tun, NetStack, TunnelDevice};
pub use uapi::UapiRequest;
