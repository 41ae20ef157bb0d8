//! Userspace tunnel: a WireGuard device feeding a virtual network stack
//!
//! Nothing here touches the host's interfaces or routes. Applications reach
//! the tunnel only through the [`NetStack`] handle.

mod device;
mod dns;
mod net;
mod stack;

use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{min_mtu, InterfaceConfig};
use crate::error::DeviceError;

pub use device::WgDevice;
pub use net::{TunnelNet, TunnelStream};
pub use stack::VirtualStack;

/// Control-plane side of a tunnel device
#[async_trait]
pub trait TunnelDevice: Send {
    /// Apply newline-delimited `key=value` settings
    fn ipc_set(&mut self, request: &str) -> Result<(), DeviceError>;

    /// Start moving packets
    async fn up(&mut self) -> Result<(), DeviceError>;
}

/// Data-plane side: connections and lookups that travel through the tunnel
#[async_trait]
pub trait NetStack: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, addr: SocketAddr) -> io::Result<Self::Stream>;

    /// Textual addresses for `host`; IP literals come back unchanged
    async fn lookup_host(&self, host: &str) -> io::Result<Vec<String>>;
}

/// Addressing for the virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub addresses: Vec<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub mtu: u16,
}

impl DeviceSettings {
    pub fn from_interface(interface: &InterfaceConfig) -> Self {
        Self {
            addresses: interface.address.clone(),
            dns: interface.dns.clone(),
            mtu: interface.effective_mtu(),
        }
    }
}

/// Create a device and the network handle bound to its virtual interface
pub fn create_net_tun(settings: &DeviceSettings) -> Result<(WgDevice, TunnelNet), DeviceError> {
    if settings.addresses.is_empty() {
        return Err(DeviceError::Stack {
            reason: "interface needs at least one address".to_string(),
        });
    }
    let min = min_mtu(&settings.addresses);
    if settings.mtu < min {
        return Err(DeviceError::Stack {
            reason: format!("MTU {} is below the minimum of {}", settings.mtu, min),
        });
    }

    let stack = VirtualStack::new(&settings.addresses, settings.mtu);
    let net = TunnelNet::new(stack.clone(), settings.dns.clone());
    Ok((WgDevice::new(stack), net))
}
