//! Startup sequence
//!
//! Load configuration, build the control-plane request, bring the device
//! up, then serve SOCKS5 with the tunnel as both dialer and resolver. Each
//! step runs only after the previous one succeeded.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{ConfigSource, WireGuardConfig};
use crate::error::{DeviceError, Result};
use crate::resolver::TunnelResolver;
use crate::socks5::Socks5Server;
use crate::tunnel::{create_net_tun, DeviceSettings, TunnelDevice};
use crate::uapi::UapiRequest;

/// Default SOCKS5 listen address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:1080";

/// What to run
#[derive(Debug, Clone)]
pub struct Options {
    pub source: ConfigSource,
    pub listen: SocketAddr,
}

/// Everything derived from the configuration before touching the network
#[derive(Debug, Clone)]
pub struct Plan {
    pub config: WireGuardConfig,
    pub request: UapiRequest,
    pub settings: DeviceSettings,
}

impl Plan {
    pub fn from_config(config: WireGuardConfig) -> Result<Self> {
        let request = UapiRequest::from_config(&config)?;
        if let [first, rest @ ..] = config.peers.as_slice() {
            if !rest.is_empty() {
                tracing::warn!(
                    "{} peers configured; only the first ({}) is used",
                    config.peers.len(),
                    first.endpoint
                );
            }
        }

        let settings = DeviceSettings::from_interface(&config.interface);
        Ok(Self {
            config,
            request,
            settings,
        })
    }

    /// Load the configuration off the async runtime; reading standard input
    /// and resolving endpoints both block.
    pub async fn load(source: ConfigSource) -> Result<Self> {
        let config = tokio::task::spawn_blocking(move || WireGuardConfig::load(&source))
            .await
            .map_err(|e| std::io::Error::other(format!("config loader task failed: {}", e)))??;
        Self::from_config(config)
    }

    /// Blocking variant of [`Plan::load`] for callers without a runtime
    pub fn load_blocking(source: &ConfigSource) -> Result<Self> {
        Self::from_config(WireGuardConfig::load(source)?)
    }
}

/// Configure `device` with `request` and start it
pub async fn bring_up<D: TunnelDevice>(device: &mut D, request: &UapiRequest) -> std::result::Result<(), DeviceError> {
    device.ipc_set(&request.to_string())?;
    device.up().await
}

/// Run until the proxy fails or the future is dropped
pub async fn run(options: Options) -> Result<()> {
    let plan = Plan::load(options.source).await?;
    tracing::info!(
        "Tunnel addresses {:?}, DNS {:?}, MTU {}",
        plan.settings.addresses,
        plan.settings.dns,
        plan.settings.mtu
    );

    let (mut device, net) = create_net_tun(&plan.settings)?;
    bring_up(&mut device, &plan.request).await?;

    let net = Arc::new(net);
    let resolver = Arc::new(TunnelResolver::new(net.clone()));
    let result = Socks5Server::new(net, resolver)
        .listen_and_serve(options.listen)
        .await;

    device.down();
    Ok(result?)
}
