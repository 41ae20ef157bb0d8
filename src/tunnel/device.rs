//! Userspace WireGuard device
//!
//! Configured through control-plane text, then driven by a single pump task
//! that coordinates:
//! - UDP socket communication with the peer
//! - Encryption of packets produced by the virtual stack
//! - Decryption of packets into the virtual stack
//! - Handshake, rekey and keepalive timers

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::IpNet;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::stack::VirtualStack;
use super::TunnelDevice;
use crate::config::Key;
use crate::error::DeviceError;
use crate::uapi::UapiRequest;

/// Buffer size for packets
const BUFFER_SIZE: usize = 65535;

/// How often the noise timers are serviced
const TIMER_TICK: Duration = Duration::from_millis(250);

/// Upper bound on sleeping between stack polls
const MAX_POLL_DELAY: Duration = Duration::from_millis(100);

/// Pause after a socket error so an unreachable peer does not spin the loop
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Peer settings accepted from a control-plane request
#[derive(Debug, Clone)]
struct PeerSettings {
    private_key: Key,
    public_key: Key,
    endpoint: SocketAddr,
    keepalive: u16,
    preshared_key: Option<Key>,
    allowed_ips: Vec<IpNet>,
}

impl PeerSettings {
    fn from_request(request: &UapiRequest) -> Result<Self, DeviceError> {
        let mut private_key = None;
        let mut public_key = None;
        let mut endpoint = None;
        let mut keepalive = 0;
        let mut preshared_key = None;
        let mut allowed_ips = Vec::new();

        for (idx, (key, value)) in request.entries().enumerate() {
            let invalid = |message: String| DeviceError::InvalidRequest {
                line: idx + 1,
                message,
            };

            match key {
                "private_key" => {
                    private_key = Some(
                        Key::from_hex(value).map_err(|e| invalid(format!("private_key: {}", e)))?,
                    );
                }
                "public_key" => {
                    public_key = Some(
                        Key::from_hex(value).map_err(|e| invalid(format!("public_key: {}", e)))?,
                    );
                }
                "endpoint" => {
                    endpoint = Some(
                        value
                            .parse::<SocketAddr>()
                            .map_err(|e| invalid(format!("endpoint: {}", e)))?,
                    );
                }
                "persistent_keepalive_interval" => {
                    keepalive = value
                        .parse::<u16>()
                        .map_err(|e| invalid(format!("persistent_keepalive_interval: {}", e)))?;
                }
                "preshared_key" => {
                    let psk =
                        Key::from_hex(value).map_err(|e| invalid(format!("preshared_key: {}", e)))?;
                    // An all-zero key means none
                    preshared_key = (!psk.is_zero()).then_some(psk);
                }
                "allowed_ip" => {
                    allowed_ips.push(
                        value
                            .parse::<IpNet>()
                            .map_err(|e| invalid(format!("allowed_ip: {}", e)))?,
                    );
                }
                other => return Err(invalid(format!("unsupported key: {}", other))),
            }
        }

        Ok(Self {
            private_key: private_key.ok_or(DeviceError::MissingSetting { key: "private_key" })?,
            public_key: public_key.ok_or(DeviceError::MissingSetting { key: "public_key" })?,
            endpoint: endpoint.ok_or(DeviceError::MissingSetting { key: "endpoint" })?,
            keepalive,
            preshared_key,
            allowed_ips,
        })
    }

    fn allows(&self, source: IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(&source))
    }
}

/// WireGuard device that tunnels a [`VirtualStack`] to one peer
pub struct WgDevice {
    stack: VirtualStack,
    settings: Option<PeerSettings>,
    pump: Option<JoinHandle<()>>,
}

impl WgDevice {
    pub(crate) fn new(stack: VirtualStack) -> Self {
        Self {
            stack,
            settings: None,
            pump: None,
        }
    }

    pub fn is_up(&self) -> bool {
        self.pump.is_some()
    }

    /// Stop the pump task
    pub fn down(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            tracing::debug!("Device pump stopped");
        }
    }
}

impl Drop for WgDevice {
    fn drop(&mut self) {
        self.down();
    }
}

#[async_trait]
impl TunnelDevice for WgDevice {
    fn ipc_set(&mut self, request: &str) -> Result<(), DeviceError> {
        let request = UapiRequest::parse(request)?;
        let settings = PeerSettings::from_request(&request)?;

        if self.is_up() {
            return Err(DeviceError::Stack {
                reason: "cannot reconfigure a running device".to_string(),
            });
        }

        tracing::debug!(
            "Device configured: peer {}, keepalive {}s, {} allowed IPs",
            settings.endpoint,
            settings.keepalive,
            settings.allowed_ips.len()
        );
        self.settings = Some(settings);
        Ok(())
    }

    async fn up(&mut self) -> Result<(), DeviceError> {
        if self.is_up() {
            return Ok(());
        }
        let settings = self.settings.clone().ok_or(DeviceError::NotConfigured)?;

        let bind_addr = match settings.endpoint {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DeviceError::Socket {
                reason: format!("bind {}: {}", bind_addr, e),
            })?;
        socket
            .connect(settings.endpoint)
            .await
            .map_err(|e| DeviceError::Socket {
                reason: format!("connect {}: {}", settings.endpoint, e),
            })?;

        if let Ok(local) = socket.local_addr() {
            tracing::debug!("Bound UDP socket on {}", local);
        }

        let tunn = Tunn::new(
            StaticSecret::from(*settings.private_key.as_bytes()),
            PublicKey::from(*settings.public_key.as_bytes()),
            settings.preshared_key.map(|k| *k.as_bytes()),
            (settings.keepalive > 0).then_some(settings.keepalive),
            0,
            None,
        )
        .map_err(|e| DeviceError::Stack {
            reason: e.to_string(),
        })?;

        let pump = Pump {
            stack: self.stack.clone(),
            socket,
            tunn,
            settings,
            established: false,
        };
        self.pump = Some(tokio::spawn(pump.run()));

        tracing::info!("Device is up");
        Ok(())
    }
}

/// Moves packets between the virtual stack and the peer
struct Pump {
    stack: VirtualStack,
    socket: UdpSocket,
    tunn: Tunn,
    settings: PeerSettings,
    established: bool,
}

impl Pump {
    async fn run(mut self) {
        let mut udp_buf = vec![0u8; BUFFER_SIZE];
        let mut work_buf = vec![0u8; BUFFER_SIZE];

        let mut timers = interval(TIMER_TICK);
        timers.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Initiating handshake with {}", self.settings.endpoint);
        if let TunnResult::WriteToNetwork(packet) =
            self.tunn.format_handshake_initiation(&mut work_buf, false)
        {
            self.send(packet).await;
        }

        loop {
            let delay = self
                .stack
                .poll()
                .map_or(MAX_POLL_DELAY, |d| d.min(MAX_POLL_DELAY));
            self.flush_outbound(&mut work_buf).await;

            tokio::select! {
                // Peer -> decrypt -> stack
                result = self.socket.recv(&mut udp_buf) => {
                    match result {
                        Ok(len) => self.handle_datagram(&udp_buf[..len], &mut work_buf).await,
                        Err(e) => {
                            tracing::debug!("UDP recv error: {}", e);
                            tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                        }
                    }
                }

                // Handshake retries, rekey and keepalive
                _ = timers.tick() => {
                    match self.tunn.update_timers(&mut work_buf) {
                        TunnResult::WriteToNetwork(packet) => self.send(packet).await,
                        TunnResult::Err(e) => tracing::debug!("Timer error: {:?}", e),
                        _ => {}
                    }
                }

                // Stack has packets to send
                _ = self.stack.outbound_ready() => {}

                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Encrypt everything the stack has queued
    async fn flush_outbound(&mut self, work_buf: &mut [u8]) {
        while let Some(packet) = self.stack.transmit_packet() {
            match self.tunn.encapsulate(&packet, work_buf) {
                TunnResult::WriteToNetwork(data) => {
                    if let Err(e) = self.socket.send(data).await {
                        tracing::debug!("UDP send error: {}", e);
                    }
                }
                TunnResult::Err(e) => tracing::debug!("Encapsulate error: {:?}", e),
                _ => {}
            }
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], work_buf: &mut [u8]) {
        let mut flush = false;

        match self.tunn.decapsulate(None, datagram, work_buf) {
            TunnResult::WriteToNetwork(packet) => {
                flush = true;
                if let Err(e) = self.socket.send(packet).await {
                    tracing::debug!("UDP send error: {}", e);
                }
            }
            TunnResult::WriteToTunnelV4(packet, source) => {
                self.deliver(packet, IpAddr::V4(source));
            }
            TunnResult::WriteToTunnelV6(packet, source) => {
                self.deliver(packet, IpAddr::V6(source));
            }
            TunnResult::Err(e) => tracing::trace!("Decapsulate error: {:?}", e),
            TunnResult::Done => {}
        }

        // Packets queued behind the handshake
        if flush {
            while let TunnResult::WriteToNetwork(packet) =
                self.tunn.decapsulate(None, &[], work_buf)
            {
                if let Err(e) = self.socket.send(packet).await {
                    tracing::debug!("UDP send error: {}", e);
                }
            }
        }

        if !self.established && self.tunn.time_since_last_handshake().is_some() {
            self.established = true;
            tracing::info!("Handshake complete! Session established.");
        }
    }

    fn deliver(&self, packet: &[u8], source: IpAddr) {
        if self.settings.allows(source) {
            self.stack.receive_packet(packet);
        } else {
            tracing::trace!("Dropping packet from {} outside allowed IPs", source);
        }
    }

    async fn send(&self, packet: &[u8]) {
        if let Err(e) = self.socket.send(packet).await {
            tracing::debug!("UDP send error: {}", e);
        }
    }
}
