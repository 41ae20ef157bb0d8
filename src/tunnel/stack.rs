//! Virtual TCP/IP stack backed by smoltcp
//!
//! Decrypted packets from the tunnel are queued into an IP-medium smoltcp
//! interface; packets it emits are queued for the device pump to encrypt.
//! Dialed TCP streams and DNS queries are sockets on this interface.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant as StdInstant};

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{self, State as TcpState};
use smoltcp::socket::udp;
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

const TCP_BUFFER_SIZE: usize = 65536;
const UDP_PACKET_CAP: usize = 2048;

/// Maximum number of packets in rx/tx queues
const MAX_QUEUE_SIZE: usize = 1024;

const LOCAL_PORT_START: u16 = 40000;
const LOCAL_PORT_END: u16 = 65000;

/// Abort a TCP connection whose peer stops acknowledging for this long
const TCP_TIMEOUT: Duration = Duration::from_secs(60);

fn smoltcp_now() -> SmoltcpInstant {
    static START: OnceLock<StdInstant> = OnceLock::new();
    let start = START.get_or_init(StdInstant::now);
    SmoltcpInstant::from_micros(start.elapsed().as_micros() as i64)
}

fn to_smoltcp(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(a) => IpAddress::Ipv4(a),
        IpAddr::V6(a) => IpAddress::Ipv6(a),
    }
}

/// Packet queues standing in for a physical link
struct PacketQueue {
    rx_queue: VecDeque<Vec<u8>>,
    tx_queue: VecDeque<Vec<u8>>,
    mtu: usize,
}

struct QueueRxToken(Vec<u8>);

impl RxToken for QueueRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

struct QueueTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for QueueTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        if self.0.len() >= MAX_QUEUE_SIZE {
            tracing::warn!("tx packet queue full, dropping oldest packet");
            self.0.pop_front();
        }
        self.0.push_back(buffer);
        result
    }
}

impl Device for PacketQueue {
    type RxToken<'a> = QueueRxToken;
    type TxToken<'a> = QueueTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: SmoltcpInstant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.rx_queue
            .pop_front()
            .map(|packet| (QueueRxToken(packet), QueueTxToken(&mut self.tx_queue)))
    }

    fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
        Some(QueueTxToken(&mut self.tx_queue))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

struct StackInner {
    device: PacketQueue,
    iface: Interface,
    sockets: SocketSet<'static>,
    /// Tasks waiting on any socket; woken after every interface poll
    wakers: Vec<Waker>,
    /// Released TCP sockets still finishing their close handshake
    closing: Vec<SocketHandle>,
    next_port: u16,
}

impl StackInner {
    fn poll(&mut self) -> Option<Duration> {
        let now = smoltcp_now();
        let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);
        self.reap_closed();

        for waker in self.wakers.drain(..) {
            waker.wake();
        }

        self.iface
            .poll_delay(now, &self.sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
    }

    fn reap_closed(&mut self) {
        let sockets = &mut self.sockets;
        self.closing.retain(|&handle| {
            let state = sockets.get::<tcp::Socket>(handle).state();
            if matches!(state, TcpState::Closed | TcpState::TimeWait) {
                sockets.remove(handle);
                false
            } else {
                true
            }
        });
    }

    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port >= LOCAL_PORT_END {
            LOCAL_PORT_START
        } else {
            port + 1
        };
        port
    }
}

struct Shared {
    inner: Mutex<StackInner>,
    /// Signalled whenever sockets have output for the device pump
    outbound: Notify,
    addresses: Vec<IpAddr>,
    mtu: u16,
}

/// Handle to the virtual stack; clones share the same interface
#[derive(Clone)]
pub struct VirtualStack {
    shared: Arc<Shared>,
}

impl VirtualStack {
    pub fn new(addresses: &[IpAddr], mtu: u16) -> Self {
        let mut device = PacketQueue {
            rx_queue: VecDeque::new(),
            tx_queue: VecDeque::new(),
            mtu: mtu as usize,
        };

        let mut config = Config::new(HardwareAddress::Ip);
        config.random_seed = rand::random();
        let mut iface = Interface::new(config, &mut device, smoltcp_now());

        iface.update_ip_addrs(|addrs| {
            for addr in addresses {
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                if addrs.push(IpCidr::new(to_smoltcp(*addr), prefix)).is_err() {
                    tracing::warn!("Interface address table full, ignoring {}", addr);
                }
            }
        });

        // Everything not local goes to the peer
        if addresses.iter().any(IpAddr::is_ipv4) {
            let _ = iface
                .routes_mut()
                .add_default_ipv4_route(std::net::Ipv4Addr::new(0, 0, 0, 1));
        }
        if addresses.iter().any(IpAddr::is_ipv6) {
            let _ = iface
                .routes_mut()
                .add_default_ipv6_route(std::net::Ipv6Addr::LOCALHOST);
        }

        tracing::debug!("Created virtual stack with {:?}, MTU {}", addresses, mtu);

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(StackInner {
                    device,
                    iface,
                    sockets: SocketSet::new(vec![]),
                    wakers: Vec::new(),
                    closing: Vec::new(),
                    next_port: LOCAL_PORT_START,
                }),
                outbound: Notify::new(),
                addresses: addresses.to_vec(),
                mtu,
            }),
        }
    }

    pub fn mtu(&self) -> u16 {
        self.shared.mtu
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.shared.addresses
    }

    pub fn has_ipv4(&self) -> bool {
        self.shared.addresses.iter().any(IpAddr::is_ipv4)
    }

    pub fn has_ipv6(&self) -> bool {
        self.shared.addresses.iter().any(IpAddr::is_ipv6)
    }

    /// First local address of the same family as `remote`
    fn local_address_for(&self, remote: IpAddr) -> io::Result<IpAddr> {
        self.shared
            .addresses
            .iter()
            .copied()
            .find(|addr| addr.is_ipv4() == remote.is_ipv4())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no local address of the same family as {}", remote),
                )
            })
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, StackInner>> {
        self.shared
            .inner
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {}", e)))
    }

    fn wake_pump(&self) {
        self.shared.outbound.notify_one();
    }

    /// Resolves when sockets have produced output for the pump
    pub fn outbound_ready(&self) -> Notified<'_> {
        self.shared.outbound.notified()
    }

    /// Queue a decrypted packet from the tunnel
    pub fn receive_packet(&self, data: &[u8]) {
        let Ok(mut inner) = self.lock() else {
            return;
        };

        if inner.device.rx_queue.len() >= MAX_QUEUE_SIZE {
            tracing::warn!("rx packet queue full, dropping oldest packet");
            inner.device.rx_queue.pop_front();
        }
        inner.device.rx_queue.push_back(data.to_vec());
    }

    /// Take the next packet the stack wants sent through the tunnel
    pub fn transmit_packet(&self) -> Option<Vec<u8>> {
        self.lock().ok()?.device.tx_queue.pop_front()
    }

    /// Run the interface and wake waiting sockets. Returns how long the
    /// interface can sleep before its next timer.
    pub fn poll(&self) -> Option<Duration> {
        self.lock().ok()?.poll()
    }

    pub(crate) fn tcp_connect(&self, remote: SocketAddr) -> io::Result<SocketHandle> {
        let local_ip = self.local_address_for(remote.ip())?;
        let mut inner = self.lock()?;

        let mut socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
            tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
        );
        socket.set_nagle_enabled(false);
        socket.set_ack_delay(None);
        socket.set_timeout(Some(TCP_TIMEOUT.into()));

        let local = IpListenEndpoint {
            addr: Some(to_smoltcp(local_ip)),
            port: inner.allocate_port(),
        };
        let remote_endpoint = IpEndpoint::new(to_smoltcp(remote.ip()), remote.port());

        let StackInner { iface, sockets, .. } = &mut *inner;
        socket
            .connect(iface.context(), remote_endpoint, local)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("connect: {}", e)))?;
        let handle = sockets.add(socket);

        drop(inner);
        self.wake_pump();
        tracing::trace!("Dialing {} from {}", remote, local_ip);
        Ok(handle)
    }

    pub(crate) fn poll_connected(&self, handle: SocketHandle, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut inner = self.lock()?;

        match inner.sockets.get::<tcp::Socket>(handle).state() {
            TcpState::Established | TcpState::CloseWait => Poll::Ready(Ok(())),
            TcpState::SynSent | TcpState::SynReceived => {
                inner.wakers.push(cx.waker().clone());
                Poll::Pending
            }
            _ => Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionRefused))),
        }
    }

    pub(crate) fn poll_tcp_read(
        &self,
        handle: SocketHandle,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.lock()?;
        let socket = inner.sockets.get_mut::<tcp::Socket>(handle);

        if socket.can_recv() {
            let n = socket
                .recv_slice(buf)
                .map_err(|e| io::Error::other(format!("recv: {}", e)))?;
            drop(inner);
            // Let the pump advertise the reopened window
            self.wake_pump();
            Poll::Ready(Ok(n))
        } else if !socket.may_recv() {
            Poll::Ready(Ok(0))
        } else {
            inner.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }

    pub(crate) fn poll_tcp_write(
        &self,
        handle: SocketHandle,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.lock()?;
        let socket = inner.sockets.get_mut::<tcp::Socket>(handle);

        if socket.can_send() {
            let n = socket
                .send_slice(buf)
                .map_err(|e| io::Error::other(format!("send: {}", e)))?;
            drop(inner);
            self.wake_pump();
            Poll::Ready(Ok(n))
        } else if socket.may_send() {
            inner.wakers.push(cx.waker().clone());
            Poll::Pending
        } else {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
    }

    /// Send FIN; the socket stays registered until released
    pub(crate) fn tcp_shutdown(&self, handle: SocketHandle) -> io::Result<()> {
        self.lock()?.sockets.get_mut::<tcp::Socket>(handle).close();
        self.wake_pump();
        Ok(())
    }

    /// Close a TCP socket and remove it once its close handshake finishes
    pub(crate) fn tcp_release(&self, handle: SocketHandle) {
        if let Ok(mut inner) = self.lock() {
            inner.sockets.get_mut::<tcp::Socket>(handle).close();
            inner.closing.push(handle);
        }
        self.wake_pump();
    }

    /// Send one datagram from a fresh UDP socket; the reply is read with
    /// [`poll_udp_recv`](Self::poll_udp_recv)
    pub(crate) fn udp_send(&self, remote: SocketAddr, payload: &[u8]) -> io::Result<SocketHandle> {
        let local_ip = self.local_address_for(remote.ip())?;
        let mut inner = self.lock()?;

        let mut socket = udp::Socket::new(
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 4], vec![0u8; UDP_PACKET_CAP]),
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 1], vec![0u8; UDP_PACKET_CAP]),
        );

        let local = IpListenEndpoint {
            addr: Some(to_smoltcp(local_ip)),
            port: inner.allocate_port(),
        };
        socket
            .bind(local)
            .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, format!("UDP bind: {}", e)))?;
        socket
            .send_slice(payload, IpEndpoint::new(to_smoltcp(remote.ip()), remote.port()))
            .map_err(|e| io::Error::other(format!("UDP send: {}", e)))?;

        let handle = inner.sockets.add(socket);
        drop(inner);
        self.wake_pump();
        Ok(handle)
    }

    pub(crate) fn poll_udp_recv(&self, handle: SocketHandle, cx: &mut Context<'_>) -> Poll<io::Result<Vec<u8>>> {
        let mut inner = self.lock()?;
        let socket = inner.sockets.get_mut::<udp::Socket>(handle);

        if socket.can_recv() {
            let (packet, _) = socket
                .recv()
                .map_err(|e| io::Error::other(format!("UDP recv: {}", e)))?;
            Poll::Ready(Ok(packet.to_vec()))
        } else {
            inner.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }

    pub(crate) fn remove_socket(&self, handle: SocketHandle) {
        if let Ok(mut inner) = self.lock() {
            inner.sockets.remove(handle);
        }
    }

    #[cfg(test)]
    pub(crate) fn socket_count(&self) -> usize {
        self.lock().map(|inner| inner.sockets.iter().count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_stack_properties() {
        let stack = VirtualStack::new(&addrs(&["10.0.0.2"]), 1420);
        assert_eq!(stack.mtu(), 1420);
        assert!(stack.has_ipv4());
        assert!(!stack.has_ipv6());
        assert_eq!(stack.addresses(), &addrs(&["10.0.0.2"])[..]);
    }

    #[test]
    fn test_local_address_matches_family() {
        let stack = VirtualStack::new(&addrs(&["10.0.0.2", "fd00::2"]), 1420);
        assert_eq!(
            stack.local_address_for("1.1.1.1".parse().unwrap()).unwrap().to_string(),
            "10.0.0.2"
        );
        assert_eq!(
            stack.local_address_for("2001:db8::1".parse().unwrap()).unwrap().to_string(),
            "fd00::2"
        );

        let v4_only = VirtualStack::new(&addrs(&["10.0.0.2"]), 1420);
        assert!(v4_only.local_address_for("2001:db8::1".parse().unwrap()).is_err());
    }

    #[test]
    fn test_connect_emits_syn() {
        let stack = VirtualStack::new(&addrs(&["10.0.0.2"]), 1420);
        stack.tcp_connect("192.0.2.80:80".parse().unwrap()).unwrap();
        stack.poll();

        let packet = stack.transmit_packet().expect("SYN should be queued");
        // IPv4, TCP, addressed to the dialed host
        assert_eq!(packet[0] >> 4, 4);
        assert_eq!(packet[9], 6);
        assert_eq!(&packet[16..20], &[192, 0, 2, 80]);
    }

    #[test]
    fn test_released_socket_is_reaped() {
        let stack = VirtualStack::new(&addrs(&["10.0.0.2"]), 1420);
        let handle = stack.tcp_connect("192.0.2.80:80".parse().unwrap()).unwrap();
        assert_eq!(stack.socket_count(), 1);

        // Closing an unanswered SYN goes straight to Closed
        stack.tcp_release(handle);
        stack.poll();
        assert_eq!(stack.socket_count(), 0);
    }

    #[test]
    fn test_udp_send_queues_datagram() {
        let stack = VirtualStack::new(&addrs(&["10.0.0.2"]), 1420);
        let handle = stack.udp_send("10.0.0.1:53".parse().unwrap(), b"query").unwrap();
        stack.poll();

        let packet = stack.transmit_packet().expect("datagram should be queued");
        assert_eq!(packet[9], 17);
        assert!(packet.ends_with(b"query"));

        stack.remove_socket(handle);
        assert_eq!(stack.socket_count(), 0);
    }
}
