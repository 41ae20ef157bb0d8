//! Dialing and name lookup through the tunnel

use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use smoltcp::iface::SocketHandle;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::dns::{self, RecordType};
use super::stack::VirtualStack;
use super::NetStack;

/// Per-server query timeout
const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

const DNS_PORT: u16 = 53;

/// Network endpoint whose traffic leaves through the WireGuard peer
#[derive(Clone)]
pub struct TunnelNet {
    stack: VirtualStack,
    dns_servers: Vec<IpAddr>,
}

impl TunnelNet {
    pub(crate) fn new(stack: VirtualStack, dns_servers: Vec<IpAddr>) -> Self {
        Self { stack, dns_servers }
    }

    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.dns_servers
    }

    /// Open a TCP connection to `addr` through the tunnel
    pub async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<TunnelStream> {
        let handle = self.stack.tcp_connect(addr)?;
        // Owns the socket from here so a cancelled dial still releases it
        let stream = TunnelStream {
            stack: self.stack.clone(),
            handle,
        };

        poll_fn(|cx| stream.stack.poll_connected(stream.handle, cx)).await?;
        tracing::debug!("Connected to {} through tunnel", addr);
        Ok(stream)
    }

    /// Resolve `host` with the configured DNS servers, in order. The first
    /// server that answers decides the result.
    pub async fn resolve(&self, host: &str) -> io::Result<Vec<String>> {
        if host.parse::<IpAddr>().is_ok() {
            return Ok(vec![host.to_string()]);
        }

        let mut records = Vec::new();
        if self.stack.has_ipv4() {
            records.push(RecordType::A);
        }
        if self.stack.has_ipv6() {
            records.push(RecordType::AAAA);
        }

        let mut last_error = None;
        for server in &self.dns_servers {
            let mut answered = false;
            let mut found = Vec::new();

            for &record in &records {
                match self.query(*server, host, record).await {
                    Ok(addrs) => {
                        answered = true;
                        found.extend(addrs);
                    }
                    Err(e) => {
                        tracing::debug!("DNS {:?} query for {} via {} failed: {}", record, host, server, e);
                        last_error = Some(e);
                    }
                }
            }

            if answered {
                return Ok(found.iter().map(IpAddr::to_string).collect());
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no DNS servers available to resolve {}", host),
            )
        }))
    }

    async fn query(&self, server: IpAddr, host: &str, record: RecordType) -> io::Result<Vec<IpAddr>> {
        let id: u16 = rand::random();
        let packet = dns::build_query(host, record, id)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let query = UdpQuery {
            stack: self.stack.clone(),
            handle: self.stack.udp_send(SocketAddr::new(server, DNS_PORT), &packet)?,
        };

        tokio::time::timeout(DNS_QUERY_TIMEOUT, query.answer(id, record))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("DNS server {} timed out", server)))?
    }
}

#[async_trait]
impl NetStack for TunnelNet {
    type Stream = TunnelStream;

    async fn dial(&self, addr: SocketAddr) -> io::Result<TunnelStream> {
        self.dial_tcp(addr).await
    }

    async fn lookup_host(&self, host: &str) -> io::Result<Vec<String>> {
        self.resolve(host).await
    }
}

/// Removes a DNS query socket when the lookup finishes or is dropped
struct UdpQuery {
    stack: VirtualStack,
    handle: SocketHandle,
}

impl UdpQuery {
    /// Wait for the reply to query `id`, skipping replies to other queries
    async fn answer(&self, id: u16, record: RecordType) -> io::Result<Vec<IpAddr>> {
        loop {
            let response = poll_fn(|cx| self.stack.poll_udp_recv(self.handle, cx)).await?;
            match dns::parse_response(&response, id, record) {
                Ok(Some(addrs)) => return Ok(addrs),
                Ok(None) => tracing::debug!("Ignoring DNS reply for another query"),
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
    }
}

impl Drop for UdpQuery {
    fn drop(&mut self) {
        self.stack.remove_socket(self.handle);
    }
}

/// TCP connection through the tunnel
pub struct TunnelStream {
    stack: VirtualStack,
    handle: SocketHandle,
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = std::task::ready!(self
            .stack
            .poll_tcp_read(self.handle, cx, buf.initialize_unfilled()))?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.stack.poll_tcp_write(self.handle, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.stack.tcp_shutdown(self.handle))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.stack.tcp_release(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use hickory_proto::op::{Message, ResponseCode};
    use smoltcp::phy::ChecksumCapabilities;
    use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr};

    use super::super::dns::tests::{address, response_for};
    use crate::error::ResolveError;
    use crate::resolver::{NameResolver, TunnelResolver};

    /// A DNS datagram the stack sent towards the peer
    struct SentQuery {
        server: Ipv4Addr,
        client: Ipv4Addr,
        client_port: u16,
        payload: Vec<u8>,
    }

    fn sent_query(packet: &[u8]) -> SentQuery {
        let ip = Ipv4Packet::new_checked(packet).unwrap();
        assert_eq!(ip.next_header(), IpProtocol::Udp);
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.dst_port(), DNS_PORT);

        SentQuery {
            server: ip.dst_addr(),
            client: ip.src_addr(),
            client_port: udp.src_port(),
            payload: udp.payload().to_vec(),
        }
    }

    /// IPv4/UDP packet carrying `payload` from the server back to the querying socket
    fn reply_packet(query: &SentQuery, payload: &[u8]) -> Vec<u8> {
        let udp_repr = UdpRepr {
            src_port: DNS_PORT,
            dst_port: query.client_port,
        };
        let ip_repr = Ipv4Repr {
            src_addr: query.server,
            dst_addr: query.client,
            next_header: IpProtocol::Udp,
            payload_len: udp_repr.header_len() + payload.len(),
            hop_limit: 64,
        };
        let checksum = ChecksumCapabilities::default();

        let mut buffer = vec![0u8; ip_repr.buffer_len() + ip_repr.payload_len];
        let mut ip = Ipv4Packet::new_unchecked(&mut buffer);
        ip_repr.emit(&mut ip, &checksum);
        let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
        udp_repr.emit(
            &mut udp,
            &IpAddress::Ipv4(query.server),
            &IpAddress::Ipv4(query.client),
            payload.len(),
            |buf| buf.copy_from_slice(payload),
            &checksum,
        );
        buffer
    }

    /// Stand in for the peer: answer each query the stack sends with the
    /// payloads `respond` returns for (server, record type, query)
    async fn serve_dns<F>(stack: VirtualStack, mut respond: F)
    where
        F: FnMut(Ipv4Addr, RecordType, &[u8]) -> Vec<Vec<u8>>,
    {
        loop {
            stack.poll();
            while let Some(packet) = stack.transmit_packet() {
                let query = sent_query(&packet);
                let message = Message::from_vec(&query.payload).unwrap();
                let record = message.queries()[0].query_type();

                for payload in respond(query.server, record, &query.payload) {
                    stack.receive_packet(&reply_packet(&query, &payload));
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn resolve_with<F>(net: &TunnelNet, host: &str, respond: F) -> io::Result<Vec<String>>
    where
        F: FnMut(Ipv4Addr, RecordType, &[u8]) -> Vec<Vec<u8>>,
    {
        tokio::select! {
            result = net.resolve(host) => result,
            _ = serve_dns(net.stack.clone(), respond) => unreachable!(),
        }
    }

    fn answer(query: &[u8], ip: &str) -> Vec<u8> {
        response_for(query, ResponseCode::NoError, vec![address(ip.parse().unwrap())])
    }

    fn net(addresses: &[&str], dns: &[&str]) -> TunnelNet {
        let addresses: Vec<IpAddr> = addresses.iter().map(|a| a.parse().unwrap()).collect();
        let stack = VirtualStack::new(&addresses, 1420);
        TunnelNet::new(stack, dns.iter().map(|a| a.parse().unwrap()).collect())
    }

    #[tokio::test]
    async fn test_resolve_literal_skips_dns() {
        let net = net(&["10.0.0.2"], &[]);
        assert_eq!(net.resolve("93.184.216.34").await.unwrap(), vec!["93.184.216.34"]);
        assert_eq!(net.resolve("2001:db8::1").await.unwrap(), vec!["2001:db8::1"]);
    }

    #[tokio::test]
    async fn test_resolve_without_servers_fails() {
        let net = net(&["10.0.0.2"], &[]);
        let err = net.resolve("example.com").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_resolve_skips_unreachable_server_family() {
        // An IPv6 server cannot be reached from an IPv4-only interface
        let net = net(&["10.0.0.2"], &["2001:db8::53"]);
        let err = net.resolve("example.com").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_times_out_without_peer() {
        let net = net(&["10.0.0.2"], &["10.0.0.1"]);
        let err = net.resolve("example.com").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_cancelled_dial_releases_socket() {
        let net = net(&["10.0.0.2"], &[]);
        let dial = net.dial_tcp("192.0.2.1:80".parse().unwrap());
        let result = tokio::time::timeout(Duration::from_millis(20), dial).await;
        assert!(result.is_err());

        net.stack.poll();
        assert_eq!(net.stack.socket_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_merges_a_and_aaaa_answers() {
        let net = net(&["10.0.0.2", "fd00::2"], &["10.0.0.1"]);

        let addrs = resolve_with(&net, "example.com", |_, record, query| match record {
            RecordType::A => vec![answer(query, "93.184.216.34")],
            _ => vec![answer(query, "2606:2800:220:1::1")],
        })
        .await
        .unwrap();

        assert_eq!(addrs, vec!["93.184.216.34", "2606:2800:220:1::1"]);
    }

    #[tokio::test]
    async fn test_first_answering_server_wins() {
        let net = net(&["10.0.0.2"], &["10.0.0.1", "10.0.0.3"]);
        let mut asked = Vec::new();

        let addrs = resolve_with(&net, "example.com", |server, _, query| {
            asked.push(server);
            let ip = if server == Ipv4Addr::new(10, 0, 0, 1) {
                "192.0.2.1"
            } else {
                "192.0.2.3"
            };
            vec![answer(query, ip)]
        })
        .await
        .unwrap();

        assert_eq!(addrs, vec!["192.0.2.1"]);
        assert_eq!(asked, vec![Ipv4Addr::new(10, 0, 0, 1)]);
    }

    #[tokio::test]
    async fn test_failing_server_falls_through_to_next() {
        let net = net(&["10.0.0.2"], &["10.0.0.1", "10.0.0.3"]);

        let addrs = resolve_with(&net, "example.com", |server, _, query| {
            if server == Ipv4Addr::new(10, 0, 0, 1) {
                vec![response_for(query, ResponseCode::ServFail, vec![])]
            } else {
                vec![answer(query, "192.0.2.7")]
            }
        })
        .await
        .unwrap();

        assert_eq!(addrs, vec!["192.0.2.7"]);
    }

    #[tokio::test]
    async fn test_reply_to_another_query_is_ignored() {
        let net = net(&["10.0.0.2"], &["10.0.0.1"]);

        let addrs = resolve_with(&net, "example.com", |_, _, query| {
            let mut stale = answer(query, "192.0.2.99");
            stale[0] ^= 0xFF;
            vec![stale, answer(query, "192.0.2.1")]
        })
        .await
        .unwrap();

        assert_eq!(addrs, vec!["192.0.2.1"]);
    }

    #[tokio::test]
    async fn test_nxdomain_reaches_resolver_as_no_address() {
        let net = net(&["10.0.0.2"], &["10.0.0.1"]);
        let nxdomain = |_: Ipv4Addr, _: RecordType, query: &[u8]| {
            vec![response_for(query, ResponseCode::NXDomain, vec![])]
        };

        let addrs = resolve_with(&net, "missing.example", nxdomain).await.unwrap();
        assert!(addrs.is_empty());

        let resolver = TunnelResolver::new(Arc::new(net.clone()));
        let result = tokio::select! {
            result = resolver.resolve("missing.example") => result,
            _ = serve_dns(net.stack.clone(), nxdomain) => unreachable!(),
        };
        assert!(matches!(
            result,
            Err(ResolveError::NoAddressFound { name }) if name == "missing.example"
        ));
        assert_eq!(net.stack.socket_count(), 0);
    }
}
