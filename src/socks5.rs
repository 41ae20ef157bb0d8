//! SOCKS5 front end (RFC 1928)
//!
//! No-auth, CONNECT only. Hostname targets are resolved with the injected
//! [`NameResolver`] and every connection is dialed through the [`NetStack`],
//! so nothing a client requests touches the host network.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::ProxyError;
use crate::resolver::NameResolver;
use crate::tunnel::NetStack;

const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Time allowed for method negotiation and the request
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on resolving and dialing a target
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept; descriptor exhaustion fails every retry
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Source of client connections
#[async_trait]
pub trait Accept: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Destination requested by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// SOCKS5 listener relaying connections through a [`NetStack`]
pub struct Socks5Server<N, R> {
    net: Arc<N>,
    resolver: Arc<R>,
    connect_timeout: Duration,
}

impl<N: NetStack, R: NameResolver> Socks5Server<N, R> {
    pub fn new(net: Arc<N>, resolver: Arc<R>) -> Self {
        Self {
            net,
            resolver,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bind `addr` and serve until the future is dropped
    pub async fn listen_and_serve(self, addr: SocketAddr) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Listen {
                addr: addr.to_string(),
                source,
            })?;

        tracing::info!("SOCKS5 proxy listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve<L: Accept>(self, mut listener: L) -> Result<(), ProxyError> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept SOCKS5 connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let net = self.net.clone();
            let resolver = self.resolver.clone();
            let connect_timeout = self.connect_timeout;

            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, &*net, &*resolver, connect_timeout).await {
                    tracing::debug!("SOCKS5 connection from {} failed: {:#}", peer, e);
                }
            });
        }
    }
}

/// Serve one client from greeting to end of relay
async fn handle_client<S, N, R>(
    mut client: S,
    net: &N,
    resolver: &R,
    connect_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    N: NetStack,
    R: NameResolver,
{
    let target = tokio::time::timeout(HANDSHAKE_TIMEOUT, negotiate(&mut client))
        .await
        .context("SOCKS5 handshake timed out")??;

    let connected = tokio::time::timeout(connect_timeout, connect(&target, net, resolver)).await;
    let mut remote = match connected {
        Ok(Ok(remote)) => remote,
        Ok(Err((code, e))) => {
            write_reply(&mut client, code).await?;
            return Err(e.context(format!("connect to {}", target)));
        }
        Err(_) => {
            write_reply(&mut client, REP_HOST_UNREACHABLE).await?;
            bail!("connect to {} timed out after {:?}", target, connect_timeout);
        }
    };

    write_reply(&mut client, REP_SUCCEEDED).await?;
    tracing::debug!("Relaying to {}", target);

    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut remote)
        .await
        .context("relay")?;
    tracing::trace!("Closed {} ({} bytes up, {} bytes down)", target, sent, received);
    Ok(())
}

/// Method negotiation and request parsing. Unsupported requests are
/// answered before returning an error.
async fn negotiate<S>(client: &mut S) -> anyhow::Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await.context("read greeting")?;
    if header[0] != SOCKS_VERSION {
        bail!("unsupported SOCKS version {}", header[0]);
    }

    let mut methods = vec![0u8; header[1] as usize];
    client.read_exact(&mut methods).await.context("read methods")?;
    if !methods.contains(&METHOD_NO_AUTH) {
        client
            .write_all(&[SOCKS_VERSION, METHOD_NOT_ACCEPTABLE])
            .await?;
        bail!("client offered no acceptable authentication method");
    }
    client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await.context("read request")?;
    if request[0] != SOCKS_VERSION {
        bail!("unsupported SOCKS version {} in request", request[0]);
    }
    if request[1] != CMD_CONNECT {
        write_reply(client, REP_COMMAND_NOT_SUPPORTED).await?;
        bail!("unsupported command {}", request[1]);
    }

    let target = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            let port = client.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            let port = client.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            client.read_exact(&mut name).await?;
            let port = client.read_u16().await?;
            TargetAddr::Domain(String::from_utf8(name).context("domain is not UTF-8")?, port)
        }
        other => {
            write_reply(client, REP_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            bail!("unsupported address type {}", other);
        }
    };

    Ok(target)
}

/// Resolve and dial `target`, pairing failures with their reply code
async fn connect<N, R>(
    target: &TargetAddr,
    net: &N,
    resolver: &R,
) -> Result<N::Stream, (u8, anyhow::Error)>
where
    N: NetStack,
    R: NameResolver,
{
    let addr = match target {
        TargetAddr::Ip(addr) => *addr,
        TargetAddr::Domain(name, port) => {
            let ip = resolver
                .resolve(name)
                .await
                .map_err(|e| (REP_HOST_UNREACHABLE, anyhow::Error::new(e)))?;
            SocketAddr::new(ip, *port)
        }
    };

    net.dial(addr)
        .await
        .map_err(|e| (reply_code_for(&e), anyhow::Error::new(e)))
}

fn reply_code_for(error: &io::Error) -> u8 {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        io::ErrorKind::AddrNotAvailable => REP_NETWORK_UNREACHABLE,
        io::ErrorKind::TimedOut | io::ErrorKind::NotFound => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

/// Reply with an unspecified IPv4 bind address
async fn write_reply<S>(client: &mut S, code: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    client
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}
