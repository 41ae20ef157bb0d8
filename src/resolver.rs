//! Hostname resolution through the tunnel
//!
//! Proxy requests for hostnames are resolved with the tunnel's own stack so
//! the lookup leaves through the peer like the connection that follows it.

use std::net::{AddrParseError, IpAddr};
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::ResolveError;
use crate::tunnel::NetStack;

/// Name-resolution strategy of the proxy
#[async_trait]
pub trait NameResolver: Send + Sync + 'static {
    async fn resolve(&self, name: &str) -> Result<IpAddr, ResolveError>;
}

/// Resolves names with the tunnel's network stack
pub struct TunnelResolver<N> {
    net: Arc<N>,
}

impl<N: NetStack> TunnelResolver<N> {
    pub fn new(net: Arc<N>) -> Self {
        Self { net }
    }
}

#[async_trait]
impl<N: NetStack> NameResolver for TunnelResolver<N> {
    async fn resolve(&self, name: &str) -> Result<IpAddr, ResolveError> {
        let addrs = self
            .net
            .lookup_host(name)
            .await
            .map_err(|source| ResolveError::LookupFailed {
                name: name.to_string(),
                source,
            })?;

        let ip = pick_address(name, addrs)?;
        tracing::debug!("Resolved {} to {} through tunnel", name, ip);
        Ok(ip)
    }
}

fn pick_address(name: &str, addrs: Vec<String>) -> Result<IpAddr, ResolveError> {
    // ThreadRng is not Send, so it must not live across an await
    select_address(name, addrs, &mut rand::thread_rng())
}

/// Shuffle the candidates, then return the first one that is an IP literal.
///
/// Fails with `NoAddressFound` for an empty list and with the last parse
/// error when no candidate parses.
pub fn select_address<R: Rng + ?Sized>(
    name: &str,
    mut addrs: Vec<String>,
    rng: &mut R,
) -> Result<IpAddr, ResolveError> {
    if addrs.is_empty() {
        return Err(ResolveError::NoAddressFound {
            name: name.to_string(),
        });
    }

    addrs.shuffle(rng);

    let mut last_error: Option<(String, AddrParseError)> = None;
    for addr in addrs {
        match addr.parse::<IpAddr>() {
            Ok(ip) => return Ok(ip),
            Err(e) => last_error = Some((addr, e)),
        }
    }

    match last_error {
        Some((value, source)) => Err(ResolveError::InvalidAddress { value, source }),
        None => Err(ResolveError::NoAddressFound {
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::io;
    use std::net::SocketAddr;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::io::DuplexStream;

    /// Answers lookups from a fixed table
    struct FakeNet {
        answers: HashMap<String, Vec<String>>,
    }

    impl FakeNet {
        fn with(entries: &[(&str, Vec<&str>)]) -> Self {
            Self {
                answers: entries
                    .iter()
                    .map(|(name, addrs)| {
                        (name.to_string(), addrs.iter().map(|a| a.to_string()).collect())
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl NetStack for FakeNet {
        type Stream = DuplexStream;

        async fn dial(&self, _addr: SocketAddr) -> io::Result<DuplexStream> {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }

        async fn lookup_host(&self, host: &str) -> io::Result<Vec<String>> {
            self.answers
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
        }
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_address() {
        let mut rng = StdRng::seed_from_u64(1);
        let ip = select_address("host", strings(&["10.1.2.3"]), &mut rng).unwrap();
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_empty_is_no_address() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            select_address("nowhere.test", vec![], &mut rng),
            Err(ResolveError::NoAddressFound { name }) if name == "nowhere.test"
        ));
    }

    #[test]
    fn test_skips_unparsable_entries() {
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ip = select_address(
                "host",
                strings(&["bogus", "2001:db8::7", "also-bogus"]),
                &mut rng,
            )
            .unwrap();
            assert_eq!(ip, "2001:db8::7".parse::<IpAddr>().unwrap());
        }
    }

    #[test]
    fn test_all_unparsable_reports_parse_error() {
        let mut rng = StdRng::seed_from_u64(3);
        match select_address("host", strings(&["x", "y"]), &mut rng) {
            Err(ResolveError::InvalidAddress { value, .. }) => {
                assert!(value == "x" || value == "y")
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_same_seed_same_choice() {
        let addrs = strings(&["192.0.2.1", "192.0.2.2", "192.0.2.3", "2001:db8::1"]);
        let a = select_address("h", addrs.clone(), &mut StdRng::seed_from_u64(42)).unwrap();
        let b = select_address("h", addrs, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_choice_is_spread_across_answers() {
        let addrs = strings(&["192.0.2.1", "192.0.2.2", "2001:db8::1"]);
        let mut rng = StdRng::seed_from_u64(7);

        let seen: HashSet<IpAddr> = (0..200)
            .map(|_| select_address("h", addrs.clone(), &mut rng).unwrap())
            .collect();
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn test_resolver_uses_tunnel_lookup() {
        let net = FakeNet::with(&[("example.com", vec!["93.184.216.34"])]);
        let resolver = TunnelResolver::new(Arc::new(net));

        let ip = resolver.resolve("example.com").await.unwrap();
        assert_eq!(ip, "93.184.216.34".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolver_errors() {
        let net = FakeNet::with(&[("empty.test", vec![])]);
        let resolver = TunnelResolver::new(Arc::new(net));

        assert!(matches!(
            resolver.resolve("empty.test").await,
            Err(ResolveError::NoAddressFound { .. })
        ));
        assert!(matches!(
            resolver.resolve("unknown.test").await,
            Err(ResolveError::LookupFailed { name, .. }) if name == "unknown.test"
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolves_do_not_interfere() {
        let net = FakeNet::with(&[
            ("a.test", vec!["10.0.0.1"]),
            ("b.test", vec!["10.0.0.2", "10.0.0.3"]),
            ("c.test", vec![]),
        ]);
        let resolver = Arc::new(TunnelResolver::new(Arc::new(net)));

        let mut tasks = Vec::new();
        for i in 0..64 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                let name = ["a.test", "b.test", "c.test"][i % 3];
                (name, resolver.resolve(name).await)
            }));
        }

        for task in tasks {
            let (name, result) = task.await.unwrap();
            match name {
                "a.test" => assert_eq!(result.unwrap().to_string(), "10.0.0.1"),
                "b.test" => {
                    let ip = result.unwrap().to_string();
                    assert!(ip == "10.0.0.2" || ip == "10.0.0.3");
                }
                _ => assert!(matches!(result, Err(ResolveError::NoAddressFound { .. }))),
            }
        }
    }
}
