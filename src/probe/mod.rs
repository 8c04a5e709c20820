//! Relay reachability probing
//!
//! Ports are dialled concurrently. Name resolution and every dial share a
//! single deadline, so a slow resolver or a black-holed port cannot hold the
//! probe beyond the per-port timeout. No retries happen here.

use crate::config::{ClientConfig, DEFAULT_PROBE_TIMEOUT_MS};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Default per-port timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS);

/// Combined reachability of the relay control and SOCKS ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReachabilityResult {
    None,
    ControlOnly,
    SocksOnly,
    Both,
}

impl ReachabilityResult {
    pub fn from_flags(control: bool, socks: bool) -> Self {
        match (control, socks) {
            (true, true) => ReachabilityResult::Both,
            (true, false) => ReachabilityResult::ControlOnly,
            (false, true) => ReachabilityResult::SocksOnly,
            (false, false) => ReachabilityResult::None,
        }
    }

    /// Fold a per-port probe map for the given client config.
    /// Ports missing from the map count as unreachable.
    pub fn from_ports(config: &ClientConfig, ports: &HashMap<u16, bool>) -> Self {
        let reachable = |port: u16| ports.get(&port).copied().unwrap_or(false);
        Self::from_flags(reachable(config.relay_port), reachable(config.socks_port))
    }

    /// Only `Both` allows a start to proceed
    pub fn is_usable(&self) -> bool {
        matches!(self, ReachabilityResult::Both)
    }
}

impl fmt::Display for ReachabilityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReachabilityResult::None => write!(f, "none"),
            ReachabilityResult::ControlOnly => write!(f, "control-only"),
            ReachabilityResult::SocksOnly => write!(f, "socks-only"),
            ReachabilityResult::Both => write!(f, "both"),
        }
    }
}

/// Reachability prober
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Map every port to whether `host:port` accepted a connection in time
    async fn probe(&self, host: &str, ports: &[u16], per_port: Duration) -> HashMap<u16, bool>;

    /// Probe both relay ports of a client config
    async fn probe_relay(&self, config: &ClientConfig, per_port: Duration) -> ReachabilityResult {
        let ports = self
            .probe(
                &config.relay_host,
                &[config.relay_port, config.socks_port],
                per_port,
            )
            .await;
        ReachabilityResult::from_ports(config, &ports)
    }
}

/// TCP connect prober
#[derive(Debug, Clone, Default)]
pub struct TcpProber;

impl TcpProber {
    pub fn new() -> Self {
        TcpProber
    }

    /// Probe `ports` on whatever `lookup` resolves to, all before `deadline`
    async fn probe_until<L>(
        lookup: L,
        host: &str,
        ports: &[u16],
        deadline: Instant,
    ) -> HashMap<u16, bool>
    where
        L: Future<Output = io::Result<Vec<SocketAddr>>>,
    {
        let Some(addrs) = Self::resolve(lookup, host, deadline).await else {
            return ports.iter().map(|port| (*port, false)).collect();
        };

        let checks = ports.iter().map(|port| {
            let addrs = &addrs;
            async move { (*port, Self::dial(addrs, *port, deadline).await) }
        });

        let results: HashMap<u16, bool> = futures::future::join_all(checks).await.into_iter().collect();
        debug!("Probe of {}: {:?}", host, results);
        results
    }

    async fn resolve<L>(lookup: L, host: &str, deadline: Instant) -> Option<Vec<SocketAddr>>
    where
        L: Future<Output = io::Result<Vec<SocketAddr>>>,
    {
        match timeout_at(deadline, lookup).await {
            Ok(Ok(addrs)) => (!addrs.is_empty()).then_some(addrs),
            Ok(Err(e)) => {
                debug!("Cannot resolve {}: {}", host, e);
                None
            }
            Err(_) => {
                debug!("Resolving {} timed out", host);
                None
            }
        }
    }

    async fn dial(addrs: &[SocketAddr], port: u16, deadline: Instant) -> bool {
        let targets: Vec<SocketAddr> = addrs
            .iter()
            .map(|addr| SocketAddr::new(addr.ip(), port))
            .collect();

        match timeout_at(deadline, TcpStream::connect(&targets[..])).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Port {} unreachable: {}", port, e);
                false
            }
            Err(_) => {
                debug!("Port {} timed out", port);
                false
            }
        }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProber {
    /// Resolution and every connect share one deadline of `per_port`
    async fn probe(&self, host: &str, ports: &[u16], per_port: Duration) -> HashMap<u16, bool> {
        let deadline = Instant::now() + per_port;
        // Port is replaced per dial, only the IPs matter here
        let lookup = async {
            let addrs = tokio::net::lookup_host((host, 0)).await?;
            Ok::<Vec<SocketAddr>, io::Error>(addrs.collect())
        };
        Self::probe_until(lookup, host, ports, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_result_from_flags() {
        assert_eq!(ReachabilityResult::from_flags(true, true), ReachabilityResult::Both);
        assert_eq!(ReachabilityResult::from_flags(true, false), ReachabilityResult::ControlOnly);
        assert_eq!(ReachabilityResult::from_flags(false, true), ReachabilityResult::SocksOnly);
        assert_eq!(ReachabilityResult::from_flags(false, false), ReachabilityResult::None);
        assert!(ReachabilityResult::Both.is_usable());
        assert!(!ReachabilityResult::ControlOnly.is_usable());
    }

    #[test]
    fn test_result_from_ports_missing_entry() {
        let config = ClientConfig::new("10.0.0.1", 9000, 9001);
        let ports = HashMap::from([(9000, true)]);
        assert_eq!(
            ReachabilityResult::from_ports(&config, &ports),
            ReachabilityResult::ControlOnly
        );
    }

    #[tokio::test]
    async fn test_probe_open_and_closed_ports() {
        let open = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = open.local_addr().unwrap().port();

        // Bind then drop to get a port nothing listens on
        let closed_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let results = TcpProber::new()
            .probe("127.0.0.1", &[open_port, closed_port], Duration::from_millis(500))
            .await;

        assert_eq!(results.get(&open_port), Some(&true));
        assert_eq!(results.get(&closed_port), Some(&false));
    }

    #[tokio::test]
    async fn test_probe_relay_socks_only() {
        let socks = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socks_port = socks.local_addr().unwrap().port();
        let control_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let config = ClientConfig::new("127.0.0.1", control_port, socks_port);
        let result = TcpProber::new()
            .probe_relay(&config, Duration::from_millis(500))
            .await;
        assert_eq!(result, ReachabilityResult::SocksOnly);
    }

    #[tokio::test]
    async fn test_unresolvable_host_marks_all_unreachable() {
        let results = TcpProber::new()
            .probe("host.invalid", &[9000, 9001], Duration::from_millis(500))
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|reachable| !reachable));
    }

    #[tokio::test]
    async fn test_probe_is_bounded_by_timeout() {
        // TEST-NET-1 is never routed; either times out or fails fast
        let started = Instant::now();
        let results = TcpProber::new()
            .probe("192.0.2.1", &[9000, 9001], Duration::from_millis(200))
            .await;
        assert!(results.values().all(|reachable| !reachable));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_stalled_resolver_is_cut_at_deadline() {
        let per_port = Duration::from_millis(200);
        let started = Instant::now();

        let lookup = std::future::pending::<io::Result<Vec<SocketAddr>>>();
        let results =
            TcpProber::probe_until(lookup, "relay.slow", &[9000, 9001], started + per_port).await;

        assert_eq!(results, HashMap::from([(9000, false), (9001, false)]));
        assert!(started.elapsed() < per_port + Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_slow_resolver_shares_deadline_with_dials() {
        let per_port = Duration::from_millis(300);
        let started = Instant::now();

        // Resolves late to an address that never answers
        let lookup = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok::<_, io::Error>(vec!["192.0.2.1:0".parse::<SocketAddr>().unwrap()])
        };
        let results =
            TcpProber::probe_until(lookup, "relay.slow", &[9000, 9001], started + per_port).await;

        assert!(results.values().all(|reachable| !reachable));
        assert!(started.elapsed() < per_port + Duration::from_millis(150));
    }
}
