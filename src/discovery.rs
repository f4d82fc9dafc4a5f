//! Collector discovery over UDP multicast
//!
//! Wire format, one ASCII line per datagram:
//!
//! ```text
//! probe:    DISCOVER <TCP|UDP>
//! response: ENDPOINT <TCP|UDP> <host> <port>
//! ```
//!
//! The first well-formed response wins. Malformed datagrams are counted and
//! ignored until the timeout expires. A response host of `0.0.0.0` stands for
//! the address the response came from.

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};

use crate::config::{DiscoveryConfig, EndpointConfig, Protocol};
use crate::error::{AgentError, Result};

const PROBE_VERB: &str = "DISCOVER";
const RESPONSE_VERB: &str = "ENDPOINT";

/// A resolved collector address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }

    /// `host:port`, suitable for socket connects
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Where a discovery run currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Probing,
    Resolved(Endpoint),
    /// No responder answered; holds the static fallback if there was one
    TimedOut(Option<Endpoint>),
}

/// Encode the probe datagram
pub fn encode_probe(protocol: Protocol) -> String {
    format!("{} {}", PROBE_VERB, protocol)
}

/// Decode a probe datagram into the requested protocol
pub fn parse_probe(datagram: &str) -> Result<Protocol> {
    let mut parts = datagram.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(PROBE_VERB), Some(protocol), None) => protocol.parse(),
        _ => Err(AgentError::MalformedResponse(format!("not a probe: {:?}", datagram))),
    }
}

/// Encode a response datagram
pub fn encode_response(endpoint: &Endpoint) -> String {
    format!(
        "{} {} {} {}",
        RESPONSE_VERB, endpoint.protocol, endpoint.host, endpoint.port
    )
}

/// Decode a response datagram
pub fn parse_response(datagram: &str) -> Result<Endpoint> {
    let malformed = |why: &str| AgentError::MalformedResponse(format!("{}: {:?}", why, datagram));

    let parts: Vec<&str> = datagram.split_whitespace().collect();
    let [verb, protocol, host, port] = parts.as_slice() else {
        return Err(malformed("expected 4 fields"));
    };
    if *verb != RESPONSE_VERB {
        return Err(malformed("unknown verb"));
    }
    let protocol = protocol
        .parse::<Protocol>()
        .map_err(|_| malformed("unknown protocol"))?;
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| malformed("invalid port"))?;

    Ok(Endpoint::new(*host, port, protocol))
}

/// Locates the collector, falling back to the statically configured endpoint
pub struct DiscoveryClient {
    config: DiscoveryConfig,
    fallback: Option<Endpoint>,
    state: Mutex<DiscoveryState>,
    probes_sent: AtomicU64,
    malformed: AtomicU64,
}

impl DiscoveryClient {
    pub fn new(config: &EndpointConfig) -> Self {
        let fallback = config
            .host
            .as_ref()
            .map(|host| Endpoint::new(host.clone(), config.effective_port(), config.protocol));

        Self {
            config: config.discovery.clone(),
            fallback,
            state: Mutex::new(DiscoveryState::Idle),
            probes_sent: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_state(&self, state: DiscoveryState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Probes put on the wire since creation
    pub fn probes_sent(&self) -> u64 {
        self.probes_sent.load(Ordering::Relaxed)
    }

    /// Responses ignored because they did not parse
    pub fn malformed_responses(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Resolve the collector endpoint
    ///
    /// With discovery disabled this never touches the network. Otherwise the
    /// probe is abandoned as soon as `shutdown` flips.
    pub async fn discover(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Endpoint> {
        if !self.config.enabled {
            let endpoint = self.fallback.clone().ok_or_else(|| {
                AgentError::EndpointUnresolved(
                    "discovery is disabled and no collector host is configured".to_string(),
                )
            })?;
            debug!("Discovery disabled, using configured endpoint {}", endpoint);
            self.set_state(DiscoveryState::Resolved(endpoint.clone()));
            return Ok(endpoint);
        }

        if *shutdown.borrow() {
            return Err(AgentError::Shutdown);
        }

        self.set_state(DiscoveryState::Probing);
        let outcome = tokio::select! {
            result = self.probe() => result,
            _ = shutdown.changed() => Err(AgentError::Shutdown),
        };

        match outcome {
            Ok(endpoint) => {
                info!("Discovered collector at {}", endpoint);
                self.set_state(DiscoveryState::Resolved(endpoint.clone()));
                Ok(endpoint)
            }
            Err(AgentError::Shutdown) => {
                self.set_state(DiscoveryState::Idle);
                Err(AgentError::Shutdown)
            }
            Err(e) => {
                self.set_state(DiscoveryState::TimedOut(self.fallback.clone()));
                match &self.fallback {
                    Some(endpoint) => {
                        info!("{}; falling back to configured endpoint {}", e, endpoint);
                        Ok(endpoint.clone())
                    }
                    None => Err(AgentError::DiscoveryFailed(e.to_string())),
                }
            }
        }
    }

    async fn listen_address(&self) -> Ipv4Addr {
        let iface = self.config.listen_interface.trim();
        if let Ok(addr) = iface.parse::<Ipv4Addr>() {
            return addr;
        }

        match lookup_host((iface, 0)).await {
            Ok(addrs) => {
                for addr in addrs {
                    if let IpAddr::V4(v4) = addr.ip() {
                        return v4;
                    }
                }
                warn!("Listen interface '{}' has no IPv4 address", iface);
            }
            Err(e) => warn!("Unable to resolve listen interface '{}': {}", iface, e),
        }
        Ipv4Addr::UNSPECIFIED
    }

    async fn probe(&self) -> Result<Endpoint> {
        let network = &self.config.network;
        let group: Ipv4Addr = network.parse().map_err(|e| {
            AgentError::Config(format!("Invalid discovery network '{}': {}", network, e))
        })?;
        let iface = self.listen_address().await;
        let deadline = Instant::now() + self.config.timeout();

        let socket = bind_discovery_socket(group, self.config.port).await?;
        if group.is_multicast() {
            if let Err(e) = socket.join_multicast_v4(group, iface) {
                warn!(
                    "Joining {} on {} failed ({}), using default interface",
                    group, iface, e
                );
                if let Err(e) = socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                    warn!("Joining {} failed ({}), expecting unicast answers only", group, e);
                }
            }
        }

        let target = SocketAddr::from((group, self.config.port));
        let probe = encode_probe(self.config.preferred_protocol);
        socket.send_to(probe.as_bytes(), target).await?;
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
        debug!("Sent discovery probe '{}' to {}", probe, target);

        let mut buf = [0u8; 1024];
        loop {
            let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => {
                    return Err(AgentError::DiscoveryFailed(format!(
                        "no collector answered within {:?}",
                        self.config.timeout()
                    )));
                }
                Ok(Err(e)) => {
                    debug!("Discovery receive error: {}", e);
                    continue;
                }
                Ok(Ok(received)) => received,
            };

            let datagram = String::from_utf8_lossy(&buf[..len]);
            match interpret_datagram(&datagram, from) {
                Ok(Some(endpoint)) => return Ok(endpoint),
                Ok(None) => trace!("Ignoring discovery request from {}", from),
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!("Ignoring datagram from {}: {}", from, e);
                }
            }
        }
    }
}

/// Bind the socket discovery listens on
///
/// For a multicast group this is the group port, so responses sent to the
/// group reach us as well as unicast replies. If another process already holds
/// that port the socket falls back to an ephemeral port and only unicast
/// replies arrive.
async fn bind_discovery_socket(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    if group.is_multicast() {
        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) => warn!(
                "Discovery port {} unavailable ({}), listening for unicast replies only",
                port, e
            ),
        }
    }
    Ok(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?)
}

/// Classify one received datagram
///
/// Requests, including our own looped back from the group, are `None`.
fn interpret_datagram(datagram: &str, from: SocketAddr) -> Result<Option<Endpoint>> {
    if parse_probe(datagram).is_ok() {
        return Ok(None);
    }
    let mut endpoint = parse_response(datagram)?;
    if endpoint.host == Ipv4Addr::UNSPECIFIED.to_string() {
        endpoint.host = from.ip().to_string();
    }
    Ok(Some(endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(port: u16, host: Option<&str>, timeout_ms: u64) -> EndpointConfig {
        let mut config = EndpointConfig::default();
        config.host = host.map(str::to_string);
        config.port = Some(7000);
        config.discovery = DiscoveryConfig {
            enabled: true,
            network: "127.0.0.1".to_string(),
            port,
            timeout_ms,
            preferred_protocol: Protocol::Udp,
            listen_interface: "127.0.0.1".to_string(),
        };
        config
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(encode_probe(Protocol::Tcp), "DISCOVER TCP");
        assert_eq!(parse_probe("DISCOVER UDP").unwrap(), Protocol::Udp);
        assert!(parse_probe("DISCOVER").is_err());

        let endpoint = Endpoint::new("10.0.0.5", 9428, Protocol::Tcp);
        assert_eq!(encode_response(&endpoint), "ENDPOINT TCP 10.0.0.5 9428");
        assert_eq!(parse_response("ENDPOINT TCP 10.0.0.5 9428\n").unwrap(), endpoint);
    }

    #[test]
    fn test_malformed_responses_rejected() {
        for bad in [
            "",
            "ENDPOINT TCP host",
            "HELLO TCP host 1",
            "ENDPOINT SCTP host 1",
            "ENDPOINT TCP host 0",
            "ENDPOINT TCP host 70000",
            "ENDPOINT TCP host 1 extra",
        ] {
            assert!(
                matches!(parse_response(bad), Err(AgentError::MalformedResponse(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_disabled_uses_static_without_probe() {
        let mut config = config(1, Some("collector"), 100);
        config.discovery.enabled = false;
        let client = DiscoveryClient::new(&config);
        let (_tx, mut rx) = watch::channel(false);

        let endpoint = client.discover(&mut rx).await.unwrap();
        assert_eq!(endpoint, Endpoint::new("collector", 7000, Protocol::Tcp));
        assert_eq!(client.probes_sent(), 0);
        assert_eq!(client.state(), DiscoveryState::Resolved(endpoint));
    }

    #[tokio::test]
    async fn test_disabled_without_host_is_unresolved() {
        let mut config = config(1, None, 100);
        config.discovery.enabled = false;
        let client = DiscoveryClient::new(&config);
        let (_tx, mut rx) = watch::channel(false);

        let err = client.discover(&mut rx).await.unwrap_err();
        assert!(matches!(err, AgentError::EndpointUnresolved(_)));
    }

    #[tokio::test]
    async fn test_first_valid_response_wins() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            let requested = parse_probe(&String::from_utf8_lossy(&buf[..len])).unwrap();
            responder.send_to(b"garbage", from).await.unwrap();
            let first = encode_response(&Endpoint::new("10.1.2.3", 4567, requested));
            responder.send_to(first.as_bytes(), from).await.unwrap();
            responder.send_to(b"ENDPOINT TCP 10.9.9.9 1", from).await.unwrap();
        });

        let client = DiscoveryClient::new(&config(port, None, 2000));
        let (_tx, mut rx) = watch::channel(false);
        let endpoint = client.discover(&mut rx).await.unwrap();
        server.await.unwrap();

        assert_eq!(endpoint, Endpoint::new("10.1.2.3", 4567, Protocol::Udp));
        assert_eq!(client.probes_sent(), 1);
        assert_eq!(client.malformed_responses(), 1);
        assert_eq!(client.state(), DiscoveryState::Resolved(endpoint));
    }

    #[tokio::test]
    async fn test_unspecified_host_means_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = responder.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (_, from) = responder.recv_from(&mut buf).await.unwrap();
            responder.send_to(b"ENDPOINT TCP 0.0.0.0 9000", from).await.unwrap();
        });

        let client = DiscoveryClient::new(&config(port, None, 2000));
        let (_tx, mut rx) = watch::channel(false);
        let endpoint = client.discover(&mut rx).await.unwrap();
        assert_eq!(endpoint.host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_static_host() {
        // Bound but silent
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let client = DiscoveryClient::new(&config(port, Some("fallback.local"), 100));
        let (_tx, mut rx) = watch::channel(false);
        let endpoint = client.discover(&mut rx).await.unwrap();

        let expected = Endpoint::new("fallback.local", 7000, Protocol::Tcp);
        assert_eq!(endpoint, expected);
        assert_eq!(client.state(), DiscoveryState::TimedOut(Some(expected)));
        drop(silent);
    }

    #[tokio::test]
    async fn test_timeout_without_static_host_fails() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let client = DiscoveryClient::new(&config(port, None, 100));
        let (_tx, mut rx) = watch::channel(false);
        let err = client.discover(&mut rx).await.unwrap_err();

        assert!(matches!(err, AgentError::DiscoveryFailed(_)));
        assert_eq!(client.state(), DiscoveryState::TimedOut(None));
        drop(silent);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_probe() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let client = DiscoveryClient::new(&config(port, Some("fallback"), 10_000));
        let (tx, mut rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
            tx
        });

        let started = std::time::Instant::now();
        let err = client.discover(&mut rx).await.unwrap_err();
        assert!(matches!(err, AgentError::Shutdown));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.state(), DiscoveryState::Idle);
        drop(stopper.await.unwrap());
        drop(silent);
    }

    #[test]
    fn test_interpret_datagram() {
        let from: SocketAddr = "192.0.2.7:5000".parse().unwrap();

        assert_eq!(interpret_datagram("DISCOVER TCP", from).unwrap(), None);
        assert_eq!(
            interpret_datagram("ENDPOINT UDP 0.0.0.0 9429", from).unwrap(),
            Some(Endpoint::new("192.0.2.7", 9429, Protocol::Udp))
        );
        assert_eq!(
            interpret_datagram("ENDPOINT TCP 10.0.0.1 9428", from).unwrap(),
            Some(Endpoint::new("10.0.0.1", 9428, Protocol::Tcp))
        );
        assert!(matches!(
            interpret_datagram("DISCOVER", from),
            Err(AgentError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_multicast_socket_listens_on_group_port() {
        let group: Ipv4Addr = "239.255.42.99".parse().unwrap();
        let port = {
            let free = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
            free.local_addr().unwrap().port()
        };

        let socket = bind_discovery_socket(group, port).await.unwrap();
        assert_eq!(socket.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_multicast_socket_falls_back_when_port_taken() {
        let group: Ipv4Addr = "239.255.42.99".parse().unwrap();
        let holder = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let socket = bind_discovery_socket(group, port).await.unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_unicast_network_uses_ephemeral_port() {
        let holder = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let socket = bind_discovery_socket(Ipv4Addr::LOCALHOST, port).await.unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), port);
    }
}
