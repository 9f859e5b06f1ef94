//! SOCKS5 UDP relay
//!
//! Every `(client, destination)` pair gets its own remote socket, so replies
//! can be routed back without inspecting them. Sessions live until their
//! remote socket fails; the local port each pair used is remembered and
//! reused when the pair comes back.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::prelude::IndexedRandom;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::proto::{Datagram, TargetAddr};
use crate::bypass::BypassList;
use crate::dial::is_forbidden;
use crate::dns::Resolver;
use crate::error::{Error, Result};
use crate::net::{PacketConn, UdpConn};
use crate::tunnel::Tunnel;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65507;

type SessionKey = (SocketAddr, String);

/// Opens the remote side of UDP sessions
///
/// Applies the same policy as the stream pipeline: hostnames are resolved
/// (one address picked at random), loopback and unspecified addresses are
/// refused, bypassed destinations use the host stack.
pub struct UdpDialer {
    resolver: Arc<dyn Resolver>,
    bypass: Arc<BypassList>,
    tunnel: Arc<dyn Tunnel>,
}

impl UdpDialer {
    pub fn new(resolver: Arc<dyn Resolver>, bypass: Arc<BypassList>, tunnel: Arc<dyn Tunnel>) -> Self {
        Self {
            resolver,
            bypass,
            tunnel,
        }
    }

    /// Open a socket to `target`, bound to `local` when given
    pub async fn dial(
        &self,
        local: Option<SocketAddr>,
        target: &TargetAddr,
    ) -> Result<Arc<dyn PacketConn>> {
        let remote = match target {
            TargetAddr::Ip(addr) => *addr,
            TargetAddr::Domain(host, port) => {
                let addrs = self.resolver.lookup_host(host).await?;
                let ip = addrs.choose(&mut rand::rng()).ok_or_else(|| Error::NoSuchHost {
                    host: host.clone(),
                    server: "resolver".into(),
                })?;
                SocketAddr::new(*ip, *port)
            }
        };

        if is_forbidden(remote.ip()) {
            return Err(Error::InvalidAddress(remote.to_string()));
        }

        if self.bypass.contains(remote.ip()) {
            log::debug!("socks5: udp {} bypasses the tunnel", remote);
            let conn = UdpConn::connect(local, remote).await?;
            return Ok(Arc::new(conn));
        }

        self.tunnel.dial_udp(local, remote).await
    }
}

struct UdpSession {
    client: SocketAddr,
    target: TargetAddr,
    remote: Arc<dyn PacketConn>,
}

/// Session table for the SOCKS5 UDP port
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    dialer: UdpDialer,
    sessions: DashMap<SessionKey, Arc<UdpSession>>,
    local_addrs: DashMap<SessionKey, SocketAddr>,
    closed: watch::Sender<bool>,
}

impl UdpRelay {
    /// Relay datagrams received on `socket`
    pub fn new(socket: Arc<UdpSocket>, dialer: UdpDialer) -> Self {
        Self {
            socket,
            dialer,
            sessions: DashMap::new(),
            local_addrs: DashMap::new(),
            closed: watch::channel(false).0,
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Local address of the session for `client` and `target`, if one is live
    pub fn session_local_addr(&self, client: SocketAddr, target: &TargetAddr) -> Option<SocketAddr> {
        let session = self.sessions.get(&(client, target.to_string()))?;
        session.remote.local_addr().ok()
    }

    /// Handle one packet from `client`
    pub async fn handle_packet(self: &Arc<Self>, client: SocketAddr, packet: &[u8]) -> Result<()> {
        let datagram = Datagram::parse(packet)?;
        if datagram.frag != 0 {
            log::debug!("socks5: dropping fragmented datagram from {}", client);
            return Ok(());
        }

        let key = (client, datagram.target.to_string());

        let existing = self.sessions.get(&key).map(|s| Arc::clone(s.value()));
        if let Some(session) = existing {
            session.remote.send(&datagram.data).await?;
            return Ok(());
        }

        let remembered = self.local_addrs.get(&key).map(|addr| *addr);
        let remote = match self.dialer.dial(remembered, &datagram.target).await {
            Ok(remote) => remote,
            Err(e) if remembered.is_some() && e.is_addr_in_use() => {
                log::debug!(
                    "socks5: local address {:?} for {} -> {} is taken, using a new port",
                    remembered,
                    client,
                    datagram.target
                );
                let remote = self.dialer.dial(None, &datagram.target).await?;
                self.local_addrs.insert(key.clone(), remote.local_addr()?);
                remote
            }
            Err(e) => return Err(e),
        };

        if remembered.is_none() {
            self.local_addrs.insert(key.clone(), remote.local_addr()?);
        }

        let session = match self.sessions.entry(key.clone()) {
            Entry::Occupied(winner) => {
                // Another packet of the same pair opened the session first
                let winner = Arc::clone(winner.get());
                self.local_addrs.insert(key, winner.remote.local_addr()?);
                winner
            }
            Entry::Vacant(slot) => {
                let session = Arc::new(UdpSession {
                    client,
                    target: datagram.target,
                    remote,
                });
                slot.insert(Arc::clone(&session));
                tokio::spawn(Arc::clone(self).read_loop(key, Arc::clone(&session)));
                session
            }
        };

        session.remote.send(&datagram.data).await?;
        Ok(())
    }

    /// Stop every session's read loop
    pub fn close(&self) {
        self.closed.send_replace(true);
        self.sessions.clear();
    }

    async fn read_loop(self: Arc<Self>, key: SessionKey, session: Arc<UdpSession>) {
        let mut closed = self.closed.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        // The flag only ever flips to true
        while !*closed.borrow_and_update() {
            let len = tokio::select! {
                result = session.remote.recv(&mut buf) => match result {
                    Ok(len) => len,
                    Err(e) => {
                        log::debug!("socks5: udp session {} -> {} ended: {}", session.client, session.target, e);
                        break;
                    }
                },
                _ = closed.changed() => break,
            };

            let reply = match Datagram::new(session.target.clone(), buf[..len].to_vec()).to_bytes() {
                Ok(reply) => reply,
                Err(e) => {
                    log::debug!("socks5: cannot frame reply for {}: {}", session.client, e);
                    break;
                }
            };

            if let Err(e) = self.socket.send_to(&reply, session.client).await {
                log::debug!("socks5: udp send to {} failed: {}", session.client, e);
                break;
            }
        }

        self.sessions
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &session));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::net::{BoxConn, Dialer, Network};

    /// Tunnel that redirects datagrams for public addresses to local sockets
    struct RedirectTunnel {
        routes: HashMap<SocketAddr, SocketAddr>,
        delay: Duration,
    }

    #[async_trait]
    impl Dialer for RedirectTunnel {
        async fn dial(&self, _network: Network, addr: &str) -> Result<BoxConn> {
            Err(Error::Tunnel(format!("no stream route to {}", addr)))
        }
    }

    #[async_trait]
    impl Tunnel for RedirectTunnel {
        async fn dial_udp(
            &self,
            local: Option<SocketAddr>,
            remote: SocketAddr,
        ) -> Result<Arc<dyn PacketConn>> {
            tokio::time::sleep(self.delay).await;
            let target = self
                .routes
                .get(&remote)
                .ok_or_else(|| Error::Tunnel(format!("no route to {}", remote)))?;
            Ok(Arc::new(UdpConn::connect(local, *target).await?))
        }

        fn dns_servers(&self) -> &[IpAddr] {
            &[]
        }

        async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>> {
            match host {
                "echo.test" => Ok(vec!["192.0.2.10".parse().unwrap()]),
                _ => Err(Error::NoSuchHost {
                    host: host.into(),
                    server: "redirect".into(),
                }),
            }
        }
    }

    async fn echo_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
                socket.send_to(&buf[..len], peer).await.unwrap();
            }
        });
        addr
    }

    struct Harness {
        relay: Arc<UdpRelay>,
        client: UdpSocket,
        client_addr: SocketAddr,
    }

    async fn harness(routes: HashMap<SocketAddr, SocketAddr>) -> Harness {
        slow_harness(routes, Duration::ZERO).await
    }

    /// Harness whose tunnel takes `delay` to open each datagram socket
    async fn slow_harness(routes: HashMap<SocketAddr, SocketAddr>, delay: Duration) -> Harness {
        let tunnel: Arc<dyn Tunnel> = Arc::new(RedirectTunnel { routes, delay });
        let resolver: Arc<dyn Resolver> = Arc::new(crate::dns::TunnelResolver::new(tunnel.clone()));
        let dialer = UdpDialer::new(resolver, Arc::new(BypassList::default()), tunnel);

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let relay = Arc::new(UdpRelay::new(socket.clone(), dialer));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(socket.local_addr().unwrap()).await.unwrap();
        let client_addr = client.local_addr().unwrap();

        Harness {
            relay,
            client,
            client_addr,
        }
    }

    fn packet(target: &TargetAddr, data: &[u8]) -> Vec<u8> {
        Datagram::new(target.clone(), data.to_vec()).to_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_reply_is_framed_with_destination() {
        let echo = echo_server().await;
        let public: SocketAddr = "192.0.2.10:7".parse().unwrap();
        let h = harness(HashMap::from([(public, echo)])).await;

        let target = TargetAddr::Domain("echo.test".into(), 7);
        h.relay
            .handle_packet(h.client_addr, &packet(&target, b"ping"))
            .await
            .unwrap();

        let mut buf = vec![0u8; 2048];
        let len = h.client.recv(&mut buf).await.unwrap();
        let reply = Datagram::parse(&buf[..len]).unwrap();
        assert_eq!(reply.target, target);
        assert_eq!(reply.data, b"ping");
    }

    #[tokio::test]
    async fn test_same_pair_reuses_session() {
        let echo = echo_server().await;
        let public: SocketAddr = "192.0.2.10:7".parse().unwrap();
        let h = harness(HashMap::from([(public, echo)])).await;
        let target = TargetAddr::Ip(public);

        h.relay
            .handle_packet(h.client_addr, &packet(&target, b"one"))
            .await
            .unwrap();
        let first = h.relay.session_local_addr(h.client_addr, &target).unwrap();

        h.relay
            .handle_packet(h.client_addr, &packet(&target, b"two"))
            .await
            .unwrap();
        assert_eq!(h.relay.session_count(), 1);
        assert_eq!(h.relay.session_local_addr(h.client_addr, &target), Some(first));

        let mut buf = vec![0u8; 2048];
        for expected in [&b"one"[..], &b"two"[..]] {
            let len = h.client.recv(&mut buf).await.unwrap();
            assert_eq!(Datagram::parse(&buf[..len]).unwrap().data, expected);
        }
    }

    #[tokio::test]
    async fn test_racing_first_packets_share_one_session() {
        let echo = echo_server().await;
        let public: SocketAddr = "192.0.2.10:7".parse().unwrap();
        let h = slow_harness(HashMap::from([(public, echo)]), Duration::from_millis(50)).await;
        let target = TargetAddr::Ip(public);

        let q1 = packet(&target, b"q1");
        let q2 = packet(&target, b"q2");
        let (first, second) = tokio::join!(
            h.relay.handle_packet(h.client_addr, &q1),
            h.relay.handle_packet(h.client_addr, &q2),
        );
        first.unwrap();
        second.unwrap();
        assert_eq!(h.relay.session_count(), 1);

        let mut got = Vec::new();
        let mut buf = vec![0u8; 2048];
        for _ in 0..2 {
            let len = tokio::time::timeout(Duration::from_secs(2), h.client.recv(&mut buf))
                .await
                .expect("both replies should arrive")
                .unwrap();
            got.push(Datagram::parse(&buf[..len]).unwrap().data);
        }
        got.sort();
        assert_eq!(got, vec![b"q1".to_vec(), b"q2".to_vec()]);

        let live = h.relay.session_local_addr(h.client_addr, &target).unwrap();
        let key = (h.client_addr, target.to_string());
        assert_eq!(*h.relay.local_addrs.get(&key).unwrap(), live);
    }

    #[tokio::test]
    async fn test_new_destination_gets_own_session() {
        let echo_a = echo_server().await;
        let echo_b = echo_server().await;
        let a: SocketAddr = "192.0.2.10:7".parse().unwrap();
        let b: SocketAddr = "192.0.2.11:7".parse().unwrap();
        let h = harness(HashMap::from([(a, echo_a), (b, echo_b)])).await;

        h.relay
            .handle_packet(h.client_addr, &packet(&TargetAddr::Ip(a), b"a"))
            .await
            .unwrap();
        h.relay
            .handle_packet(h.client_addr, &packet(&TargetAddr::Ip(b), b"b"))
            .await
            .unwrap();

        assert_eq!(h.relay.session_count(), 2);
        let local_a = h.relay.session_local_addr(h.client_addr, &TargetAddr::Ip(a)).unwrap();
        let local_b = h.relay.session_local_addr(h.client_addr, &TargetAddr::Ip(b)).unwrap();
        assert_ne!(local_a, local_b);
    }

    #[tokio::test]
    async fn test_remembered_local_address_is_used() {
        let echo = echo_server().await;
        let public: SocketAddr = "192.0.2.10:7".parse().unwrap();
        let h = harness(HashMap::from([(public, echo)])).await;
        let target = TargetAddr::Ip(public);

        let free = UdpSocket::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        h.relay
            .local_addrs
            .insert((h.client_addr, target.to_string()), free);

        h.relay
            .handle_packet(h.client_addr, &packet(&target, b"again"))
            .await
            .unwrap();
        assert_eq!(h.relay.session_local_addr(h.client_addr, &target), Some(free));
    }

    #[tokio::test]
    async fn test_taken_port_falls_back_to_new_one() {
        let echo = echo_server().await;
        let public: SocketAddr = "192.0.2.10:7".parse().unwrap();
        let h = harness(HashMap::from([(public, echo)])).await;
        let target = TargetAddr::Ip(public);
        let key = (h.client_addr, target.to_string());

        let squatter = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let taken = squatter.local_addr().unwrap();
        h.relay.local_addrs.insert(key.clone(), taken);

        h.relay
            .handle_packet(h.client_addr, &packet(&target, b"hi"))
            .await
            .unwrap();

        let used = h.relay.session_local_addr(h.client_addr, &target).unwrap();
        assert_ne!(used, taken);
        assert_eq!(*h.relay.local_addrs.get(&key).unwrap(), used);
    }

    #[tokio::test]
    async fn test_rejects_loopback_and_fragments() {
        let h = harness(HashMap::new()).await;

        let loopback = TargetAddr::Ip("127.0.0.1:53".parse().unwrap());
        let err = h
            .relay
            .handle_packet(h.client_addr, &packet(&loopback, b"x"))
            .await
            .unwrap_err();
        assert!(err.is_invalid_address());

        let mut fragment = packet(&TargetAddr::Ip("192.0.2.10:7".parse().unwrap()), b"x");
        fragment[2] = 1;
        h.relay.handle_packet(h.client_addr, &fragment).await.unwrap();
        assert_eq!(h.relay.session_count(), 0);
    }
}
