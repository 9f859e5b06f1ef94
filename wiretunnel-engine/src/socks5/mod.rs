//! SOCKS5 proxy server
//!
//! One TCP listener for control connections and one UDP socket on the same
//! address for the relay. CONNECT targets go through the dial pipeline; UDP
//! destinations through [`UdpDialer`].

pub mod proto;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::net::Dialer;

pub use proto::{Datagram, TargetAddr};
pub use tcp::TcpHandler;
pub use udp::{UdpDialer, UdpRelay, MAX_DATAGRAM_SIZE};

/// SOCKS5 server
pub struct Socks5Server {
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    handler: Arc<TcpHandler>,
    relay: Arc<UdpRelay>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Socks5Server {
    /// Bind the TCP listener and the UDP relay socket
    ///
    /// The UDP socket shares the listener's resolved address, so binding port
    /// 0 gives both the same ephemeral port.
    pub async fn bind(
        addr: SocketAddr,
        credentials: Option<Credentials>,
        dialer: Arc<dyn Dialer>,
        udp_dialer: UdpDialer,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Socks5(format!("failed to bind {}: {}", addr, e)))?;
        let local = listener.local_addr()?;

        let udp = UdpSocket::bind(local)
            .await
            .map_err(|e| Error::Socks5(format!("failed to bind udp {}: {}", local, e)))?;
        let udp = Arc::new(udp);

        Ok(Self {
            listener,
            handler: Arc::new(TcpHandler::new(dialer, credentials, local.port())),
            relay: Arc::new(UdpRelay::new(udp.clone(), udp_dialer)),
            udp,
            shutdown_rx,
        })
    }

    /// Address of the TCP listener
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Address of the UDP relay socket
    pub fn udp_local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// Serve until shutdown is signalled
    pub async fn run(mut self) -> Result<()> {
        log::info!("SOCKS5 proxy listening on {}", self.local_addr()?);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    log::info!("SOCKS5 proxy shutting down");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handler.handle(stream).await {
                                    log::debug!("SOCKS5 TCP {} failed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            log::error!("SOCKS5 accept error: {}", e);
                        }
                    }
                }

                result = self.udp.recv_from(&mut buf) => {
                    match result {
                        Ok((len, client)) => {
                            let packet = buf[..len].to_vec();
                            let relay = self.relay.clone();
                            tokio::spawn(async move {
                                if let Err(e) = relay.handle_packet(client, &packet).await {
                                    log::debug!("SOCKS5 UDP {} failed: {}", client, e);
                                }
                            });
                        }
                        Err(e) => {
                            log::debug!("SOCKS5 UDP recv error: {}", e);
                        }
                    }
                }
            }
        }

        self.relay.close();
        Ok(())
    }
}
