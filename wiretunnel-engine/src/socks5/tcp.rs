//! SOCKS5 control connections

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::proto::{
    negotiate, read_request, write_reply, Request, TargetAddr, CMD_CONNECT, CMD_UDP_ASSOCIATE,
    REP_CMD_NOT_SUPPORTED, REP_HOST_UNREACH, REP_SUCCESS,
};
use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::net::{BoxConn, Dialer, Network};

/// Serves CONNECT and UDP ASSOCIATE on accepted TCP connections
pub struct TcpHandler {
    dialer: Arc<dyn Dialer>,
    credentials: Option<Credentials>,
    udp_port: u16,
}

impl TcpHandler {
    /// `udp_port` is the port of the relay socket announced to UDP clients
    pub fn new(dialer: Arc<dyn Dialer>, credentials: Option<Credentials>, udp_port: u16) -> Self {
        Self {
            dialer,
            credentials,
            udp_port,
        }
    }

    /// Serve one client connection to completion
    pub async fn handle(&self, mut stream: TcpStream) -> Result<()> {
        negotiate(&mut stream, self.credentials.as_ref()).await?;
        let request = read_request(&mut stream).await?;

        match request.command {
            CMD_CONNECT => {
                let remote = self.connect(&mut stream, &request).await?;
                relay(stream, remote).await;
                Ok(())
            }
            CMD_UDP_ASSOCIATE => self.associate(stream).await,
            other => {
                write_reply(&mut stream, REP_CMD_NOT_SUPPORTED, &request.target.unspecified_reply())
                    .await?;
                Err(Error::UnsupportedCommand(other))
            }
        }
    }

    /// Dial the target and send the reply
    async fn connect<W>(&self, client: &mut W, request: &Request) -> Result<BoxConn>
    where
        W: AsyncWrite + Unpin,
    {
        let unreachable = request.target.unspecified_reply();

        let remote = match self.dialer.dial(Network::Tcp, &request.target.to_string()).await {
            Ok(remote) => remote,
            Err(e) => {
                write_reply(client, REP_HOST_UNREACH, &unreachable).await?;
                return Err(e);
            }
        };

        let bound = match remote.local_addr() {
            Ok(bound) => bound,
            Err(e) => {
                write_reply(client, REP_HOST_UNREACH, &unreachable).await?;
                return Err(e.into());
            }
        };

        write_reply(client, REP_SUCCESS, &TargetAddr::Ip(bound)).await?;
        Ok(remote)
    }

    /// Announce the UDP relay, then hold the control connection until the
    /// client closes it
    async fn associate(&self, mut stream: TcpStream) -> Result<()> {
        let local = stream.local_addr()?;
        let relay_addr = SocketAddr::new(local.ip(), self.udp_port);
        write_reply(&mut stream, REP_SUCCESS, &TargetAddr::Ip(relay_addr)).await?;

        tokio::io::copy(&mut stream, &mut tokio::io::sink()).await?;
        Ok(())
    }
}

/// Copy bytes both ways until either direction stops
///
/// Remote-to-client runs in its own task; client-to-remote is driven here.
pub async fn relay<C, R>(client: C, remote: R)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_rx, mut client_tx) = tokio::io::split(client);
    let (mut remote_rx, mut remote_tx) = tokio::io::split(remote);

    let mut downstream =
        tokio::spawn(async move { tokio::io::copy(&mut remote_rx, &mut client_tx).await });

    tokio::select! {
        result = tokio::io::copy(&mut client_rx, &mut remote_tx) => {
            if let Err(e) = result {
                log::debug!("socks5: client to remote copy ended: {}", e);
            }
        }
        result = &mut downstream => {
            if let Ok(Err(e)) = result {
                log::debug!("socks5: remote to client copy ended: {}", e);
            }
        }
    }

    downstream.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        let (client, mut client_peer) = duplex(1024);
        let (remote, mut remote_peer) = duplex(1024);

        let task = tokio::spawn(relay(client, remote));

        client_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote_peer.write_all(b"world").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client_peer);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_ends_when_remote_closes() {
        let (client, _client_peer) = duplex(1024);
        let (remote, remote_peer) = duplex(1024);

        let task = tokio::spawn(relay(client, remote));
        drop(remote_peer);
        task.await.unwrap();
    }
}
