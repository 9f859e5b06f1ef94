//! Proxy engine
//!
//! Wires a [`Config`] and a [`Tunnel`] into a resolver, the dial pipeline and
//! the HTTP and SOCKS5 servers, and runs them until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::{Config, ResolverMode};
use crate::dial::{build_pipeline, TunnelDialer};
use crate::dns::{CachingResolver, Resolver, TunnelResolver, CLEANUP_INTERVAL};
use crate::error::{Error, Result};
use crate::http::HttpProxy;
use crate::net::{Dialer, SystemDialer};
use crate::socks5::{Socks5Server, UdpDialer};
use crate::tunnel::Tunnel;

/// Addresses the servers ended up bound to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundAddrs {
    pub http: Option<SocketAddr>,
    pub socks5: Option<SocketAddr>,
}

/// Runs both proxy servers over one tunnel
pub struct ProxyEngine {
    config: Config,
    tunnel: Arc<dyn Tunnel>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    bound_tx: Option<tokio::sync::oneshot::Sender<BoundAddrs>>,
}

impl ProxyEngine {
    /// Create an engine; the configuration is validated here
    pub fn new(config: Config, tunnel: Arc<dyn Tunnel>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tunnel,
            shutdown_tx: None,
            bound_tx: None,
        })
    }

    /// Create a shutdown handle before starting the engine
    ///
    /// The handle stays usable after the engine has been moved into a task.
    pub fn create_shutdown_handle(&mut self) -> broadcast::Sender<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        shutdown_tx
    }

    /// Get the shutdown handle, if one exists
    pub fn shutdown_handle(&self) -> Option<broadcast::Sender<()>> {
        self.shutdown_tx.clone()
    }

    /// Receive the bound server addresses once both listeners are up
    pub fn bound_addrs(&mut self) -> tokio::sync::oneshot::Receiver<BoundAddrs> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.bound_tx = Some(tx);
        rx
    }

    /// Start the servers and run until shutdown
    ///
    /// Returns an error when the resolver or a listener cannot be set up, or
    /// when a server stops on its own.
    pub async fn start(&mut self) -> Result<()> {
        let shutdown_tx = match self.shutdown_tx.clone() {
            Some(tx) => tx,
            None => self.create_shutdown_handle(),
        };
        let mut shutdown_rx = shutdown_tx.subscribe();

        let bypass = Arc::new(self.config.bypass_list());
        if !bypass.is_empty() {
            log::info!("Bypassing the tunnel for {}", bypass);
        }

        let (resolver, caching) = self.build_resolver().await?;
        let pipeline_resolver = caching.clone().map(|r| r as Arc<dyn Resolver>);
        let dialer = build_pipeline(self.tunnel.clone(), SystemDialer, bypass.clone(), pipeline_resolver);

        let mut servers = JoinSet::new();
        let mut bound = BoundAddrs::default();

        if let Some(addr) = self.config.http.listen_addr()? {
            let server = HttpProxy::bind(
                addr,
                self.config.http.credentials(),
                dialer.clone(),
                shutdown_tx.subscribe(),
            )
            .await?;
            bound.http = Some(server.local_addr()?);
            servers.spawn(server.run());
        }

        if let Some(addr) = self.config.socks5.listen_addr()? {
            let udp_dialer = UdpDialer::new(resolver.clone(), bypass.clone(), self.tunnel.clone());
            let server = Socks5Server::bind(
                addr,
                self.config.socks5.credentials()?,
                dialer.clone(),
                udp_dialer,
                shutdown_tx.subscribe(),
            )
            .await?;
            bound.socks5 = Some(server.local_addr()?);
            servers.spawn(server.run());
        }

        if let Some(tx) = self.bound_tx.take() {
            let _ = tx.send(bound);
        }

        let janitor = caching.map(|resolver| tokio::spawn(run_janitor(resolver, shutdown_tx.subscribe())));

        let result = tokio::select! {
            _ = shutdown_rx.recv() => {
                log::info!("Proxy shutdown requested");
                Ok(())
            }
            Some(finished) = servers.join_next() => {
                let err = match finished {
                    Ok(Ok(())) => Error::Config("proxy server stopped unexpectedly".into()),
                    Ok(Err(e)) => e,
                    Err(e) => Error::Config(format!("proxy server task failed: {}", e)),
                };
                log::error!("Proxy server ended: {}", err);
                let _ = shutdown_tx.send(());
                Err(err)
            }
        };

        while servers.join_next().await.is_some() {}
        if let Some(janitor) = janitor {
            janitor.abort();
        }

        result
    }

    /// The resolver handed to the UDP relay, and the caching resolver when
    /// one is configured
    async fn build_resolver(&self) -> Result<(Arc<dyn Resolver>, Option<Arc<CachingResolver>>)> {
        let resolver = &self.config.resolver;

        match resolver.mode {
            ResolverMode::Tunnel => {
                log::info!("resolver: using the tunnel's native resolution");
                let native: Arc<dyn Resolver> = Arc::new(TunnelResolver::new(self.tunnel.clone()));
                Ok((native, None))
            }
            ResolverMode::Dns => {
                let transport: Arc<dyn Dialer> = if resolver.local {
                    log::info!("resolver: sending DNS queries over the host network");
                    Arc::new(SystemDialer)
                } else {
                    Arc::new(TunnelDialer::new(self.tunnel.clone()))
                };

                let caching = Arc::new(
                    CachingResolver::new(
                        self.tunnel.clone(),
                        transport,
                        resolver.server,
                        resolver.cache_size,
                    )
                    .await?,
                );
                let shared: Arc<dyn Resolver> = caching.clone();
                Ok((shared, Some(caching)))
            }
        }
    }
}

/// Periodically drop expired cache entries
async fn run_janitor(resolver: Arc<CachingResolver>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = interval(CLEANUP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let removed = resolver.cleanup_expired().await;
                if removed > 0 {
                    log::debug!("resolver: dropped {} expired cache entries", removed);
                }
            }
        }
    }
}
