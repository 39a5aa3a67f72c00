//! Broker core
//!
//! Accepts peers, admits them through the CONN handshake, and reclaims
//! connections whose session has ended. Admission runs serially inside the
//! accept loop so the connection limit is exact. The collector runs on the
//! task that called [`Broker::serve`].

mod connection;
mod registry;
mod router;

pub use connection::{accept_handshake, reject, Connection};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, QueueOutcome};
pub use router::{MessageRouter, RouterError};

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::session::RetryPolicy;

/// Default listening port
pub const DEFAULT_PORT: u16 = 42069;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Listen backlog
    pub backlog: u32,
    /// Maximum live connections
    pub max_connections: usize,
    /// Frames buffered per connection before deliveries are dropped
    pub outbound_channel_capacity: usize,
    /// Budget for receiving CONN from a new peer
    pub connect_policy: RetryPolicy,
    /// Budget for receiving DISC_ACK after sending DISC
    pub disconnect_policy: RetryPolicy,
    /// Collector sweep interval
    pub collector_interval: Duration,
    /// Remove empty topic nodes after reclaiming connections
    pub prune_empty_topics: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            backlog: 10,
            max_connections: 128,
            outbound_channel_capacity: 1024,
            connect_policy: RetryPolicy::default(),
            disconnect_policy: RetryPolicy::default(),
            collector_interval: Duration::from_millis(100),
            prune_empty_topics: false,
        }
    }
}

/// The broker
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    /// Raised by connection tasks entering cleanup
    reclaim: Arc<Notify>,
    shutdown: watch::Sender<bool>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let router = Arc::new(MessageRouter::new(registry.clone()));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            router,
            reclaim: Arc::new(Notify::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bind the configured address with `SO_REUSEADDR` and the configured
    /// backlog
    pub fn bind(&self) -> io::Result<TcpListener> {
        let addr = self.config.bind_addr;
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.backlog as i32)?;
        socket.set_nonblocking(true)?;

        TcpListener::from_std(socket.into())
    }

    /// Bind and serve until [`Broker::shutdown`] is called
    pub async fn run(&self) -> io::Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    ///
    /// On shutdown the accept loop is joined first, then every live
    /// connection is disconnected and reclaimed, then the topic tree is
    /// released.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        info!("Listening on {}", listener.local_addr()?);

        let acceptor = Acceptor {
            config: self.config.clone(),
            registry: self.registry.clone(),
            router: self.router.clone(),
            reclaim: self.reclaim.clone(),
        };
        let accept = tokio::spawn(acceptor.run(listener, self.shutdown.subscribe()));

        self.collect_until_shutdown().await;

        if let Err(e) = accept.await {
            error!("Accept loop failed: {}", e);
        }
        self.disconnect_all().await;
        self.collect().await;
        self.router.clear();
        info!("Broker stopped");
        Ok(())
    }

    /// Signal every loop to stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Get topic node count
    pub fn topic_count(&self) -> usize {
        self.router.topic_count()
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    async fn collect_until_shutdown(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.collector_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.reclaim.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            self.collect().await;
        }
    }

    /// Reclaim every connection marked for cleanup
    ///
    /// Each connection is removed from the registry exactly once, purged
    /// from the topic tree, and its task joined.
    async fn collect(&self) -> usize {
        let mut reclaimed = 0;
        for id in self.registry.cleanup_ready() {
            let Some(handle) = self.registry.remove(id) else {
                continue;
            };
            let purged = self.router.purge(id);

            if let Some(mut task) = handle.take_task() {
                let budget = self.config.disconnect_policy.budget();
                if timeout(budget, &mut task).await.is_err() {
                    warn!("Connection {} task did not stop, aborting", id);
                    task.abort();
                    let _ = task.await;
                }
            }

            reclaimed += 1;
            info!(
                "Connection {} ({}) closed, {} subscriptions dropped, {} live",
                id,
                handle.addr(),
                purged,
                self.registry.len()
            );
        }

        if reclaimed > 0 && self.config.prune_empty_topics {
            let pruned = self.router.prune_empty();
            if pruned > 0 {
                debug!("Pruned {} empty topics", pruned);
            }
        }
        reclaimed
    }

    async fn disconnect_all(&self) {
        let policy = self.config.disconnect_policy;
        let mut pending = JoinSet::new();
        for handle in self.registry.handles() {
            if handle.session().is_cleanup() {
                continue;
            }
            pending.spawn(async move { handle.disconnect(policy).await });
        }
        if !pending.is_empty() {
            info!("Disconnecting {} connections", pending.len());
        }
        while pending.join_next().await.is_some() {}
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

/// State moved into the accept task
struct Acceptor {
    config: BrokerConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    reclaim: Arc<Notify>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        debug!("Starting TCP accept loop");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        self.admit(stream, addr, shutdown.clone()).await;
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
            }
        }
        debug!("Accept loop stopped");
    }

    /// Capacity check, handshake, then registration
    async fn admit(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let linger = self.config.connect_policy.interval;

        if self.registry.is_full() {
            warn!(
                "Connection limit {} reached, rejecting {}",
                self.registry.max_connections(),
                addr
            );
            tokio::spawn(reject(stream, linger));
            return;
        }

        if let Err(e) = accept_handshake(&mut stream, self.config.connect_policy).await {
            info!("Handshake with {} failed: {}", addr, e);
            tokio::spawn(reject(stream, linger));
            return;
        }

        let id = self.registry.next_id();
        let (handle, outbound) =
            ConnectionHandle::new(id, addr, self.config.outbound_channel_capacity);
        handle.session().mark_connected();
        self.registry.insert(handle.clone());

        let conn = Connection::new(
            stream,
            handle.clone(),
            outbound,
            self.router.clone(),
            self.reclaim.clone(),
            shutdown,
        );
        handle.spawn_task(conn.run());

        info!(
            "Connection {} from {} admitted, {} live",
            id,
            addr,
            self.registry.len()
        );
    }
}
