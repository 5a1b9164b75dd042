//! Pooled outbound connections.
//!
//! The pool keeps idle connections per [`Destination`] and hands them out
//! for reuse. Every open connection holds a slot of the pool's
//! [`ConnectionLimiter`]; when the cap is reached, `acquire` first evicts an
//! idle connection to some other destination and otherwise waits, bounded by
//! the acquire timeout, for a slot or an idle connection to come back.
//!
//! ```text
//! acquire ─► idle[dest]? ─yes─► probe open ─► PooledConnection
//!              │ no
//!              ▼
//!           slot free? ─yes─► connect (+TLS) ─► PooledConnection
//!              │ no
//!              ▼
//!           evict idle[other] / wait ─► PoolExhausted
//! ```
//!
//! Idle connections are closed by [`ConnectionPool::prune`], which a
//! background task runs periodically.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpSocket, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{FlowStream, TlsContext};
use crate::config::{FlowConfig, Protocol};
use crate::error::{FlowError, Result};
use crate::limiter::{poll_until, ConnectionLimiter, LimiterGuard, CHECK_INTERVAL};

/// Remote endpoint a connection is opened to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Host name or IP address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl Destination {
    /// Create a new destination.
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }

    /// Transit URI recorded in provenance, e.g. `tcp://localhost:9000`.
    pub fn transit_uri(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                FlowError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address found for {}", self),
                ))
            })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Transport underneath a pooled connection.
pub enum Link {
    /// TCP or TLS byte stream.
    Stream(FlowStream),
    /// Connected UDP socket; one message per datagram.
    Datagram(UdpSocket),
}

/// An open connection checked out of (or destined for) the pool.
pub struct PooledConnection {
    destination: Destination,
    link: Link,
    last_used_at: Instant,
    _slot: LimiterGuard,
}

impl PooledConnection {
    /// Get the destination this connection is open to.
    #[inline]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Get the transport for writing.
    #[inline]
    pub fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }

    /// Time the connection was last returned to the pool.
    #[inline]
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    fn is_open(&self) -> bool {
        match &self.link {
            Link::Stream(stream) => stream.is_open(),
            Link::Datagram(_) => true,
        }
    }

    async fn close(mut self) {
        if let Link::Stream(stream) = &mut self.link {
            let _ = stream.shutdown().await;
        }
    }
}

/// Outcome of one pruning pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PruneResult {
    /// Connections closed.
    pub closed: usize,
    /// Idle connections examined.
    pub considered: usize,
}

struct PoolInner {
    idle: Mutex<HashMap<Destination, VecDeque<PooledConnection>>>,
    limiter: ConnectionLimiter,
    tls: Option<TlsContext>,
    timeout: Duration,
    acquire_timeout: Duration,
    send_buffer_size: u32,
    connection_per_send: bool,
    closed: AtomicBool,
}

/// Shared pool of outbound connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool from the connection settings of `config`.
    pub fn new(config: &FlowConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(HashMap::new()),
                limiter: ConnectionLimiter::new(config.max_connections),
                tls: config.tls.clone(),
                timeout: config.timeout,
                acquire_timeout: config.acquire_timeout,
                send_buffer_size: config.max_socket_buffer_size.min(u32::MAX as usize) as u32,
                connection_per_send: config.connection_per_send,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of open connections (checked out plus idle).
    pub fn open_connections(&self) -> usize {
        self.inner.limiter.in_use()
    }

    /// Number of idle connections.
    pub fn idle_connections(&self) -> usize {
        self.idle().values().map(VecDeque::len).sum()
    }

    /// Check out a connection to `destination`.
    ///
    /// # Errors
    ///
    /// `PoolExhausted` if no connection became available within the acquire
    /// timeout; `Io`/`Tls` if opening a new connection failed.
    pub async fn acquire(&self, destination: &Destination) -> Result<PooledConnection> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(FlowError::Shutdown);
        }

        let slot = poll_until(self.inner.acquire_timeout, CHECK_INTERVAL, || {
            let slot = self.reuse_or_reserve(destination);
            async move { slot }
        })
        .await;

        match slot {
            Some(Slot::Reused(connection)) => {
                tracing::debug!("Reusing connection to {}", destination);
                Ok(connection)
            }
            Some(Slot::Fresh(guard)) => self.open(destination, guard).await,
            None => Err(FlowError::PoolExhausted {
                destination: destination.to_string(),
                waited: self.inner.acquire_timeout,
            }),
        }
    }

    /// Return a connection after use.
    ///
    /// With connection-per-send, or after the pool was closed, the
    /// connection is closed instead of pooled.
    pub async fn release(&self, mut connection: PooledConnection) {
        if self.inner.connection_per_send || self.inner.closed.load(Ordering::Acquire) {
            connection.close().await;
            return;
        }

        connection.last_used_at = Instant::now();
        self.idle()
            .entry(connection.destination.clone())
            .or_default()
            .push_back(connection);
    }

    /// Close a connection that must not be reused (e.g. after a failed write).
    pub async fn discard(&self, connection: PooledConnection) {
        tracing::debug!("Discarding connection to {}", connection.destination);
        connection.close().await;
    }

    /// Close idle connections unused for at least `idle_threshold`.
    ///
    /// Connections found closed by the peer are removed as well.
    pub fn prune(&self, idle_threshold: Duration) -> PruneResult {
        let mut result = PruneResult::default();
        let mut idle = self.idle();

        for queue in idle.values_mut() {
            result.considered += queue.len();
            let before = queue.len();
            queue.retain(|c| c.last_used_at.elapsed() < idle_threshold && c.is_open());
            result.closed += before - queue.len();
        }
        idle.retain(|_, queue| !queue.is_empty());

        if result.closed > 0 {
            tracing::debug!(
                "Pruned {} of {} idle connections",
                result.closed,
                result.considered
            );
        }
        result
    }

    /// Run [`prune`](Self::prune) every `interval` until `shutdown` fires.
    pub fn spawn_pruner(
        &self,
        interval: Duration,
        idle_threshold: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.prune(idle_threshold);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Close every idle connection and refuse further acquisitions.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: usize = self.idle().drain().map(|(_, q)| q.len()).sum();
        tracing::debug!("Connection pool closed, {} idle connections dropped", drained);
    }

    fn idle(&self) -> MutexGuard<'_, HashMap<Destination, VecDeque<PooledConnection>>> {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reuse_or_reserve(&self, destination: &Destination) -> Option<Slot> {
        let mut idle = self.idle();

        if let Some(queue) = idle.get_mut(destination) {
            while let Some(connection) = queue.pop_back() {
                if connection.is_open() {
                    return Some(Slot::Reused(connection));
                }
                tracing::debug!("Dropping stale connection to {}", destination);
            }
        }

        if let Some(guard) = self.inner.limiter.try_reserve() {
            return Some(Slot::Fresh(guard));
        }

        // Evict the least recently used idle connection to another destination.
        let victim = idle
            .iter()
            .filter(|(dest, queue)| *dest != destination && !queue.is_empty())
            .min_by_key(|(_, queue)| queue.front().map(|c| c.last_used_at))
            .map(|(dest, _)| dest.clone())?;
        if let Some(evicted) = idle.get_mut(&victim).and_then(VecDeque::pop_front) {
            tracing::debug!("Evicting idle connection to {}", victim);
            drop(evicted);
        }
        drop(idle);

        self.inner.limiter.try_reserve().map(Slot::Fresh)
    }

    async fn open(&self, destination: &Destination, slot: LimiterGuard) -> Result<PooledConnection> {
        let link = match destination.protocol {
            Protocol::Tcp => Link::Stream(self.open_stream(destination).await?),
            Protocol::Udp => Link::Datagram(self.open_datagram(destination).await?),
        };
        tracing::debug!("Opened connection to {}", destination);

        Ok(PooledConnection {
            destination: destination.clone(),
            link,
            last_used_at: Instant::now(),
            _slot: slot,
        })
    }

    async fn open_stream(&self, destination: &Destination) -> Result<FlowStream> {
        let timeout = self.inner.timeout;
        let addr = tokio::time::timeout(timeout, destination.resolve())
            .await
            .map_err(|_| timed_out("resolve", destination, timeout))??;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(self.inner.send_buffer_size)?;

        let stream = tokio::time::timeout(timeout, socket.connect(addr))
            .await
            .map_err(|_| timed_out("connect", destination, timeout))??;
        stream.set_nodelay(true)?;

        match &self.inner.tls {
            Some(tls) => {
                let tls_stream = tls.connect(stream, timeout).await?;
                Ok(FlowStream::ClientTls(Box::new(tls_stream)))
            }
            None => Ok(FlowStream::Tcp(stream)),
        }
    }

    async fn open_datagram(&self, destination: &Destination) -> Result<UdpSocket> {
        let addr = destination.resolve().await?;
        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }
}

enum Slot {
    Reused(PooledConnection),
    Fresh(LimiterGuard),
}

fn timed_out(what: &str, destination: &Destination, timeout: Duration) -> FlowError {
    FlowError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} to {} timed out after {:?}", what, destination, timeout),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, Destination) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Destination::new("127.0.0.1", port, Protocol::Tcp))
    }

    fn pool(max_connections: usize, connection_per_send: bool) -> ConnectionPool {
        let config = FlowConfig::builder()
            .max_connections(max_connections)
            .connection_per_send(connection_per_send)
            .acquire_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        ConnectionPool::new(&config)
    }

    /// Accept connections forever, keeping them open.
    fn accept_all(listener: TcpListener) {
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
    }

    #[test]
    fn test_destination_display_and_uri() {
        let dest = Destination::new("localhost", 9000, Protocol::Tcp);
        assert_eq!(dest.to_string(), "localhost:9000");
        assert_eq!(dest.transit_uri(), "tcp://localhost:9000");
    }

    #[tokio::test]
    async fn test_release_reuses_connection() {
        let (listener, dest) = listener().await;
        accept_all(listener);
        let pool = pool(4, false);

        let first = pool.acquire(&dest).await.unwrap();
        pool.release(first).await;
        assert_eq!(pool.idle_connections(), 1);

        let _second = pool.acquire(&dest).await.unwrap();
        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_connection_per_send_closes_on_release() {
        let (listener, dest) = listener().await;
        accept_all(listener);
        let pool = pool(4, true);

        let conn = pool.acquire(&dest).await.unwrap();
        pool.release(conn).await;

        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(pool.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_pool_exhausted() {
        let (listener, dest) = listener().await;
        accept_all(listener);
        let pool = pool(1, false);

        let _held = pool.acquire(&dest).await.unwrap();
        let err = pool.acquire(&dest).await.err().unwrap();

        assert!(matches!(err, FlowError::PoolExhausted { .. }));
        assert!(err.to_string().contains(&dest.to_string()));
    }

    #[tokio::test]
    async fn test_evicts_idle_connection_of_other_destination() {
        let (l1, d1) = listener().await;
        let (l2, d2) = listener().await;
        accept_all(l1);
        accept_all(l2);
        let pool = pool(1, false);

        let conn = pool.acquire(&d1).await.unwrap();
        pool.release(conn).await;

        let other = pool.acquire(&d2).await.unwrap();
        assert_eq!(other.destination(), &d2);
        assert_eq!(pool.open_connections(), 1);
        assert_eq!(pool.idle_connections(), 0);
    }

    #[tokio::test]
    async fn test_prune_idle() {
        let (listener, dest) = listener().await;
        accept_all(listener);
        let pool = pool(4, false);

        let a = pool.acquire(&dest).await.unwrap();
        let b = pool.acquire(&dest).await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        assert_eq!(
            pool.prune(Duration::from_secs(60)),
            PruneResult { closed: 0, considered: 2 }
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = pool.prune(Duration::from_millis(10));
        assert_eq!(result, PruneResult { closed: 2, considered: 2 });
        assert_eq!(pool.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, dest) = listener().await;
        drop(listener);
        let pool = pool(1, false);

        let result = pool.acquire(&dest).await;
        assert!(matches!(result, Err(FlowError::Io(_))));
        assert_eq!(pool.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses() {
        let pool = pool(1, false);
        pool.close();
        pool.close();
        let dest = Destination::new("127.0.0.1", 1, Protocol::Tcp);
        assert!(matches!(pool.acquire(&dest).await, Err(FlowError::Shutdown)));
    }

    #[tokio::test]
    async fn test_pruner_task_stops_on_shutdown() {
        let pool = pool(1, false);
        let (tx, rx) = watch::channel(false);
        let handle = pool.spawn_pruner(Duration::from_millis(5), Duration::from_secs(1), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
