//! Listening side of a flow.
//!
//! [`FlowServer`] binds a TCP listener or a UDP socket on its own worker
//! pool and turns every inbound logical message into a host artifact.
//!
//! ```text
//! accept ─► [TLS] ─► FrameReader ─► SessionAssembler ──┐   (worker tasks)
//!                                                      │ SessionEvent
//!                                                      ▼
//!                      poll_sessions() ─► FlowHost::create/write/commit
//!                                                         (host thread)
//! ```
//!
//! Connection tasks never call the host. Finished sessions are queued and
//! only materialized when the owner calls [`FlowServer::poll_sessions`].
//!
//! The queue holds at most `session_queue_capacity` sessions and buffered
//! content is capped by `max_buffered_bytes` across all connections. A
//! connection that hits either limit stops reading until the host catches up.
//!
//! # Example
//!
//! ```ignore
//! let host = Arc::new(MemoryHost::new());
//! let config = FlowConfig::builder().host("127.0.0.1").port(9000).build()?;
//! let mut server = FlowServer::bind(config, host.clone())?;
//!
//! loop {
//!     for notification in server.recv_sessions(Duration::from_secs(1)) {
//!         println!("{:?}", notification);
//!     }
//! }
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::assembler::{Endpoints, SessionAssembler, SessionEvent};
use crate::codec::AttributeMap;
use crate::config::{FlowConfig, Protocol};
use crate::error::{FlowError, Result};
use crate::host::{wait_until_ready, ArtifactId, FlowHost, Outcome, ProvenanceEvent};
use crate::limiter::{ConnectionLimiter, LimiterGuard, ReceiveBudget, CHECK_INTERVAL};
use crate::protocol::{Frame, FrameDecoder, FrameReader};
use crate::runtime::{block_until, build_runtime, shutdown_runtime};
use crate::transport::FlowStream;

/// Largest UDP datagram read in one call.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Pending connections queued by the kernel before `accept`.
const LISTEN_BACKLOG: u32 = 1024;

/// What became of one received session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionNotification {
    /// An artifact was created and committed to success.
    Committed {
        artifact: ArtifactId,
        attributes: AttributeMap,
        size: usize,
        transit_uri: String,
    },
    /// The header could not be decoded; nothing was created.
    Aborted { transit_uri: String, reason: String },
    /// The host rejected the artifact.
    Failed { transit_uri: String, reason: String },
}

impl SessionNotification {
    /// Check if the session became an artifact.
    #[inline]
    pub fn is_committed(&self) -> bool {
        matches!(self, SessionNotification::Committed { .. })
    }
}

/// State shared by the listener and its connection tasks.
#[derive(Clone)]
struct ConnectionContext {
    config: Arc<FlowConfig>,
    limiter: ConnectionLimiter,
    budget: ReceiveBudget,
    events: mpsc::Sender<SessionEvent>,
}

impl ConnectionContext {
    fn decoder(&self) -> FrameDecoder {
        FrameDecoder::with_limits(self.config.max_header_length, self.config.max_payload_length)
    }

    fn assembler(&self, endpoints: Endpoints) -> SessionAssembler {
        SessionAssembler::new(
            endpoints,
            self.config.endpoint_tagging,
            self.budget.clone(),
            self.events.clone(),
        )
    }
}

/// A bound listener plus the worker pool serving it.
///
/// Must be created, polled and dropped outside of any async context: it owns
/// its runtime and blocks on it.
pub struct FlowServer<H: FlowHost> {
    config: Arc<FlowConfig>,
    host: Arc<H>,
    runtime: Option<Runtime>,
    local_addr: SocketAddr,
    events: mpsc::Receiver<SessionEvent>,
    budget: ReceiveBudget,
    backlog: VecDeque<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
    limiter: ConnectionLimiter,
    listener: Option<JoinHandle<()>>,
}

impl<H: FlowHost> FlowServer<H> {
    /// Build the worker pool and bind the configured address.
    ///
    /// # Errors
    ///
    /// `Bind` with the attempted address if the socket cannot be bound.
    /// This is not retried.
    pub fn bind(config: FlowConfig, host: Arc<H>) -> Result<Self> {
        let config = Arc::new(config);
        let runtime = build_runtime(&config)?;
        let limiter = ConnectionLimiter::new(config.max_connections);
        let budget = ReceiveBudget::new(config.max_buffered_bytes);
        let (events_tx, events) = mpsc::channel(config.session_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = ConnectionContext {
            config: config.clone(),
            limiter: limiter.clone(),
            budget: budget.clone(),
            events: events_tx,
        };

        let (local_addr, listener) = runtime.block_on(async move {
            let address = ctx.config.address();
            let bind_error = |source| FlowError::Bind {
                address: address.clone(),
                source,
            };

            match ctx.config.protocol {
                Protocol::Tcp => {
                    let listener = bind_tcp(&ctx.config).await.map_err(bind_error)?;
                    let local = listener.local_addr()?;
                    let task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));
                    Ok::<_, FlowError>((local, task))
                }
                Protocol::Udp => {
                    let socket = bind_udp(&ctx.config).await.map_err(bind_error)?;
                    let local = socket.local_addr()?;
                    let task = tokio::spawn(datagram_loop(socket, ctx, shutdown_rx));
                    Ok((local, task))
                }
            }
        })?;

        tracing::info!("Listening for {} flows on {}", config.protocol, local_addr);

        Ok(Self {
            config,
            host,
            runtime: Some(runtime),
            local_addr,
            events,
            budget,
            backlog: VecDeque::new(),
            shutdown_tx,
            limiter,
            listener: Some(listener),
        })
    }

    /// Address the server is bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open inbound TCP connections.
    #[inline]
    pub fn open_connections(&self) -> usize {
        self.limiter.in_use()
    }

    /// Bytes of received content not yet handed to the host.
    #[inline]
    pub fn buffered_bytes(&self) -> usize {
        self.budget.in_use()
    }

    /// Check if the server is still accepting.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Turn every finished session into a host artifact, without waiting.
    ///
    /// Each completed session waits (bounded) for the host to be ready. If
    /// the host stays unavailable, the session and all later ones are kept
    /// for the next call.
    pub fn poll_sessions(&mut self) -> Vec<SessionNotification> {
        let mut notifications = Vec::new();

        loop {
            let event = match self.backlog.pop_front() {
                Some(event) => event,
                None => match self.events.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            if matches!(event, SessionEvent::Completed { .. })
                && !wait_until_ready(
                    self.host.as_ref(),
                    self.config.ready_poll_interval,
                    self.config.ready_timeout,
                )
            {
                self.backlog.push_front(event);
                tracing::warn!(
                    "Host not ready after {:?}, deferring {} sessions",
                    self.config.ready_timeout,
                    self.backlog.len()
                );
                break;
            }

            notifications.push(self.materialize(event));
        }

        notifications
    }

    /// Like [`poll_sessions`](Self::poll_sessions), but wait up to `timeout`
    /// for at least one session to finish.
    pub fn recv_sessions(&mut self, timeout: Duration) -> Vec<SessionNotification> {
        let notifications = self.poll_sessions();
        if !notifications.is_empty() || !self.backlog.is_empty() {
            return notifications;
        }

        if let Some(runtime) = &self.runtime {
            let events = &mut self.events;
            let next = runtime.block_on(async { tokio::time::timeout(timeout, events.recv()).await });
            if let Ok(Some(event)) = next {
                self.backlog.push_back(event);
            }
        }

        self.poll_sessions()
    }

    /// Stop accepting, give open connections up to the drain timeout, then
    /// stop the worker pool.
    ///
    /// Idempotent. Sessions finished before shutdown can still be collected
    /// with [`poll_sessions`](Self::poll_sessions) afterwards.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        tracing::info!("Shutting down listener on {}", self.local_addr);
        let _ = self.shutdown_tx.send(true);

        if let Some(listener) = self.listener.take() {
            let _ = runtime.block_on(listener);
        }

        let limiter = &self.limiter;
        if !block_until(CHECK_INTERVAL, self.config.drain_timeout, || limiter.in_use() == 0) {
            tracing::warn!(
                "{} connections still open after {:?}, abandoning them",
                limiter.in_use(),
                self.config.drain_timeout
            );
        }

        shutdown_runtime(runtime, self.config.drain_timeout);
        tracing::debug!("Listener on {} stopped", self.local_addr);
    }

    fn materialize(&self, event: SessionEvent) -> SessionNotification {
        match event {
            SessionEvent::Aborted {
                transit_uri,
                reason,
            } => SessionNotification::Aborted {
                transit_uri,
                reason,
            },
            SessionEvent::Completed {
                content,
                attributes,
                transit_uri,
                ..
            } => match self.commit_session(&content, &attributes) {
                Ok(artifact) => {
                    self.host.report(ProvenanceEvent::Receive {
                        artifact,
                        transit_uri: transit_uri.clone(),
                    });
                    SessionNotification::Committed {
                        artifact,
                        attributes,
                        size: content.len(),
                        transit_uri,
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to store session from {}: {}", transit_uri, e);
                    SessionNotification::Failed {
                        transit_uri,
                        reason: e.to_string(),
                    }
                }
            },
        }
    }

    fn commit_session(&self, content: &[u8], attributes: &AttributeMap) -> Result<ArtifactId> {
        let artifact = self.host.create_artifact()?;

        let stored = self
            .host
            .write_bytes(artifact, content)
            .and_then(|_| self.host.commit(artifact, Outcome::Success, attributes));

        match stored {
            Ok(()) => Ok(artifact),
            Err(e) => {
                if let Err(cleanup) = self.host.remove(artifact) {
                    tracing::debug!("Could not remove artifact {}: {}", artifact, cleanup);
                }
                Err(e)
            }
        }
    }
}

impl<H: FlowHost> Drop for FlowServer<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn resolve(config: &FlowConfig) -> std::io::Result<SocketAddr> {
    lookup_host((config.host.as_str(), config.port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address found for {}", config.address()),
            )
        })
}

async fn bind_tcp(config: &FlowConfig) -> std::io::Result<TcpListener> {
    let addr = resolve(config).await?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_recv_buffer_size(config.max_socket_buffer_size.min(u32::MAX as usize) as u32)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn bind_udp(config: &FlowConfig) -> std::io::Result<UdpSocket> {
    let addr = resolve(config).await?;
    UdpSocket::bind(addr).await
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };

        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(CHECK_INTERVAL).await;
                continue;
            }
        };

        let Some(slot) = ctx.limiter.try_reserve() else {
            tracing::warn!(
                "Rejecting connection from {}: {} connections already open",
                remote,
                ctx.limiter.max_connections()
            );
            continue;
        };

        tokio::spawn(serve_connection(
            stream,
            remote,
            ctx.clone(),
            slot,
            shutdown.clone(),
        ));
    }

    tracing::debug!("Accept loop stopped");
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    ctx: ConnectionContext,
    _slot: LimiterGuard,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(e) => {
            tracing::warn!("Dropping connection from {}: {}", remote, e);
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let stream = match &ctx.config.tls {
        Some(tls) if tls.has_server() => match tls.accept(stream, ctx.config.timeout).await {
            Ok(tls_stream) => FlowStream::ServerTls(Box::new(tls_stream)),
            Err(e) => {
                tracing::warn!("Rejecting connection from {}: {}", remote, e);
                return;
            }
        },
        _ => FlowStream::Tcp(stream),
    };
    tracing::debug!("Accepted connection from {} (tls: {})", remote, stream.is_tls());

    let endpoints = Endpoints {
        protocol: Protocol::Tcp,
        remote,
        local,
    };
    let mut assembler = ctx.assembler(endpoints);
    assembler.open();

    let mut reader = FrameReader::with_decoder(stream, ctx.decoder());
    let served = read_sessions(
        &mut reader,
        &mut assembler,
        ctx.config.read_idle_timeout,
        &mut shutdown,
    )
    .await;

    match served {
        Ok(()) => tracing::debug!("Connection from {} closed", remote),
        Err(e) => tracing::error!("Connection from {} failed: {}", remote, e),
    }

    if *shutdown.borrow() {
        assembler.discard();
        return;
    }

    let flushed = tokio::select! {
        flushed = assembler.close() => Some(flushed),
        _ = shutdown.changed() => None,
    };
    match flushed {
        Some(Ok(())) => {}
        Some(Err(e)) => tracing::debug!("Could not flush session from {}: {}", remote, e),
        None => assembler.discard(),
    }
}

async fn read_sessions<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    assembler: &mut SessionAssembler,
    read_idle_timeout: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            next = next_frame_within(reader, read_idle_timeout) => next?,
            _ = shutdown.changed() => return Ok(()),
        };

        let Some(frame) = next else {
            return Ok(());
        };
        tokio::select! {
            fed = assembler.on_frame(frame) => fed?,
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn next_frame_within<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    read_idle_timeout: Option<Duration>,
) -> Result<Option<Frame>> {
    let Some(idle) = read_idle_timeout else {
        return reader.next_frame().await;
    };

    match tokio::time::timeout(idle, reader.next_frame()).await {
        Ok(next) => next,
        Err(_) => {
            tracing::debug!("Closing connection idle for {:?}", idle);
            Ok(None)
        }
    }
}

async fn datagram_loop(
    socket: UdpSocket,
    ctx: ConnectionContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = match socket.local_addr() {
        Ok(local) => local,
        Err(e) => {
            tracing::error!("UDP socket unusable: {}", e);
            return;
        }
    };
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = shutdown.changed() => break,
        };

        let (n, remote) = match received {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("UDP receive failed: {}", e);
                continue;
            }
        };

        let endpoints = Endpoints {
            protocol: Protocol::Udp,
            remote,
            local,
        };
        let assembled = tokio::select! {
            assembled = assemble_datagram(&buf[..n], endpoints, &ctx) => assembled,
            _ = shutdown.changed() => break,
        };
        if let Err(e) = assembled {
            tracing::warn!("Dropping datagram from {}: {}", remote, e);
        }
    }

    tracing::debug!("Datagram loop stopped");
}

/// Decode one datagram on its own; a message must fit in a single datagram.
async fn assemble_datagram(datagram: &[u8], endpoints: Endpoints, ctx: &ConnectionContext) -> Result<()> {
    let mut decoder = ctx.decoder();
    let mut assembler = ctx.assembler(endpoints);

    for frame in decoder.push(datagram)? {
        assembler.on_frame(frame).await?;
    }
    decoder.finish()
}
