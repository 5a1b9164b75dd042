//! Sending side of a flow.
//!
//! [`FlowSender`] cuts each artifact into messages, sends them over pooled
//! connections on its own worker pool and reconciles the per-message
//! outcomes into a single routing decision per artifact.
//!
//! ```text
//! send(artifact) ─► split ─► [task] acquire ─► write_message × N ─► release
//!                                               │ per message
//!                                               └──► Batch::record_success/failure
//!                                                               │ complete
//!                                                               ▼
//!                                   poll_completed() ─► Batch::finalize(host)
//! ```
//!
//! Messages of one artifact are sent in order by one task over one
//! connection, released after the last message. A failed message does not
//! stop the rest; it only becomes a failed range, and its connection is
//! discarded so the next message reconnects.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::batch::{Batch, BatchId, BatchNotification, BatchTracker};
use super::splitter::{split_messages, MessageSpan};
use crate::codec::{AttributeCodec, AttributeMap};
use crate::config::{FlowConfig, MessageShape};
use crate::error::{FlowError, Result};
use crate::host::{wait_until_ready, ArtifactId, FlowHost};
use crate::protocol::encode_message;
use crate::runtime::{build_runtime, shutdown_runtime};
use crate::transport::{ConnectionPool, Destination, Link, PooledConnection, PruneResult};
use crate::writer::write_message;

/// Lower bound on the idle pruning period.
const MIN_PRUNE_INTERVAL: Duration = Duration::from_millis(10);

/// An artifact handed to [`FlowSender::send`].
#[derive(Debug, Clone)]
pub struct OutboundArtifact {
    /// Host handle, used when finalizing.
    pub id: ArtifactId,
    /// Content to send.
    pub content: Bytes,
    /// Attributes, filtered into the message header.
    pub attributes: AttributeMap,
}

impl OutboundArtifact {
    /// Create an outbound artifact.
    pub fn new(id: ArtifactId, content: impl Into<Bytes>, attributes: AttributeMap) -> Self {
        Self {
            id,
            content: content.into(),
            attributes,
        }
    }
}

/// What every send task needs.
#[derive(Clone)]
struct SendContext {
    config: Arc<FlowConfig>,
    pool: ConnectionPool,
    destination: Destination,
}

/// Outbound sender plus the worker pool and connection pool behind it.
///
/// Must be created, polled and dropped outside of any async context: it owns
/// its runtime and blocks on it.
pub struct FlowSender<H: FlowHost> {
    ctx: SendContext,
    host: Arc<H>,
    runtime: Option<Runtime>,
    tracker: BatchTracker,
    backlog: VecDeque<Arc<Batch>>,
    shutdown_tx: watch::Sender<bool>,
    pruner: Option<JoinHandle<()>>,
}

impl<H: FlowHost> FlowSender<H> {
    /// Build the worker pool, the connection pool and the idle pruner.
    pub fn new(config: FlowConfig, host: Arc<H>) -> Result<Self> {
        let config = Arc::new(config);
        let runtime = build_runtime(&config)?;
        let pool = ConnectionPool::new(&config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pruner = {
            let _enter = runtime.enter();
            pool.spawn_pruner(
                prune_interval(config.idle_expiration),
                config.idle_expiration,
                shutdown_rx,
            )
        };

        let destination = config.destination();
        tracing::info!("Sending {} flows to {}", config.protocol, destination);

        Ok(Self {
            ctx: SendContext {
                config,
                pool,
                destination,
            },
            host,
            runtime: Some(runtime),
            tracker: BatchTracker::new(),
            backlog: VecDeque::new(),
            shutdown_tx,
            pruner: Some(pruner),
        })
    }

    /// Get the destination messages go to.
    #[inline]
    pub fn destination(&self) -> &Destination {
        &self.ctx.destination
    }

    /// Get the connection pool.
    #[inline]
    pub fn pool(&self) -> &ConnectionPool {
        &self.ctx.pool
    }

    /// Start sending an artifact.
    ///
    /// Returns as soon as the send task is scheduled. The outcome arrives
    /// through [`poll_completed`](Self::poll_completed).
    ///
    /// # Errors
    ///
    /// `Shutdown` after [`shutdown`](Self::shutdown); `Json` if the
    /// attributes cannot be encoded.
    pub fn send(&self, artifact: OutboundArtifact) -> Result<BatchId> {
        let runtime = self.runtime.as_ref().ok_or(FlowError::Shutdown)?;

        let header = self.header_for(&artifact.attributes)?;
        let spans = split_messages(&artifact.content, self.ctx.config.delimiter.as_deref());
        let batch = self
            .tracker
            .begin_batch(artifact.id, self.ctx.destination.transit_uri());
        let id = batch.id();

        tracing::debug!(
            "Artifact {} split into {} messages (batch {})",
            artifact.id,
            spans.len(),
            id
        );
        runtime.spawn(send_batch(self.ctx.clone(), batch, artifact.content, header, spans));
        Ok(id)
    }

    /// Finalize every completed batch, without waiting for new ones.
    ///
    /// Each batch waits (bounded) for the host to be ready; if it stays
    /// unavailable the remaining batches are kept for the next call.
    pub fn poll_completed(&mut self) -> Vec<BatchNotification> {
        let mut notifications = Vec::new();

        loop {
            let batch = match self.backlog.pop_front() {
                Some(batch) => batch,
                None => match self.tracker.try_next_completed() {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let config = &self.ctx.config;
            if !wait_until_ready(self.host.as_ref(), config.ready_poll_interval, config.ready_timeout) {
                self.backlog.push_front(batch);
                tracing::warn!(
                    "Host not ready after {:?}, deferring {} batches",
                    config.ready_timeout,
                    self.backlog.len()
                );
                break;
            }

            match batch.finalize(self.host.as_ref()) {
                Ok(notification) => notifications.push(notification),
                Err(e) => tracing::error!(
                    "Failed to finalize batch {} (artifact {}): {}",
                    batch.id(),
                    batch.artifact(),
                    e
                ),
            }
        }

        notifications
    }

    /// Like [`poll_completed`](Self::poll_completed), but wait up to
    /// `timeout` for at least one batch to complete.
    pub fn recv_completed(&mut self, timeout: Duration) -> Vec<BatchNotification> {
        let notifications = self.poll_completed();
        if !notifications.is_empty() || !self.backlog.is_empty() {
            return notifications;
        }

        if let Some(runtime) = &self.runtime {
            let tracker = &mut self.tracker;
            let next = runtime.block_on(async { tokio::time::timeout(timeout, tracker.next_completed()).await });
            if let Ok(Some(batch)) = next {
                self.backlog.push_back(batch);
            }
        }

        self.poll_completed()
    }

    /// Cancel an in-flight batch and roll its artifact back.
    ///
    /// Returns `false` if the batch is unknown or already complete; a
    /// complete batch is still finalized by `poll_completed`.
    pub fn cancel(&self, batch: BatchId) -> Result<bool> {
        let Some(batch) = self.tracker.get(batch) else {
            return Ok(false);
        };
        if !batch.cancel() {
            return Ok(false);
        }
        tracing::info!("Cancelled batch {} (artifact {})", batch.id(), batch.artifact());
        self.host.rollback(batch.artifact())?;
        Ok(true)
    }

    /// Handles of batches still waiting for message outcomes.
    pub fn active_batches(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self.tracker.active().iter().map(|b| b.id()).collect();
        ids.sort_unstable();
        ids
    }

    /// Close idle connections older than the idle expiration right away.
    pub fn prune_idle(&self) -> PruneResult {
        self.ctx.pool.prune(self.ctx.config.idle_expiration)
    }

    /// Cancel in-flight batches, finalize completed ones, close the pool and
    /// stop the worker pool.
    ///
    /// Idempotent. In-flight artifacts are rolled back, never partially
    /// committed.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        tracing::info!("Shutting down sender to {}", self.ctx.destination);

        for batch in self.tracker.active() {
            if !batch.cancel() {
                continue;
            }
            tracing::warn!(
                "Abandoning in-flight send of artifact {} to {}",
                batch.artifact(),
                self.ctx.destination
            );
            if let Err(e) = self.host.rollback(batch.artifact()) {
                tracing::error!("Failed to roll back artifact {}: {}", batch.artifact(), e);
            }
        }

        let _ = self.shutdown_tx.send(true);
        if let Some(pruner) = self.pruner.take() {
            let _ = runtime.block_on(pruner);
        }

        let finalized = self.poll_completed();
        if !finalized.is_empty() {
            tracing::debug!("Finalized {} batches during shutdown", finalized.len());
        }

        self.ctx.pool.close();
        shutdown_runtime(runtime, self.ctx.config.drain_timeout);
        tracing::debug!("Sender to {} stopped", self.ctx.destination);
    }

    fn header_for(&self, attributes: &AttributeMap) -> Result<Bytes> {
        match self.ctx.config.message_shape {
            MessageShape::ContentOnly => Ok(Bytes::new()),
            MessageShape::ContentAndAttributes => {
                let selected = self.ctx.config.attribute_filter.apply(attributes);
                Ok(Bytes::from(AttributeCodec::encode(&selected)?))
            }
        }
    }
}

impl<H: FlowHost> Drop for FlowSender<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn prune_interval(idle_expiration: Duration) -> Duration {
    (idle_expiration / 2).max(MIN_PRUNE_INTERVAL)
}

async fn send_batch(
    ctx: SendContext,
    batch: Arc<Batch>,
    content: Bytes,
    header: Bytes,
    spans: Vec<MessageSpan>,
) {
    batch.set_message_count(spans.len());
    let mut connection = None;

    for span in spans {
        if batch.is_cancelled() {
            tracing::debug!("Batch {} cancelled, stopping", batch.id());
            break;
        }

        let payload = content.slice(span.payload.start as usize..span.payload.end as usize);
        match send_message(&ctx, &mut connection, header.clone(), payload).await {
            Ok(()) => batch.record_success(span.range),
            Err(e) => {
                tracing::warn!(
                    timed_out = e.is_timeout(),
                    "Message {} of artifact {} to {} failed: {}",
                    span.range,
                    batch.artifact(),
                    ctx.destination,
                    e
                );
                batch.record_failure(span.range, e.to_string());
            }
        }
    }

    if let Some(connection) = connection {
        ctx.pool.release(connection).await;
    }
}

/// Send one message on the batch's connection, acquiring one if there is
/// none. A connection that failed a write is discarded.
async fn send_message(
    ctx: &SendContext,
    connection: &mut Option<PooledConnection>,
    header: Bytes,
    payload: Bytes,
) -> Result<()> {
    let mut current = match connection.take() {
        Some(current) => current,
        None => ctx.pool.acquire(&ctx.destination).await?,
    };

    match write_to(ctx, current.link_mut(), header, payload).await {
        Ok(()) => {
            *connection = Some(current);
            Ok(())
        }
        Err(e) => {
            ctx.pool.discard(current).await;
            Err(e)
        }
    }
}

async fn write_to(ctx: &SendContext, link: &mut Link, header: Bytes, payload: Bytes) -> Result<()> {
    match link {
        Link::Stream(stream) => {
            let timeout = ctx.config.timeout;
            let mut source = &payload[..];
            let write = write_message(
                stream,
                header,
                payload.len() as u64,
                &mut source,
                ctx.config.chunk_size,
            );
            match tokio::time::timeout(timeout, write).await {
                Ok(written) => written.map(|_| ()),
                Err(_) => Err(FlowError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("write to {} timed out after {:?}", ctx.destination, timeout),
                ))),
            }
        }
        Link::Datagram(socket) => {
            let datagram = encode_message(&header, &payload);
            socket.send(&datagram).await.map(|_| ()).map_err(FlowError::from)
        }
    }
}
