//! Per-connection session assembly.
//!
//! A [`SessionAssembler`] turns the frames of one connection into complete
//! artifacts. It lives inside the connection task and never touches the
//! host: finished sessions leave through an MPSC queue as [`SessionEvent`]s
//! and are materialized later on the host thread.
//!
//! # State machine
//!
//! ```text
//!            open / first frame
//! NoSession ───────────────────► Active ──┐ frame: append payload,
//!     ▲                            │  ▲   │ remember header
//!     │                            │  └───┘
//!     │   is_last / close          ▼
//!     └──────────── Committing (attrs ok) | Aborting (attrs invalid)
//! ```
//!
//! Sequential sessions reuse the connection; only one is active at a time.
//!
//! Buffered content is charged to a [`ReceiveBudget`] shared by all
//! connections. When the budget or the session queue is full, feeding a
//! frame waits, so the connection stops being read and the peer is slowed
//! down by TCP flow control. A session larger than the whole budget is
//! dropped frame by frame and reported as aborted.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, OwnedSemaphorePermit};

use crate::codec::{AttributeCodec, AttributeMap};
use crate::config::Protocol;
use crate::error::{FlowError, Result};
use crate::limiter::ReceiveBudget;
use crate::protocol::Frame;

/// Attribute suffix holding the sender's IP address.
pub const SENDER_ATTRIBUTE: &str = "sender";

/// Attribute suffix holding the receiver's IP address.
pub const RECEIVER_ATTRIBUTE: &str = "receiver";

/// Attribute suffix holding the receiver's port.
pub const RECEIVER_PORT_ATTRIBUTE: &str = "receiver_port";

/// Addresses of both ends of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    /// Transport the connection uses.
    pub protocol: Protocol,
    /// Sender address.
    pub remote: SocketAddr,
    /// Receiver address.
    pub local: SocketAddr,
}

impl Endpoints {
    /// Transit URI naming the sender, e.g. `tcp://10.0.0.7:53122`.
    pub fn transit_uri(&self) -> String {
        format!("{}://{}", self.protocol.scheme(), self.remote)
    }

    /// Add `<proto>.sender`, `<proto>.receiver` and `<proto>.receiver_port`.
    pub fn tag(&self, attributes: &mut AttributeMap) {
        let scheme = self.protocol.scheme();
        attributes.insert(
            format!("{}.{}", scheme, SENDER_ATTRIBUTE),
            self.remote.ip().to_string(),
        );
        attributes.insert(
            format!("{}.{}", scheme, RECEIVER_ATTRIBUTE),
            self.local.ip().to_string(),
        );
        attributes.insert(
            format!("{}.{}", scheme, RECEIVER_PORT_ATTRIBUTE),
            self.local.port().to_string(),
        );
    }
}

/// A finished receive session, handed to the host thread.
#[derive(Debug)]
pub enum SessionEvent {
    /// Content and attributes ready to become an artifact.
    Completed {
        content: Bytes,
        attributes: AttributeMap,
        transit_uri: String,
        /// Receive budget held by `content`, released once the host stored it.
        reservation: Option<OwnedSemaphorePermit>,
    },
    /// Header could not be decoded or the content did not fit the receive
    /// budget; content was discarded.
    Aborted { reason: String, transit_uri: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NoSession,
    Active,
    /// Session outgrew the receive budget; remaining frames are dropped.
    Discarding,
}

/// Accumulates frames into sessions for one connection.
pub struct SessionAssembler {
    endpoints: Endpoints,
    endpoint_tagging: bool,
    state: State,
    sink: BytesMut,
    reservation: Option<OwnedSemaphorePermit>,
    pending_header: Option<Bytes>,
    frames_received: usize,
    budget: ReceiveBudget,
    events: mpsc::Sender<SessionEvent>,
}

impl SessionAssembler {
    /// Create an assembler buffering content against `budget` and
    /// publishing finished sessions to `events`.
    pub fn new(
        endpoints: Endpoints,
        endpoint_tagging: bool,
        budget: ReceiveBudget,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            endpoints,
            endpoint_tagging,
            state: State::NoSession,
            sink: BytesMut::new(),
            reservation: None,
            pending_header: None,
            frames_received: 0,
            budget,
            events,
        }
    }

    /// Open a session with a fresh sink. No-op if one is in progress.
    pub fn open(&mut self) {
        if self.state != State::NoSession {
            return;
        }
        self.sink = BytesMut::new();
        self.reservation = None;
        self.pending_header = None;
        self.frames_received = 0;
        self.state = State::Active;
    }

    /// Check if a session is in progress.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state != State::NoSession
    }

    /// Feed one frame.
    ///
    /// Waits while the receive budget is exhausted or the session queue is
    /// full, which stops reading from the connection.
    ///
    /// # Errors
    ///
    /// `Shutdown` if the host side stopped listening for sessions.
    pub async fn on_frame(&mut self, frame: Frame) -> Result<()> {
        self.open();
        self.frames_received += 1;

        if let Some(header) = frame.header {
            self.pending_header = Some(header);
        }
        if !frame.payload.is_empty() && self.state == State::Active {
            self.buffer(&frame.payload).await?;
        }

        if frame.is_last {
            return self.finish().await;
        }
        Ok(())
    }

    /// Handle connection close.
    ///
    /// A session that received at least one frame is finished with whatever
    /// content arrived; a session that was opened but never fed is dropped.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == State::NoSession {
            return Ok(());
        }
        if self.frames_received == 0 {
            self.state = State::NoSession;
            return Ok(());
        }

        tracing::debug!(
            "Connection from {} closed mid-session, flushing {} bytes",
            self.endpoints.remote,
            self.sink.len()
        );
        self.finish().await
    }

    /// Drop the session in progress without publishing it.
    pub fn discard(&mut self) {
        if self.state != State::NoSession && self.frames_received > 0 {
            tracing::debug!(
                "Dropping unfinished session from {} ({} bytes)",
                self.endpoints.remote,
                self.sink.len()
            );
        }
        self.sink = BytesMut::new();
        self.reservation = None;
        self.pending_header = None;
        self.frames_received = 0;
        self.state = State::NoSession;
    }

    async fn buffer(&mut self, payload: &[u8]) -> Result<()> {
        if self.sink.len() + payload.len() > self.budget.max_bytes() {
            tracing::warn!(
                "Session from {} exceeds the {} byte receive buffer, discarding it",
                self.endpoints.remote,
                self.budget.max_bytes()
            );
            self.sink = BytesMut::new();
            self.reservation = None;
            self.state = State::Discarding;
            return Ok(());
        }

        let permit = self.budget.reserve(payload.len()).await?;
        match &mut self.reservation {
            Some(held) => held.merge(permit),
            None => self.reservation = Some(permit),
        }
        self.sink.extend_from_slice(payload);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let content = self.sink.split().freeze();
        let reservation = self.reservation.take();
        let header = self.pending_header.take();
        let discarded = self.state == State::Discarding;
        self.frames_received = 0;
        self.state = State::NoSession;

        let transit_uri = self.endpoints.transit_uri();
        let decoded = if discarded {
            Err(FlowError::Framing(format!(
                "session exceeds the {} byte receive buffer",
                self.budget.max_bytes()
            )))
        } else {
            match header {
                Some(header) => AttributeCodec::decode(&header),
                None => Ok(AttributeMap::new()),
            }
        };

        let event = match decoded {
            Ok(mut attributes) => {
                if self.endpoint_tagging {
                    self.endpoints.tag(&mut attributes);
                }
                tracing::debug!(
                    "Session from {} complete: {} bytes, {} attributes",
                    self.endpoints.remote,
                    content.len(),
                    attributes.len()
                );
                SessionEvent::Completed {
                    content,
                    attributes,
                    transit_uri,
                    reservation,
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Discarding session from {}: {}",
                    self.endpoints.remote,
                    e
                );
                SessionEvent::Aborted {
                    reason: e.to_string(),
                    transit_uri,
                }
            }
        };

        self.events.send(event).await.map_err(|_| FlowError::Shutdown)
    }
}
