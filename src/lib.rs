//! # flowwire
//!
//! Transport engine that moves pipeline artifacts between hosts over TCP,
//! TLS or UDP, keeping each artifact's attributes with its content.
//!
//! ## Architecture
//!
//! - **Wire format**: `[u32 BE header_length][u64 BE payload_length][header][payload]`,
//!   the header being the artifact's attributes as a flat JSON object
//! - **Receive side** ([`FlowServer`]): decodes frames per connection and
//!   assembles each logical message into a new artifact
//! - **Send side** ([`FlowSender`]): splits an artifact into messages, sends
//!   them over pooled connections and routes the artifact (or its byte-range
//!   children) to success or failure
//! - **Host** ([`FlowHost`]): the pipeline that owns artifacts; only ever
//!   called from the thread that polls the server or sender
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flowwire::{FlowConfig, FlowSender, MemoryHost, OutboundArtifact};
//!
//! let host = Arc::new(MemoryHost::new());
//! let config = FlowConfig::builder()
//!     .host("collector.internal")
//!     .port(9000)
//!     .delimiter("\\n")
//!     .build()?;
//!
//! let mut sender = FlowSender::new(config, host.clone())?;
//! let id = host.insert(b"one\ntwo\n".to_vec(), Default::default());
//! sender.send(OutboundArtifact::new(id, &b"one\ntwo\n"[..], Default::default()))?;
//!
//! for notification in sender.recv_completed(std::time::Duration::from_secs(5)) {
//!     println!("{:?}", notification.outcome);
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod limiter;
pub mod protocol;
pub mod receive;
pub mod runtime;
pub mod send;
pub mod transport;
pub mod writer;

pub use codec::{AttributeCodec, AttributeFilter, AttributeMap};
pub use config::{FlowConfig, FlowConfigBuilder, MessageShape, Protocol};
pub use error::{FlowError, Result};
pub use host::{ArtifactId, FlowHost, MemoryHost, Outcome, ProvenanceEvent};
pub use receive::{FlowServer, SessionNotification};
pub use send::{BatchId, BatchNotification, BatchOutcome, FlowSender, OutboundArtifact};
pub use transport::{ClientAuth, TlsContext};
