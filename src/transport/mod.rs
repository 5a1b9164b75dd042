//! Transport module - sockets, TLS and connection pooling.
//!
//! Provides:
//! - [`FlowStream`]: plain or TLS byte stream
//! - [`TlsContext`]: client/server TLS negotiation (rustls)
//! - [`ConnectionPool`]: reusable outbound connections with idle pruning

mod pool;
mod stream;
mod tls;

pub use pool::{ConnectionPool, Destination, Link, PooledConnection, PruneResult};
pub use stream::FlowStream;
pub use tls::{ClientAuth, TlsContext};
