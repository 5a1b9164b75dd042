//! Immutable, validated configuration.
//!
//! A [`FlowConfig`] is built once through [`FlowConfigBuilder`] and shared
//! read-only by the server, the sender and their connection tasks. Every
//! setting has a `DEFAULT_*` constant; `build()` rejects combinations that
//! cannot work (TLS over UDP, zero workers, ...).
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use flowwire::config::{FlowConfig, Protocol};
//!
//! let config = FlowConfig::builder()
//!     .host("127.0.0.1")
//!     .port(9000)
//!     .timeout(Duration::from_secs(2))
//!     .delimiter("\\n")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.protocol, Protocol::Tcp);
//! assert_eq!(config.delimiter.as_deref(), Some(&b"\n"[..]));
//! ```

use std::fmt;
use std::time::Duration;

use crate::codec::AttributeFilter;
use crate::error::{FlowError, Result};
use crate::limiter::DEFAULT_MAX_CONNECTIONS;
use crate::protocol::{DEFAULT_MAX_HEADER_LENGTH, DEFAULT_MAX_PAYLOAD_LENGTH};
use crate::send::parse_delimiter;
use crate::transport::{Destination, TlsContext};
use crate::writer::DEFAULT_CHUNK_SIZE;

/// Default destination host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default socket send/receive buffer size (1 MiB).
pub const DEFAULT_MAX_SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// Default time after which an idle pooled connection is closed.
pub const DEFAULT_IDLE_EXPIRATION: Duration = Duration::from_secs(5);

/// Default connect, handshake and per-message write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of event-loop worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Default time granted to tasks to finish at shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between host readiness checks.
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on waiting for host readiness.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on received content held in memory (1 GiB, the largest payload).
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = DEFAULT_MAX_PAYLOAD_LENGTH as usize;

/// Default number of finished sessions queued for the host.
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 64;

/// Default worker thread name prefix.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "flowwire";

/// Transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// Stream transport; messages may span many reads.
    #[default]
    Tcp,
    /// Datagram transport; one message per datagram.
    Udp,
}

impl Protocol {
    /// Lower-case scheme name, used for attribute prefixes and transit URIs.
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// What an outbound message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageShape {
    /// Payload only; the header length is always zero.
    ContentOnly,
    /// Selected attributes as a JSON header, then the payload.
    #[default]
    ContentAndAttributes,
}

/// Validated settings for a server or sender.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Destination host (sender) or bind address (server).
    pub host: String,
    /// Destination or listening port; 0 lets a server pick one.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Socket send/receive buffer size.
    pub max_socket_buffer_size: usize,
    /// Idle time after which pooled connections are pruned.
    pub idle_expiration: Duration,
    /// Connect, handshake and per-message write timeout.
    pub timeout: Duration,
    /// Bound on waiting for a pooled connection.
    pub acquire_timeout: Duration,
    /// Close the connection after each artifact instead of pooling it.
    pub connection_per_send: bool,
    /// Add sender/receiver address attributes to received artifacts.
    pub endpoint_tagging: bool,
    /// Close inbound connections silent for this long (`None` = never).
    pub read_idle_timeout: Option<Duration>,
    /// Event-loop worker threads.
    pub worker_threads: usize,
    /// Maximum concurrently open connections.
    pub max_connections: usize,
    /// Largest accepted header.
    pub max_header_length: u32,
    /// Largest accepted payload.
    pub max_payload_length: u64,
    /// Payload streaming chunk size.
    pub chunk_size: usize,
    /// Received content a server holds in memory across all connections.
    pub max_buffered_bytes: usize,
    /// Finished sessions queued for the host before connections stop reading.
    pub session_queue_capacity: usize,
    /// Time granted to tasks to finish at shutdown.
    pub drain_timeout: Duration,
    /// Interval between host readiness checks.
    pub ready_poll_interval: Duration,
    /// Bound on waiting for host readiness.
    pub ready_timeout: Duration,
    /// Outbound message shape.
    pub message_shape: MessageShape,
    /// Outbound attribute selection.
    pub attribute_filter: AttributeFilter,
    /// Outbound content delimiter; `None` sends each artifact as one message.
    pub delimiter: Option<Vec<u8>>,
    /// TLS settings; `None` for plain transport.
    pub tls: Option<TlsContext>,
    /// Worker thread name prefix.
    pub thread_name_prefix: String,
}

impl FlowConfig {
    /// Create a new config builder.
    pub fn builder() -> FlowConfigBuilder {
        FlowConfigBuilder::new()
    }

    /// The configured host, port and protocol.
    pub fn destination(&self) -> Destination {
        Destination::new(self.host.clone(), self.port, self.protocol)
    }

    /// `host:port` string, used for binding and logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: 0,
            protocol: Protocol::default(),
            max_socket_buffer_size: DEFAULT_MAX_SOCKET_BUFFER_SIZE,
            idle_expiration: DEFAULT_IDLE_EXPIRATION,
            timeout: DEFAULT_TIMEOUT,
            acquire_timeout: DEFAULT_TIMEOUT,
            connection_per_send: true,
            endpoint_tagging: false,
            read_idle_timeout: None,
            worker_threads: DEFAULT_WORKER_THREADS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_header_length: DEFAULT_MAX_HEADER_LENGTH,
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            session_queue_capacity: DEFAULT_SESSION_QUEUE_CAPACITY,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            ready_poll_interval: DEFAULT_READY_POLL_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            message_shape: MessageShape::default(),
            attribute_filter: AttributeFilter::default(),
            delimiter: None,
            tls: None,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

/// Builder for [`FlowConfig`].
pub struct FlowConfigBuilder {
    config: FlowConfig,
    acquire_timeout: Option<Duration>,
}

impl FlowConfigBuilder {
    /// Create a builder with every setting at its default.
    pub fn new() -> Self {
        Self {
            config: FlowConfig::default(),
            acquire_timeout: None,
        }
    }

    /// Set the destination host (sender) or bind address (server).
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the transport protocol.
    ///
    /// Default: TCP
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Set the socket buffer size.
    ///
    /// Default: 1 MiB
    pub fn max_socket_buffer_size(mut self, size: usize) -> Self {
        self.config.max_socket_buffer_size = size;
        self
    }

    /// Set the idle expiration for pooled connections.
    ///
    /// Default: 5 seconds
    pub fn idle_expiration(mut self, idle: Duration) -> Self {
        self.config.idle_expiration = idle;
        self
    }

    /// Set the connect, handshake and write timeout.
    ///
    /// Default: 10 seconds
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the bound on waiting for a pooled connection.
    ///
    /// Default: same as `timeout`
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Open a fresh connection per artifact instead of pooling.
    ///
    /// Default: true
    pub fn connection_per_send(mut self, enabled: bool) -> Self {
        self.config.connection_per_send = enabled;
        self
    }

    /// Add `<proto>.sender`, `<proto>.receiver` and `<proto>.receiver_port` attributes.
    ///
    /// Default: false
    pub fn endpoint_tagging(mut self, enabled: bool) -> Self {
        self.config.endpoint_tagging = enabled;
        self
    }

    /// Close inbound connections that stay silent for `idle`.
    pub fn read_idle_timeout(mut self, idle: Duration) -> Self {
        self.config.read_idle_timeout = (!idle.is_zero()).then_some(idle);
        self
    }

    /// Set the number of event-loop worker threads.
    ///
    /// Default: 2
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    /// Set the maximum number of open connections.
    ///
    /// Default: 16
    pub fn max_connections(mut self, limit: usize) -> Self {
        self.config.max_connections = limit;
        self
    }

    /// Set the largest accepted header.
    ///
    /// Default: 1 MiB
    pub fn max_header_length(mut self, limit: u32) -> Self {
        self.config.max_header_length = limit;
        self
    }

    /// Set the largest accepted payload.
    ///
    /// Default: 1 GiB
    pub fn max_payload_length(mut self, limit: u64) -> Self {
        self.config.max_payload_length = limit;
        self
    }

    /// Set the payload streaming chunk size.
    ///
    /// Default: 64 KiB
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set how much received content a server may hold in memory.
    ///
    /// Sessions larger than this are aborted; below it, connections stop
    /// reading until the host has stored earlier sessions.
    ///
    /// Default: 1 GiB
    pub fn max_buffered_bytes(mut self, limit: usize) -> Self {
        self.config.max_buffered_bytes = limit;
        self
    }

    /// Set how many finished sessions may wait for the host.
    ///
    /// Default: 64
    pub fn session_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.session_queue_capacity = capacity;
        self
    }

    /// Set the shutdown drain timeout.
    ///
    /// Default: 5 seconds
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Set how often and how long to wait for the host to become ready.
    ///
    /// Default: every 100 ms for up to 10 seconds
    pub fn ready_wait(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.ready_poll_interval = interval;
        self.config.ready_timeout = timeout;
        self
    }

    /// Set the outbound message shape.
    pub fn message_shape(mut self, shape: MessageShape) -> Self {
        self.config.message_shape = shape;
        self
    }

    /// Set the outbound attribute selection.
    pub fn attribute_filter(mut self, filter: AttributeFilter) -> Self {
        self.config.attribute_filter = filter;
        self
    }

    /// Split outbound content on a delimiter; `\n`, `\r` and `\t` escapes are expanded.
    pub fn delimiter(mut self, delimiter: &str) -> Self {
        let bytes = parse_delimiter(delimiter);
        self.config.delimiter = (!bytes.is_empty()).then_some(bytes);
        self
    }

    /// Split outbound content on raw delimiter bytes.
    pub fn delimiter_bytes(mut self, delimiter: impl Into<Vec<u8>>) -> Self {
        let bytes = delimiter.into();
        self.config.delimiter = (!bytes.is_empty()).then_some(bytes);
        self
    }

    /// Enable TLS.
    pub fn tls(mut self, tls: TlsContext) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<FlowConfig> {
        let mut config = self.config;
        config.acquire_timeout = self.acquire_timeout.unwrap_or(config.timeout);

        if config.host.trim().is_empty() {
            return Err(FlowError::Config("host must not be empty".to_string()));
        }
        if config.worker_threads == 0 {
            return Err(FlowError::Config("worker_threads must be at least 1".to_string()));
        }
        if config.max_connections == 0 {
            return Err(FlowError::Config("max_connections must be at least 1".to_string()));
        }
        if config.chunk_size == 0 {
            return Err(FlowError::Config("chunk_size must be at least 1".to_string()));
        }
        if config.max_buffered_bytes == 0 {
            return Err(FlowError::Config("max_buffered_bytes must be at least 1".to_string()));
        }
        if config.session_queue_capacity == 0 {
            return Err(FlowError::Config("session_queue_capacity must be at least 1".to_string()));
        }
        if config.timeout.is_zero() {
            return Err(FlowError::Config("timeout must be positive".to_string()));
        }
        if config.protocol == Protocol::Udp && config.tls.is_some() {
            return Err(FlowError::Config("TLS is not supported over UDP".to_string()));
        }

        Ok(config)
    }
}

impl Default for FlowConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
