//! TLS negotiation on top of TCP using `tokio-rustls`.
//!
//! A [`TlsContext`] wraps rustls configurations. Outbound connections
//! negotiate as TLS client, accepted connections as TLS server.
//!
//! The server side is built either from a certificate, key and client roots
//! ([`TlsContext::server_with_client_roots`], where the [`ClientAuth`]
//! policy picks the client verifier) or from a ready-made `ServerConfig`
//! whose own verifier decides what is requested ([`TlsContext::server`]).
//!
//! # Example
//!
//! ```ignore
//! use flowwire::transport::{ClientAuth, TlsContext};
//!
//! let tls = TlsContext::server_with_client_roots(chain, key, roots, ClientAuth::Want)?;
//! let config = FlowConfig::builder().tls(tls).build()?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::error::{FlowError, Result};

/// Client certificate policy for accepted TLS connections.
///
/// With [`TlsContext::server_with_client_roots`] the policy selects the
/// client verifier. With [`TlsContext::server`] the supplied `ServerConfig`
/// decides whether certificates are requested and checked; the policy then
/// only matters for `Required`, which rejects peers that presented none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    /// Client certificates are not requested.
    None,
    /// Client certificates are requested and verified when presented;
    /// anonymous peers are accepted.
    Want,
    /// Connections without a valid client certificate are rejected.
    #[default]
    Required,
}

impl ClientAuth {
    /// Parse the policy name (`NONE`, `WANT`, `REQUIRED`, case-insensitive).
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(ClientAuth::None),
            "WANT" => Ok(ClientAuth::Want),
            "REQUIRED" => Ok(ClientAuth::Required),
            other => Err(FlowError::Config(format!("unknown client auth policy: {}", other))),
        }
    }
}

/// TLS settings for outbound and/or inbound connections.
#[derive(Clone)]
pub struct TlsContext {
    client: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    server: Option<Arc<ServerConfig>>,
    client_auth: ClientAuth,
}

impl TlsContext {
    /// Context for outbound connections, verifying the peer as `server_name`.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| FlowError::Tls(format!("invalid server name {}: {}", server_name, e)))?;
        Ok(Self {
            client: Some((config, name)),
            server: None,
            client_auth: ClientAuth::default(),
        })
    }

    /// Context for accepted connections from a ready-made `ServerConfig`.
    ///
    /// The config's client verifier is used as is; see [`ClientAuth`].
    pub fn server(config: Arc<ServerConfig>, client_auth: ClientAuth) -> Self {
        Self {
            client: None,
            server: Some(config),
            client_auth,
        }
    }

    /// Context for accepted connections presenting `cert_chain`, with the
    /// client verifier chosen by `client_auth` and anchored at `client_roots`.
    pub fn server_with_client_roots(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        client_roots: RootCertStore,
        client_auth: ClientAuth,
    ) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| FlowError::Tls(format!("unsupported protocol versions: {}", e)))?;

        let builder = match client_auth {
            ClientAuth::None => builder.with_no_client_auth(),
            ClientAuth::Want | ClientAuth::Required => {
                let mut verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), provider);
                if client_auth == ClientAuth::Want {
                    verifier = verifier.allow_unauthenticated();
                }
                let verifier = verifier
                    .build()
                    .map_err(|e| FlowError::Tls(format!("invalid client roots: {}", e)))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let config = builder
            .with_single_cert(cert_chain, key)
            .map_err(|e| FlowError::Tls(format!("invalid server certificate: {}", e)))?;
        Ok(Self::server(Arc::new(config), client_auth))
    }

    /// Check if inbound connections can be negotiated.
    #[inline]
    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    /// Negotiate TLS as client over an established TCP stream.
    pub async fn connect(
        &self,
        stream: TcpStream,
        timeout: Duration,
    ) -> Result<client::TlsStream<TcpStream>> {
        let (config, name) = self
            .client
            .as_ref()
            .ok_or_else(|| FlowError::Tls("no client configuration".to_string()))?;

        let connector = TlsConnector::from(config.clone());
        tokio::time::timeout(timeout, connector.connect(name.clone(), stream))
            .await
            .map_err(|_| FlowError::Tls(format!("handshake timed out after {:?}", timeout)))?
            .map_err(|e| FlowError::Tls(format!("client handshake failed: {}", e)))
    }

    /// Negotiate TLS as server over an accepted TCP stream.
    ///
    /// With [`ClientAuth::Required`] the connection is rejected unless the
    /// peer presented a certificate.
    pub async fn accept(
        &self,
        stream: TcpStream,
        timeout: Duration,
    ) -> Result<server::TlsStream<TcpStream>> {
        let config = self
            .server
            .as_ref()
            .ok_or_else(|| FlowError::Tls("no server configuration".to_string()))?;

        let acceptor = TlsAcceptor::from(config.clone());
        let tls = tokio::time::timeout(timeout, acceptor.accept(stream))
            .await
            .map_err(|_| FlowError::Tls(format!("handshake timed out after {:?}", timeout)))?
            .map_err(|e| FlowError::Tls(format!("server handshake failed: {}", e)))?;

        if self.client_auth == ClientAuth::Required {
            let presented = tls
                .get_ref()
                .1
                .peer_certificates()
                .is_some_and(|certs| !certs.is_empty());
            if !presented {
                return Err(FlowError::Tls("client certificate required".to_string()));
            }
        }

        Ok(tls)
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("client", &self.client.as_ref().map(|(_, name)| format!("{:?}", name)))
            .field("server", &self.server.is_some())
            .field("client_auth", &self.client_auth)
            .finish()
    }
}
