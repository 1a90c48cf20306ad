//! Transport boundary: scheme-keyed dial/listen yielding multiplexed connections.
//!
//! The session layer only sees [`MuxConnection`]s that can accept and open
//! logical [`MuxStream`]s. Which byte transport sits underneath is chosen by
//! the address scheme through a [`TransportRegistry`].

pub mod mux;
pub mod tcp;

use crate::error::WireError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};

pub use mux::{Mode, MuxSession, MuxedStream};
pub use tcp::TcpTransport;

/// One logical sub-channel of a multiplexed connection.
pub trait MuxStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Stream id, unique within its connection.
    fn id(&self) -> u32;
}

/// A multiplexed connection to one remote endpoint.
#[async_trait]
pub trait MuxConnection: Send + Sync + 'static {
    /// Wait for the remote side to open a stream.
    ///
    /// Fails once the connection is closed locally or by the remote.
    async fn accept_stream(&self) -> Result<Box<dyn MuxStream>, WireError>;

    /// Open a new outbound stream.
    async fn open_stream(&self) -> Result<Box<dyn MuxStream>, WireError>;

    /// Remote transport address, e.g. `127.0.0.1:4100`.
    fn remote_addr(&self) -> String;

    /// Close the connection; pending accepts and reads are released with errors.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A bound listener producing multiplexed connections.
#[async_trait]
pub trait MuxListener: Send + Sync + 'static {
    async fn accept(&self) -> Result<Arc<dyn MuxConnection>, WireError>;

    fn local_addr(&self) -> Result<SocketAddr, WireError>;
}

/// A byte transport identified by an address scheme.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn scheme(&self) -> &str;

    /// Bind a listener on `host:port`.
    async fn listen(&self, addr: &str) -> Result<Box<dyn MuxListener>, WireError>;

    /// Connect to `host:port`.
    async fn dial(&self, addr: &str) -> Result<Arc<dyn MuxConnection>, WireError>;
}

/// Thread-safe map from address scheme to transport.
#[derive(Clone)]
pub struct TransportRegistry {
    transports: Arc<RwLock<HashMap<String, Arc<dyn Transport>>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            transports: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A registry with [`TcpTransport`] under `tcp`.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(TcpTransport));
        registry
    }

    pub fn register(&self, transport: Arc<dyn Transport>) {
        let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
        transports.insert(transport.scheme().to_string(), transport);
    }

    /// Look up the transport for `scheme`.
    pub fn get(&self, scheme: &str) -> Result<Arc<dyn Transport>, WireError> {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        transports
            .get(scheme)
            .cloned()
            .ok_or_else(|| WireError::UnsupportedScheme(scheme.to_string()))
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        let mut schemes: Vec<&String> = transports.keys().collect();
        schemes.sort();
        f.debug_struct("TransportRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}
