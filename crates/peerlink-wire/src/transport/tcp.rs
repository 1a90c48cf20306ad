//! `tcp://` transport: one TCP connection per peer, multiplexed with [`MuxSession`].

use crate::error::WireError;
use crate::transport::mux::{Mode, MuxSession};
use crate::transport::{MuxConnection, MuxListener, Transport};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// TCP transport registered under the `tcp` scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    pub const SCHEME: &'static str = "tcp";
}

#[async_trait]
impl Transport for TcpTransport {
    fn scheme(&self) -> &str {
        Self::SCHEME
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn MuxListener>, WireError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpMuxListener { listener }))
    }

    async fn dial(&self, addr: &str) -> Result<Arc<dyn MuxConnection>, WireError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        debug!(peer = %remote, "tcp: dialed");
        Ok(MuxSession::new(stream, Mode::Client, remote.to_string()))
    }
}

struct TcpMuxListener {
    listener: TcpListener,
}

#[async_trait]
impl MuxListener for TcpMuxListener {
    async fn accept(&self) -> Result<Arc<dyn MuxConnection>, WireError> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(peer = %remote, "tcp: accepted");
        Ok(MuxSession::new(stream, Mode::Server, remote.to_string()))
    }

    fn local_addr(&self) -> Result<SocketAddr, WireError> {
        Ok(self.listener.local_addr()?)
    }
}
