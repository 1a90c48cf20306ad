//! Peer addresses of the form `<scheme>://[<hex public key>@]<host>:<port>`.
//!
//! The scheme selects the transport. The public-key segment is optional on
//! input; when present on a dial address it pre-binds the session's peer
//! identity.

use crate::error::WireError;
use std::fmt;
use url::Url;

/// A parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    /// Transport scheme, e.g. `tcp`.
    pub scheme: String,
    /// Peer public key, if the address carried one.
    pub peer_id: Option<Vec<u8>>,
    /// Host name or IP literal (IPv6 literals keep their brackets).
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl PeerAddress {
    /// Parse an address string.
    pub fn parse(address: &str) -> Result<Self, WireError> {
        let invalid = |reason: &str| WireError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        let port = url.port().ok_or_else(|| invalid("missing port"))?;

        let peer_id = match url.username() {
            "" => None,
            user => Some(hex::decode(user).map_err(|_| invalid("public key is not hex"))?),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            peer_id,
            host,
            port,
        })
    }

    /// `host:port`, as handed to the transport.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A copy of this address carrying the given public key.
    pub fn with_peer_id(&self, peer_id: &[u8]) -> Self {
        Self {
            peer_id: Some(peer_id.to_vec()),
            ..self.clone()
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer_id {
            Some(id) => write!(f, "{}://{}@{}", self.scheme, hex::encode(id), self.host_port()),
            None => write!(f, "{}://{}", self.scheme, self.host_port()),
        }
    }
}

/// Format a session's remote address: `scheme://<hex peer id>@<transport address>`.
///
/// The peer id segment is empty while the identity is unknown.
pub fn format_remote(scheme: &str, peer_id: Option<&[u8]>, transport_addr: &str) -> String {
    format!(
        "{}://{}@{}",
        scheme,
        peer_id.map(hex::encode).unwrap_or_default(),
        transport_addr
    )
}
