//! A secure session with one remote peer over a multiplexed connection.
//!
//! Each inbound stream carries exactly one framed envelope. The session reads
//! it, verifies it against the bound peer identity and the key scheme it
//! names, and hands the decoded message to the network's plugins. Protocol
//! violations close the whole session; faults confined to one stream (bad
//! length, short read) only drop that stream.

use crate::address::format_remote;
use crate::error::WireError;
use crate::message::{now_nanos, read_frame, write_frame, Envelope, Message, Payload};
use crate::network::Network;
use crate::plugin::PluginContext;
use crate::transport::{MuxConnection, MuxStream};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use subtle::ConstantTimeEq;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Which side opened the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// We dialed.
    Initiator,
    /// The remote dialed us.
    Acceptor,
}

/// Outcome of checking one inbound envelope.
enum Inbound {
    Deliver(PluginContext),
    Stale { skew_nanos: i128 },
}

/// A live session with one peer.
pub struct PeerSession {
    network: Weak<Network>,
    conn: Arc<dyn MuxConnection>,
    role: SessionRole,
    scheme: String,
    transport_addr: String,
    peer_id: OnceLock<Vec<u8>>,
    closed: AtomicBool,
}

impl PeerSession {
    pub(crate) fn new(
        network: &Arc<Network>,
        conn: Arc<dyn MuxConnection>,
        role: SessionRole,
        scheme: &str,
        peer_id: Option<Vec<u8>>,
    ) -> Arc<Self> {
        let bound = OnceLock::new();
        if let Some(id) = peer_id {
            let _ = bound.set(id);
        }
        Arc::new(Self {
            network: Arc::downgrade(network),
            transport_addr: conn.remote_addr(),
            conn,
            role,
            scheme: scheme.to_string(),
            peer_id: bound,
            closed: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// The peer's public key, once known.
    pub fn peer_id(&self) -> Option<&[u8]> {
        self.peer_id.get().map(Vec::as_slice)
    }

    /// Remote transport address; also the key in the network's session table.
    pub fn transport_addr(&self) -> &str {
        &self.transport_addr
    }

    /// `scheme://<hex peer id>@<transport address>`.
    pub fn remote_address(&self) -> String {
        format_remote(&self.scheme, self.peer_id(), &self.transport_addr)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn network(&self) -> Result<Arc<Network>, WireError> {
        self.network.upgrade().ok_or(WireError::SessionClosed)
    }

    /// Sign and send a typed message to the peer on a fresh stream.
    pub async fn send<T: Message>(&self, message: &T) -> Result<(), WireError> {
        let payload = Payload::encode(message)?;
        self.send_payload(payload).await
    }

    /// Sign and send an already-encoded payload.
    pub async fn send_payload(&self, payload: Payload) -> Result<(), WireError> {
        if self.is_closed() {
            return Err(WireError::SessionClosed);
        }
        let network = self.network()?;
        let to = self
            .peer_id()
            .ok_or_else(|| WireError::UnknownPeer(self.remote_address()))?;

        let keypair = network.keypair();
        let scheme = network
            .key_schemes()
            .get(keypair.scheme_id())
            .ok_or_else(|| WireError::UnknownKeyScheme(keypair.scheme_id().to_string()))?;

        let mut envelope = Envelope::new(keypair.public_key(), to, payload, keypair.scheme_id());
        envelope.sign(keypair, scheme.as_ref())?;
        self.send_envelope(&envelope).await
    }

    /// Frame and write an envelope as-is, one stream per envelope.
    ///
    /// The size ceiling is checked before any stream is opened, and the
    /// write deadline covers opening the stream through the final flush.
    pub(crate) async fn send_envelope(&self, envelope: &Envelope) -> Result<(), WireError> {
        if self.is_closed() {
            return Err(WireError::SessionClosed);
        }
        let network = self.network()?;
        let max = network.config().max_message_size;
        let deadline = network.config().write_timeout();

        let data = envelope.encode()?;
        if data.len() > max {
            return Err(WireError::MessageTooLarge {
                size: data.len(),
                max,
            });
        }

        let write = async {
            let mut stream = self.conn.open_stream().await?;
            write_frame(&mut stream, &data, max).await?;
            stream.shutdown().await?;
            Ok::<u32, WireError>(stream.id())
        };

        match tokio::time::timeout(deadline, write).await {
            Ok(Ok(stream_id)) => {
                debug!(
                    peer = %self.remote_address(),
                    stream = stream_id,
                    type_tag = %envelope.payload.type_tag,
                    bytes = data.len(),
                    "Sent message"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WireError::WriteTimeout(deadline)),
        }
    }

    /// Close the session. Idempotent.
    ///
    /// Closes the connection, which ends the accept loop, and removes this
    /// session from the network's table if it is still the registered one.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(peer = %self.remote_address(), role = ?self.role, "Session closed");
        self.conn.close();
        if let Some(network) = self.network.upgrade() {
            network.close_session(self);
        }
    }

    /// Start the accept loop. Called once, after the session is registered.
    pub(crate) fn start(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.run().await });
    }

    async fn run(self: Arc<Self>) {
        // Connect and disconnect go to the same plugin snapshot.
        let plugins = match self.network.upgrade() {
            Some(network) => network.plugins(),
            None => Vec::new(),
        };

        info!(peer = %self.remote_address(), role = ?self.role, "Session started");
        for plugin in &plugins {
            plugin.on_peer_connect(&self).await;
        }

        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.conn.accept_stream() => match accepted {
                    Ok(stream) => {
                        let session = Arc::clone(&self);
                        in_flight.spawn(async move { session.process(stream).await });
                    }
                    Err(e) => {
                        debug!(peer = %self.remote_address(), error = %e, "Stream accept ended");
                        break;
                    }
                },
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        // The remote hung up: messages it sent before leaving still count.
        if !self.is_closed() {
            while in_flight.join_next().await.is_some() {}
        }
        in_flight.detach_all();

        self.close();
        for plugin in &plugins {
            plugin.on_peer_disconnect(&self).await;
        }
    }

    async fn process(self: Arc<Self>, mut stream: Box<dyn MuxStream>) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let stream_id = stream.id();

        let data = match read_frame(&mut stream, network.config().max_message_size).await {
            Ok(data) => data,
            Err(e) => {
                debug!(
                    peer = %self.remote_address(),
                    stream = stream_id,
                    error = %e,
                    "Dropping stream"
                );
                return;
            }
        };
        drop(stream);

        match self.check(&network, &data) {
            Ok(Inbound::Deliver(_)) if self.is_closed() => {
                debug!(
                    peer = %self.remote_address(),
                    stream = stream_id,
                    "Session closed, dropping message"
                );
            }
            Ok(Inbound::Deliver(ctx)) => {
                debug!(
                    peer = %self.remote_address(),
                    stream = stream_id,
                    type_tag = %ctx.type_tag(),
                    "Received message"
                );
                network.dispatch(&ctx).await;
            }
            Ok(Inbound::Stale { skew_nanos }) => {
                debug!(
                    peer = %self.remote_address(),
                    skew_ms = (skew_nanos / 1_000_000) as i64,
                    "Discarding stale message"
                );
            }
            Err(e) => {
                warn!(peer = %self.remote_address(), error = %e, "Protocol violation, closing session");
                self.close();
            }
        }
    }

    /// Verify one frame body. Errors are session-fatal.
    fn check(self: &Arc<Self>, network: &Network, data: &[u8]) -> Result<Inbound, WireError> {
        let envelope = Envelope::decode(data)?;

        if !bool::from(envelope.to.as_slice().ct_eq(network.public_key())) {
            return Err(WireError::RecipientMismatch);
        }

        let bound = match self.role {
            SessionRole::Acceptor => self.peer_id.get_or_init(|| envelope.from.clone()),
            SessionRole::Initiator => self
                .peer_id
                .get()
                .ok_or_else(|| WireError::UnknownPeer(self.remote_address()))?,
        };
        if !bool::from(bound.as_slice().ct_eq(&envelope.from)) {
            return Err(WireError::IdentityMismatch {
                claimed: hex::encode(&envelope.from),
                bound: hex::encode(bound),
            });
        }

        let now = now_nanos();
        if !envelope.is_fresh_at(now) {
            let skew_nanos = (now as i128 - envelope.timestamp as i128).abs();
            return Ok(Inbound::Stale { skew_nanos });
        }

        let scheme = network
            .key_schemes()
            .get(&envelope.scheme_id)
            .ok_or_else(|| WireError::UnknownKeyScheme(envelope.scheme_id.clone()))?;
        if !envelope.verify(scheme.as_ref()) {
            return Err(WireError::BadSignature);
        }

        let message = network.messages().decode(&envelope.payload)?;
        Ok(Inbound::Deliver(PluginContext::new(
            Arc::clone(self),
            message,
            envelope.from,
            envelope.timestamp,
        )))
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote", &self.remote_address())
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}
